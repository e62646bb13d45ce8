use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use refdb::backend::kv::{ExpireFlags, ExpirePolicy, KvBackend};
use refdb::config::EnvConfig;
use refdb::reflog::{Committer, Identity};
use refdb::transaction::PreviousValue;
use refdb::{ObjectId, Store, Target};

/// A [`Committer`] with a fixed identity and a clock that advances by one
/// second (and one nanosecond) on every call, so reflog entries written in
/// the same test sort in call order without depending on wall time.
struct FixedCommitter {
    identity: Identity,
    secs: AtomicI64,
    ns: AtomicU64,
}

impl FixedCommitter {
    fn new() -> Self {
        FixedCommitter {
            identity: Identity::new("Test User", "test@example.com"),
            secs: AtomicI64::new(1_700_000_000),
            ns: AtomicU64::new(1_700_000_000_000_000_000),
        }
    }
}

impl Committer for FixedCommitter {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn now(&self) -> (i64, i32) {
        (self.secs.fetch_add(1, Ordering::SeqCst), 0)
    }

    fn now_nanos(&self) -> u64 {
        self.ns.fetch_add(1, Ordering::SeqCst)
    }
}

fn id(b: u8) -> ObjectId {
    ObjectId::from_bytes([b; 20])
}

fn store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    refdb::dispatch::init_db(dir.path()).unwrap();
    let config = EnvConfig {
        map_size: 10 << 20,
        ..EnvConfig::default()
    };
    let backend = KvBackend::open(dir.path(), config).unwrap();
    let mut s = Store::new(dir.path().join("worktree"), FixedCommitter::new());
    s.register_backend("primary", backend);
    s.set_backend("primary").unwrap();
    (dir, s)
}

#[test]
fn scenario_1_create_then_resolve() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/x", id(0x11), PreviousValue::MustNotExist, "create x").unwrap();
    let resolved = s.resolve_ref("refs/heads/x".into()).unwrap();
    assert_eq!(resolved.name, "refs/heads/x");
    assert_eq!(resolved.id, id(0x11));
    assert_eq!(resolved.hop_count, 0);
}

#[test]
fn scenario_2_hierarchy_conflict_names_both_refs() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/x", id(0x11), PreviousValue::MustNotExist, "create x").unwrap();
    let err = s
        .update_ref("refs/heads/x/y", id(0x22), PreviousValue::MustNotExist, "create x/y")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("refs/heads/x/y"), "message was: {message}");
    assert!(message.contains("refs/heads/x"), "message was: {message}");
}

#[test]
fn scenario_3_cas_mismatch_leaves_store_unchanged() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/x", id(0x11), PreviousValue::MustNotExist, "create x").unwrap();
    let err = s
        .update_ref(
            "refs/heads/x",
            id(0x33),
            PreviousValue::MustExistAndMatch(id(0x22)),
            "bad cas",
        )
        .unwrap_err();
    assert!(err.to_string().contains("compare-and-swap"));
    assert_eq!(s.read_ref("refs/heads/x".into()).unwrap(), Some(Target::Direct(id(0x11))));
}

#[test]
fn scenario_4_symref_deref_updates_target_not_symref() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/main", id(0x11), PreviousValue::MustNotExist, "create main")
        .unwrap();
    s.create_symref("HEAD".into(), "refs/heads/main".into(), Some("checkout main".into()))
        .unwrap();

    s.update_ref("HEAD", id(0xaa), PreviousValue::Any, "commit via HEAD").unwrap();

    assert_eq!(
        s.read_ref("refs/heads/main".into()).unwrap(),
        Some(Target::Direct(id(0xaa))),
        "updating through a symref must move the underlying ref"
    );
    assert_eq!(
        s.read_ref("HEAD".into()).unwrap(),
        Some(Target::Symbolic("refs/heads/main".into())),
        "HEAD itself must remain symbolic after a deref'd update"
    );
}

#[test]
fn scenario_5_reflog_forward_and_reverse_iteration() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/main", id(1), PreviousValue::MustNotExist, "t1").unwrap();
    s.update_ref("refs/heads/main", id(2), PreviousValue::Any, "t2").unwrap();
    s.update_ref("refs/heads/main", id(3), PreviousValue::Any, "t3").unwrap();

    let mut forward = Vec::new();
    s.for_each_reflog_ent("refs/heads/main".into(), |e| {
        forward.push(e.new);
        Ok(())
    })
    .unwrap();
    assert_eq!(forward, vec![id(1), id(2), id(3)]);

    let mut reverse = Vec::new();
    s.for_each_reflog_ent_reverse("refs/heads/main".into(), |e| {
        reverse.push(e.new);
        Ok(true)
    })
    .unwrap();
    assert_eq!(reverse, vec![id(3), id(2), id(1)]);
}

struct PruneMiddlePolicy {
    index: usize,
}

impl ExpirePolicy for PruneMiddlePolicy {
    fn prepare(&mut self, _refname: &bstr::BStr, _current: ObjectId) {}

    fn should_prune(&mut self, _old: ObjectId, _new: ObjectId, _email: &bstr::BStr, _timestamp_secs: i64, _tz_offset_minutes: i32, _message: &bstr::BStr) -> bool {
        let this = self.index;
        self.index += 1;
        this == 1
    }

    fn cleanup(&mut self) {}
}

#[test]
fn scenario_6_expire_with_rewrite_splices_the_chain() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/main", id(1), PreviousValue::MustNotExist, "t1").unwrap(); // (null, 1)
    s.update_ref("refs/heads/main", id(2), PreviousValue::Any, "t2").unwrap(); // (1, 2) -- pruned
    s.update_ref("refs/heads/main", id(3), PreviousValue::Any, "t3").unwrap(); // (2, 3)

    let mut policy = PruneMiddlePolicy { index: 0 };
    s.reflog_expire("refs/heads/main".into(), ExpireFlags::REWRITE, &mut policy).unwrap();

    let mut remaining = Vec::new();
    s.for_each_reflog_ent("refs/heads/main".into(), |e| {
        remaining.push((e.old, e.new));
        Ok(())
    })
    .unwrap();
    assert_eq!(remaining, vec![(ObjectId::NULL, id(1)), (id(1), id(3))]);
}

#[test]
fn boundary_rejected_names() {
    use refdb::dispatch::{check_refname_format, refname_is_safe};
    use refdb::name::Flags;

    assert!(check_refname_format("@".into(), Flags::ALLOW_ONELEVEL).is_err());
    assert!(check_refname_format("refs/heads/main.lock".into(), Flags::empty()).is_err());
    assert!(check_refname_format("refs/heads/../etc".into(), Flags::empty()).is_err());
    assert!(check_refname_format("refs/heads/@{upstream}".into(), Flags::empty()).is_err());
    assert!(check_refname_format("HEAD".into(), Flags::empty()).is_err());
    assert!(check_refname_format("HEAD".into(), Flags::ALLOW_ONELEVEL).is_ok());

    assert!(refname_is_safe("refs/foo/../bar".into()));
    assert!(!refname_is_safe("refs/foo/../../bar".into()));
    assert!(refname_is_safe("FETCH_HEAD".into()));
}

#[test]
fn rename_moves_value_and_reflog_together() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/old", id(1), PreviousValue::MustNotExist, "create").unwrap();
    s.update_ref("refs/heads/old", id(2), PreviousValue::Any, "move").unwrap();

    s.rename_ref("refs/heads/old".into(), "refs/heads/new".into()).unwrap();

    assert_eq!(s.read_ref("refs/heads/old".into()).unwrap(), None);
    assert_eq!(s.read_ref("refs/heads/new".into()).unwrap(), Some(Target::Direct(id(2))));

    let mut entries = Vec::new();
    s.for_each_reflog_ent("refs/heads/new".into(), |e| {
        entries.push((e.old, e.new));
        Ok(())
    })
    .unwrap();
    assert_eq!(entries, vec![(ObjectId::NULL, id(1)), (id(1), id(2))]);
}

#[test]
fn dwim_ref_expands_short_branch_name() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/main", id(7), PreviousValue::MustNotExist, "create").unwrap();
    let resolved = s.dwim_ref("main".into(), false).unwrap();
    assert_eq!(resolved.name, "refs/heads/main");
    assert_eq!(resolved.id, id(7));
}

#[test]
fn for_each_ref_enumerates_every_normal_ref() {
    let (_dir, s) = store();
    s.update_ref("refs/heads/a", id(1), PreviousValue::MustNotExist, "a").unwrap();
    s.update_ref("refs/heads/b", id(2), PreviousValue::MustNotExist, "b").unwrap();
    s.update_ref("refs/tags/v1", id(3), PreviousValue::MustNotExist, "v1").unwrap();

    let mut seen = Vec::new();
    s.for_each_ref(|name, id| {
        seen.push((name.to_string(), id));
        Ok(())
    })
    .unwrap();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("refs/heads/a".to_string(), id(1)),
            ("refs/heads/b".to_string(), id(2)),
            ("refs/tags/v1".to_string(), id(3)),
        ]
    );
}
