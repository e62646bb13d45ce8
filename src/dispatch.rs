//! Public API surface: the convenience entry points an embedding application
//! actually calls, routing through the active backend registered in
//! [`BackendRegistry`] and the always-present [`FilesBackend`].
//!
//! Everything here is a thin reducer over `transaction`/`backend::kv`/
//! `backend::files`/`name`; no new storage logic lives in this module.

use std::path::Path;

use bstr::{BStr, BString, ByteSlice};

use crate::backend::files::FilesBackend;
use crate::backend::kv::{refdb_path, KvBackend};
use crate::backend::Resolved;
use crate::error::Error;
use crate::name::{self, Classification};
use crate::object_db::ObjectDb;
use crate::object_id::ObjectId;
use crate::reflog::{Committer, Entry};
use crate::registry::BackendRegistry;
use crate::transaction::{self, Change, Deref, LogChange, PreviousValue, Transaction};
use crate::value::Target;

/// Create the primary backend's on-disk directory. Safe to call on an
/// already-initialized repository.
pub fn init_db(repo_root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(refdb_path(repo_root))
}

/// Owns the active primary backend (via [`BackendRegistry`]) and the
/// always-present [`FilesBackend`], and exposes the convenience API an
/// embedding application drives day to day.
pub struct Store {
    registry: BackendRegistry,
    files: FilesBackend,
    committer: Box<dyn Committer + Send + Sync>,
}

impl Store {
    pub fn new(files_root: impl Into<std::path::PathBuf>, committer: impl Committer + Send + Sync + 'static) -> Self {
        Store {
            registry: BackendRegistry::new(),
            files: FilesBackend::new(files_root),
            committer: Box::new(committer),
        }
    }

    pub fn register_backend(&mut self, name: impl Into<String>, backend: KvBackend) {
        self.registry.register_backend(name, backend);
    }

    pub fn set_backend(&mut self, name: &str) -> Result<(), crate::registry::UnknownBackend> {
        self.registry.set_backend(name)
    }

    pub fn backend_exists(&self, name: &str) -> bool {
        self.registry.backend_exists(name)
    }

    fn primary(&self) -> Result<&KvBackend, Error> {
        self.registry
            .active()
            .ok_or_else(|| Error::Generic("no primary backend is active; call set_backend first".into()))
    }

    /// Begin a transaction against the active primary backend and the files
    /// backend.
    pub fn begin(&self) -> Result<Transaction<'_>, Error> {
        Ok(Transaction::begin(self.primary()?, &self.files, self.committer.as_ref()))
    }

    /// One-shot convenience: update a single ref and commit immediately.
    ///
    /// Per §4.5, a `Pseudoref`-classified name bypasses the transaction
    /// machinery entirely: it is written straight to its loose file under a
    /// lockfile, subject to the same compare-and-swap the transaction engine
    /// would otherwise enforce.
    pub fn update_ref(&self, name: impl Into<BString>, new: ObjectId, expected: PreviousValue, message: impl Into<BString>) -> Result<(), Error> {
        let name = name.into();
        if name::classify(name.as_slice().into()) == Classification::Pseudoref {
            return self
                .files
                .write(name.as_slice().into(), &Target::Direct(new), &expected)
                .map_err(crate::backend::files::Error::into_engine_error);
        }

        let mut tx = self.begin()?;
        tx.update(
            name,
            Change::Update {
                new: Target::Direct(new),
                expected,
                log: LogChange {
                    mode: crate::transaction::RefLog::AndReference,
                    force_create_reflog: false,
                    message: Some(message.into()),
                },
            },
            Deref::Yes,
        )?;
        tx.commit()
    }

    /// One-shot convenience: delete a single ref and commit immediately.
    ///
    /// Mirrors [`Store::update_ref`]'s §4.5 pseudoref bypass: deletion of a
    /// `Pseudoref`-classified name unlinks its loose file directly, subject
    /// to the same CAS condition.
    pub fn delete_ref(&self, name: impl Into<BString>, expected: PreviousValue) -> Result<(), Error> {
        let name = name.into();
        if name::classify(name.as_slice().into()) == Classification::Pseudoref {
            return self
                .files
                .delete(name.as_slice().into(), &expected)
                .map_err(crate::backend::files::Error::into_engine_error);
        }

        let mut tx = self.begin()?;
        tx.delete(name, expected)?;
        tx.commit()
    }

    /// Read the raw, single-hop value of `name` without following symrefs.
    pub fn read_ref(&self, name: &BStr) -> Result<Option<Target>, Error> {
        transaction::read_any(self.primary()?, &self.files, name)
    }

    /// Fully resolve `name`, following symbolic pointers to their terminal
    /// direct value.
    pub fn read_ref_full(&self, name: &BStr) -> Result<Resolved, Error> {
        transaction::resolve(self.primary()?, &self.files, name)
    }

    pub fn resolve_ref(&self, name: &BStr) -> Result<Resolved, Error> {
        self.read_ref_full(name)
    }

    pub fn ref_exists(&self, name: &BStr) -> Result<bool, Error> {
        Ok(self.read_ref(name)?.is_some())
    }

    /// What the symbolic chain starting at `HEAD` currently resolves to.
    pub fn head_ref(&self) -> Result<Resolved, Error> {
        self.read_ref_full("HEAD".into())
    }

    /// Iterate every `Normal` ref (the primary backend's namespace) whose
    /// name starts with `prefix`, trimming the first `trim` bytes of each
    /// name passed to `f`.
    pub fn for_each_ref_in(&self, prefix: &BStr, trim: usize, mut f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        self.primary()?
            .for_each(prefix, trim, false, |name, target| match target {
                Target::Direct(id) => f(name, *id).map_err(engine_to_kv_err),
                Target::Symbolic(_) => Ok(()),
            })
            .map_err(Error::from)
    }

    pub fn for_each_ref(&self, mut f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        self.for_each_ref_in("".into(), 0, &mut f)
    }

    /// Like [`Store::for_each_ref`] but includes refs whose stored value is
    /// broken, passing the null id for them.
    pub fn for_each_rawref(&self, mut f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        self.primary()?
            .for_each("".into(), 0, true, |name, target| match target {
                Target::Direct(id) => f(name, *id).map_err(engine_to_kv_err),
                Target::Symbolic(_) => Ok(()),
            })
            .map_err(Error::from)
    }

    pub fn for_each_namespaced_ref(&self, namespace: &BStr, f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        self.for_each_ref_in(namespace, 0, f)
    }

    pub fn for_each_replace_ref(&self, f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        self.for_each_ref_in("refs/replace/".into(), "refs/replace/".len(), f)
    }

    /// Enumerate refs in a submodule's own KV environment, independent of
    /// this store's active backend and transaction state.
    pub fn for_each_ref_in_submodule(submodule_root: &Path, config: crate::config::EnvConfig, mut f: impl FnMut(&BStr, ObjectId) -> Result<(), Error>) -> Result<(), Error> {
        let backend = KvBackend::open_submodule(submodule_root, config).map_err(Error::from)?;
        backend
            .for_each("".into(), 0, false, |name, target| match target {
                Target::Direct(id) => f(name, *id).map_err(engine_to_kv_err),
                Target::Symbolic(_) => Ok(()),
            })
            .map_err(Error::from)
    }

    pub fn reflog_exists(&self, name: &BStr) -> Result<bool, Error> {
        self.primary()?.reflog_exists(name).map_err(Error::from)
    }

    pub fn create_reflog(&self, name: &BStr) -> Result<(), Error> {
        self.primary()?.create_reflog(name).map_err(Error::from)
    }

    pub fn delete_reflog(&self, name: &BStr) -> Result<(), Error> {
        self.primary()?.delete_reflog(name).map_err(Error::from)
    }

    pub fn for_each_reflog_ent(&self, name: &BStr, mut f: impl FnMut(&Entry) -> Result<(), Error>) -> Result<(), Error> {
        self.primary()?.for_each_reflog_ent(name, |e| f(e).map_err(engine_to_kv_err)).map_err(Error::from)
    }

    pub fn for_each_reflog_ent_reverse(&self, name: &BStr, mut f: impl FnMut(&Entry) -> Result<bool, Error>) -> Result<(), Error> {
        self.primary()?
            .for_each_reflog_ent_reverse(name, |e| f(e).map_err(engine_to_kv_err))
            .map_err(Error::from)
    }

    pub fn for_each_reflog(&self, mut f: impl FnMut(&BStr) -> Result<(), Error>) -> Result<(), Error> {
        self.primary()?.for_each_reflog(|n| f(n).map_err(engine_to_kv_err)).map_err(Error::from)
    }

    pub fn reflog_expire(
        &self,
        name: &BStr,
        flags: crate::backend::kv::ExpireFlags,
        policy: &mut dyn crate::backend::kv::ExpirePolicy,
    ) -> Result<(), Error> {
        self.primary()?.reflog_expire(name, flags, policy, self.committer.as_ref()).map_err(Error::from)
    }

    /// Walk `name`'s reflog backward from the newest entry, returning the
    /// id that was current at `cutoff_time` (or after `max_entries` hops,
    /// whichever is reached first).
    pub fn read_ref_at(&self, name: &BStr, cutoff_time: i64, max_entries: u32) -> Result<Option<ObjectId>, Error> {
        let mut remaining = max_entries;
        let mut found = None;
        self.for_each_reflog_ent_reverse(name, |entry| {
            if entry.timestamp_secs <= cutoff_time || remaining == 0 {
                found = Some(entry.new);
                return Ok(false);
            }
            remaining -= 1;
            Ok(true)
        })?;
        Ok(found)
    }

    /// Write a symbolic ref at `name` pointing at `target`, routed to
    /// whichever backend owns `name` (the same routing [`transaction::read_any`]
    /// uses for reads) — a `HEAD` symref written via the KV backend would
    /// never be found again, since `HEAD` is always read back from the files
    /// backend.
    pub fn create_symref(&self, name: &BStr, target: &BStr, logmsg: Option<&BStr>) -> Result<(), Error> {
        match name::classify(name) {
            Classification::Normal => self.primary()?.create_symref(name, target, logmsg, self.committer.as_ref()).map_err(Error::from),
            Classification::PerWorktree | Classification::Pseudoref => self
                .files
                .write(name, &Target::Symbolic(target.to_owned()), &PreviousValue::Any)
                .map_err(crate::backend::files::Error::into_engine_error),
        }
    }

    /// Rename `old` to `new`. Only `Normal` refs (the primary backend's
    /// namespace) are supported; per-worktree refs and pseudorefs are not
    /// renameable through this entry point.
    pub fn rename_ref(&self, old: &BStr, new: &BStr) -> Result<(), Error> {
        if name::classify(old) != Classification::Normal || name::classify(new) != Classification::Normal {
            return Err(Error::Generic(format!("cannot rename '{}' to '{}': not both Normal refs", old, new)));
        }
        self.primary()?.rename(old, new).map_err(Error::from)
    }

    /// Try each rule in [`DWIM_RULES`] against `short`; the first expansion
    /// that resolves wins. If `warn_on_ambiguity`, later matching rules are
    /// logged as a warning without changing the result.
    pub fn dwim_ref(&self, short: &BStr, warn_on_ambiguity: bool) -> Result<Resolved, Error> {
        let mut found: Option<Resolved> = None;
        for rule in DWIM_RULES {
            let candidate = expand_rule(rule, short);
            match self.read_ref_full(candidate.as_slice().into()) {
                Ok(resolved) => {
                    if found.is_none() {
                        found = Some(resolved);
                    } else if warn_on_ambiguity {
                        log::warn!("short ref '{}' is ambiguous; '{}' also resolves", short, candidate);
                    }
                }
                Err(Error::NotFound(_)) | Err(Error::Broken(_)) => {}
                Err(e) => return Err(e),
            }
        }
        found.ok_or_else(|| Error::NotFound(short.to_owned()))
    }

    /// Like [`Store::dwim_ref`] but additionally requires the resolved ref to
    /// have a reflog.
    pub fn dwim_log(&self, short: &BStr) -> Result<Resolved, Error> {
        for rule in DWIM_RULES {
            let candidate = expand_rule(rule, short);
            if let Ok(resolved) = self.read_ref_full(candidate.as_slice().into()) {
                if self.reflog_exists(resolved.name.as_slice().into()).unwrap_or(false) {
                    return Ok(resolved);
                }
            }
        }
        Err(Error::NotFound(short.to_owned()))
    }

    /// Find the shortest unambiguous name that [`Store::dwim_ref`] would
    /// expand back to `full`.
    pub fn shorten_unambiguous_ref(&self, full: &BStr, strict: bool) -> BString {
        for (i, rule) in SHORTEN_RULES.iter().enumerate() {
            let candidate = match extract_candidate(rule, full) {
                Some(c) => c,
                None => continue,
            };
            let unambiguous = SHORTEN_RULES.iter().enumerate().all(|(j, other)| {
                if strict {
                    if j == i {
                        return true;
                    }
                } else if j >= i {
                    return true;
                }
                let expanded = expand_rule(other, candidate.as_slice().into());
                !self.ref_exists(expanded.as_slice().into()).unwrap_or(false)
            });
            if unambiguous {
                return candidate;
            }
        }
        full.to_owned()
    }

    /// Resolve `name`, then peel through tag objects to the first non-tag
    /// object, consulting `odb` for object kinds.
    pub fn peel_ref(&self, name: &BStr, odb: &dyn ObjectDb) -> Result<PeelOutcome, Error> {
        let resolved = self.read_ref_full(name)?;
        match odb.peel_tag(resolved.id) {
            Some(target) if target != resolved.id => Ok(PeelOutcome::Peeled(target)),
            Some(non_tag) => Ok(PeelOutcome::NonTag(non_tag)),
            None => Ok(PeelOutcome::Invalid),
        }
    }
}

fn engine_to_kv_err(e: Error) -> crate::backend::kv::Error {
    crate::backend::kv::Error::from(e)
}

/// Outcome of [`Store::peel_ref`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeelOutcome {
    /// The ref pointed at a tag; this is the non-tag object at the bottom of
    /// the tag chain.
    Peeled(ObjectId),
    /// The ref already pointed at a non-tag object.
    NonTag(ObjectId),
    /// The object database does not know this object.
    Invalid,
}

/// Rule order for [`Store::dwim_ref`]/[`Store::dwim_log`]: tried in this
/// order, first resolving rule wins.
pub const DWIM_RULES: [&str; 6] = ["%s", "refs/%s", "refs/tags/%s", "refs/heads/%s", "refs/remotes/%s", "refs/remotes/%s/HEAD"];

/// Rule order for [`Store::shorten_unambiguous_ref`]: tried longest-match
/// first so the most specific candidate is preferred when unambiguous.
const SHORTEN_RULES: [&str; 6] = ["refs/remotes/%s/HEAD", "refs/remotes/%s", "refs/heads/%s", "refs/tags/%s", "refs/%s", "%s"];

fn expand_rule(rule: &str, short: &BStr) -> BString {
    let mut out = BString::from(Vec::new());
    out.extend_from_slice(rule.replace("%s", &short.to_str_lossy()).as_bytes());
    out
}

/// If `full` matches `rule`'s literal scaffolding around its single `%s`,
/// return the substring that filled it in.
fn extract_candidate(rule: &str, full: &BStr) -> Option<BString> {
    let (prefix, suffix) = rule.split_once("%s")?;
    let full = full.as_bytes();
    if !full.starts_with(prefix.as_bytes()) || !full.ends_with(suffix.as_bytes()) {
        return None;
    }
    let start = prefix.len();
    let end = full.len().checked_sub(suffix.len())?;
    if end < start {
        return None;
    }
    let candidate = &full[start..end];
    if candidate.is_empty() {
        return None;
    }
    Some(candidate.as_bstr().to_owned())
}

/// Thin wrapper over [`name::check`].
pub fn check_refname_format(name: &BStr, flags: name::Flags) -> Result<(), name::BadName> {
    name::check(name, flags)
}

/// Thin wrapper over [`name::is_safe`].
pub fn refname_is_safe(name: &BStr) -> bool {
    name::is_safe(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_rule_substitutes_short_name() {
        assert_eq!(expand_rule("refs/heads/%s", "main".into()).as_slice(), b"refs/heads/main");
        assert_eq!(expand_rule("%s", "HEAD".into()).as_slice(), b"HEAD");
    }

    #[test]
    fn extract_candidate_round_trips_with_expand() {
        let full: BString = "refs/heads/main".into();
        let candidate = extract_candidate("refs/heads/%s", full.as_slice().into()).unwrap();
        assert_eq!(candidate.as_slice(), b"main");
        assert_eq!(expand_rule("refs/heads/%s", candidate.as_slice().into()), full);
    }

    #[test]
    fn extract_candidate_rejects_non_matching_rule() {
        assert!(extract_candidate("refs/tags/%s", "refs/heads/main".into()).is_none());
    }

    #[test]
    fn extract_candidate_bare_rule_matches_anything() {
        let full: BString = "refs/heads/main".into();
        assert_eq!(extract_candidate("%s", full.as_slice().into()).unwrap(), full);
    }
}
