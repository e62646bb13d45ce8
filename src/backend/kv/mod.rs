//! KVBackend: the ordered-KV reference backend, built on `heed` (this
//! crate's OrderedKV — the Rust analogue of the LMDB environment
//! `refs-be-lmdb.c` wraps directly). Holds the KV transaction handle used to
//! resolve refs, enumerate refs/reflogs by prefix, enforce name-hierarchy,
//! write reflogs, expire reflogs, and rename refs.

pub mod expire;
mod keys;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bstr::{BStr, BString, ByteSlice};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::config::EnvConfig;
use crate::name::{self, Classification};
use crate::object_id::ObjectId;
use crate::reflog::{self, Committer, Entry};
use crate::transaction::{check_previous_value, Change, PreviousValue, RefEdit};
use crate::value::Target;

pub use expire::{ExpireFlags, ExpirePolicy};

quick_error::quick_error! {
    /// Failures raised by the KV backend, closer to the storage engine than
    /// the orchestration-layer [`crate::error::Error`].
    #[derive(Debug)]
    pub enum Error {
        Env(err: heed::Error) {
            display("KV environment error")
            source(err)
            from()
        }
        Io(err: std::io::Error) {
            display("KV backend I/O error")
            source(err)
            from()
        }
        Decode(err: crate::value::DecodeError) {
            display("stored reference value could not be decoded")
            source(err)
            from()
        }
        NameConflict(new: BString, existing: BString) {
            display("'{}' intersects with existing reference '{}'", new, existing)
        }
        BadName(name: BString) {
            display("'{}' is not a valid reference name", name)
        }
        NotFound(name: BString) {
            display("no such ref: '{}'", name)
        }
        UnexpectedValue(name: BString, expected: ObjectId, actual: ObjectId) {
            display("compare-and-swap failed for '{}': expected {}, found {}", name, expected, actual)
        }
        Broken(name: BString) {
            display("'{}' is broken", name)
        }
        SymbolicRenameUnsupported(name: BString) {
            display("renaming symbolic reference '{}' is not supported", name)
        }
        NotInWriteTransaction {
            display("rename must not be invoked from inside an existing write transaction")
        }
        Callback(err: Box<crate::error::Error>) {
            display("{}", err)
            source(&**err)
        }
    }
}

impl From<crate::error::Error> for Error {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::BadName(n) => Error::BadName(n),
            crate::error::Error::NameConflict { new, existing } => Error::NameConflict(new, existing),
            crate::error::Error::NotFound(n) => Error::NotFound(n),
            crate::error::Error::UnexpectedValue { name, expected, actual } => Error::UnexpectedValue(name, expected, actual),
            crate::error::Error::Broken(n) => Error::Broken(n),
            other => Error::Callback(Box::new(other)),
        }
    }
}

/// The ordered-KV reference backend.
pub struct KvBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    last_timestamp_ns: AtomicU64,
}

impl KvBackend {
    /// Open (creating if necessary) the KV environment rooted at
    /// `<repo>/refdb`.
    pub fn open(repo_root: &Path, config: EnvConfig) -> Result<Self, Error> {
        let path = repo_root.join("refdb");
        std::fs::create_dir_all(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.dir_mode))?;
        }

        // Safety: `path` is a directory dedicated to this store and no other
        // process is assumed to resize its map concurrently with ours.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_readers(config.max_readers)
                .max_dbs(1)
                .open(&path)?
        };
        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        Ok(KvBackend {
            env,
            db,
            last_timestamp_ns: AtomicU64::new(0),
        })
    }

    /// Open a second, read-only environment rooted at a submodule's `refdb`
    /// directory, independent of this instance's transaction state
    /// (`refs-be-lmdb.c: submodule_txn_begin`).
    pub fn open_submodule(submodule_root: &Path, config: EnvConfig) -> Result<Self, Error> {
        Self::open(submodule_root, config)
    }

    fn next_timestamp_ns(&self, proposed: u64) -> u64 {
        let mut last = self.last_timestamp_ns.load(Ordering::SeqCst);
        loop {
            let candidate = if proposed > last { proposed } else { last + 1 };
            match self
                .last_timestamp_ns
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    fn decode(raw: &[u8]) -> Result<Target, Error> {
        let trimmed = raw.strip_suffix(b"\0").unwrap_or(raw);
        Target::decode(trimmed.as_bstr()).map_err(Error::from)
    }

    fn encode(target: &Target) -> Vec<u8> {
        let mut bytes = target.encode();
        bytes.push(0);
        bytes
    }

    /// Read the raw, single-hop value stored for `name`.
    pub fn read_raw(&self, name: &BStr) -> Result<Option<Target>, Error> {
        let rtxn = self.env.read_txn()?;
        let key = keys::ref_key(name);
        match self.db.get(&rtxn, &key)? {
            Some(raw) => Ok(Some(Self::decode(raw)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, name: &BStr) -> Result<bool, Error> {
        Ok(self.read_raw(name)?.is_some())
    }

    /// Iterate every ref whose name starts with `prefix` in key order.
    pub fn for_each(&self, prefix: &BStr, trim: usize, include_broken: bool, mut f: impl FnMut(&BStr, &Target) -> Result<(), Error>) -> Result<(), Error> {
        let rtxn = self.env.read_txn()?;
        let start = keys::ref_key(prefix);
        // keys are `<name>\0`; the shortest possible key strictly greater
        // than every key with this prefix that isn't itself prefixed is
        // bounded by iterating while `starts_with(prefix)` holds.
        let range = self.db.range(&rtxn, &(start.as_slice()..))?;
        for item in range {
            let (key, raw) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            // Skip the reflog namespace entirely if it happens to sort after
            // this prefix (it never does, "logs/" < "refs/..."'s range only
            // when prefix is empty); guard explicitly for empty-prefix scans.
            if key.starts_with(keys::LOGS_PREFIX) {
                continue;
            }
            let name_with_nul = &key[..key.len()];
            let full_name: &BStr = name_with_nul[..name_with_nul.len() - 1].as_bstr();
            let trimmed: &BStr = full_name[trim.min(full_name.len())..].as_bstr();
            match Self::decode(raw) {
                Ok(target) => f(trimmed, &target)?,
                Err(_) if include_broken => f(trimmed, &Target::Direct(ObjectId::NULL))?,
                Err(_) => continue,
            }
        }
        Ok(())
    }

    /// Verify that creating/updating `name` would not violate the
    /// name-hierarchy invariant, given a set of names to ignore (used by
    /// rename to exempt the ref's own old name).
    fn verify_name_available(&self, name: &BStr, skip: &[&BStr]) -> Result<(), Error> {
        let rtxn = self.env.read_txn()?;

        // No ancestor component of `name` may already be a live ref.
        let mut end = 0;
        while let Some(slash) = name[end..].find_byte(b'/') {
            end += slash;
            let ancestor: &BStr = name[..end].as_bstr();
            if !skip.contains(&ancestor) {
                let key = keys::ref_key(ancestor);
                if self.db.get(&rtxn, &key)?.is_some() {
                    return Err(Error::NameConflict(name.to_owned(), ancestor.to_owned()));
                }
            }
            end += 1;
        }

        // No existing ref may live inside the directory `name/`.
        let mut child_prefix = name.to_vec();
        child_prefix.push(b'/');
        let range = self.db.range(&rtxn, &(child_prefix.as_slice()..))?;
        for item in range {
            let (key, _) = item?;
            if !key.starts_with(child_prefix.as_slice()) {
                break;
            }
            if key.starts_with(keys::LOGS_PREFIX) {
                continue;
            }
            let existing: &BStr = key[..key.len() - 1].as_bstr();
            if !skip.contains(&existing) {
                return Err(Error::NameConflict(name.to_owned(), existing.to_owned()));
            }
        }
        Ok(())
    }

    fn write_reflog_entry(&self, wtxn: &mut heed::RwTxn<'_>, name: &BStr, old: ObjectId, new: ObjectId, committer: &dyn Committer, message: &BStr, force_create: bool) -> Result<(), Error> {
        let header = keys::reflog_header_key(name);
        if force_create || self.db.get(wtxn, &header)?.is_none() {
            self.db.put(wtxn, &header, &[])?;
        }
        let (ts_secs, tz_minutes) = committer.now();
        let ts_ns = self.next_timestamp_ns(committer.now_nanos());
        let line = reflog::format_entry(old, new, &committer.identity(), ts_secs, tz_minutes, message);
        let key = keys::reflog_entry_key(name, ts_ns);
        self.db.put(wtxn, &key, &line)?;
        Ok(())
    }

    fn delete_reflog_entries(&self, wtxn: &mut heed::RwTxn<'_>, name: &BStr) -> Result<(), Error> {
        let header = keys::reflog_header_key(name);
        let keys_to_delete: Vec<Vec<u8>> = {
            let range = self.db.range(wtxn, &(header.as_slice()..))?;
            let mut out = Vec::new();
            for item in range {
                let (key, _) = item?;
                if !key.starts_with(header.as_slice()) {
                    break;
                }
                out.push(key.to_vec());
            }
            out
        };
        for key in keys_to_delete {
            self.db.delete(wtxn, &key)?;
        }
        Ok(())
    }

    /// Apply every edit in one write transaction, committed atomically:
    /// if any edit fails, none of the transaction's writes become visible.
    pub fn commit(&self, edits: &[RefEdit], committer: &dyn Committer) -> Result<(), crate::error::Error> {
        let mut wtxn = self.env.write_txn().map_err(Error::from).map_err(engine_err)?;

        for edit in edits {
            self.apply(&mut wtxn, edit, committer).map_err(engine_err)?;
        }

        wtxn.commit().map_err(Error::from).map_err(engine_err)?;
        Ok(())
    }

    fn apply(&self, wtxn: &mut heed::RwTxn<'_>, edit: &RefEdit, committer: &dyn Committer) -> Result<(), Error> {
        let name: &BStr = edit.name.as_slice().into();
        debug_assert_eq!(name::classify(name), Classification::Normal, "BUG: non-Normal ref routed to KVBackend");

        match &edit.change {
            Change::Update { new, expected, log } => {
                let key = keys::ref_key(name);
                let current_raw = self.db.get(wtxn, &key)?.map(|r| r.to_vec());
                let current = current_raw.as_deref().map(Self::decode).transpose()?;
                check_previous_value(current.as_ref(), expected, name)?;

                if !matches!(log.mode, crate::transaction::RefLog::Only) {
                    self.verify_name_available(name, &[name])?;
                    self.db.put(wtxn, &key, &Self::encode(new))?;
                }

                if let (Target::Direct(new_id), Some(message)) = (new, &log.message) {
                    let old_id = match current {
                        Some(Target::Direct(id)) => id,
                        _ => ObjectId::NULL,
                    };
                    if old_id != *new_id || log.force_create_reflog {
                        self.write_reflog_entry(wtxn, name, old_id, *new_id, committer, message.as_slice().into(), log.force_create_reflog)?;
                    }
                }
                Ok(())
            }
            Change::Delete { expected } => {
                let key = keys::ref_key(name);
                let current_raw = self.db.get(wtxn, &key)?.map(|r| r.to_vec());
                let current = current_raw.as_deref().map(Self::decode).transpose()?;
                check_previous_value(current.as_ref(), expected, name)?;
                self.db.delete(wtxn, &key)?;
                self.delete_reflog_entries(wtxn, name)?;
                Ok(())
            }
            Change::Verify { expected } => {
                let key = keys::ref_key(name);
                let current_raw = self.db.get(wtxn, &key)?.map(|r| r.to_vec());
                let current = current_raw.as_deref().map(Self::decode).transpose()?;
                check_previous_value(current.as_ref(), expected, name)?;
                Ok(())
            }
        }
    }

    /// Write `ref: <target>\0` at `name`; if `logmsg` is given, log the
    /// source's old/new ids around the change.
    pub fn create_symref(&self, name: &BStr, target: &BStr, logmsg: Option<&BStr>, committer: &dyn Committer) -> Result<(), Error> {
        let mut wtxn = self.env.write_txn()?;
        let key = keys::ref_key(name);
        let old = self.db.get(&wtxn, &key)?.map(Self::decode).transpose()?;
        let old_id = match old {
            Some(Target::Direct(id)) => id,
            _ => ObjectId::NULL,
        };
        self.db.put(&mut wtxn, &key, &Self::encode(&Target::Symbolic(target.to_owned())))?;
        if let Some(message) = logmsg {
            let new_id = match self.read_target_within(&wtxn, target)? {
                Some(Target::Direct(id)) => id,
                _ => ObjectId::NULL,
            };
            self.write_reflog_entry(&mut wtxn, name, old_id, new_id, committer, message, false)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn read_target_within(&self, rtxn: &heed::RoTxn<'_>, name: &BStr) -> Result<Option<Target>, Error> {
        let key = keys::ref_key(name);
        match self.db.get(rtxn, &key)? {
            Some(raw) => Ok(Some(Self::decode(raw)?)),
            None => Ok(None),
        }
    }

    /// Rename `old` to `new`, carrying its reflog along. Must not be
    /// called from inside an already open write transaction owned by the
    /// caller.
    pub fn rename(&self, old: &BStr, new: &BStr) -> Result<(), Error> {
        let mut wtxn = self.env.write_txn()?;

        let old_key = keys::ref_key(old);
        let old_value = self
            .db
            .get(&wtxn, &old_key)?
            .map(Self::decode)
            .transpose()?
            .ok_or_else(|| Error::NotFound(old.to_owned()))?;
        if matches!(old_value, Target::Symbolic(_)) {
            return Err(Error::SymbolicRenameUnsupported(old.to_owned()));
        }

        drop(wtxn);
        self.verify_name_available(new, &[old])?;
        let mut wtxn = self.env.write_txn()?;

        let new_header = keys::reflog_header_key(new);
        self.db.put(&mut wtxn, &new_header, &[])?;

        let old_header = keys::reflog_header_key(old);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let range = self.db.range(&wtxn, &(old_header.as_slice()..))?;
            let mut out = Vec::new();
            for item in range {
                let (key, value) = item?;
                if !key.starts_with(old_header.as_slice()) {
                    break;
                }
                if let Some(ts) = keys::entry_timestamp(key, old_header.len()) {
                    out.push((keys::reflog_entry_key(new, ts), value.to_vec()));
                }
                out.push((key.to_vec(), Vec::new())); // marker consumed below for deletion
            }
            out
        };

        // Replay: write every new-side entry, then delete every old-side key
        // (including the header) collected above.
        let mut to_delete: Vec<Vec<u8>> = vec![old_header.clone()];
        for (key, value) in entries {
            if key.starts_with(new_header.as_slice()) {
                self.db.put(&mut wtxn, &key, &value)?;
            } else {
                to_delete.push(key);
            }
        }
        for key in to_delete {
            self.db.delete(&mut wtxn, &key)?;
        }

        self.db.put(&mut wtxn, &keys::ref_key(new), &Self::encode(&old_value))?;
        self.db.delete(&mut wtxn, &old_key)?;

        wtxn.commit()?;
        Ok(())
    }

    pub fn reflog_exists(&self, name: &BStr) -> Result<bool, Error> {
        let rtxn = self.env.read_txn()?;
        let header = keys::reflog_header_key(name);
        Ok(self.db.get(&rtxn, &header)?.is_some())
    }

    pub fn create_reflog(&self, name: &BStr) -> Result<(), Error> {
        let mut wtxn = self.env.write_txn()?;
        let header = keys::reflog_header_key(name);
        if self.db.get(&wtxn, &header)?.is_none() {
            self.db.put(&mut wtxn, &header, &[])?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn delete_reflog(&self, name: &BStr) -> Result<(), Error> {
        let mut wtxn = self.env.write_txn()?;
        self.delete_reflog_entries(&mut wtxn, name)?;
        wtxn.commit()?;
        Ok(())
    }

    fn collect_reflog_entries(&self, name: &BStr) -> Result<Vec<(u64, Entry)>, Error> {
        let rtxn = self.env.read_txn()?;
        let header = keys::reflog_header_key(name);
        let range = self.db.range(&rtxn, &(header.as_slice()..))?;
        let mut out = Vec::new();
        for item in range {
            let (key, value) = item?;
            if !key.starts_with(header.as_slice()) {
                break;
            }
            if keys::is_reflog_header(key, header.len()) {
                continue;
            }
            let ts = keys::entry_timestamp(key, header.len()).expect("entry key has 8-byte suffix");
            if let Some(entry) = reflog::parse_line(value.as_bstr()) {
                out.push((ts, entry));
            }
        }
        Ok(out)
    }

    /// `for_each_reflog_ent`: forward (oldest-first) iteration.
    pub fn for_each_reflog_ent(&self, name: &BStr, mut f: impl FnMut(&Entry) -> Result<(), Error>) -> Result<(), Error> {
        for (_, entry) in self.collect_reflog_entries(name)? {
            f(&entry)?;
        }
        Ok(())
    }

    /// `for_each_reflog_ent_reverse`: newest-first iteration, with a chance
    /// to short-circuit (used by `read_ref_at`'s bounded backward walk).
    pub fn for_each_reflog_ent_reverse(&self, name: &BStr, mut f: impl FnMut(&Entry) -> Result<bool, Error>) -> Result<(), Error> {
        for (_, entry) in self.collect_reflog_entries(name)?.into_iter().rev() {
            if !f(&entry)? {
                break;
            }
        }
        Ok(())
    }

    /// `for_each_reflog`: `HEAD`, then every other ref with an existing
    /// reflog, in key order (`refs-be-lmdb.c: lmdb_for_each_reflog`).
    pub fn for_each_reflog(&self, mut f: impl FnMut(&BStr) -> Result<(), Error>) -> Result<(), Error> {
        let rtxn = self.env.read_txn()?;
        let range = self.db.range(&rtxn, &(keys::LOGS_PREFIX..))?;
        let mut seen_names: Vec<BString> = Vec::new();
        for item in range {
            let (key, _) = item?;
            if !key.starts_with(keys::LOGS_PREFIX) {
                break;
            }
            let rest = &key[keys::LOGS_PREFIX.len()..];
            let nul = rest.iter().position(|&b| b == 0).expect("header NUL present");
            let name: &BStr = rest[..nul].as_bstr();
            if seen_names.last().map(|n| n.as_slice()) != Some(name.as_bytes()) {
                seen_names.push(name.to_owned());
            }
        }
        for name in seen_names {
            f(name.as_slice().into())?;
        }
        Ok(())
    }

    /// Prune entries from `name`'s reflog according to `policy`.
    pub fn reflog_expire(&self, name: &BStr, flags: ExpireFlags, policy: &mut dyn ExpirePolicy, committer: &dyn Committer) -> Result<(), Error> {
        let current_id = match self.read_raw(name)? {
            Some(Target::Direct(id)) => id,
            _ => ObjectId::NULL,
        };
        policy.prepare(name, current_id);

        let entries = self.collect_reflog_entries(name)?;
        let mut last_kept_new = ObjectId::NULL;
        let mut rewritten_old: Option<ObjectId> = None;
        let mut to_delete = Vec::new();
        let mut to_rewrite = Vec::new();

        for (ts, entry) in &entries {
            let effective_old = if flags.contains(ExpireFlags::REWRITE) {
                rewritten_old.unwrap_or(entry.old)
            } else {
                entry.old
            };
            let prune = policy.should_prune(
                effective_old,
                entry.new,
                entry.committer.email.as_slice().into(),
                entry.timestamp_secs,
                entry.tz_offset_minutes,
                entry.message.as_slice().into(),
            );
            if prune {
                if flags.contains(ExpireFlags::VERBOSE) {
                    log::info!("pruning reflog entry for '{}' at {}", name, entry.timestamp_secs);
                }
                to_delete.push(*ts);
            } else {
                last_kept_new = entry.new;
                if flags.contains(ExpireFlags::REWRITE) && effective_old != entry.old {
                    to_rewrite.push((*ts, Entry { old: effective_old, ..entry.clone() }));
                }
                rewritten_old = Some(entry.new);
            }
        }
        policy.cleanup();

        if !flags.contains(ExpireFlags::DRY_RUN) {
            let mut wtxn = self.env.write_txn()?;
            let header = keys::reflog_header_key(name);
            for ts in to_delete {
                self.db.delete(&mut wtxn, &keys::reflog_entry_key(name, ts))?;
            }
            for (ts, entry) in to_rewrite {
                let key = {
                    let mut k = header.clone();
                    k.extend_from_slice(&ts.to_be_bytes());
                    k
                };
                let line = reflog::format_entry(
                    entry.old,
                    entry.new,
                    &entry.committer,
                    entry.timestamp_secs,
                    entry.tz_offset_minutes,
                    entry.message.as_slice().into(),
                );
                self.db.put(&mut wtxn, &key, &line)?;
            }
            wtxn.commit()?;

            if flags.contains(ExpireFlags::UPDATE_REF) && !last_kept_new.is_null() {
                let current = self.read_raw(name)?;
                if !matches!(current, Some(Target::Symbolic(_))) {
                    let mut wtxn = self.env.write_txn()?;
                    self.db.put(&mut wtxn, &keys::ref_key(name), &Self::encode(&Target::Direct(last_kept_new)))?;
                    wtxn.commit()?;
                }
            }
        }
        Ok(())
    }
}

fn engine_err(e: Error) -> crate::error::Error {
    crate::error::Error::Backend(e)
}

/// Path to the KV environment's backing directory, for diagnostics.
pub fn refdb_path(repo_root: &Path) -> PathBuf {
    repo_root.join("refdb")
}
