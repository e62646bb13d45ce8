//! FilesBackend: per-worktree refs (`HEAD`, `refs/bisect/*`) and pseudorefs
//! (`FETCH_HEAD`, ...) stored as loose files, written under a lockfile;
//! grounded in `write_pseudoref`/`delete_pseudoref` in `refs.c`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::{BStr, ByteSlice};
use fs4::FileExt;

use crate::transaction::{check_previous_value, Change, RefEdit};
use crate::value::Target;

quick_error::quick_error! {
    /// Failures raised by the files backend.
    #[derive(Debug)]
    pub enum Error {
        Io(err: std::io::Error) {
            display("files backend I/O error")
            source(err)
            from()
        }
        Locked(path: PathBuf) {
            display("'{}' is locked by another writer", path.display())
        }
        Decode(err: crate::value::DecodeError) {
            display("stored value could not be decoded")
            source(err)
            from()
        }
        Transaction(err: Box<crate::error::Error>) {
            display("nested transaction error")
            source(err)
        }
    }
}

/// A guard around a freshly-created `<path>.lock` file, removed on drop
/// unless [`LockGuard::commit`] has consumed it — the Rust equivalent of
/// `hold_lock_file_for_update`/`rollback_lock_file`/`commit_lock_file`.
struct LockGuard {
    lock_path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    fn acquire(lock_path: PathBuf) -> Result<Self, Error> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::Locked(lock_path.clone())
                } else {
                    Error::Io(e)
                }
            })?;
        file.try_lock_exclusive().map_err(Error::Io)?;
        Ok(LockGuard {
            lock_path,
            file: Some(file),
        })
    }

    fn write_all(&mut self, content: &[u8]) -> Result<(), Error> {
        let file = self.file.as_mut().expect("lock file present while held");
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    /// Rename the lock file over `target`, releasing the lock.
    fn commit(mut self, target: &Path) -> Result<(), Error> {
        drop(self.file.take());
        fs::rename(&self.lock_path, target)?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Loose-file storage for per-worktree refs and pseudorefs.
pub struct FilesBackend {
    root: PathBuf,
}

impl FilesBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesBackend { root: root.into() }
    }

    fn path_for(&self, name: &BStr) -> PathBuf {
        self.root.join(name.to_str_lossy().as_ref())
    }

    fn lock_path_for(&self, name: &BStr) -> PathBuf {
        let mut path = self.path_for(name).into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Read and decode the current value of `name`, if the loose file exists.
    pub fn read(&self, name: &BStr) -> Result<Option<Target>, Error> {
        let path = self.path_for(name);
        match fs::read(&path) {
            Ok(bytes) => {
                let trimmed = bytes.trim_end_with(|c| c == '\n' || c == '\0');
                Ok(Some(Target::decode(trimmed.as_bstr())?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write `new` under `name`, subject to the compare-and-swap condition
    /// `expected`, using a lockfile for the duration of the check-and-write.
    pub fn write(&self, name: &BStr, new: &Target, expected: &crate::transaction::PreviousValue) -> Result<(), Error> {
        let lock = LockGuard::acquire(self.lock_path_for(name))?;
        let current = self.read(name)?;
        check_previous_value(current.as_ref(), expected, name).map_err(|e| Error::Transaction(Box::new(e)))?;
        let mut lock = lock;
        let mut content = new.encode();
        content.push(b'\n');
        lock.write_all(&content)?;
        lock.commit(&self.path_for(name))
    }

    /// Remove the loose file for `name`, subject to `expected`.
    pub fn delete(&self, name: &BStr, expected: &crate::transaction::PreviousValue) -> Result<(), Error> {
        let lock = LockGuard::acquire(self.lock_path_for(name))?;
        let current = self.read(name)?;
        check_previous_value(current.as_ref(), expected, name).map_err(|e| Error::Transaction(Box::new(e)))?;
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if path.exists() => return Err(Error::Io(e)),
            Err(_) => {}
        }
        drop(lock);
        Ok(())
    }

    /// Apply every edit in turn. There is no atomicity across edits in this
    /// partition: a failure partway through leaves earlier edits committed.
    pub fn commit(&self, edits: &[RefEdit]) -> Result<(), crate::error::Error> {
        for edit in edits {
            let name: &BStr = edit.name.as_slice().into();
            match &edit.change {
                Change::Update { new, expected, log } => {
                    // A dereferenced symref update downgrades its own edit to
                    // `RefLog::Only` (the underlying ref gets the real write;
                    // this one exists only so a KV-backed ref would log the
                    // transition). This backend has no reflog to write, so
                    // the symref's own loose file must be left untouched.
                    if !matches!(log.mode, crate::transaction::RefLog::Only) {
                        self.write(name, new, expected).map_err(Error::into_engine_error)?;
                    }
                }
                Change::Delete { expected } => {
                    self.delete(name, expected).map_err(Error::into_engine_error)?;
                }
                Change::Verify { expected } => {
                    let current = self.read(name).map_err(Error::into_engine_error)?;
                    check_previous_value(current.as_ref(), expected, name)?;
                }
            }
        }
        Ok(())
    }
}

impl Error {
    pub(crate) fn into_engine_error(self) -> crate::error::Error {
        match self {
            Error::Transaction(inner) => *inner,
            other => crate::error::Error::Generic(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ObjectId;
    use crate::transaction::PreviousValue;

    fn backend() -> (tempfile::TempDir, FilesBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, be) = backend();
        let id = ObjectId::from_bytes([0x42; 20]);
        be.write("HEAD".into(), &Target::Direct(id), &PreviousValue::MustNotExist).unwrap();
        assert_eq!(be.read("HEAD".into()).unwrap(), Some(Target::Direct(id)));
    }

    #[test]
    fn cas_mismatch_is_rejected() {
        let (_dir, be) = backend();
        let a = ObjectId::from_bytes([1; 20]);
        let b = ObjectId::from_bytes([2; 20]);
        be.write("FETCH_HEAD".into(), &Target::Direct(a), &PreviousValue::MustNotExist).unwrap();
        let result = be.write("FETCH_HEAD".into(), &Target::Direct(b), &PreviousValue::MustExistAndMatch(b));
        assert!(result.is_err());
        assert_eq!(be.read("FETCH_HEAD".into()).unwrap(), Some(Target::Direct(a)));
    }

    #[test]
    fn delete_removes_file() {
        let (_dir, be) = backend();
        let id = ObjectId::from_bytes([9; 20]);
        be.write("MERGE_HEAD".into(), &Target::Direct(id), &PreviousValue::MustNotExist).unwrap();
        be.delete("MERGE_HEAD".into(), &PreviousValue::MustExist).unwrap();
        assert_eq!(be.read("MERGE_HEAD".into()).unwrap(), None);
    }

    #[test]
    fn no_lock_file_left_behind_after_write() {
        let (dir, be) = backend();
        let id = ObjectId::from_bytes([3; 20]);
        be.write("HEAD".into(), &Target::Direct(id), &PreviousValue::Any).unwrap();
        assert!(!dir.path().join("HEAD.lock").exists());
    }
}
