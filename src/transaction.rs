//! TransactionEngine: accumulates updates, dereferences symrefs, partitions
//! between the primary and files backends, and drives a two-stage commit.
//!
//! Edit types (`Change`, `RefEdit`, `PreviousValue`, `LogChange`, `RefLog`)
//! follow the shape of a conventional ref-transaction module.

use bstr::{BString, ByteSlice};

use crate::backend::files::FilesBackend;
use crate::backend::kv::KvBackend;
use crate::error::Error;
use crate::name::{self, Classification};
use crate::object_id::ObjectId;
use crate::reflog::Committer;
use crate::value::Target;

/// Maximum number of symbolic hops [`resolve`] will follow before
/// declaring a ref broken.
pub const MAX_SYMREF_DEPTH: u8 = 5;

/// A compare-and-swap condition against the value a ref is expected to hold
/// before an update is allowed to proceed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PreviousValue {
    /// No condition; overwrite unconditionally.
    Any,
    /// The ref must currently exist, with any value.
    MustExist,
    /// The ref must not currently exist.
    MustNotExist,
    /// The ref must currently resolve to exactly this id.
    MustExistAndMatch(ObjectId),
}

/// Whether and how an update is recorded to the ref's reflog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefLog {
    /// Update the reference only; the reflog, if any, is left untouched.
    Only,
    /// Update both the reference and append a reflog entry.
    AndReference,
}

/// Reflog-related parameters accompanying a [`Change`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogChange {
    pub mode: RefLog,
    /// Create the reflog header even if this ref has never been logged.
    pub force_create_reflog: bool,
    /// The message to record; no entry is written if logging is requested
    /// but no message is given.
    pub message: Option<BString>,
}

impl Default for LogChange {
    fn default() -> Self {
        LogChange {
            mode: RefLog::AndReference,
            force_create_reflog: false,
            message: None,
        }
    }
}

/// What to do to a single reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Change {
    Update {
        new: Target,
        expected: PreviousValue,
        log: LogChange,
    },
    Delete {
        expected: PreviousValue,
    },
    /// Check the condition without writing anything.
    Verify {
        expected: PreviousValue,
    },
}

/// Do not follow a symbolic ref to its target; operate on the symref itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Deref {
    Yes,
    No,
}

/// One accumulated change, submitted to a [`Transaction`] before commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefEdit {
    pub name: BString,
    pub change: Change,
    pub deref: Deref,
}

impl RefEdit {
    fn classification(&self) -> Classification {
        name::classify(self.name.as_slice().into())
    }
}

/// Lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Open,
    Closed,
    Error,
}

/// Accumulates ref edits and commits them across the primary and files
/// backends.
pub struct Transaction<'a> {
    primary: &'a KvBackend,
    files: &'a FilesBackend,
    committer: &'a dyn Committer,
    state: State,
    edits: Vec<RefEdit>,
}

impl<'a> Transaction<'a> {
    pub fn begin(primary: &'a KvBackend, files: &'a FilesBackend, committer: &'a dyn Committer) -> Self {
        Transaction {
            primary,
            files,
            committer,
            state: State::Open,
            edits: Vec::new(),
        }
    }

    fn require_open(&self) {
        assert_eq!(self.state, State::Open, "BUG: transaction is not open");
    }

    /// Append an edit, validating its refname (`check_refname_format`).
    ///
    /// `HEAD` and the pseudorefs (`FETCH_HEAD`, ...) are single-component
    /// names, so one-level names are allowed for any ref the per-worktree/
    /// pseudoref classification already routes away from the hierarchical
    /// `refs/...` namespace (§3: "a name with only one component is
    /// rejected unless one-level is allowed").
    pub fn update(&mut self, name: impl Into<BString>, change: Change, deref: Deref) -> Result<(), Error> {
        self.require_open();
        let name = name.into();
        let flags = match name::classify(name.as_slice().into()) {
            Classification::PerWorktree | Classification::Pseudoref => name::Flags::ALLOW_ONELEVEL,
            Classification::Normal => name::Flags::empty(),
        };
        name::check(name.as_slice().into(), flags).map_err(|_| Error::BadName(name.clone()))?;
        self.edits.push(RefEdit { name, change, deref });
        Ok(())
    }

    pub fn create(&mut self, name: impl Into<BString>, new: ObjectId, log: LogChange) -> Result<(), Error> {
        self.update(
            name,
            Change::Update {
                new: Target::Direct(new),
                expected: PreviousValue::MustNotExist,
                log,
            },
            Deref::Yes,
        )
    }

    pub fn delete(&mut self, name: impl Into<BString>, expected: PreviousValue) -> Result<(), Error> {
        self.update(name, Change::Delete { expected }, Deref::Yes)
    }

    pub fn verify(&mut self, name: impl Into<BString>, expected: PreviousValue) -> Result<(), Error> {
        self.update(name, Change::Verify { expected }, Deref::Yes)
    }

    /// Discard all accumulated state. Safe to call on a transaction in any
    /// state, any number of times.
    pub fn free(&mut self) {
        self.edits.clear();
        self.state = State::Closed;
    }

    /// Dereference symbolic refs, partition into primary/files edit lists,
    /// and commit each partition in turn.
    pub fn commit(mut self) -> Result<(), Error> {
        if self.state != State::Open {
            return Err(Error::Generic("transaction is not open".into()));
        }

        let dereferenced = match self.dereference_symrefs() {
            Ok(edits) => edits,
            Err(e) => {
                self.state = State::Error;
                return Err(e);
            }
        };

        let (primary_edits, files_edits): (Vec<_>, Vec<_>) = dereferenced
            .into_iter()
            .partition(|e| e.classification() == Classification::Normal);

        check_duplicates(&primary_edits)?;
        check_duplicates(&files_edits)?;

        if let Err(e) = self.primary.commit(&primary_edits, self.committer) {
            self.state = State::Error;
            return Err(e);
        }

        if let Err(e) = self.files.commit(&files_edits) {
            self.state = State::Error;
            log::warn!(
                "primary backend committed {} update(s) but the files backend failed to commit {} update(s); repository refs are now split",
                primary_edits.len(),
                files_edits.len()
            );
            return Err(Error::SplitTransactionPartial { source: Box::new(e) });
        }

        self.state = State::Closed;
        Ok(())
    }

    /// For every edit whose `deref` is `Yes`, resolve through symbolic
    /// pointers and, when the chain does not terminate immediately at the
    /// named ref, append a follow-up edit for the underlying ref and
    /// downgrade the original to a log-only, no-CAS marker.
    fn dereference_symrefs(&self) -> Result<Vec<RefEdit>, Error> {
        let mut out = Vec::with_capacity(self.edits.len());
        for edit in &self.edits {
            if edit.deref != Deref::Yes {
                out.push(edit.clone());
                continue;
            }
            let target = match self.read_current(edit.name.as_slice().into())? {
                Some(Target::Symbolic(target)) => target,
                _ => {
                    out.push(edit.clone());
                    continue;
                }
            };
            match &edit.change {
                Change::Update { new, log, expected } => {
                    // Write the underlying ref for real, carrying the caller's
                    // CAS condition along; the symref itself only gains a
                    // reflog entry recording the same transition.
                    out.push(RefEdit {
                        name: target.clone(),
                        change: Change::Update {
                            new: new.clone(),
                            expected: expected.clone(),
                            log: log.clone(),
                        },
                        deref: Deref::No,
                    });
                    out.push(RefEdit {
                        name: edit.name.clone(),
                        change: Change::Update {
                            new: new.clone(),
                            expected: PreviousValue::Any,
                            log: LogChange {
                                mode: RefLog::Only,
                                force_create_reflog: log.force_create_reflog,
                                message: log.message.clone(),
                            },
                        },
                        deref: Deref::No,
                    });
                }
                Change::Delete { .. } | Change::Verify { .. } => {
                    let mut underlying = edit.clone();
                    underlying.name = target;
                    underlying.deref = Deref::No;
                    out.push(underlying);
                }
            }
        }
        Ok(out)
    }

    fn read_current(&self, name: &bstr::BStr) -> Result<Option<Target>, Error> {
        read_any(self.primary, self.files, name)
    }
}

/// Verify that `current` satisfies `expected`, the compare-and-swap
/// condition attached to an edit.
pub(crate) fn check_previous_value(current: Option<&Target>, expected: &PreviousValue, name: &bstr::BStr) -> Result<(), Error> {
    match expected {
        PreviousValue::Any => Ok(()),
        PreviousValue::MustExist => {
            if current.is_some() {
                Ok(())
            } else {
                Err(Error::NotFound(name.to_owned()))
            }
        }
        PreviousValue::MustNotExist => {
            if current.is_none() {
                Ok(())
            } else {
                Err(Error::Generic(format!("'{}' exists; cannot create", name)))
            }
        }
        PreviousValue::MustExistAndMatch(expected_id) => match current {
            Some(Target::Direct(actual)) if actual == expected_id => Ok(()),
            Some(Target::Direct(actual)) => Err(Error::UnexpectedValue {
                name: name.to_owned(),
                expected: *expected_id,
                actual: *actual,
            }),
            Some(Target::Symbolic(_)) => Err(Error::Broken(name.to_owned())),
            None => Err(Error::NotFound(name.to_owned())),
        },
    }
}

fn check_duplicates(edits: &[RefEdit]) -> Result<(), Error> {
    let mut names: Vec<&BString> = edits.iter().map(|e| &e.name).collect();
    names.sort();
    if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::DuplicateUpdate(w[0].clone()));
    }
    Ok(())
}

/// Read the raw, single-hop value of `name` from whichever backend owns it.
pub fn read_any(primary: &KvBackend, files: &FilesBackend, name: &bstr::BStr) -> Result<Option<Target>, Error> {
    match name::classify(name) {
        Classification::Normal => primary.read_raw(name).map_err(Error::from),
        Classification::PerWorktree | Classification::Pseudoref => files.read(name).map_err(Error::from),
    }
}

/// Follow symbolic pointers starting at `name` until a direct value is
/// found, the chain loops, or [`MAX_SYMREF_DEPTH`] hops are exceeded.
pub fn resolve(primary: &KvBackend, files: &FilesBackend, name: &bstr::BStr) -> Result<crate::backend::Resolved, Error> {
    let mut current = name.to_owned();
    for hop in 0..=MAX_SYMREF_DEPTH {
        match read_any(primary, files, current.as_slice().into())? {
            Some(Target::Direct(id)) => {
                return Ok(crate::backend::Resolved {
                    name: current,
                    id,
                    hop_count: hop,
                })
            }
            Some(Target::Symbolic(target)) => current = target,
            None => return Err(Error::NotFound(current)),
        }
    }
    Err(Error::Broken(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection_flags_repeated_names() {
        let edits = vec![
            RefEdit {
                name: "refs/heads/a".into(),
                change: Change::Verify {
                    expected: PreviousValue::Any,
                },
                deref: Deref::No,
            },
            RefEdit {
                name: "refs/heads/a".into(),
                change: Change::Verify {
                    expected: PreviousValue::Any,
                },
                deref: Deref::No,
            },
        ];
        assert!(matches!(check_duplicates(&edits), Err(Error::DuplicateUpdate(_))));
    }

    #[test]
    fn no_duplicates_is_ok() {
        let edits = vec![RefEdit {
            name: "refs/heads/a".into(),
            change: Change::Verify {
                expected: PreviousValue::Any,
            },
            deref: Deref::No,
        }];
        assert!(check_duplicates(&edits).is_ok());
    }
}
