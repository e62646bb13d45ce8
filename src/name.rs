//! Reference name grammar: validation, safety, and classification.
//!
//! Grounded in `check_refname_component`/`check_refname_format`/
//! `refname_is_safe`/`ref_type` from the reference C implementation this
//! crate reimplements (`refs.c`).

use bstr::{BStr, ByteSlice};

bitflags::bitflags! {
    /// Flags recognized by [`check`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Flags: u32 {
        /// Accept a refname with only a single path component (e.g. `HEAD`, `FETCH_HEAD`).
        const ALLOW_ONELEVEL = 1 << 0;
        /// Accept a single, bare `*` as a refspec pattern placeholder.
        const REFSPEC_PATTERN = 1 << 1;
    }
}

/// A refname fails the grammar of §3.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("invalid reference name")]
pub struct BadName;

/// How a character may appear within one `/`-separated refname component.
///
/// Mirrors the `refname_disposition` lookup table in `refs.c` exactly: most
/// ASCII is fine, control characters and a fixed set of punctuation are
/// always rejected, `.` and `@` need their neighbor checked to reject `..`
/// and `@{`, and `*` is conditionally accepted.
fn component_len(component: &BStr, flags: &mut Flags) -> Option<usize> {
    let mut last = 0u8;
    let mut end = component.len();
    for (i, &ch) in component.iter().enumerate() {
        if ch == b'/' {
            end = i;
            break;
        }
        let bad = matches!(ch, 0..=31 | b' ' | b'\t' | b':' | b'?' | b'[' | b'\\' | b'^' | b'~' | 127);
        if bad {
            return None;
        }
        if ch == b'.' && last == b'.' {
            return None; // ".."
        }
        if ch == b'{' && last == b'@' {
            return None; // "@{"
        }
        if ch == b'*' {
            if !flags.contains(Flags::REFSPEC_PATTERN) {
                return None;
            }
            // only a single asterisk is ever accepted
            flags.remove(Flags::REFSPEC_PATTERN);
        }
        last = ch;
    }
    if end == 0 {
        return Some(0); // zero-length component, rejected by the caller
    }
    if component[0] == b'.' {
        return None;
    }
    const LOCK_SUFFIX: &[u8] = b".lock";
    if end >= LOCK_SUFFIX.len() && &component[end - LOCK_SUFFIX.len()..end] == LOCK_SUFFIX {
        return None;
    }
    Some(end)
}

/// Validate `name` against the refname grammar.
pub fn check(name: &BStr, flags: Flags) -> Result<(), BadName> {
    if name == "@" {
        return Err(BadName);
    }

    let mut flags = flags;
    let mut rest = name;
    let mut component_count = 0usize;
    let mut last_component_len = 0usize;
    loop {
        let len = component_len(rest, &mut flags).ok_or(BadName)?;
        if len == 0 {
            return Err(BadName);
        }
        component_count += 1;
        last_component_len = len;
        if len == rest.len() {
            break;
        }
        rest = rest[len + 1..].as_ref();
    }

    if rest[last_component_len - 1] == b'.' {
        return Err(BadName); // ends with '.'
    }
    if !flags.contains(Flags::ALLOW_ONELEVEL) && component_count < 2 {
        return Err(BadName);
    }
    Ok(())
}

/// A refname is "safe" if a caller may delete it even though [`check`] fails —
/// needed to clean up refs that a corrupted store may have produced.
pub fn is_safe(name: &BStr) -> bool {
    if let Some(tail) = name.strip_prefix(b"refs/") {
        normalized_path_stays_within_root(tail.as_bstr())
    } else {
        name.iter().all(|&b| b.is_ascii_uppercase() || b == b'_')
    }
}

/// True iff lexically normalizing `tail` (resolving `.`/`..` components)
/// never escapes above the directory it started in — i.e. `foo/../bar` is
/// fine but `foo/../../bar` is not.
fn normalized_path_stays_within_root(tail: &BStr) -> bool {
    let mut depth: i64 = 0;
    for component in tail.split(|&b| b == b'/') {
        match component {
            b"" | b"." => {}
            b".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => depth += 1,
        }
    }
    true
}

/// Routing classification of a reference name, determining which backend
/// owns its primary storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    Normal,
    PerWorktree,
    Pseudoref,
}

/// Classify `name` for routing purposes (`ref_type` in `refs.c`).
pub fn classify(name: &BStr) -> Classification {
    if is_per_worktree(name) {
        Classification::PerWorktree
    } else if is_pseudoref_syntax(name) {
        Classification::Pseudoref
    } else {
        Classification::Normal
    }
}

fn is_per_worktree(name: &BStr) -> bool {
    name == "HEAD" || name.starts_with(b"refs/bisect/")
}

fn is_pseudoref_syntax(name: &BStr) -> bool {
    !name.is_empty() && name.iter().all(|&b| b.is_ascii_uppercase() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_onelevel(s: &str) -> Result<(), BadName> {
        check(s.into(), Flags::ALLOW_ONELEVEL)
    }

    #[test]
    fn accepts_normal_names() {
        assert!(check("refs/heads/main".into(), Flags::empty()).is_ok());
        assert!(check("refs/heads/feature/x".into(), Flags::empty()).is_ok());
    }

    #[test]
    fn rejects_at_alone() {
        assert_eq!(check_onelevel("@"), Err(BadName));
    }

    #[test]
    fn rejects_dotdot() {
        assert_eq!(check_onelevel("refs/heads/../x"), Err(BadName));
    }

    #[test]
    fn rejects_at_brace() {
        assert_eq!(check_onelevel("refs/heads/@{upstream}"), Err(BadName));
    }

    #[test]
    fn rejects_lock_suffix() {
        assert_eq!(check_onelevel("refs/heads/main.lock"), Err(BadName));
    }

    #[test]
    fn rejects_trailing_dot() {
        assert_eq!(check_onelevel("refs/heads/main."), Err(BadName));
    }

    #[test]
    fn rejects_one_component_without_flag() {
        assert_eq!(check("HEAD".into(), Flags::empty()), Err(BadName));
        assert!(check_onelevel("HEAD").is_ok());
    }

    #[test]
    fn accepts_single_star_as_pattern() {
        assert!(check("refs/heads/*".into(), Flags::REFSPEC_PATTERN).is_ok());
        assert!(check("refs/heads/*".into(), Flags::empty()).is_err());
    }

    #[test]
    fn rejects_double_star() {
        assert!(check("refs/heads/*/*".into(), Flags::REFSPEC_PATTERN).is_err());
    }

    #[test]
    fn safe_refs_prefixed_names() {
        assert!(is_safe("refs/heads/main".into()));
        assert!(is_safe("refs/foo/../bar".into()));
        assert!(!is_safe("refs/foo/../../bar".into()));
    }

    #[test]
    fn safe_uppercase_names() {
        assert!(is_safe("FETCH_HEAD".into()));
        assert!(is_safe("MERGE_HEAD".into()));
        assert!(!is_safe("not_all_upper".into()));
    }

    #[test]
    fn classifies_per_worktree_and_pseudoref() {
        assert_eq!(classify("HEAD".into()), Classification::PerWorktree);
        assert_eq!(classify("refs/bisect/bad".into()), Classification::PerWorktree);
        assert_eq!(classify("FETCH_HEAD".into()), Classification::Pseudoref);
        assert_eq!(classify("refs/heads/main".into()), Classification::Normal);
    }
}
