//! Key encoding for the single flat KV keyspace, grounded in the
//! `sprintf(key.mv_data, "logs/%s", …)` call sites throughout
//! `refs-be-lmdb.c`.

use bstr::BStr;

pub const LOGS_PREFIX: &[u8] = b"logs/";

/// `<refname>\0` — the key under which a reference's value is stored.
pub fn ref_key(name: &BStr) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1);
    key.extend_from_slice(name);
    key.push(0);
    key
}

/// `logs/<refname>\0` — both the reflog existence header key and the prefix
/// every entry key for this ref is built from.
pub fn reflog_header_key(name: &BStr) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOGS_PREFIX.len() + name.len() + 1);
    key.extend_from_slice(LOGS_PREFIX);
    key.extend_from_slice(name);
    key.push(0);
    key
}

/// `logs/<refname>\0<8-byte big-endian timestamp-ns>` — one reflog entry.
pub fn reflog_entry_key(name: &BStr, timestamp_ns: u64) -> Vec<u8> {
    let mut key = reflog_header_key(name);
    key.extend_from_slice(&timestamp_ns.to_be_bytes());
    key
}

/// True iff `key` is exactly the reflog existence header — `header_len`
/// bytes, no appended timestamp — rather than a dated entry.
///
/// Distinguished explicitly by length rather than by skipping the first row
/// a range scan returns: a scan seeded with `SEEK_RANGE` on the header
/// prefix yields the header itself as its first hit, and silently skipping
/// "whatever comes first" would also skip a ref's oldest entry whenever its
/// reflog has no header (which this store never produces, but must not
/// assume of data written by another implementation).
pub fn is_reflog_header(key: &[u8], header_len: usize) -> bool {
    key.len() == header_len
}

/// Extract the big-endian timestamp suffix from a reflog entry key, given
/// the length of its header prefix.
pub fn entry_timestamp(key: &[u8], header_len: usize) -> Option<u64> {
    if key.len() != header_len + 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[header_len..]);
    Some(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::ByteSlice;

    #[test]
    fn header_key_is_distinguishable_from_entries() {
        let name: &BStr = "refs/heads/main".into();
        let header = reflog_header_key(name);
        assert!(is_reflog_header(&header, header.len()));
        let entry = reflog_entry_key(name, 42);
        assert!(!is_reflog_header(&entry, header.len()));
        assert_eq!(entry_timestamp(&entry, header.len()), Some(42));
    }

    #[test]
    fn ref_keys_sort_so_prefix_relation_holds() {
        let a = ref_key("foo".into());
        let b = ref_key("foo/bar".into());
        assert!(a < b, "foo\\0 must sort before foo/bar\\0");
    }
}
