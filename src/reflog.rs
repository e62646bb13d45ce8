//! Reflog entry type and its on-wire line encoding.
//!
//! Grounded in `format_reflog_entry`/`read_ref_at_ent` from `refs.c`: a line
//! is `<old-hex> <new-hex> <committer> <ts> <tz>\t<message>\n`.

use bstr::{BStr, BString, ByteSlice};

use crate::object_id::ObjectId;

/// The minimum length, in bytes, of a well-formed reflog line: a line of
/// exactly 83 bytes parses, 82 does not.
pub const MIN_LINE_LEN: usize = 83;

/// Who performed a logged update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub name: BString,
    pub email: BString,
}

impl Identity {
    pub fn new(name: impl Into<BString>, email: impl Into<BString>) -> Self {
        Identity {
            name: name.into(),
            email: email.into(),
        }
    }

    fn write_with_email(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        out.push(b' ');
        out.push(b'<');
        out.extend_from_slice(&self.email);
        out.push(b'>');
    }
}

/// A single reflog entry: an (old, new, committer, timestamp, message) tuple.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub old: ObjectId,
    pub new: ObjectId,
    pub committer: Identity,
    /// Seconds since the epoch.
    pub timestamp_secs: i64,
    /// Signed offset in minutes east of UTC, e.g. -120 for `-0200`.
    pub tz_offset_minutes: i32,
    pub message: BString,
}

/// External clock and identity source consulted whenever a reflog entry is
/// written. Mirrors `committer_info`/`datestamp` in `refs.c`: the embedding
/// application supplies who is writing and what time it is, and this crate
/// never reads `$GIT_COMMITTER_*` or the system timezone database itself.
pub trait Committer {
    /// The identity to attribute an entry written right now to.
    fn identity(&self) -> Identity;
    /// Wall-clock time to record: seconds since the epoch, and the offset in
    /// minutes east of UTC to format alongside it.
    fn now(&self) -> (i64, i32);
    /// A nanosecond clock reading. Does not need to be monotonic itself —
    /// the backend bumps on collision — but must be close enough to wall
    /// time that reflog entries sort in the order they were written.
    fn now_nanos(&self) -> u64;
}

/// A [`Committer`] with a fixed identity and timezone offset, reading the
/// current wall-clock time from the system clock. Suitable for embedding
/// applications that already know the committer identity and local offset
/// (e.g. from their own configuration) and don't need per-call overrides.
#[derive(Clone, Debug)]
pub struct SystemCommitter {
    pub identity: Identity,
    pub tz_offset_minutes: i32,
}

impl SystemCommitter {
    pub fn new(identity: Identity, tz_offset_minutes: i32) -> Self {
        SystemCommitter {
            identity,
            tz_offset_minutes,
        }
    }
}

impl Committer for SystemCommitter {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn now(&self) -> (i64, i32) {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (secs, self.tz_offset_minutes)
    }

    fn now_nanos(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Collapse internal LFs/CRs to spaces and trim surrounding whitespace, the
/// way `format_reflog_entry` sanitizes a caller-supplied message.
fn sanitize_message(msg: &BStr) -> BString {
    let collapsed: BString = msg
        .iter()
        .map(|&b| if b == b'\n' || b == b'\r' { b' ' } else { b })
        .collect::<Vec<u8>>()
        .into();
    collapsed.trim().to_vec().into()
}

fn format_tz(offset_minutes: i32) -> String {
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let abs = offset_minutes.unsigned_abs();
    format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
}

fn parse_tz(raw: &[u8]) -> Option<i32> {
    if raw.len() != 5 {
        return None;
    }
    let sign = match raw[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = std::str::from_utf8(&raw[1..]).ok()?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hh: i32 = digits[0..2].parse().ok()?;
    let mm: i32 = digits[2..4].parse().ok()?;
    Some(sign * (hh * 60 + mm))
}

/// Produce the on-wire line form, including the trailing LF but not the NUL
/// terminator the backend adds when storing the value.
pub fn format_entry(old: ObjectId, new: ObjectId, committer: &Identity, timestamp_secs: i64, tz_offset_minutes: i32, message: &BStr) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_LINE_LEN + message.len());
    out.extend_from_slice(old.to_hex().as_bytes());
    out.push(b' ');
    out.extend_from_slice(new.to_hex().as_bytes());
    out.push(b' ');
    committer.write_with_email(&mut out);
    out.push(b' ');
    out.extend_from_slice(timestamp_secs.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(format_tz(tz_offset_minutes).as_bytes());
    out.push(b'\t');
    out.extend_from_slice(&sanitize_message(message));
    out.push(b'\n');
    out
}

/// Parse a single on-wire reflog line back into its fields.
pub fn parse_line(line: &BStr) -> Option<Entry> {
    if line.len() < MIN_LINE_LEN {
        return None;
    }
    if line.last() != Some(&b'\n') {
        return None;
    }
    let body = &line[..line.len() - 1];
    let tab_pos = body.find_byte(b'\t')?;
    let (header, message) = (&body[..tab_pos], &body[tab_pos + 1..]);

    let mut fields = header.split(|&b| b == b' ');
    let old = ObjectId::from_hex(fields.next()?).ok()?;
    let new = ObjectId::from_hex(fields.next()?).ok()?;

    // The committer occupies everything between the two object ids and the
    // trailing "<ts> <tz>" pair: "Name <email>".
    let rest: Vec<&[u8]> = fields.collect();
    if rest.len() < 3 {
        return None;
    }
    let tz_raw = rest[rest.len() - 1];
    let ts_raw = rest[rest.len() - 2];
    let committer_fields = &rest[..rest.len() - 2];
    let committer_str = committer_fields.join(&b' ');

    let email_start = committer_str.iter().position(|&b| b == b'<')?;
    let email_end = committer_str.iter().position(|&b| b == b'>')?;
    if email_end < email_start {
        return None;
    }
    let name = committer_str[..email_start].trim_end().to_vec();
    let email = committer_str[email_start + 1..email_end].to_vec();

    let timestamp_secs: i64 = std::str::from_utf8(ts_raw).ok()?.parse().ok()?;
    let tz_offset_minutes = parse_tz(tz_raw)?;

    Some(Entry {
        old,
        new,
        committer: Identity::new(name, email),
        timestamp_secs,
        tz_offset_minutes,
        message: message.to_vec().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> ObjectId {
        ObjectId::from_bytes([b; 20])
    }

    #[test]
    fn round_trips() {
        let committer = Identity::new("Ada Lovelace", "ada@example.com");
        let line = format_entry(id(0x11), id(0x22), &committer, 1_700_000_000, -120, "commit: add x".into());
        let parsed = parse_line(line.as_slice().as_bstr()).expect("parses");
        assert_eq!(parsed.old, id(0x11));
        assert_eq!(parsed.new, id(0x22));
        assert_eq!(parsed.committer, committer);
        assert_eq!(parsed.timestamp_secs, 1_700_000_000);
        assert_eq!(parsed.tz_offset_minutes, -120);
        assert_eq!(parsed.message.as_slice(), b"commit: add x");
    }

    #[test]
    fn formats_positive_tz() {
        assert_eq!(format_tz(330), "+0530");
        assert_eq!(format_tz(-60), "-0100");
        assert_eq!(format_tz(0), "+0000");
    }

    #[test]
    fn collapses_embedded_newlines() {
        let committer = Identity::new("A", "a@example.com");
        let line = format_entry(id(1), id(2), &committer, 0, 0, "line one\nline two\n".into());
        let parsed = parse_line(line.as_slice().as_bstr()).unwrap();
        assert_eq!(parsed.message.as_slice(), b"line one line two");
    }

    #[test]
    fn boundary_83_bytes_parses_82_does_not() {
        // "<40-hex> <40-hex> A <a@b> 0 +0000\t" is 40+1+40+1+1+1+5+1+1+1+5+1 = 98
        // bytes of fixed header; pad the message so the whole line lands on
        // the 83-byte boundary exactly, then one byte under it.
        let committer = Identity::new("A", "a@b");
        let header_only = format_entry(id(0), id(0), &committer, 0, 0, "".into());
        let fixed_len = header_only.len(); // includes the trailing \n, empty message
        assert!(fixed_len <= MIN_LINE_LEN);
        let pad = MIN_LINE_LEN - fixed_len;
        let message: String = "m".repeat(pad);

        let line = format_entry(id(0), id(0), &committer, 0, 0, message.as_str().into());
        assert_eq!(line.len(), MIN_LINE_LEN);
        assert!(parse_line(line.as_slice().as_bstr()).is_some());

        let short_message: String = "m".repeat(pad - 1);
        let too_short = format_entry(id(0), id(0), &committer, 0, 0, short_message.as_str().into());
        assert_eq!(too_short.len(), MIN_LINE_LEN - 1);
        assert!(parse_line(too_short.as_slice().as_bstr()).is_none());
    }

    #[test]
    fn rejects_missing_trailing_newline() {
        let committer = Identity::new("A", "a@b.com");
        let mut line = format_entry(id(0), id(0), &committer, 0, 0, "msg".into());
        line.pop();
        assert!(parse_line(line.as_slice().as_bstr()).is_none());
    }
}
