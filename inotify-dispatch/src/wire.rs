//! Decoder for the kernel's `struct inotify_event` byte stream.
//!
//! A buffer holds back-to-back records, each a fixed header
//! `{wd: i32, mask: u32, cookie: u32, len: u32}` in native byte order followed
//! by `len` bytes of NUL-padded name. `len` is zero when the record carries no
//! name, in which case the next header follows immediately.

use std::ffi::{OsStr, OsString};

use crate::error::{Result, WatchError};
use crate::event::{EventMask, RawEvent, WatchDescriptor};

/// Size of the fixed record header.
pub const HEADER_SIZE: usize = 16;

/// Lazily decodes the records of one buffer.
///
/// Yields an error and stops if a header or name runs past the end of the
/// buffer.
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    /// Iterate over the records in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }

    /// Byte offset of the next record.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn truncated(&mut self, what: &str) -> WatchError {
        self.failed = true;
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("truncated {what} at offset {}", self.offset),
        )
        .into()
    }
}

impl Iterator for Records<'_> {
    type Item = Result<RawEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let buf = self.buf;
        let rest = &buf[self.offset..];
        let Some(header) = rest.get(..HEADER_SIZE) else {
            return Some(Err(self.truncated("record header")));
        };

        let wd = i32::from_ne_bytes(word(header, 0));
        let mask = u32::from_ne_bytes(word(header, 4));
        let cookie = u32::from_ne_bytes(word(header, 8));
        let len = u32::from_ne_bytes(word(header, 12)) as usize;

        let name = if len == 0 {
            None
        } else {
            let Some(raw_name) = rest.get(HEADER_SIZE..HEADER_SIZE + len) else {
                return Some(Err(self.truncated("record name")));
            };
            let end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
            Some(os_name(&raw_name[..end]))
        };

        self.offset += HEADER_SIZE + len;

        Some(Ok(RawEvent {
            wd: WatchDescriptor::new(wd),
            mask: EventMask::from_bits_retain(mask),
            cookie,
            name,
        }))
    }
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> OsString {
    use std::os::unix::ffi::OsStrExt;
    OsStr::from_bytes(bytes).to_os_string()
}

#[cfg(not(unix))]
fn os_name(bytes: &[u8]) -> OsString {
    String::from_utf8_lossy(bytes).into_owned().into()
}

fn word(header: &[u8], at: usize) -> [u8; 4] {
    [header[at], header[at + 1], header[at + 2], header[at + 3]]
}

/// Decode every record in `buf`.
pub fn decode(buf: &[u8]) -> Result<Vec<RawEvent>> {
    Records::new(buf).collect()
}

/// Encode one record, padding the name with NULs to a multiple of the header
/// alignment the way the kernel does.
pub fn encode(event: &RawEvent, out: &mut Vec<u8>) {
    let name = event.name.as_deref().map_or(&[][..], OsStr::as_encoded_bytes);
    let len = if name.is_empty() {
        0
    } else {
        (name.len() + 1).next_multiple_of(HEADER_SIZE)
    };

    out.extend_from_slice(&event.wd.raw().to_ne_bytes());
    out.extend_from_slice(&event.mask.bits().to_ne_bytes());
    out.extend_from_slice(&event.cookie.to_ne_bytes());
    out.extend_from_slice(&(len as u32).to_ne_bytes());
    if len != 0 {
        out.extend_from_slice(name);
        out.resize(out.len() + len - name.len(), 0);
    }
}

/// Encode several records into one buffer.
pub fn encode_all<'a>(events: impl IntoIterator<Item = &'a RawEvent>) -> Vec<u8> {
    let mut out = Vec::new();
    for event in events {
        encode(event, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header(wd: i32, mask: u32, cookie: u32, len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&wd.to_ne_bytes());
        out.extend_from_slice(&mask.to_ne_bytes());
        out.extend_from_slice(&cookie.to_ne_bytes());
        out.extend_from_slice(&len.to_ne_bytes());
        out
    }

    #[test]
    fn test_decode_concatenated_records() {
        let mut buf = header(1, EventMask::CREATE.bits(), 0, 16);
        buf.extend_from_slice(b"c.txt\0\0\0\0\0\0\0\0\0\0\0");
        buf.extend(header(1, EventMask::DELETE_SELF.bits(), 0, 0));
        buf.extend(header(2, EventMask::MOVED_FROM.bits(), 42, 32));
        let mut name = b"a-much-longer-file-name.bin".to_vec();
        name.resize(32, 0);
        buf.extend(name);

        let events = decode(&buf).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name.as_deref(), Some(OsStr::new("c.txt")));
        assert_eq!(events[0].mask, EventMask::CREATE);
        assert_eq!(events[1].name, None);
        assert_eq!(events[1].mask, EventMask::DELETE_SELF);
        assert_eq!(events[2].wd, WatchDescriptor::new(2));
        assert_eq!(events[2].cookie, 42);
        assert_eq!(events[2].name.as_deref(), Some(OsStr::new("a-much-longer-file-name.bin")));
    }

    #[test]
    fn test_offset_advances_by_header_and_name() {
        let mut buf = header(5, EventMask::MODIFY.bits(), 0, 16);
        buf.extend_from_slice(&[b'x'; 16]);
        buf.extend(header(5, EventMask::OPEN.bits(), 0, 0));

        let mut records = Records::new(&buf);
        let first = records.next().unwrap().unwrap();
        // A name filling its whole slot has no terminator.
        assert_eq!(first.name.as_deref(), Some(OsStr::new("xxxxxxxxxxxxxxxx")));
        assert_eq!(records.offset(), HEADER_SIZE + 16);
        records.next().unwrap().unwrap();
        assert_eq!(records.offset(), buf.len());
        assert!(records.next().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = header(1, EventMask::CREATE.bits(), 0, 0);
        buf.extend_from_slice(&[0, 0, 0]);
        let err = decode(&buf).unwrap_err();
        assert!(err.to_string().contains("truncated record header at offset 16"));
    }

    #[test]
    fn test_truncated_name() {
        let mut buf = header(1, EventMask::CREATE.bits(), 0, 16);
        buf.extend_from_slice(b"short");
        let mut records = Records::new(&buf);
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }

    #[test]
    fn test_unknown_bits_are_retained() {
        let buf = header(1, 0x0400_0000 | EventMask::CREATE.bits(), 0, 0);
        let events = decode(&buf).unwrap();
        assert_eq!(events[0].mask.bits(), 0x0400_0000 | EventMask::CREATE.bits());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_preserved() {
        use std::os::unix::ffi::OsStrExt;

        let raw = b"caf\xe9.txt";
        let mut buf = header(1, EventMask::CREATE.bits(), 0, 16);
        let mut name = raw.to_vec();
        name.resize(16, 0);
        buf.extend(name);

        let events = decode(&buf).unwrap();
        assert_eq!(events[0].name.as_deref().map(OsStr::as_bytes), Some(&raw[..]));
        assert_eq!(encode_all(&events), buf);
    }

    #[test]
    fn test_encode_pads_names() {
        let event = RawEvent::new(WatchDescriptor::new(9), EventMask::CREATE).with_name("y");
        let buf = encode_all([&event]);
        assert_eq!(buf.len(), HEADER_SIZE + 16);
        assert_eq!(decode(&buf).unwrap(), vec![event]);
    }
}
