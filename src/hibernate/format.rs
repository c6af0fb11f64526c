#![forbid(unsafe_code)]

//! Save-file record codec.
//!
//! A save-file is a flat stream of tagged records:
//!
//! ```text
//! 'd' u32 len, len bytes UTF-8     database name (first record only)
//! 'r' u32                          physical object id
//! 'f' u32                          fork number
//! 'b' u32                          page number
//! 'N' u32                          count of pages following the last 'b'
//! ```
//!
//! Integers are big-endian. The codec knows nothing about nesting; the
//! writer produces well-nested streams and the replayer rejects ill-nested
//! ones.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::types::{ForkNumber, ObjectId, PageNo};

/// Tag of the database-name record.
pub const TAG_DATABASE: u8 = b'd';
/// Tag of the object record.
pub const TAG_OBJECT: u8 = b'r';
/// Tag of the fork record.
pub const TAG_FORK: u8 = b'f';
/// Tag of the page record.
pub const TAG_PAGE: u8 = b'b';
/// Tag of the range record.
pub const TAG_RANGE: u8 = b'N';

/// Longest database name accepted on decode.
pub const MAX_NAME_LEN: usize = 1024;

const PAYLOAD_LEN: usize = core::mem::size_of::<u32>();

// Page numbers and range counts share the fixed payload width.
const _: () = assert!(core::mem::size_of::<PageNo>() == PAYLOAD_LEN);

/// One decoded save-file record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Logical database name; empty for the global-objects file.
    DatabaseName(String),
    /// Starts a new object group.
    Object(ObjectId),
    /// Starts a new fork within the current object.
    Fork(ForkNumber),
    /// A single resident page.
    Page(PageNo),
    /// Number of consecutive pages directly after the last page record.
    Range(u32),
}

impl Record {
    /// Returns the on-disk tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Record::DatabaseName(_) => TAG_DATABASE,
            Record::Object(_) => TAG_OBJECT,
            Record::Fork(_) => TAG_FORK,
            Record::Page(_) => TAG_PAGE,
            Record::Range(_) => TAG_RANGE,
        }
    }

    /// Appends the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Record::DatabaseName(name) => {
                out.extend_from_slice(&(name.len() as u32).to_be_bytes());
                out.extend_from_slice(name.as_bytes());
            }
            Record::Object(id) => out.extend_from_slice(&id.0.to_be_bytes()),
            Record::Fork(fork) => out.extend_from_slice(&fork.0.to_be_bytes()),
            Record::Page(page) => out.extend_from_slice(&page.0.to_be_bytes()),
            Record::Range(count) => out.extend_from_slice(&count.to_be_bytes()),
        }
    }

    /// Writes the encoded record to `dst`.
    pub fn write_to<W: Write>(&self, dst: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(1 + PAYLOAD_LEN);
        self.encode(&mut buf);
        dst.write_all(&buf)
    }
}

/// Encodes a database-name record.
pub fn encode_database_name(name: &str) -> Vec<u8> {
    encoded(Record::DatabaseName(name.to_owned()))
}

/// Encodes an object record.
pub fn encode_object(id: ObjectId) -> Vec<u8> {
    encoded(Record::Object(id))
}

/// Encodes a fork record.
pub fn encode_fork(fork: ForkNumber) -> Vec<u8> {
    encoded(Record::Fork(fork))
}

/// Encodes a page record.
pub fn encode_page(page: PageNo) -> Vec<u8> {
    encoded(Record::Page(page))
}

/// Encodes a range record.
pub fn encode_range(count: u32) -> Vec<u8> {
    encoded(Record::Range(count))
}

fn encoded(record: Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + PAYLOAD_LEN);
    record.encode(&mut out);
    out
}

/// Decode failure. Offsets are byte positions of the failing record's tag.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The tag byte is not one of the known record tags.
    #[error("unexpected record tag {tag:#04x} at byte {offset}")]
    UnknownTag {
        /// Tag byte read.
        tag: u8,
        /// Offset of the tag.
        offset: u64,
    },
    /// The stream ended inside a record payload.
    #[error("truncated record with tag {tag:#04x} at byte {offset}")]
    Truncated {
        /// Tag of the incomplete record.
        tag: u8,
        /// Offset of the tag.
        offset: u64,
    },
    /// The database name is too long or not UTF-8.
    #[error("invalid database name at byte {offset}: {reason}")]
    BadName {
        /// Offset of the tag.
        offset: u64,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// Underlying read failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FormatError {
    /// Byte offset of the failing record, when known.
    pub fn offset(&self) -> Option<u64> {
        match self {
            FormatError::UnknownTag { offset, .. }
            | FormatError::Truncated { offset, .. }
            | FormatError::BadName { offset, .. } => Some(*offset),
            FormatError::Io(_) => None,
        }
    }
}

/// Streaming record decoder.
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> RecordReader<R> {
    /// Wraps a byte stream positioned at the start of a record.
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Offset of the next record to be decoded.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Consumes the decoder, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Decodes the next record, returning `None` on a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<Record>, FormatError> {
        let start = self.offset;
        let mut tag = [0u8; 1];
        loop {
            match self.inner.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FormatError::Io(err)),
            }
        }
        let tag = tag[0];
        let record = match tag {
            TAG_DATABASE => {
                let len = self.read_u32(tag, start)? as usize;
                if len > MAX_NAME_LEN {
                    return Err(FormatError::BadName {
                        offset: start,
                        reason: "name too long",
                    });
                }
                let mut bytes = vec![0u8; len];
                self.read_payload(&mut bytes, tag, start)?;
                let name = String::from_utf8(bytes).map_err(|_| FormatError::BadName {
                    offset: start,
                    reason: "name is not valid UTF-8",
                })?;
                Record::DatabaseName(name)
            }
            TAG_OBJECT => Record::Object(ObjectId(self.read_u32(tag, start)?)),
            TAG_FORK => Record::Fork(ForkNumber(self.read_u32(tag, start)?)),
            TAG_PAGE => Record::Page(PageNo(self.read_u32(tag, start)?)),
            TAG_RANGE => Record::Range(self.read_u32(tag, start)?),
            other => {
                return Err(FormatError::UnknownTag {
                    tag: other,
                    offset: start,
                })
            }
        };
        self.offset = start + 1 + payload_len(&record) as u64;
        Ok(Some(record))
    }

    fn read_u32(&mut self, tag: u8, start: u64) -> Result<u32, FormatError> {
        let mut buf = [0u8; PAYLOAD_LEN];
        self.read_payload(&mut buf, tag, start)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_payload(&mut self, dst: &mut [u8], tag: u8, start: u64) -> Result<(), FormatError> {
        self.inner.read_exact(dst).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                FormatError::Truncated { tag, offset: start }
            } else {
                FormatError::Io(err)
            }
        })
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn payload_len(record: &Record) -> usize {
    match record {
        Record::DatabaseName(name) => PAYLOAD_LEN + name.len(),
        _ => PAYLOAD_LEN,
    }
}

/// Decodes the next record from `src`.
///
/// Offsets reported in errors are relative to the current stream position.
pub fn decode_next<R: Read>(src: &mut R) -> Result<Option<Record>, FormatError> {
    RecordReader::new(src).next_record()
}
