//! Log record types and their wire format.
//!
//! Every record starts with a fixed 20-byte header followed by a payload
//! whose layout depends on the record type:
//!
//! ```text
//! | size (4) | lsn (4) | txn_id (4) | prev_lsn (4) | type (4) | payload ... |
//! ```
//!
//! `size` covers the whole record, header included. Tuple images inside the
//! payload are encoded as `len (4) | bytes`. All integers are little endian.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::access::Rid;
use crate::storage::PageId;
use crate::transaction::TransactionId;

/// Log Sequence Number - a unique identifier for log records.
/// LSNs are monotonically increasing; 0 is reserved for "no record".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u32);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    /// Get the next LSN.
    pub fn next(&self) -> Self {
        Lsn(self.0 + 1)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// Discriminant stored in the `type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LogRecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Insert = 4,
    MarkDelete = 5,
    ApplyDelete = 6,
    RollbackDelete = 7,
    Update = 8,
    NewPage = 9,
    Clr = 10,
}

impl TryFrom<u32> for LogRecordType {
    type Error = LogDecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Begin,
            2 => Self::Commit,
            3 => Self::Abort,
            4 => Self::Insert,
            5 => Self::MarkDelete,
            6 => Self::ApplyDelete,
            7 => Self::RollbackDelete,
            8 => Self::Update,
            9 => Self::NewPage,
            10 => Self::Clr,
            other => return Err(LogDecodeError::UnknownType(other)),
        })
    }
}

impl fmt::Display for LogRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Insert => "INSERT",
            Self::MarkDelete => "MARK_DELETE",
            Self::ApplyDelete => "APPLY_DELETE",
            Self::RollbackDelete => "ROLLBACK_DELETE",
            Self::Update => "UPDATE",
            Self::NewPage => "NEW_PAGE",
            Self::Clr => "CLR",
        };
        f.write_str(name)
    }
}

/// Type-specific part of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordBody {
    Begin,
    Commit,
    Abort,
    /// A tuple was written into `rid`.
    Insert { rid: Rid, tuple: Vec<u8> },
    /// The tuple at `rid` was tombstoned.
    MarkDelete { rid: Rid, tuple: Vec<u8> },
    /// The tuple at `rid` was physically removed.
    ApplyDelete { rid: Rid, tuple: Vec<u8> },
    /// A tombstone at `rid` was cleared.
    RollbackDelete { rid: Rid, tuple: Vec<u8> },
    Update {
        rid: Rid,
        old_tuple: Vec<u8>,
        new_tuple: Vec<u8>,
    },
    /// A table page was initialised and linked after `prev_page_id`.
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
    /// Compensation for the record at `compensated_lsn`; undo resumes at
    /// `undo_next_lsn`.
    Clr {
        undo_next_lsn: Lsn,
        compensated_lsn: Lsn,
    },
}

impl LogRecordBody {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin => LogRecordType::Begin,
            Self::Commit => LogRecordType::Commit,
            Self::Abort => LogRecordType::Abort,
            Self::Insert { .. } => LogRecordType::Insert,
            Self::MarkDelete { .. } => LogRecordType::MarkDelete,
            Self::ApplyDelete { .. } => LogRecordType::ApplyDelete,
            Self::RollbackDelete { .. } => LogRecordType::RollbackDelete,
            Self::Update { .. } => LogRecordType::Update,
            Self::NewPage { .. } => LogRecordType::NewPage,
            Self::Clr { .. } => LogRecordType::Clr,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::Begin | Self::Commit | Self::Abort => 0,
            Self::Insert { tuple, .. }
            | Self::MarkDelete { tuple, .. }
            | Self::ApplyDelete { tuple, .. }
            | Self::RollbackDelete { tuple, .. } => Rid::SIZE + 4 + tuple.len(),
            Self::Update {
                old_tuple,
                new_tuple,
                ..
            } => Rid::SIZE + 8 + old_tuple.len() + new_tuple.len(),
            Self::NewPage { .. } | Self::Clr { .. } => 8,
        }
    }
}

/// Errors raised while decoding the wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogDecodeError {
    #[error("unknown log record type {0}")]
    UnknownType(u32),

    #[error("record size {size} is invalid")]
    InvalidSize { size: u32 },

    #[error("payload of {record_type} record is malformed")]
    Malformed { record_type: LogRecordType },
}

/// One entry of the write-ahead log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub prev_lsn: Lsn,
    pub body: LogRecordBody,
}

impl LogRecord {
    pub const HEADER_SIZE: usize = 20;

    /// Builds a record; its LSN is assigned when the log manager appends it.
    pub fn new(txn_id: TransactionId, prev_lsn: Lsn, body: LogRecordBody) -> Self {
        Self {
            lsn: Lsn::INVALID,
            txn_id,
            prev_lsn,
            body,
        }
    }

    pub fn record_type(&self) -> LogRecordType {
        self.body.record_type()
    }

    /// Encoded size in bytes, header included.
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.body.payload_size()
    }

    /// The record id touched by a data record.
    pub fn rid(&self) -> Option<Rid> {
        match &self.body {
            LogRecordBody::Insert { rid, .. }
            | LogRecordBody::MarkDelete { rid, .. }
            | LogRecordBody::ApplyDelete { rid, .. }
            | LogRecordBody::RollbackDelete { rid, .. }
            | LogRecordBody::Update { rid, .. } => Some(*rid),
            _ => None,
        }
    }

    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.size());
        buf.put_u32_le(self.size() as u32);
        buf.put_u32_le(self.lsn.0);
        buf.put_u32_le(self.txn_id.0);
        buf.put_u32_le(self.prev_lsn.0);
        buf.put_u32_le(self.record_type() as u32);

        match &self.body {
            LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort => {}
            LogRecordBody::Insert { rid, tuple }
            | LogRecordBody::MarkDelete { rid, tuple }
            | LogRecordBody::ApplyDelete { rid, tuple }
            | LogRecordBody::RollbackDelete { rid, tuple } => {
                buf.put_slice(&rid.to_bytes());
                put_tuple(buf, tuple);
            }
            LogRecordBody::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                buf.put_slice(&rid.to_bytes());
                put_tuple(buf, old_tuple);
                put_tuple(buf, new_tuple);
            }
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => {
                buf.put_u32_le(prev_page_id.0);
                buf.put_u32_le(page_id.0);
            }
            LogRecordBody::Clr {
                undo_next_lsn,
                compensated_lsn,
            } => {
                buf.put_u32_le(undo_next_lsn.0);
                buf.put_u32_le(compensated_lsn.0);
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.serialize_into(&mut buf);
        buf
    }

    /// Decodes the record at the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a record (the caller
    /// must read more, or has reached a torn tail), and the record together
    /// with its encoded size otherwise.
    pub fn deserialize(data: &[u8]) -> Result<Option<(LogRecord, usize)>, LogDecodeError> {
        if data.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &data[..Self::HEADER_SIZE];
        let size = header.get_u32_le();
        if (size as usize) < Self::HEADER_SIZE {
            return Err(LogDecodeError::InvalidSize { size });
        }
        if size as usize > data.len() {
            return Ok(None);
        }

        let lsn = Lsn(header.get_u32_le());
        let txn_id = TransactionId(header.get_u32_le());
        let prev_lsn = Lsn(header.get_u32_le());
        let record_type = LogRecordType::try_from(header.get_u32_le())?;

        let mut payload = &data[Self::HEADER_SIZE..size as usize];
        let malformed = LogDecodeError::Malformed { record_type };
        let body = match record_type {
            LogRecordType::Begin => LogRecordBody::Begin,
            LogRecordType::Commit => LogRecordBody::Commit,
            LogRecordType::Abort => LogRecordBody::Abort,
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let rid = get_rid(&mut payload).ok_or_else(|| malformed.clone())?;
                let tuple = get_tuple(&mut payload).ok_or_else(|| malformed.clone())?;
                match record_type {
                    LogRecordType::Insert => LogRecordBody::Insert { rid, tuple },
                    LogRecordType::MarkDelete => LogRecordBody::MarkDelete { rid, tuple },
                    LogRecordType::ApplyDelete => LogRecordBody::ApplyDelete { rid, tuple },
                    _ => LogRecordBody::RollbackDelete { rid, tuple },
                }
            }
            LogRecordType::Update => {
                let rid = get_rid(&mut payload).ok_or_else(|| malformed.clone())?;
                let old_tuple = get_tuple(&mut payload).ok_or_else(|| malformed.clone())?;
                let new_tuple = get_tuple(&mut payload).ok_or_else(|| malformed.clone())?;
                LogRecordBody::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if payload.remaining() < 8 {
                    return Err(malformed);
                }
                LogRecordBody::NewPage {
                    prev_page_id: PageId(payload.get_u32_le()),
                    page_id: PageId(payload.get_u32_le()),
                }
            }
            LogRecordType::Clr => {
                if payload.remaining() < 8 {
                    return Err(malformed);
                }
                LogRecordBody::Clr {
                    undo_next_lsn: Lsn(payload.get_u32_le()),
                    compensated_lsn: Lsn(payload.get_u32_le()),
                }
            }
        };

        if payload.has_remaining() {
            return Err(LogDecodeError::Malformed { record_type });
        }

        Ok(Some((
            LogRecord {
                lsn,
                txn_id,
                prev_lsn,
                body,
            },
            size as usize,
        )))
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} prev={} {}",
            self.lsn,
            self.txn_id,
            self.record_type(),
            self.prev_lsn,
            self.size()
        )?;
        match &self.body {
            LogRecordBody::Update {
                rid,
                old_tuple,
                new_tuple,
            } => write!(
                f,
                " rid={} old={}B new={}B",
                rid,
                old_tuple.len(),
                new_tuple.len()
            ),
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => write!(f, " page={} prev={}", page_id, prev_page_id),
            LogRecordBody::Clr {
                undo_next_lsn,
                compensated_lsn,
            } => write!(f, " undo_next={} compensates={}", undo_next_lsn, compensated_lsn),
            body => match self.rid() {
                Some(rid) => write!(f, " rid={} tuple={}B", rid, tuple_len(body)),
                None => Ok(()),
            },
        }
    }
}

fn tuple_len(body: &LogRecordBody) -> usize {
    match body {
        LogRecordBody::Insert { tuple, .. }
        | LogRecordBody::MarkDelete { tuple, .. }
        | LogRecordBody::ApplyDelete { tuple, .. }
        | LogRecordBody::RollbackDelete { tuple, .. } => tuple.len(),
        _ => 0,
    }
}

fn put_tuple(buf: &mut Vec<u8>, tuple: &[u8]) {
    buf.put_u32_le(tuple.len() as u32);
    buf.put_slice(tuple);
}

fn get_rid(buf: &mut &[u8]) -> Option<Rid> {
    if buf.remaining() < Rid::SIZE {
        return None;
    }
    let rid = Rid::from_bytes(&buf[..Rid::SIZE]);
    buf.advance(Rid::SIZE);
    Some(rid)
}

fn get_tuple(buf: &mut &[u8]) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let tuple = buf[..len].to_vec();
    buf.advance(len);
    Some(tuple)
}
