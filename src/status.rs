//! Binary status-block codec
//!
//! Every service keeps a `status` file in its supervise directory,
//! rewritten in full after every observable state change. External
//! readers poll it; there is no lock. The whole block goes out in a
//! single `pwrite` at offset 0, so readers on the same kernel see a
//! consistent snapshot; anything weaker is the reader's problem.
//!
//! Layout (all multi-byte fields big-endian):
//!
//! ```text
//! off  len  field
//! 0    8    last-change seconds since epoch (u64)
//! 8    4    last-change nanoseconds (u32)
//! 12   4    main process pid (u32, 0 if none)
//! 16   1    paused flag (0/1)
//! 17   1    activity code (0 none, 1 start, 2 run, 3 restart, 4 stop)
//! 18   1    pending command (ASCII byte, 0 if none)
//! 19   1    reserved, written as 0
//! 20   68   4 x 17-byte exit record, one per activity kind
//!           (start, run, restart, stop):
//!             kind u8 (0 running, 1 exited, 2 signalled, 3 signalled+core)
//!             code i32
//!             seconds u64, nanoseconds u32
//! ```

use crate::error::{Error, Result};
use crate::service::{Activity, Pending};
use std::time::{SystemTime, UNIX_EPOCH};

/// Total size of the encoded block
pub const STATUS_BLOCK_LEN: usize = 88;

/// Size of one encoded exit record
const RECORD_LEN: usize = 17;

/// Offset of the first exit record
const RECORDS_OFF: usize = 20;

/// Seconds + nanoseconds wall-clock label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    /// Current wall-clock label
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

/// How the process recorded in an exit slot left the process set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitKind {
    /// Neutral initial value: nothing has exited from this slot yet
    #[default]
    Running,
    /// Normal exit; `code` is the exit status
    Exited,
    /// Killed by a signal; `code` is the signal number
    Signalled,
    /// Killed by a signal and dumped core
    SignalledCore,
}

impl ExitKind {
    fn as_code(self) -> u8 {
        match self {
            ExitKind::Running => 0,
            ExitKind::Exited => 1,
            ExitKind::Signalled => 2,
            ExitKind::SignalledCore => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ExitKind::Running),
            1 => Ok(ExitKind::Exited),
            2 => Ok(ExitKind::Signalled),
            3 => Ok(ExitKind::SignalledCore),
            other => Err(Error::Status(format!("bad exit kind {}", other))),
        }
    }
}

/// One per-activity exit slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitRecord {
    pub kind: ExitKind,
    pub code: i32,
    pub stamp: Timestamp,
}

impl ExitRecord {
    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.kind.as_code();
        buf[1..5].copy_from_slice(&self.code.to_be_bytes());
        buf[5..13].copy_from_slice(&self.stamp.secs.to_be_bytes());
        buf[13..17].copy_from_slice(&self.stamp.nanos.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            kind: ExitKind::from_code(buf[0])?,
            code: i32::from_be_bytes(buf[1..5].try_into().unwrap()),
            stamp: Timestamp {
                secs: u64::from_be_bytes(buf[5..13].try_into().unwrap()),
                nanos: u32::from_be_bytes(buf[13..17].try_into().unwrap()),
            },
        })
    }
}

/// Decoded form of the whole status file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBlock {
    pub stamp: Timestamp,
    pub pid: u32,
    pub paused: bool,
    pub activity: Activity,
    pub pending: Pending,
    /// Indexed by activity kind: start, run, restart, stop
    pub records: [ExitRecord; 4],
}

impl StatusBlock {
    pub fn encode(&self) -> [u8; STATUS_BLOCK_LEN] {
        let mut buf = [0u8; STATUS_BLOCK_LEN];
        buf[0..8].copy_from_slice(&self.stamp.secs.to_be_bytes());
        buf[8..12].copy_from_slice(&self.stamp.nanos.to_be_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_be_bytes());
        buf[16] = self.paused as u8;
        buf[17] = self.activity.as_code();
        buf[18] = self.pending.as_byte();
        for (i, rec) in self.records.iter().enumerate() {
            let off = RECORDS_OFF + i * RECORD_LEN;
            rec.encode(&mut buf[off..off + RECORD_LEN]);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != STATUS_BLOCK_LEN {
            return Err(Error::Status(format!(
                "expected {} bytes, got {}",
                STATUS_BLOCK_LEN,
                buf.len()
            )));
        }
        let mut records = [ExitRecord::default(); 4];
        for (i, rec) in records.iter_mut().enumerate() {
            let off = RECORDS_OFF + i * RECORD_LEN;
            *rec = ExitRecord::decode(&buf[off..off + RECORD_LEN])?;
        }
        Ok(Self {
            stamp: Timestamp {
                secs: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
                nanos: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            },
            pid: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            paused: match buf[16] {
                0 => false,
                1 => true,
                other => return Err(Error::Status(format!("bad pause flag {}", other))),
            },
            activity: Activity::from_code(buf[17])
                .ok_or_else(|| Error::Status(format!("bad activity code {}", buf[17])))?,
            pending: Pending::from_byte(buf[18])
                .ok_or_else(|| Error::Status(format!("bad pending byte {}", buf[18])))?,
            records,
        })
    }
}
