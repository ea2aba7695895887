//! RPC kinds and reply status codes

use crate::error::{Result, RtxError};

/// Operation requested by a batched RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcKind {
    // record access
    Lookup = 0x01,
    Read = 0x02,

    // OCC
    OccLock = 0x10,
    OccValidate = 0x11,
    OccCommit = 0x12,
    OccRelease = 0x13,

    // NOWAIT
    NowaitLockRead = 0x20,
    NowaitLockWrite = 0x21,
    NowaitCommit = 0x22,
    NowaitRelease = 0x23,

    // MVCC
    MvccRead = 0x30,
    MvccLock = 0x31,
    MvccCommit = 0x32,
    MvccRelease = 0x33,

    // Sundial
    SundialRead = 0x40,
    SundialLock = 0x41,
    SundialRenew = 0x42,
    SundialUpdate = 0x43,
    SundialRelease = 0x44,

    // commit coordination
    LogAppend = 0x50,
    LogAck = 0x51,
    Prepare = 0x52,
    Decide = 0x53,

    // Calvin
    CalvinForward = 0x60,
}

impl TryFrom<u8> for RpcKind {
    type Error = RtxError;

    fn try_from(value: u8) -> Result<Self> {
        let kind = match value {
            0x01 => RpcKind::Lookup,
            0x02 => RpcKind::Read,
            0x10 => RpcKind::OccLock,
            0x11 => RpcKind::OccValidate,
            0x12 => RpcKind::OccCommit,
            0x13 => RpcKind::OccRelease,
            0x20 => RpcKind::NowaitLockRead,
            0x21 => RpcKind::NowaitLockWrite,
            0x22 => RpcKind::NowaitCommit,
            0x23 => RpcKind::NowaitRelease,
            0x30 => RpcKind::MvccRead,
            0x31 => RpcKind::MvccLock,
            0x32 => RpcKind::MvccCommit,
            0x33 => RpcKind::MvccRelease,
            0x40 => RpcKind::SundialRead,
            0x41 => RpcKind::SundialLock,
            0x42 => RpcKind::SundialRenew,
            0x43 => RpcKind::SundialUpdate,
            0x44 => RpcKind::SundialRelease,
            0x50 => RpcKind::LogAppend,
            0x51 => RpcKind::LogAck,
            0x52 => RpcKind::Prepare,
            0x53 => RpcKind::Decide,
            0x60 => RpcKind::CalvinForward,
            other => {
                return Err(RtxError::Protocol(format!(
                    "Unknown rpc kind: 0x{:02x}",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

/// Per-item reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Operation succeeded
    Ok = 0x00,
    /// Key not present on the target
    NotFound = 0x01,
    /// Lock held, version changed or lease refused
    Conflict = 0x02,
    /// Request could not be applied (bad length, bad slot)
    Invalid = 0x03,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

impl TryFrom<u8> for Status {
    type Error = RtxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::NotFound),
            0x02 => Ok(Status::Conflict),
            0x03 => Ok(Status::Invalid),
            other => Err(RtxError::Protocol(format!(
                "Unknown reply status: 0x{:02x}",
                other
            ))),
        }
    }
}
