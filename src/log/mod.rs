//! Remote Log Module
//!
//! Durability for committed write sets through replication to backup machines.
//!
//! ## Responsibilities
//! - Encode write sets with LSN and CRC32 checksums
//! - Append to the log rings of backups (one-sided or RPC)
//! - Acknowledge durability before writes are applied
//! - Let a backup scan and verify its ring
//!
//! ## Ring Format
//! ```text
//! ┌──────────┬─────────────────────────────────────────┐
//! │ Tail (8) │ Slot 0 │ Slot 1 │ ... │ Slot N-1        │
//! └──────────┴─────────────────────────────────────────┘
//!
//! Slot:
//! ┌─────────┬─────────┬────────┬────────┬─────────┐
//! │ LSN (8) │ CRC (4) │Len (4) │ Data   │ (unused)│
//! └─────────┴─────────┴────────┴────────┴─────────┘
//! ```

mod entry;
mod logger;
mod reader;

pub use entry::{LogEntry, LogRecord, LoggedWrite, HEADER_SIZE};
pub use logger::{append_local, RemoteLogger};
pub use reader::{LogReader, LogScan};
