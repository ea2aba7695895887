//! RPC Module
//!
//! Batched request/reply messages exchanged between machines when an
//! operation does not use one-sided verbs.
//!
//! ## Flow
//! 1. Protocol code fills a [`BatchOp`] with [`RequestEntry`]s
//! 2. The shared buffer goes to every machine in the batch
//! 3. Each machine's service handles the entries addressed to it
//! 4. Reply items come back tagged with the caller's set index

mod batch;
pub mod codec;
mod kind;

pub use batch::BatchOp;
pub use codec::{decode_reply, decode_request, encode_reply, encode_request, ReplyItem, Request, RequestEntry};
pub use kind::{RpcKind, Status};
