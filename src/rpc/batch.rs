//! Batch RPC control block
//!
//! Collects record operations of one kind destined for a set of machines,
//! encodes them once into a shared buffer, sends that buffer to every target
//! and gathers the reply items back by index.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::error::Result;
use crate::network::Cluster;

use super::codec::{decode_reply, encode_request, ReplyItem, RequestEntry};
use super::RpcKind;

/// Transient state of one batched round trip
#[derive(Debug)]
pub struct BatchOp {
    kind: RpcKind,
    macs: BTreeSet<u8>,
    entries: Vec<RequestEntry>,
}

impl BatchOp {
    pub fn new(kind: RpcKind) -> Self {
        Self {
            kind,
            macs: BTreeSet::new(),
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> RpcKind {
        self.kind
    }

    /// Queue an entry; its pid joins the target set
    pub fn add_entry(&mut self, entry: RequestEntry) {
        self.macs.insert(entry.pid);
        self.entries.push(entry);
    }

    pub fn macs(&self) -> &BTreeSet<u8> {
        &self.macs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The shared request buffer
    pub fn encode(&self) -> Result<Bytes> {
        encode_request(self.kind, &self.entries)
    }

    /// Send the batch to every target and collect all reply items
    ///
    /// Suspends once per target machine.
    pub async fn send(self, cluster: &Cluster) -> Result<Vec<ReplyItem>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let request = self.encode()?;

        let mut items = Vec::with_capacity(self.entries.len());
        for mac in &self.macs {
            let reply = cluster.rpc(*mac, request.clone()).await?;
            items.extend(decode_reply(&reply)?);
        }
        Ok(items)
    }
}
