//! Codec Tests
//!
//! Tests for batched request and reply encoding, and for batches served by
//! the machines they address.

use bytes::Bytes;
use rtxkv::rpc::codec::{
    ENTRY_HEADER_SIZE, ITEM_HEADER_SIZE, MAX_PAYLOAD_SIZE, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE,
};
use rtxkv::rpc::{
    decode_reply, decode_request, encode_reply, encode_request, BatchOp, ReplyItem, RequestEntry,
    RpcKind, Status,
};
use rtxkv::{Cluster, Config, RtxError};

// =============================================================================
// Request Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_request() {
    let entries = vec![
        RequestEntry::new(1, 3, 42, 8, 0).args(7, 9),
        RequestEntry::new(2, 3, 43, 16, 5).payload(vec![0xAB; 16]),
    ];
    let encoded = encode_request(RpcKind::OccCommit, &entries).unwrap();
    assert_eq!(
        encoded.len(),
        REQUEST_HEADER_SIZE + 2 * ENTRY_HEADER_SIZE + 16
    );

    let decoded = decode_request(&encoded).unwrap();
    assert_eq!(decoded.kind, RpcKind::OccCommit);
    assert_eq!(decoded.entries, entries);
    assert_eq!(decoded.entries[0].arg0, 7);
    assert_eq!(decoded.entries[0].arg1, 9);
    assert_eq!(decoded.entries[1].idx, 5);
    assert_eq!(decoded.entries[1].len, 16);
}

#[test]
fn test_empty_request() {
    let encoded = encode_request(RpcKind::Decide, &[]).unwrap();
    assert_eq!(encoded.len(), REQUEST_HEADER_SIZE);
    let decoded = decode_request(&encoded).unwrap();
    assert_eq!(decoded.kind, RpcKind::Decide);
    assert!(decoded.entries.is_empty());
}

#[test]
fn test_unknown_kind_rejected() {
    let mut encoded = encode_request(RpcKind::Read, &[]).unwrap().to_vec();
    encoded[0] = 0xEE;
    assert!(matches!(
        decode_request(&encoded),
        Err(RtxError::Protocol(_))
    ));
}

#[test]
fn test_truncated_request() {
    let entries = vec![RequestEntry::new(0, 0, 1, 8, 0).payload(vec![1u8; 8])];
    let encoded = encode_request(RpcKind::LogAppend, &entries).unwrap();

    // short header, short entry header, short payload
    for cut in [1, REQUEST_HEADER_SIZE + 10, encoded.len() - 3] {
        let result = decode_request(&encoded[..cut]);
        assert!(
            matches!(result, Err(RtxError::Protocol(_))),
            "cut at {} decoded",
            cut
        );
    }
}

#[test]
fn test_oversized_payload_rejected() {
    let big = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
    let entries = vec![RequestEntry::new(0, 0, 1, big.len(), 0).payload(big)];
    assert!(matches!(
        encode_request(RpcKind::CalvinForward, &entries),
        Err(RtxError::Protocol(_))
    ));
}

#[test]
fn test_declared_payload_length_checked() {
    let entries = vec![RequestEntry::new(0, 0, 1, 8, 0)];
    let mut encoded = encode_request(RpcKind::Read, &entries).unwrap().to_vec();
    // the payload length is the last word of the entry header
    let at = REQUEST_HEADER_SIZE + ENTRY_HEADER_SIZE - 4;
    encoded[at..at + 4].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
    assert!(matches!(
        decode_request(&encoded),
        Err(RtxError::Protocol(_))
    ));
}

// =============================================================================
// Reply Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_reply() {
    let items = vec![
        ReplyItem::ok(0).with_stamps(12, 34),
        ReplyItem::new(1, Status::Conflict),
        ReplyItem::ok(2).with_payload(Bytes::from_static(b"record image")),
        ReplyItem::new(3, Status::NotFound),
    ];
    let encoded = encode_reply(&items).unwrap();
    assert_eq!(
        encoded.len(),
        REPLY_HEADER_SIZE + 4 * ITEM_HEADER_SIZE + b"record image".len()
    );

    let decoded = decode_reply(&encoded).unwrap();
    assert_eq!(decoded, items);
    assert!(decoded[0].status.is_ok());
    assert!(!decoded[1].status.is_ok());
    assert_eq!(decoded[0].seq, 12);
    assert_eq!(decoded[0].extra, 34);
}

#[test]
fn test_truncated_reply() {
    let items = vec![ReplyItem::ok(0).with_payload(vec![9u8; 4])];
    let encoded = encode_reply(&items).unwrap();

    assert!(decode_reply(&encoded[..1]).is_err());
    assert!(decode_reply(&encoded[..REPLY_HEADER_SIZE + 5]).is_err());
    assert!(decode_reply(&encoded[..encoded.len() - 1]).is_err());
}

#[test]
fn test_unknown_status_rejected() {
    let mut encoded = encode_reply(&[ReplyItem::ok(0)]).unwrap().to_vec();
    // status follows the two-byte index
    encoded[REPLY_HEADER_SIZE + 2] = 0x7F;
    assert!(matches!(decode_reply(&encoded), Err(RtxError::Protocol(_))));
}

// =============================================================================
// Batch Tests
// =============================================================================

#[test]
fn test_batch_collects_targets() {
    let mut batch = BatchOp::new(RpcKind::Lookup);
    assert!(batch.is_empty());
    batch.add_entry(RequestEntry::new(2, 0, 1, 8, 0));
    batch.add_entry(RequestEntry::new(0, 0, 2, 8, 1));
    batch.add_entry(RequestEntry::new(2, 0, 3, 8, 2));

    assert_eq!(batch.len(), 3);
    assert_eq!(batch.kind(), RpcKind::Lookup);
    assert_eq!(batch.macs().iter().copied().collect::<Vec<_>>(), vec![0, 2]);

    // one shared buffer holds every entry
    let decoded = decode_request(&batch.encode().unwrap()).unwrap();
    assert_eq!(decoded.entries.len(), 3);
}

#[tokio::test]
async fn test_batch_served_by_each_target() {
    let cluster = Cluster::new(Config::builder().nodes(3).build()).unwrap();
    for node in cluster.nodes() {
        node.load(0, 1, &[node.id(); 8]).unwrap();
    }

    let mut batch = BatchOp::new(RpcKind::Lookup);
    batch.add_entry(RequestEntry::new(0, 0, 1, 8, 0));
    batch.add_entry(RequestEntry::new(2, 0, 1, 8, 1));
    batch.add_entry(RequestEntry::new(2, 0, 99, 8, 2));
    batch.add_entry(RequestEntry::new(2, 0, 1, 4, 3));

    let mut items = batch.send(&cluster).await.unwrap();
    items.sort_by_key(|item| item.idx);
    assert_eq!(items.len(), 4);

    let expected = cluster.node(0).unwrap().store().lookup(0, 1).unwrap();
    assert_eq!(items[0].status, Status::Ok);
    assert_eq!(items[0].seq, expected.off);
    assert_eq!(items[0].extra, 8);
    assert_eq!(items[1].status, Status::Ok);
    assert_eq!(items[2].status, Status::NotFound);
    assert_eq!(items[3].status, Status::Invalid);

    // one request per target machine, none for the idle one
    assert_eq!(cluster.node(0).unwrap().counters().snapshot().rpcs, 1);
    assert_eq!(cluster.node(1).unwrap().counters().snapshot().rpcs, 0);
    assert_eq!(cluster.node(2).unwrap().counters().snapshot().rpcs, 1);
}

#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let cluster = Cluster::new(Config::builder().nodes(2).replication_factor(1).build()).unwrap();
    let items = BatchOp::new(RpcKind::Read).send(&cluster).await.unwrap();
    assert!(items.is_empty());
    for node in cluster.nodes() {
        assert_eq!(node.counters().snapshot().rpcs, 0);
    }
}
