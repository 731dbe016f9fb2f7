//! Node-to-node protocol
//!
//! Every peer message travels as a CRC-protected bincode frame:
//! `[PAYLOAD_LEN:4][PAYLOAD:n][CRC32:4]`. All requests are idempotent under
//! redelivery: replica applies drop non-newer versions, invalidations only
//! ever lower what a holder may serve, and prepare/commit/rollback are keyed
//! by transaction id.

use crate::common::{crc32, Error, Result};
use crate::grid::{NodeId, PartitionId};
use crate::store::{Entry, Precondition, Version};
use crate::tx::TxId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const FRAME_OVERHEAD: usize = 8;

/// A write staged by a transaction at a primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWrite {
    pub key: String,
    /// `None` removes the key
    pub value: Option<Bytes>,
    pub ttl_ms: Option<u64>,
    /// Live version observed when the lock was granted
    pub expected: Option<Version>,
}

/// Near-cache holder asking to be registered for invalidations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderTag {
    pub node: NodeId,
    /// Holder's subscription generation when the fetch started
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    Get {
        cache: String,
        key: String,
        reader: Option<ReaderTag>,
        allow_backup: bool,
    },
    Put {
        cache: String,
        key: String,
        value: Option<Bytes>,
        ttl_ms: Option<u64>,
        precondition: Precondition,
    },
    ReplicateApply {
        cache: String,
        partition: PartitionId,
        key: String,
        entry: Entry,
    },
    InvalidateNotify {
        cache: String,
        key: String,
        version: Version,
    },
    /// Drop `reader`'s registrations in `partition` up to `generation`
    Unsubscribe {
        cache: String,
        partition: PartitionId,
        reader: NodeId,
        generation: u64,
    },
    Lock {
        cache: String,
        tx: TxId,
        key: String,
        deadline_ms: u64,
        wait_ms: u64,
    },
    Unlock {
        cache: String,
        tx: TxId,
        keys: Vec<String>,
    },
    Prepare {
        cache: String,
        tx: TxId,
        writes: Vec<TxWrite>,
    },
    CommitApply {
        cache: String,
        tx: TxId,
    },
    Rollback {
        cache: String,
        tx: TxId,
    },
    StreamLoad {
        cache: String,
        entries: Vec<(String, Bytes)>,
        allow_overwrite: bool,
    },
    Snapshot {
        cache: String,
        partition: PartitionId,
    },
    LocalSize {
        cache: String,
    },
}

impl PeerRequest {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Get { .. } => "get",
            PeerRequest::Put { .. } => "put",
            PeerRequest::ReplicateApply { .. } => "replicate_apply",
            PeerRequest::InvalidateNotify { .. } => "invalidate_notify",
            PeerRequest::Unsubscribe { .. } => "unsubscribe",
            PeerRequest::Lock { .. } => "lock",
            PeerRequest::Unlock { .. } => "unlock",
            PeerRequest::Prepare { .. } => "prepare",
            PeerRequest::CommitApply { .. } => "commit_apply",
            PeerRequest::Rollback { .. } => "rollback",
            PeerRequest::StreamLoad { .. } => "stream_load",
            PeerRequest::Snapshot { .. } => "snapshot",
            PeerRequest::LocalSize { .. } => "local_size",
        }
    }

    pub fn cache(&self) -> &str {
        match self {
            PeerRequest::Get { cache, .. }
            | PeerRequest::Put { cache, .. }
            | PeerRequest::ReplicateApply { cache, .. }
            | PeerRequest::InvalidateNotify { cache, .. }
            | PeerRequest::Unsubscribe { cache, .. }
            | PeerRequest::Lock { cache, .. }
            | PeerRequest::Unlock { cache, .. }
            | PeerRequest::Prepare { cache, .. }
            | PeerRequest::CommitApply { cache, .. }
            | PeerRequest::Rollback { cache, .. }
            | PeerRequest::StreamLoad { cache, .. }
            | PeerRequest::Snapshot { cache, .. }
            | PeerRequest::LocalSize { cache } => cache,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
    Value(Option<Entry>),
    Written {
        applied: bool,
        version: Option<Version>,
        previous: Option<Entry>,
    },
    Replicated {
        applied: bool,
    },
    Ack,
    /// Live entry at the moment the lock was granted
    Locked {
        entry: Option<Entry>,
    },
    Prepared,
    Committed {
        changes: usize,
    },
    Loaded {
        applied: usize,
        skipped: usize,
        /// Entries this node no longer owns; the sender re-routes them
        rerouted: Vec<(String, Bytes)>,
    },
    Snapshot(Vec<(String, Entry)>),
    Size(usize),
    Error(Error),
}

impl PeerResponse {
    /// Turn an error response into `Err`
    pub fn into_result(self) -> Result<PeerResponse> {
        match self {
            PeerResponse::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Encode a message into a CRC-protected frame
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes> {
    let payload = bincode::serialize(msg)?;
    let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32(&payload));
    Ok(buf.freeze())
}

/// Decode and verify a frame
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(Error::Corrupted(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[0..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if frame.len() != len + FRAME_OVERHEAD {
        return Err(Error::Corrupted(format!(
            "frame length mismatch: header says {}, got {}",
            len,
            frame.len() - FRAME_OVERHEAD
        )));
    }

    let payload = &frame[4..4 + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&frame[4 + len..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_carries_transaction_writes() {
        let tx = uuid::Uuid::new_v4();
        let req = PeerRequest::Prepare {
            cache: "partitioned_near".into(),
            tx,
            writes: vec![
                TxWrite {
                    key: "A".into(),
                    value: Some(Bytes::from_static(b"1")),
                    ttl_ms: None,
                    expected: Some(Version::new(1, 4)),
                },
                TxWrite {
                    key: "B".into(),
                    value: None,
                    ttl_ms: Some(500),
                    expected: None,
                },
            ],
        };

        let frame = encode_frame(&req).unwrap();
        match decode_frame::<PeerRequest>(&frame).unwrap() {
            PeerRequest::Prepare {
                cache,
                tx: decoded_tx,
                writes,
            } => {
                assert_eq!(cache, "partitioned_near");
                assert_eq!(decoded_tx, tx);
                assert_eq!(writes.len(), 2);
                assert_eq!(writes[0].expected, Some(Version::new(1, 4)));
                assert_eq!(writes[1].value, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_survives_the_wire() {
        let resp = PeerResponse::Error(Error::NotPrimary {
            partition: 9,
            node: 2,
        });
        let frame = encode_frame(&resp).unwrap();
        let decoded: PeerResponse = decode_frame(&frame).unwrap();
        assert!(matches!(
            decoded.into_result(),
            Err(Error::NotPrimary {
                partition: 9,
                node: 2
            })
        ));
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let frame = encode_frame(&PeerRequest::LocalSize {
            cache: "c".into(),
        })
        .unwrap();
        let mut bad = frame.to_vec();
        bad[5] ^= 0xff;
        assert!(matches!(
            decode_frame::<PeerRequest>(&bad),
            Err(Error::Corrupted(_))
        ));
        assert!(decode_frame::<PeerRequest>(&frame[..3]).is_err());
        assert!(decode_frame::<PeerRequest>(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_request_kind_and_cache() {
        let req = PeerRequest::Rollback {
            cache: "orders".into(),
            tx: uuid::Uuid::nil(),
        };
        assert_eq!(req.kind(), "rollback");
        assert_eq!(req.cache(), "orders");
    }
}
