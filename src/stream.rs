//! Stream relay — ordered chunk delivery for streaming requests.
//!
//! The agent appends `(sequence, bytes)` chunks as it reads the local
//! response; the gateway's stream loop reads everything at or past its own
//! last-consumed sequence. Appends are idempotent by sequence, so a retried
//! agent upload never duplicates output — the reader advances past each
//! sequence exactly once either way. EOF is signalled out of band by
//! completing the owning request; a clean end and an abrupt one look the
//! same downstream.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

/// One chunk of a streamed response body.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub sequence: u64,
    pub data: Vec<u8>,
}

/// Per-request ordered chunk logs. Authorization and request-state checks
/// happen in the mailbox before anything lands here; once the owning request
/// completes, its log is effectively immutable.
pub struct StreamRelay {
    chunks: Mutex<HashMap<String, Vec<StreamChunk>>>,
}

impl StreamRelay {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Append a chunk to the request's log, keeping the log sorted by
    /// sequence. A duplicate sequence is dropped.
    pub async fn append(&self, request_id: &str, sequence: u64, data: Vec<u8>) {
        let mut chunks = self.chunks.lock().await;
        let log = chunks.entry(request_id.to_string()).or_default();
        match log.binary_search_by_key(&sequence, |c| c.sequence) {
            Ok(_) => {
                debug!(request_id, sequence, "Duplicate stream chunk ignored");
            }
            Err(pos) => log.insert(pos, StreamChunk { sequence, data }),
        }
    }

    /// Chunks with `sequence >= from_sequence`, in sequence order.
    pub async fn read_from(&self, request_id: &str, from_sequence: u64) -> Vec<StreamChunk> {
        let chunks = self.chunks.lock().await;
        let Some(log) = chunks.get(request_id) else {
            return Vec::new();
        };
        let start = log.partition_point(|c| c.sequence < from_sequence);
        log[start..].to_vec()
    }

    /// Drop the chunk logs for removed requests (retention sweep).
    pub async fn drop_requests(&self, request_ids: &[String]) {
        let mut chunks = self.chunks.lock().await;
        for id in request_ids {
            chunks.remove(id);
        }
    }
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_read_in_sequence_order() {
        let relay = StreamRelay::new();
        // Out-of-order arrival still reads back ordered
        relay.append("r1", 1, b"b".to_vec()).await;
        relay.append("r1", 0, b"a".to_vec()).await;
        relay.append("r1", 2, b"c".to_vec()).await;

        let all = relay.read_from("r1", 0).await;
        let seqs: Vec<u64> = all.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let tail = relay.read_from("r1", 2).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].data, b"c");
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_idempotent() {
        let relay = StreamRelay::new();
        relay.append("r1", 0, b"first".to_vec()).await;
        relay.append("r1", 0, b"retry".to_vec()).await;

        let all = relay.read_from("r1", 0).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data, b"first");
    }

    #[tokio::test]
    async fn test_unknown_request_reads_empty() {
        let relay = StreamRelay::new();
        assert!(relay.read_from("nope", 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_requests() {
        let relay = StreamRelay::new();
        relay.append("r1", 0, b"a".to_vec()).await;
        relay.drop_requests(&["r1".to_string()]).await;
        assert!(relay.read_from("r1", 0).await.is_empty());
    }
}
