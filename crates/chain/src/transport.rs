//! Peer requests with a bounded timeout and a single retry.
//!
//! Transport failures only ever affect how a peer is treated. Nothing here
//! touches the ledger.

use async_trait::async_trait;
use dposchain_consensus::{Classify, ErrorClass};
use dposchain_core::{Block, Transaction};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request to {peer} timed out after {after_ms} ms")]
    Timeout { peer: String, after_ms: u64 },

    #[error("connection to {0} refused")]
    Refused(String),

    #[error("peer {peer} is incompatible: {reason}")]
    Incompatible { peer: String, reason: String },

    #[error("peer {peer} unavailable after {attempts} attempts: {last}")]
    PeerUnavailable {
        peer: String,
        attempts: u32,
        last: String,
    },
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A remote node blocks and transactions can be requested from.
#[async_trait]
pub trait PeerClient: Send + Sync {
    fn id(&self) -> &str;

    /// Up to `limit` consecutive blocks starting at `height`.
    async fn blocks_from(&self, height: u64, limit: usize) -> Result<Vec<Block>>;

    /// The peer's unconfirmed transactions.
    async fn transactions(&self) -> Result<Vec<Transaction>>;
}

/// Timeout and backoff for one peer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_millis(timeout_ms: u64, backoff_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            backoff: Duration::from_millis(backoff_ms),
        }
    }
}

/// Run `request` against `peer` with the policy's timeout. A failed attempt
/// is retried exactly once after the backoff; a second failure becomes
/// [`TransportError::PeerUnavailable`].
pub async fn fetch_with_retry<T, F, Fut>(peer: &str, policy: RetryPolicy, mut request: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const ATTEMPTS: u32 = 2;
    let mut last = None;
    for attempt in 1..=ATTEMPTS {
        let outcome = match tokio::time::timeout(policy.timeout, request()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout {
                peer: peer.to_string(),
                after_ms: policy.timeout.as_millis() as u64,
            }),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(peer, attempt, error = %err, "Peer request failed");
                last = Some(err);
            }
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(policy.backoff).await;
        }
    }
    Err(TransportError::PeerUnavailable {
        peer: peer.to_string(),
        attempts: ATTEMPTS,
        last: last.map(|err| err.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::from_millis(50, 5)
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let value = fetch_with_retry("peer", policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7u32) }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let calls = AtomicU32::new(0);
        let value = fetch_with_retry("peer", policy(), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(TransportError::Refused("peer".into()))
                } else {
                    Ok("blocks")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "blocks");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_two_timeouts_make_peer_unavailable() {
        let calls = AtomicU32::new(0);
        let err = fetch_with_retry("slow", policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            TransportError::PeerUnavailable { peer, attempts, last } => {
                assert_eq!(peer, "slow");
                assert_eq!(attempts, 2);
                assert!(last.contains("timed out"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            TransportError::Refused("x".into()).class(),
            ErrorClass::Transient
        );
    }
}
