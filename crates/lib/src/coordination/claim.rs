//! Send-claim records and the per-conversation coordinator.
//!
//! At most one context may send for a conversation at a time. The claim
//! lives in a shared store under `conv_{conversation_id}:sending` as a JSON
//! record naming the holder and when it claimed. Claims older than the
//! staleness window are treated as leftovers from a dead context and may be
//! taken over. Store failures never block sending; the coordinator proceeds
//! optimistically and lets the next read reconcile.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::store::SharedStore;

/// Claims older than this are presumed abandoned.
pub const CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

/// Store key holding the sending claim for a conversation.
pub fn sending_key(conversation_id: &str) -> String {
    format!("conv_{conversation_id}:sending")
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    /// Identity of the claiming context.
    pub tab_id: String,
    /// Unix milliseconds when the claim was written.
    pub timestamp: u64,
}

impl ClaimRecord {
    pub fn new(tab_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            tab_id: tab_id.into(),
            timestamp,
        }
    }

    pub fn is_stale(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.timestamp) > ttl.as_millis() as u64
    }

    /// Claim time as a UTC datetime, for display.
    pub fn issued_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    /// A live claim by another context blocks this send.
    Blocked(ClaimRecord),
}

/// Mutex over the shared store for one conversation's sends.
pub struct SendCoordinator {
    store: Arc<dyn SharedStore>,
    key: String,
    tab_id: String,
    ttl: Duration,
    holding: AtomicBool,
}

impl SendCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        conversation_id: &str,
        tab_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key: sending_key(conversation_id),
            tab_id: tab_id.into(),
            ttl: CLAIM_TTL,
            holding: AtomicBool::new(false),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this coordinator believes it holds the claim.
    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    /// Current claim record, if one is readable. Read failures and corrupt
    /// records count as no claim.
    pub async fn peek(&self) -> Option<ClaimRecord> {
        let value = match self.store.read(&self.key).await {
            Ok(value) => value?,
            Err(err) => {
                log::warn!("claim read failed for {}: {err}", self.key);
                return None;
            }
        };
        match serde_json::from_str(&value) {
            Ok(record) => Some(record),
            Err(err) => {
                log::debug!("corrupt claim record under {}: {err}", self.key);
                None
            }
        }
    }

    /// Try to take the claim. A live claim by another context blocks; our own
    /// claim and stale claims are overwritten with a fresh record.
    pub async fn try_acquire(&self) -> ClaimOutcome {
        let now = unix_millis();
        if let Some(record) = self.peek().await {
            if record.tab_id != self.tab_id {
                if record.is_stale(now, self.ttl) {
                    log::info!(
                        "claim on {} by {} is stale, taking over",
                        self.key,
                        record.tab_id
                    );
                } else {
                    return ClaimOutcome::Blocked(record);
                }
            }
        }
        let record = ClaimRecord::new(self.tab_id.clone(), now);
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(err) = self.store.write(&self.key, &json).await {
                    log::warn!("claim write failed for {}, proceeding anyway: {err}", self.key);
                }
            }
            Err(err) => {
                log::warn!("claim record serialization failed: {err}");
            }
        }
        self.holding.store(true, Ordering::SeqCst);
        ClaimOutcome::Acquired
    }

    /// Give the claim back, but only if we still own it. A newer claim by
    /// another context (after a stale takeover) is left untouched. Idempotent.
    pub async fn release(&self) {
        if !self.holding.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.peek().await {
            Some(record) if record.tab_id == self.tab_id => {
                if let Err(err) = self.store.remove(&self.key).await {
                    log::warn!("claim remove failed for {}: {err}", self.key);
                }
            }
            Some(record) => {
                log::debug!(
                    "claim on {} now held by {}, leaving it in place",
                    self.key,
                    record.tab_id
                );
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::{KeyChange, MemoryStore, StoreError};
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    fn pair(conversation: &str) -> (Arc<MemoryStore>, SendCoordinator, SendCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let a = SendCoordinator::new(store.clone(), conversation, "tab-a");
        let b = SendCoordinator::new(store.clone(), conversation, "tab-b");
        (store, a, b)
    }

    #[tokio::test]
    async fn second_context_is_blocked_until_release() {
        let (_store, a, b) = pair("c1");
        assert_eq!(a.try_acquire().await, ClaimOutcome::Acquired);
        match b.try_acquire().await {
            ClaimOutcome::Blocked(record) => assert_eq!(record.tab_id, "tab-a"),
            other => panic!("expected blocked, got {other:?}"),
        }
        a.release().await;
        assert_eq!(b.try_acquire().await, ClaimOutcome::Acquired);
    }

    #[tokio::test]
    async fn release_clears_the_record() {
        let (store, a, _b) = pair("c1");
        a.try_acquire().await;
        assert!(store.read(&sending_key("c1")).await.unwrap().is_some());
        a.release().await;
        assert!(store.read(&sending_key("c1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over() {
        let (store, _a, b) = pair("c1");
        let old = ClaimRecord::new("tab-a", unix_millis() - 6 * 60 * 1000);
        store
            .write(&sending_key("c1"), &serde_json::to_string(&old).unwrap())
            .await
            .unwrap();

        assert_eq!(b.try_acquire().await, ClaimOutcome::Acquired);
        let raw = store.read(&sending_key("c1")).await.unwrap().unwrap();
        let record: ClaimRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.tab_id, "tab-b");
    }

    #[tokio::test]
    async fn fresh_claim_is_not_taken_over() {
        let (_store, a, b) = pair("c1");
        a.try_acquire().await;
        assert!(matches!(b.try_acquire().await, ClaimOutcome::Blocked(_)));
    }

    #[tokio::test]
    async fn late_release_leaves_a_newer_holder_in_place() {
        let (store, a, b) = pair("c1");
        a.try_acquire().await;

        // Age tab-a's record past the staleness window, then let tab-b take over.
        let aged = ClaimRecord::new("tab-a", unix_millis() - 6 * 60 * 1000);
        store
            .write(&sending_key("c1"), &serde_json::to_string(&aged).unwrap())
            .await
            .unwrap();
        assert_eq!(b.try_acquire().await, ClaimOutcome::Acquired);

        // tab-a's release must not clobber tab-b's claim.
        a.release().await;
        let raw = store.read(&sending_key("c1")).await.unwrap().unwrap();
        let record: ClaimRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.tab_id, "tab-b");
    }

    #[tokio::test]
    async fn reacquiring_our_own_claim_refreshes_it() {
        let (store, a, _b) = pair("c1");
        a.try_acquire().await;
        let first: ClaimRecord =
            serde_json::from_str(&store.read(&sending_key("c1")).await.unwrap().unwrap()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(a.try_acquire().await, ClaimOutcome::Acquired);
        let second: ClaimRecord =
            serde_json::from_str(&store.read(&sending_key("c1")).await.unwrap().unwrap()).unwrap();
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(second.tab_id, "tab-a");
    }

    #[tokio::test]
    async fn release_without_holding_is_a_no_op() {
        let (store, a, b) = pair("c1");
        a.try_acquire().await;
        b.release().await;
        assert!(store.read(&sending_key("c1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_record_counts_as_no_claim() {
        let (store, a, _b) = pair("c1");
        store.write(&sending_key("c1"), "not json").await.unwrap();
        assert_eq!(a.try_acquire().await, ClaimOutcome::Acquired);
    }

    struct FailingStore;

    #[async_trait]
    impl SharedStore for FailingStore {
        async fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store down",
            )))
        }
        async fn write(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store down",
            )))
        }
        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store down",
            )))
        }
        fn watch(&self) -> broadcast::Receiver<KeyChange> {
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            rx
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_block_sending() {
        let coordinator = SendCoordinator::new(Arc::new(FailingStore), "c1", "tab-a");
        assert_eq!(coordinator.try_acquire().await, ClaimOutcome::Acquired);
        assert!(coordinator.is_holding());
        coordinator.release().await;
        assert!(!coordinator.is_holding());
    }

    #[test]
    fn key_format_embeds_the_conversation_id() {
        assert_eq!(sending_key("abc-123"), "conv_abc-123:sending");
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let json = serde_json::to_string(&ClaimRecord::new("tab-a", 42)).unwrap();
        assert_eq!(json, r#"{"tabId":"tab-a","timestamp":42}"#);
    }

    #[test]
    fn staleness_window() {
        let record = ClaimRecord::new("tab-a", 1_000);
        let ttl = Duration::from_secs(300);
        assert!(!record.is_stale(1_000 + 300_000, ttl));
        assert!(record.is_stale(1_000 + 300_001, ttl));
    }

    #[test]
    fn issued_at_converts_the_timestamp() {
        let record = ClaimRecord::new("tab-a", 1_700_000_000_000);
        let issued = record.issued_at().expect("valid timestamp");
        assert_eq!(issued.timestamp_millis(), 1_700_000_000_000);
    }
}
