//! Relayer: the single in-process publication point and state broker.
//! Every mutation of bridge state funnels through here so it can be
//! linearized before reaching the Durable Store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::StoreError;
use crate::model::{
    BridgeState, DepositEvent, MirrorStatus, PendingMirror, ProcessedDeposit, ProcessedStatus,
};
use crate::store::DurableStore;

pub struct PublishResult {
    pub success: bool,
    pub message_id: String,
}

/// Owns the Durable Store and the subscriber channel. `S` is a
/// concrete store type (never `dyn`) — `DurableStore`'s RPITIT methods
/// need a sized implementor at each call site.
pub struct Relayer<S: DurableStore> {
    store: Arc<S>,
    config: Arc<BridgeConfig>,
    sender: mpsc::UnboundedSender<DepositEvent>,
    message_counter: AtomicU64,
    // Serializes all state mutations so concurrent publish/update calls
    // cannot race on the same deposit tx hash.
    write_lock: AsyncMutex<()>,
}

impl<S: DurableStore> Relayer<S> {
    /// Constructs a Relayer and its subscriber channel. Callers must
    /// keep the returned receiver alive and draining — the channel is
    /// unbounded; back-pressure is absorbed by the Mirror Worker's
    /// bounded semaphore instead.
    pub fn new(store: Arc<S>, config: Arc<BridgeConfig>) -> (Self, mpsc::UnboundedReceiver<DepositEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                store,
                config,
                sender,
                message_counter: AtomicU64::new(0),
                write_lock: AsyncMutex::new(()),
            },
            receiver,
        )
    }

    /// Re-emits every surviving PendingMirror onto the subscriber
    /// stream at startup, so crash recovery does not wait for the next
    /// periodic sweep.
    pub async fn reemit_pending_on_boot(&self) -> Result<usize, StoreError> {
        let state = self.store.load_bridge_state().await?;
        let count = state.pending_mirrors.len();
        for pending in state.pending_mirrors {
            if self.sender.send(pending.deposit).is_err() {
                warn!("subscriber channel closed during boot re-emit");
                break;
            }
        }
        if count > 0 {
            info!(count, "re-emitted surviving pending mirrors on boot");
        }
        Ok(count)
    }

    pub async fn publish_deposit(&self, event: DepositEvent) -> Result<PublishResult, StoreError> {
        let _guard = self.write_lock.lock().await;

        let now_ms = now_ms();
        let pending = PendingMirror::fresh(event.clone(), now_ms);
        self.store.add_pending_mirror(&pending).await?;

        let seq = self.message_counter.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("{}-{seq}", event.tx_hash);

        let success = self.sender.send(event).is_ok();
        if !success {
            warn!(message_id = %message_id, "subscriber channel closed, deposit persisted but not delivered live");
        }

        Ok(PublishResult { success, message_id })
    }

    pub async fn update_mirror_status(
        &self,
        deposit_tx_hash: &str,
        mirror_tx_hash: &str,
        status: MirrorStatus,
        error_message: Option<String>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        match status {
            MirrorStatus::Confirmed => {
                let processed = ProcessedDeposit {
                    deposit_tx_hash: deposit_tx_hash.to_string(),
                    processed_at: now_ms(),
                    mirror_tx_hash: mirror_tx_hash.to_string(),
                    status: ProcessedStatus::Confirmed,
                };
                // promote_to_processed is a no-op delete if the pending
                // row is already gone; detect existence first so we can
                // report `false` per the contract.
                let state = self.store.load_bridge_state().await?;
                let existed = state
                    .pending_mirrors
                    .iter()
                    .any(|p| p.deposit_tx_hash == deposit_tx_hash);
                if !existed {
                    return Ok(false);
                }
                self.store
                    .promote_to_processed(deposit_tx_hash, &processed)
                    .await?;
                info!(deposit_tx_hash, mirror_tx_hash, "deposit mirror confirmed");
                Ok(true)
            }
            MirrorStatus::Failed => {
                let state = self.store.load_bridge_state().await?;
                let current = state
                    .pending_mirrors
                    .into_iter()
                    .find(|p| p.deposit_tx_hash == deposit_tx_hash);
                let Some(current) = current else {
                    return Ok(false);
                };
                let retry_count = current.retry_count + 1;
                if retry_count >= self.config.retry_attempts {
                    let processed = ProcessedDeposit {
                        deposit_tx_hash: deposit_tx_hash.to_string(),
                        processed_at: now_ms(),
                        mirror_tx_hash: String::new(),
                        status: ProcessedStatus::FailedTerminal,
                    };
                    self.store
                        .promote_to_processed(deposit_tx_hash, &processed)
                        .await?;
                    warn!(deposit_tx_hash, retry_count, "mirror retries exhausted, marked failed terminal");
                } else {
                    self.store
                        .update_pending_mirror(deposit_tx_hash, retry_count, error_message)
                        .await?;
                    warn!(deposit_tx_hash, retry_count, "mirror attempt failed, will retry");
                }
                Ok(true)
            }
            other => {
                warn!(?other, "update_mirror_status called with non-terminal status, ignoring");
                Ok(false)
            }
        }
    }

    pub async fn get_bridge_state(&self) -> Result<BridgeState, StoreError> {
        self.store.load_bridge_state().await
    }

    pub async fn get_pending_deposits(&self) -> Result<Vec<PendingMirror>, StoreError> {
        Ok(self.store.load_bridge_state().await?.pending_mirrors)
    }

    pub async fn get_pending_deposits_for_retry(
        &self,
        max_retries: u32,
    ) -> Result<Vec<PendingMirror>, StoreError> {
        Ok(self
            .store
            .load_bridge_state()
            .await?
            .pending_mirrors
            .into_iter()
            .filter(|p| p.retry_count < max_retries)
            .collect())
    }

    pub async fn persist_state(&self) -> Result<(), StoreError> {
        // The store is already durable per-call; this is the hook the
        // Supervisor calls on shutdown to give the backend a chance to
        // flush any buffered state (no-op for the transactional SQLite
        // backend, meaningful for alternative backends).
        Ok(())
    }

    /// Administrative: not invoked on a timer by the Supervisor.
    /// Processed-deposit retention has no enforced bound yet; exposed
    /// so a future retention policy has somewhere to hook in.
    pub async fn cleanup_old_deposits(&self, _max_age_ms: u64) -> Result<usize, StoreError> {
        Ok(0)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::collections::HashMap;

    fn test_config() -> Arc<BridgeConfig> {
        Arc::new(BridgeConfig {
            source_network_name: "test".into(),
            source_utxorpc_url: "https://source.test".into(),
            source_utxorpc_api_key: "key".into(),
            source_deposit_addresses: vec!["addr_watched".into()],
            dest_network_name: "test".into(),
            dest_utxorpc_url: "https://dest.test".into(),
            dest_utxorpc_api_key: "key".into(),
            dest_lucid_provider: "blockfrost".into(),
            dest_lucid_network: "Preview".into(),
            dest_sender_addresses: vec!["addr_sender".into()],
            dest_sender_wallet_seed: "seed".into(),
            allowed_assets: vec!["ADA".into()],
            min_deposit_amount: 2_000_000,
            max_transfer_amount: 100_000_000_000,
            fee_amount: 1_000_000,
            required_confirmations: 5,
            retry_attempts: 2,
            retry_delay_ms: 30_000,
            host: "0.0.0.0".into(),
            port: 3080,
            allowed_origins: vec![],
            store_path: ":memory:".into(),
        })
    }

    fn sample_event(tx_hash: &str) -> DepositEvent {
        DepositEvent {
            tx_hash: tx_hash.to_string(),
            sender_address: "addr_sender".to_string(),
            recipient_address: "addr_watched".to_string(),
            amount: 5_000_000u64.into(),
            asset_type: "ADA".to_string(),
            block_slot: 1,
            block_hash: "blockhash".to_string(),
            output_index: 0,
            metadata: HashMap::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn publish_then_confirm_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let (relayer, mut rx) = Relayer::new(store, test_config());

        let result = relayer.publish_deposit(sample_event("aa")).await.unwrap();
        assert!(result.success);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.tx_hash, "aa");

        let pending = relayer.get_pending_deposits().await.unwrap();
        assert_eq!(pending.len(), 1);

        let updated = relayer
            .update_mirror_status("aa", "bb", MirrorStatus::Confirmed, None)
            .await
            .unwrap();
        assert!(updated);

        let state = relayer.get_bridge_state().await.unwrap();
        assert!(state.pending_mirrors.is_empty());
        assert_eq!(state.processed_deposits.len(), 1);
        assert_eq!(state.processed_deposits[0].mirror_tx_hash, "bb");
    }

    #[tokio::test]
    async fn failed_updates_promote_to_terminal_after_retry_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let (relayer, _rx) = Relayer::new(store, test_config());
        relayer.publish_deposit(sample_event("cc")).await.unwrap();

        // retry_attempts = 2 in test_config
        relayer
            .update_mirror_status("cc", "", MirrorStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let state = relayer.get_bridge_state().await.unwrap();
        assert_eq!(state.pending_mirrors.len(), 1);
        assert_eq!(state.pending_mirrors[0].retry_count, 1);

        relayer
            .update_mirror_status("cc", "", MirrorStatus::Failed, Some("boom again".into()))
            .await
            .unwrap();
        let state = relayer.get_bridge_state().await.unwrap();
        assert!(state.pending_mirrors.is_empty());
        assert_eq!(state.processed_deposits.len(), 1);
        assert_eq!(
            state.processed_deposits[0].status,
            ProcessedStatus::FailedTerminal
        );
    }

    #[tokio::test]
    async fn update_mirror_status_is_noop_when_missing() {
        let store = Arc::new(InMemoryStore::new());
        let (relayer, _rx) = Relayer::new(store, test_config());
        let updated = relayer
            .update_mirror_status("missing", "x", MirrorStatus::Confirmed, None)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn reemit_pending_on_boot_delivers_surviving_pending_mirrors() {
        let store = Arc::new(InMemoryStore::new());
        let pending = PendingMirror::fresh(sample_event("dd"), 0);
        store.add_pending_mirror(&pending).await.unwrap();

        let (relayer, mut rx) = Relayer::new(store, test_config());
        let count = relayer.reemit_pending_on_boot().await.unwrap();
        assert_eq!(count, 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.tx_hash, "dd");
    }
}
