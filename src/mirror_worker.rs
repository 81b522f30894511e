//! Mirror Worker: consumes pending deposits, builds and submits the
//! destination-chain mirror transaction, and reports the outcome back
//! to the Relayer. Every code path, success or failure, ends in a
//! status update — a deposit is never left pending without an attempt
//! being recorded.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::dest_adapter::{build_mirror_tx_body, DestinationLedgerAdapter};
use crate::model::{DepositEvent, MirrorStatus};
use crate::relayer::Relayer;
use crate::store::DurableStore;

const SWEEP_INTERVAL_SECS: u64 = 5;
const WORKER_POOL_PARALLELISM: usize = 3;

pub struct MirrorWorker<D: DestinationLedgerAdapter, S: DurableStore> {
    adapter: Arc<D>,
    relayer: Arc<Relayer<S>>,
    config: Arc<BridgeConfig>,
    semaphore: Arc<Semaphore>,
}

impl<D: DestinationLedgerAdapter, S: DurableStore> MirrorWorker<D, S> {
    pub fn new(adapter: Arc<D>, relayer: Arc<Relayer<S>>, config: Arc<BridgeConfig>) -> Self {
        Self {
            adapter,
            relayer,
            config,
            semaphore: Arc::new(Semaphore::new(WORKER_POOL_PARALLELISM)),
        }
    }

    /// Drives both work sources: the live subscription channel and the
    /// periodic sweep. Runs until `receiver` is closed (shutdown).
    pub async fn run(&self, mut receiver: mpsc::UnboundedReceiver<DepositEvent>) {
        let mut sweep_interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        loop {
            tokio::select! {
                maybe_event = receiver.recv() => {
                    match maybe_event {
                        Some(event) => self.spawn_attempt(event).await,
                        None => {
                            info!("subscriber channel closed, mirror worker live path stopping");
                            break;
                        }
                    }
                }
                _ = sweep_interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    async fn sweep_once(&self) {
        match self.relayer.get_pending_deposits().await {
            Ok(pending) => {
                for pm in pending {
                    self.spawn_attempt(pm.deposit).await;
                }
            }
            Err(e) => warn!(error = %e, "periodic sweep failed to load pending deposits"),
        }
    }

    async fn spawn_attempt(&self, deposit: DepositEvent) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let adapter = self.adapter.clone();
        let relayer = self.relayer.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_deposit(adapter, relayer, config, deposit).await;
        });
    }

    /// Drains up to `WORKER_POOL_PARALLELISM` in-flight attempts before
    /// returning, used by the Supervisor's graceful shutdown path.
    pub async fn drain(&self) {
        let _ = self
            .semaphore
            .acquire_many(WORKER_POOL_PARALLELISM as u32)
            .await;
    }
}

async fn process_deposit<D: DestinationLedgerAdapter, S: DurableStore>(
    adapter: Arc<D>,
    relayer: Arc<Relayer<S>>,
    config: Arc<BridgeConfig>,
    deposit: DepositEvent,
) {
    let deposit_tx_hash = deposit.tx_hash.clone();

    match try_mirror(adapter.as_ref(), &config, &deposit).await {
        Ok(mirror_tx_hash) => {
            if let Err(e) = relayer
                .update_mirror_status(&deposit_tx_hash, &mirror_tx_hash, MirrorStatus::Confirmed, None)
                .await
            {
                error!(deposit_tx_hash, error = %e, "failed to record confirmed mirror status");
            }
        }
        Err(message) => {
            warn!(deposit_tx_hash, error = %message, "mirror attempt failed");
            if let Err(e) = relayer
                .update_mirror_status(&deposit_tx_hash, "", MirrorStatus::Failed, Some(message))
                .await
            {
                error!(deposit_tx_hash, error = %e, "failed to record failed mirror status");
            }
        }
    }
}

/// Returns `Ok(mirror_tx_hash)` on success, `Err(reason)` on any
/// failure while computing the net amount, building, signing, or
/// submitting the mirror transaction.
async fn try_mirror<D: DestinationLedgerAdapter>(
    adapter: &D,
    config: &BridgeConfig,
    deposit: &DepositEvent,
) -> Result<String, String> {
    let net = deposit
        .amount
        .checked_sub(config.fee_amount)
        .ok_or_else(|| "insufficient after fee".to_string())?;

    if net.get() <= config.minimum_destination_output() as u128 {
        return Err("insufficient after fee".to_string());
    }
    let net_amount: u64 = net
        .get()
        .try_into()
        .map_err(|_| "net amount exceeds destination adapter's u64 range".to_string())?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let body = build_mirror_tx_body(
        deposit.sender_address.clone(),
        net_amount,
        deposit.tx_hash.clone(),
        now_ms,
    );

    let signed = adapter
        .build_and_sign(&body)
        .map_err(|e| format!("build failed: {e}"))?;

    let pre_submission_hash = signed.pre_submission_hash.clone();

    let ledger_hash = adapter
        .submit_transaction(&signed)
        .await
        .map_err(|e| format!("submit failed: {e}"))?;

    if ledger_hash != pre_submission_hash {
        warn!(
            deposit_tx_hash = %deposit.tx_hash,
            pre_submission_hash,
            ledger_hash,
            "mirror hash mismatch, trusting ledger-reported hash"
        );
    }

    Ok(ledger_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest_adapter::FakeDestAdapter;
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
            retry_attempts: 3,
            retry_delay_ms: 30_000,
            host: "0.0.0.0".into(),
            port: 3080,
            allowed_origins: vec![],
            store_path: ":memory:".into(),
        })
    }

    fn deposit(tx_hash: &str, amount: u64) -> DepositEvent {
        DepositEvent {
            tx_hash: tx_hash.to_string(),
            sender_address: "addr_sender".to_string(),
            recipient_address: "addr_watched".to_string(),
            amount: amount.into(),
            asset_type: "ADA".to_string(),
            block_slot: 1,
            block_hash: "blockhash".to_string(),
            output_index: 0,
            metadata: HashMap::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn happy_path_confirms_deposit() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        relayer.publish_deposit(deposit("aa", 5_000_000)).await.unwrap();

        let adapter = Arc::new(FakeDestAdapter::new());
        process_deposit(adapter, relayer.clone(), config, deposit("aa", 5_000_000)).await;

        let state = relayer.get_bridge_state().await.unwrap();
        assert!(state.pending_mirrors.is_empty());
        assert_eq!(state.processed_deposits.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_after_fee_fails_without_submitting() {
        let store = Arc::new(InMemoryStore::new());
        let mut config = (*test_config()).clone();
        config.fee_amount = 1_000_000;
        config.min_deposit_amount = 2_000_000;
        let config = Arc::new(config);
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        // amount barely above min but net <= minimum destination output
        relayer.publish_deposit(deposit("bb", 1_999_999)).await.unwrap();

        let adapter = Arc::new(FakeDestAdapter::new());
        process_deposit(adapter, relayer.clone(), config, deposit("bb", 1_999_999)).await;

        let state = relayer.get_bridge_state().await.unwrap();
        assert_eq!(state.pending_mirrors.len(), 1);
        assert_eq!(state.pending_mirrors[0].retry_count, 1);
    }

    #[tokio::test]
    async fn submit_failure_increments_retry_count() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        relayer.publish_deposit(deposit("cc", 5_000_000)).await.unwrap();

        let adapter = Arc::new(FakeDestAdapter::failing());
        process_deposit(adapter, relayer.clone(), config, deposit("cc", 5_000_000)).await;

        let state = relayer.get_bridge_state().await.unwrap();
        assert_eq!(state.pending_mirrors.len(), 1);
        assert_eq!(state.pending_mirrors[0].retry_count, 1);
    }

    #[tokio::test]
    async fn mismatched_ledger_hash_still_confirms() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        relayer.publish_deposit(deposit("dd", 5_000_000)).await.unwrap();

        let mut adapter = FakeDestAdapter::new();
        adapter.mismatched_hash = true;
        process_deposit(Arc::new(adapter), relayer.clone(), config, deposit("dd", 5_000_000)).await;

        let state = relayer.get_bridge_state().await.unwrap();
        assert!(state.pending_mirrors.is_empty());
        assert_eq!(state.processed_deposits.len(), 1);
        assert!(state.processed_deposits[0].mirror_tx_hash.starts_with("ledger-"));
    }
}
