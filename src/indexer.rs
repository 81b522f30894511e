//! Indexer: drives the Source Ledger Adapter, filters and validates
//! deposit events, and hands valid ones to the Relayer. Single-writer,
//! single-reader in-memory dedup set — no concurrent map needed since
//! only this task's own loop ever touches it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{AdapterError, StoreError, ValidationError};
use crate::model::DepositEvent;
use crate::relayer::Relayer;
use crate::source_adapter::SourceLedgerAdapter;
use crate::store::DurableStore;

pub struct Indexer<A: SourceLedgerAdapter, S: DurableStore> {
    adapter: Arc<A>,
    relayer: Arc<Relayer<S>>,
    config: Arc<BridgeConfig>,
    seen: HashSet<String>,
}

#[derive(Debug)]
pub enum IndexerError {
    NoDepositAddressesConfigured,
    Adapter(AdapterError),
    Store(StoreError),
}

impl std::fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerError::NoDepositAddressesConfigured => {
                write!(f, "no deposit addresses configured")
            }
            IndexerError::Adapter(e) => write!(f, "adapter error: {e}"),
            IndexerError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl<A: SourceLedgerAdapter, S: DurableStore> Indexer<A, S> {
    pub fn new(adapter: Arc<A>, relayer: Arc<Relayer<S>>, config: Arc<BridgeConfig>) -> Self {
        Self {
            adapter,
            relayer,
            config,
            seen: HashSet::new(),
        }
    }

    /// Runs the indexer's infinite loop. Returns only on a fatal
    /// configuration error; transient stream errors are absorbed with
    /// the retry-delay policy below.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        if self.config.source_deposit_addresses.is_empty() {
            return Err(IndexerError::NoDepositAddressesConfigured);
        }

        loop {
            match self
                .adapter
                .watch_addresses(&self.config.source_deposit_addresses)
                .await
            {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                if let Err(e) = self.handle_event(event).await {
                                    warn!(error = %e, "failed to publish deposit, propagating");
                                    return Err(IndexerError::Store(e));
                                }
                            }
                            Err(AdapterError::Decoding(msg)) => {
                                warn!(error = %msg, "dropping undecodable deposit event");
                            }
                            Err(AdapterError::Auth(msg)) => {
                                return Err(IndexerError::Adapter(AdapterError::Auth(msg)));
                            }
                            Err(AdapterError::Transient(msg)) => {
                                warn!(error = %msg, "source stream transient error, will resubscribe");
                                break;
                            }
                        }
                    }
                }
                Err(AdapterError::Auth(msg)) => {
                    return Err(IndexerError::Adapter(AdapterError::Auth(msg)));
                }
                Err(e) => {
                    warn!(error = %e, "could not open source stream");
                }
            }

            info!(delay_ms = self.config.retry_delay_ms, "resubscribing to source stream after delay");
            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        }
    }

    async fn handle_event(&mut self, event: DepositEvent) -> Result<(), StoreError> {
        if self.seen.contains(&event.tx_hash) {
            return Ok(());
        }

        if let Err(e) = self.validate(&event) {
            warn!(tx_hash = %event.tx_hash, error = %e, "dropping invalid deposit event");
            return Ok(());
        }

        self.seen.insert(event.tx_hash.clone());

        let tx_hash = event.tx_hash.clone();
        match self.relayer.publish_deposit(event).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Allow a future stream re-delivery to retry.
                self.seen.remove(&tx_hash);
                Err(e)
            }
        }
    }

    fn validate(&self, event: &DepositEvent) -> Result<(), ValidationError> {
        let amount = event.amount.get();
        if amount == 0 {
            return Err(ValidationError("amount must be > 0".into()));
        }
        if amount < self.config.min_deposit_amount as u128
            || amount > self.config.max_transfer_amount as u128
        {
            return Err(ValidationError(format!(
                "amount {amount} outside [{}, {}]",
                self.config.min_deposit_amount, self.config.max_transfer_amount
            )));
        }
        if !self.config.is_asset_allowed(&event.asset_type) {
            return Err(ValidationError(format!(
                "asset {} not in allowed set",
                event.asset_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_adapter::FakeSourceAdapter;
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

    fn event(tx_hash: &str, amount: u64, asset: &str) -> DepositEvent {
        DepositEvent {
            tx_hash: tx_hash.to_string(),
            sender_address: "addr_sender".to_string(),
            recipient_address: "addr_watched".to_string(),
            amount: amount.into(),
            asset_type: asset.to_string(),
            block_slot: 1,
            block_hash: "blockhash".to_string(),
            output_index: 0,
            metadata: HashMap::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn valid_deposit_is_published() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, mut rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        let adapter = Arc::new(FakeSourceAdapter::new(vec![Ok(event("aa", 5_000_000, "ADA"))]));
        let mut indexer = Indexer::new(adapter, relayer.clone(), config);

        indexer.handle_event(event("aa", 5_000_000, "ADA")).await.unwrap();
        let pending = relayer.get_pending_deposits().await.unwrap();
        assert_eq!(pending.len(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.tx_hash, "aa");
    }

    #[tokio::test]
    async fn below_minimum_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        let adapter = Arc::new(FakeSourceAdapter::new(vec![]));
        let mut indexer = Indexer::new(adapter, relayer.clone(), config);

        indexer.handle_event(event("bb", 1_500_000, "ADA")).await.unwrap();
        let pending = relayer.get_pending_deposits().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn disallowed_asset_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        let adapter = Arc::new(FakeSourceAdapter::new(vec![]));
        let mut indexer = Indexer::new(adapter, relayer.clone(), config);

        indexer.handle_event(event("cc", 5_000_000, "ERC20")).await.unwrap();
        let pending = relayer.get_pending_deposits().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_within_boot_is_absorbed() {
        let store = Arc::new(InMemoryStore::new());
        let config = test_config();
        let (relayer, _rx) = Relayer::new(store, config.clone());
        let relayer = Arc::new(relayer);
        let adapter = Arc::new(FakeSourceAdapter::new(vec![]));
        let mut indexer = Indexer::new(adapter, relayer.clone(), config);

        indexer.handle_event(event("dd", 5_000_000, "ADA")).await.unwrap();
        indexer.handle_event(event("dd", 5_000_000, "ADA")).await.unwrap();

        let state = relayer.get_bridge_state().await.unwrap();
        assert_eq!(state.pending_mirrors.len(), 1);
    }

    #[test]
    fn run_errors_fatally_with_no_deposit_addresses() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(InMemoryStore::new());
            let mut config = (*test_config()).clone();
            config.source_deposit_addresses = vec![];
            let config = Arc::new(config);
            let (relayer, _rx) = Relayer::new(store, config.clone());
            let relayer = Arc::new(relayer);
            let adapter = Arc::new(FakeSourceAdapter::new(vec![]));
            let mut indexer = Indexer::new(adapter, relayer, config);
            let result = indexer.run().await;
            assert!(matches!(result, Err(IndexerError::NoDepositAddressesConfigured)));
        });
    }
}
