//! Core data model: deposit events, mirror lifecycle state, and the
//! sentinel-tagged big-integer encoding used to carry `u128` amounts
//! through the JSON/text-column persistence boundary losslessly.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const BIGINT_SENTINEL: &str = "__BIGINT__";

/// A `u128` amount that serializes as a sentinel-tagged decimal string
/// (`"__BIGINT__12345"`) rather than a JSON number, so values above
/// 2^53 round-trip exactly through JSON and the `pending_mirrors`
/// text column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BigAmount(pub u128);

impl BigAmount {
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn get(self) -> u128 {
        self.0
    }

    pub fn checked_sub(self, other: u64) -> Option<BigAmount> {
        self.0.checked_sub(other as u128).map(BigAmount)
    }
}

impl fmt::Display for BigAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BigAmount {
    fn from(value: u64) -> Self {
        BigAmount(value as u128)
    }
}

impl Serialize for BigAmount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{BIGINT_SENTINEL}{}", self.0))
    }
}

struct BigAmountVisitor;

impl<'de> Visitor<'de> for BigAmountVisitor {
    type Value = BigAmount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sentinel-tagged big integer string or a plain integer")
    }

    fn visit_str<E>(self, value: &str) -> Result<BigAmount, E>
    where
        E: de::Error,
    {
        let digits = value.strip_prefix(BIGINT_SENTINEL).unwrap_or(value);
        digits
            .parse::<u128>()
            .map(BigAmount)
            .map_err(|_| de::Error::custom(format!("invalid bigint sentinel value: {value}")))
    }

    fn visit_u64<E>(self, value: u64) -> Result<BigAmount, E>
    where
        E: de::Error,
    {
        Ok(BigAmount(value as u128))
    }

    fn visit_i64<E>(self, value: i64) -> Result<BigAmount, E>
    where
        E: de::Error,
    {
        if value < 0 {
            return Err(de::Error::custom("bigint amount cannot be negative"));
        }
        Ok(BigAmount(value as u128))
    }
}

impl<'de> Deserialize<'de> for BigAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BigAmountVisitor)
    }
}

/// A value transfer observed on the source chain targeting one of the
/// watched addresses. Immutable once emitted by the Indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositEvent {
    pub tx_hash: String,
    pub sender_address: String,
    pub recipient_address: String,
    pub amount: BigAmount,
    pub asset_type: String,
    pub block_slot: u64,
    pub block_hash: String,
    pub output_index: u32,
    pub metadata: HashMap<String, String>,
    pub timestamp: u64,
}

pub const UNKNOWN_SENDER: &str = "unknown_sender";
pub const UNKNOWN_BLOCK: &str = "unknown_block";

/// Lifecycle state of a deposit's mirror on the destination chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Unspecified,
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MirrorStatus::Unspecified => "unspecified",
            MirrorStatus::Pending => "pending",
            MirrorStatus::Submitted => "submitted",
            MirrorStatus::Confirmed => "confirmed",
            MirrorStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A deposit the bridge still owes a destination-chain transaction for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMirror {
    pub deposit_tx_hash: String,
    pub deposit: DepositEvent,
    pub retry_count: u32,
    pub last_retry_at: u64,
    pub error_message: Option<String>,
}

impl PendingMirror {
    pub fn fresh(deposit: DepositEvent, now_ms: u64) -> Self {
        Self {
            deposit_tx_hash: deposit.tx_hash.clone(),
            deposit,
            retry_count: 0,
            last_retry_at: now_ms,
            error_message: None,
        }
    }
}

/// A deposit the bridge has reached a terminal decision for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Confirmed,
    FailedTerminal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedDeposit {
    pub deposit_tx_hash: String,
    pub processed_at: u64,
    pub mirror_tx_hash: String,
    pub status: ProcessedStatus,
}

/// Restart hint for the source adapter; never a correctness condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Watermark {
    pub last_processed_slot: u64,
    pub last_processed_block_hash: String,
}

impl Watermark {
    pub fn genesis() -> Self {
        Self {
            last_processed_slot: 0,
            last_processed_block_hash: "genesis".to_string(),
        }
    }
}

/// Full snapshot of durable bridge state, as returned by
/// `DurableStore::load_bridge_state`.
#[derive(Debug, Clone, Default)]
pub struct BridgeState {
    pub processed_deposits: Vec<ProcessedDeposit>,
    pub pending_mirrors: Vec<PendingMirror>,
    pub watermark: Watermark,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_round_trips_above_2_53() {
        let value: u128 = (1u128 << 100) + 7;
        let amount = BigAmount::new(value);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, format!("\"__BIGINT__{value}\""));
        let back: BigAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(), value);
    }

    #[test]
    fn bigint_round_trips_max_u128_range() {
        let value: u128 = u128::MAX;
        let json = serde_json::to_string(&BigAmount::new(value)).unwrap();
        let back: BigAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(), value);
    }

    #[test]
    fn bigint_accepts_plain_json_number_for_small_values() {
        let back: BigAmount = serde_json::from_str("42").unwrap();
        assert_eq!(back.get(), 42u128);
    }

    #[test]
    fn deposit_event_round_trips_through_json() {
        let mut metadata = HashMap::new();
        metadata.insert("label".to_string(), "1337".to_string());
        let event = DepositEvent {
            tx_hash: "aa".repeat(32),
            sender_address: "addr_sender".to_string(),
            recipient_address: "addr_recipient".to_string(),
            amount: BigAmount::new(5_000_000),
            asset_type: "ADA".to_string(),
            block_slot: 100,
            block_hash: "bb".repeat(32),
            output_index: 0,
            metadata,
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: DepositEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
