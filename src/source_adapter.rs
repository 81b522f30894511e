//! Source Ledger Adapter. Streams transactions targeting a set of
//! watched addresses and decodes them into `DepositEvent`s.
//!
//! The production adapter speaks to a UTxO RPC streaming endpoint over
//! `tonic`. To avoid a build-time dependency on `protoc`/`tonic-build`,
//! the wire types are hand-declared `prost::Message` structs covering
//! only the fields this bridge actually reads, and the client is built
//! directly on `tonic::client::Grpc<Channel>` rather than
//! `tonic::include_proto!`.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::Stream;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::error::AdapterError;
use crate::model::{DepositEvent, UNKNOWN_BLOCK, UNKNOWN_SENDER};

/// One decoded-or-errored item from the watch stream.
pub type WatchResult = Result<DepositEvent, AdapterError>;
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchResult> + Send>>;

#[async_trait]
pub trait SourceLedgerAdapter: Send + Sync + 'static {
    async fn watch_addresses(&self, addresses: &[String]) -> Result<WatchStream, AdapterError>;

    /// Hint that the adapter may release resources; never required for correctness.
    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Wire types (hand-declared, no tonic-build)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchAddressesRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub addresses: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxOutput {
    #[prost(bytes = "vec", tag = "1")]
    pub address: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub coin: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TxInputSource {
    #[prost(bytes = "vec", tag = "1")]
    pub address: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadatumEntry {
    #[prost(uint64, tag = "1")]
    pub label: u64,
    #[prost(oneof = "MetadatumValue", tags = "2, 3, 4, 5")]
    pub value: Option<MetadatumValue>,
}

/// A metadatum's wire representation is one of four cases; nesting
/// (`Composite`) is a list of further labeled entries, mirroring a
/// ledger metadata map one level at a time.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum MetadatumValue {
    #[prost(string, tag = "2")]
    Text(String),
    #[prost(int64, tag = "3")]
    Int(i64),
    #[prost(bytes = "vec", tag = "4")]
    Bytes(Vec<u8>),
    #[prost(message, tag = "5")]
    Composite(MetadatumList),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadatumList {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<MetadatumEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireTx {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<TxInputSource>,
    #[prost(message, repeated, tag = "3")]
    pub outputs: Vec<TxOutput>,
    #[prost(message, repeated, tag = "4")]
    pub metadata: Vec<MetadatumEntry>,
    #[prost(uint64, tag = "5")]
    pub slot: u64,
    #[prost(bytes = "vec", tag = "6")]
    pub block_hash: Vec<u8>,
    #[prost(string, tag = "7")]
    pub asset_type: String,
}

#[derive(Clone, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum WireAction {
    Apply = 0,
    Undo = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchAddressesResponse {
    #[prost(enumeration = "i32", tag = "1")]
    pub action: i32,
    #[prost(message, optional, tag = "2")]
    pub tx: Option<WireTx>,
}

// ---------------------------------------------------------------------------
// Production adapter
// ---------------------------------------------------------------------------

pub struct UtxorpcSourceAdapter {
    channel: Channel,
    api_key: String,
}

impl UtxorpcSourceAdapter {
    pub fn new(channel: Channel, api_key: String) -> Self {
        Self { channel, api_key }
    }

    pub async fn connect(url: &str, api_key: String) -> Result<Self, AdapterError> {
        let channel = Channel::from_shared(url.to_string())
            .map_err(|e| AdapterError::Auth(format!("invalid source endpoint: {e}")))?
            .connect()
            .await
            .map_err(|e| AdapterError::Transient(format!("could not connect to source: {e}")))?;
        Ok(Self::new(channel, api_key))
    }
}

#[async_trait]
impl SourceLedgerAdapter for UtxorpcSourceAdapter {
    async fn watch_addresses(&self, addresses: &[String]) -> Result<WatchStream, AdapterError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| AdapterError::Transient(format!("source channel not ready: {e}")))?;

        let request_body = WatchAddressesRequest {
            addresses: addresses.iter().map(|a| a.as_bytes().to_vec()).collect(),
        };
        let mut request = Request::new(request_body);
        let header_value = MetadataValue::try_from(self.api_key.as_str())
            .map_err(|_| AdapterError::Auth("invalid dmtr-api-key header value".into()))?;
        request.metadata_mut().insert("dmtr-api-key", header_value);

        let path = http::uri::PathAndQuery::from_static(
            "/utxorpc.v1alpha.watch.WatchService/WatchTx",
        );
        let codec = ProstCodec::default();
        let response: Response<tonic::codec::Streaming<WatchAddressesResponse>> = grpc
            .server_streaming(request, path, codec)
            .await
            .map_err(classify_status)?;

        let inbound = response.into_inner();
        let decoded = async_stream_decode(inbound);
        Ok(Box::pin(decoded))
    }
}

fn classify_status(status: Status) -> AdapterError {
    use tonic::Code;
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied => AdapterError::Auth(status.message().to_string()),
        Code::DeadlineExceeded | Code::Unavailable | Code::ResourceExhausted => {
            AdapterError::Transient(status.message().to_string())
        }
        _ => AdapterError::Transient(status.message().to_string()),
    }
}

fn async_stream_decode(
    mut inbound: tonic::codec::Streaming<WatchAddressesResponse>,
) -> impl Stream<Item = WatchResult> {
    async_stream::stream! {
        loop {
            match inbound.message().await {
                Ok(Some(msg)) => {
                    if msg.action != WireAction::Apply as i32 {
                        // Undo actions are filtered out entirely; this
                        // adapter only ever emits forward-applied deposits.
                        continue;
                    }
                    match decode_events(msg) {
                        Ok(events) => {
                            for event in events {
                                yield Ok(event);
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    yield Err(classify_status(status));
                    break;
                }
            }
        }
    }
}

/// Decodes one wire transaction into zero or more DepositEvents, one
/// per output. Callers are expected to have already filtered to watched addresses
/// server-side; this function decodes whatever outputs are present.
fn decode_events(msg: WatchAddressesResponse) -> Result<Vec<DepositEvent>, AdapterError> {
    let tx = msg
        .tx
        .ok_or_else(|| AdapterError::Decoding("apply action missing tx body".into()))?;

    let tx_hash = hex::encode(&tx.hash);

    let sender_address = tx
        .inputs
        .first()
        .and_then(|input| decode_bech32_lossy(&input.address))
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());

    let block_hash = if tx.block_hash.is_empty() {
        UNKNOWN_BLOCK.to_string()
    } else {
        hex::encode(&tx.block_hash)
    };

    let metadata = flatten_metadata(&tx.metadata);
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut events = Vec::with_capacity(tx.outputs.len());
    for (index, output) in tx.outputs.iter().enumerate() {
        let recipient_address = match decode_bech32_lossy(&output.address) {
            Some(addr) => addr,
            None => {
                warn!(tx_hash = %tx_hash, output_index = index, "could not decode recipient address, skipping output");
                continue;
            }
        };
        events.push(DepositEvent {
            tx_hash: tx_hash.clone(),
            sender_address: sender_address.clone(),
            recipient_address,
            amount: output.coin.into(),
            asset_type: if tx.asset_type.is_empty() {
                "ADA".to_string()
            } else {
                tx.asset_type.clone()
            },
            block_slot: tx.slot,
            block_hash: block_hash.clone(),
            output_index: index as u32,
            metadata: metadata.clone(),
            timestamp: now_ms,
        });
    }
    Ok(events)
}

/// Addresses are carried on the wire as raw bytes; this adapter treats
/// them as already bech32-encoded UTF-8 when possible (what a real
/// utxorpc deployment emits), falling back to hex for opaque bytes.
fn decode_bech32_lossy(raw: &[u8]) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(s) = std::str::from_utf8(raw) {
        if bech32::decode(s).is_ok() {
            return Some(s.to_string());
        }
    }
    Some(hex::encode(raw))
}

/// Text values pass through, integers and composites are stringified,
/// and byte values are UTF-8-decoded. An entry whose value can't be
/// represented as a string (non-UTF-8 bytes, or absent) is dropped
/// silently rather than surfacing a decoding error — metadata is
/// advisory, never load-bearing for bridge correctness.
fn flatten_metadata(entries: &[MetadatumEntry]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        if let Some(value) = stringify_metadatum(entry.value.as_ref()) {
            map.insert(entry.label.to_string(), value);
        }
    }
    map
}

fn stringify_metadatum(value: Option<&MetadatumValue>) -> Option<String> {
    match value {
        Some(MetadatumValue::Text(s)) => Some(s.clone()),
        Some(MetadatumValue::Int(i)) => Some(i.to_string()),
        Some(MetadatumValue::Bytes(b)) => std::str::from_utf8(b).ok().map(|s| s.to_string()),
        Some(MetadatumValue::Composite(list)) => {
            serde_json::to_string(&metadatum_list_to_json(list)).ok()
        }
        None => None,
    }
}

fn metadatum_list_to_json(list: &MetadatumList) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(list.items.len());
    for item in &list.items {
        if let Some(value) = metadatum_value_to_json(item.value.as_ref()) {
            map.insert(item.label.to_string(), value);
        }
    }
    serde_json::Value::Object(map)
}

fn metadatum_value_to_json(value: Option<&MetadatumValue>) -> Option<serde_json::Value> {
    match value {
        Some(MetadatumValue::Text(s)) => Some(serde_json::Value::String(s.clone())),
        Some(MetadatumValue::Int(i)) => Some(serde_json::Value::Number((*i).into())),
        Some(MetadatumValue::Bytes(b)) => {
            std::str::from_utf8(b).ok().map(|s| serde_json::Value::String(s.to_string()))
        }
        Some(MetadatumValue::Composite(list)) => Some(metadatum_list_to_json(list)),
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Fake adapter for tests
// ---------------------------------------------------------------------------

pub struct FakeSourceAdapter {
    events: std::sync::Mutex<Vec<WatchResult>>,
}

impl FakeSourceAdapter {
    pub fn new(events: Vec<WatchResult>) -> Self {
        Self {
            events: std::sync::Mutex::new(events),
        }
    }
}

#[async_trait]
impl SourceLedgerAdapter for FakeSourceAdapter {
    async fn watch_addresses(&self, _addresses: &[String]) -> Result<WatchStream, AdapterError> {
        let items = std::mem::take(&mut *self.events.lock().unwrap());
        let stream = futures::stream::iter(items);
        Ok(Box::pin(stream))
    }
}
