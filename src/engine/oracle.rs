//! Oracle port: validated price snapshots for lock and settlement.
//!
//! The transport (`OracleSource`) is deliberately narrow: it returns a raw
//! snapshot for a `(market, unix_ts)` query. Everything callers rely on
//! lives here:
//! - owner authenticity and freshness validation,
//! - a single-flight cache so concurrent identical requests share one fetch
//!   and replays inside the grace window are deterministic,
//! - the ±10 s nearest-timestamp fallback used by settlement,
//! - byte-level parsing of legacy oracle price accounts.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{Market, MarketSymbol};

/// Offsets searched on either side of the target timestamp when the exact
/// snapshot is stale.
pub const NEAREST_SEARCH_RADIUS_SECS: i64 = 10;

/// Snapshots stay cached (and therefore replay-stable) this long.
const CACHE_GRACE_SECS: i64 = 600;

/// Bound on cached `(market, ts)` slots before pruning.
const CACHE_SLOT_LIMIT: usize = 4096;

// =============================================================================
// Snapshot & errors
// =============================================================================

/// A validated oracle observation: integer mantissa `price * 10^expo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSnapshot {
    pub price: i64,
    pub expo: i32,
    pub publish_time: i64,
    pub confidence: u64,
    /// Identity of the program that owns the price account.
    pub source_owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// Transport failure; retryable.
    Unreachable(String),
    /// Snapshot outside the freshness tolerance for the requested instant.
    Stale { requested_ts: i64, publish_time: i64 },
    /// Price account owned by an unexpected program; fatal for the round.
    OwnerMismatch { expected: String, actual: String },
    /// Account bytes failed layout or trading-status checks.
    InvalidPrice,
}

impl OracleError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::Unreachable(_))
    }
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleError::Unreachable(msg) => write!(f, "oracle unreachable: {}", msg),
            OracleError::Stale { requested_ts, publish_time } => write!(
                f,
                "stale oracle price: requested ts {}, published {}",
                requested_ts, publish_time
            ),
            OracleError::OwnerMismatch { expected, actual } => {
                write!(f, "oracle owner mismatch: expected {}, got {}", expected, actual)
            }
            OracleError::InvalidPrice => write!(f, "invalid oracle price account"),
        }
    }
}

impl std::error::Error for OracleError {}

// =============================================================================
// Source port
// =============================================================================

/// Transport for raw snapshots. Implementations handle their own I/O
/// retries; validation belongs to [`OraclePort`].
#[async_trait]
pub trait OracleSource: Send + Sync {
    async fn snapshot_at(&self, market: MarketSymbol, unix_ts: i64) -> Result<OracleSnapshot, OracleError>;
}

// =============================================================================
// Port
// =============================================================================

type SlotKey = (MarketSymbol, i64);
type Slot = Arc<tokio::sync::Mutex<Option<OracleSnapshot>>>;

/// Validated, cached access to oracle prices.
pub struct OraclePort {
    source: Arc<dyn OracleSource>,
    max_age_secs: i64,
    slots: Mutex<HashMap<SlotKey, Slot>>,
}

impl OraclePort {
    pub fn new(source: Arc<dyn OracleSource>, max_age_secs: i64) -> Self {
        Self {
            source,
            max_age_secs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, market: MarketSymbol, ts: i64) -> Slot {
        let mut slots = self.slots.lock();
        if slots.len() > CACHE_SLOT_LIMIT {
            let horizon = ts - CACHE_GRACE_SECS;
            slots.retain(|&(_, slot_ts), _| slot_ts >= horizon);
        }
        slots.entry((market, ts)).or_default().clone()
    }

    /// Fetch the raw snapshot for `(market, ts)`, sharing one in-flight
    /// request per key and replaying cached results.
    async fn fetch(&self, market: MarketSymbol, ts: i64) -> Result<OracleSnapshot, OracleError> {
        let slot = self.slot(market, ts);
        let mut guard = slot.lock().await;
        if let Some(snap) = guard.as_ref() {
            return Ok(snap.clone());
        }
        let snap = self.source.snapshot_at(market, ts).await?;
        *guard = Some(snap.clone());
        Ok(snap)
    }

    fn validate(&self, market: &Market, ts: i64, snap: OracleSnapshot) -> Result<OracleSnapshot, OracleError> {
        if snap.source_owner != market.expected_owner {
            return Err(OracleError::OwnerMismatch {
                expected: market.expected_owner.clone(),
                actual: snap.source_owner,
            });
        }
        if (snap.publish_time - ts).abs() > self.max_age_secs {
            return Err(OracleError::Stale {
                requested_ts: ts,
                publish_time: snap.publish_time,
            });
        }
        Ok(snap)
    }

    /// Price at an exact instant, fully validated.
    pub async fn price_at(&self, market: &Market, unix_ts: i64) -> Result<OracleSnapshot, OracleError> {
        let snap = self.fetch(market.symbol, unix_ts).await?;
        self.validate(market, unix_ts, snap)
    }

    /// Price at or near an instant: tries the exact timestamp first, then
    /// widens to ±10 s preferring earlier instants. Owner mismatches abort
    /// the search; a fully stale neighborhood surfaces the original
    /// staleness so settlement can fall back to a refund.
    pub async fn price_near(&self, market: &Market, unix_ts: i64) -> Result<OracleSnapshot, OracleError> {
        let mut first_stale: Option<OracleError> = None;
        for offset in search_offsets() {
            match self.price_at(market, unix_ts + offset).await {
                Ok(snap) => return Ok(snap),
                Err(err @ OracleError::Stale { .. }) => {
                    first_stale.get_or_insert(err);
                }
                // Owner mismatches and transport failures abort the search.
                Err(err) => return Err(err),
            }
        }
        Err(first_stale.unwrap_or(OracleError::InvalidPrice))
    }
}

/// Search order: 0, -1, +1, -2, +2, … out to the radius.
fn search_offsets() -> impl Iterator<Item = i64> {
    std::iter::once(0).chain((1..=NEAREST_SEARCH_RADIUS_SECS).flat_map(|d| [-d, d]))
}

// =============================================================================
// Legacy price-account layout
// =============================================================================

// Byte offsets of the legacy oracle price account the settlement side
// asserts before trusting a snapshot.
const LEGACY_MAGIC: u32 = 0xa1b2_c3d4;
const LEGACY_VERSION_2: u32 = 2;
const LEGACY_ACCOUNT_TYPE_PRICE: u32 = 3;
const LEGACY_STATUS_TRADING: u32 = 1;
const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_ACCOUNT_TYPE: usize = 8;
const OFFSET_EXPO: usize = 20;
const OFFSET_TIMESTAMP: usize = 96;
const OFFSET_AGG_PRICE: usize = 208;
const OFFSET_AGG_CONF: usize = 216;
const OFFSET_AGG_STATUS: usize = 224;
const OFFSET_AGG_PUB_SLOT: usize = 232;
const LEGACY_MIN_LEN: usize = 240;

/// Fields read out of a legacy price account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceAccount {
    pub price: i64,
    pub expo: i32,
    pub confidence: u64,
    pub publish_time: i64,
    pub status: u32,
    pub pub_slot: u64,
}

impl PriceAccount {
    pub fn is_trading(&self) -> bool {
        self.status == LEGACY_STATUS_TRADING
    }

    /// Build a snapshot, rejecting non-trading statuses.
    pub fn into_snapshot(self, source_owner: String) -> Result<OracleSnapshot, OracleError> {
        if !self.is_trading() {
            return Err(OracleError::InvalidPrice);
        }
        Ok(OracleSnapshot {
            price: self.price,
            expo: self.expo,
            publish_time: self.publish_time,
            confidence: self.confidence,
            source_owner,
        })
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_i32_le(data: &[u8], offset: usize) -> Option<i32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_i64_le(data: &[u8], offset: usize) -> Option<i64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(i64::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Parse a legacy price account, checking magic, version and account type.
pub fn parse_price_account(data: &[u8]) -> Option<PriceAccount> {
    if data.len() < LEGACY_MIN_LEN {
        return None;
    }
    if read_u32_le(data, OFFSET_MAGIC)? != LEGACY_MAGIC {
        return None;
    }
    if read_u32_le(data, OFFSET_VERSION)? != LEGACY_VERSION_2 {
        return None;
    }
    if read_u32_le(data, OFFSET_ACCOUNT_TYPE)? != LEGACY_ACCOUNT_TYPE_PRICE {
        return None;
    }
    Some(PriceAccount {
        price: read_i64_le(data, OFFSET_AGG_PRICE)?,
        expo: read_i32_le(data, OFFSET_EXPO)?,
        confidence: read_u64_le(data, OFFSET_AGG_CONF)?,
        publish_time: read_i64_le(data, OFFSET_TIMESTAMP)?,
        status: read_u32_le(data, OFFSET_AGG_STATUS)?,
        pub_slot: read_u64_le(data, OFFSET_AGG_PUB_SLOT)?,
    })
}

// =============================================================================
// JSON-RPC transport
// =============================================================================

/// Fetches price accounts over JSON-RPC and parses the legacy layout.
///
/// One source serves all markets; the account to query comes from the
/// market registry.
pub struct RpcOracleSource {
    client: reqwest::Client,
    endpoint: String,
    accounts: HashMap<MarketSymbol, String>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: (&'a str, serde_json::Value),
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<RpcResult>,
}

#[derive(Deserialize)]
struct RpcResult {
    value: Option<RpcAccount>,
}

#[derive(Deserialize)]
struct RpcAccount {
    data: (String, String),
    owner: String,
}

impl RpcOracleSource {
    pub fn new(endpoint: String, accounts: HashMap<MarketSymbol, String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self { client, endpoint, accounts }
    }
}

#[async_trait]
impl OracleSource for RpcOracleSource {
    async fn snapshot_at(&self, market: MarketSymbol, _unix_ts: i64) -> Result<OracleSnapshot, OracleError> {
        let account = self
            .accounts
            .get(&market)
            .ok_or(OracleError::InvalidPrice)?;

        let req = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "getAccountInfo",
            params: (account.as_str(), serde_json::json!({ "encoding": "base64" })),
        };

        let resp: RpcResponse = self
            .client
            .post(&self.endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| OracleError::Unreachable(e.to_string()))?;

        let value = resp
            .result
            .and_then(|r| r.value)
            .ok_or(OracleError::InvalidPrice)?;
        let bytes = BASE64
            .decode(value.data.0.as_bytes())
            .map_err(|_| OracleError::InvalidPrice)?;
        let parsed = parse_price_account(&bytes).ok_or(OracleError::InvalidPrice)?;
        parsed.into_snapshot(value.owner)
    }
}
