//! Configuration and wire types.
//!
//! Configuration is loaded once from the environment into an immutable
//! `Config` and threaded through handlers and the keeper; pause flags are
//! read through the typed `Gates` struct rather than ad-hoc env lookups.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Hard cap on the protocol fee.
const MAX_FEE_BPS: u16 = 1_500;

// =============================================================================
// Markets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketSymbol {
    Sol,
    Btc,
    Eth,
}

impl MarketSymbol {
    pub const ALL: [MarketSymbol; 3] = [MarketSymbol::Sol, MarketSymbol::Btc, MarketSymbol::Eth];

    pub fn as_str(self) -> &'static str {
        match self {
            MarketSymbol::Sol => "SOL",
            MarketSymbol::Btc => "BTC",
            MarketSymbol::Eth => "ETH",
        }
    }

    /// Asset pair label for the oracle endpoint.
    pub fn asset(self) -> &'static str {
        match self {
            MarketSymbol::Sol => "SOL/USD",
            MarketSymbol::Btc => "BTC/USD",
            MarketSymbol::Eth => "ETH/USD",
        }
    }

    /// Stable market code used in on-chain PDA seeds.
    pub fn code(self) -> u8 {
        match self {
            MarketSymbol::Sol => 0,
            MarketSymbol::Btc => 1,
            MarketSymbol::Eth => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SOL" => Some(MarketSymbol::Sol),
            "BTC" => Some(MarketSymbol::Btc),
            "ETH" => Some(MarketSymbol::Eth),
            _ => None,
        }
    }
}

/// One tradeable market: symbol plus its oracle binding. Immutable per
/// deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub symbol: MarketSymbol,
    /// Feed identity joins must match.
    pub feed_id: String,
    /// Price account queried for snapshots.
    pub oracle_account: String,
    /// Program expected to own the price account.
    pub expected_owner: String,
}

// =============================================================================
// Pause gates
// =============================================================================

/// Global operation gates, loaded once.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Gates {
    pub joins_paused: bool,
    pub settle_paused: bool,
    pub sim_settle_paused: bool,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,

    pub fee_bps: u16,
    pub open_seconds: i64,
    pub lock_seconds: i64,
    pub settle_seconds: i64,
    pub oracle_max_age_sec: i64,
    pub keeper_interval_ms: u64,
    pub round_lock_ttl_secs: u64,
    pub status_cache_ms: u64,

    pub settle_key: Option<String>,
    pub ops_key: Option<String>,
    pub treasury_wallet: String,
    pub expected_treasury_wallet: Option<String>,
    /// When set, joins require a verified escrow deposit (server custody);
    /// when unset the backend runs in pre-custody simulation mode.
    pub escrow_wallet: Option<String>,

    pub stake_tiers: Vec<u64>,
    pub join_ip_limit: u64,
    pub join_ip_window_ms: i64,
    pub join_wallet_limit: u64,
    pub join_wallet_window_ms: i64,
    pub api_rate_limit: u32,
    pub api_rate_window_secs: u64,

    pub rpc_url: String,
    pub markets: Vec<Market>,
    pub gates: Gates,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let fee_bps: u16 = env_parse("FEE_BPS", 600);
        if fee_bps > MAX_FEE_BPS {
            bail!("FEE_BPS {} exceeds maximum {}", fee_bps, MAX_FEE_BPS);
        }

        let open_seconds: i64 = env_parse("OPEN_SECONDS", 60);
        let lock_seconds: i64 = env_parse("LOCK_SECONDS", 60);
        let settle_seconds: i64 = env_parse("SETTLE_SECONDS", 300);
        if open_seconds <= 0 || settle_seconds < open_seconds {
            bail!(
                "invalid round timing: OPEN_SECONDS={} SETTLE_SECONDS={}",
                open_seconds,
                settle_seconds
            );
        }

        let stake_tiers: Vec<u64> = env_str(
            "STAKE_TIERS_LAMPORTS",
            "10000000,50000000,100000000,250000000,500000000,1000000000",
        )
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
        if stake_tiers.is_empty() {
            bail!("STAKE_TIERS_LAMPORTS parsed to an empty tier set");
        }

        let expected_owner = env_str(
            "ORACLE_OWNER_PROGRAM",
            "FsJ3A3u2vn5cTVofAjvy6y5kwABJAqYWpe4NNxvrEkcs",
        );
        let markets = vec![
            Market {
                symbol: MarketSymbol::Sol,
                feed_id: env_str("SOL_FEED_ID", "H6ARHf6YXhGYeQfUzQNGk6rDNnLBQKrenN712K4AQJEG"),
                oracle_account: env_str(
                    "SOL_ORACLE_ACCOUNT",
                    "H6ARHf6YXhGYeQfUzQNGk6rDNnLBQKrenN712K4AQJEG",
                ),
                expected_owner: expected_owner.clone(),
            },
            Market {
                symbol: MarketSymbol::Btc,
                feed_id: env_str("BTC_FEED_ID", "GVXRSBjFk6e6J3NbVPXohDJetcTjaeeuykUpbQF8UoMU"),
                oracle_account: env_str(
                    "BTC_ORACLE_ACCOUNT",
                    "GVXRSBjFk6e6J3NbVPXohDJetcTjaeeuykUpbQF8UoMU",
                ),
                expected_owner: expected_owner.clone(),
            },
            Market {
                symbol: MarketSymbol::Eth,
                feed_id: env_str("ETH_FEED_ID", "JBu1AL4obBcCMqKBBxhpWCNUt136ijcuMZLFvTP7iWdB"),
                oracle_account: env_str(
                    "ETH_ORACLE_ACCOUNT",
                    "JBu1AL4obBcCMqKBBxhpWCNUt136ijcuMZLFvTP7iWdB",
                ),
                expected_owner,
            },
        ];

        Ok(Self {
            port: env_parse("PORT", 8080),
            database_path: env_str("DATABASE_PATH", "./pancho.db"),
            fee_bps,
            open_seconds,
            lock_seconds,
            settle_seconds,
            oracle_max_age_sec: env_parse("ORACLE_MAX_AGE_SEC", 120),
            keeper_interval_ms: env_parse("KEEPER_INTERVAL_MS", 4000),
            round_lock_ttl_secs: env_parse("ROUND_LOCK_TTL_SECS", 900),
            status_cache_ms: env_parse("STATUS_CACHE_MS", 2000),
            settle_key: env_opt("SETTLE_KEY"),
            ops_key: env_opt("OPS_KEY"),
            treasury_wallet: env_str("TREASURY_WALLET", ""),
            expected_treasury_wallet: env_opt("EXPECTED_TREASURY_WALLET"),
            escrow_wallet: env_opt("ESCROW_WALLET"),
            stake_tiers,
            join_ip_limit: env_parse("JOIN_IP_LIMIT", 20),
            join_ip_window_ms: env_parse("JOIN_IP_WINDOW_MS", 60_000),
            join_wallet_limit: env_parse("JOIN_WALLET_LIMIT", 8),
            join_wallet_window_ms: env_parse("JOIN_WALLET_WINDOW_MS", 60_000),
            api_rate_limit: env_parse("API_RATE_LIMIT", 120),
            api_rate_window_secs: env_parse("API_RATE_WINDOW_SECS", 60),
            rpc_url: env_str("ORACLE_RPC_URL", "https://api.mainnet-beta.solana.com"),
            markets,
            gates: Gates {
                joins_paused: env_flag("PAUSE_JOINS"),
                settle_paused: env_flag("PAUSE_SETTLE"),
                sim_settle_paused: env_flag("PAUSE_SIM_SETTLE"),
            },
        })
    }

    pub fn market(&self, symbol: MarketSymbol) -> Option<&Market> {
        self.markets.iter().find(|m| m.symbol == symbol)
    }

    /// Treasury hard lock: abort keepers and settlers on mismatch.
    pub fn check_treasury_lock(&self) -> Result<()> {
        if let Some(expected) = &self.expected_treasury_wallet {
            if *expected != self.treasury_wallet {
                bail!(
                    "treasury lock mismatch: configured {:?}, expected {:?}",
                    self.treasury_wallet,
                    expected
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Wire payloads
// =============================================================================

/// `POST /entries` request body (server-custody mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub round_id: String,
    pub market: String,
    pub feed_id: String,
    pub round_start_ms: i64,
    pub round_end_ms: i64,
    pub wallet: String,
    pub direction: String,
    #[serde(default)]
    pub stake_usd: f64,
    pub stake_lamports: u64,
    #[serde(default)]
    pub signature: String,
    /// Client-reported; informational only, never trusted for ordering.
    #[serde(default)]
    pub joined_at_ms: i64,
    #[serde(default)]
    pub start_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub ok: bool,
    pub created: bool,
}

/// `GET /oracle` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    pub market: String,
    pub asset: String,
    pub source: String,
    pub feed_id: String,
    pub price: f64,
    pub confidence: f64,
    pub publish_time: i64,
    pub fetched_at: i64,
}

/// `POST /settle` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleResponse {
    pub ok: bool,
    pub settled: Vec<String>,
}

/// `GET /status` and `GET /ops/health` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub status: String,
    pub joins_paused: bool,
    pub settlement_paused: bool,
    pub pending_due_rounds: u64,
    pub max_settlement_lag_ms: i64,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_rounds: Option<Vec<String>>,
}
