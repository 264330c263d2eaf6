//! Join handler: validated, rate-limited, replay-safe entry submission.
//!
//! Ordering of checks follows the wire contract: pause gate, per-IP then
//! per-wallet rate buckets, payload validation, open-window check, escrow
//! deposit verification, ledger insert. `joined_at` is always the
//! server-received time; the client's clock never orders payouts.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::ledger::{EntryRecord, Ledger, RateScope};
use crate::engine::round::{self, Round, RoundSchedule, RoundStatus, Side};
use crate::engine::transfer::{DepositCheck, DepositError, DepositVerifier};
use crate::models::{Config, JoinRequest, MarketSymbol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    Paused,
    RateLimited { scope: &'static str, retry_after_sec: u64 },
    Validation(String),
    /// Ledger or verifier transport failure; client may retry.
    Transient(String),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Paused => write!(f, "joins are paused"),
            JoinError::RateLimited { scope, retry_after_sec } => {
                write!(f, "rate limited by {} (retry in {}s)", scope, retry_after_sec)
            }
            JoinError::Validation(msg) => write!(f, "{}", msg),
            JoinError::Transient(msg) => write!(f, "temporary failure: {}", msg),
        }
    }
}

impl std::error::Error for JoinError {}

fn validation(msg: &str) -> JoinError {
    JoinError::Validation(msg.to_string())
}

/// Base58 shape check for wallet addresses.
fn is_well_formed_wallet(wallet: &str) -> bool {
    const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    (32..=44).contains(&wallet.len()) && wallet.chars().all(|c| ALPHABET.contains(c))
}

pub struct JoinHandler {
    ledger: Arc<dyn Ledger>,
    verifier: Arc<dyn DepositVerifier>,
    config: Arc<Config>,
    schedule: RoundSchedule,
}

impl JoinHandler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        verifier: Arc<dyn DepositVerifier>,
        config: Arc<Config>,
        schedule: RoundSchedule,
    ) -> Self {
        Self { ledger, verifier, config, schedule }
    }

    /// Process one submission. Returns whether a new entry was created;
    /// replays of a known identity are a no-op success (`false`).
    pub async fn handle(&self, req: &JoinRequest, ip: &str, now_ms: i64) -> Result<bool, JoinError> {
        if self.config.gates.joins_paused {
            return Err(JoinError::Paused);
        }

        self.enforce_rate_limits(&req.wallet, ip, now_ms)?;

        let (market, start_ts) = self.validate_payload(req)?;
        let side = Side::parse(&req.direction).ok_or_else(|| validation("invalid direction"))?;

        let lock_ts = self.schedule.lock_ts(start_ts);
        let now = now_ms.div_euclid(1000);
        if now < start_ts || now >= lock_ts {
            return Err(validation("round not open"));
        }

        // Server-custody mode: the claimed stake must already sit in escrow,
        // with a matching memo and a block time inside the open window.
        if let Some(escrow) = &self.config.escrow_wallet {
            if req.signature.is_empty() {
                return Err(validation("missing deposit signature"));
            }
            let check = DepositCheck {
                signature: req.signature.clone(),
                wallet: req.wallet.clone(),
                escrow: escrow.clone(),
                expected_units: req.stake_lamports,
                memo: req.round_id.clone(),
                window_start_ms: start_ts * 1000,
                window_end_ms: lock_ts * 1000,
            };
            match self.verifier.verify(&check).await {
                Ok(()) => {}
                Err(DepositError::Mismatch(msg)) => {
                    warn!(wallet = %req.wallet, round_id = %req.round_id, error = %msg, "deposit rejected");
                    return Err(validation("deposit verification failed"));
                }
                Err(DepositError::Transient(msg)) => return Err(JoinError::Transient(msg)),
            }
        }

        self.ensure_round(market, start_ts, now, now_ms)?;

        // Replay-safe identity: the deposit signature in custody mode, a
        // server-assigned id otherwise.
        let signature = if req.signature.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            req.signature.clone()
        };

        let created = self
            .ledger
            .add_entry(&EntryRecord {
                signature,
                round_id: req.round_id.clone(),
                wallet: req.wallet.clone(),
                side,
                stake_units: req.stake_lamports,
                joined_at_ms: now_ms,
            })
            .map_err(|e| JoinError::Transient(e.to_string()))?;

        if !created {
            debug!(round_id = %req.round_id, wallet = %req.wallet, "replayed entry identity; no-op");
        }
        Ok(created)
    }

    fn enforce_rate_limits(&self, wallet: &str, ip: &str, now_ms: i64) -> Result<(), JoinError> {
        self.ledger
            .record_join_attempt(wallet, ip, now_ms)
            .map_err(|e| JoinError::Transient(e.to_string()))?;

        let ip_count = self
            .ledger
            .count_recent_attempts(RateScope::Ip, ip, self.config.join_ip_window_ms, now_ms)
            .map_err(|e| JoinError::Transient(e.to_string()))?;
        if ip_count > self.config.join_ip_limit {
            return Err(JoinError::RateLimited {
                scope: "ip",
                retry_after_sec: (self.config.join_ip_window_ms / 1000).max(1) as u64,
            });
        }

        let wallet_count = self
            .ledger
            .count_recent_attempts(RateScope::Wallet, wallet, self.config.join_wallet_window_ms, now_ms)
            .map_err(|e| JoinError::Transient(e.to_string()))?;
        if wallet_count > self.config.join_wallet_limit {
            return Err(JoinError::RateLimited {
                scope: "wallet",
                retry_after_sec: (self.config.join_wallet_window_ms / 1000).max(1) as u64,
            });
        }
        Ok(())
    }

    /// Structural payload validation; returns the parsed market binding.
    fn validate_payload(&self, req: &JoinRequest) -> Result<(MarketSymbol, i64), JoinError> {
        let symbol = MarketSymbol::parse(&req.market).ok_or_else(|| validation("unknown market"))?;
        let market = self
            .config
            .market(symbol)
            .ok_or_else(|| validation("unknown market"))?;
        if req.feed_id != market.feed_id {
            return Err(validation("feed does not match market"));
        }

        if !self.config.stake_tiers.contains(&req.stake_lamports) {
            return Err(validation("stake not in tier set"));
        }

        if !is_well_formed_wallet(&req.wallet) {
            return Err(validation("malformed wallet"));
        }

        if req.round_start_ms % 1000 != 0 {
            return Err(validation("round start not second-aligned"));
        }
        let start_ts = req.round_start_ms / 1000;
        if !self.schedule.is_aligned(start_ts) {
            return Err(validation("round start not cycle-aligned"));
        }

        let (id_market, id_start) =
            round::parse_round_id(&req.round_id).ok_or_else(|| validation("malformed round id"))?;
        if id_market != symbol || id_start != start_ts {
            return Err(validation("round id does not match schedule"));
        }

        let expected_end_ms =
            req.round_start_ms + (self.schedule.open_seconds + self.schedule.settle_seconds) * 1000;
        if req.round_end_ms != expected_end_ms {
            return Err(validation("round end does not match schedule"));
        }

        Ok((symbol, start_ts))
    }

    /// Confirm the round exists and is open; in pre-custody mode the first
    /// join creates it lazily.
    fn ensure_round(&self, market: MarketSymbol, start_ts: i64, now: i64, now_ms: i64) -> Result<(), JoinError> {
        let id = round::round_id(market, start_ts);
        let existing = self
            .ledger
            .round(&id)
            .map_err(|e| JoinError::Transient(e.to_string()))?;

        match existing {
            Some(r) if r.status == RoundStatus::Open => Ok(()),
            Some(_) => Err(validation("round not open")),
            None if self.config.escrow_wallet.is_none() => {
                let created = Round::create(market, start_ts, &self.schedule, now, now_ms)
                    .map_err(|e| validation(&e.to_string()))?;
                self.ledger
                    .create_round(&created)
                    .map_err(|e| JoinError::Transient(e.to_string()))?;
                Ok(())
            }
            None => Err(validation("unknown round")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite_ledger::SqliteLedger;
    use crate::engine::transfer::PaperDepositVerifier;
    use crate::models::{Gates, Market};
    use async_trait::async_trait;

    const WALLET: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    fn config(escrow: Option<&str>) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            database_path: String::new(),
            fee_bps: 600,
            open_seconds: 60,
            lock_seconds: 60,
            settle_seconds: 300,
            oracle_max_age_sec: 120,
            keeper_interval_ms: 4000,
            round_lock_ttl_secs: 900,
            status_cache_ms: 2000,
            settle_key: None,
            ops_key: None,
            treasury_wallet: "treasury".to_string(),
            expected_treasury_wallet: None,
            escrow_wallet: escrow.map(|s| s.to_string()),
            stake_tiers: vec![50, 100],
            join_ip_limit: 3,
            join_ip_window_ms: 60_000,
            join_wallet_limit: 2,
            join_wallet_window_ms: 60_000,
            api_rate_limit: 120,
            api_rate_window_secs: 60,
            rpc_url: String::new(),
            markets: vec![Market {
                symbol: MarketSymbol::Sol,
                feed_id: "feed-sol".to_string(),
                oracle_account: "acct-sol".to_string(),
                expected_owner: "oracle-program".to_string(),
            }],
            gates: Gates::default(),
        })
    }

    fn handler(escrow: Option<&str>) -> JoinHandler {
        let config = config(escrow);
        JoinHandler::new(
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            Arc::new(PaperDepositVerifier),
            config,
            RoundSchedule::new(60, 60, 300).unwrap(),
        )
    }

    fn request() -> JoinRequest {
        JoinRequest {
            round_id: "SOL-1200-5m".to_string(),
            market: "SOL".to_string(),
            feed_id: "feed-sol".to_string(),
            round_start_ms: 1_200_000,
            round_end_ms: 1_560_000,
            wallet: WALLET.to_string(),
            direction: "UP".to_string(),
            stake_usd: 10.0,
            stake_lamports: 50,
            signature: "deposit-sig-1".to_string(),
            joined_at_ms: 0,
            start_price: None,
        }
    }

    // Inside the open window [1200, 1260).
    const NOW_MS: i64 = 1_210_000;

    #[tokio::test]
    async fn test_join_creates_entry() {
        let handler = handler(None);
        assert!(handler.handle(&request(), "1.2.3.4", NOW_MS).await.unwrap());

        let entries = handler.ledger.entries_for_round("SOL-1200-5m").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].wallet, WALLET);
        // server-received time, not the client's
        assert_eq!(entries[0].joined_at_ms, NOW_MS);
    }

    #[tokio::test]
    async fn test_replay_is_noop_success() {
        let handler = handler(None);
        assert!(handler.handle(&request(), "1.2.3.4", NOW_MS).await.unwrap());
        assert!(!handler.handle(&request(), "1.2.3.4", NOW_MS + 1).await.unwrap());
        assert_eq!(handler.ledger.entries_for_round("SOL-1200-5m").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_paused_rejects() {
        let mut cfg = (*config(None)).clone();
        cfg.gates.joins_paused = true;
        let handler = JoinHandler::new(
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            Arc::new(PaperDepositVerifier),
            Arc::new(cfg),
            RoundSchedule::new(60, 60, 300).unwrap(),
        );
        assert_eq!(handler.handle(&request(), "1.2.3.4", NOW_MS).await, Err(JoinError::Paused));
    }

    #[tokio::test]
    async fn test_late_join_rejected_at_lock() {
        let handler = handler(None);
        // now == lock_ts exactly
        let err = handler.handle(&request(), "1.2.3.4", 1_260_000).await.unwrap_err();
        assert_eq!(err, JoinError::Validation("round not open".to_string()));
        assert!(handler.ledger.entries_for_round("SOL-1200-5m").unwrap().is_empty());
    }

    async fn expect_validation(mutate: impl FnOnce(&mut JoinRequest), expected: &str) {
        // Fresh handler per case so rate buckets never interfere.
        let handler = handler(None);
        let mut req = request();
        mutate(&mut req);
        match handler.handle(&req, "1.2.3.4", NOW_MS).await.unwrap_err() {
            JoinError::Validation(msg) => assert_eq!(msg, expected),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_failures() {
        expect_validation(|r| r.market = "DOGE".to_string(), "unknown market").await;
        expect_validation(|r| r.feed_id = "feed-other".to_string(), "feed does not match market").await;
        expect_validation(|r| r.stake_lamports = 33, "stake not in tier set").await;
        expect_validation(|r| r.direction = "SIDEWAYS".to_string(), "invalid direction").await;
        expect_validation(|r| r.wallet = "short".to_string(), "malformed wallet").await;
        expect_validation(
            |r| r.round_id = "SOL-1320-5m".to_string(),
            "round id does not match schedule",
        )
        .await;
        expect_validation(|r| r.round_end_ms = 1_500_000, "round end does not match schedule").await;
        expect_validation(|r| r.round_start_ms = 1_230_000, "round start not cycle-aligned").await;
    }

    #[tokio::test]
    async fn test_ip_rate_limit() {
        let handler = handler(None);
        // limit 3 per window; the 4th attempt from one IP trips it even
        // across wallets
        let wallets = [
            WALLET,
            "8yPdVvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFia",
            "7zRcUvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFib",
            "6wSbTvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFic",
        ];
        for (i, wallet) in wallets.iter().enumerate() {
            let mut req = request();
            req.wallet = wallet.to_string();
            req.signature = format!("deposit-sig-{}", i);
            let result = handler.handle(&req, "1.2.3.4", NOW_MS + i as i64).await;
            if i < 3 {
                assert!(result.is_ok(), "attempt {} should pass", i);
            } else {
                assert!(matches!(result, Err(JoinError::RateLimited { scope: "ip", .. })));
            }
        }
    }

    #[tokio::test]
    async fn test_wallet_rate_limit() {
        let handler = handler(None);
        for i in 0..3 {
            let mut req = request();
            req.signature = format!("deposit-sig-{}", i);
            // distinct IPs so only the wallet bucket can trip
            let ip = format!("10.0.0.{}", i);
            let result = handler.handle(&req, &ip, NOW_MS + i).await;
            if i < 2 {
                assert!(result.is_ok(), "attempt {} should pass", i);
            } else {
                assert!(matches!(result, Err(JoinError::RateLimited { scope: "wallet", .. })));
            }
        }
    }

    #[tokio::test]
    async fn test_custody_mode_requires_signature_and_known_round() {
        let handler = handler(Some("escrow-wallet"));

        let mut no_sig = request();
        no_sig.signature = String::new();
        assert!(matches!(
            handler.handle(&no_sig, "ip", NOW_MS).await.unwrap_err(),
            JoinError::Validation(msg) if msg == "missing deposit signature"
        ));

        // keeper has not created the round; no lazy creation in custody mode
        assert!(matches!(
            handler.handle(&request(), "ip", NOW_MS).await.unwrap_err(),
            JoinError::Validation(msg) if msg == "unknown round"
        ));
    }

    struct RejectingVerifier;

    #[async_trait]
    impl DepositVerifier for RejectingVerifier {
        async fn verify(&self, _check: &DepositCheck) -> Result<(), DepositError> {
            Err(DepositError::Mismatch("no matching deposit".to_string()))
        }
    }

    #[tokio::test]
    async fn test_custody_mode_rejects_unverified_deposit() {
        let handler = JoinHandler::new(
            Arc::new(SqliteLedger::open_in_memory().unwrap()),
            Arc::new(RejectingVerifier),
            config(Some("escrow-wallet")),
            RoundSchedule::new(60, 60, 300).unwrap(),
        );
        assert!(matches!(
            handler.handle(&request(), "ip", NOW_MS).await.unwrap_err(),
            JoinError::Validation(msg) if msg == "deposit verification failed"
        ));
    }
}
