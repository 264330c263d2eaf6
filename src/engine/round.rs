//! Round model and state machine.
//!
//! A round is a time-boxed up/down prediction interval over a single market:
//!
//! ```text
//!   start_ts ──── lock_ts ─────────────── end_ts
//!      │  OPEN      │        LOCKED          │  SETTLED
//!      │  joins     │  start price frozen    │  end price frozen, plan built
//! ```
//!
//! Transitions are strictly monotone and guarded; a round that misses its
//! lock grace window settles as a refund with no start price. All guards
//! live here so the settlement engine and keeper share one set of rules.

use serde::{Deserialize, Serialize};

use crate::engine::oracle::OracleSnapshot;
use crate::models::MarketSymbol;

/// Seconds after `lock_ts` during which locking is still valid.
pub const LOCK_GRACE_SECONDS: i64 = 45;

/// A round must be created at least this many seconds before its lock.
pub const MIN_CREATION_SLACK_SECS: i64 = 2;

/// Wire suffix of the round identity format.
const ROUND_ID_SUFFIX: &str = "5m";

// =============================================================================
// Sum types
// =============================================================================

/// One of the two opposing buckets of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    /// Stable on-chain side code (0 = UP, 1 = DOWN).
    pub fn code(self) -> u8 {
        match self {
            Side::Up => 0,
            Side::Down => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Side::Up),
            1 => Some(Side::Down),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Up => "UP",
            Side::Down => "DOWN",
        }
    }

    /// Parse the wire direction field.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" | "up" => Some(Side::Up),
            "DOWN" | "down" => Some(Side::Down),
            _ => None,
        }
    }
}

/// Round lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Open,
    Locked,
    Settled,
}

impl RoundStatus {
    pub fn code(self) -> u8 {
        match self {
            RoundStatus::Open => 0,
            RoundStatus::Locked => 1,
            RoundStatus::Settled => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RoundStatus::Open),
            1 => Some(RoundStatus::Locked),
            2 => Some(RoundStatus::Settled),
            _ => None,
        }
    }
}

/// How a settled round pays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleMode {
    /// Winner side splits the pool minus the fee.
    Win,
    /// Stakes are returned pro-rata, no fee.
    Refund,
}

impl SettleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SettleMode::Win => "WIN",
            SettleMode::Refund => "REFUND",
        }
    }
}

/// Guard failures for round transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    InvalidSchedule,
    TooLateToCreate,
    NotOpen,
    TooEarlyToLock,
    LockWindowExpired,
    AlreadyLocked,
    TooEarlyToSettle,
    AlreadySettled,
}

impl std::fmt::Display for RoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            RoundError::InvalidSchedule => "invalid round schedule",
            RoundError::TooLateToCreate => "too late to create round",
            RoundError::NotOpen => "round not open",
            RoundError::TooEarlyToLock => "too early to lock",
            RoundError::LockWindowExpired => "lock window expired",
            RoundError::AlreadyLocked => "round already locked",
            RoundError::TooEarlyToSettle => "too early to settle",
            RoundError::AlreadySettled => "round already settled",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for RoundError {}

// =============================================================================
// Schedule arithmetic
// =============================================================================

/// Immutable cycle timing derived from configuration.
///
/// New rounds start every `open_seconds + lock_seconds`; each round locks
/// `open_seconds` after its start and ends `open_seconds + settle_seconds`
/// after its start, so consecutive rounds overlap while settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSchedule {
    pub open_seconds: i64,
    pub lock_seconds: i64,
    pub settle_seconds: i64,
}

impl RoundSchedule {
    pub fn new(open_seconds: i64, lock_seconds: i64, settle_seconds: i64) -> Result<Self, RoundError> {
        if open_seconds <= 0 || lock_seconds < 0 || settle_seconds < open_seconds {
            return Err(RoundError::InvalidSchedule);
        }
        Ok(Self { open_seconds, lock_seconds, settle_seconds })
    }

    /// Spacing between consecutive round starts.
    pub fn cycle_seconds(&self) -> i64 {
        self.open_seconds + self.lock_seconds
    }

    pub fn lock_ts(&self, start_ts: i64) -> i64 {
        start_ts + self.open_seconds
    }

    pub fn end_ts(&self, start_ts: i64) -> i64 {
        start_ts + self.open_seconds + self.settle_seconds
    }

    /// Start of the entry cycle containing `now`.
    pub fn current_cycle_start(&self, now: i64) -> i64 {
        now - now.rem_euclid(self.cycle_seconds())
    }

    /// True when `start_ts` sits on a cycle boundary.
    pub fn is_aligned(&self, start_ts: i64) -> bool {
        start_ts.rem_euclid(self.cycle_seconds()) == 0
    }
}

// =============================================================================
// Round identity
// =============================================================================

/// Bit-stable wire identity: `"{MARKET}-{start_ts_seconds}-5m"`.
pub fn round_id(market: MarketSymbol, start_ts: i64) -> String {
    format!("{}-{}-{}", market.as_str(), start_ts, ROUND_ID_SUFFIX)
}

/// Parse a wire round identity back into `(market, start_ts)`.
pub fn parse_round_id(id: &str) -> Option<(MarketSymbol, i64)> {
    let mut parts = id.split('-');
    let market = MarketSymbol::parse(parts.next()?)?;
    let start_ts: i64 = parts.next()?.parse().ok()?;
    if parts.next()? != ROUND_ID_SUFFIX || parts.next().is_some() {
        return None;
    }
    Some((market, start_ts))
}

// =============================================================================
// Round
// =============================================================================

/// Durable state of one round. Mutated only by the state machine, and only
/// under the round's processing lock once settlement begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub market: MarketSymbol,
    pub start_ts: i64,
    pub lock_ts: i64,
    pub end_ts: i64,
    pub status: RoundStatus,
    pub start_price: Option<i64>,
    pub end_price: Option<i64>,
    pub expo: i32,
    pub winner: Option<Side>,
    pub up_total: u64,
    pub down_total: u64,
    pub fee_units: u64,
    pub distributable_units: u64,
    pub created_at_ms: i64,
    pub locked_at_ms: Option<i64>,
    pub settled_at_ms: Option<i64>,
}

impl Round {
    /// Guarded creation: absent → OPEN.
    pub fn create(
        market: MarketSymbol,
        start_ts: i64,
        schedule: &RoundSchedule,
        now: i64,
        now_ms: i64,
    ) -> Result<Self, RoundError> {
        if !schedule.is_aligned(start_ts) {
            return Err(RoundError::InvalidSchedule);
        }
        let lock_ts = schedule.lock_ts(start_ts);
        let end_ts = schedule.end_ts(start_ts);
        if end_ts <= lock_ts {
            return Err(RoundError::InvalidSchedule);
        }
        if now >= lock_ts - MIN_CREATION_SLACK_SECS {
            return Err(RoundError::TooLateToCreate);
        }
        Ok(Self {
            market,
            start_ts,
            lock_ts,
            end_ts,
            status: RoundStatus::Open,
            start_price: None,
            end_price: None,
            expo: 0,
            winner: None,
            up_total: 0,
            down_total: 0,
            fee_units: 0,
            distributable_units: 0,
            created_at_ms: now_ms,
            locked_at_ms: None,
            settled_at_ms: None,
        })
    }

    pub fn id(&self) -> String {
        round_id(self.market, self.start_ts)
    }

    /// True once the round is past `end_ts` and still unsettled.
    pub fn is_due(&self, now: i64) -> bool {
        self.status != RoundStatus::Settled && now >= self.end_ts
    }

    /// OPEN → LOCKED, freezing the start price.
    ///
    /// The oracle snapshot must already have passed owner and freshness
    /// validation; this guard only enforces temporal and status rules.
    pub fn lock(&mut self, now: i64, now_ms: i64, snapshot: &OracleSnapshot) -> Result<(), RoundError> {
        match self.status {
            RoundStatus::Open => {}
            RoundStatus::Locked => return Err(RoundError::AlreadyLocked),
            RoundStatus::Settled => return Err(RoundError::AlreadySettled),
        }
        if now < self.lock_ts {
            return Err(RoundError::TooEarlyToLock);
        }
        if now > self.lock_ts + LOCK_GRACE_SECONDS {
            return Err(RoundError::LockWindowExpired);
        }
        self.start_price = Some(snapshot.price);
        self.expo = snapshot.expo;
        self.status = RoundStatus::Locked;
        self.locked_at_ms = Some(now_ms);
        Ok(())
    }

    /// Record a join while OPEN. Entry-level validation happens upstream.
    pub fn apply_stake(&mut self, side: Side, units: u64, now: i64) -> Result<(), RoundError> {
        if self.status != RoundStatus::Open {
            return Err(RoundError::NotOpen);
        }
        if now < self.start_ts || now >= self.lock_ts {
            return Err(RoundError::NotOpen);
        }
        match side {
            Side::Up => self.up_total = self.up_total.saturating_add(units),
            Side::Down => self.down_total = self.down_total.saturating_add(units),
        }
        Ok(())
    }

    pub fn total_units(&self) -> u64 {
        self.up_total + self.down_total
    }

    /// Winner decision rule. No other inputs influence the decision.
    pub fn decide(
        up_total: u64,
        down_total: u64,
        start_price: Option<i64>,
        end_price: Option<i64>,
    ) -> (SettleMode, Option<Side>) {
        let (start, end) = match (start_price, end_price) {
            (Some(s), Some(e)) => (s, e),
            // Missing either price (skipped lock, oracle failure): refund.
            _ => return (SettleMode::Refund, None),
        };
        if up_total == 0 || down_total == 0 {
            (SettleMode::Refund, None)
        } else if end > start {
            (SettleMode::Win, Some(Side::Up))
        } else if end < start {
            (SettleMode::Win, Some(Side::Down))
        } else {
            (SettleMode::Refund, None)
        }
    }

    /// LOCKED → SETTLED (or forced OPEN → SETTLED as a refund when locking
    /// was skipped). Records prices and payout totals; the caller persists
    /// the plan under the processing lock.
    pub fn settle(
        &mut self,
        now: i64,
        now_ms: i64,
        end_snapshot: Option<&OracleSnapshot>,
        fee_bps: u16,
    ) -> Result<(SettleMode, Option<Side>), RoundError> {
        if self.status == RoundStatus::Settled {
            return Err(RoundError::AlreadySettled);
        }
        if now < self.end_ts {
            return Err(RoundError::TooEarlyToSettle);
        }

        if self.status == RoundStatus::Locked {
            if let Some(snap) = end_snapshot {
                self.end_price = Some(snap.price);
            }
        }
        // A round that never locked has no start price and refunds.

        let (mode, winner) = Self::decide(self.up_total, self.down_total, self.start_price, self.end_price);
        let total = self.total_units();
        let fee = match mode {
            SettleMode::Win => crate::engine::payout::fee_units(total, fee_bps).min(total),
            SettleMode::Refund => 0,
        };
        self.fee_units = fee;
        self.distributable_units = total - fee;
        self.winner = winner;
        self.status = RoundStatus::Settled;
        self.settled_at_ms = Some(now_ms);
        Ok((mode, winner))
    }
}
