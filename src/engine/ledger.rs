//! Durable ledger interface.
//!
//! The ledger owns every durable entity: entries, rounds, settlement plans,
//! planned transfers, receipts, processing locks and join-attempt counters.
//! Deployments may back it with a transactional store or with on-chain
//! accounts; the contract is the operations' atomicity and uniqueness
//! guarantees, not the storage shape:
//!
//! - inserts are insert-if-absent and report whether a row was created,
//! - an entry signature appears in at most one round,
//! - `(round_id, transfer_id)` and receipt signatures are unique,
//! - round rows are mutated only by the holder of the round's processing
//!   lock once settlement begins.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::round::{Round, SettleMode, Side};

/// One join by one wallet on one side of one round. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Stable unique identity (deposit signature or server-assigned id).
    pub signature: String,
    pub round_id: String,
    pub wallet: String,
    pub side: Side,
    pub stake_units: u64,
    /// Server-received time, never client-provided.
    pub joined_at_ms: i64,
}

/// What a planned transfer pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Fee,
    Payout,
    Refund,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Fee => "fee",
            TransferKind::Payout => "payout",
            TransferKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fee" => Some(TransferKind::Fee),
            "payout" => Some(TransferKind::Payout),
            "refund" => Some(TransferKind::Refund),
            _ => None,
        }
    }
}

/// One transfer a settled round owes. Immutable once the plan persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub transfer_id: u32,
    pub recipient: String,
    pub units: u64,
    pub kind: TransferKind,
}

/// Progress of a persisted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Processing,
    Completed,
}

impl PlanState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanState::Processing => "processing",
            PlanState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(PlanState::Processing),
            "completed" => Some(PlanState::Completed),
            _ => None,
        }
    }
}

/// Produced exactly once per round at settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub round_id: String,
    pub mode: SettleMode,
    pub winner: Option<Side>,
    pub start_price: Option<i64>,
    pub end_price: Option<i64>,
    pub expo: i32,
    pub fee_units: u64,
    pub distributable_units: u64,
    pub transfers: Vec<PlannedTransfer>,
    pub state: PlanState,
}

impl SettlementPlan {
    /// Total units across all plan rows (fee included).
    pub fn planned_total(&self) -> u64 {
        self.transfers.iter().map(|t| t.units).sum()
    }

    /// Units across payout/refund rows only.
    pub fn distributed_total(&self) -> u64 {
        self.transfers
            .iter()
            .filter(|t| t.kind != TransferKind::Fee)
            .map(|t| t.units)
            .sum()
    }
}

/// Record that a planned transfer executed, with the external signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub round_id: String,
    pub transfer_id: u32,
    pub signature: String,
    pub units: u64,
    pub executed_at_ms: i64,
}

/// Scope of a join-attempt rate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Ip,
    Wallet,
}

/// Summary for the status endpoints, bounded by a scan limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DueStats {
    pub pending_due_rounds: u64,
    pub max_settlement_lag_ms: i64,
}

/// Storage-agnostic ledger operations.
pub trait Ledger: Send + Sync {
    // Rounds
    fn create_round(&self, round: &Round) -> Result<bool>;
    fn round(&self, round_id: &str) -> Result<Option<Round>>;
    fn update_round(&self, round: &Round) -> Result<()>;
    /// Unsettled rounds with `end_ts <= now`, oldest first.
    fn rounds_due(&self, now: i64, limit: usize) -> Result<Vec<Round>>;
    /// OPEN rounds with `lock_ts <= now`, oldest first.
    fn rounds_lockable(&self, now: i64, limit: usize) -> Result<Vec<Round>>;

    // Entries
    fn add_entry(&self, entry: &EntryRecord) -> Result<bool>;
    fn has_entry(&self, signature: &str) -> Result<bool>;
    /// Entries in canonical payout order (`joined_at` asc, ties by identity).
    fn entries_for_round(&self, round_id: &str) -> Result<Vec<EntryRecord>>;

    // Join-attempt counters (rolling window, eventually consistent)
    fn record_join_attempt(&self, wallet: &str, ip: &str, at_ms: i64) -> Result<()>;
    fn count_recent_attempts(&self, scope: RateScope, key: &str, window_ms: i64, now_ms: i64) -> Result<u64>;

    // Round processing lock
    fn try_acquire_round_lock(&self, round_id: &str, stale_after: Duration, now_ms: i64) -> Result<bool>;
    fn release_round_lock(&self, round_id: &str) -> Result<()>;

    // Settlement plans & receipts
    /// First writer wins; returns whether this call created the plan.
    fn add_settlement(&self, plan: &SettlementPlan) -> Result<bool>;
    /// Replace a plan still in PROCESSING with no receipts; errors otherwise.
    fn upsert_settlement(&self, plan: &SettlementPlan) -> Result<()>;
    fn settlement(&self, round_id: &str) -> Result<Option<SettlementPlan>>;
    /// Idempotent; returns whether a new receipt row was created.
    fn append_transfer_receipt(&self, receipt: &TransferReceipt) -> Result<bool>;
    fn receipts_for_round(&self, round_id: &str) -> Result<Vec<TransferReceipt>>;
    fn mark_settlement_completed(&self, round_id: &str) -> Result<()>;

    // Positions (custody-mode parity)
    /// Aggregate stake for `(round, wallet, side)`.
    fn position_units(&self, round_id: &str, wallet: &str, side: Side) -> Result<u64>;
    /// Monotone false -> true; returns false when already claimed.
    fn mark_claimed(&self, round_id: &str, wallet: &str, side: Side) -> Result<bool>;

    // Observability
    fn due_stats(&self, now: i64, now_ms: i64, scan_limit: usize) -> Result<DueStats>;
}
