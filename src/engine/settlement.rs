//! Settlement engine.
//!
//! Drives due rounds through plan construction and transfer execution:
//!
//! 1. discover rounds with `end_ts <= now` that are not settled,
//! 2. acquire the round's durable processing lock (stale holders stolen
//!    after the TTL), skipping rounds another worker holds,
//! 3. re-read under the lock; resume a PROCESSING plan instead of
//!    re-planning,
//! 4. obtain the end snapshot with the nearest-timestamp budget, falling
//!    back to REFUND when the oracle stays stale,
//! 5. build and persist the plan (state PROCESSING) before touching the
//!    round row, so a crash never leaves a settled round without a plan,
//! 6. execute transfers in plan order, consulting the external signature
//!    index before re-submitting (crash recovery), appending receipts
//!    keyed by `(round_id, transfer_id)`,
//! 7. mark the settlement completed once every planned transfer has a
//!    receipt,
//! 8. release the lock on every exit path.
//!
//! The unit of progress is `(round_id, transfer_id)`; re-running any step
//! is safe.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::{
    EntryRecord, Ledger, PlanState, PlannedTransfer, SettlementPlan, TransferKind, TransferReceipt,
};
use crate::engine::oracle::{OracleError, OraclePort, OracleSnapshot};
use crate::engine::payout;
use crate::engine::round::{Round, RoundStatus, SettleMode, Side};
use crate::engine::transfer::{TransferError, TransferFacility, TransferIntent};
use crate::models::{Market, MarketSymbol};

/// Bounded retries for transient oracle / transfer errors within one tick.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Rounds examined per `settle_due_rounds` call.
const DUE_SCAN_LIMIT: usize = 32;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub fee_bps: u16,
    pub treasury_wallet: String,
    pub round_lock_ttl: Duration,
}

/// Why a round could not settle this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleError {
    /// Retry next tick; no partial plan was committed.
    Transient(String),
    /// Oracle authenticity failure; surfaced, retried later, never defaulted.
    OwnerMismatch(String),
    /// Operators must intervene.
    Fatal(String),
}

impl std::fmt::Display for SettleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettleError::Transient(msg) => write!(f, "transient settlement error: {}", msg),
            SettleError::OwnerMismatch(msg) => write!(f, "oracle owner mismatch: {}", msg),
            SettleError::Fatal(msg) => write!(f, "fatal settlement error: {}", msg),
        }
    }
}

impl std::error::Error for SettleError {}

#[derive(Debug, Clone, Default)]
pub struct SettleStats {
    pub rounds_settled: u64,
    pub rounds_resumed: u64,
    pub rounds_skipped_locked: u64,
    pub wins: u64,
    pub refunds: u64,
    pub transient_failures: u64,
}

pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    oracle: Arc<OraclePort>,
    transfers: Arc<dyn TransferFacility>,
    markets: HashMap<MarketSymbol, Market>,
    config: SettlementConfig,
    stats: Mutex<SettleStats>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        oracle: Arc<OraclePort>,
        transfers: Arc<dyn TransferFacility>,
        markets: Vec<Market>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            oracle,
            transfers,
            markets: markets.into_iter().map(|m| (m.symbol, m)).collect(),
            config,
            stats: Mutex::new(SettleStats::default()),
        }
    }

    pub fn stats(&self) -> SettleStats {
        self.stats.lock().clone()
    }

    /// Settle every due round, one at a time. Individual round failures are
    /// logged and never block the remaining rounds. Returns the ids of
    /// rounds whose settlement completed this call.
    pub async fn settle_due_rounds(&self, now: i64, now_ms: i64) -> anyhow::Result<Vec<String>> {
        let due = self.ledger.rounds_due(now, DUE_SCAN_LIMIT)?;
        let mut settled = Vec::new();

        for round in due {
            let round_id = round.id();
            match self.settle_one(&round_id, now, now_ms).await {
                Ok(true) => settled.push(round_id),
                Ok(false) => {}
                Err(SettleError::Transient(msg)) => {
                    self.stats.lock().transient_failures += 1;
                    warn!(round_id = %round_id, error = %msg, "settlement deferred to next tick");
                }
                Err(SettleError::OwnerMismatch(msg)) => {
                    error!(round_id = %round_id, error = %msg, "oracle owner mismatch; settlement aborted");
                }
                Err(SettleError::Fatal(msg)) => {
                    error!(round_id = %round_id, error = %msg, "fatal settlement failure");
                }
            }
        }
        Ok(settled)
    }

    /// Settle a single round under its processing lock. Returns whether the
    /// settlement reached COMPLETED.
    pub async fn settle_one(&self, round_id: &str, now: i64, now_ms: i64) -> Result<bool, SettleError> {
        let acquired = self
            .ledger
            .try_acquire_round_lock(round_id, self.config.round_lock_ttl, now_ms)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        if !acquired {
            self.stats.lock().rounds_skipped_locked += 1;
            debug!(round_id = %round_id, "processing lock held elsewhere; skipping");
            return Ok(false);
        }

        let result = self.settle_under_lock(round_id, now, now_ms).await;

        // Lock release happens on every exit path, including errors.
        if let Err(e) = self.ledger.release_round_lock(round_id) {
            warn!(round_id = %round_id, error = %e, "failed to release round lock; TTL will recover it");
        }
        result
    }

    async fn settle_under_lock(&self, round_id: &str, now: i64, now_ms: i64) -> Result<bool, SettleError> {
        let mut round = self
            .ledger
            .round(round_id)
            .map_err(|e| SettleError::Transient(e.to_string()))?
            .ok_or_else(|| SettleError::Fatal(format!("round {} missing", round_id)))?;

        // Re-read under the lock: another worker may already have planned
        // or even completed this round.
        let existing = self
            .ledger
            .settlement(round_id)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        if let Some(plan) = existing {
            if plan.state == PlanState::Completed {
                return Ok(false);
            }
            // Crash boundary: plan persisted, execution unfinished.
            self.stats.lock().rounds_resumed += 1;
            info!(round_id = %round_id, "resuming settlement in PROCESSING");
            self.reconcile_round(&mut round, &plan, now_ms)?;
            return self.execute_plan(&plan, now_ms).await;
        }

        if round.status == RoundStatus::Settled {
            // Settled with no plan cannot happen in this engine's write
            // order; treat as corruption rather than guessing.
            return Err(SettleError::Fatal(format!("round {} settled without a plan", round_id)));
        }
        if !round.is_due(now) {
            return Ok(false);
        }

        // End snapshot, with nearest-timestamp budget. Stale stays a
        // refund; owner mismatch surfaces without any state change.
        let end_snapshot = if round.status == RoundStatus::Locked {
            match self.end_snapshot_with_retry(&round).await {
                Ok(snap) => Some(snap),
                Err(OracleError::Stale { .. }) => {
                    warn!(round_id = %round_id, "oracle stale beyond search budget; settling as refund");
                    None
                }
                Err(err @ OracleError::OwnerMismatch { .. }) => {
                    return Err(SettleError::OwnerMismatch(err.to_string()));
                }
                Err(err) => return Err(SettleError::Transient(err.to_string())),
            }
        } else {
            // Lock was skipped entirely; forced refund with no prices.
            None
        };

        let (mode, winner) = round
            .settle(now, now_ms, end_snapshot.as_ref(), self.config.fee_bps)
            .map_err(|e| SettleError::Fatal(e.to_string()))?;

        let entries = self
            .ledger
            .entries_for_round(round_id)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        let plan = self.build_plan(&round, mode, winner, &entries);

        // Plan first, round second: a crash in between leaves a LOCKED
        // round with a PROCESSING plan, which the resume path handles.
        let created = self
            .ledger
            .add_settlement(&plan)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        if !created {
            debug!(round_id = %round_id, "plan already persisted by a prior attempt");
        }
        self.ledger
            .update_round(&round)
            .map_err(|e| SettleError::Transient(e.to_string()))?;

        match mode {
            SettleMode::Win => self.stats.lock().wins += 1,
            SettleMode::Refund => self.stats.lock().refunds += 1,
        }
        info!(
            round_id = %round_id,
            mode = mode.as_str(),
            winner = winner.map(|w| w.as_str()).unwrap_or("NONE"),
            fee_units = plan.fee_units,
            distributable_units = plan.distributable_units,
            transfers = plan.transfers.len(),
            "settlement planned"
        );

        self.execute_plan(&plan, now_ms).await
    }

    /// Build the immutable plan: fee row first (when nonzero), then payout
    /// or refund rows in canonical entry order, zero allocations elided.
    fn build_plan(
        &self,
        round: &Round,
        mode: SettleMode,
        winner: Option<Side>,
        entries: &[EntryRecord],
    ) -> SettlementPlan {
        let mut transfers = Vec::new();
        let mut next_id: u32 = 0;

        if round.fee_units > 0 {
            transfers.push(PlannedTransfer {
                transfer_id: next_id,
                recipient: self.config.treasury_wallet.clone(),
                units: round.fee_units,
                kind: TransferKind::Fee,
            });
            next_id += 1;
        }

        let (recipients, kind): (Vec<(String, u64)>, TransferKind) = match (mode, winner) {
            (SettleMode::Win, Some(side)) => (
                entries
                    .iter()
                    .filter(|e| e.side == side)
                    .map(|e| (e.wallet.clone(), e.stake_units))
                    .collect(),
                TransferKind::Payout,
            ),
            _ => (
                entries
                    .iter()
                    .map(|e| (e.wallet.clone(), e.stake_units))
                    .collect(),
                TransferKind::Refund,
            ),
        };

        for (recipient, units) in payout::allocate(round.distributable_units, &recipients) {
            if units == 0 {
                continue;
            }
            transfers.push(PlannedTransfer {
                transfer_id: next_id,
                recipient,
                units,
                kind,
            });
            next_id += 1;
        }

        SettlementPlan {
            round_id: round.id(),
            mode,
            winner,
            start_price: round.start_price,
            end_price: round.end_price,
            expo: round.expo,
            fee_units: round.fee_units,
            distributable_units: round.distributable_units,
            transfers,
            state: PlanState::Processing,
        }
    }

    /// Execute planned transfers in order, skipping ones that already have
    /// receipts and consulting the external signature index before any new
    /// submission. Returns true when the settlement reached COMPLETED.
    async fn execute_plan(&self, plan: &SettlementPlan, now_ms: i64) -> Result<bool, SettleError> {
        let receipts = self
            .ledger
            .receipts_for_round(&plan.round_id)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        let done: std::collections::HashSet<u32> = receipts.iter().map(|r| r.transfer_id).collect();

        for transfer in &plan.transfers {
            if done.contains(&transfer.transfer_id) {
                continue;
            }
            let intent = TransferIntent {
                round_id: plan.round_id.clone(),
                transfer_id: transfer.transfer_id,
                recipient: transfer.recipient.clone(),
                units: transfer.units,
                kind: transfer.kind,
            };

            // A submission may have confirmed before its receipt was
            // appended; never emit a duplicate external transfer.
            let signature = match self.find_existing_with_retry(&intent).await? {
                Some(sig) => sig,
                None => self.submit_with_retry(&intent).await?,
            };

            self.ledger
                .append_transfer_receipt(&TransferReceipt {
                    round_id: plan.round_id.clone(),
                    transfer_id: transfer.transfer_id,
                    signature,
                    units: transfer.units,
                    executed_at_ms: now_ms,
                })
                .map_err(|e| SettleError::Transient(e.to_string()))?;
        }

        self.ledger
            .mark_settlement_completed(&plan.round_id)
            .map_err(|e| SettleError::Transient(e.to_string()))?;
        self.stats.lock().rounds_settled += 1;
        info!(round_id = %plan.round_id, "settlement completed");
        Ok(true)
    }

    /// Bring a round row in line with its persisted plan after a crash
    /// between plan persistence and the round update.
    fn reconcile_round(&self, round: &mut Round, plan: &SettlementPlan, now_ms: i64) -> Result<(), SettleError> {
        if round.status == RoundStatus::Settled {
            return Ok(());
        }
        round.status = RoundStatus::Settled;
        round.start_price = plan.start_price;
        round.end_price = plan.end_price;
        round.expo = plan.expo;
        round.winner = plan.winner;
        round.fee_units = plan.fee_units;
        round.distributable_units = plan.distributable_units;
        round.settled_at_ms = Some(now_ms);
        self.ledger
            .update_round(round)
            .map_err(|e| SettleError::Transient(e.to_string()))
    }

    async fn end_snapshot_with_retry(&self, round: &Round) -> Result<OracleSnapshot, OracleError> {
        let market = self
            .markets
            .get(&round.market)
            .ok_or(OracleError::InvalidPrice)?;
        let mut last = OracleError::Unreachable("no attempt".to_string());
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                sleep(RETRY_BASE_DELAY * attempt).await;
            }
            match self.oracle.price_near(market, round.end_ts).await {
                Ok(snap) => return Ok(snap),
                Err(err) if err.is_retryable() => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    async fn find_existing_with_retry(&self, intent: &TransferIntent) -> Result<Option<String>, SettleError> {
        let mut last = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                sleep(RETRY_BASE_DELAY * attempt).await;
            }
            match self.transfers.find_existing(intent).await {
                Ok(found) => return Ok(found),
                Err(TransferError::Transient(msg)) => last = msg,
                Err(TransferError::Fatal(msg)) => return Err(SettleError::Fatal(msg)),
            }
        }
        Err(SettleError::Transient(last))
    }

    async fn submit_with_retry(&self, intent: &TransferIntent) -> Result<String, SettleError> {
        let mut last = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                sleep(RETRY_BASE_DELAY * attempt).await;
            }
            match self.transfers.submit(intent).await {
                Ok(sig) => return Ok(sig),
                Err(TransferError::Transient(msg)) => last = msg,
                Err(TransferError::Fatal(msg)) => return Err(SettleError::Fatal(msg)),
            }
        }
        Err(SettleError::Transient(last))
    }

    /// Custody-mode claim parity: marks the position claimed (monotone) and
    /// returns its pro-rata share, using the on-chain floor proportion.
    pub fn claim(&self, round_id: &str, wallet: &str, side: Side) -> anyhow::Result<u64> {
        let round = self
            .ledger
            .round(round_id)?
            .ok_or_else(|| anyhow::anyhow!("round {} not found", round_id))?;
        anyhow::ensure!(round.status == RoundStatus::Settled, "round {} not settled", round_id);

        let stake = self.ledger.position_units(round_id, wallet, side)?;
        anyhow::ensure!(stake > 0, "nothing to claim");

        let claimed_now = self.ledger.mark_claimed(round_id, wallet, side)?;
        anyhow::ensure!(claimed_now, "already claimed");

        let payout = match round.winner {
            None => payout::claim_amount(stake, round.distributable_units, round.total_units()),
            Some(winner) if winner == side => {
                let winner_total = match winner {
                    Side::Up => round.up_total,
                    Side::Down => round.down_total,
                };
                payout::claim_amount(stake, round.distributable_units, winner_total)
            }
            Some(_) => 0,
        };
        Ok(payout)
    }
}
