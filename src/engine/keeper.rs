//! Keeper: the periodic driver that moves rounds forward in time.
//!
//! Each tick, per market: make sure the current and next entry-cycle
//! rounds exist, lock matured OPEN rounds (freezing the start price), then
//! settle due rounds. Every step is isolated so one failing market or step
//! never starves the others. Multiple keeper replicas are safe: mutual
//! exclusion comes entirely from the ledger's durable locks and idempotent
//! inserts, not from leader election.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::Ledger;
use crate::engine::oracle::{OracleError, OraclePort};
use crate::engine::round::{Round, RoundError, RoundSchedule, RoundStatus, LOCK_GRACE_SECONDS};
use crate::engine::settlement::SettlementEngine;
use crate::models::{Config, Market};

/// Lockable rounds examined per tick.
const LOCK_SCAN_LIMIT: usize = 16;

pub struct Keeper {
    ledger: Arc<dyn Ledger>,
    oracle: Arc<OraclePort>,
    engine: Arc<SettlementEngine>,
    config: Arc<Config>,
    schedule: RoundSchedule,
}

impl Keeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        oracle: Arc<OraclePort>,
        engine: Arc<SettlementEngine>,
        config: Arc<Config>,
        schedule: RoundSchedule,
    ) -> Self {
        Self { ledger, oracle, engine, config, schedule }
    }

    /// Run forever. Aborts up front on a treasury lock mismatch; nothing
    /// else terminates the loop.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.config.check_treasury_lock()?;

        let period = Duration::from_millis(self.config.keeper_interval_ms.max(250));
        info!(interval_ms = period.as_millis() as u64, "keeper started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.tick(now_ms.div_euclid(1000), now_ms).await;
        }
    }

    /// One keeper pass. Public for tests and the manual settle trigger.
    pub async fn tick(&self, now: i64, now_ms: i64) {
        for market in &self.config.markets {
            if let Err(e) = self.ensure_rounds(market, now, now_ms) {
                warn!(market = market.symbol.as_str(), error = %e, "round creation failed");
            }
        }

        self.lock_matured(now, now_ms).await;

        if self.config.gates.settle_paused {
            debug!("settlement paused; skipping settle step");
            return;
        }
        match self.engine.settle_due_rounds(now, now_ms).await {
            Ok(settled) if !settled.is_empty() => {
                info!(count = settled.len(), "keeper settled rounds");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "settle step failed"),
        }
    }

    /// Idempotently create the current and next entry-cycle rounds.
    fn ensure_rounds(&self, market: &Market, now: i64, now_ms: i64) -> anyhow::Result<()> {
        let cycle = self.schedule.cycle_seconds();
        let current = self.schedule.current_cycle_start(now);

        for start_ts in [current, current + cycle] {
            match Round::create(market.symbol, start_ts, &self.schedule, now, now_ms) {
                Ok(round) => {
                    if self.ledger.create_round(&round)? {
                        info!(round_id = %round.id(), lock_ts = round.lock_ts, "round created");
                    }
                }
                // The current cycle's join window may already be closing.
                Err(RoundError::TooLateToCreate) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Lock every OPEN round whose lock time has passed, under the round's
    /// processing lock so replicas never double-lock.
    async fn lock_matured(&self, now: i64, now_ms: i64) {
        let candidates = match self.ledger.rounds_lockable(now, LOCK_SCAN_LIMIT) {
            Ok(rounds) => rounds,
            Err(e) => {
                warn!(error = %e, "lockable scan failed");
                return;
            }
        };

        for round in candidates {
            let round_id = round.id();
            if now > round.lock_ts + LOCK_GRACE_SECONDS {
                // Missed the grace window; the round will settle as refund.
                debug!(round_id = %round_id, "lock window expired");
                continue;
            }
            if let Err(e) = self.lock_one(round, now, now_ms).await {
                warn!(round_id = %round_id, error = %e, "lock failed; will retry next tick");
            }
        }
    }

    async fn lock_one(&self, mut round: Round, now: i64, now_ms: i64) -> anyhow::Result<()> {
        let round_id = round.id();
        let ttl = Duration::from_secs(self.config.round_lock_ttl_secs);
        if !self.ledger.try_acquire_round_lock(&round_id, ttl, now_ms)? {
            debug!(round_id = %round_id, "processing lock held elsewhere; skipping lock step");
            return Ok(());
        }

        let result = self.lock_under_lock(&mut round, now, now_ms).await;
        if let Err(e) = self.ledger.release_round_lock(&round_id) {
            warn!(round_id = %round_id, error = %e, "failed to release round lock");
        }
        result
    }

    async fn lock_under_lock(&self, round: &mut Round, now: i64, now_ms: i64) -> anyhow::Result<()> {
        let round_id = round.id();
        // Re-read: another replica may have locked it already.
        let Some(current) = self.ledger.round(&round_id)? else {
            anyhow::bail!("round {} disappeared", round_id);
        };
        if current.status != RoundStatus::Open {
            return Ok(());
        }
        *round = current;

        let market = self
            .config
            .market(round.market)
            .ok_or_else(|| anyhow::anyhow!("market {} not configured", round.market.as_str()))?;

        let snapshot = match self.oracle.price_at(market, round.lock_ts).await {
            Ok(snap) => snap,
            Err(err @ OracleError::OwnerMismatch { .. }) => {
                error!(round_id = %round_id, error = %err, "oracle owner mismatch at lock");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        round.lock(now, now_ms, &snapshot)?;
        self.ledger.update_round(round)?;
        info!(
            round_id = %round_id,
            start_price = snapshot.price,
            expo = snapshot.expo,
            "round locked"
        );
        Ok(())
    }
}
