//! End-to-end settlement scenarios: join through the handler, drive the
//! keeper against a scripted clock and oracle, and check the ledger's
//! conservation and uniqueness invariants on the way out.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use pancho_backend::engine::join::{JoinError, JoinHandler};
use pancho_backend::engine::keeper::Keeper;
use pancho_backend::engine::ledger::{Ledger, PlanState, TransferKind};
use pancho_backend::engine::oracle::{OracleError, OraclePort, OracleSnapshot, OracleSource};
use pancho_backend::engine::round::{RoundSchedule, RoundStatus, SettleMode, Side};
use pancho_backend::engine::settlement::{SettlementConfig, SettlementEngine};
use pancho_backend::engine::sqlite_ledger::SqliteLedger;
use pancho_backend::engine::transfer::{PaperDepositVerifier, PaperTransferFacility};
use pancho_backend::models::{Config, Gates, JoinRequest, Market, MarketSymbol};

const ROUND_ID: &str = "SOL-1200-5m";
const TREASURY: &str = "treasury";

const ALICE: &str = "A1iceA1iceA1iceA1iceA1iceA1iceA1iceA1ice";
const BOB: &str = "BobBobBobBobBobBobBobBobBobBobBobBobBobB";
const CAROL: &str = "Caro1Caro1Caro1Caro1Caro1Caro1Caro1Caro1";
const DAVE: &str = "DaveDaveDaveDaveDaveDaveDaveDaveDaveDave";

/// Oracle scripted as a step function: `start_price` before the step
/// timestamp, `end_price` at and after it. Always fresh at the queried
/// instant.
struct StepOracle {
    start_price: i64,
    end_price: i64,
    step_ts: i64,
}

#[async_trait]
impl OracleSource for StepOracle {
    async fn snapshot_at(&self, _m: MarketSymbol, ts: i64) -> Result<OracleSnapshot, OracleError> {
        let price = if ts < self.step_ts { self.start_price } else { self.end_price };
        Ok(OracleSnapshot {
            price,
            expo: -8,
            publish_time: ts,
            confidence: 1,
            source_owner: "oracle-program".to_string(),
        })
    }
}

struct Harness {
    ledger: Arc<SqliteLedger>,
    join: JoinHandler,
    keeper: Keeper,
    transfers: Arc<PaperTransferFacility>,
}

fn config(fee_bps: u16) -> Arc<Config> {
    Arc::new(Config {
        port: 0,
        database_path: String::new(),
        fee_bps,
        open_seconds: 60,
        lock_seconds: 60,
        settle_seconds: 300,
        oracle_max_age_sec: 120,
        keeper_interval_ms: 4000,
        round_lock_ttl_secs: 900,
        status_cache_ms: 2000,
        settle_key: None,
        ops_key: None,
        treasury_wallet: TREASURY.to_string(),
        expected_treasury_wallet: None,
        escrow_wallet: None,
        stake_tiers: vec![1, 7, 25, 30, 40, 45, 50, 60],
        join_ip_limit: 1000,
        join_ip_window_ms: 60_000,
        join_wallet_limit: 1000,
        join_wallet_window_ms: 60_000,
        api_rate_limit: 1000,
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

fn harness(fee_bps: u16, start_price: i64, end_price: i64) -> Harness {
    let config = config(fee_bps);
    let schedule = RoundSchedule::new(60, 60, 300).unwrap();
    let ledger: Arc<SqliteLedger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
    let oracle = Arc::new(OraclePort::new(
        Arc::new(StepOracle { start_price, end_price, step_ts: 1400 }),
        config.oracle_max_age_sec,
    ));
    let transfers = Arc::new(PaperTransferFacility::new());
    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        oracle.clone(),
        transfers.clone(),
        config.markets.clone(),
        SettlementConfig {
            fee_bps: config.fee_bps,
            treasury_wallet: config.treasury_wallet.clone(),
            round_lock_ttl: Duration::from_secs(config.round_lock_ttl_secs),
        },
    ));
    let join = JoinHandler::new(
        ledger.clone(),
        Arc::new(PaperDepositVerifier),
        config.clone(),
        schedule,
    );
    let keeper = Keeper::new(ledger.clone(), oracle, engine, config, schedule);
    Harness { ledger, join, keeper, transfers }
}

fn request(wallet: &str, direction: &str, stake: u64, signature: &str) -> JoinRequest {
    JoinRequest {
        round_id: ROUND_ID.to_string(),
        market: "SOL".to_string(),
        feed_id: "feed-sol".to_string(),
        round_start_ms: 1_200_000,
        round_end_ms: 1_560_000,
        wallet: wallet.to_string(),
        direction: direction.to_string(),
        stake_usd: 0.0,
        stake_lamports: stake,
        signature: signature.to_string(),
        joined_at_ms: 0,
        start_price: None,
    }
}

async fn join(h: &Harness, wallet: &str, direction: &str, stake: u64, sig: &str, now_ms: i64) {
    let created = h
        .join
        .handle(&request(wallet, direction, stake, sig), "9.9.9.9", now_ms)
        .await
        .unwrap();
    assert!(created, "join {} should create an entry", sig);
}

/// Drive the round through lock and settlement.
async fn run_to_settlement(h: &Harness) {
    h.keeper.tick(1261, 1_261_000).await; // lock at start price
    h.keeper.tick(1561, 1_561_000).await; // settle at end price
}

fn check_conservation(h: &Harness, expected_total: u64) {
    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    let round = h.ledger.round(ROUND_ID).unwrap().unwrap();

    // Invariant 1: the plan conserves the pool and receipts match it.
    assert_eq!(plan.planned_total(), round.fee_units + plan.distributed_total());
    let expected_distributed = match plan.mode {
        SettleMode::Win => expected_total - plan.fee_units,
        SettleMode::Refund => expected_total,
    };
    assert_eq!(plan.distributed_total(), expected_distributed);

    let receipts = h.ledger.receipts_for_round(ROUND_ID).unwrap();
    assert_eq!(receipts.len(), plan.transfers.len());
    let receipt_total: u64 = receipts.iter().map(|r| r.units).sum();
    assert_eq!(receipt_total, plan.planned_total());

    // Invariant 4: one receipt per planned transfer id.
    let mut ids: Vec<u32> = receipts.iter().map(|r| r.transfer_id).collect();
    ids.dedup();
    assert_eq!(ids.len(), receipts.len());

    assert_eq!(plan.state, PlanState::Completed);
    assert_eq!(round.status, RoundStatus::Settled);
}

#[tokio::test]
async fn scenario_a_two_sided_win_upward() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;

    join(&h, ALICE, "UP", 50, "sig-alice", 1_210_000).await;
    join(&h, BOB, "UP", 25, "sig-bob", 1_211_000).await;
    join(&h, CAROL, "DOWN", 30, "sig-carol", 1_212_000).await;

    run_to_settlement(&h).await;

    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    assert_eq!(plan.mode, SettleMode::Win);
    assert_eq!(plan.winner, Some(Side::Up));
    assert_eq!(plan.fee_units, 6);
    assert_eq!(plan.distributable_units, 99);

    let rows: Vec<(String, u64, TransferKind)> = plan
        .transfers
        .iter()
        .map(|t| (t.recipient.clone(), t.units, t.kind))
        .collect();
    assert_eq!(
        rows,
        vec![
            (TREASURY.to_string(), 6, TransferKind::Fee),
            (ALICE.to_string(), 66, TransferKind::Payout),
            (BOB.to_string(), 33, TransferKind::Payout),
        ]
    );

    check_conservation(&h, 105);

    // Invariant 5: WIN requires both sides funded and a price move.
    let round = h.ledger.round(ROUND_ID).unwrap().unwrap();
    assert!(round.up_total > 0 && round.down_total > 0);
    assert_ne!(round.start_price, round.end_price);
}

#[tokio::test]
async fn scenario_b_one_sided_refund() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;
    join(&h, ALICE, "UP", 40, "sig-alice", 1_210_000).await;

    run_to_settlement(&h).await;

    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    assert_eq!(plan.mode, SettleMode::Refund);
    assert_eq!(plan.winner, None);
    assert_eq!(plan.fee_units, 0);
    assert_eq!(plan.distributable_units, 40);
    assert_eq!(plan.transfers.len(), 1);
    assert_eq!(plan.transfers[0].recipient, ALICE);
    assert_eq!(plan.transfers[0].units, 40);
    assert_eq!(plan.transfers[0].kind, TransferKind::Refund);

    check_conservation(&h, 40);
}

#[tokio::test]
async fn scenario_c_tie_refunds_pro_rata() {
    let h = harness(600, 50, 50);
    h.keeper.tick(1205, 1_205_000).await;
    join(&h, ALICE, "UP", 60, "sig-alice", 1_210_000).await;
    join(&h, BOB, "DOWN", 45, "sig-bob", 1_211_000).await;

    run_to_settlement(&h).await;

    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    assert_eq!(plan.mode, SettleMode::Refund);
    assert_eq!(plan.fee_units, 0);
    // pro-rata over the full pool returns each stake exactly
    let rows: Vec<(String, u64)> = plan
        .transfers
        .iter()
        .map(|t| (t.recipient.clone(), t.units))
        .collect();
    assert_eq!(rows, vec![(ALICE.to_string(), 60), (BOB.to_string(), 45)]);

    check_conservation(&h, 105);

    // Invariant 6: a refund here means the price did not move.
    let round = h.ledger.round(ROUND_ID).unwrap().unwrap();
    assert_eq!(round.start_price, round.end_price);
}

#[tokio::test]
async fn scenario_d_rounding_remainder_goes_to_first() {
    // No fee so the distributable is exactly the pool.
    let h = harness(0, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;

    join(&h, ALICE, "UP", 1, "sig-a", 1_210_000).await;
    join(&h, BOB, "UP", 1, "sig-b", 1_211_000).await;
    join(&h, CAROL, "UP", 1, "sig-c", 1_212_000).await;
    join(&h, DAVE, "DOWN", 7, "sig-d", 1_213_000).await;

    run_to_settlement(&h).await;

    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    assert_eq!(plan.mode, SettleMode::Win);
    assert_eq!(plan.distributable_units, 10);
    let units: Vec<u64> = plan.transfers.iter().map(|t| t.units).collect();
    // floor shares [3, 3, 3]; the remainder goes to the earliest join
    assert_eq!(units, vec![4, 3, 3]);

    check_conservation(&h, 10);
}

#[tokio::test]
async fn scenario_e_crash_mid_settlement_emits_no_duplicate_transfer() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;
    join(&h, ALICE, "UP", 50, "sig-alice", 1_210_000).await;
    join(&h, BOB, "UP", 25, "sig-bob", 1_211_000).await;
    join(&h, CAROL, "DOWN", 30, "sig-carol", 1_212_000).await;

    run_to_settlement(&h).await;

    // Re-running settlement after completion must not touch the external
    // ledger: same receipts, same submissions.
    let before = h.transfers.submissions();
    h.keeper.tick(1565, 1_565_000).await;
    h.keeper.tick(1569, 1_569_000).await;
    assert_eq!(h.transfers.submissions(), before);
    assert_eq!(h.ledger.receipts_for_round(ROUND_ID).unwrap().len(), 3);
}

#[tokio::test]
async fn scenario_f_late_join_rejected_without_mutation() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;

    // now == lock_ts
    let err = h
        .join
        .handle(&request(ALICE, "UP", 50, "sig-late"), "9.9.9.9", 1_260_000)
        .await
        .unwrap_err();
    assert_eq!(err, JoinError::Validation("round not open".to_string()));
    assert!(h.ledger.entries_for_round(ROUND_ID).unwrap().is_empty());
}

#[tokio::test]
async fn entry_signature_is_unique_across_rounds() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;
    join(&h, ALICE, "UP", 50, "sig-shared", 1_210_000).await;

    // Same identity replayed into the next round is a no-op.
    let mut next = request(ALICE, "UP", 50, "sig-shared");
    next.round_id = "SOL-1320-5m".to_string();
    next.round_start_ms = 1_320_000;
    next.round_end_ms = 1_680_000;
    let created = h.join.handle(&next, "9.9.9.9", 1_330_000).await.unwrap();
    assert!(!created);
    assert!(h.ledger.entries_for_round("SOL-1320-5m").unwrap().is_empty());
}

#[tokio::test]
async fn missed_lock_window_settles_as_refund() {
    let h = harness(600, 100, 101);
    h.keeper.tick(1205, 1_205_000).await;
    join(&h, ALICE, "UP", 50, "sig-alice", 1_210_000).await;
    join(&h, BOB, "DOWN", 30, "sig-bob", 1_211_000).await;

    // Keeper never runs during the grace window; the round stays OPEN
    // until it is due, then refunds with no prices recorded.
    h.keeper.tick(1561, 1_561_000).await;

    let plan = h.ledger.settlement(ROUND_ID).unwrap().unwrap();
    assert_eq!(plan.mode, SettleMode::Refund);
    assert_eq!(plan.start_price, None);
    let rows: Vec<u64> = plan.transfers.iter().map(|t| t.units).collect();
    assert_eq!(rows, vec![50, 30]);
    check_conservation(&h, 80);
}
