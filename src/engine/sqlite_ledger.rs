//! SQLite-backed ledger.
//!
//! WAL mode for concurrent reads during writes, `INSERT OR IGNORE` for
//! insert-if-absent idempotence, `BEGIN IMMEDIATE` transactions where a
//! read-modify-write must be atomic. The processing lock is a durable row,
//! not an in-process mutex, so mutual exclusion survives process restarts
//! and the TTL steal recovers from crashed holders.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::ledger::{
    DueStats, EntryRecord, Ledger, PlanState, PlannedTransfer, RateScope, SettlementPlan,
    TransferKind, TransferReceipt,
};
use crate::engine::round::{Round, RoundStatus, SettleMode, Side};
use crate::models::MarketSymbol;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS rounds (
    round_id TEXT PRIMARY KEY,
    market TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    lock_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    status INTEGER NOT NULL,
    start_price INTEGER,
    end_price INTEGER,
    expo INTEGER NOT NULL DEFAULT 0,
    winner_side INTEGER,
    up_total INTEGER NOT NULL DEFAULT 0,
    down_total INTEGER NOT NULL DEFAULT 0,
    fee_units INTEGER NOT NULL DEFAULT 0,
    distributable_units INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    locked_at_ms INTEGER,
    settled_at_ms INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rounds_due ON rounds(status, end_ts);
CREATE INDEX IF NOT EXISTS idx_rounds_lockable ON rounds(status, lock_ts);

CREATE TABLE IF NOT EXISTS entries (
    signature TEXT PRIMARY KEY,
    round_id TEXT NOT NULL,
    wallet TEXT NOT NULL,
    side INTEGER NOT NULL,
    stake_units INTEGER NOT NULL,
    joined_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_entries_round
    ON entries(round_id, joined_at_ms, signature);

CREATE INDEX IF NOT EXISTS idx_entries_position
    ON entries(round_id, wallet, side);

CREATE TABLE IF NOT EXISTS join_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet TEXT NOT NULL,
    ip TEXT NOT NULL,
    at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_join_attempts_wallet ON join_attempts(wallet, at_ms);
CREATE INDEX IF NOT EXISTS idx_join_attempts_ip ON join_attempts(ip, at_ms);

CREATE TABLE IF NOT EXISTS round_locks (
    round_id TEXT PRIMARY KEY,
    acquired_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS settlements (
    round_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    winner_side INTEGER,
    start_price INTEGER,
    end_price INTEGER,
    expo INTEGER NOT NULL DEFAULT 0,
    fee_units INTEGER NOT NULL,
    distributable_units INTEGER NOT NULL,
    state TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS planned_transfers (
    round_id TEXT NOT NULL,
    transfer_id INTEGER NOT NULL,
    recipient TEXT NOT NULL,
    units INTEGER NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (round_id, transfer_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS transfer_receipts (
    round_id TEXT NOT NULL,
    transfer_id INTEGER NOT NULL,
    signature TEXT NOT NULL UNIQUE,
    units INTEGER NOT NULL,
    executed_at_ms INTEGER NOT NULL,
    PRIMARY KEY (round_id, transfer_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS claims (
    round_id TEXT NOT NULL,
    wallet TEXT NOT NULL,
    side INTEGER NOT NULL,
    claimed_at_ms INTEGER NOT NULL,
    PRIMARY KEY (round_id, wallet, side)
) WITHOUT ROWID;
"#;

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open ledger at {}", db_path))?;
        Self::init(conn, db_path)
    }

    /// In-memory ledger for tests and simulation runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory ledger")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize ledger schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if label != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }

        let rounds: i64 = conn
            .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %label, rounds, "ledger opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `body` inside a write transaction, rolling back on error.
    fn with_tx<T>(&self, body: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match body(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }
}

fn round_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Round> {
    let market_str: String = row.get("market")?;
    let status_code: u8 = row.get("status")?;
    let winner_code: Option<u8> = row.get("winner_side")?;
    Ok(Round {
        market: MarketSymbol::parse(&market_str).unwrap_or(MarketSymbol::Sol),
        start_ts: row.get("start_ts")?,
        lock_ts: row.get("lock_ts")?,
        end_ts: row.get("end_ts")?,
        status: RoundStatus::from_code(status_code).unwrap_or(RoundStatus::Open),
        start_price: row.get("start_price")?,
        end_price: row.get("end_price")?,
        expo: row.get("expo")?,
        winner: winner_code.and_then(Side::from_code),
        up_total: row.get::<_, i64>("up_total")? as u64,
        down_total: row.get::<_, i64>("down_total")? as u64,
        fee_units: row.get::<_, i64>("fee_units")? as u64,
        distributable_units: row.get::<_, i64>("distributable_units")? as u64,
        created_at_ms: row.get("created_at_ms")?,
        locked_at_ms: row.get("locked_at_ms")?,
        settled_at_ms: row.get("settled_at_ms")?,
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRecord> {
    let side_code: u8 = row.get("side")?;
    Ok(EntryRecord {
        signature: row.get("signature")?,
        round_id: row.get("round_id")?,
        wallet: row.get("wallet")?,
        side: Side::from_code(side_code).unwrap_or(Side::Up),
        stake_units: row.get::<_, i64>("stake_units")? as u64,
        joined_at_ms: row.get("joined_at_ms")?,
    })
}

impl Ledger for SqliteLedger {
    fn create_round(&self, round: &Round) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO rounds
             (round_id, market, start_ts, lock_ts, end_ts, status, start_price, end_price,
              expo, winner_side, up_total, down_total, fee_units, distributable_units,
              created_at_ms, locked_at_ms, settled_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                round.id(),
                round.market.as_str(),
                round.start_ts,
                round.lock_ts,
                round.end_ts,
                round.status.code(),
                round.start_price,
                round.end_price,
                round.expo,
                round.winner.map(Side::code),
                round.up_total as i64,
                round.down_total as i64,
                round.fee_units as i64,
                round.distributable_units as i64,
                round.created_at_ms,
                round.locked_at_ms,
                round.settled_at_ms,
            ],
        )?;
        Ok(changes > 0)
    }

    fn round(&self, round_id: &str) -> Result<Option<Round>> {
        let conn = self.conn.lock();
        let round = conn
            .query_row(
                "SELECT * FROM rounds WHERE round_id = ?1",
                params![round_id],
                round_from_row,
            )
            .optional()?;
        Ok(round)
    }

    fn update_round(&self, round: &Round) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE rounds SET status = ?2, start_price = ?3, end_price = ?4, expo = ?5,
             winner_side = ?6, up_total = ?7, down_total = ?8, fee_units = ?9,
             distributable_units = ?10, locked_at_ms = ?11, settled_at_ms = ?12
             WHERE round_id = ?1",
            params![
                round.id(),
                round.status.code(),
                round.start_price,
                round.end_price,
                round.expo,
                round.winner.map(Side::code),
                round.up_total as i64,
                round.down_total as i64,
                round.fee_units as i64,
                round.distributable_units as i64,
                round.locked_at_ms,
                round.settled_at_ms,
            ],
        )?;
        Ok(())
    }

    fn rounds_due(&self, now: i64, limit: usize) -> Result<Vec<Round>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM rounds WHERE status != ?1 AND end_ts <= ?2
             ORDER BY end_ts ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![RoundStatus::Settled.code(), now, limit as i64],
            round_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn rounds_lockable(&self, now: i64, limit: usize) -> Result<Vec<Round>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM rounds WHERE status = ?1 AND lock_ts <= ?2
             ORDER BY lock_ts ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![RoundStatus::Open.code(), now, limit as i64],
            round_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn add_entry(&self, entry: &EntryRecord) -> Result<bool> {
        self.with_tx(|conn| {
            let changes = conn.execute(
                "INSERT OR IGNORE INTO entries
                 (signature, round_id, wallet, side, stake_units, joined_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.signature,
                    entry.round_id,
                    entry.wallet,
                    entry.side.code(),
                    entry.stake_units as i64,
                    entry.joined_at_ms,
                ],
            )?;
            if changes == 0 {
                return Ok(false);
            }
            // Totals stay consistent with the entry set inside one tx.
            let column = match entry.side {
                Side::Up => "up_total",
                Side::Down => "down_total",
            };
            conn.execute(
                &format!("UPDATE rounds SET {column} = {column} + ?2 WHERE round_id = ?1"),
                params![entry.round_id, entry.stake_units as i64],
            )?;
            Ok(true)
        })
    }

    fn has_entry(&self, signature: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM entries WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn entries_for_round(&self, round_id: &str) -> Result<Vec<EntryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM entries WHERE round_id = ?1
             ORDER BY joined_at_ms ASC, signature ASC",
        )?;
        let rows = stmt.query_map(params![round_id], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_join_attempt(&self, wallet: &str, ip: &str, at_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO join_attempts (wallet, ip, at_ms) VALUES (?1, ?2, ?3)",
            params![wallet, ip, at_ms],
        )?;
        Ok(())
    }

    fn count_recent_attempts(&self, scope: RateScope, key: &str, window_ms: i64, now_ms: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let column = match scope {
            RateScope::Ip => "ip",
            RateScope::Wallet => "wallet",
        };
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM join_attempts WHERE {column} = ?1 AND at_ms > ?2"),
            params![key, now_ms - window_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn try_acquire_round_lock(&self, round_id: &str, stale_after: Duration, now_ms: i64) -> Result<bool> {
        self.with_tx(|conn| {
            // A holder older than the TTL crashed; its lock is stealable.
            let stale_before = now_ms - stale_after.as_millis() as i64;
            conn.execute(
                "DELETE FROM round_locks WHERE round_id = ?1 AND acquired_at_ms <= ?2",
                params![round_id, stale_before],
            )?;
            let changes = conn.execute(
                "INSERT OR IGNORE INTO round_locks (round_id, acquired_at_ms) VALUES (?1, ?2)",
                params![round_id, now_ms],
            )?;
            Ok(changes > 0)
        })
    }

    fn release_round_lock(&self, round_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM round_locks WHERE round_id = ?1", params![round_id])?;
        Ok(())
    }

    fn add_settlement(&self, plan: &SettlementPlan) -> Result<bool> {
        self.with_tx(|conn| {
            let changes = conn.execute(
                "INSERT OR IGNORE INTO settlements
                 (round_id, mode, winner_side, start_price, end_price, expo,
                  fee_units, distributable_units, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    plan.round_id,
                    plan.mode.as_str(),
                    plan.winner.map(Side::code),
                    plan.start_price,
                    plan.end_price,
                    plan.expo,
                    plan.fee_units as i64,
                    plan.distributable_units as i64,
                    plan.state.as_str(),
                ],
            )?;
            if changes == 0 {
                return Ok(false);
            }
            for transfer in &plan.transfers {
                conn.execute(
                    "INSERT INTO planned_transfers (round_id, transfer_id, recipient, units, kind)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        plan.round_id,
                        transfer.transfer_id,
                        transfer.recipient,
                        transfer.units as i64,
                        transfer.kind.as_str(),
                    ],
                )?;
            }
            Ok(true)
        })
    }

    fn upsert_settlement(&self, plan: &SettlementPlan) -> Result<()> {
        self.with_tx(|conn| {
            let receipts: i64 = conn.query_row(
                "SELECT COUNT(*) FROM transfer_receipts WHERE round_id = ?1",
                params![plan.round_id],
                |row| row.get(0),
            )?;
            anyhow::ensure!(
                receipts == 0,
                "refusing to replace plan for {} with {} executed transfers",
                plan.round_id,
                receipts
            );
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM settlements WHERE round_id = ?1",
                    params![plan.round_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(state) = state {
                anyhow::ensure!(
                    PlanState::parse(&state) == Some(PlanState::Processing),
                    "refusing to replace completed plan for {}",
                    plan.round_id
                );
            }
            conn.execute("DELETE FROM settlements WHERE round_id = ?1", params![plan.round_id])?;
            conn.execute(
                "DELETE FROM planned_transfers WHERE round_id = ?1",
                params![plan.round_id],
            )?;
            conn.execute(
                "INSERT INTO settlements
                 (round_id, mode, winner_side, start_price, end_price, expo,
                  fee_units, distributable_units, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    plan.round_id,
                    plan.mode.as_str(),
                    plan.winner.map(Side::code),
                    plan.start_price,
                    plan.end_price,
                    plan.expo,
                    plan.fee_units as i64,
                    plan.distributable_units as i64,
                    plan.state.as_str(),
                ],
            )?;
            for transfer in &plan.transfers {
                conn.execute(
                    "INSERT INTO planned_transfers (round_id, transfer_id, recipient, units, kind)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        plan.round_id,
                        transfer.transfer_id,
                        transfer.recipient,
                        transfer.units as i64,
                        transfer.kind.as_str(),
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn settlement(&self, round_id: &str) -> Result<Option<SettlementPlan>> {
        let conn = self.conn.lock();
        let head = conn
            .query_row(
                "SELECT mode, winner_side, start_price, end_price, expo,
                        fee_units, distributable_units, state
                 FROM settlements WHERE round_id = ?1",
                params![round_id],
                |row| {
                    let mode: String = row.get(0)?;
                    let winner: Option<u8> = row.get(1)?;
                    let state: String = row.get(7)?;
                    Ok((
                        mode,
                        winner,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, i32>(4)?,
                        row.get::<_, i64>(5)? as u64,
                        row.get::<_, i64>(6)? as u64,
                        state,
                    ))
                },
            )
            .optional()?;

        let Some((mode, winner, start_price, end_price, expo, fee_units, distributable_units, state)) = head
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT transfer_id, recipient, units, kind FROM planned_transfers
             WHERE round_id = ?1 ORDER BY transfer_id ASC",
        )?;
        let transfers = stmt
            .query_map(params![round_id], |row| {
                let kind: String = row.get(3)?;
                Ok(PlannedTransfer {
                    transfer_id: row.get(0)?,
                    recipient: row.get(1)?,
                    units: row.get::<_, i64>(2)? as u64,
                    kind: TransferKind::parse(&kind).unwrap_or(TransferKind::Payout),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mode = if mode == SettleMode::Win.as_str() {
            SettleMode::Win
        } else {
            SettleMode::Refund
        };
        Ok(Some(SettlementPlan {
            round_id: round_id.to_string(),
            mode,
            winner: winner.and_then(Side::from_code),
            start_price,
            end_price,
            expo,
            fee_units,
            distributable_units,
            transfers,
            state: PlanState::parse(&state).unwrap_or(PlanState::Processing),
        }))
    }

    fn append_transfer_receipt(&self, receipt: &TransferReceipt) -> Result<bool> {
        self.with_tx(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT signature FROM transfer_receipts
                     WHERE round_id = ?1 AND transfer_id = ?2",
                    params![receipt.round_id, receipt.transfer_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                // Resumed execution; the planned transfer already completed.
                return Ok(false);
            }
            // A signature collision across different transfers is corruption
            // and surfaces as a constraint failure here.
            conn.execute(
                "INSERT INTO transfer_receipts (round_id, transfer_id, signature, units, executed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    receipt.round_id,
                    receipt.transfer_id,
                    receipt.signature,
                    receipt.units as i64,
                    receipt.executed_at_ms,
                ],
            )?;
            Ok(true)
        })
    }

    fn receipts_for_round(&self, round_id: &str) -> Result<Vec<TransferReceipt>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT transfer_id, signature, units, executed_at_ms FROM transfer_receipts
             WHERE round_id = ?1 ORDER BY transfer_id ASC",
        )?;
        let rows = stmt.query_map(params![round_id], |row| {
            Ok(TransferReceipt {
                round_id: round_id.to_string(),
                transfer_id: row.get(0)?,
                signature: row.get(1)?,
                units: row.get::<_, i64>(2)? as u64,
                executed_at_ms: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn mark_settlement_completed(&self, round_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE settlements SET state = ?2 WHERE round_id = ?1",
            params![round_id, PlanState::Completed.as_str()],
        )?;
        Ok(())
    }

    fn position_units(&self, round_id: &str, wallet: &str, side: Side) -> Result<u64> {
        let conn = self.conn.lock();
        let units: i64 = conn.query_row(
            "SELECT COALESCE(SUM(stake_units), 0) FROM entries
             WHERE round_id = ?1 AND wallet = ?2 AND side = ?3",
            params![round_id, wallet, side.code()],
            |row| row.get(0),
        )?;
        Ok(units as u64)
    }

    fn mark_claimed(&self, round_id: &str, wallet: &str, side: Side) -> Result<bool> {
        let conn = self.conn.lock();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO claims (round_id, wallet, side, claimed_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![round_id, wallet, side.code(), now_ms],
        )?;
        Ok(changes > 0)
    }

    fn due_stats(&self, now: i64, now_ms: i64, scan_limit: usize) -> Result<DueStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT end_ts FROM rounds WHERE status != ?1 AND end_ts <= ?2
             ORDER BY end_ts ASC LIMIT ?3",
        )?;
        let end_ts_rows = stmt
            .query_map(params![RoundStatus::Settled.code(), now, scan_limit as i64], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let pending = end_ts_rows.len() as u64;
        let max_lag_ms = end_ts_rows
            .first()
            .map(|oldest_end| (now_ms - oldest_end * 1000).max(0))
            .unwrap_or(0);
        Ok(DueStats {
            pending_due_rounds: pending,
            max_settlement_lag_ms: max_lag_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::round::RoundSchedule;

    fn ledger() -> SqliteLedger {
        SqliteLedger::open_in_memory().unwrap()
    }

    fn schedule() -> RoundSchedule {
        RoundSchedule::new(60, 60, 300).unwrap()
    }

    fn make_round(start_ts: i64) -> Round {
        Round::create(MarketSymbol::Sol, start_ts, &schedule(), start_ts + 5, (start_ts + 5) * 1000).unwrap()
    }

    fn entry(signature: &str, round_id: &str, wallet: &str, side: Side, units: u64, at_ms: i64) -> EntryRecord {
        EntryRecord {
            signature: signature.to_string(),
            round_id: round_id.to_string(),
            wallet: wallet.to_string(),
            side,
            stake_units: units,
            joined_at_ms: at_ms,
        }
    }

    #[test]
    fn test_round_roundtrip() {
        let ledger = ledger();
        let round = make_round(1200);
        assert!(ledger.create_round(&round).unwrap());
        // idempotent
        assert!(!ledger.create_round(&round).unwrap());

        let got = ledger.round(&round.id()).unwrap().unwrap();
        assert_eq!(got, round);
    }

    #[test]
    fn test_entry_idempotence_and_totals() {
        let ledger = ledger();
        let round = make_round(1200);
        ledger.create_round(&round).unwrap();
        let id = round.id();

        assert!(ledger.add_entry(&entry("sig-1", &id, "alice", Side::Up, 50, 1_210_000)).unwrap());
        // same identity: no side effects
        assert!(!ledger.add_entry(&entry("sig-1", &id, "alice", Side::Up, 50, 1_210_000)).unwrap());
        assert!(ledger.add_entry(&entry("sig-2", &id, "carol", Side::Down, 30, 1_211_000)).unwrap());

        assert!(ledger.has_entry("sig-1").unwrap());
        assert!(!ledger.has_entry("sig-9").unwrap());

        let stored = ledger.round(&id).unwrap().unwrap();
        assert_eq!(stored.up_total, 50);
        assert_eq!(stored.down_total, 30);
    }

    #[test]
    fn test_entries_canonical_order() {
        let ledger = ledger();
        let round = make_round(1200);
        ledger.create_round(&round).unwrap();
        let id = round.id();

        ledger.add_entry(&entry("sig-b", &id, "w1", Side::Up, 10, 2000)).unwrap();
        ledger.add_entry(&entry("sig-a", &id, "w2", Side::Up, 10, 2000)).unwrap();
        ledger.add_entry(&entry("sig-z", &id, "w3", Side::Up, 10, 1000)).unwrap();

        let sigs: Vec<String> = ledger
            .entries_for_round(&id)
            .unwrap()
            .into_iter()
            .map(|e| e.signature)
            .collect();
        assert_eq!(sigs, vec!["sig-z", "sig-a", "sig-b"]);
    }

    #[test]
    fn test_join_attempt_counters() {
        let ledger = ledger();
        for i in 0..5 {
            ledger.record_join_attempt("walletA", "1.2.3.4", 1000 + i).unwrap();
        }
        ledger.record_join_attempt("walletB", "1.2.3.4", 1004).unwrap();

        assert_eq!(ledger.count_recent_attempts(RateScope::Wallet, "walletA", 100, 1005).unwrap(), 5);
        assert_eq!(ledger.count_recent_attempts(RateScope::Ip, "1.2.3.4", 100, 1005).unwrap(), 6);
        // outside the window
        assert_eq!(ledger.count_recent_attempts(RateScope::Wallet, "walletA", 2, 1050).unwrap(), 0);
    }

    #[test]
    fn test_round_lock_exclusive_and_stealable() {
        let ledger = ledger();
        let ttl = Duration::from_secs(900);

        assert!(ledger.try_acquire_round_lock("SOL-1200-5m", ttl, 1_000_000).unwrap());
        // held
        assert!(!ledger.try_acquire_round_lock("SOL-1200-5m", ttl, 1_000_100).unwrap());
        // explicit release
        ledger.release_round_lock("SOL-1200-5m").unwrap();
        assert!(ledger.try_acquire_round_lock("SOL-1200-5m", ttl, 1_000_200).unwrap());

        // stale holder is stealable after the TTL
        let after_ttl = 1_000_200 + ttl.as_millis() as i64 + 1;
        assert!(ledger.try_acquire_round_lock("SOL-1200-5m", ttl, after_ttl).unwrap());
    }

    fn plan(round_id: &str, transfers: Vec<PlannedTransfer>) -> SettlementPlan {
        SettlementPlan {
            round_id: round_id.to_string(),
            mode: SettleMode::Win,
            winner: Some(Side::Up),
            start_price: Some(100),
            end_price: Some(101),
            expo: -8,
            fee_units: 6,
            distributable_units: 99,
            transfers,
            state: PlanState::Processing,
        }
    }

    fn transfer(id: u32, recipient: &str, units: u64, kind: TransferKind) -> PlannedTransfer {
        PlannedTransfer {
            transfer_id: id,
            recipient: recipient.to_string(),
            units,
            kind,
        }
    }

    #[test]
    fn test_settlement_first_writer_wins() {
        let ledger = ledger();
        let first = plan(
            "SOL-1200-5m",
            vec![
                transfer(0, "treasury", 6, TransferKind::Fee),
                transfer(1, "alice", 66, TransferKind::Payout),
                transfer(2, "bob", 33, TransferKind::Payout),
            ],
        );
        assert!(ledger.add_settlement(&first).unwrap());

        let mut second = first.clone();
        second.transfers[1].units = 99;
        assert!(!ledger.add_settlement(&second).unwrap());

        let stored = ledger.settlement("SOL-1200-5m").unwrap().unwrap();
        assert_eq!(stored.transfers, first.transfers);
        assert_eq!(stored.planned_total(), 105);
        assert_eq!(stored.distributed_total(), 99);
    }

    #[test]
    fn test_upsert_refused_after_receipts() {
        let ledger = ledger();
        let p = plan("SOL-1200-5m", vec![transfer(0, "alice", 40, TransferKind::Refund)]);
        ledger.add_settlement(&p).unwrap();

        // refinement before any execution is allowed
        let mut refined = p.clone();
        refined.transfers[0].units = 41;
        ledger.upsert_settlement(&refined).unwrap();
        assert_eq!(
            ledger.settlement("SOL-1200-5m").unwrap().unwrap().transfers[0].units,
            41
        );

        ledger
            .append_transfer_receipt(&TransferReceipt {
                round_id: "SOL-1200-5m".to_string(),
                transfer_id: 0,
                signature: "ext-sig-1".to_string(),
                units: 41,
                executed_at_ms: 1,
            })
            .unwrap();
        assert!(ledger.upsert_settlement(&p).is_err());
    }

    #[test]
    fn test_receipt_uniqueness() {
        let ledger = ledger();
        let receipt = TransferReceipt {
            round_id: "SOL-1200-5m".to_string(),
            transfer_id: 1,
            signature: "ext-sig-1".to_string(),
            units: 66,
            executed_at_ms: 1,
        };
        assert!(ledger.append_transfer_receipt(&receipt).unwrap());
        // idempotent re-append is silent
        assert!(!ledger.append_transfer_receipt(&receipt).unwrap());
        // same signature on a different transfer is corruption
        let mut stolen = receipt.clone();
        stolen.transfer_id = 2;
        assert!(ledger.append_transfer_receipt(&stolen).is_err());

        let receipts = ledger.receipts_for_round("SOL-1200-5m").unwrap();
        assert_eq!(receipts.len(), 1);
    }

    #[test]
    fn test_mark_settlement_completed() {
        let ledger = ledger();
        let p = plan("SOL-1200-5m", vec![transfer(0, "alice", 40, TransferKind::Refund)]);
        ledger.add_settlement(&p).unwrap();
        ledger.mark_settlement_completed("SOL-1200-5m").unwrap();
        assert_eq!(
            ledger.settlement("SOL-1200-5m").unwrap().unwrap().state,
            PlanState::Completed
        );
    }

    #[test]
    fn test_positions_and_claims() {
        let ledger = ledger();
        let round = make_round(1200);
        ledger.create_round(&round).unwrap();
        let id = round.id();

        ledger.add_entry(&entry("sig-1", &id, "alice", Side::Up, 50, 1)).unwrap();
        ledger.add_entry(&entry("sig-2", &id, "alice", Side::Up, 25, 2)).unwrap();
        assert_eq!(ledger.position_units(&id, "alice", Side::Up).unwrap(), 75);
        assert_eq!(ledger.position_units(&id, "alice", Side::Down).unwrap(), 0);

        assert!(ledger.mark_claimed(&id, "alice", Side::Up).unwrap());
        // claimed is monotone
        assert!(!ledger.mark_claimed(&id, "alice", Side::Up).unwrap());
    }

    #[test]
    fn test_due_queries_and_stats() {
        let ledger = ledger();
        let early = make_round(1200);
        let late = make_round(1440);
        ledger.create_round(&early).unwrap();
        ledger.create_round(&late).unwrap();

        // nothing due before end_ts
        assert!(ledger.rounds_due(1500, 10).unwrap().is_empty());

        let due = ledger.rounds_due(1800, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].start_ts, 1200);

        let lockable = ledger.rounds_lockable(1300, 10).unwrap();
        assert_eq!(lockable.len(), 1);
        assert_eq!(lockable[0].start_ts, 1200);

        let stats = ledger.due_stats(1800, 1_800_000, 100).unwrap();
        assert_eq!(stats.pending_due_rounds, 2);
        assert_eq!(stats.max_settlement_lag_ms, 1_800_000 - 1560 * 1000);
    }
}
