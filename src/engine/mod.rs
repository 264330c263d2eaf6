//! Round lifecycle and settlement engine.
//!
//! ```text
//! ┌────────────┐   joins    ┌──────────────┐   ticks   ┌────────────┐
//! │ JoinHandler│──────────▶ │    Ledger    │ ◀─────────│   Keeper   │
//! └────────────┘            │ (durable)    │           └─────┬──────┘
//!                           └──────┬───────┘                 │
//!                                  │ plans/receipts          │ lock/settle
//!                                  ▼                         ▼
//!                           ┌──────────────┐         ┌───────────────┐
//!                           │ Settlement   │ ◀──────▶│  OraclePort   │
//!                           │ Engine       │         └───────────────┘
//!                           └──────┬───────┘
//!                                  │ intents
//!                                  ▼
//!                           ┌──────────────┐
//!                           │ Transfer     │
//!                           │ Facility     │
//!                           └──────────────┘
//! ```
//!
//! Correctness rests on three properties: monotone guarded state
//! transitions ([`round`]), value-conserving integer arithmetic
//! ([`payout`]), and idempotent execution keyed by `(round_id,
//! transfer_id)` under a durable processing lock ([`settlement`],
//! [`ledger`]).

pub mod join;
pub mod keeper;
pub mod ledger;
pub mod oracle;
pub mod payout;
pub mod round;
pub mod settlement;
pub mod sqlite_ledger;
pub mod transfer;
