//! On-chain program interface (custody mode).
//!
//! The settlement backend does not serialize full program accounts; it
//! asserts the stable parts of the interface: instruction identifiers, PDA
//! seed layouts, and the side/status byte codes. Keeping these in one place
//! lets the engine, ops tooling and tests agree on the wire-level shape.
//!
//! Seeds:
//! - config:   `("config")`
//! - round:    `("round", market_code_u8, round_id_le_i64)`
//! - vault:    `("vault", round_pubkey, side_u8)`
//! - position: `("position", round_pubkey, user_pubkey, side_u8)`

use sha2::{Digest, Sha256};

use crate::models::MarketSymbol;

pub const SIDE_UP: u8 = 0;
pub const SIDE_DOWN: u8 = 1;
pub const SIDE_NONE: u8 = 255;

pub const ROUND_OPEN: u8 = 0;
pub const ROUND_LOCKED: u8 = 1;
pub const ROUND_SETTLED: u8 = 2;

/// Instruction set of the custody program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    InitializeConfig,
    CreateRound,
    LockRound,
    SettleRound,
    Claim,
}

impl Instruction {
    pub fn name(self) -> &'static str {
        match self {
            Instruction::InitializeConfig => "initialize_config",
            Instruction::CreateRound => "create_round",
            Instruction::LockRound => "lock_round",
            Instruction::SettleRound => "settle_round",
            Instruction::Claim => "claim",
        }
    }

    /// Anchor-style 8-byte instruction discriminator:
    /// `sha256("global:<name>")[..8]`.
    pub fn discriminator(self) -> [u8; 8] {
        let digest = Sha256::digest(format!("global:{}", self.name()).as_bytes());
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        out
    }
}

/// Seed material for the config PDA.
pub fn config_seeds() -> Vec<Vec<u8>> {
    vec![b"config".to_vec()]
}

/// Seed material for a round PDA. `round_id` is the round's start second,
/// little-endian.
pub fn round_seeds(market: MarketSymbol, round_id: i64) -> Vec<Vec<u8>> {
    vec![
        b"round".to_vec(),
        vec![market.code()],
        round_id.to_le_bytes().to_vec(),
    ]
}

/// Seed material for a side vault PDA.
pub fn vault_seeds(round_pubkey: &[u8; 32], side: u8) -> Vec<Vec<u8>> {
    vec![b"vault".to_vec(), round_pubkey.to_vec(), vec![side]]
}

/// Seed material for a position PDA.
pub fn position_seeds(round_pubkey: &[u8; 32], user_pubkey: &[u8; 32], side: u8) -> Vec<Vec<u8>> {
    vec![
        b"position".to_vec(),
        round_pubkey.to_vec(),
        user_pubkey.to_vec(),
        vec![side],
    ]
}
