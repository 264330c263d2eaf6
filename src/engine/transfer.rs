//! Transfer facility and deposit verification ports.
//!
//! External money movement lives behind [`TransferFacility`]: the
//! settlement engine describes each transfer as an intent with a
//! deterministic reference, submits it, and records the returned signature
//! as a receipt. `find_existing` lets a resumed engine consult the external
//! signature index before emitting a new transfer, which is what makes the
//! crash boundary safe.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::ledger::TransferKind;

/// A transfer the engine wants executed. `reference` is stable across
/// retries so the external ledger can be queried for prior submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub round_id: String,
    pub transfer_id: u32,
    pub recipient: String,
    pub units: u64,
    pub kind: TransferKind,
}

impl TransferIntent {
    /// Deterministic memo attached to the external transfer.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.round_id, self.transfer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Timeout or connectivity problem; the plan stays in PROCESSING and
    /// the next tick retries.
    Transient(String),
    /// Misconfigured signer, rejected transaction; operators must step in.
    Fatal(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transient(_))
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Transient(msg) => write!(f, "transient transfer error: {}", msg),
            TransferError::Fatal(msg) => write!(f, "fatal transfer error: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

/// External transfer execution (wallet signing client is out of scope).
#[async_trait]
pub trait TransferFacility: Send + Sync {
    /// Submit the transfer; returns the external signature.
    async fn submit(&self, intent: &TransferIntent) -> Result<String, TransferError>;

    /// Look up a prior submission for this intent's reference, if any.
    async fn find_existing(&self, intent: &TransferIntent) -> Result<Option<String>, TransferError>;
}

// =============================================================================
// Deposit verification (join handler)
// =============================================================================

/// What the join handler asserts about an escrow deposit before accepting
/// an entry. Block time comes from the external ledger, not the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositCheck {
    pub signature: String,
    pub wallet: String,
    pub escrow: String,
    pub expected_units: u64,
    /// Memo must match the round identity.
    pub memo: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositError {
    /// Deposit absent, or amount/memo/recipient/block-time mismatched.
    Mismatch(String),
    /// Verification transport failed; the client may retry.
    Transient(String),
}

impl std::fmt::Display for DepositError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepositError::Mismatch(msg) => write!(f, "deposit mismatch: {}", msg),
            DepositError::Transient(msg) => write!(f, "deposit verification unavailable: {}", msg),
        }
    }
}

impl std::error::Error for DepositError {}

/// Verifies that a claimed stake actually arrived in escrow.
#[async_trait]
pub trait DepositVerifier: Send + Sync {
    async fn verify(&self, check: &DepositCheck) -> Result<(), DepositError>;
}

// =============================================================================
// Paper implementations (simulation mode and tests)
// =============================================================================

/// In-memory transfer facility: assigns uuid signatures and remembers every
/// submission by reference, so resumed runs exercise the same recovery path
/// as the real facility.
#[derive(Default)]
pub struct PaperTransferFacility {
    submitted: Mutex<Vec<(String, String)>>,
}

impl PaperTransferFacility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<(String, String)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl TransferFacility for PaperTransferFacility {
    async fn submit(&self, intent: &TransferIntent) -> Result<String, TransferError> {
        let reference = intent.reference();
        let mut submitted = self.submitted.lock();
        if let Some((_, sig)) = submitted.iter().find(|(r, _)| *r == reference) {
            return Ok(sig.clone());
        }
        let sig = uuid::Uuid::new_v4().to_string();
        submitted.push((reference, sig.clone()));
        Ok(sig)
    }

    async fn find_existing(&self, intent: &TransferIntent) -> Result<Option<String>, TransferError> {
        let reference = intent.reference();
        Ok(self
            .submitted
            .lock()
            .iter()
            .find(|(r, _)| *r == reference)
            .map(|(_, sig)| sig.clone()))
    }
}

/// Accepts every deposit; simulation mode only.
pub struct PaperDepositVerifier;

#[async_trait]
impl DepositVerifier for PaperDepositVerifier {
    async fn verify(&self, _check: &DepositCheck) -> Result<(), DepositError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(transfer_id: u32) -> TransferIntent {
        TransferIntent {
            round_id: "SOL-1000-5m".to_string(),
            transfer_id,
            recipient: "wallet-a".to_string(),
            units: 66,
            kind: TransferKind::Payout,
        }
    }

    #[test]
    fn test_reference_is_deterministic() {
        assert_eq!(intent(2).reference(), "SOL-1000-5m:2");
        assert_eq!(intent(2).reference(), intent(2).reference());
    }

    #[tokio::test]
    async fn test_paper_facility_is_idempotent_per_reference() {
        let facility = PaperTransferFacility::new();
        let first = facility.submit(&intent(1)).await.unwrap();
        let second = facility.submit(&intent(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(facility.submissions().len(), 1);

        assert_eq!(facility.find_existing(&intent(1)).await.unwrap(), Some(first));
        assert_eq!(facility.find_existing(&intent(9)).await.unwrap(), None);
    }
}
