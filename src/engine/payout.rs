//! Pro-rata payout and fee arithmetic.
//!
//! Pure, deterministic, integer-only. Every function here must conserve
//! value exactly: `sum(payouts) + fee == total` for any input, with the
//! flooring remainder assigned to the first recipient in canonical order.
//!
//! Canonical order is ascending `joined_at`, ties broken by entry identity,
//! so replays of the same round always produce the same allocations.

pub const BPS_DENOMINATOR: u64 = 10_000;

/// Protocol fee in integer base units: `floor(total * fee_bps / 10_000)`.
pub fn fee_units(total: u64, fee_bps: u16) -> u64 {
    ((total as u128 * fee_bps as u128) / BPS_DENOMINATOR as u128) as u64
}

/// One recipient's share of a distribution, before remainder assignment.
fn floor_share(distributable: u64, weight: u64, weight_total: u64) -> u64 {
    if weight_total == 0 || distributable == 0 || weight == 0 {
        return 0;
    }
    ((distributable as u128 * weight as u128) / weight_total as u128) as u64
}

/// Allocate `distributable` across `recipients` (already in canonical
/// order) proportionally to their weights, flooring each share and giving
/// the entire remainder to the first recipient.
///
/// Degenerate inputs (zero distributable, empty recipients, zero total
/// weight) yield an empty allocation.
pub fn allocate<K: Clone>(distributable: u64, recipients: &[(K, u64)]) -> Vec<(K, u64)> {
    let weight_total: u64 = recipients.iter().map(|(_, w)| *w).sum();
    if distributable == 0 || recipients.is_empty() || weight_total == 0 {
        return Vec::new();
    }

    let mut out: Vec<(K, u64)> = recipients
        .iter()
        .map(|(key, weight)| (key.clone(), floor_share(distributable, *weight, weight_total)))
        .collect();

    let paid: u64 = out.iter().map(|(_, units)| *units).sum();
    let remainder = distributable - paid;
    if remainder > 0 {
        out[0].1 += remainder;
    }
    out
}

/// Per-position claim amount, matching the on-chain program's plain floor
/// proportion (no remainder reconciliation; residual dust stays in the
/// vaults).
pub fn claim_amount(stake: u64, distributable: u64, pool_total: u64) -> u64 {
    floor_share(distributable, stake, pool_total)
}

/// Sort `(identity, joined_at, ...)` tuples into the canonical payout
/// order: ascending `joined_at`, ties by identity.
pub fn canonical_sort<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> (i64, String),
{
    items.sort_by(|a, b| {
        let (ta, ia) = key(a);
        let (tb, ib) = key(b);
        ta.cmp(&tb).then_with(|| ia.cmp(&ib))
    });
}
