//! Fee-split share computation.
//!
//! Shares are fixed-point: 10_000_000 units equal 100%, so one unit is
//! 1/100000 of a percent. Whatever mix of explicit percentages, equal splits
//! and duplicate entries comes in, the returned table always sums to exactly
//! [`TOTAL_UNITS`]; rounding loss is absorbed by the last equal-split address
//! in first-seen order.

use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::network::AddressResolver;

/// 100% in share units.
pub const TOTAL_UNITS: u64 = 10_000_000;

/// Units per whole percentage point.
const UNITS_PER_PERCENT: f64 = 100_000.0;

/// Percent to share units, rounded to nearest. Rounding (not flooring) keeps
/// the conversion exact for every percentage with up to five decimals, where
/// the f64 product can land a hair under the true integer (33.33333 * 100000
/// is 3333332.999...).
fn percent_to_units(pct: f64) -> u64 {
    (pct * UNITS_PER_PERCENT).round() as u64
}

/// One requested receiver, after username resolution.
#[derive(Debug, Clone)]
pub struct ShareReceiver {
    /// What the user typed (kept for error messages).
    pub identifier: String,
    pub resolved_address: String,
    pub percentage: Option<f64>,
}

impl ShareReceiver {
    pub fn equal(identifier: &str, resolved_address: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            resolved_address: resolved_address.to_string(),
            percentage: None,
        }
    }

    pub fn explicit(identifier: &str, resolved_address: &str, percentage: f64) -> Self {
        Self {
            identifier: identifier.to_string(),
            resolved_address: resolved_address.to_string(),
            percentage: Some(percentage),
        }
    }
}

/// Final share for one unique address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareAllocation {
    pub address: String,
    pub units: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("no fee receivers given")]
    EmptyReceivers,
    #[error("'{identifier}' does not carry a valid address: {address:?}")]
    InvalidAddress { identifier: String, address: String },
    #[error("could not resolve to an address: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("'{identifier}' has an invalid percentage: {percentage}")]
    InvalidPercent { identifier: String, percentage: f64 },
    #[error("percentages need to add up to 100% (got {total_percent}%)")]
    PercentTotal { total_percent: f64 },
    #[error("share table summed to {actual} units, expected {expected}")]
    ShareSumMismatch { expected: u64, actual: u64 },
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^0x[0-9a-f]{40}$").expect("address pattern"))
}

/// Lowercase an EVM address and reject anything that is not 0x + 40 hex chars.
pub fn normalize_address(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_ascii_lowercase();
    if address_pattern().is_match(&lowered) {
        Some(lowered)
    } else {
        None
    }
}

/// Compute the exact share table for a receiver list.
///
/// Duplicate addresses are collapsed by summing the shares each entry would
/// have received. Entries with an explicit percentage contribute
/// `pct * 100000` units, rounded to nearest so that any percentage with up to
/// five decimals converts exactly despite f64 representation error. The rest
/// split whatever pool remains equally (by raw entry count), and the last
/// pool-fed address in first-seen order is topped up with the pool's rounding
/// remainder.
///
/// Explicit totals are validated rather than silently folded: an all-explicit
/// list must hit 100% exactly, and a mixed list may not exceed it.
pub fn compute_shares(receivers: &[ShareReceiver]) -> Result<Vec<ShareAllocation>, AllocationError> {
    if receivers.is_empty() {
        return Err(AllocationError::EmptyReceivers);
    }

    // First-seen order of unique addresses drives remainder absorption.
    let mut order: Vec<String> = Vec::new();
    let mut units_by_address: HashMap<String, u64> = HashMap::new();
    let mut pool_fed: HashMap<String, bool> = HashMap::new();

    let mut normalized: Vec<(String, Option<f64>)> = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let address = normalize_address(&receiver.resolved_address).ok_or_else(|| {
            AllocationError::InvalidAddress {
                identifier: receiver.identifier.clone(),
                address: receiver.resolved_address.clone(),
            }
        })?;
        if let Some(pct) = receiver.percentage {
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(AllocationError::InvalidPercent {
                    identifier: receiver.identifier.clone(),
                    percentage: pct,
                });
            }
        }
        if !units_by_address.contains_key(&address) {
            order.push(address.clone());
            units_by_address.insert(address.clone(), 0);
            pool_fed.insert(address.clone(), false);
        }
        normalized.push((address, receiver.percentage));
    }

    let explicit_total: f64 = normalized.iter().filter_map(|(_, pct)| *pct).sum();
    let explicit_units: u64 = normalized
        .iter()
        .filter_map(|(_, pct)| *pct)
        .map(percent_to_units)
        .sum();
    let unspecified_count = normalized.iter().filter(|(_, pct)| pct.is_none()).count() as u64;

    if unspecified_count == 0 {
        // All-explicit lists must land on 100% exactly.
        if explicit_units != TOTAL_UNITS {
            return Err(AllocationError::PercentTotal {
                total_percent: explicit_total,
            });
        }
    } else if explicit_units > TOTAL_UNITS {
        return Err(AllocationError::PercentTotal {
            total_percent: explicit_total,
        });
    }

    let pool = TOTAL_UNITS - explicit_units.min(TOTAL_UNITS);
    let pool_share = if unspecified_count > 0 {
        pool / unspecified_count
    } else {
        0
    };

    for (address, pct) in &normalized {
        let entry_units = match pct {
            Some(pct) => percent_to_units(*pct),
            None => {
                pool_fed.insert(address.clone(), true);
                pool_share
            }
        };
        if let Some(total) = units_by_address.get_mut(address) {
            *total += entry_units;
        }
    }

    // Top up the last pool-fed address so the table sums exactly.
    if unspecified_count > 0 {
        let last_pool_address = order
            .iter()
            .rev()
            .find(|address| pool_fed.get(*address).copied().unwrap_or(false))
            .cloned();
        if let Some(address) = last_pool_address {
            let allocated: u64 = units_by_address.values().sum();
            let remainder = TOTAL_UNITS.saturating_sub(allocated);
            if let Some(total) = units_by_address.get_mut(&address) {
                *total += remainder;
            }
        }
    }

    let allocations: Vec<ShareAllocation> = order
        .into_iter()
        .map(|address| {
            let units = units_by_address[&address];
            ShareAllocation { address, units }
        })
        .collect();

    let actual: u64 = allocations.iter().map(|a| a.units).sum();
    if actual != TOTAL_UNITS {
        // Unreachable by construction; kept as an invariant tripwire.
        return Err(AllocationError::ShareSumMismatch {
            expected: TOTAL_UNITS,
            actual,
        });
    }

    Ok(allocations)
}

/// Raw receiver entry before resolution: an identifier the user typed (ENS
/// name, handle, or a literal address) plus an optional explicit percentage.
#[derive(Debug, Clone)]
pub struct RawReceiver {
    pub identifier: String,
    pub percentage: Option<f64>,
}

/// Resolve every identifier up front, collecting all failures so the user
/// sees the full list of unresolved names in one reply instead of one at a
/// time.
pub async fn resolve_receivers(
    resolver: &dyn AddressResolver,
    entries: &[RawReceiver],
) -> Result<Vec<ShareReceiver>, AllocationError> {
    let mut resolved = Vec::with_capacity(entries.len());
    let mut unresolved = Vec::new();

    for entry in entries {
        // A literal address needs no resolver round trip.
        let address = match normalize_address(&entry.identifier) {
            Some(address) => Some(address),
            None => resolver.resolve(&entry.identifier).await,
        };
        match address.as_deref().and_then(normalize_address) {
            Some(address) => resolved.push(ShareReceiver {
                identifier: entry.identifier.clone(),
                resolved_address: address,
                percentage: entry.percentage,
            }),
            None => unresolved.push(entry.identifier.clone()),
        }
    }

    if !unresolved.is_empty() {
        return Err(AllocationError::Unresolved(unresolved));
    }
    Ok(resolved)
}
