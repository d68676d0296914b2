//! Budget partitioning for a funding run.
//!
//! Pure code: no I/O, no shared state. A plan is computed fresh per funding
//! request and handed to the executor as-is.

use rand::Rng;

use crate::error::FleetError;

/// Base network fee per transfer, in lamports (5000 = 0.000005 SOL).
pub const FEE_PER_SIGNATURE: u64 = 5_000;

/// Allocation granularity: amounts are drawn in steps of 0.0001 SOL.
/// The final entry of a plan absorbs whatever the quantization left over,
/// so plan totals always match the requested budget exactly.
pub const AMOUNT_QUANTUM: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Every account receives the same amount.
    Uniform,
    /// Each amount is drawn uniformly from `[min, max]` lamports, subject to
    /// the remaining budget covering the minimum for every account left.
    BoundedRandom { min_lamports: u64, max_lamports: u64 },
}

/// One `(account ordinal, amount)` assignment. `account_index` is the
/// position of the target in the account list the plan was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub account_index: u32,
    pub lamports: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    pub entries: Vec<PlanEntry>,
    pub total_lamports: u64,
    pub estimated_fee_lamports: u64,
}

impl DistributionPlan {
    pub fn max_entry(&self) -> u64 {
        self.entries.iter().map(|e| e.lamports).max().unwrap_or(0)
    }

    pub fn min_entry(&self) -> u64 {
        self.entries.iter().map(|e| e.lamports).min().unwrap_or(0)
    }
}

/// Split `total_budget` lamports across `count` accounts.
pub fn allocate(
    total_budget: u64,
    count: u32,
    mode: AllocationMode,
) -> Result<DistributionPlan, FleetError> {
    allocate_with_rng(total_budget, count, mode, &mut rand::thread_rng())
}

/// Same as [`allocate`], with the random source injected so bounded-random
/// plans can be reproduced.
pub fn allocate_with_rng<R: Rng>(
    total_budget: u64,
    count: u32,
    mode: AllocationMode,
    rng: &mut R,
) -> Result<DistributionPlan, FleetError> {
    if count == 0 {
        return Err(FleetError::Validation(
            "recipient count must be at least 1".into(),
        ));
    }
    if total_budget == 0 {
        return Err(FleetError::Validation("budget must be positive".into()));
    }

    let amounts = match mode {
        AllocationMode::Uniform => allocate_uniform(total_budget, count),
        AllocationMode::BoundedRandom {
            min_lamports,
            max_lamports,
        } => allocate_bounded(total_budget, count, min_lamports, max_lamports, rng)?,
    };

    debug_assert_eq!(amounts.iter().sum::<u64>(), total_budget);

    let estimated_fee_lamports = FEE_PER_SIGNATURE
        .checked_mul(u64::from(count))
        .ok_or_else(|| FleetError::Validation("recipient count overflows fee estimate".into()))?;

    Ok(DistributionPlan {
        entries: amounts
            .into_iter()
            .enumerate()
            .map(|(i, lamports)| PlanEntry {
                account_index: i as u32,
                lamports,
            })
            .collect(),
        total_lamports: total_budget,
        estimated_fee_lamports,
    })
}

fn allocate_uniform(total_budget: u64, count: u32) -> Vec<u64> {
    let count = u64::from(count);
    let per = quantize(total_budget / count);
    let mut amounts = vec![per; count as usize];
    // Last entry absorbs the quantization remainder.
    amounts[count as usize - 1] = total_budget - per * (count - 1);
    amounts
}

fn allocate_bounded<R: Rng>(
    total_budget: u64,
    count: u32,
    min: u64,
    max: u64,
    rng: &mut R,
) -> Result<Vec<u64>, FleetError> {
    if min > max {
        return Err(FleetError::Validation(format!(
            "minimum amount {min} exceeds maximum amount {max}"
        )));
    }
    let floor = min
        .checked_mul(u64::from(count))
        .ok_or_else(|| FleetError::Validation("minimum amount overflows budget check".into()))?;
    if floor > total_budget {
        return Err(FleetError::Validation(format!(
            "infeasible: {count} accounts at minimum {min} lamports need {floor}, budget is {total_budget}"
        )));
    }

    let count = count as usize;
    let mut amounts = Vec::with_capacity(count);
    let mut remaining = total_budget;
    for left_after in (1..count as u64).rev() {
        // Cap the draw so every account still to come can receive `min`.
        let upper = max.min(remaining - min * left_after);
        let draw = if upper <= min {
            min
        } else {
            let raw = rng.gen_range(min..=upper);
            // Snap toward `min` in quantum steps; stays within [min, upper].
            raw - (raw - min) % AMOUNT_QUANTUM
        };
        amounts.push(draw);
        remaining -= draw;
    }
    // Remainder-driven: the last amount is whatever budget is left. It is at
    // least `min` by construction but is not re-clamped to `max`.
    amounts.push(remaining);
    Ok(amounts)
}

fn quantize(lamports: u64) -> u64 {
    lamports - lamports % AMOUNT_QUANTUM
}
