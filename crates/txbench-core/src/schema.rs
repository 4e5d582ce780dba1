//! Scaled TPC-B entity model.
//!
//! Branch `i` owns teller ids `[i * T, (i + 1) * T)` and account ids
//! `[i * A, (i + 1) * A)`. All ids are zero-based.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};

/// Number of tellers owned by each branch.
pub const TELLERS_PER_BRANCH: i64 = 10;

/// Number of accounts owned by each branch.
pub const ACCOUNTS_PER_BRANCH: i64 = 100_000;

/// Balance every row starts with after initialization.
pub const INITIAL_BALANCE: i64 = 0;

/// Smallest delta a transaction applies.
pub const DELTA_MIN: i64 = -5000;

/// Largest delta a transaction applies.
pub const DELTA_MAX: i64 = 5000;

/// Row counts and id ranges derived from a scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleModel {
    scale: i64,
}

impl ScaleModel {
    /// Creates a model for `scale` branches. Rejects non-positive scales.
    pub fn new(scale: i64) -> BenchResult<Self> {
        if scale <= 0 {
            return Err(BenchError::invalid_config(format!(
                "scale must be > 0, got {scale}"
            )));
        }
        Ok(Self { scale })
    }

    pub fn scale(&self) -> i64 {
        self.scale
    }

    pub fn branch_count(&self) -> i64 {
        self.scale
    }

    pub fn teller_count(&self) -> i64 {
        self.scale * TELLERS_PER_BRANCH
    }

    pub fn account_count(&self) -> i64 {
        self.scale * ACCOUNTS_PER_BRANCH
    }

    /// Whole branch id space `[0, S)`.
    pub fn branches(&self) -> BranchRange {
        BranchRange::new(0, self.scale)
    }

    /// Teller ids owned by `bid`.
    pub fn teller_range(bid: i64) -> Range<i64> {
        bid * TELLERS_PER_BRANCH..(bid + 1) * TELLERS_PER_BRANCH
    }

    /// Account ids owned by `bid`.
    pub fn account_range(bid: i64) -> Range<i64> {
        bid * ACCOUNTS_PER_BRANCH..(bid + 1) * ACCOUNTS_PER_BRANCH
    }

    pub fn branch_of_teller(tid: i64) -> i64 {
        tid.div_euclid(TELLERS_PER_BRANCH)
    }

    pub fn branch_of_account(aid: i64) -> i64 {
        aid.div_euclid(ACCOUNTS_PER_BRANCH)
    }
}

/// Contiguous half-open slice `[start, end)` of the branch id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRange {
    pub start: i64,
    pub end: i64,
}

impl BranchRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, bid: i64) -> bool {
        (self.start..self.end).contains(&bid)
    }

    pub fn iter(&self) -> Range<i64> {
        self.start..self.end
    }

    /// Splits `[0, scale)` into `parts` contiguous ranges.
    ///
    /// Range sizes differ by at most one; the remainder is handed to the
    /// first ranges. When `parts > scale` the trailing ranges are empty.
    pub fn partition(scale: i64, parts: usize) -> BenchResult<Vec<BranchRange>> {
        if parts == 0 {
            return Err(BenchError::invalid_config("cannot partition into 0 parts"));
        }
        let model = ScaleModel::new(scale)?;
        let parts_i = parts as i64;
        let base = model.scale() / parts_i;
        let remainder = model.scale() % parts_i;

        let mut ranges = Vec::with_capacity(parts);
        let mut start = 0;
        for index in 0..parts_i {
            let size = base + i64::from(index < remainder);
            ranges.push(BranchRange::new(start, start + size));
            start += size;
        }
        Ok(ranges)
    }
}

impl std::fmt::Display for BranchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
