//! Quota partitioning.
//!
//! Pure computation over child demand reports. Higher-priority demand is
//! served first; within one priority band the remaining quota is split
//! proportionally to demand. Unmet demand is returned as shortfall for the
//! caller to queue or escalate, never silently granted.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StewardError};
use crate::session::Priority;

/// One child's demand estimate for an allocation epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demand {
    pub child: String,
    pub amount: u64,
    /// Priority of the feature the child is servicing.
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub child: String,
    pub granted: u64,
    pub demanded: u64,
}

/// Result of one allocation epoch over a single parent's children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub epoch: u64,
    pub grants: Vec<Grant>,
    /// (child, unmet amount) pairs, in the order they should be served when
    /// quota frees up.
    pub shortfall: Vec<(String, u64)>,
}

impl Allocation {
    pub fn granted_to(&self, child: &str) -> u64 {
        self.grants
            .iter()
            .find(|g| g.child == child)
            .map(|g| g.granted)
            .unwrap_or(0)
    }

    pub fn total_granted(&self) -> u64 {
        self.grants.iter().map(|g| g.granted).sum()
    }
}

/// Partition `quota` among `demands`. The sum of grants never exceeds
/// `quota`; this holds by construction, and the final assertion raises a
/// coordination error (not a clamp) if it is ever violated.
pub fn allocate(quota: u64, demands: &[Demand], epoch: u64) -> Result<Allocation> {
    let mut grants: Vec<Grant> = demands
        .iter()
        .map(|d| Grant {
            child: d.child.clone(),
            granted: 0,
            demanded: d.amount,
        })
        .collect();
    let mut shortfall = Vec::new();
    let mut remaining = quota;

    for priority in [Priority::P0, Priority::P1, Priority::P2] {
        let band: Vec<usize> = demands
            .iter()
            .enumerate()
            .filter(|(_, d)| d.priority == priority && d.amount > 0)
            .map(|(i, _)| i)
            .collect();
        if band.is_empty() {
            continue;
        }

        let band_demand: u64 = band.iter().map(|&i| demands[i].amount).sum();

        if band_demand <= remaining {
            for &i in &band {
                grants[i].granted = demands[i].amount;
            }
            remaining -= band_demand;
            continue;
        }

        // Oversubscribed band: proportional floor split, leftover by largest
        // demand first.
        let mut handed = 0u64;
        for &i in &band {
            let share = remaining * demands[i].amount / band_demand;
            grants[i].granted = share;
            handed += share;
        }
        let mut leftover = remaining - handed;
        let mut by_demand: Vec<usize> = band.clone();
        by_demand.sort_by(|&a, &b| demands[b].amount.cmp(&demands[a].amount));
        for &i in &by_demand {
            if leftover == 0 {
                break;
            }
            if grants[i].granted < demands[i].amount {
                grants[i].granted += 1;
                leftover -= 1;
            }
        }
        remaining = leftover;

        for &i in &band {
            let unmet = demands[i].amount - grants[i].granted;
            if unmet > 0 {
                shortfall.push((demands[i].child.clone(), unmet));
            }
        }
    }

    let total: u64 = grants.iter().map(|g| g.granted).sum();
    if total > quota {
        return Err(StewardError::Coordination(format!(
            "allocation {} exceeds quota {} at epoch {}",
            total, quota, epoch
        )));
    }

    Ok(Allocation {
        epoch,
        grants,
        shortfall,
    })
}
