//! Input selection for transfers
//!
//! Greedy, first-seen order: records are taken in the order the vault
//! returns them until the target is covered. Records after that point are
//! not spent but still count towards the available balance.

use crate::contract::{ContractViolation, ViolationKind};
use crate::types::{Party, StateAndRef};
use crate::{Error, Result};

/// Result of a successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Records to consume, in vault order
    pub inputs: Vec<StateAndRef>,
    /// Sum of the chosen records
    pub selected_total: u64,
    /// Amount returned to the owner
    pub change: u64,
    /// Every matching record's amount, chosen or not
    pub available: u64,
}

/// Pick records of `mill` held by `owner` covering `target`
///
/// Change is the chosen total minus the target, so it is correct whatever
/// the first crossing point was, including an exact hit.
pub fn select_inputs(
    records: &[StateAndRef],
    mill: &Party,
    owner: &Party,
    target: u64,
) -> Result<Selection> {
    if target == 0 {
        return Err(
            ContractViolation::new(ViolationKind::Arithmetic, "Positive amount expected").into(),
        );
    }

    let mut inputs = Vec::new();
    let mut selected_total = 0u64;
    let mut available = 0u64;

    for candidate in records
        .iter()
        .filter(|s| s.record().mill == *mill && s.record().owner == *owner)
    {
        if selected_total < target {
            inputs.push(candidate.clone());
            selected_total = selected_total.saturating_add(candidate.record().amount);
        }
        available = available.saturating_add(candidate.record().amount);
    }

    if available < target || selected_total < target {
        tracing::debug!(
            mill = %mill,
            owner = %owner,
            requested = target,
            available,
            "Selection cannot cover target"
        );
        return Err(Error::InsufficientBalance {
            requested: target,
            available,
        });
    }

    Ok(Selection {
        change: selected_total - target,
        inputs,
        selected_total,
        available,
    })
}
