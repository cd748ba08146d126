//! Quota contract: the state-transition rules
//!
//! [`QuotaContract::verify`] is a pure predicate over a resolved
//! transaction. The initiator runs it before signing, every counterparty
//! runs it again before adding its own signature, and the notary runs it
//! once more before committing.
//!
//! # Rules
//!
//! - Exactly one command per transaction
//! - **Issue**: no inputs, one quota output, amount ≥ 1, mill signs
//! - **Transfer**: one or two outputs, at least one input,
//!   Σ(inputs) == Σ(outputs) ≥ 1, a single mill throughout
//! - **Exit**: reserved, no content rule

use crate::types::{Command, CommandData, LedgerTransaction, QuotaRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier attached to every state governed by this contract
pub const QUOTA_CONTRACT_ID: &str = "quota.QuotaContract";

/// Category of a contract failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Wrong input/output counts, wrong state type, wrong command
    Shape,
    /// Conservation or positivity broken
    Arithmetic,
    /// Required signer missing
    Authorization,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Shape => write!(f, "shape"),
            ViolationKind::Arithmetic => write!(f, "arithmetic"),
            ViolationKind::Authorization => write!(f, "authorization"),
        }
    }
}

/// A broken contract rule
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} violation: {reason}")]
pub struct ContractViolation {
    /// Failure category
    pub kind: ViolationKind,
    /// Which rule failed
    pub reason: String,
}

impl ContractViolation {
    /// Create new violation
    pub fn new(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn shape(reason: impl Into<String>) -> Self {
        Self::new(ViolationKind::Shape, reason)
    }

    fn arithmetic(reason: impl Into<String>) -> Self {
        Self::new(ViolationKind::Arithmetic, reason)
    }

    fn authorization(reason: impl Into<String>) -> Self {
        Self::new(ViolationKind::Authorization, reason)
    }
}

/// Contract result
pub type VerifyResult = std::result::Result<(), ContractViolation>;

/// The quota contract
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaContract;

impl QuotaContract {
    /// Verify a transaction against the contract rules
    pub fn verify(&self, tx: &LedgerTransaction) -> VerifyResult {
        let command = require_single_command(&tx.commands)?;

        match &command.value {
            CommandData::Issue => verify_issue(tx, command),
            CommandData::Transfer => verify_transfer(tx),
            CommandData::Exit => Ok(()),
            CommandData::Other(name) => Err(ContractViolation::shape(format!(
                "Unrecognised command: {}",
                name
            ))),
        }
    }
}

fn require_single_command(commands: &[Command]) -> Result<&Command, ContractViolation> {
    match commands {
        [command] => Ok(command),
        _ => Err(ContractViolation::shape(format!(
            "Required a single command, found {}",
            commands.len()
        ))),
    }
}

fn verify_issue(tx: &LedgerTransaction, command: &Command) -> VerifyResult {
    if !tx.inputs.is_empty() {
        return Err(ContractViolation::shape("Zero inputs expected"));
    }

    if tx.outputs.len() != 1 {
        return Err(ContractViolation::shape("One output expected"));
    }

    let output = match tx.quota_outputs().next() {
        Some(record) => record,
        None => return Err(ContractViolation::shape("Issue output should be a QuotaRecord")),
    };

    if output.amount < 1 {
        return Err(ContractViolation::arithmetic("Positive amount expected"));
    }

    if !command.signers.contains(&output.mill.owning_key) {
        return Err(ContractViolation::authorization("Mill must sign"));
    }

    Ok(())
}

fn verify_transfer(tx: &LedgerTransaction) -> VerifyResult {
    if !(tx.outputs.len() == 1 || tx.outputs.len() == 2) {
        return Err(ContractViolation::shape(
            "Quota transfer should have one or two outputs",
        ));
    }

    if tx.inputs.is_empty() {
        return Err(ContractViolation::shape("At least 1 input expected"));
    }

    if tx.quota_outputs().count() != tx.outputs.len() {
        return Err(ContractViolation::shape(
            "Quota transfer output should be a QuotaRecord",
        ));
    }

    if tx.quota_inputs().count() != tx.inputs.len() {
        return Err(ContractViolation::shape(
            "Quota transfer input should be a QuotaRecord",
        ));
    }

    let input_sum = checked_sum(tx.quota_inputs())?;
    let output_sum = checked_sum(tx.quota_outputs())?;

    if input_sum != output_sum {
        return Err(ContractViolation::arithmetic(format!(
            "Incorrect Spending: inputs {} != outputs {}",
            input_sum, output_sum
        )));
    }

    if input_sum < 1 {
        return Err(ContractViolation::arithmetic("Positive amount expected"));
    }

    let mut records = tx.quota_inputs().chain(tx.quota_outputs());
    if let Some(first) = records.next() {
        if records.any(|r| r.mill != first.mill) {
            return Err(ContractViolation::shape("All records must share one mill"));
        }
    }

    Ok(())
}

pub(crate) fn checked_sum<'a>(
    mut records: impl Iterator<Item = &'a QuotaRecord>,
) -> Result<u64, ContractViolation> {
    records.try_fold(0u64, |acc, r| {
        acc.checked_add(r.amount)
            .ok_or_else(|| ContractViolation::arithmetic("Amount overflow"))
    })
}
