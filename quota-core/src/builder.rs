//! Transaction assembly
//!
//! A [`TransactionBuilder`] collects inputs, outputs and one command, then
//! checks the result against the quota contract before anything is signed
//! or sent. [`assemble_issue`] and [`assemble_transfer`] turn caller intent
//! into a verified builder.

use crate::contract::QuotaContract;
use crate::identity::Identity;
use crate::selector::Selection;
use crate::types::{
    Command, CommandData, LedgerTransaction, Party, PublicKey, QuotaRecord, SignedTransaction,
    StateAndRef, TransactionState, WireTransaction,
};
use crate::Result;

/// Mutable transaction under construction
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    notary: Party,
    inputs: Vec<StateAndRef>,
    outputs: Vec<TransactionState>,
    commands: Vec<Command>,
    privacy_salt: [u8; 32],
}

impl TransactionBuilder {
    /// Start an empty transaction for `notary`
    pub fn new(notary: Party) -> Self {
        Self {
            notary,
            inputs: Vec::new(),
            outputs: Vec::new(),
            commands: Vec::new(),
            privacy_salt: rand::random(),
        }
    }

    /// Assemble and verify in one step
    pub fn assemble(
        command: CommandData,
        inputs: Vec<StateAndRef>,
        outputs: Vec<QuotaRecord>,
        required_signers: Vec<PublicKey>,
        notary: Party,
    ) -> Result<Self> {
        let mut builder = Self::new(notary);
        for input in inputs {
            builder.add_input_state(input);
        }
        for output in outputs {
            builder.add_output_state(output);
        }
        builder.add_command(command, required_signers);
        builder.verify()?;
        Ok(builder)
    }

    /// Consume an existing state
    pub fn add_input_state(&mut self, input: StateAndRef) -> &mut Self {
        self.inputs.push(input);
        self
    }

    /// Produce a quota record
    pub fn add_output_state(&mut self, record: QuotaRecord) -> &mut Self {
        let state = TransactionState::quota(record, self.notary.clone());
        self.outputs.push(state);
        self
    }

    /// Attach a command; signers are deduplicated, first occurrence wins
    pub fn add_command(&mut self, value: CommandData, signers: Vec<PublicKey>) -> &mut Self {
        let mut unique = Vec::with_capacity(signers.len());
        for key in signers {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        self.commands.push(Command::new(value, unique));
        self
    }

    /// Inputs added so far
    pub fn inputs(&self) -> &[StateAndRef] {
        &self.inputs
    }

    /// Outputs added so far
    pub fn outputs(&self) -> &[TransactionState] {
        &self.outputs
    }

    /// Freeze into a wire transaction
    pub fn to_wire_transaction(&self) -> WireTransaction {
        WireTransaction {
            inputs: self.inputs.iter().map(|s| s.reference).collect(),
            outputs: self.outputs.clone(),
            commands: self.commands.clone(),
            notary: self.notary.clone(),
            privacy_salt: self.privacy_salt,
        }
    }

    /// Run the quota contract over the current contents
    pub fn verify(&self) -> Result<LedgerTransaction> {
        let wire = self.to_wire_transaction();
        let ltx = LedgerTransaction {
            id: wire.id(),
            inputs: self.inputs.clone(),
            outputs: wire.outputs,
            commands: wire.commands,
            notary: wire.notary,
        };
        QuotaContract.verify(&ltx)?;
        Ok(ltx)
    }

    /// Verify, then sign as the initiator
    pub fn sign_initial_transaction(&self, identity: &Identity) -> Result<SignedTransaction> {
        self.verify()?;
        let mut stx = SignedTransaction::new(self.to_wire_transaction(), self.inputs.clone());
        let sig = identity.sign_transaction(&stx.id());
        stx.add_signature(sig);
        Ok(stx)
    }
}

/// New quota for `mill`, owned by the mill and signed by it
pub fn assemble_issue(mill: &Party, amount: u64, notary: &Party) -> Result<TransactionBuilder> {
    TransactionBuilder::assemble(
        CommandData::Issue,
        vec![],
        vec![QuotaRecord::new(mill.clone(), mill.clone(), amount)],
        vec![mill.owning_key],
        notary.clone(),
    )
}

/// Move `amount` of `mill`'s quota from `owner` to `new_owner`
///
/// Change, if any, goes back to `owner` under the same mill. The mill and
/// the new owner are the required signers.
pub fn assemble_transfer(
    selection: &Selection,
    owner: &Party,
    mill: &Party,
    amount: u64,
    new_owner: &Party,
    notary: &Party,
) -> Result<TransactionBuilder> {
    let mut outputs = vec![QuotaRecord::new(mill.clone(), new_owner.clone(), amount)];
    if selection.change > 0 {
        outputs.push(QuotaRecord::new(mill.clone(), owner.clone(), selection.change));
    }

    TransactionBuilder::assemble(
        CommandData::Transfer,
        selection.inputs.clone(),
        outputs,
        vec![mill.owning_key, new_owner.owning_key],
        notary.clone(),
    )
}
