//! Per-party store of unspent quota records
//!
//! A vault only ever sees finalized transactions. Consumed inputs are
//! removed, outputs the party participates in are kept in the order they
//! were observed.
//!
//! In-flight flows reserve the records they select in a [`SoftLockTable`]
//! so two flows on the same node never build on the same input.

use crate::selector::{select_inputs, Selection};
use crate::storage::Storage;
use crate::types::{Party, SignedTransaction, StateAndRef, StateRef, TxId};
use crate::Result;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Ledger store queried by flows
pub trait VaultService: Send + Sync {
    /// Unspent records held by `owner`, in observation order
    fn query_unspent(&self, owner: &Party) -> Result<Vec<StateAndRef>> {
        Ok(self
            .all_unspent()?
            .into_iter()
            .filter(|s| s.record().owner == *owner)
            .collect())
    }

    /// Every unspent record this party participates in
    fn all_unspent(&self) -> Result<Vec<StateAndRef>>;

    /// Apply a finalized transaction; `false` if it was already applied
    fn record_transaction(&self, stx: &SignedTransaction) -> Result<bool>;
}

#[derive(Debug, Default)]
struct MemoryVaultInner {
    states: Vec<StateAndRef>,
    seen: HashSet<TxId>,
}

/// Vault kept in memory
#[derive(Debug)]
pub struct MemoryVault {
    party: Party,
    inner: RwLock<MemoryVaultInner>,
}

impl MemoryVault {
    /// Empty vault for `party`
    pub fn new(party: Party) -> Self {
        Self {
            party,
            inner: RwLock::new(MemoryVaultInner::default()),
        }
    }
}

impl VaultService for MemoryVault {
    fn all_unspent(&self) -> Result<Vec<StateAndRef>> {
        Ok(self.inner.read().states.clone())
    }

    fn record_transaction(&self, stx: &SignedTransaction) -> Result<bool> {
        let tx_id = stx.id();
        let mut inner = self.inner.write();

        if !inner.seen.insert(tx_id) {
            return Ok(false);
        }

        let consumed: HashSet<StateRef> = stx.tx.inputs.iter().copied().collect();
        inner.states.retain(|s| !consumed.contains(&s.reference));

        for index in 0..stx.tx.outputs.len() {
            if let Some(state) = stx.tx.out_ref(index) {
                if state.record().is_participant(&self.party) {
                    inner.states.push(state);
                }
            }
        }

        tracing::debug!(tx_id = %tx_id, party = %self.party, "Vault updated");
        Ok(true)
    }
}

/// Vault backed by RocksDB
pub struct PersistentVault {
    party: Party,
    storage: Arc<Storage>,
}

impl PersistentVault {
    /// Vault for `party` over an open store
    pub fn new(party: Party, storage: Arc<Storage>) -> Self {
        Self { party, storage }
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

impl std::fmt::Debug for PersistentVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentVault")
            .field("party", &self.party)
            .finish()
    }
}

impl VaultService for PersistentVault {
    fn all_unspent(&self) -> Result<Vec<StateAndRef>> {
        self.storage.unspent_states()
    }

    fn record_transaction(&self, stx: &SignedTransaction) -> Result<bool> {
        self.storage.record_transaction(&self.party, stx)
    }
}

/// Reservations of unspent records by in-flight flows
#[derive(Debug, Default)]
pub struct SoftLockTable {
    reserved: DashMap<StateRef, Uuid>,
    // Serializes select-then-reserve so two selections never interleave
    selection: Mutex<()>,
}

impl SoftLockTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Select unreserved records of `mill` held by `owner` and reserve them
    /// for `flow_id`
    ///
    /// The records stay reserved until the returned [`Reservation`] is
    /// dropped.
    pub fn select_and_reserve(
        &self,
        vault: &dyn VaultService,
        flow_id: Uuid,
        mill: &Party,
        owner: &Party,
        amount: u64,
    ) -> Result<Reservation<'_>> {
        let _guard = self.selection.lock();

        let candidates: Vec<StateAndRef> = vault
            .query_unspent(owner)?
            .into_iter()
            .filter(|s| !self.reserved.contains_key(&s.reference))
            .collect();

        let selection = select_inputs(&candidates, mill, owner, amount)?;
        for input in &selection.inputs {
            self.reserved.insert(input.reference, flow_id);
        }

        tracing::debug!(
            flow_id = %flow_id,
            inputs = selection.inputs.len(),
            change = selection.change,
            "Inputs reserved"
        );
        Ok(Reservation {
            table: self,
            flow_id,
            selection,
        })
    }

    fn release(&self, flow_id: Uuid) {
        self.reserved.retain(|_, holder| *holder != flow_id);
    }

    /// Number of reserved records
    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    /// No reservations held
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

/// Records held by one flow; released on drop
#[derive(Debug)]
pub struct Reservation<'a> {
    table: &'a SoftLockTable,
    flow_id: Uuid,
    selection: Selection,
}

impl Reservation<'_> {
    /// The reserved selection
    pub fn selection(&self) -> &Selection {
        &self.selection
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table.release(self.flow_id);
        tracing::debug!(flow_id = %self.flow_id, "Inputs released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::types::{Command, CommandData, QuotaRecord, TransactionState, WireTransaction};
    use crate::Error;

    fn issue(
        mill: &Party,
        owner: &Party,
        notary: &Party,
        amount: u64,
        salt: u8,
    ) -> SignedTransaction {
        let tx = WireTransaction {
            inputs: vec![],
            outputs: vec![TransactionState::quota(
                QuotaRecord::new(mill.clone(), owner.clone(), amount),
                notary.clone(),
            )],
            commands: vec![Command::new(CommandData::Issue, vec![mill.owning_key])],
            notary: notary.clone(),
            privacy_salt: [salt; 32],
        };
        SignedTransaction::new(tx, vec![])
    }

    struct Fixture {
        mill: Party,
        alice: Party,
        bob: Party,
        notary: Party,
    }

    fn fixture() -> Fixture {
        Fixture {
            mill: Identity::from_seed("Mill", &[1u8; 32]).party().clone(),
            alice: Identity::from_seed("Alice", &[3u8; 32]).party().clone(),
            bob: Identity::from_seed("Bob", &[4u8; 32]).party().clone(),
            notary: Identity::from_seed("Notary", &[9u8; 32]).party().clone(),
        }
    }

    #[test]
    fn test_memory_vault_filters_participants() {
        let f = fixture();
        let vault = MemoryVault::new(f.alice.clone());

        assert!(vault.record_transaction(&issue(&f.mill, &f.alice, &f.notary, 5, 1)).unwrap());
        assert!(vault.record_transaction(&issue(&f.mill, &f.bob, &f.notary, 7, 2)).unwrap());

        let held = vault.query_unspent(&f.alice).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].record().amount, 5);
        assert!(vault.query_unspent(&f.bob).unwrap().is_empty());
    }

    #[test]
    fn test_memory_vault_is_idempotent() {
        let f = fixture();
        let vault = MemoryVault::new(f.alice.clone());
        let stx = issue(&f.mill, &f.alice, &f.notary, 5, 1);

        assert!(vault.record_transaction(&stx).unwrap());
        assert!(!vault.record_transaction(&stx).unwrap());
        assert_eq!(vault.all_unspent().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_vault_removes_spent() {
        let f = fixture();
        let vault = MemoryVault::new(f.alice.clone());
        let issued = issue(&f.mill, &f.alice, &f.notary, 5, 1);
        vault.record_transaction(&issued).unwrap();

        let input = issued.tx.out_ref(0).unwrap();
        let spend = WireTransaction {
            inputs: vec![input.reference],
            outputs: vec![TransactionState::quota(
                QuotaRecord::new(f.mill.clone(), f.bob.clone(), 5),
                f.notary.clone(),
            )],
            commands: vec![Command::new(
                CommandData::Transfer,
                vec![f.mill.owning_key, f.bob.owning_key],
            )],
            notary: f.notary.clone(),
            privacy_salt: [3u8; 32],
        };
        vault
            .record_transaction(&SignedTransaction::new(spend, vec![input]))
            .unwrap();

        assert!(vault.all_unspent().unwrap().is_empty());
    }

    #[test]
    fn test_soft_locks_prevent_double_selection() {
        let f = fixture();
        let vault = MemoryVault::new(f.alice.clone());
        vault.record_transaction(&issue(&f.mill, &f.alice, &f.notary, 5, 1)).unwrap();
        vault.record_transaction(&issue(&f.mill, &f.alice, &f.notary, 5, 2)).unwrap();

        let locks = SoftLockTable::new();

        let a = locks
            .select_and_reserve(&vault, Uuid::now_v7(), &f.mill, &f.alice, 5)
            .unwrap();
        let b = locks
            .select_and_reserve(&vault, Uuid::now_v7(), &f.mill, &f.alice, 5)
            .unwrap();
        assert_ne!(
            a.selection().inputs[0].reference,
            b.selection().inputs[0].reference
        );

        let err = locks
            .select_and_reserve(&vault, Uuid::now_v7(), &f.mill, &f.alice, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { requested: 1, available: 0 }));

        let released = a.selection().inputs[0].reference;
        drop(a);
        assert_eq!(locks.len(), 1);

        let again = locks
            .select_and_reserve(&vault, Uuid::now_v7(), &f.mill, &f.alice, 5)
            .unwrap();
        assert_eq!(again.selection().inputs[0].reference, released);

        drop(again);
        drop(b);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_persistent_vault() {
        let f = fixture();
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = crate::Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let vault = PersistentVault::new(f.alice.clone(), storage);

        vault.record_transaction(&issue(&f.mill, &f.alice, &f.notary, 5, 1)).unwrap();
        vault.record_transaction(&issue(&f.mill, &f.bob, &f.notary, 7, 2)).unwrap();

        let held = vault.query_unspent(&f.alice).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].record().amount, 5);
    }
}
