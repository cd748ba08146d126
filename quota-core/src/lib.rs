//! Quota Ledger Core
//!
//! Issue and transfer of production quota between mutually distrusting
//! parties on a UTXO ledger.
//!
//! # Architecture
//!
//! - **Validation**: every party re-runs the quota contract itself
//! - **Selection**: greedy first-seen input selection with soft locks
//! - **Flows**: explicit initiator/counterparty state machines with checkpoints
//! - **Finality**: a single-writer notary orders spends
//!
//! # Invariants
//!
//! - Conservation: Σ(inputs) == Σ(outputs) for every transfer
//! - Supply changes only through issue
//! - No vault is written before a transaction is notarised
//! - A record is reserved by at most one in-flight flow per node

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod builder;
pub mod config;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod identity;
pub mod metrics;
pub mod network;
pub mod node;
pub mod notary;
pub mod responder;
pub mod selector;
pub mod storage;
pub mod types;
pub mod vault;

// Re-exports
pub use builder::{assemble_issue, assemble_transfer, TransactionBuilder};
pub use config::Config;
pub use contract::{ContractViolation, QuotaContract, ViolationKind, QUOTA_CONTRACT_ID};
pub use error::{Error, FinalityError, Result};
pub use flow::{CounterpartyState, FlowCheckpoint, FlowEvent, FlowState};
pub use identity::Identity;
pub use network::Network;
pub use node::{Node, NodeBuilder};
pub use notary::{spawn_notary, FinalityService, NotarisationReceipt, NotaryHandle};
pub use responder::{AcceptAll, SigningPolicy};
pub use storage::Storage;
pub use types::{Party, QuotaRecord, SignedTransaction, StateAndRef, StateRef, TxId};
pub use vault::{MemoryVault, PersistentVault, VaultService};
