//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `records` - Unspent states this party participates in (key: sequence number)
//! - `refs` - StateRef → sequence number, for removal on spend
//! - `transactions` - Finalized transactions (key: tx id)
//! - `checkpoints` - In-flight initiator flows (key: flow id)
//! - `meta` - Sequence counter
//!
//! Sequence numbers are assigned in the order states are recorded, so a
//! forward scan of `records` returns them in observation order.

use crate::{
    error::{Error, Result},
    flow::{CheckpointStore, FlowCheckpoint},
    types::{Party, SignedTransaction, StateAndRef, TxId},
    Config,
};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_RECORDS: &str = "records";
const CF_REFS: &str = "refs";
const CF_TRANSACTIONS: &str = "transactions";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_META: &str = "meta";

const META_NEXT_SEQ: &[u8] = b"next_seq";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Next sequence number; held for the whole of a record write
    next_seq: Mutex<u64>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RECORDS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_REFS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_zstd()),
            ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_seq = match db
            .cf_handle(CF_META)
            .map(|cf| db.get_cf(cf, META_NEXT_SEQ))
            .transpose()?
            .flatten()
        {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };

        tracing::info!(path = ?path, next_seq, "Opened quota store");

        Ok(Self {
            db: Arc::new(db),
            next_seq: Mutex::new(next_seq),
        })
    }

    // Column family options

    fn cf_options_lz4() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_zstd() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Transaction operations

    /// Record a finalized transaction for `party` (atomic)
    ///
    /// Consumed inputs are removed, outputs `party` participates in are
    /// added. Returns `false` if the transaction was already recorded.
    pub fn record_transaction(&self, party: &Party, stx: &SignedTransaction) -> Result<bool> {
        let tx_id = stx.id();
        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_refs = self.cf_handle(CF_REFS)?;
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_meta = self.cf_handle(CF_META)?;

        let mut next_seq = self.next_seq.lock();

        if self.db.get_cf(cf_transactions, tx_id.as_bytes())?.is_some() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        let mut seq = *next_seq;

        // 1. Consumed inputs
        for input in &stx.tx.inputs {
            let ref_key = input.to_key();
            if let Some(seq_bytes) = self.db.get_cf(cf_refs, ref_key)? {
                batch.delete_cf(cf_records, &seq_bytes);
                batch.delete_cf(cf_refs, ref_key);
            }
        }

        // 2. Produced outputs
        for index in 0..stx.tx.outputs.len() {
            let state_and_ref = match stx.tx.out_ref(index) {
                Some(s) if s.record().is_participant(party) => s,
                _ => continue,
            };
            let seq_key = seq.to_be_bytes();
            batch.put_cf(cf_records, seq_key, bincode::serialize(&state_and_ref)?);
            batch.put_cf(cf_refs, state_and_ref.reference.to_key(), seq_key);
            seq += 1;
        }

        // 3. Transaction and counter
        batch.put_cf(cf_transactions, tx_id.as_bytes(), bincode::serialize(stx)?);
        batch.put_cf(cf_meta, META_NEXT_SEQ, seq.to_be_bytes());

        self.db.write(batch)?;
        *next_seq = seq;

        tracing::debug!(tx_id = %tx_id, party = %party, "Transaction recorded");
        Ok(true)
    }

    /// Get finalized transaction by id
    pub fn get_transaction(&self, tx_id: &TxId) -> Result<Option<SignedTransaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, tx_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All unspent states in observation order
    pub fn unspent_states(&self) -> Result<Vec<StateAndRef>> {
        let cf = self.cf_handle(CF_RECORDS)?;
        let mut states = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            states.push(bincode::deserialize(&value)?);
        }
        Ok(states)
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let unspent_records = self.approximate_count(self.cf_handle(CF_RECORDS)?)?;
        let total_transactions = self.approximate_count(self.cf_handle(CF_TRANSACTIONS)?)?;
        let in_flight_flows = self.approximate_count(self.cf_handle(CF_CHECKPOINTS)?)?;

        Ok(StorageStats {
            unspent_records,
            total_transactions,
            in_flight_flows,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

impl CheckpointStore for Storage {
    fn save_checkpoint(&self, checkpoint: &FlowCheckpoint) -> Result<()> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        self.db
            .put_cf(cf, checkpoint.flow_id.as_bytes(), bincode::serialize(checkpoint)?)?;
        Ok(())
    }

    fn remove_checkpoint(&self, flow_id: Uuid) -> Result<()> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        self.db.delete_cf(cf, flow_id.as_bytes())?;
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<FlowCheckpoint>> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        let mut checkpoints = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            checkpoints.push(bincode::deserialize(&value)?);
        }
        Ok(checkpoints)
    }
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Corrupt sequence counter ({} bytes)", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate unspent record count
    pub unspent_records: u64,
    /// Approximate finalized transaction count
    pub total_transactions: u64,
    /// Approximate checkpoint count
    pub in_flight_flows: u64,
}
