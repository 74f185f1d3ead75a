use std::fmt;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_common::crypto::{Hash, Publickey};
use tessera_common::env::{Ballot, Block, Height, Manifest, Operation, Seal, State};
use tessera_common::error::{Result, TesseraError};
use tracing::info;

use super::{token_key, Storage};

const MANIFESTS_TABLE: TableDefinition<i64, &[u8]> = TableDefinition::new("manifests");
const BLOCKS_TABLE: TableDefinition<i64, &[u8]> = TableDefinition::new("blocks");
const SEALS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("seals");
const PROPOSALS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("proposals");
const OPERATIONS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("operations");
/// operation hash -> staging sequence
const STAGED_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("staged_operations");
const STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("states");
/// committed fact hash -> height
const FACTS_TABLE: TableDefinition<&[u8], i64> = TableDefinition::new("operation_facts");
/// signer ∥ token -> height
const TOKENS_TABLE: TableDefinition<&[u8], i64> = TableDefinition::new("operation_tokens");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const STAGED_SEQ_KEY: &str = "staged_seq";

fn db_err<E: fmt::Display>(e: E) -> TesseraError {
    TesseraError::Storage(e.to_string())
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(db_err)
}

fn decode<T: DeserializeOwned>(b: &[u8]) -> Result<T> {
    bincode::deserialize(b).map_err(db_err)
}

/// Storage in a single redb file.
pub struct RedbStorage {
    db: Database,
}

impl fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStorage").field("db", &"Redb").finish()
    }
}

impl RedbStorage {
    pub const FILE_NAME: &'static str = "tessera.redb";

    /// Opens (or creates) `<data_dir>/tessera.redb`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        let db = Database::create(&path).map_err(db_err)?;
        let storage = Self { db };
        storage.create_tables()?;
        info!(path = %path.display(), "opened redb storage");
        Ok(storage)
    }

    fn create_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            txn.open_table(MANIFESTS_TABLE).map_err(db_err)?;
            txn.open_table(BLOCKS_TABLE).map_err(db_err)?;
            txn.open_table(SEALS_TABLE).map_err(db_err)?;
            txn.open_table(PROPOSALS_TABLE).map_err(db_err)?;
            txn.open_table(OPERATIONS_TABLE).map_err(db_err)?;
            txn.open_table(STAGED_TABLE).map_err(db_err)?;
            txn.open_table(STATES_TABLE).map_err(db_err)?;
            txn.open_table(FACTS_TABLE).map_err(db_err)?;
            txn.open_table(TOKENS_TABLE).map_err(db_err)?;
            txn.open_table(META_TABLE).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)
    }

    fn get_by_hash(&self, def: TableDefinition<&'static [u8], &'static [u8]>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(def).map_err(db_err)?;
        let value = table.get(key).map_err(db_err)?.map(|g| g.value().to_vec());
        Ok(value)
    }

    fn get_by_height(&self, def: TableDefinition<i64, &'static [u8]>, height: Height) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(def).map_err(db_err)?;
        let value = table.get(height.0).map_err(db_err)?.map(|g| g.value().to_vec());
        Ok(value)
    }

    fn has_marker(&self, def: TableDefinition<&'static [u8], i64>, key: &[u8]) -> Result<bool> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(def).map_err(db_err)?;
        let found = table.get(key).map_err(db_err)?.is_some();
        Ok(found)
    }
}

impl Storage for RedbStorage {
    fn last_manifest(&self) -> Result<Option<Manifest>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(MANIFESTS_TABLE).map_err(db_err)?;
        let last = table.last().map_err(db_err)?.map(|(_, v)| v.value().to_vec());
        last.map(|b| decode(&b)).transpose()
    }

    fn last_block(&self) -> Result<Option<Block>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(BLOCKS_TABLE).map_err(db_err)?;
        let last = table.last().map_err(db_err)?.map(|(_, v)| v.value().to_vec());
        last.map(|b| decode(&b)).transpose()
    }

    fn manifest_by_height(&self, height: Height) -> Result<Option<Manifest>> {
        self.get_by_height(MANIFESTS_TABLE, height)?.map(|b| decode(&b)).transpose()
    }

    fn manifests(&self, from: Height, to: Height) -> Result<Vec<Manifest>> {
        if from > to {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(MANIFESTS_TABLE).map_err(db_err)?;
        let mut out: Vec<Manifest> = Vec::new();
        for entry in table.range(from.0..=to.0).map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            let expected = out.last().map_or(from, |m| m.height.next());
            if k.value() != expected.0 {
                break;
            }
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    fn block_by_height(&self, height: Height) -> Result<Option<Block>> {
        self.get_by_height(BLOCKS_TABLE, height)?.map(|b| decode(&b)).transpose()
    }

    fn seal_by_hash(&self, hash: &Hash) -> Result<Option<Seal>> {
        self.get_by_hash(SEALS_TABLE, hash.as_bytes())?.map(|b| decode(&b)).transpose()
    }

    fn has_seal(&self, hash: &Hash) -> Result<bool> {
        Ok(self.get_by_hash(SEALS_TABLE, hash.as_bytes())?.is_some())
    }

    fn new_seal(&self, seal: &Seal) -> Result<()> {
        let hash = seal.hash();
        let value = encode(seal)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(SEALS_TABLE).map_err(db_err)?;
            if table.get(hash.as_bytes()).map_err(db_err)?.is_some() {
                return Err(TesseraError::Duplicate(format!("seal {hash}")));
            }
            table.insert(hash.as_bytes(), value.as_slice()).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)
    }

    fn new_proposal(&self, proposal: &Ballot) -> Result<()> {
        let key = proposal.fact_hash();
        let value = encode(proposal)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(PROPOSALS_TABLE).map_err(db_err)?;
            if table.get(key.as_bytes()).map_err(db_err)?.is_none() {
                table.insert(key.as_bytes(), value.as_slice()).map_err(db_err)?;
            }
        }
        txn.commit().map_err(db_err)
    }

    fn proposal(&self, fact_hash: &Hash) -> Result<Option<Ballot>> {
        self.get_by_hash(PROPOSALS_TABLE, fact_hash.as_bytes())?
            .map(|b| decode(&b))
            .transpose()
    }

    fn new_operations(&self, operations: &[Operation]) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut ops = txn.open_table(OPERATIONS_TABLE).map_err(db_err)?;
            let mut staged = txn.open_table(STAGED_TABLE).map_err(db_err)?;
            let facts = txn.open_table(FACTS_TABLE).map_err(db_err)?;
            let mut meta = txn.open_table(META_TABLE).map_err(db_err)?;

            let mut seq = meta.get(STAGED_SEQ_KEY).map_err(db_err)?.map_or(0, |g| g.value());
            for op in operations {
                let known = ops.get(op.hash.as_bytes()).map_err(db_err)?.is_some();
                let applied = facts.get(op.fact_hash().as_bytes()).map_err(db_err)?.is_some();
                if known || applied {
                    continue;
                }
                ops.insert(op.hash.as_bytes(), encode(op)?.as_slice()).map_err(db_err)?;
                staged.insert(op.hash.as_bytes(), seq).map_err(db_err)?;
                seq += 1;
            }
            meta.insert(STAGED_SEQ_KEY, seq).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)
    }

    fn operation(&self, hash: &Hash) -> Result<Option<Operation>> {
        self.get_by_hash(OPERATIONS_TABLE, hash.as_bytes())?
            .map(|b| decode(&b))
            .transpose()
    }

    fn staged_operations(&self, limit: usize) -> Result<Vec<Operation>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let staged = txn.open_table(STAGED_TABLE).map_err(db_err)?;
        let ops = txn.open_table(OPERATIONS_TABLE).map_err(db_err)?;

        let mut order: Vec<(u64, Vec<u8>)> = Vec::new();
        for entry in staged.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            order.push((v.value(), k.value().to_vec()));
        }
        order.sort();

        let mut out = Vec::new();
        for (_, hash) in order.into_iter().take(limit) {
            if let Some(g) = ops.get(hash.as_slice()).map_err(db_err)? {
                out.push(decode(g.value())?);
            }
        }
        Ok(out)
    }

    fn has_operation_fact(&self, fact_hash: &Hash) -> Result<bool> {
        self.has_marker(FACTS_TABLE, fact_hash.as_bytes())
    }

    fn has_token(&self, signer: &Publickey, token: &[u8]) -> Result<bool> {
        self.has_marker(TOKENS_TABLE, token_key(signer, token).as_slice())
    }

    fn state(&self, key: &str) -> Result<Option<State>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(STATES_TABLE).map_err(db_err)?;
        let value = table.get(key).map_err(db_err)?.map(|g| g.value().to_vec());
        value.map(|b| decode(&b)).transpose()
    }

    fn commit_block(&self, block: &Block, states: &[State]) -> Result<()> {
        let height = block.height();
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut manifests = txn.open_table(MANIFESTS_TABLE).map_err(db_err)?;
            let last = manifests.last().map_err(db_err)?.map(|(_, v)| v.value().to_vec());
            match last {
                Some(b) => block.manifest.is_next_of(&decode::<Manifest>(&b)?)?,
                None if height != Height::GENESIS => {
                    return Err(TesseraError::Invalid(format!("first block must be genesis, got {height}")));
                }
                None => {}
            }
            manifests.insert(height.0, encode(&block.manifest)?.as_slice()).map_err(db_err)?;

            let mut blocks = txn.open_table(BLOCKS_TABLE).map_err(db_err)?;
            blocks.insert(height.0, encode(block)?.as_slice()).map_err(db_err)?;

            let mut table = txn.open_table(STATES_TABLE).map_err(db_err)?;
            for st in states {
                table.insert(st.key.as_str(), encode(st)?.as_slice()).map_err(db_err)?;
            }

            let mut ops = txn.open_table(OPERATIONS_TABLE).map_err(db_err)?;
            let mut facts = txn.open_table(FACTS_TABLE).map_err(db_err)?;
            let mut tokens = txn.open_table(TOKENS_TABLE).map_err(db_err)?;
            let mut staged = txn.open_table(STAGED_TABLE).map_err(db_err)?;
            for op in &block.operations {
                ops.insert(op.hash.as_bytes(), encode(op)?.as_slice()).map_err(db_err)?;
                facts.insert(op.fact_hash().as_bytes(), height.0).map_err(db_err)?;
                for signer in op.signers() {
                    tokens
                        .insert(token_key(signer, op.fact.token()).as_slice(), height.0)
                        .map_err(db_err)?;
                }
                staged.remove(op.hash.as_bytes()).map_err(db_err)?;
            }

            // other staged operations carrying an already applied fact are dead
            let mut stale: Vec<Vec<u8>> = Vec::new();
            for entry in staged.iter().map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                if let Some(g) = ops.get(k.value()).map_err(db_err)? {
                    let op: Operation = decode(g.value())?;
                    if facts.get(op.fact_hash().as_bytes()).map_err(db_err)?.is_some() {
                        stale.push(k.value().to_vec());
                    }
                }
            }
            for k in stale {
                staged.remove(k.as_slice()).map_err(db_err)?;
            }
        }
        txn.commit().map_err(db_err)
    }

    fn clean(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            txn.delete_table(MANIFESTS_TABLE).map_err(db_err)?;
            txn.delete_table(BLOCKS_TABLE).map_err(db_err)?;
            txn.delete_table(SEALS_TABLE).map_err(db_err)?;
            txn.delete_table(PROPOSALS_TABLE).map_err(db_err)?;
            txn.delete_table(OPERATIONS_TABLE).map_err(db_err)?;
            txn.delete_table(STAGED_TABLE).map_err(db_err)?;
            txn.delete_table(STATES_TABLE).map_err(db_err)?;
            txn.delete_table(FACTS_TABLE).map_err(db_err)?;
            txn.delete_table(TOKENS_TABLE).map_err(db_err)?;
            txn.delete_table(META_TABLE).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        self.create_tables()
    }
}
