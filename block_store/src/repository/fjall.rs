use std::fs;
use std::path::Path;

use ::fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use containers::{Block, Bytes32, ChainPosition, Height, PendingBlock};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{check_rewind_target, plan_batch, BatchPlan, BlockRepository};
use crate::error::{Result, StoreError};

const BLOCKS_KEYSPACE: &str = "blocks";
const HASHES_BY_HEIGHT_KEYSPACE: &str = "hashes-by-height";
const META_KEYSPACE: &str = "meta";
const TIP_KEY: &[u8] = b"tip";

/// Repository backed by a fjall database.
///
/// Blocks are stored as JSON under their hash, the canonical chain as
/// big-endian height to hash, and the tip as a JSON record in `meta`. Every
/// mutation is one write batch that includes the tip record, synced to disk
/// before the in-memory tip moves.
pub struct FjallBlockRepository {
    database: Database,
    blocks: Keyspace,
    hashes_by_height: Keyspace,
    meta: Keyspace,
    tip: RwLock<ChainPosition>,
    write_lock: Mutex<()>,
}

impl FjallBlockRepository {
    /// Open or create the database at `path`. An empty database is seeded
    /// with `genesis`.
    pub fn open(path: impl AsRef<Path>, genesis: &Block, clear_on_start: bool) -> Result<Self> {
        let path = path.as_ref();
        if clear_on_start && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let blocks = database.keyspace(BLOCKS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let hashes_by_height =
            database.keyspace(HASHES_BY_HEIGHT_KEYSPACE, KeyspaceCreateOptions::default)?;
        let meta = database.keyspace(META_KEYSPACE, KeyspaceCreateOptions::default)?;

        let stored_tip = match meta.get(TIP_KEY)? {
            Some(bytes) => Some(serde_json::from_slice::<ChainPosition>(&bytes)?),
            None => None,
        };

        let repository = Self {
            database,
            blocks,
            hashes_by_height,
            meta,
            tip: RwLock::new(genesis.position()),
            write_lock: Mutex::new(()),
        };

        match stored_tip {
            Some(tip) => {
                if repository.hash_at(Height::GENESIS)? != Some(genesis.hash()) {
                    return Err(StoreError::RepositoryIo(format!(
                        "database at {} holds a different genesis",
                        path.display()
                    )));
                }
                info!(tip = tip.height.0, path = %path.display(), "Opened block repository");
                *repository.tip.write() = tip;
            }
            None => {
                repository.write_genesis(genesis)?;
                info!(path = %path.display(), "Created block repository");
            }
        }
        Ok(repository)
    }

    fn write_genesis(&self, genesis: &Block) -> Result<()> {
        let position = genesis.position();
        let mut batch = self.database.batch();
        batch.insert(&self.blocks, position.hash.0, serde_json::to_vec(genesis)?);
        batch.insert(
            &self.hashes_by_height,
            position.height.to_be_bytes(),
            position.hash.0,
        );
        batch.insert(&self.meta, TIP_KEY, serde_json::to_vec(&position)?);
        batch.commit()?;
        self.database.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn read_hash(&self, height: Height) -> Result<Option<Bytes32>> {
        let Some(bytes) = self.hashes_by_height.get(height.to_be_bytes())? else {
            return Ok(None);
        };
        let hash: [u8; 32] = bytes.as_ref().try_into().map_err(|_| {
            StoreError::RepositoryIo(format!("corrupt hash index entry at height {height}"))
        })?;
        Ok(Some(Bytes32(hash)))
    }
}

impl BlockRepository for FjallBlockRepository {
    fn get(&self, hash: &Bytes32) -> Result<Option<Block>> {
        let Some(bytes) = self.blocks.get(hash.0)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn exists(&self, hash: &Bytes32) -> Result<bool> {
        Ok(self.blocks.get(hash.0)?.is_some())
    }

    fn hash_at(&self, height: Height) -> Result<Option<Bytes32>> {
        // Entries above the tip only exist between a commit and the tip
        // update below it; never report them.
        if height > self.tip().height {
            return Ok(None);
        }
        self.read_hash(height)
    }

    fn tip(&self) -> ChainPosition {
        *self.tip.read()
    }

    fn put_batch(&self, batch: &[PendingBlock]) -> Result<ChainPosition> {
        let _guard = self.write_lock.lock();
        let tip = self.tip();
        let rest = match plan_batch(&tip, batch, |height| self.read_hash(height))? {
            BatchPlan::AlreadyStored => return Ok(tip),
            BatchPlan::Append(rest) => rest,
        };

        let new_tip = rest[rest.len() - 1].position;
        let mut write = self.database.batch();
        for pending in rest {
            write.insert(&self.blocks, pending.hash().0, serde_json::to_vec(&pending.block)?);
            write.insert(
                &self.hashes_by_height,
                pending.height().to_be_bytes(),
                pending.hash().0,
            );
        }
        write.insert(&self.meta, TIP_KEY, serde_json::to_vec(&new_tip)?);
        write.commit()?;
        self.database.persist(PersistMode::SyncAll)?;

        *self.tip.write() = new_tip;
        debug!(tip = new_tip.height.0, blocks = rest.len(), "Appended batch");
        Ok(new_tip)
    }

    fn set_tip(&self, target: ChainPosition) -> Result<()> {
        let _guard = self.write_lock.lock();
        let tip = self.tip();
        check_rewind_target(&tip, &target, |height| self.read_hash(height))?;
        if target == tip {
            return Ok(());
        }

        let mut write = self.database.batch();
        let mut height = target.height.next();
        while height <= tip.height {
            if let Some(hash) = self.read_hash(height)? {
                write.remove(&self.blocks, hash.0);
            }
            write.remove(&self.hashes_by_height, height.to_be_bytes());
            height = height.next();
        }
        write.insert(&self.meta, TIP_KEY, serde_json::to_vec(&target)?);
        write.commit()?;
        self.database.persist(PersistMode::SyncAll)?;

        *self.tip.write() = target;
        debug!(
            tip = target.height.0,
            removed = tip.height.distance_from(target.height),
            "Rewound tip"
        );
        Ok(())
    }
}
