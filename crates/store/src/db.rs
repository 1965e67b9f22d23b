//! Database handle, transactions and the merge worker.
//!
//! The current state of the database is an immutable [`DbState`] behind an
//! [`ArcSwap`]. Readers load it once and keep it for the life of their
//! transaction. Update transactions build private deltas against the state
//! they started from and hand them to a single merge worker thread, which is
//! the only code that ever publishes a new state.
//!
//! ```text
//!   UpdateTran ─┐  commit (blocking handoff)
//!   UpdateTran ─┼──────────────────────────────► merge worker ──► ArcSwap<DbState>
//!   UpdateTran ─┘                                  │    ▲              │
//!                                   tick / persist │    │              │ load
//!                                                  ▼    │              ▼
//!                              trees + packed tables + checkpoint   ReadTran
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fbdb_store::{Database, DatabaseConfig, IndexSchema, Schema};
//!
//! let db = Database::create("data.fbdb", DatabaseConfig::default())?;
//!
//! let mut tran = db.update();
//! tran.create_table(Schema::builder().table("t").indexes(vec![IndexSchema::key([0])]).build())?;
//! tran.output("t", b"hello")?;
//! tran.commit()?;
//!
//! let tran = db.read();
//! assert_eq!(tran.info("t")?.map(|i| i.nrows), Some(1));
//! # Ok::<(), fbdb_store::Error>(())
//! ```

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use parking_lot::Mutex;

use crate::{
    checkpoint::Checkpoint,
    error::{Error, Result},
    fbtree::{KeyExtractor, RecordKey, TreeConfig, TreeContext},
    integrity::{CheckReport, IntegrityChecker},
    meta::{Info, Meta, MetaDelta, Schema},
    overlay::Overlay,
    store::{Offset, Store},
};

/// Database configuration options.
#[derive(Debug, Clone, bon::Builder)]
pub struct DatabaseConfig {
    /// How often the merge worker persists committed changes.
    #[builder(default = Duration::from_secs(1))]
    pub checkpoint_interval: Duration,
    /// Whether to sync the store after writing each checkpoint.
    #[builder(default = true)]
    pub sync_on_checkpoint: bool,
    /// Index tree limits.
    #[builder(default)]
    pub tree: TreeConfig,
    /// Index key extraction.
    #[builder(default = Arc::new(RecordKey) as Arc<dyn KeyExtractor>)]
    pub keys: Arc<dyn KeyExtractor>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(1),
            sync_on_checkpoint: true,
            tree: TreeConfig::default(),
            keys: Arc::new(RecordKey),
        }
    }
}

impl DatabaseConfig {
    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero checkpoint interval or invalid
    /// tree limits.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval.is_zero() {
            return Err(Error::Config { message: "checkpoint_interval must be nonzero".into() });
        }
        self.tree.validate()
    }
}

/// An immutable snapshot of the whole database.
#[derive(Debug, Clone)]
pub struct DbState {
    /// Schemas and table info.
    pub meta: Meta,
    /// Offset of the checkpoint this state was last persisted under.
    pub checkpoint: Offset,
}

enum MergeRequest {
    Commit { num: u64, delta: MetaDelta, reply: Sender<Result<()>> },
    Persist { reply: Sender<Result<Offset>> },
}

/// Sole publisher of [`DbState`].
struct MergeWorker {
    state: Arc<ArcSwap<DbState>>,
    store: Arc<Store>,
    rx: Receiver<MergeRequest>,
    interval: Duration,
    sync: bool,
}

impl MergeWorker {
    fn run(self) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok(MergeRequest::Commit { num, delta, reply }) => {
                        let _ = reply.send(self.merge(num, &delta));
                    },
                    Ok(MergeRequest::Persist { reply }) => {
                        let _ = reply.send(self.persist());
                    },
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if self.state.load().meta.is_dirty() {
                        if let Err(e) = self.persist() {
                            tracing::error!(error = %e, "Background persist failed");
                        }
                    }
                },
            }
        }
        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "Final persist failed");
        }
    }

    fn merge(&self, num: u64, delta: &MetaDelta) -> Result<()> {
        let cur = self.state.load_full();
        let meta = cur.meta.apply(delta)?;
        self.state.store(Arc::new(DbState { meta, checkpoint: cur.checkpoint }));
        tracing::trace!(
            tran = num,
            created = delta.schemas.len(),
            tables = delta.infos.len(),
            "Merged transaction"
        );
        Ok(())
    }

    fn persist(&self) -> Result<Offset> {
        let cur = self.state.load_full();
        if !cur.meta.is_dirty() {
            return Ok(cur.checkpoint);
        }
        let start = self.store.size();
        let meta = cur.meta.persist()?;
        let cp = Checkpoint::write(
            &self.store,
            cur.checkpoint,
            meta.schema_offset(),
            meta.info_offset(),
        )?;
        if self.sync {
            self.store.sync()?;
        }
        self.state.store(Arc::new(DbState { meta, checkpoint: cp.offset }));
        tracing::debug!(
            checkpoint = cp.offset,
            bytes = self.store.size() - start,
            "Checkpoint written"
        );
        Ok(cp.offset)
    }
}

/// The main database handle.
///
/// Thread-safe: share it by reference or in an [`Arc`]. Any number of read
/// and update transactions may run at once; commits are serialized by the
/// merge worker.
pub struct Database {
    state: Arc<ArcSwap<DbState>>,
    ctx: TreeContext,
    /// Taken on close, which disconnects the worker.
    commit_tx: Mutex<Option<Sender<MergeRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    tran_seq: AtomicU64,
    config: DatabaseConfig,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("checkpoint", &self.state.load().checkpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a new database file, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration or
    /// [`Error::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let store = Arc::new(Store::create_file(path)?);
        let db = Self::init(store, config)?;
        tracing::info!(path = %path.display(), "Created database");
        Ok(db)
    }

    /// Opens an existing database file, recovering the state of its last
    /// valid checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened,
    /// [`Error::InvalidMagic`] if it is not a database, or a corruption error
    /// if no usable checkpoint is found.
    pub fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let store = Arc::new(Store::open_file(path)?);
        let cp = Checkpoint::find_last(&store)?.ok_or_else(|| Error::Corrupted {
            reason: format!("no valid checkpoint in {}", path.display()),
        })?;
        let ctx = TreeContext::new(store, config.keys.clone(), config.tree);
        let meta = Meta::open(ctx.clone(), cp.schema_off, cp.info_off)?;
        tracing::info!(
            path = %path.display(),
            checkpoint = cp.offset,
            size = ctx.store.size(),
            "Recovered database state"
        );
        Self::start(ctx, meta, cp.offset, config)
    }

    /// Creates a heap-backed database. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn open_in_memory(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        Self::init(Arc::new(Store::in_memory()), config)
    }

    /// Writes empty metadata and a first checkpoint.
    fn init(store: Arc<Store>, config: DatabaseConfig) -> Result<Self> {
        let ctx = TreeContext::new(store, config.keys.clone(), config.tree);
        let meta = Meta::create(ctx.clone())?;
        let cp = Checkpoint::write(&ctx.store, 0, meta.schema_offset(), meta.info_offset())?;
        if config.sync_on_checkpoint {
            ctx.store.sync()?;
        }
        Self::start(ctx, meta, cp.offset, config)
    }

    fn start(
        ctx: TreeContext,
        meta: Meta,
        checkpoint: Offset,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let state = Arc::new(ArcSwap::from_pointee(DbState { meta, checkpoint }));
        let (tx, rx) = bounded(0);
        let worker = MergeWorker {
            state: Arc::clone(&state),
            store: Arc::clone(&ctx.store),
            rx,
            interval: config.checkpoint_interval,
            sync: config.sync_on_checkpoint,
        };
        let handle = thread::Builder::new().name("fbdb-merge".into()).spawn(move || worker.run())?;
        Ok(Self {
            state,
            ctx,
            commit_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            tran_seq: AtomicU64::new(0),
            config,
        })
    }

    /// The configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.ctx.store
    }

    /// The currently published state.
    pub fn state(&self) -> Arc<DbState> {
        self.state.load_full()
    }

    fn next_num(&self) -> u64 {
        self.tran_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sender(&self) -> Result<Sender<MergeRequest>> {
        self.commit_tx.lock().clone().ok_or(Error::Closed)
    }

    /// Starts a read transaction on the current state.
    pub fn read(&self) -> ReadTran {
        ReadTran { num: self.next_num(), state: self.state() }
    }

    /// Starts an update transaction on the current state.
    pub fn update(&self) -> UpdateTran<'_> {
        UpdateTran {
            db: self,
            num: self.next_num(),
            state: self.state(),
            created: Vec::new(),
            infos: BTreeMap::new(),
            done: false,
        }
    }

    /// Persists committed changes now and returns the checkpoint offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close), or the error
    /// from writing trees, tables or the checkpoint.
    pub fn persist(&self) -> Result<Offset> {
        let (reply, rx) = bounded(1);
        self.sender()?.send(MergeRequest::Persist { reply }).map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Persists outstanding changes and stops the merge worker. Further
    /// commits fail with [`Error::Closed`]; reads keep working.
    ///
    /// # Errors
    ///
    /// Returns the error from the final persist. The worker is stopped
    /// either way.
    pub fn close(&self) -> Result<()> {
        let result = match self.persist() {
            Err(Error::Closed) => Ok(()),
            other => other.map(|_| ()),
        };
        drop(self.commit_tx.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Merge worker panicked");
            }
        }
        result
    }

    /// Verifies every index of every table.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a tree is structurally damaged.
    pub fn check(&self) -> Result<CheckReport> {
        IntegrityChecker::new(self).check_all()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Failed to persist on close");
        }
    }
}

fn index_of<'a>(info: &'a Info, index: usize) -> Result<&'a Overlay> {
    info.indexes
        .get(index)
        .ok_or_else(|| Error::IndexNotFound { table: info.table.clone(), index })
}

/// A read-only snapshot. Later commits are invisible to it.
#[derive(Debug, Clone)]
pub struct ReadTran {
    num: u64,
    state: Arc<DbState>,
}

impl ReadTran {
    /// Transaction number.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Table info as of the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be decoded.
    pub fn info(&self, table: &str) -> Result<Option<Info>> {
        self.state.meta.get_ro_info(table)
    }

    /// Table schema as of the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be decoded.
    pub fn schema(&self, table: &str) -> Result<Option<Schema>> {
        self.state.meta.get_ro_schema(table)
    }

    /// All table names, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be decoded.
    pub fn tables(&self) -> Result<Vec<String>> {
        self.state.meta.tables()
    }

    fn require(&self, table: &str) -> Result<Info> {
        self.info(table)?.ok_or_else(|| Error::TableNotFound { table: table.to_string() })
    }

    /// One index of a table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] or [`Error::IndexNotFound`].
    pub fn index(&self, table: &str, index: usize) -> Result<Overlay> {
        index_of(&self.require(table)?, index).cloned()
    }

    /// Looks up a full key in an index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`], [`Error::IndexNotFound`], or an error
    /// reading the tree.
    pub fn search(&self, table: &str, index: usize, key: &[u8]) -> Result<Option<Offset>> {
        self.index(table, index)?.search(key)
    }

    /// Every `(key, record offset)` of an index, in key order.
    ///
    /// # Errors
    ///
    /// As for [`search`](Self::search).
    pub fn iter(&self, table: &str, index: usize) -> Result<Vec<(Vec<u8>, Offset)>> {
        self.index(table, index)?.iter().collect()
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the store read fails.
    pub fn record(&self, off: Offset) -> Result<Vec<u8>> {
        self.state.meta.context().store.read_sized(off)
    }
}

/// An update transaction.
///
/// Changes are private until [`commit`](Self::commit). Dropping the
/// transaction without committing aborts it.
pub struct UpdateTran<'db> {
    db: &'db Database,
    num: u64,
    state: Arc<DbState>,
    created: Vec<Schema>,
    /// Per-table deltas, created on first touch.
    infos: BTreeMap<String, Info>,
    done: bool,
}

impl std::fmt::Debug for UpdateTran<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTran")
            .field("num", &self.num)
            .field("created", &self.created.len())
            .field("touched", &self.infos.len())
            .finish_non_exhaustive()
    }
}

impl UpdateTran<'_> {
    /// Transaction number.
    pub fn num(&self) -> u64 {
        self.num
    }

    /// Creates a table, visible to this transaction at once and to others
    /// after commit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableExists`] if the name is taken.
    pub fn create_table(&mut self, schema: Schema) -> Result<()> {
        let taken = self.created.iter().any(|s| s.table == schema.table)
            || self.state.meta.get_ro_schema(&schema.table)?.is_some();
        if taken {
            return Err(Error::TableExists { table: schema.table });
        }
        self.created.push(schema);
        Ok(())
    }

    /// The delta for `table`: zeroed counters and private index layers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`] if the table does not exist.
    pub fn info_mut(&mut self, table: &str) -> Result<&mut Info> {
        if !self.infos.contains_key(table) {
            let base = match self.created.iter().find(|s| s.table == table) {
                Some(schema) => Info::create(table, &self.db.ctx, schema.ixspecs()),
                None => self
                    .state
                    .meta
                    .get_ro_info(table)?
                    .ok_or_else(|| Error::TableNotFound { table: table.to_string() })?,
            };
            self.infos.insert(table.to_string(), base.delta());
        }
        self.infos
            .get_mut(table)
            .ok_or_else(|| Error::TableNotFound { table: table.to_string() })
    }

    /// Stores a record and adds it to every index of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`], a store error, or a key extraction
    /// error.
    pub fn output(&mut self, table: &str, record: &[u8]) -> Result<Offset> {
        let store = Arc::clone(&self.db.ctx.store);
        let info = self.info_mut(table)?;
        let off = store.save_sized(record)?;
        info.nrows += 1;
        info.size += record.len() as u64;
        for ov in &mut info.indexes {
            let key = ov.leaf_key(off)?;
            ov.insert(key, off);
        }
        Ok(off)
    }

    /// Looks up a full key, seeing this transaction's own outputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TableNotFound`], [`Error::IndexNotFound`], or an error
    /// reading the tree.
    pub fn search(&mut self, table: &str, index: usize, key: &[u8]) -> Result<Option<Offset>> {
        let info = self.info_mut(table)?;
        index_of(info, index)?.search(key)
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the store read fails.
    pub fn record(&self, off: Offset) -> Result<Vec<u8>> {
        self.db.ctx.store.read_sized(off)
    }

    /// Hands the transaction's changes to the merge worker and waits until
    /// they are published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the database is closed, or the merge
    /// error, such as [`Error::TableExists`] when another transaction created
    /// the same table first.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        let delta = MetaDelta {
            schemas: std::mem::take(&mut self.created),
            infos: std::mem::take(&mut self.infos).into_values().collect(),
        };
        if delta.is_empty() {
            return Ok(());
        }
        let (reply, rx) = bounded(1);
        self.db
            .sender()?
            .send(MergeRequest::Commit { num: self.num, delta, reply })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Discards the transaction's changes. Records already written to the
    /// store stay there, unreferenced.
    pub fn abort(mut self) {
        self.done = true;
        tracing::trace!(tran = self.num, "Aborted transaction");
    }
}

impl Drop for UpdateTran<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::trace!(tran = self.num, "Dropped uncommitted transaction");
        }
    }
}
