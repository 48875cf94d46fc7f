//! The store proper: snapshot reads, linearized commits, replay on open.

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use karl_core::Clock;
use karl_stream::Stream;

use crate::error::Result;
use crate::mutation::{StoreMutation, StoreTransaction};
use crate::tables::{Row, Table, Tables};

/// The transactional keyed store.
///
/// Cheap to clone; clones share the tables and the backing log. Writers are
/// serialized by the table write lock, and each commit lands on the log as a
/// single [`StoreTransaction`] entry, so the on-disk order equals the commit
/// order and replay reconstructs the exact table state.
#[derive(Clone)]
pub struct ServiceStorage {
    tables: Arc<RwLock<Tables>>,
    log: Stream<StoreTransaction>,
}

impl std::fmt::Debug for ServiceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStorage")
            .field("log_size", &self.log.size())
            .finish()
    }
}

impl ServiceStorage {
    /// Opens (or creates) a durable store at `path`, replaying the mutation log.
    ///
    /// # Errors
    ///
    /// Fails when the backing file cannot be opened or fails replay validation.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let log: Stream<StoreTransaction> = Stream::open_file(path, clock)?;
        let mut tables = Tables::default();
        for persisted in log.iter_all() {
            for mutation in &persisted.entry.mutations {
                mutation.apply(&mut tables);
            }
        }
        tracing::debug!(
            transactions = log.size(),
            claires = tables.claires.len(),
            "store replayed"
        );
        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            log,
        })
    }

    /// Creates an in-memory store (tests, debug runs).
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            log: Stream::in_memory(clock),
        }
    }

    /// Runs `f` against an immutable snapshot of every table.
    ///
    /// Concurrent read-only transactions run in parallel; a transaction never
    /// observes a half-committed write.
    pub async fn read_only<F, Out>(&self, f: F) -> Out
    where
        F: FnOnce(&Tables) -> Out + Send,
        Out: Send,
    {
        let tables = self.read_tables();
        f(&tables)
    }

    /// Runs `f` against mutable table handles; the writes either all commit or
    /// all abort.
    ///
    /// `f` operates on a working copy and sees its own writes. When it returns
    /// `Ok`, the recorded mutations are appended to the backing log as one
    /// transaction and the copy is swapped in; on `Err` (or a log failure)
    /// nothing is published and nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or a log error if the commit could not be appended.
    pub async fn read_write<F, Out>(&self, f: F) -> Result<Out>
    where
        F: FnOnce(&mut TransactionFields<'_>) -> Result<Out> + Send,
        Out: Send,
    {
        let mut tables = self.write_tables();
        let mut working = tables.clone();
        let mut journal = Vec::new();
        let out = f(&mut TransactionFields {
            tables: &mut working,
            journal: &mut journal,
        })?;
        if !journal.is_empty() {
            self.log.publish(&StoreTransaction { mutations: journal })?;
        }
        *tables = working;
        Ok(out)
    }

    /// Returns the number of transactions committed to the backing log.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.log.size()
    }

    /// Begins teardown of the backing log; subsequent commits that carry
    /// mutations will fail.
    pub fn shutdown(&self) {
        self.log.shutdown();
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Mutable view of the tables inside a read-write transaction.
pub struct TransactionFields<'a> {
    tables: &'a mut Tables,
    journal: &'a mut Vec<StoreMutation>,
}

impl TransactionFields<'_> {
    /// Write handle on the `claires` table.
    pub fn claires(&mut self) -> WriteHandle<'_, karl_core::ClaireInfo> {
        WriteHandle {
            table: &mut self.tables.claires,
            journal: &mut *self.journal,
        }
    }

    /// Write handle on the `builds` table.
    pub fn builds(&mut self) -> WriteHandle<'_, karl_core::ClaireBuildInfo> {
        WriteHandle {
            table: &mut self.tables.builds,
            journal: &mut *self.journal,
        }
    }

    /// Write handle on the `servers` table.
    pub fn servers(&mut self) -> WriteHandle<'_, karl_core::ServerInfo> {
        WriteHandle {
            table: &mut self.tables.servers,
            journal: &mut *self.journal,
        }
    }

    /// Write handle on the `karl` launch-history table.
    pub fn karl(&mut self) -> WriteHandle<'_, karl_core::KarlInfo> {
        WriteHandle {
            table: &mut self.tables.karl,
            journal: &mut *self.journal,
        }
    }
}

/// Write handle on one table: upserts are applied to the transaction's working
/// copy immediately (read-your-writes) and journaled for the commit record.
pub struct WriteHandle<'a, R>
where
    R: Row + Into<StoreMutation>,
{
    table: &'a mut Table<R>,
    journal: &'a mut Vec<StoreMutation>,
}

impl<R> WriteHandle<'_, R>
where
    R: Row + Into<StoreMutation>,
{
    /// Inserts or replaces the row with the same primary key.
    pub fn add(&mut self, row: R) {
        self.journal.push(row.clone().into());
        self.table.add(row);
    }

    /// Looks up a row by primary key, seeing this transaction's own writes.
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.table.get(key)
    }

    /// Iterates rows in primary-key order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.table.iter()
    }
}
