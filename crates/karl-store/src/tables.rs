//! The store's tables: keyed, upsert-only maps iterated in primary-key order.

use std::collections::BTreeMap;

use karl_core::{ClaireBuildInfo, ClaireInfo, KarlInfo, MicroTimestamp, ServerInfo};

/// A row type with a primary key.
pub trait Row: Clone {
    /// The primary-key type.
    type Key: Ord + Clone + std::fmt::Debug;

    /// Returns this row's primary key.
    fn key(&self) -> Self::Key;
}

impl Row for ClaireInfo {
    type Key = String;

    fn key(&self) -> String {
        self.codename.clone()
    }
}

impl Row for ClaireBuildInfo {
    type Key = String;

    fn key(&self) -> String {
        self.codename.clone()
    }
}

impl Row for ServerInfo {
    type Key = String;

    fn key(&self) -> String {
        self.ip.clone()
    }
}

impl Row for KarlInfo {
    type Key = MicroTimestamp;

    fn key(&self) -> MicroTimestamp {
        self.timestamp
    }
}

/// One keyed table: upsert by primary key, point lookup, in-order iteration.
#[derive(Debug, Clone)]
pub struct Table<R: Row> {
    rows: BTreeMap<R::Key, R>,
}

impl<R: Row> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<R: Row> Table<R> {
    /// Inserts or replaces the row with the same primary key.
    pub fn add(&mut self, row: R) {
        self.rows.insert(row.key(), row);
    }

    /// Looks up a row by primary key.
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    /// Iterates rows in primary-key order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<'a, R: Row> IntoIterator for &'a Table<R> {
    type Item = &'a R;
    type IntoIter = std::collections::btree_map::Values<'a, R::Key, R>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.values()
    }
}

/// Every table of the service directory.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    /// Directory rows, keyed by codename.
    pub claires: Table<ClaireInfo>,
    /// Last-seen builds, keyed by codename.
    pub builds: Table<ClaireBuildInfo>,
    /// Time-skew estimates, keyed by server IP.
    pub servers: Table<ServerInfo>,
    /// Karl's own launch history, keyed by record timestamp.
    pub karl: Table<KarlInfo>,
}
