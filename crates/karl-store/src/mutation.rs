//! Persisted mutation records: what one committed transaction appends to the
//! store's backing log.

use serde::{Deserialize, Serialize};

use karl_core::{ClaireBuildInfo, ClaireInfo, KarlInfo, ServerInfo};

use crate::tables::Tables;

/// One table upsert inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreMutation {
    /// `claires` upsert.
    ClaireUpdated(ClaireInfo),
    /// `builds` upsert.
    BuildUpdated(ClaireBuildInfo),
    /// `servers` upsert.
    ServerUpdated(ServerInfo),
    /// `karl` launch-history append.
    KarlRecorded(KarlInfo),
}

impl StoreMutation {
    /// Applies this mutation to a set of tables (used by replay and commit).
    pub fn apply(&self, tables: &mut Tables) {
        match self {
            Self::ClaireUpdated(row) => tables.claires.add(row.clone()),
            Self::BuildUpdated(row) => tables.builds.add(row.clone()),
            Self::ServerUpdated(row) => tables.servers.add(row.clone()),
            Self::KarlRecorded(row) => tables.karl.add(row.clone()),
        }
    }
}

impl From<ClaireInfo> for StoreMutation {
    fn from(row: ClaireInfo) -> Self {
        Self::ClaireUpdated(row)
    }
}

impl From<ClaireBuildInfo> for StoreMutation {
    fn from(row: ClaireBuildInfo) -> Self {
        Self::BuildUpdated(row)
    }
}

impl From<ServerInfo> for StoreMutation {
    fn from(row: ServerInfo) -> Self {
        Self::ServerUpdated(row)
    }
}

impl From<KarlInfo> for StoreMutation {
    fn from(row: KarlInfo) -> Self {
        Self::KarlRecorded(row)
    }
}

/// One committed transaction: the unit of atomicity on the backing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreTransaction {
    /// The upserts, in execution order.
    pub mutations: Vec<StoreMutation>,
}
