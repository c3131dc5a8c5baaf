//! Persistence for pods, identities and the audit trail.
//!
//! Two backends execute the same plans: Postgres for deployments and an
//! in-process store for local runs and tests. Every mutation appends its
//! audit row first and applies the change in the same unit of work, so a
//! failed audit write leaves no trace of the change.

use podtrack_contracts::{Actor, Identity, NewPod, Page, Pod, Transaction};
use podtrack_ledger::AuditRecord;
use podtrack_policy::SearchPlan;
use podtrack_policy::facet::FacetPlan;

mod memory;
mod mutation;
mod pg;

pub use self::memory::MemoryStore;
pub use self::mutation::PodChange;
pub use self::pg::PgStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    InvalidPayload(String),
    AuditWriteFailed(String),
    Timeout,
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::InvalidPayload(reason) => write!(f, "invalid payload: {}", reason),
            StoreError::AuditWriteFailed(reason) => write!(f, "audit write failed: {}", reason),
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Backend(reason) => write!(f, "store backend error: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// The entity as committed plus the audit row that preceded it.
#[derive(Debug, Clone)]
pub struct Mutated<T> {
    pub entity: T,
    pub audit: Transaction,
}

#[derive(Clone)]
pub enum Store {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl Store {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Postgres(_) => "postgres",
            Store::Memory(_) => "memory",
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Store::Postgres(store) => store.ping().await,
            Store::Memory(_) => Ok(()),
        }
    }

    pub async fn search(&self, plan: &SearchPlan) -> Result<Page<Pod>, StoreError> {
        match self {
            Store::Postgres(store) => store.search(plan).await,
            Store::Memory(store) => Ok(store.search(plan).await),
        }
    }

    pub async fn facet_values(&self, plan: &FacetPlan) -> Result<Vec<String>, StoreError> {
        match self {
            Store::Postgres(store) => store.facet_values(plan).await,
            Store::Memory(store) => Ok(store.facet_values(plan).await),
        }
    }

    /// The stored row for `code`, deleted or not, with no role filtering.
    pub async fn pod(&self, code: &str) -> Result<Option<Pod>, StoreError> {
        match self {
            Store::Postgres(store) => store.pod(code).await,
            Store::Memory(store) => Ok(store.pod(code).await),
        }
    }

    /// Every identity, tombstones included, in creation order.
    pub async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        match self {
            Store::Postgres(store) => store.identities().await,
            Store::Memory(store) => Ok(store.identities().await),
        }
    }

    pub async fn create_pod(
        &self,
        actor: &Actor,
        new_pod: NewPod,
    ) -> Result<Mutated<Pod>, StoreError> {
        match self {
            Store::Postgres(store) => store.create_pod(actor, new_pod).await,
            Store::Memory(store) => store.create_pod(actor, new_pod).await,
        }
    }

    pub async fn change_pod(
        &self,
        actor: &Actor,
        code: &str,
        change: &PodChange,
    ) -> Result<Mutated<Pod>, StoreError> {
        match self {
            Store::Postgres(store) => store.change_pod(actor, code, change).await,
            Store::Memory(store) => store.change_pod(actor, code, change).await,
        }
    }

    pub async fn merge_identity(
        &self,
        actor: &Actor,
        source_id: &str,
        target_id: &str,
    ) -> Result<Mutated<Identity>, StoreError> {
        match self {
            Store::Postgres(store) => store.merge_identity(actor, source_id, target_id).await,
            Store::Memory(store) => store.merge_identity(actor, source_id, target_id).await,
        }
    }

    pub async fn record_audit(&self, record: AuditRecord<'_>) -> Result<Transaction, StoreError> {
        match self {
            Store::Postgres(store) => store.record_audit(record).await,
            Store::Memory(store) => store.record_audit(record).await,
        }
    }

    pub async fn audit_trail(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<Transaction>, StoreError> {
        match self {
            Store::Postgres(store) => store.audit_trail(entity_type, entity_id).await,
            Store::Memory(store) => Ok(store.audit_trail(entity_type, entity_id).await),
        }
    }
}

fn audit_error(err: podtrack_ledger::LedgerError) -> StoreError {
    match err {
        podtrack_ledger::LedgerError::InvalidRecord(reason) => {
            StoreError::InvalidPayload(reason.to_string())
        }
        other => StoreError::AuditWriteFailed(other.to_string()),
    }
}
