use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use podtrack_contracts::canonical;
use podtrack_contracts::{Actor, Identity, NewPod, Page, Pod, Transaction};
use podtrack_ledger::AuditRecord;
use podtrack_policy::SearchPlan;
use podtrack_policy::facet::{self, FacetPlan};
use podtrack_policy::pagination;
use tokio::sync::RwLock;
use ulid::Ulid;

use super::mutation::{self, PlannedWrite, PodChange};
use super::{Mutated, StoreError, audit_error};

/// In-process backend. Each mutation holds the write lock from the audit
/// append through the entity write, which gives the same all-or-nothing
/// outcome as a database transaction.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    pods: BTreeMap<String, Pod>,
    identities: Vec<Identity>,
    transactions: Vec<Transaction>,
    fail_audit_writes: bool,
}

impl MemoryState {
    fn identity(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|identity| identity.id == id)
    }

    fn append_audit(&mut self, record: &AuditRecord<'_>) -> Result<Transaction, StoreError> {
        record.validate().map_err(audit_error)?;
        if self.fail_audit_writes {
            return Err(StoreError::AuditWriteFailed(
                "audit writes are disabled".to_string(),
            ));
        }

        let written = Transaction {
            id: Ulid::new().to_string(),
            entity_type: record.entity_type.to_string(),
            entity_id: record.entity_id.to_string(),
            action: record.action.to_string(),
            details: record.details.clone(),
            details_hash: canonical::hash_canonical_json(record.details),
            created_by_id: record.actor_id.to_string(),
            created_at: Utc::now(),
        };
        self.transactions.push(written.clone());
        Ok(written)
    }

    fn check_engineer(&self, pod: &Pod) -> Result<(), StoreError> {
        match pod.engineer_id.as_deref() {
            Some(id) if self.identity(id).is_none() => Err(StoreError::InvalidPayload(
                "unknown identity reference".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn check_creator(&self, pod: &Pod) -> Result<(), StoreError> {
        if self.identity(&pod.created_by_id).is_none() {
            return Err(StoreError::InvalidPayload(
                "unknown identity reference".to_string(),
            ));
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a fixture identity without an audit record.
    pub async fn insert_identity(&self, identity: Identity) {
        let mut state = self.inner.write().await;
        state.identities.retain(|existing| existing.id != identity.id);
        state.identities.push(identity);
    }

    /// Loads a fixture pod without an audit record.
    pub async fn insert_pod(&self, pod: Pod) {
        let mut state = self.inner.write().await;
        state.pods.insert(pod.code.clone(), pod);
    }

    /// Fault injection: while set, every audit append fails.
    pub async fn fail_audit_writes(&self, fail: bool) {
        self.inner.write().await.fail_audit_writes = fail;
    }

    pub(super) async fn search(&self, plan: &SearchPlan) -> Page<Pod> {
        let state = self.inner.read().await;
        let partition = plan.partition();

        let mut matched = state
            .pods
            .values()
            .filter(|pod| partition.admits(pod) && plan.predicate.matches(pod))
            .cloned()
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| pagination::compare(partition, a, b));

        let total_count = matched.len() as u64;
        let offset = usize::try_from(plan.page.offset()).unwrap_or(usize::MAX);
        let page_size = usize::try_from(plan.page.page_size()).unwrap_or(usize::MAX);
        let rows = matched
            .into_iter()
            .skip(offset)
            .take(page_size)
            .collect::<Vec<_>>();

        plan.page.into_page(rows, total_count)
    }

    pub(super) async fn facet_values(&self, plan: &FacetPlan) -> Vec<String> {
        let state = self.inner.read().await;
        let partition = plan.predicate.partition();

        facet::normalize_values(
            state
                .pods
                .values()
                .filter(|pod| partition.admits(pod) && plan.predicate.matches(pod))
                .map(|pod| plan.field.text_value(pod)),
        )
    }

    pub(super) async fn pod(&self, code: &str) -> Option<Pod> {
        self.inner.read().await.pods.get(code).cloned()
    }

    pub(super) async fn identities(&self) -> Vec<Identity> {
        self.inner.read().await.identities.clone()
    }

    pub(super) async fn create_pod(
        &self,
        actor: &Actor,
        new_pod: NewPod,
    ) -> Result<Mutated<Pod>, StoreError> {
        let planned = mutation::plan_create(actor, new_pod, Utc::now())?;

        let mut state = self.inner.write().await;
        if state.pods.contains_key(&planned.next.code) {
            return Err(StoreError::InvalidPayload(format!(
                "pod {} already exists",
                planned.next.code
            )));
        }
        state.check_creator(&planned.next)?;
        state.check_engineer(&planned.next)?;

        let audit = state.append_audit(&planned.audit_record(actor))?;
        let PlannedWrite { next, .. } = planned;
        state.pods.insert(next.code.clone(), next.clone());

        Ok(Mutated {
            entity: next,
            audit,
        })
    }

    pub(super) async fn change_pod(
        &self,
        actor: &Actor,
        code: &str,
        change: &PodChange,
    ) -> Result<Mutated<Pod>, StoreError> {
        let mut state = self.inner.write().await;
        let current = state.pods.get(code).cloned();
        let planned = mutation::plan_change(actor, code, current, change, Utc::now())?;
        state.check_engineer(&planned.next)?;

        let audit = state.append_audit(&planned.audit_record(actor))?;
        let PlannedWrite { next, .. } = planned;
        state.pods.insert(next.code.clone(), next.clone());

        Ok(Mutated {
            entity: next,
            audit,
        })
    }

    pub(super) async fn merge_identity(
        &self,
        actor: &Actor,
        source_id: &str,
        target_id: &str,
    ) -> Result<Mutated<Identity>, StoreError> {
        let mut state = self.inner.write().await;
        let source = state.identity(source_id).cloned();
        let target = state.identity(target_id).cloned();
        let planned = mutation::plan_merge(source_id, target_id, source, target)?;

        let audit = state.append_audit(&planned.audit_record(actor))?;
        let PlannedWrite { next, .. } = planned;
        if let Some(slot) = state
            .identities
            .iter_mut()
            .find(|identity| identity.id == next.id)
        {
            *slot = next.clone();
        }

        Ok(Mutated {
            entity: next,
            audit,
        })
    }

    pub(super) async fn record_audit(
        &self,
        record: AuditRecord<'_>,
    ) -> Result<Transaction, StoreError> {
        self.inner.write().await.append_audit(&record)
    }

    pub(super) async fn audit_trail(&self, entity_type: &str, entity_id: &str) -> Vec<Transaction> {
        self.inner
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.entity_type == entity_type && tx.entity_id == entity_id)
            .cloned()
            .collect()
    }
}
