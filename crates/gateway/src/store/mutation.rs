//! Backend-independent mutation rules. Each backend loads the current row,
//! asks for a plan, appends the plan's audit record and then writes
//! `next`.

use chrono::{DateTime, Utc};
use podtrack_contracts::{
    Actor, IDENTITY_ENTITY_TYPE, Identity, NewPod, POD_ENTITY_TYPE, Pod, PodPatch,
    resolve_priority,
};
use podtrack_ledger::AuditRecord;
use podtrack_policy::visibility;
use serde_json::Value;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodChange {
    Update(PodPatch),
    Complete,
    Delete,
}

impl PodChange {
    pub fn action(&self) -> &'static str {
        match self {
            PodChange::Update(_) => "UPDATE",
            PodChange::Complete => "COMPLETE",
            PodChange::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedWrite<T> {
    pub next: T,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub action: &'static str,
    pub details: Value,
}

impl<T> PlannedWrite<T> {
    pub fn audit_record<'a>(&'a self, actor: &'a Actor) -> AuditRecord<'a> {
        AuditRecord {
            entity_type: self.entity_type,
            entity_id: &self.entity_id,
            action: self.action,
            details: &self.details,
            actor_id: &actor.actor_id,
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value)
        .map_err(|err| StoreError::Backend(format!("failed to serialize audit details: {}", err)))
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Text fields of a patch get the same trimming as on create, so a blank
/// value clears the column.
fn normalized(patch: &PodPatch) -> PodPatch {
    PodPatch {
        title: patch.title.clone().map(trimmed),
        site: patch.site.clone().map(trimmed),
        region: patch.region.clone().map(trimmed),
        status: patch.status.clone().map(trimmed),
        category: patch.category.clone().map(trimmed),
        engineer_id: patch.engineer_id.clone().map(trimmed),
        ..patch.clone()
    }
}

pub(crate) fn plan_create(
    actor: &Actor,
    new_pod: NewPod,
    now: DateTime<Utc>,
) -> Result<PlannedWrite<Pod>, StoreError> {
    let code = new_pod.code.trim().to_string();
    if code.is_empty() {
        return Err(StoreError::InvalidPayload(
            "code must be non-empty".to_string(),
        ));
    }
    let priority = resolve_priority(new_pod.priority)
        .map_err(|reason| StoreError::InvalidPayload(reason.to_string()))?;
    if new_pod.quantity.is_some_and(|q| q < 0) {
        return Err(StoreError::InvalidPayload(
            "quantity must be non-negative".to_string(),
        ));
    }

    let pod = Pod {
        code: code.clone(),
        title: trimmed(new_pod.title),
        site: trimmed(new_pod.site),
        region: trimmed(new_pod.region),
        status: trimmed(new_pod.status),
        category: trimmed(new_pod.category),
        engineer_id: trimmed(new_pod.engineer_id),
        due_date: new_pod.due_date,
        quantity: new_pod.quantity,
        priority,
        is_history: false,
        is_deleted: false,
        should_display: visibility::should_display_for_new_pod(
            actor.role,
            new_pod.should_display,
        ),
        created_by_id: actor.actor_id.clone(),
        created_at: now,
        completed_at: None,
    };

    let snapshot = to_json(&pod)?;
    Ok(PlannedWrite {
        details: serde_json::json!({ "pod": snapshot }),
        next: pod,
        entity_type: POD_ENTITY_TYPE,
        entity_id: code,
        action: "CREATE",
    })
}

/// `current` is the stored row, if any. Rows the actor cannot see are
/// reported exactly like absent ones.
pub(crate) fn plan_change(
    actor: &Actor,
    code: &str,
    current: Option<Pod>,
    change: &PodChange,
    now: DateTime<Utc>,
) -> Result<PlannedWrite<Pod>, StoreError> {
    let current = current
        .filter(|pod| visibility::can_see(actor.role, pod))
        .ok_or_else(|| StoreError::NotFound(format!("pod {}", code)))?;

    let mut next = current.clone();
    let details = match change {
        PodChange::Update(patch) => {
            if patch.is_empty() {
                return Err(StoreError::InvalidPayload(
                    "patch must change at least one field".to_string(),
                ));
            }
            if let Some(Some(priority)) = patch.priority {
                resolve_priority(Some(priority))
                    .map_err(|reason| StoreError::InvalidPayload(reason.to_string()))?;
            }
            if let Some(Some(quantity)) = patch.quantity
                && quantity < 0
            {
                return Err(StoreError::InvalidPayload(
                    "quantity must be non-negative".to_string(),
                ));
            }
            normalized(patch).apply_to(&mut next);
            let changes = diff(&current, &next)?;
            serde_json::json!({ "changes": changes })
        }
        PodChange::Complete => {
            if current.is_history {
                return Err(StoreError::InvalidPayload(format!(
                    "pod {} is already completed",
                    code
                )));
            }
            next.is_history = true;
            next.completed_at = Some(now);
            serde_json::json!({ "completedAt": now })
        }
        PodChange::Delete => {
            next.is_deleted = true;
            let snapshot = to_json(&current)?;
            serde_json::json!({ "snapshot": snapshot })
        }
    };

    Ok(PlannedWrite {
        next,
        entity_type: POD_ENTITY_TYPE,
        entity_id: current.code,
        action: change.action(),
        details,
    })
}

/// Marks `source` as merged into `target`. The target must be live, so the
/// merge relation cannot form a cycle.
pub(crate) fn plan_merge(
    source_id: &str,
    target_id: &str,
    source: Option<Identity>,
    target: Option<Identity>,
) -> Result<PlannedWrite<Identity>, StoreError> {
    if source_id == target_id {
        return Err(StoreError::InvalidPayload(
            "an identity cannot be merged into itself".to_string(),
        ));
    }

    let source = source
        .filter(|identity| !identity.is_tombstoned())
        .ok_or_else(|| StoreError::NotFound(format!("identity {}", source_id)))?;
    let target = target.ok_or_else(|| StoreError::NotFound(format!("identity {}", target_id)))?;
    if target.is_tombstoned() {
        return Err(StoreError::InvalidPayload(format!(
            "identity {} is already merged",
            target_id
        )));
    }

    let mut next = source.clone();
    next.merged_into_user_id = Some(target.id.clone());

    let snapshot = to_json(&source)?;
    Ok(PlannedWrite {
        details: serde_json::json!({
            "mergedIntoUserId": target.id,
            "source": snapshot,
        }),
        next,
        entity_type: IDENTITY_ENTITY_TYPE,
        entity_id: source.id,
        action: "MERGE",
    })
}

/// `{field: {"from": .., "to": ..}}` for every wire field that changed.
fn diff(before: &Pod, after: &Pod) -> Result<Value, StoreError> {
    let before = to_json(before)?;
    let after = to_json(after)?;
    let mut changes = serde_json::Map::new();

    if let (Value::Object(before), Value::Object(after)) = (&before, &after) {
        for (key, new_value) in after {
            let old_value = before.get(key).unwrap_or(&Value::Null);
            if old_value != new_value {
                changes.insert(
                    key.clone(),
                    serde_json::json!({ "from": old_value, "to": new_value }),
                );
            }
        }
    }

    Ok(Value::Object(changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtrack_contracts::{NO_PRIORITY, Role};

    fn actor(role: Role) -> Actor {
        Actor {
            actor_id: "u1".to_string(),
            role,
        }
    }

    fn new_pod(code: &str) -> NewPod {
        serde_json::from_value(serde_json::json!({ "code": code, "title": " Fibre " }))
            .expect("new pod should parse")
    }

    fn existing(should_display: bool) -> Pod {
        let mut planned =
            plan_create(&actor(Role::SuperAdmin), new_pod("POD-1"), DateTime::<Utc>::UNIX_EPOCH)
                .expect("create should plan");
        planned.next.should_display = should_display;
        planned.next
    }

    fn identity(id: &str, merged_into: Option<&str>) -> Identity {
        Identity {
            id: id.to_string(),
            email: Some(format!("{id}@example.com")),
            name: None,
            role: Role::Regular,
            is_imported_profile: false,
            merged_into_user_id: merged_into.map(str::to_string),
        }
    }

    #[test]
    fn create_defaults_priority_and_partition_by_role() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let planned = plan_create(&actor(Role::Priority), new_pod(" POD-9 "), now)
            .expect("create should plan");
        assert_eq!(planned.next.code, "POD-9");
        assert_eq!(planned.next.title.as_deref(), Some("Fibre"));
        assert_eq!(planned.next.priority, NO_PRIORITY);
        assert!(!planned.next.should_display);
        assert_eq!(planned.action, "CREATE");
        assert_eq!(planned.details["pod"]["code"], "POD-9");

        let mut explicit = new_pod("POD-10");
        explicit.priority = Some(NO_PRIORITY);
        let err = plan_create(&actor(Role::Admin), explicit, now).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn change_hides_rows_outside_the_actor_partition() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let err = plan_change(
            &actor(Role::Priority),
            "POD-1",
            Some(existing(true)),
            &PodChange::Delete,
            now,
        )
        .unwrap_err();
        assert_eq!(err, StoreError::NotFound("pod POD-1".to_string()));

        let err = plan_change(&actor(Role::Admin), "POD-1", None, &PodChange::Delete, now)
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("pod POD-1".to_string()));

        let mut deleted = existing(true);
        deleted.is_deleted = true;
        let err = plan_change(
            &actor(Role::SuperAdmin),
            "POD-1",
            Some(deleted),
            &PodChange::Complete,
            now,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn update_records_field_level_changes() {
        let patch: PodPatch = serde_json::from_value(serde_json::json!({
            "status": "closed",
            "priority": 2
        }))
        .expect("patch should parse");

        let planned = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(existing(true)),
            &PodChange::Update(patch),
            DateTime::<Utc>::UNIX_EPOCH,
        )
        .expect("update should plan");

        assert_eq!(planned.next.priority, 2);
        let changes = &planned.details["changes"];
        assert_eq!(changes["status"]["to"], "closed");
        assert_eq!(changes["priority"]["from"], NO_PRIORITY);
        assert!(changes.get("title").is_none());
    }

    #[test]
    fn update_trims_text_and_clears_blank_values() {
        let mut current = existing(true);
        current.status = Some("open".to_string());
        current.engineer_id = Some("eng-1".to_string());
        let patch: PodPatch = serde_json::from_value(serde_json::json!({
            "status": "   ",
            "engineerId": "",
            "site": "  North  "
        }))
        .expect("patch should parse");

        let planned = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(current),
            &PodChange::Update(patch),
            DateTime::<Utc>::UNIX_EPOCH,
        )
        .expect("update should plan");

        assert_eq!(planned.next.status, None);
        assert_eq!(planned.next.engineer_id, None);
        assert_eq!(planned.next.site.as_deref(), Some("North"));
        let changes = &planned.details["changes"];
        assert_eq!(changes["status"]["to"], Value::Null);
        assert_eq!(changes["engineerId"]["from"], "eng-1");
    }

    #[test]
    fn update_rejects_sentinel_and_empty_patches() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        let sentinel: PodPatch = serde_json::from_value(serde_json::json!({ "priority": 9999 }))
            .expect("patch should parse");
        let err = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(existing(true)),
            &PodChange::Update(sentinel),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));

        let err = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(existing(true)),
            &PodChange::Update(PodPatch::default()),
            now,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn complete_moves_pod_to_history_once() {
        let now = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(1);
        let planned = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(existing(true)),
            &PodChange::Complete,
            now,
        )
        .expect("complete should plan");
        assert!(planned.next.is_history);
        assert_eq!(planned.next.completed_at, Some(now));

        let err = plan_change(
            &actor(Role::Admin),
            "POD-1",
            Some(planned.next),
            &PodChange::Complete,
            now,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn unserializable_details_abort_the_plan() {
        let mut keyed = std::collections::BTreeMap::new();
        keyed.insert((1, 2), "pair-keyed maps have no JSON form");
        let err = to_json(&keyed).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn merge_requires_distinct_live_identities() {
        let err = plan_merge("a", "a", Some(identity("a", None)), Some(identity("a", None)))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));

        let err = plan_merge("a", "b", Some(identity("a", Some("c"))), Some(identity("b", None)))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = plan_merge("a", "b", Some(identity("a", None)), Some(identity("b", Some("c"))))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));

        let planned = plan_merge("a", "b", Some(identity("a", None)), Some(identity("b", None)))
            .expect("merge should plan");
        assert_eq!(planned.next.merged_into_user_id.as_deref(), Some("b"));
        assert_eq!(planned.entity_type, IDENTITY_ENTITY_TYPE);
        assert_eq!(planned.details["mergedIntoUserId"], "b");
    }
}
