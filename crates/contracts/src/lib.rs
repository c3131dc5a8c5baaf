use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub mod canonical;

/// Stored in `pods.priority` when no priority has been assigned.
///
/// Never a real priority: writes carrying it explicitly are rejected, and
/// active-partition ordering places it after every assigned value even if
/// an assigned value is numerically larger.
pub const NO_PRIORITY: i32 = 9999;

pub const POD_ENTITY_TYPE: &str = "Pod";
pub const IDENTITY_ENTITY_TYPE: &str = "User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Priority,
    Admin,
    Regular,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::SuperAdmin, Role::Priority, Role::Admin, Role::Regular];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Priority => "PRIORITY",
            Role::Admin => "ADMIN",
            Role::Regular => "REGULAR",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        let raw = raw.trim();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(raw))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller every endpoint requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub actor_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub code: String,
    pub title: Option<String>,
    pub site: Option<String>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub engineer_id: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub quantity: Option<i32>,
    pub priority: i32,
    pub is_history: bool,
    pub is_deleted: bool,
    pub should_display: bool,
    pub created_by_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Pod {
    pub fn has_priority(&self) -> bool {
        self.priority != NO_PRIORITY
    }
}

/// A search result row with identity references resolved to display names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRow {
    #[serde(flatten)]
    pub pod: Pod,
    pub engineer_name: Option<String>,
    pub created_by_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Role,
    pub is_imported_profile: bool,
    pub merged_into_user_id: Option<String>,
}

impl Identity {
    pub fn is_tombstoned(&self) -> bool {
        self.merged_into_user_id.is_some()
    }
}

/// One deduplicated engineer as shown in rosters and enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalIdentity {
    pub display_name: String,
    /// Email of the canonical record, or its name when it has no email.
    pub key: String,
    pub source_id: String,
    pub is_registered: bool,
    pub is_imported: bool,
}

/// Immutable audit record. Rows are only ever inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub details: serde_json::Value,
    pub details_hash: String,
    pub created_by_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total_count: u64,
    pub total_pages: u64,
    pub current_page: u64,
}

/// One `(field, value)` pair from the client's ordered filter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Criterion {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewPod {
    pub code: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub engineer_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub quantity: Option<i32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub should_display: Option<bool>,
}

/// Partial update. An absent key leaves the column alone; an explicit
/// `null` clears it (for `priority`, back to [`NO_PRIORITY`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodPatch {
    #[serde(default, deserialize_with = "double_option")]
    pub title: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub site: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub region: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub status: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub category: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub engineer_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "double_option")]
    pub quantity: Option<Option<i32>>,
    #[serde(default, deserialize_with = "double_option")]
    pub priority: Option<Option<i32>>,
}

impl PodPatch {
    pub fn is_empty(&self) -> bool {
        *self == PodPatch::default()
    }

    /// Applies the patch to `pod` in place. Priority must already have
    /// passed [`resolve_priority`].
    pub fn apply_to(&self, pod: &mut Pod) {
        if let Some(v) = &self.title {
            pod.title = v.clone();
        }
        if let Some(v) = &self.site {
            pod.site = v.clone();
        }
        if let Some(v) = &self.region {
            pod.region = v.clone();
        }
        if let Some(v) = &self.status {
            pod.status = v.clone();
        }
        if let Some(v) = &self.category {
            pod.category = v.clone();
        }
        if let Some(v) = &self.engineer_id {
            pod.engineer_id = v.clone();
        }
        if let Some(v) = self.due_date {
            pod.due_date = v;
        }
        if let Some(v) = self.quantity {
            pod.quantity = v;
        }
        if let Some(v) = self.priority {
            pod.priority = v.unwrap_or(NO_PRIORITY);
        }
    }
}

/// Maps a client-supplied priority to its stored form.
pub fn resolve_priority(priority: Option<i32>) -> Result<i32, &'static str> {
    match priority {
        None => Ok(NO_PRIORITY),
        Some(NO_PRIORITY) => Err("priority 9999 is reserved; send null to clear priority"),
        Some(p) if p < 0 => Err("priority must be non-negative"),
        Some(p) => Ok(p),
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod() -> Pod {
        Pod {
            code: "POD-1".to_string(),
            title: Some("Replace switch".to_string()),
            site: None,
            region: None,
            status: Some("open".to_string()),
            category: None,
            engineer_id: None,
            due_date: None,
            quantity: None,
            priority: 3,
            is_history: false,
            is_deleted: false,
            should_display: true,
            created_by_id: "u1".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            completed_at: None,
        }
    }

    #[test]
    fn role_round_trips_through_wire_names() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
            let json = serde_json::to_value(role).expect("role should serialize");
            assert_eq!(json, serde_json::json!(role.as_str()));
        }
        assert_eq!(Role::parse(" super_admin "), Some(Role::SuperAdmin));
        assert_eq!(Role::parse("OWNER"), None);
    }

    #[test]
    fn resolve_priority_rejects_the_sentinel() {
        assert_eq!(resolve_priority(None), Ok(NO_PRIORITY));
        assert_eq!(resolve_priority(Some(1)), Ok(1));
        assert!(resolve_priority(Some(NO_PRIORITY)).is_err());
        assert!(resolve_priority(Some(-1)).is_err());
    }

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let patch: PodPatch = serde_json::from_value(serde_json::json!({
            "status": "closed",
            "priority": null
        }))
        .expect("patch should parse");

        assert_eq!(patch.status, Some(Some("closed".to_string())));
        assert_eq!(patch.priority, Some(None));
        assert_eq!(patch.title, None);

        let mut p = pod();
        patch.apply_to(&mut p);
        assert_eq!(p.status.as_deref(), Some("closed"));
        assert_eq!(p.priority, NO_PRIORITY);
        assert_eq!(p.title.as_deref(), Some("Replace switch"));
        assert!(!p.has_priority());
    }

    #[test]
    fn patch_rejects_unknown_and_hidden_fields() {
        let err = serde_json::from_value::<PodPatch>(serde_json::json!({
            "shouldDisplay": true
        }))
        .expect_err("visibility flag must not be patchable");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn pod_row_flattens_pod_fields() {
        let row = PodRow {
            pod: pod(),
            engineer_name: Some("Ada".to_string()),
            created_by_name: None,
        };
        let json = serde_json::to_value(&row).expect("row should serialize");
        assert_eq!(json["code"], "POD-1");
        assert_eq!(json["engineerName"], "Ada");
        assert_eq!(json["shouldDisplay"], true);
    }
}
