//! The declared, filterable field set of a pod.
//!
//! Everything downstream holds `&'static FieldSpec` rather than a name, so a
//! field that did not come out of [`lookup`] cannot reach predicate
//! construction. Lifecycle and visibility columns are deliberately absent.

use podtrack_contracts::Pod;

use crate::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Date,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldSpec {
    /// Wire name used in criteria and facet requests.
    pub name: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

pub const PRIORITY: &str = "priority";

const fn field(name: &'static str, column: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, column, kind }
}

static POD_FIELDS: &[FieldSpec] = &[
    field("code", "code", FieldKind::Text),
    field("title", "title", FieldKind::Text),
    field("site", "site", FieldKind::Text),
    field("region", "region", FieldKind::Text),
    field("status", "status", FieldKind::Text),
    field("category", "category", FieldKind::Text),
    field("engineerId", "engineer_id", FieldKind::Text),
    field("priority", "priority", FieldKind::Integer),
    field("dueDate", "due_date", FieldKind::Date),
    field("quantity", "quantity", FieldKind::Integer),
    field("createdById", "created_by_id", FieldKind::Text),
];

pub fn fields() -> &'static [FieldSpec] {
    POD_FIELDS
}

pub fn validate(name: &str) -> bool {
    POD_FIELDS.iter().any(|f| f.name == name)
}

pub fn lookup(name: &str) -> Result<&'static FieldSpec, QueryError> {
    POD_FIELDS
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| QueryError::InvalidField(name.to_string()))
}

impl FieldSpec {
    pub fn is_priority(&self) -> bool {
        self.name == PRIORITY
    }

    /// Textual form of the field as the database renders `column::text`.
    pub fn text_value(&self, pod: &Pod) -> Option<String> {
        match self.column {
            "code" => Some(pod.code.clone()),
            "title" => pod.title.clone(),
            "site" => pod.site.clone(),
            "region" => pod.region.clone(),
            "status" => pod.status.clone(),
            "category" => pod.category.clone(),
            "engineer_id" => pod.engineer_id.clone(),
            "priority" => Some(pod.priority.to_string()),
            "due_date" => pod.due_date.map(|d| d.to_string()),
            "quantity" => pod.quantity.map(|q| q.to_string()),
            "created_by_id" => Some(pod.created_by_id.clone()),
            _ => None,
        }
    }
}
