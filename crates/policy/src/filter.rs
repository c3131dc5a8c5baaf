//! Turns the client's criteria list into one conjunctive predicate.

use podtrack_contracts::{Criterion, NO_PRIORITY, Pod};

use crate::QueryError;
use crate::partition::Partition;
use crate::registry::{self, FieldSpec};

/// Row search and facet lookups treat a `priority` criterion differently;
/// both behaviours are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPath {
    /// `priority = "has_value"` becomes `priority <> 9999`; any other
    /// priority value is a plain substring match.
    RowSearch,
    /// Any `priority` criterion, whatever its value, becomes
    /// `priority < 9999`.
    Facet,
}

pub const HAS_VALUE: &str = "has_value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    IsDeleted,
    IsHistory,
    ShouldDisplay,
}

impl Flag {
    pub fn column(self) -> &'static str {
        match self {
            Flag::IsDeleted => "is_deleted",
            Flag::IsHistory => "is_history",
            Flag::ShouldDisplay => "should_display",
        }
    }

    fn read(self, pod: &Pod) -> bool {
        match self {
            Flag::IsDeleted => pod.is_deleted,
            Flag::IsHistory => pod.is_history,
            Flag::ShouldDisplay => pod.should_display,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Case-insensitive substring match on `field::text`.
    Contains {
        field: &'static FieldSpec,
        needle: String,
    },
    PriorityNotSentinel,
    PriorityBelowSentinel,
    Flag {
        flag: Flag,
        value: bool,
    },
}

impl Condition {
    pub fn matches(&self, pod: &Pod) -> bool {
        match self {
            Condition::Contains { field, needle } => field
                .text_value(pod)
                .map(|text| text.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Condition::PriorityNotSentinel => pod.priority != NO_PRIORITY,
            Condition::PriorityBelowSentinel => pod.priority < NO_PRIORITY,
            Condition::Flag { flag, value } => flag.read(pod) == *value,
        }
    }
}

/// Conjunction of the partition scope and the caller's criteria, before the
/// role visibility rule has been added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UngatedPredicate {
    pub(crate) partition: Partition,
    pub(crate) conditions: Vec<Condition>,
}

impl UngatedPredicate {
    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, pod: &Pod) -> bool {
        self.conditions.iter().all(|c| c.matches(pod))
    }
}

pub fn build(
    criteria: &[Criterion],
    partition: Partition,
    path: FilterPath,
) -> Result<UngatedPredicate, QueryError> {
    let mut conditions = vec![
        Condition::Flag {
            flag: Flag::IsDeleted,
            value: false,
        },
        Condition::Flag {
            flag: Flag::IsHistory,
            value: partition.is_history(),
        },
    ];

    for criterion in criteria {
        let name = criterion.field.trim();
        if name.is_empty() {
            return Err(QueryError::InvalidPayload(
                "criterion field must be non-empty".to_string(),
            ));
        }
        let field = registry::lookup(name)?;

        let value = criterion.value.trim();
        if value.is_empty() {
            return Err(QueryError::InvalidPayload(format!(
                "criterion value for `{}` must be non-empty",
                field.name
            )));
        }

        let condition = match path {
            FilterPath::Facet if field.is_priority() => Condition::PriorityBelowSentinel,
            FilterPath::RowSearch if field.is_priority() && value == HAS_VALUE => {
                Condition::PriorityNotSentinel
            }
            _ => Condition::Contains {
                field,
                needle: value.to_string(),
            },
        };
        conditions.push(condition);
    }

    Ok(UngatedPredicate {
        partition,
        conditions,
    })
}

/// Escapes `%`, `_` and `\` so a needle can sit inside `ILIKE '%' || $n || '%'`.
pub fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
