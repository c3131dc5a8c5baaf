//! Distinct-value lookups for filter dropdowns.
//!
//! The plan carries an [`UngatedPredicate`]: facet options are computed
//! without the role visibility rule, so a role may be offered values that
//! only occur on rows it cannot search. Kept that way until the intended
//! semantics are confirmed.

use std::collections::BTreeSet;

use podtrack_contracts::Criterion;

use crate::QueryError;
use crate::filter::{self, FilterPath, UngatedPredicate};
use crate::partition::Partition;
use crate::registry::{self, FieldSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetPlan {
    pub field: &'static FieldSpec,
    pub predicate: UngatedPredicate,
}

pub fn plan(
    field: &str,
    criteria: &[Criterion],
    partition: Partition,
) -> Result<FacetPlan, QueryError> {
    let field = registry::lookup(field.trim())?;
    let predicate = filter::build(criteria, partition, FilterPath::Facet)?;
    Ok(FacetPlan { field, predicate })
}

/// Drops nulls and blank strings, deduplicates case-sensitively and sorts
/// by byte order.
pub fn normalize_values<I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    values
        .into_iter()
        .flatten()
        .filter(|v| !v.trim().is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Parses the facet endpoint's `filters` parameter, a JSON-encoded ordered
/// list of `{field, value}` objects.
pub fn parse_serialized_criteria(raw: Option<&str>) -> Result<Vec<Criterion>, QueryError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Vec::new());
    };

    serde_json::from_str::<Vec<Criterion>>(raw).map_err(|err| {
        QueryError::InvalidPayload(format!("filters must be a JSON array of {{field, value}}: {err}"))
    })
}
