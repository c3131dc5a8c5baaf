//! Request planning for pod reads: field validation, filter construction,
//! the role visibility gate, ordering and pagination, facet planning, and
//! engineer deduplication. Nothing here performs I/O; the gateway's store
//! backends execute the plans.

use podtrack_contracts::{Criterion, Role};

pub mod facet;
pub mod filter;
pub mod identity;
pub mod pagination;
pub mod partition;
pub mod registry;
pub mod visibility;

use self::filter::FilterPath;
use self::pagination::{PageDefaults, PageRequest};
use self::partition::Partition;
use self::visibility::GatedPredicate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    InvalidField(String),
    InvalidPayload(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::InvalidField(field) => write!(f, "field not filterable: {}", field),
            QueryError::InvalidPayload(reason) => write!(f, "invalid criteria: {}", reason),
        }
    }
}

impl std::error::Error for QueryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPlan {
    pub predicate: GatedPredicate,
    pub page: PageRequest,
}

impl SearchPlan {
    pub fn partition(&self) -> Partition {
        self.predicate.partition()
    }
}

pub struct SearchInput<'a> {
    pub role: Role,
    pub is_history: bool,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub criteria: &'a [Criterion],
}

/// Registry check, filter build and visibility gate, in that order. The
/// gate is applied here once per request.
pub fn plan_search(input: SearchInput<'_>, defaults: PageDefaults) -> Result<SearchPlan, QueryError> {
    let partition = Partition::from_is_history(input.is_history);
    let ungated = filter::build(input.criteria, partition, FilterPath::RowSearch)?;
    let predicate = visibility::gate(input.role, ungated);
    let page = PageRequest::from_raw(input.page, input.page_size, defaults);

    Ok(SearchPlan { predicate, page })
}
