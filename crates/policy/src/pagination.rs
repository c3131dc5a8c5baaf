use std::cmp::Ordering;

use podtrack_contracts::{NO_PRIORITY, Page, Pod};

use crate::partition::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDefaults {
    pub page_size: u64,
    pub max_page_size: u64,
}

impl Default for PageDefaults {
    fn default() -> Self {
        Self {
            page_size: 20,
            max_page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    page_size: u64,
}

impl PageRequest {
    /// Absent, zero or negative inputs fall back to the defaults; the page
    /// size is clamped to `max_page_size`.
    pub fn from_raw(page: Option<i64>, page_size: Option<i64>, defaults: PageDefaults) -> Self {
        let page = page
            .and_then(|p| u64::try_from(p).ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);
        let page_size = page_size
            .and_then(|s| u64::try_from(s).ok())
            .filter(|s| *s >= 1)
            .unwrap_or(defaults.page_size)
            .min(defaults.max_page_size.max(1));

        Self { page, page_size }
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }

    /// `total_count` must come from the same predicate as `rows`.
    pub fn into_page<T>(self, rows: Vec<T>, total_count: u64) -> Page<T> {
        Page {
            rows,
            total_count,
            total_pages: total_pages(total_count, self.page_size),
            current_page: self.page,
        }
    }
}

pub fn total_pages(total_count: u64, page_size: u64) -> u64 {
    total_count.div_ceil(page_size.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKey {
    /// Assigned priorities before [`NO_PRIORITY`], whatever their value.
    PriorityAssignedFirst,
    PriorityAsc,
    CreatedAtDesc,
    CompletedAtDescNullsLast,
    /// Final tie-break so that pages never overlap or skip rows.
    CodeAsc,
}

const ACTIVE_ORDER: &[OrderKey] = &[
    OrderKey::PriorityAssignedFirst,
    OrderKey::PriorityAsc,
    OrderKey::CreatedAtDesc,
    OrderKey::CodeAsc,
];

const HISTORY_ORDER: &[OrderKey] = &[
    OrderKey::CompletedAtDescNullsLast,
    OrderKey::CreatedAtDesc,
    OrderKey::CodeAsc,
];

pub fn order_keys(partition: Partition) -> &'static [OrderKey] {
    match partition {
        Partition::Active => ACTIVE_ORDER,
        Partition::History => HISTORY_ORDER,
    }
}

impl OrderKey {
    pub fn compare(self, a: &Pod, b: &Pod) -> Ordering {
        match self {
            OrderKey::PriorityAssignedFirst => {
                (a.priority == NO_PRIORITY).cmp(&(b.priority == NO_PRIORITY))
            }
            OrderKey::PriorityAsc => a.priority.cmp(&b.priority),
            OrderKey::CreatedAtDesc => b.created_at.cmp(&a.created_at),
            OrderKey::CompletedAtDescNullsLast => match (a.completed_at, b.completed_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            OrderKey::CodeAsc => a.code.cmp(&b.code),
        }
    }
}

pub fn compare(partition: Partition, a: &Pod, b: &Pod) -> Ordering {
    order_keys(partition)
        .iter()
        .map(|key| key.compare(a, b))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}
