use podtrack_contracts::Pod;

/// Lifecycle partition every read path is scoped to. Tombstoned pods belong
/// to neither partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Active,
    History,
}

impl Partition {
    pub fn from_is_history(is_history: bool) -> Self {
        if is_history {
            Partition::History
        } else {
            Partition::Active
        }
    }

    pub fn is_history(self) -> bool {
        self == Partition::History
    }

    pub fn admits(self, pod: &Pod) -> bool {
        !pod.is_deleted && pod.is_history == self.is_history()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Active => "active",
            Partition::History => "history",
        }
    }
}
