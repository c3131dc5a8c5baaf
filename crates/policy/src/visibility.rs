//! Role visibility rule and mutation permissions, both table-driven.
//!
//! The visibility rule is ANDed onto the caller's predicate; nothing in the
//! criteria list can name `should_display`, so the rule cannot be widened.

use podtrack_contracts::{Pod, Role};

use crate::filter::{Condition, Flag, UngatedPredicate};
use crate::partition::Partition;

/// `None` means no mandatory restriction.
const SHOULD_DISPLAY_BY_ROLE: [(Role, Option<bool>); 4] = [
    (Role::SuperAdmin, None),
    (Role::Priority, Some(false)),
    (Role::Admin, Some(true)),
    (Role::Regular, Some(true)),
];

pub fn required_should_display(role: Role) -> Option<bool> {
    SHOULD_DISPLAY_BY_ROLE
        .iter()
        .find(|(r, _)| *r == role)
        .and_then(|(_, rule)| *rule)
}

/// Predicate with the role rule applied. Only [`gate`] produces one, and row
/// search accepts nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatedPredicate {
    role: Role,
    partition: Partition,
    conditions: Vec<Condition>,
}

impl GatedPredicate {
    pub fn role(&self) -> Role {
        self.role
    }

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

pub fn gate(role: Role, predicate: UngatedPredicate) -> GatedPredicate {
    let UngatedPredicate {
        partition,
        mut conditions,
    } = predicate;

    if let Some(value) = required_should_display(role) {
        conditions.push(Condition::Flag {
            flag: Flag::ShouldDisplay,
            value,
        });
    }

    GatedPredicate {
        role,
        partition,
        conditions,
    }
}

/// Whether `role` may see `pod` at all, independent of partition. Mutations
/// use this so a pod outside the caller's rows reads as absent.
pub fn can_see(role: Role, pod: &Pod) -> bool {
    !pod.is_deleted && in_display_partition(role, pod)
}

/// The display half of [`can_see`]. Audit history of a deleted pod stays
/// readable to the roles that could see it before the delete.
pub fn in_display_partition(role: Role, pod: &Pod) -> bool {
    required_should_display(role).is_none_or(|required| pod.should_display == required)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreatePod,
    UpdatePod,
    CompletePod,
    DeletePod,
    MergeIdentity,
    ReadAudit,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::CreatePod => "create_pod",
            Operation::UpdatePod => "update_pod",
            Operation::CompletePod => "complete_pod",
            Operation::DeletePod => "delete_pod",
            Operation::MergeIdentity => "merge_identity",
            Operation::ReadAudit => "read_audit",
        }
    }

    fn allowed_roles(self) -> &'static [Role] {
        match self {
            Operation::CreatePod | Operation::UpdatePod | Operation::CompletePod => {
                &[Role::SuperAdmin, Role::Admin, Role::Priority]
            }
            Operation::DeletePod | Operation::ReadAudit => &[Role::SuperAdmin, Role::Admin],
            Operation::MergeIdentity => &[Role::SuperAdmin],
        }
    }
}

pub fn permits(role: Role, operation: Operation) -> bool {
    operation.allowed_roles().contains(&role)
}

/// `should_display` for a newly created pod. Only SUPER_ADMIN may choose;
/// everyone else gets the partition their own searches read from.
pub fn should_display_for_new_pod(role: Role, requested: Option<bool>) -> bool {
    match required_should_display(role) {
        Some(required) => required,
        None => requested.unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{self, FilterPath};
    use crate::test_support::pod;
    use podtrack_contracts::Criterion;

    #[test]
    fn policy_table_matches_roles() {
        assert_eq!(required_should_display(Role::SuperAdmin), None);
        assert_eq!(required_should_display(Role::Priority), Some(false));
        assert_eq!(required_should_display(Role::Admin), Some(true));
        assert_eq!(required_should_display(Role::Regular), Some(true));
    }

    #[test]
    fn gate_appends_rule_without_dropping_caller_filters() {
        let ungated = filter::build(
            &[Criterion {
                field: "status".to_string(),
                value: "open".to_string(),
            }],
            Partition::Active,
            FilterPath::RowSearch,
        )
        .unwrap();
        let before = ungated.conditions().to_vec();

        let gated = gate(Role::Regular, ungated);
        assert_eq!(&gated.conditions()[..before.len()], before.as_slice());
        assert_eq!(
            gated.conditions().last(),
            Some(&Condition::Flag {
                flag: Flag::ShouldDisplay,
                value: true
            })
        );
    }

    #[test]
    fn no_filter_combination_crosses_the_display_partition() {
        let mut shown = pod("SHOWN", 1);
        shown.should_display = true;
        shown.status = Some("open".to_string());
        let mut hidden = pod("HIDDEN", 1);
        hidden.should_display = false;
        hidden.status = Some("open".to_string());

        let criteria_sets: Vec<Vec<Criterion>> = vec![
            vec![],
            vec![Criterion {
                field: "status".to_string(),
                value: "open".to_string(),
            }],
            vec![Criterion {
                field: "priority".to_string(),
                value: "has_value".to_string(),
            }],
            vec![Criterion {
                field: "code".to_string(),
                value: "H".to_string(),
            }],
        ];

        for criteria in &criteria_sets {
            for role in [Role::Regular, Role::Admin, Role::Priority] {
                let ungated =
                    filter::build(criteria, Partition::Active, FilterPath::RowSearch).unwrap();
                let gated = gate(role, ungated);
                let wrong = if role == Role::Priority { &shown } else { &hidden };
                assert!(!gated.matches(wrong), "{role} saw the other partition");
            }

            let ungated =
                filter::build(criteria, Partition::Active, FilterPath::RowSearch).unwrap();
            let gated = gate(Role::SuperAdmin, ungated.clone());
            assert_eq!(gated.conditions(), ungated.conditions());
        }
    }

    #[test]
    fn can_see_follows_the_same_table() {
        let mut p = pod("A", 1);
        p.should_display = false;
        assert!(can_see(Role::Priority, &p));
        assert!(can_see(Role::SuperAdmin, &p));
        assert!(!can_see(Role::Admin, &p));

        p.is_deleted = true;
        assert!(!can_see(Role::SuperAdmin, &p));
        assert!(in_display_partition(Role::SuperAdmin, &p));
        assert!(in_display_partition(Role::Priority, &p));
        assert!(!in_display_partition(Role::Admin, &p));
    }

    #[test]
    fn regular_role_cannot_mutate() {
        for op in [
            Operation::CreatePod,
            Operation::UpdatePod,
            Operation::CompletePod,
            Operation::DeletePod,
            Operation::MergeIdentity,
            Operation::ReadAudit,
        ] {
            assert!(!permits(Role::Regular, op), "{} allowed", op.as_str());
            assert!(permits(Role::SuperAdmin, op));
        }
        assert!(permits(Role::Priority, Operation::UpdatePod));
        assert!(!permits(Role::Admin, Operation::MergeIdentity));
    }

    #[test]
    fn new_pods_land_in_the_creators_partition() {
        assert!(!should_display_for_new_pod(Role::Priority, Some(true)));
        assert!(should_display_for_new_pod(Role::Admin, Some(false)));
        assert!(!should_display_for_new_pod(Role::SuperAdmin, Some(false)));
        assert!(should_display_for_new_pod(Role::SuperAdmin, None));
    }
}
