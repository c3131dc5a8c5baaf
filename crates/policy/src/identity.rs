//! Engineer deduplication.
//!
//! The roster endpoint and row enrichment both go through
//! [`EngineerRoster::resolve`]. It is a pure function of the identity set it
//! is given and is rebuilt per request, so a merge is visible on the very
//! next call.

use std::collections::HashMap;

use podtrack_contracts::{CanonicalIdentity, Identity};

/// Grouping key: the lower-cased name, or the lower-cased email when the
/// identity has no name. `None` when it has neither.
pub fn engineer_key(identity: &Identity) -> Option<String> {
    non_blank(identity.name.as_deref())
        .or_else(|| non_blank(identity.email.as_deref()))
        .map(str::to_lowercase)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

struct Group<'a> {
    canonical: &'a Identity,
    members: Vec<&'a Identity>,
}

impl Group<'_> {
    fn is_displaced_by(&self, candidate: &Identity) -> bool {
        // Registered beats imported; otherwise first in input order stays.
        self.canonical.is_imported_profile && !candidate.is_imported_profile
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineerRoster {
    entries: Vec<CanonicalIdentity>,
    by_identity: HashMap<String, usize>,
}

impl EngineerRoster {
    pub fn resolve(identities: &[Identity]) -> Self {
        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut group_by_key: HashMap<String, usize> = HashMap::new();

        for identity in identities.iter().filter(|i| !i.is_tombstoned()) {
            let Some(key) = engineer_key(identity) else {
                continue;
            };

            match group_by_key.get(&key) {
                Some(&idx) => {
                    let group = &mut groups[idx];
                    if group.is_displaced_by(identity) {
                        group.canonical = identity;
                    }
                    group.members.push(identity);
                }
                None => {
                    group_by_key.insert(key, groups.len());
                    groups.push(Group {
                        canonical: identity,
                        members: vec![identity],
                    });
                }
            }
        }

        let mut resolved = groups
            .iter()
            .map(|group| (canonical_entry(group), group))
            .collect::<Vec<_>>();
        resolved.sort_by(|(a, _), (b, _)| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut by_identity = HashMap::new();
        let mut entries = Vec::with_capacity(resolved.len());
        for (idx, (entry, group)) in resolved.into_iter().enumerate() {
            for member in &group.members {
                by_identity.insert(member.id.clone(), idx);
            }
            entries.push(entry);
        }

        alias_tombstones(identities, &mut by_identity);

        Self {
            entries,
            by_identity,
        }
    }

    pub fn entries(&self) -> &[CanonicalIdentity] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<CanonicalIdentity> {
        self.entries
    }

    /// Canonical entry for any identity id: a canonical record, a duplicate
    /// folded into it, or a tombstone merged (transitively) into either.
    pub fn canonical_for(&self, identity_id: &str) -> Option<&CanonicalIdentity> {
        self.by_identity
            .get(identity_id)
            .and_then(|idx| self.entries.get(*idx))
    }

    pub fn display_name_for(&self, identity_id: &str) -> Option<&str> {
        self.canonical_for(identity_id)
            .map(|entry| entry.display_name.as_str())
    }
}

/// Same result as `EngineerRoster::resolve(identities).into_entries()`.
pub fn resolve_canonical_identities(identities: &[Identity]) -> Vec<CanonicalIdentity> {
    EngineerRoster::resolve(identities).into_entries()
}

fn canonical_entry(group: &Group<'_>) -> CanonicalIdentity {
    let canonical = group.canonical;
    let name = non_blank(canonical.name.as_deref());
    let email = non_blank(canonical.email.as_deref());

    CanonicalIdentity {
        display_name: name.or(email).unwrap_or_default().to_string(),
        key: email.or(name).unwrap_or_default().to_string(),
        source_id: canonical.id.clone(),
        is_registered: group.members.iter().any(|m| !m.is_imported_profile),
        is_imported: group.members.iter().any(|m| m.is_imported_profile),
    }
}

fn alias_tombstones(identities: &[Identity], by_identity: &mut HashMap<String, usize>) {
    let by_id = identities
        .iter()
        .map(|i| (i.id.as_str(), i))
        .collect::<HashMap<_, _>>();

    for tombstone in identities.iter().filter(|i| i.is_tombstoned()) {
        let mut current = tombstone;
        // The merge relation is acyclic; the hop limit only bounds bad data.
        for _ in 0..identities.len() {
            let Some(next) = current
                .merged_into_user_id
                .as_deref()
                .and_then(|id| by_id.get(id))
            else {
                break;
            };
            current = next;
            if !current.is_tombstoned() {
                if let Some(idx) = by_identity.get(&current.id).copied() {
                    by_identity.insert(tombstone.id.clone(), idx);
                }
                break;
            }
        }
    }
}
