//! Group mapping resolver.
//!
//! Static bidirectional lookup between primary group grants and the grants that
//! mirror them in each replica directory.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use groupsync_directory::ids::{DirectoryId, GrantId};
use groupsync_directory::types::PrincipalSnapshot;

use crate::config::{ConfigError, GroupMappingEntry};
use crate::error::{SyncError, SyncResult};

/// Primary grant -> replica directory -> replica grant, with its reverse index.
#[derive(Debug, Clone)]
pub struct GroupMapping {
    primary: DirectoryId,
    forward: BTreeMap<GrantId, BTreeMap<DirectoryId, GrantId>>,
    reverse: HashMap<(DirectoryId, GrantId), GrantId>,
    names: HashMap<GrantId, String>,
}

impl GroupMapping {
    /// Build the mapping, rejecting ambiguous reverse lookups.
    pub fn new(primary: DirectoryId, entries: &[GroupMappingEntry]) -> Result<Self, ConfigError> {
        let mut forward = BTreeMap::new();
        let mut reverse = HashMap::new();
        let mut names = HashMap::new();

        for entry in entries {
            if forward.contains_key(&entry.primary_grant) {
                return Err(ConfigError::Invalid(format!(
                    "primary grant {} is mapped twice",
                    entry.primary_grant
                )));
            }

            for (&directory, &replica_grant) in &entry.replicas {
                if directory == primary {
                    return Err(ConfigError::Invalid(format!(
                        "primary grant {} targets the primary directory",
                        entry.primary_grant
                    )));
                }
                if let Some(existing) = reverse.insert((directory, replica_grant), entry.primary_grant)
                {
                    return Err(ConfigError::Invalid(format!(
                        "replica grant {replica_grant} in directory {directory} is mapped from both {existing} and {}",
                        entry.primary_grant
                    )));
                }
            }

            forward.insert(entry.primary_grant, entry.replicas.clone());
            if !entry.name.is_empty() {
                names.insert(entry.primary_grant, entry.name.clone());
            }
        }

        Ok(Self {
            primary,
            forward,
            reverse,
            names,
        })
    }

    /// The primary directory.
    pub fn primary(&self) -> DirectoryId {
        self.primary
    }

    /// Replica targets of a primary group grant.
    pub fn targets_for(&self, primary_grant: GrantId) -> SyncResult<&BTreeMap<DirectoryId, GrantId>> {
        self.forward
            .get(&primary_grant)
            .ok_or(SyncError::UnknownGrant {
                grant: primary_grant,
            })
    }

    /// Primary grant that authorizes a replica grant, if the replica grant is managed.
    pub fn authorizing_grant_for(
        &self,
        directory: DirectoryId,
        replica_grant: GrantId,
    ) -> Option<GrantId> {
        self.reverse.get(&(directory, replica_grant)).copied()
    }

    /// Whether the primary grant is a mapped group grant.
    pub fn is_group_grant(&self, grant: GrantId) -> bool {
        self.forward.contains_key(&grant)
    }

    /// Every mapped group grant.
    pub fn group_grants(&self) -> impl Iterator<Item = GrantId> + '_ {
        self.forward.keys().copied()
    }

    /// Group grants held in a primary snapshot.
    pub fn group_grants_of(&self, snapshot: &PrincipalSnapshot) -> BTreeSet<GrantId> {
        snapshot
            .grants
            .iter()
            .copied()
            .filter(|g| self.is_group_grant(*g))
            .collect()
    }

    /// Every directory targeted by at least one mapping.
    pub fn replica_directories(&self) -> BTreeSet<DirectoryId> {
        self.forward
            .values()
            .flat_map(|targets| targets.keys().copied())
            .collect()
    }

    /// Replica grants in a directory that the engine manages.
    pub fn managed_grants_in(&self, directory: DirectoryId) -> BTreeSet<GrantId> {
        self.forward
            .values()
            .filter_map(|targets| targets.get(&directory).copied())
            .collect()
    }

    /// Replica grants in a directory authorized by a set of primary grants.
    pub fn authorized_grants_in(
        &self,
        directory: DirectoryId,
        primary_grants: &BTreeSet<GrantId>,
    ) -> BTreeSet<GrantId> {
        primary_grants
            .iter()
            .filter_map(|g| self.forward.get(g))
            .filter_map(|targets| targets.get(&directory).copied())
            .collect()
    }

    /// Display name of a group grant, falling back to its id.
    pub fn name_of(&self, grant: GrantId) -> String {
        self.names
            .get(&grant)
            .cloned()
            .unwrap_or_else(|| grant.to_string())
    }
}
