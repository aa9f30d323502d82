//! Server-side RBAC assignment and approver-group rosters (§4.10 admin RBAC
//! endpoints; §12 open-question 2 "all N must be members").
//!
//! A verified bearer token already carries a role set (§4.7); this store
//! holds roles assigned out-of-band by an admin via `PUT
//! /admin/rbac/{tenant}/users/{subject}`; the Decision Pipeline authorizes
//! against the union of both, so an OIDC token lacking a custom `roles`
//! claim can still be granted `approver`/`admin` by an operator.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use identity::Role;

/// Roles assigned server-side, keyed by `(tenant, subject)`.
#[derive(Default)]
pub struct RbacStore {
    assignments: RwLock<HashMap<(String, String), HashSet<Role>>>,
    /// Named approver groups (§4.4 `approver_group`), each a roster of subject ids.
    groups: RwLock<HashMap<String, HashSet<String>>>,
}

impl RbacStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign (replacing) `subject`'s roles within `tenant`.
    pub fn set_roles(&self, tenant: &str, subject: &str, roles: HashSet<Role>) {
        self.assignments
            .write()
            .expect("rbac store lock poisoned")
            .insert((tenant.to_string(), subject.to_string()), roles);
    }

    /// Read the roles assigned to `(tenant, subject)`, empty if none.
    #[must_use]
    pub fn roles(&self, tenant: &str, subject: &str) -> HashSet<Role> {
        self.assignments
            .read()
            .expect("rbac store lock poisoned")
            .get(&(tenant.to_string(), subject.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the roster for `group`.
    pub fn set_group(&self, group: &str, members: HashSet<String>) {
        self.groups.write().expect("rbac store lock poisoned").insert(group.to_string(), members);
    }

    /// Whether `subject` is a member of `group`. An unconfigured group has no
    /// members, so every membership check fails closed.
    #[must_use]
    pub fn is_member(&self, group: &str, subject: &str) -> bool {
        self.groups
            .read()
            .expect("rbac store lock poisoned")
            .get(group)
            .is_some_and(|members| members.contains(subject))
    }

    /// Read `group`'s current roster, empty if unconfigured.
    #[must_use]
    pub fn members(&self, group: &str) -> HashSet<String> {
        self.groups.read().expect("rbac store lock poisoned").get(group).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_subject_has_no_roles() {
        let store = RbacStore::new();
        assert!(store.roles("acme", "nobody").is_empty());
    }

    #[test]
    fn assigned_roles_round_trip() {
        let store = RbacStore::new();
        let mut roles = HashSet::new();
        roles.insert(Role::Approver);
        store.set_roles("acme", "alice", roles.clone());
        assert_eq!(store.roles("acme", "alice"), roles);
    }

    #[test]
    fn unconfigured_group_has_no_members() {
        let store = RbacStore::new();
        assert!(!store.is_member("finance-approvers", "alice"));
    }

    #[test]
    fn group_membership_after_assignment() {
        let store = RbacStore::new();
        let mut members = HashSet::new();
        members.insert("alice".to_string());
        store.set_group("finance-approvers", members);
        assert!(store.is_member("finance-approvers", "alice"));
        assert!(!store.is_member("finance-approvers", "bob"));
    }

    #[test]
    fn members_reads_back_the_configured_roster() {
        let store = RbacStore::new();
        assert!(store.members("finance-approvers").is_empty());
        let mut members = HashSet::new();
        members.insert("alice".to_string());
        members.insert("bob".to_string());
        store.set_group("finance-approvers", members.clone());
        assert_eq!(store.members("finance-approvers"), members);
    }
}
