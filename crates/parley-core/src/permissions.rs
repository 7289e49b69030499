//! Permission resolution for groups and forums.
//!
//! Groups and forums share the `forum` scope namespace. Every role that has
//! at least one row against an entity is completed to a dense row-per-scope
//! matrix on read; the synthesized rows deny access and stay in memory until
//! the owning entity is saved.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::{
    ALL_USERS_ROLE_ID, Permission, PermissionHolder, PermissionType, REGISTERED_USERS_ROLE_ID, Site,
    UNAUTHENTICATED_ROLE_ID, User,
};

use crate::ports::PermissionStore;

pub const FORUM_NAMESPACE: &str = "forum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForumScope {
    View,
    CreatePost,
    EditPost,
    Reply,
    Delete,
    Lock,
    Attach,
    Subscribe,
    Pin,
    Moderate,
    Unmoderated,
}

impl ForumScope {
    /// Catalogue order doubles as permission-type sort order.
    pub const ALL: [ForumScope; 11] = [
        Self::View,
        Self::CreatePost,
        Self::EditPost,
        Self::Reply,
        Self::Delete,
        Self::Lock,
        Self::Attach,
        Self::Subscribe,
        Self::Pin,
        Self::Moderate,
        Self::Unmoderated,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::CreatePost => "create-post",
            Self::EditPost => "edit-post",
            Self::Reply => "reply",
            Self::Delete => "delete",
            Self::Lock => "lock",
            Self::Attach => "attach",
            Self::Subscribe => "subscribe",
            Self::Pin => "pin",
            Self::Moderate => "moderate",
            Self::Unmoderated => "unmoderated",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::View => "View",
            Self::CreatePost => "Create Post",
            Self::EditPost => "Edit Post",
            Self::Reply => "Reply",
            Self::Delete => "Delete",
            Self::Lock => "Lock",
            Self::Attach => "Attach",
            Self::Subscribe => "Subscribe",
            Self::Pin => "Pin",
            Self::Moderate => "Moderate",
            Self::Unmoderated => "Unmoderated",
        }
    }

    /// Full scope string, e.g. `forum:create-post`.
    pub fn scope(self) -> String {
        format!("{FORUM_NAMESPACE}:{}", self.suffix())
    }
}

/// Decides whether `user` (None for anonymous callers) holds `scope` in `permissions`.
///
/// Never cached: role membership may change between calls.
pub fn has_permission(site: &Site, user: Option<&User>, permissions: &[Permission], scope: &str) -> bool {
    if let Some(user) = user {
        if user.is_super_user || user.is_in_role(site.administrator_role_id) {
            return true;
        }
        if !(user.is_approved && user.is_verified) {
            return false;
        }
    }

    permissions.iter().any(|p| {
        p.scope == scope && p.allow_access && !p.is_disabled && role_matches(p.role_id, user)
    })
}

fn role_matches(role_id: Uuid, user: Option<&User>) -> bool {
    if role_id == ALL_USERS_ROLE_ID {
        return true;
    }
    if role_id == REGISTERED_USERS_ROLE_ID {
        return user.is_some();
    }
    if role_id == UNAUTHENTICATED_ROLE_ID {
        return user.is_none();
    }
    user.is_some_and(|u| u.is_in_role(role_id))
}

/// Holds the forum-namespace permission types and completes permission sets against them.
#[derive(Debug, Clone)]
pub struct PermissionResolver {
    types: Vec<PermissionType>,
}

impl PermissionResolver {
    /// Loads stored permission types, registering any catalogue scope that is missing.
    pub async fn load<S>(store: &S) -> anyhow::Result<Self>
    where
        S: PermissionStore + ?Sized,
    {
        let mut stored = store.list_permission_types().await?;

        for (order, scope) in ForumScope::ALL.iter().enumerate() {
            let scope_name = scope.scope();
            if stored.iter().any(|t| t.scope == scope_name) {
                continue;
            }
            let permission_type = PermissionType {
                id: Uuid::new_v4(),
                name: scope.display_name().to_string(),
                sort_order: order as i32,
                scope: scope_name,
            };
            store.add_permission_type(&permission_type).await?;
            info!("Registered permission type {}", permission_type.scope);
            stored.push(permission_type);
        }

        Ok(Self::from_types(stored))
    }

    /// Keeps only forum-namespace types from `types`.
    pub fn from_types(types: Vec<PermissionType>) -> Self {
        let prefix = format!("{FORUM_NAMESPACE}:");
        let mut types: Vec<PermissionType> = types
            .into_iter()
            .filter(|t| t.scope.starts_with(&prefix))
            .collect();
        types.sort_by_key(|t| t.sort_order);
        Self { types }
    }

    pub fn permission_types(&self) -> &[PermissionType] {
        &self.types
    }

    pub fn permission_type(&self, scope: ForumScope) -> Option<&PermissionType> {
        let scope = scope.scope();
        self.types.iter().find(|t| t.scope == scope)
    }

    /// Adds a denied row for every (role, type) pair missing from the holder's set.
    /// Idempotent.
    pub fn complete_permissions<H>(&self, holder: &mut H)
    where
        H: PermissionHolder + ?Sized,
    {
        let entity_id = holder.entity_id();
        let mut roles: Vec<Uuid> = Vec::new();
        let mut present: HashSet<(Uuid, Uuid)> = HashSet::new();
        for p in holder.permissions() {
            if !roles.contains(&p.role_id) {
                roles.push(p.role_id);
            }
            present.insert((p.role_id, p.permission_type_id));
        }

        let mut added = 0usize;
        let rows = holder.permissions_mut();
        for role_id in roles {
            for permission_type in &self.types {
                if !present.contains(&(role_id, permission_type.id)) {
                    rows.push(Permission::denied(entity_id, permission_type, role_id));
                    added += 1;
                }
            }
        }

        if added > 0 {
            debug!(%entity_id, added, "completed permission matrix");
        }
    }

    /// Gives `role_id` a denied row for every known type it does not already have.
    /// Nothing is persisted until the holder is saved.
    pub fn create_permissions<H>(&self, holder: &mut H, role_id: Uuid)
    where
        H: PermissionHolder + ?Sized,
    {
        let entity_id = holder.entity_id();
        let existing: HashSet<Uuid> = holder
            .permissions()
            .iter()
            .filter(|p| p.role_id == role_id)
            .map(|p| p.permission_type_id)
            .collect();

        let rows = holder.permissions_mut();
        for permission_type in &self.types {
            if !existing.contains(&permission_type.id) {
                rows.push(Permission::denied(entity_id, permission_type, role_id));
            }
        }
    }
}

/// Changes needed to bring the stored rows in line with an in-memory set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PermissionDelta {
    pub insert: Vec<Permission>,
    pub update: Vec<Permission>,
    pub delete: Vec<Uuid>,
}

impl PermissionDelta {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

pub fn diff_permissions(persisted: &[Permission], current: &[Permission]) -> PermissionDelta {
    let stored: HashMap<Uuid, &Permission> = persisted
        .iter()
        .filter_map(|p| p.id.map(|id| (id, p)))
        .collect();

    let mut delta = PermissionDelta::default();
    let mut kept: HashSet<Uuid> = HashSet::new();

    for row in current {
        match row.id.and_then(|id| stored.get(&id).map(|old| (id, old))) {
            Some((id, old)) => {
                kept.insert(id);
                if old.allow_access != row.allow_access
                    || old.is_disabled != row.is_disabled
                    || old.role_id != row.role_id
                    || old.permission_type_id != row.permission_type_id
                {
                    delta.update.push(row.clone());
                }
            }
            None => delta.insert.push(row.clone()),
        }
    }

    delta.delete = stored.keys().filter(|id| !kept.contains(id)).copied().collect();
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::Forum;

    fn catalogue() -> Vec<PermissionType> {
        ForumScope::ALL
            .iter()
            .enumerate()
            .map(|(i, s)| PermissionType {
                id: Uuid::new_v4(),
                name: s.display_name().into(),
                sort_order: i as i32,
                scope: s.scope(),
            })
            .collect()
    }

    fn site() -> Site {
        Site {
            id: Uuid::new_v4(),
            name: "test".into(),
            administrator_role_id: Uuid::new_v4(),
        }
    }

    fn member(role: Uuid) -> User {
        User {
            id: Uuid::new_v4(),
            username: "member".into(),
            is_approved: true,
            is_verified: true,
            roles: vec![role],
            ..Default::default()
        }
    }

    fn allow(resolver: &PermissionResolver, entity: Uuid, scope: ForumScope, role: Uuid) -> Permission {
        let mut p = Permission::denied(entity, resolver.permission_type(scope).unwrap(), role);
        p.allow_access = true;
        p
    }

    #[test]
    fn test_completion_fills_missing_scopes_as_denied() {
        let resolver = PermissionResolver::from_types(catalogue());
        let role = Uuid::new_v4();
        let mut forum = Forum::new(Uuid::new_v4(), "f");
        forum.permissions.push(allow(&resolver, forum.id, ForumScope::View, role));

        resolver.complete_permissions(&mut forum);

        assert_eq!(forum.permissions.len(), ForumScope::ALL.len());
        let denied: Vec<&str> = forum
            .permissions
            .iter()
            .filter(|p| !p.allow_access)
            .map(|p| p.scope.as_str())
            .collect();
        assert_eq!(
            denied,
            vec![
                "forum:create-post",
                "forum:edit-post",
                "forum:reply",
                "forum:delete",
                "forum:lock",
                "forum:attach",
                "forum:subscribe",
                "forum:pin",
                "forum:moderate",
                "forum:unmoderated",
            ]
        );
        assert!(forum.permissions.iter().all(|p| p.entity_id == forum.id));
    }

    #[test]
    fn test_completion_is_idempotent() {
        let resolver = PermissionResolver::from_types(catalogue());
        let mut forum = Forum::new(Uuid::new_v4(), "f");
        forum.permissions.push(allow(&resolver, forum.id, ForumScope::View, Uuid::new_v4()));
        forum.permissions.push(allow(&resolver, forum.id, ForumScope::Reply, Uuid::new_v4()));

        resolver.complete_permissions(&mut forum);
        let once = forum.permissions.clone();
        resolver.complete_permissions(&mut forum);

        assert_eq!(forum.permissions, once);
        assert_eq!(once.len(), 2 * ForumScope::ALL.len());
    }

    #[test]
    fn test_foreign_namespace_types_are_ignored() {
        let mut types = catalogue();
        types.push(PermissionType {
            id: Uuid::new_v4(),
            name: "Edit Page".into(),
            sort_order: 0,
            scope: "page:edit".into(),
        });
        let resolver = PermissionResolver::from_types(types);
        assert_eq!(resolver.permission_types().len(), ForumScope::ALL.len());
    }

    #[test]
    fn test_administrators_always_pass() {
        let site = site();
        let mut admin = member(site.administrator_role_id);
        admin.is_approved = false;
        assert!(has_permission(&site, Some(&admin), &[], &ForumScope::Moderate.scope()));

        let root = User {
            is_super_user: true,
            ..Default::default()
        };
        assert!(has_permission(&site, Some(&root), &[], &ForumScope::Delete.scope()));
    }

    #[test]
    fn test_unapproved_or_unverified_users_are_denied() {
        let site = site();
        let resolver = PermissionResolver::from_types(catalogue());
        let rows = vec![allow(&resolver, Uuid::new_v4(), ForumScope::View, ALL_USERS_ROLE_ID)];

        let mut user = member(Uuid::new_v4());
        assert!(has_permission(&site, Some(&user), &rows, &ForumScope::View.scope()));

        user.is_verified = false;
        assert!(!has_permission(&site, Some(&user), &rows, &ForumScope::View.scope()));
    }

    #[test]
    fn test_well_known_roles() {
        let site = site();
        let resolver = PermissionResolver::from_types(catalogue());
        let entity = Uuid::new_v4();
        let view = ForumScope::View.scope();
        let user = member(Uuid::new_v4());

        let registered = vec![allow(&resolver, entity, ForumScope::View, REGISTERED_USERS_ROLE_ID)];
        assert!(has_permission(&site, Some(&user), &registered, &view));
        assert!(!has_permission(&site, None, &registered, &view));

        let anonymous = vec![allow(&resolver, entity, ForumScope::View, UNAUTHENTICATED_ROLE_ID)];
        assert!(has_permission(&site, None, &anonymous, &view));
        assert!(!has_permission(&site, Some(&user), &anonymous, &view));
    }

    #[test]
    fn test_scope_role_and_flags_must_all_match() {
        let site = site();
        let resolver = PermissionResolver::from_types(catalogue());
        let entity = Uuid::new_v4();
        let role = Uuid::new_v4();
        let user = member(role);

        let mut rows = vec![allow(&resolver, entity, ForumScope::Reply, role)];
        assert!(has_permission(&site, Some(&user), &rows, &ForumScope::Reply.scope()));
        assert!(!has_permission(&site, Some(&user), &rows, &ForumScope::Pin.scope()));

        rows[0].is_disabled = true;
        assert!(!has_permission(&site, Some(&user), &rows, &ForumScope::Reply.scope()));

        let other_role = vec![allow(&resolver, entity, ForumScope::Reply, Uuid::new_v4())];
        assert!(!has_permission(&site, Some(&user), &other_role, &ForumScope::Reply.scope()));
    }

    #[test]
    fn test_create_permissions_skips_existing_rows() {
        let resolver = PermissionResolver::from_types(catalogue());
        let role = Uuid::new_v4();
        let mut forum = Forum::new(Uuid::new_v4(), "f");
        forum.permissions.push(allow(&resolver, forum.id, ForumScope::View, role));

        resolver.create_permissions(&mut forum, role);

        assert_eq!(forum.permissions.len(), ForumScope::ALL.len());
        assert!(forum.permissions.iter().all(|p| p.id.is_none()));
    }

    #[test]
    fn test_diff_permissions() {
        let resolver = PermissionResolver::from_types(catalogue());
        let entity = Uuid::new_v4();
        let role = Uuid::new_v4();

        let mut kept = allow(&resolver, entity, ForumScope::View, role);
        kept.id = Some(Uuid::new_v4());
        let mut changed = allow(&resolver, entity, ForumScope::Reply, role);
        changed.id = Some(Uuid::new_v4());
        let mut removed = allow(&resolver, entity, ForumScope::Pin, role);
        removed.id = Some(Uuid::new_v4());
        let persisted = vec![kept.clone(), changed.clone(), removed.clone()];

        let mut flipped = changed.clone();
        flipped.allow_access = false;
        let fresh = Permission::denied(entity, resolver.permission_type(ForumScope::Lock).unwrap(), role);
        let current = vec![kept, flipped.clone(), fresh.clone()];

        let delta = diff_permissions(&persisted, &current);
        assert_eq!(delta.insert, vec![fresh]);
        assert_eq!(delta.update, vec![flipped]);
        assert_eq!(delta.delete, vec![removed.id.unwrap()]);
    }
}
