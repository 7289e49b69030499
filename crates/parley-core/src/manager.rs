//! Group and forum lifecycle.
//!
//! [`ForumCatalog`] is the shared read side: cached aggregate loads and
//! effective-settings resolution. [`ForumManager`] owns every mutation and
//! evicts cache entries only after the store write has succeeded.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::{
    Forum, Group, Permission, PermissionHolder, Post, Settings, Site, SubscriptionScope, User,
};

use crate::cache::{CacheKey, CachedObject, ObjectCache};
use crate::config::Config;
use crate::error::{ForumError, Result};
use crate::notify::EventBus;
use crate::permissions::{ForumScope, PermissionResolver, diff_permissions, has_permission};
use crate::ports::{FileStorage, Store};

/// Entity a permission check is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionTarget {
    Group(Uuid),
    Forum(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// A forum together with its parent group.
#[derive(Debug, Clone)]
pub struct ForumContext {
    pub group: Arc<Group>,
    pub forum: Arc<Forum>,
}

impl ForumContext {
    pub fn settings(&self) -> &Settings {
        self.forum.effective_settings(&self.group)
    }

    pub fn permissions(&self) -> &[Permission] {
        self.forum.effective_permissions(&self.group)
    }

    pub fn module_id(&self) -> Uuid {
        self.group.module_id
    }
}

pub struct ForumCatalog {
    store: Arc<dyn Store>,
    cache: ObjectCache,
    resolver: PermissionResolver,
}

impl ForumCatalog {
    pub fn new(store: Arc<dyn Store>, resolver: PermissionResolver) -> Self {
        Self {
            store,
            cache: ObjectCache::new(),
            resolver,
        }
    }

    /// Loads the permission-type catalogue, registering missing scopes.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self> {
        let resolver = PermissionResolver::load(store.as_ref()).await?;
        Ok(Self::new(store, resolver))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub(crate) async fn group_arc(&self, id: Uuid) -> Result<Option<Arc<Group>>> {
        let loaded = self
            .cache
            .get_or_load(CacheKey::Group(id), || async move {
                let Some(mut group) = self.store.get_group(id).await? else {
                    return Ok::<_, ForumError>(None);
                };
                group.permissions = self.store.list_permissions(id).await?;
                self.resolver.complete_permissions(&mut group);

                let mut forums = Vec::new();
                for row in self.store.list_forums(id).await? {
                    if let Some(forum) = self.forum_arc(row.id).await? {
                        forums.push(forum.as_ref().clone());
                    }
                }
                group.forums = forums;

                Ok(Some(CachedObject::Group(Arc::new(group))))
            })
            .await?;

        Ok(match loaded {
            Some(CachedObject::Group(group)) => Some(group),
            _ => None,
        })
    }

    pub(crate) async fn forum_arc(&self, id: Uuid) -> Result<Option<Arc<Forum>>> {
        let loaded = self
            .cache
            .get_or_load(CacheKey::Forum(id), || async move {
                let Some(mut forum) = self.store.get_forum(id).await? else {
                    return Ok::<_, ForumError>(None);
                };
                forum.permissions = self.store.list_permissions(id).await?;
                self.resolver.complete_permissions(&mut forum);
                Ok(Some(CachedObject::Forum(Arc::new(forum))))
            })
            .await?;

        Ok(match loaded {
            Some(CachedObject::Forum(forum)) => Some(forum),
            _ => None,
        })
    }

    pub async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        Ok(self.group_arc(id).await?.map(|g| g.as_ref().clone()))
    }

    pub async fn get_forum(&self, id: Uuid) -> Result<Option<Forum>> {
        Ok(self.forum_arc(id).await?.map(|f| f.as_ref().clone()))
    }

    pub async fn forum_context(&self, forum_id: Uuid) -> Result<Option<ForumContext>> {
        let Some(forum) = self.forum_arc(forum_id).await? else {
            return Ok(None);
        };
        let Some(group) = self.group_arc(forum.group_id).await? else {
            return Ok(None);
        };
        Ok(Some(ForumContext { group, forum }))
    }

    /// Loads a post straight from the store along with its forum context.
    pub async fn post_context(&self, post_id: Uuid) -> Result<Option<(Post, ForumContext)>> {
        let Some(post) = self.store.get_post(post_id).await? else {
            return Ok(None);
        };
        Ok(self.forum_context(post.forum_id).await?.map(|ctx| (post, ctx)))
    }

    pub fn evict_group(&self, group_id: Uuid) {
        self.cache.invalidate(&CacheKey::Group(group_id));
    }

    /// Evicts a forum and the parent group holding its aggregated copy.
    pub fn evict_forum(&self, forum_id: Uuid, group_id: Uuid) {
        self.cache.invalidate(&CacheKey::Forum(forum_id));
        self.cache.invalidate(&CacheKey::Group(group_id));
    }
}

pub struct ForumManager {
    pub(crate) catalog: Arc<ForumCatalog>,
    pub(crate) files: Arc<dyn FileStorage>,
    pub(crate) events: EventBus,
    pub(crate) reply_depth_limit: usize,
}

impl ForumManager {
    pub fn new(catalog: Arc<ForumCatalog>, files: Arc<dyn FileStorage>, events: EventBus, config: &Config) -> Self {
        Self {
            catalog,
            files,
            events,
            reply_depth_limit: config.reply_depth_limit,
        }
    }

    pub fn catalog(&self) -> &Arc<ForumCatalog> {
        &self.catalog
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.catalog.store()
    }

    // -- Reads --

    pub async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        self.catalog.get_group(id).await
    }

    pub async fn get_forum(&self, id: Uuid) -> Result<Option<Forum>> {
        self.catalog.get_forum(id).await
    }

    /// All groups of a module with their forums, unfiltered.
    pub async fn list_groups(&self, module_id: Uuid) -> Result<Vec<Group>> {
        let mut groups = Vec::new();
        for row in self.store().list_groups(module_id).await? {
            if let Some(group) = self.catalog.get_group(row.id).await? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Groups of a module holding only the forums `user` may view.
    ///
    /// Fails with [`ForumError::Unauthorized`] when the module has forums but
    /// none are viewable, so callers can tell "nothing here" from "not allowed".
    pub async fn list_viewable_groups(&self, site: &Site, user: Option<&User>, module_id: Uuid) -> Result<Vec<Group>> {
        let view = ForumScope::View.scope();
        let mut total = 0usize;
        let mut visible = Vec::new();

        for mut group in self.list_groups(module_id).await? {
            let forums = std::mem::take(&mut group.forums);
            total += forums.len();
            let kept: Vec<Forum> = forums
                .into_iter()
                .filter(|f| has_permission(site, user, f.effective_permissions(&group), &view))
                .collect();
            if !kept.is_empty() {
                group.forums = kept;
                visible.push(group);
            }
        }

        if total > 0 && visible.is_empty() {
            debug!(%module_id, "no viewable forums for caller");
            return Err(ForumError::Unauthorized);
        }
        Ok(visible)
    }

    pub async fn check_permission(
        &self,
        site: &Site,
        user: Option<&User>,
        target: PermissionTarget,
        scope: ForumScope,
    ) -> Result<bool> {
        let scope = scope.scope();
        Ok(match target {
            PermissionTarget::Group(id) => match self.catalog.group_arc(id).await? {
                Some(group) => has_permission(site, user, &group.permissions, &scope),
                None => false,
            },
            PermissionTarget::Forum(id) => match self.catalog.forum_context(id).await? {
                Some(ctx) => has_permission(site, user, ctx.permissions(), &scope),
                None => false,
            },
        })
    }

    /// Appends denied rows for `role_id`. Call `save_group`/`save_forum` to persist them.
    pub fn create_permissions<H>(&self, holder: &mut H, role_id: Uuid)
    where
        H: PermissionHolder + ?Sized,
    {
        self.catalog.resolver().create_permissions(holder, role_id);
    }

    // -- Groups --

    pub async fn save_group(&self, group: &mut Group) -> Result<()> {
        if group.name.trim().is_empty() {
            return Err(ForumError::Validation("group name is required".into()));
        }

        let siblings = self.store().list_groups(group.module_id).await?;
        let is_new = !siblings.iter().any(|g| g.id == group.id);
        if is_new && group.sort_order == 0 {
            group.sort_order = next_sort_order(siblings.iter().map(|g| g.sort_order));
        }

        self.store().save_group(group).await?;
        self.save_permissions(group.id, &mut group.permissions).await?;
        self.catalog.evict_group(group.id);

        info!("Saved group {} ({})", group.id, group.name);
        Ok(())
    }

    /// Removes a group, every forum in it, and their permission rows.
    pub async fn delete_group(&self, site: &Site, id: Uuid) -> Result<()> {
        if self.store().get_group(id).await?.is_none() {
            return Ok(());
        }

        for forum in self.store().list_forums(id).await? {
            self.delete_forum(site, forum.id).await?;
        }
        self.store().delete_entity_subscriptions(SubscriptionScope::Group, id).await?;
        self.store().delete_permissions(id).await?;
        self.store().delete_group(id).await?;
        self.catalog.evict_group(id);

        info!("Deleted group {}", id);
        Ok(())
    }

    pub async fn move_group_up(&self, id: Uuid) -> Result<bool> {
        self.move_group(id, MoveDirection::Up).await
    }

    pub async fn move_group_down(&self, id: Uuid) -> Result<bool> {
        self.move_group(id, MoveDirection::Down).await
    }

    async fn move_group(&self, id: Uuid, direction: MoveDirection) -> Result<bool> {
        let Some(group) = self.store().get_group(id).await? else {
            return Ok(false);
        };
        let mut orders = self.check_group_numbering(group.module_id).await?;

        let Some(swapped) = swap_adjacent(&mut orders, id, direction) else {
            return Ok(false);
        };
        for (group_id, sort_order) in swapped {
            self.store().update_group_sort_order(group_id, sort_order).await?;
            self.catalog.evict_group(group_id);
        }
        Ok(true)
    }

    /// Renumbers a module's groups to 10, 20, 30... when gaps or duplicates exist.
    /// Returns the (id, sort order) pairs in display order.
    pub async fn check_group_numbering(&self, module_id: Uuid) -> Result<Vec<(Uuid, i32)>> {
        let mut orders: Vec<(Uuid, i32)> = self
            .store()
            .list_groups(module_id)
            .await?
            .iter()
            .map(|g| (g.id, g.sort_order))
            .collect();

        for (group_id, sort_order) in renumber(&mut orders) {
            self.store().update_group_sort_order(group_id, sort_order).await?;
            self.catalog.evict_group(group_id);
        }
        Ok(orders)
    }

    // -- Forums --

    pub async fn save_forum(&self, forum: &mut Forum) -> Result<()> {
        if forum.name.trim().is_empty() {
            return Err(ForumError::Validation("forum name is required".into()));
        }
        if self.store().get_group(forum.group_id).await?.is_none() {
            return Err(ForumError::not_found("group", forum.group_id));
        }

        let siblings = self.store().list_forums(forum.group_id).await?;
        let is_new = !siblings.iter().any(|f| f.id == forum.id);
        if is_new && forum.sort_order == 0 {
            forum.sort_order = next_sort_order(siblings.iter().map(|f| f.sort_order));
        }

        self.store().save_forum(forum).await?;
        self.save_permissions(forum.id, &mut forum.permissions).await?;
        self.catalog.evict_forum(forum.id, forum.group_id);

        info!("Saved forum {} ({})", forum.id, forum.name);
        Ok(())
    }

    /// Removes a forum: posts (attachments first), subscriptions, permission
    /// rows, then the forum row itself.
    pub async fn delete_forum(&self, site: &Site, id: Uuid) -> Result<()> {
        let Some(forum) = self.store().get_forum(id).await? else {
            return Ok(());
        };

        for post in self.store().list_posts(id).await? {
            self.remove_post(site, &post).await?;
        }
        self.store().delete_entity_subscriptions(SubscriptionScope::Forum, id).await?;
        self.store().delete_permissions(id).await?;
        self.store().delete_forum(id).await?;
        self.catalog.evict_forum(id, forum.group_id);

        info!("Deleted forum {}", id);
        Ok(())
    }

    pub async fn move_forum_up(&self, id: Uuid) -> Result<bool> {
        self.move_forum(id, MoveDirection::Up).await
    }

    pub async fn move_forum_down(&self, id: Uuid) -> Result<bool> {
        self.move_forum(id, MoveDirection::Down).await
    }

    async fn move_forum(&self, id: Uuid, direction: MoveDirection) -> Result<bool> {
        let Some(forum) = self.store().get_forum(id).await? else {
            return Ok(false);
        };
        let mut orders = self.check_forum_numbering(forum.group_id).await?;

        let Some(swapped) = swap_adjacent(&mut orders, id, direction) else {
            return Ok(false);
        };
        for (forum_id, sort_order) in swapped {
            self.store().update_forum_sort_order(forum_id, sort_order).await?;
            self.catalog.evict_forum(forum_id, forum.group_id);
        }
        Ok(true)
    }

    /// Renumbers a group's forums to 10, 20, 30... when gaps or duplicates exist.
    pub async fn check_forum_numbering(&self, group_id: Uuid) -> Result<Vec<(Uuid, i32)>> {
        let mut orders: Vec<(Uuid, i32)> = self
            .store()
            .list_forums(group_id)
            .await?
            .iter()
            .map(|f| (f.id, f.sort_order))
            .collect();

        for (forum_id, sort_order) in renumber(&mut orders) {
            self.store().update_forum_sort_order(forum_id, sort_order).await?;
            self.catalog.evict_forum(forum_id, group_id);
        }
        Ok(orders)
    }

    // -- Permission persistence --

    /// Writes the difference between the stored rows and `rows`, assigning ids to new rows.
    async fn save_permissions(&self, entity_id: Uuid, rows: &mut [Permission]) -> Result<()> {
        for row in rows.iter_mut() {
            row.entity_id = entity_id;
        }

        let persisted = self.store().list_permissions(entity_id).await?;
        let delta = diff_permissions(&persisted, rows);
        if delta.is_empty() {
            return Ok(());
        }

        for row in rows.iter_mut() {
            if row.id.is_none() {
                row.id = Some(Uuid::new_v4());
                self.store().save_permission(row).await?;
            }
        }
        for row in delta.insert.iter().filter(|r| r.id.is_some()) {
            self.store().save_permission(row).await?;
        }
        for row in &delta.update {
            self.store().save_permission(row).await?;
        }
        for id in &delta.delete {
            self.store().delete_permission(*id).await?;
        }

        debug!(
            %entity_id,
            inserted = delta.insert.len(),
            updated = delta.update.len(),
            deleted = delta.delete.len(),
            "saved permission delta"
        );
        Ok(())
    }
}

const SORT_STEP: i32 = 10;

fn next_sort_order(existing: impl Iterator<Item = i32>) -> i32 {
    existing.max().unwrap_or(0).max(0) / SORT_STEP * SORT_STEP + SORT_STEP
}

/// Rewrites `orders` (already in display order) to multiples of ten when they
/// are not exactly 10, 20, 30... Returns only the entries that changed.
pub fn renumber(orders: &mut [(Uuid, i32)]) -> Vec<(Uuid, i32)> {
    let mut changed = Vec::new();
    for (index, (id, sort_order)) in orders.iter_mut().enumerate() {
        let expected = (index as i32 + 1) * SORT_STEP;
        if *sort_order != expected {
            *sort_order = expected;
            changed.push((*id, expected));
        }
    }
    changed
}

/// Swaps the sort order of `id` with its neighbour. `None` at either end.
pub fn swap_adjacent(orders: &mut [(Uuid, i32)], id: Uuid, direction: MoveDirection) -> Option<[(Uuid, i32); 2]> {
    let index = orders.iter().position(|(candidate, _)| *candidate == id)?;
    let neighbour = match direction {
        MoveDirection::Up => index.checked_sub(1)?,
        MoveDirection::Down => Some(index + 1).filter(|n| *n < orders.len())?,
    };

    let (a, b) = (orders[index].1, orders[neighbour].1);
    orders[index].1 = b;
    orders[neighbour].1 = a;
    orders.swap(index, neighbour);
    Some([(orders[neighbour].0, b), (orders[index].0, a)])
}
