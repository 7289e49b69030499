//! Async port implementations over [`Database`].
//!
//! Every call runs its query on the blocking pool; the connection lock is
//! taken and released inside that closure.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_core::ports::{Directory, ForumStore, MailQueueStore, PermissionStore, PostStore, SubscriptionStore};
use parley_types::models::{
    Attachment, AttachmentOwner, Forum, Group, MailQueueItem, Permission, PermissionType, Post, PostTracking, Reply,
    Role, Subscription, SubscriptionScope, User,
};

use crate::Database;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open(path)?)))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    /// Direct access for directory seeding and maintenance.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("spawn_blocking join error")?
    }
}

#[async_trait]
impl ForumStore for SqliteStore {
    async fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        self.run(move |db| db.get_group(id)).await
    }

    async fn list_groups(&self, module_id: Uuid) -> Result<Vec<Group>> {
        self.run(move |db| db.list_groups(module_id)).await
    }

    async fn save_group(&self, group: &Group) -> Result<()> {
        let group = group.clone();
        self.run(move |db| db.save_group(&group)).await
    }

    async fn update_group_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()> {
        self.run(move |db| db.update_group_sort_order(id, sort_order)).await
    }

    async fn delete_group(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_group(id)).await
    }

    async fn get_forum(&self, id: Uuid) -> Result<Option<Forum>> {
        self.run(move |db| db.get_forum(id)).await
    }

    async fn list_forums(&self, group_id: Uuid) -> Result<Vec<Forum>> {
        self.run(move |db| db.list_forums(group_id)).await
    }

    async fn save_forum(&self, forum: &Forum) -> Result<()> {
        let forum = forum.clone();
        self.run(move |db| db.save_forum(&forum)).await
    }

    async fn update_forum_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()> {
        self.run(move |db| db.update_forum_sort_order(id, sort_order)).await
    }

    async fn delete_forum(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_forum(id)).await
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        self.run(move |db| db.get_post(id)).await
    }

    async fn list_posts(&self, forum_id: Uuid) -> Result<Vec<Post>> {
        self.run(move |db| db.list_posts(forum_id)).await
    }

    async fn save_post(&self, post: &Post) -> Result<()> {
        let post = post.clone();
        self.run(move |db| db.save_post(&post)).await
    }

    async fn delete_post(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_post(id)).await
    }

    async fn set_post_approved(&self, id: Uuid, approved: bool) -> Result<()> {
        self.run(move |db| db.set_post_approved(id, approved)).await
    }

    async fn set_post_rejected(&self, id: Uuid, rejected: bool) -> Result<()> {
        self.run(move |db| db.set_post_rejected(id, rejected)).await
    }

    async fn set_post_pinned(&self, id: Uuid, pinned: bool) -> Result<()> {
        self.run(move |db| db.set_post_pinned(id, pinned)).await
    }

    async fn set_post_locked(&self, id: Uuid, locked: bool) -> Result<()> {
        self.run(move |db| db.set_post_locked(id, locked)).await
    }

    async fn set_post_status(&self, id: Uuid, status_id: Option<Uuid>) -> Result<()> {
        self.run(move |db| db.set_post_status(id, status_id)).await
    }

    async fn get_reply(&self, id: Uuid) -> Result<Option<Reply>> {
        self.run(move |db| db.get_reply(id)).await
    }

    async fn list_replies(&self, post_id: Uuid) -> Result<Vec<Reply>> {
        self.run(move |db| db.list_replies(post_id)).await
    }

    async fn save_reply(&self, reply: &Reply) -> Result<()> {
        let reply = reply.clone();
        self.run(move |db| db.save_reply(&reply)).await
    }

    async fn delete_reply(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_reply(id)).await
    }

    async fn set_reply_approved(&self, id: Uuid, approved: bool) -> Result<()> {
        self.run(move |db| db.set_reply_approved(id, approved)).await
    }

    async fn set_reply_rejected(&self, id: Uuid, rejected: bool) -> Result<()> {
        self.run(move |db| db.set_reply_rejected(id, rejected)).await
    }

    async fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>> {
        self.run(move |db| db.get_attachment(id)).await
    }

    async fn list_attachments(&self, owner: AttachmentOwner) -> Result<Vec<Attachment>> {
        self.run(move |db| db.list_attachments(owner)).await
    }

    async fn save_attachment(&self, attachment: &Attachment) -> Result<()> {
        let attachment = attachment.clone();
        self.run(move |db| db.save_attachment(&attachment)).await
    }

    async fn delete_attachment(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_attachment(id)).await
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn get_subscription(
        &self,
        scope: SubscriptionScope,
        entity_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>> {
        self.run(move |db| db.get_subscription(scope, entity_id, user_id)).await
    }

    async fn list_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<Vec<Subscription>> {
        self.run(move |db| db.list_subscriptions(scope, entity_id)).await
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        let subscription = subscription.clone();
        self.run(move |db| db.subscribe(&subscription)).await
    }

    async fn unsubscribe(&self, scope: SubscriptionScope, entity_id: Uuid, user_id: Uuid) -> Result<()> {
        self.run(move |db| db.unsubscribe(scope, entity_id, user_id)).await
    }

    async fn delete_entity_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_entity_subscriptions(scope, entity_id)).await
    }

    async fn list_user_subscriptions(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        self.run(move |db| db.list_user_subscriptions(user_id)).await
    }

    async fn get_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<PostTracking>> {
        self.run(move |db| db.get_post_tracking(post_id, user_id)).await
    }

    async fn save_post_tracking(&self, tracking: &PostTracking) -> Result<()> {
        let tracking = tracking.clone();
        self.run(move |db| db.save_post_tracking(&tracking)).await
    }

    async fn delete_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_post_tracking(post_id, user_id)).await
    }
}

#[async_trait]
impl MailQueueStore for SqliteStore {
    async fn is_mail_queued(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        reply_id: Option<Uuid>,
        template_id: Uuid,
    ) -> Result<bool> {
        self.run(move |db| db.is_mail_queued(user_id, post_id, reply_id, template_id))
            .await
    }

    async fn save_mail_queue(&self, item: &MailQueueItem) -> Result<bool> {
        let item = item.clone();
        self.run(move |db| db.save_mail_queue(&item)).await
    }

    async fn list_unsent_mail_queue(&self) -> Result<Vec<MailQueueItem>> {
        self.run(|db| db.list_unsent_mail_queue()).await
    }

    async fn set_mail_queue_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<()> {
        let ids = ids.to_vec();
        self.run(move |db| db.set_mail_queue_sent(&ids, sent_at)).await
    }

    async fn truncate_mail_queue(&self, sent_before: DateTime<Utc>) -> Result<usize> {
        self.run(move |db| db.truncate_mail_queue(sent_before)).await
    }
}

#[async_trait]
impl PermissionStore for SqliteStore {
    async fn list_permission_types(&self) -> Result<Vec<PermissionType>> {
        self.run(|db| db.list_permission_types()).await
    }

    async fn add_permission_type(&self, permission_type: &PermissionType) -> Result<()> {
        let permission_type = permission_type.clone();
        self.run(move |db| db.add_permission_type(&permission_type)).await
    }

    async fn list_permissions(&self, entity_id: Uuid) -> Result<Vec<Permission>> {
        self.run(move |db| db.list_permissions(entity_id)).await
    }

    async fn save_permission(&self, permission: &Permission) -> Result<()> {
        let permission = permission.clone();
        self.run(move |db| db.save_permission(&permission)).await
    }

    async fn delete_permission(&self, id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_permission(id)).await
    }

    async fn delete_permissions(&self, entity_id: Uuid) -> Result<()> {
        self.run(move |db| db.delete_permissions(entity_id)).await
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.run(move |db| db.get_user(id)).await
    }

    async fn get_role(&self, id: Uuid) -> Result<Option<Role>> {
        self.run(move |db| db.get_role(id)).await
    }

    async fn list_users_in_role(&self, role_id: Uuid) -> Result<Vec<User>> {
        self.run(move |db| db.list_users_in_role(role_id)).await
    }
}
