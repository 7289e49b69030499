//! Collaborator interfaces consumed by the engine.
//!
//! The store traits are implemented by `parley-db`; the file-storage and
//! mail collaborators are wired by the binary.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::mail::{DigestPayload, MailTemplate};
use parley_types::models::{
    Attachment, AttachmentOwner, Forum, Group, MailQueueItem, Permission, PermissionType, Post,
    PostTracking, Reply, Role, Subscription, SubscriptionScope, User,
};

/// Group and forum rows. Loads return bare rows: no permissions, no nested forums.
#[async_trait]
pub trait ForumStore: Send + Sync {
    async fn get_group(&self, id: Uuid) -> Result<Option<Group>>;
    /// Groups of a module ordered by sort order.
    async fn list_groups(&self, module_id: Uuid) -> Result<Vec<Group>>;
    /// Insert or update.
    async fn save_group(&self, group: &Group) -> Result<()>;
    async fn update_group_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()>;
    async fn delete_group(&self, id: Uuid) -> Result<()>;

    /// Loads a forum with freshly computed statistics.
    async fn get_forum(&self, id: Uuid) -> Result<Option<Forum>>;
    /// Forums of a group ordered by sort order.
    async fn list_forums(&self, group_id: Uuid) -> Result<Vec<Forum>>;
    async fn save_forum(&self, forum: &Forum) -> Result<()>;
    async fn update_forum_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()>;
    async fn delete_forum(&self, id: Uuid) -> Result<()>;
}

/// Posts, replies, and their attachments.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post(&self, id: Uuid) -> Result<Option<Post>>;
    /// Every post in a forum, pinned first, then newest first.
    async fn list_posts(&self, forum_id: Uuid) -> Result<Vec<Post>>;
    async fn save_post(&self, post: &Post) -> Result<()>;
    async fn delete_post(&self, id: Uuid) -> Result<()>;
    /// Setting approved clears rejected in the same statement.
    async fn set_post_approved(&self, id: Uuid, approved: bool) -> Result<()>;
    /// Setting rejected clears approved in the same statement.
    async fn set_post_rejected(&self, id: Uuid, rejected: bool) -> Result<()>;
    async fn set_post_pinned(&self, id: Uuid, pinned: bool) -> Result<()>;
    async fn set_post_locked(&self, id: Uuid, locked: bool) -> Result<()>;
    async fn set_post_status(&self, id: Uuid, status_id: Option<Uuid>) -> Result<()>;

    async fn get_reply(&self, id: Uuid) -> Result<Option<Reply>>;
    /// Every reply to a post, oldest first.
    async fn list_replies(&self, post_id: Uuid) -> Result<Vec<Reply>>;
    async fn save_reply(&self, reply: &Reply) -> Result<()>;
    async fn delete_reply(&self, id: Uuid) -> Result<()>;
    async fn set_reply_approved(&self, id: Uuid, approved: bool) -> Result<()>;
    async fn set_reply_rejected(&self, id: Uuid, rejected: bool) -> Result<()>;

    async fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>>;
    async fn list_attachments(&self, owner: AttachmentOwner) -> Result<Vec<Attachment>>;
    async fn save_attachment(&self, attachment: &Attachment) -> Result<()>;
    async fn delete_attachment(&self, id: Uuid) -> Result<()>;
}

/// Subscriptions at every scope plus display-only post tracking.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(
        &self,
        scope: SubscriptionScope,
        entity_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>>;
    async fn list_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<Vec<Subscription>>;
    /// Insert, or update the frequency of an existing row.
    async fn subscribe(&self, subscription: &Subscription) -> Result<()>;
    async fn unsubscribe(&self, scope: SubscriptionScope, entity_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn delete_entity_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<()>;
    async fn list_user_subscriptions(&self, user_id: Uuid) -> Result<Vec<Subscription>>;

    async fn get_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<PostTracking>>;
    async fn save_post_tracking(&self, tracking: &PostTracking) -> Result<()>;
    async fn delete_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MailQueueStore: Send + Sync {
    /// Whether an unsent row exists for (user, post, reply, template).
    async fn is_mail_queued(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        reply_id: Option<Uuid>,
        template_id: Uuid,
    ) -> Result<bool>;
    /// Inserts unless an unsent row with the same key exists. Returns whether a row was written.
    async fn save_mail_queue(&self, item: &MailQueueItem) -> Result<bool>;
    async fn list_unsent_mail_queue(&self) -> Result<Vec<MailQueueItem>>;
    async fn set_mail_queue_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<()>;
    /// Deletes sent rows older than `sent_before`. Returns the number removed.
    async fn truncate_mail_queue(&self, sent_before: DateTime<Utc>) -> Result<usize>;
}

/// Permission collaborator.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn list_permission_types(&self) -> Result<Vec<PermissionType>>;
    async fn add_permission_type(&self, permission_type: &PermissionType) -> Result<()>;
    async fn list_permissions(&self, entity_id: Uuid) -> Result<Vec<Permission>>;
    /// Upsert by id. Rows without an id are rejected.
    async fn save_permission(&self, permission: &Permission) -> Result<()>;
    async fn delete_permission(&self, id: Uuid) -> Result<()>;
    async fn delete_permissions(&self, entity_id: Uuid) -> Result<()>;
}

/// User and role collaborator. Read-only reference data.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    async fn get_role(&self, id: Uuid) -> Result<Option<Role>>;
    async fn list_users_in_role(&self, role_id: Uuid) -> Result<Vec<User>>;
}

/// Everything the engine reads and writes through a single provider.
pub trait Store: ForumStore + PostStore + SubscriptionStore + MailQueueStore + PermissionStore + Directory {}

impl<T> Store for T where
    T: ForumStore + PostStore + SubscriptionStore + MailQueueStore + PermissionStore + Directory
{
}

/// File-storage collaborator, addressed by (site, provider key, path).
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn save_file(&self, site_id: Uuid, provider_key: &str, path: &str, data: &[u8]) -> Result<()>;
    async fn get_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> Result<()>;
}

/// Mail collaborator.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn resolve_template(&self, template_id: Uuid) -> Result<Option<MailTemplate>>;
    async fn send(&self, template: &MailTemplate, payload: &DigestPayload, address: &str) -> Result<()>;
}
