//! Post and reply lifecycle.
//!
//! Approval is decided once, at creation: content is approved when the forum
//! is unmoderated or the author holds `moderate`. Pinned and locked are
//! independent flags. Callers check permissions before invoking a mutation;
//! every successful mutation evicts the owning forum so its statistics are
//! recomputed on the next read.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::ForumEvent;
use parley_types::models::{Attachment, AttachmentOwner, Post, Reply, Site, SubscriptionScope, User};

use crate::error::{ForumError, Result};
use crate::manager::{ForumContext, ForumManager};
use crate::permissions::{ForumScope, has_permission};

/// Provider key under which attachment files are stored.
pub const ATTACHMENT_PROVIDER: &str = "attachments";
const DEFAULT_ATTACHMENTS_FOLDER: &str = "forum";
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadedReply {
    pub reply: Reply,
    pub depth: usize,
}

impl ForumManager {
    // -- Posts --

    pub async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        Ok(self.store().get_post(id).await?)
    }

    /// Approved posts only.
    pub async fn list_posts(&self, forum_id: Uuid) -> Result<Vec<Post>> {
        let posts = self.store().list_posts(forum_id).await?;
        Ok(posts.into_iter().filter(|p| p.is_approved).collect())
    }

    /// Approved posts plus the viewer's own unapproved ones.
    pub async fn list_posts_for_user(&self, forum_id: Uuid, user_id: Uuid) -> Result<Vec<Post>> {
        let posts = self.store().list_posts(forum_id).await?;
        Ok(posts
            .into_iter()
            .filter(|p| p.is_approved || p.author_id == user_id)
            .collect())
    }

    /// Posts waiting for a moderator: neither approved nor rejected.
    pub async fn list_pending_posts(&self, forum_id: Uuid) -> Result<Vec<Post>> {
        let posts = self.store().list_posts(forum_id).await?;
        Ok(posts
            .into_iter()
            .filter(|p| !p.is_approved && !p.is_rejected)
            .collect())
    }

    /// Creates a post authored by `user`. Attachments are added afterwards
    /// with [`ForumManager::add_attachment`].
    pub async fn create_post(&self, site: &Site, user: &User, mut post: Post) -> Result<Post> {
        if post.subject.trim().is_empty() {
            return Err(ForumError::Validation("post subject is required".into()));
        }
        let ctx = self
            .catalog
            .forum_context(post.forum_id)
            .await?
            .ok_or_else(|| ForumError::not_found("forum", post.forum_id))?;

        let now = Utc::now();
        post.author_id = user.id;
        post.is_approved = self.approved_on_creation(site, user, &ctx);
        post.is_rejected = false;
        post.created_at = now;
        post.updated_at = now;
        post.attachments.clear();

        self.store().save_post(&post).await?;
        self.catalog.evict_forum(ctx.forum.id, ctx.group.id);

        if has_permission(site, Some(user), ctx.permissions(), &ForumScope::Subscribe.scope()) {
            self.auto_subscribe(user.id, &ctx, post.id).await?;
        }

        info!(
            "Post {} created in forum {} (approved: {})",
            post.id, post.forum_id, post.is_approved
        );
        self.raise(ForumEvent::PostCreate {
            module_id: ctx.module_id(),
            post: post.clone(),
        })
        .await;
        Ok(post)
    }

    /// Saves edits to subject, body, and status. Moderation flags, forum, and
    /// author are kept from the stored row.
    pub async fn save_post(&self, post: &mut Post) -> Result<()> {
        let existing = self
            .store()
            .get_post(post.id)
            .await?
            .ok_or_else(|| ForumError::not_found("post", post.id))?;
        if post.subject.trim().is_empty() {
            return Err(ForumError::Validation("post subject is required".into()));
        }

        post.forum_id = existing.forum_id;
        post.author_id = existing.author_id;
        post.created_at = existing.created_at;
        post.is_approved = existing.is_approved;
        post.is_rejected = existing.is_rejected;
        post.is_pinned = existing.is_pinned;
        post.is_locked = existing.is_locked;
        post.attachments = existing.attachments;
        post.updated_at = Utc::now();

        self.store().save_post(post).await?;
        self.evict_for_forum(post.forum_id).await?;
        Ok(())
    }

    /// Sets the approved flag; approving also clears rejected.
    /// Raises `Post.Approved` only when the post was not approved before.
    pub async fn approve_post(&self, id: Uuid, approved: bool) -> Result<Option<Post>> {
        let Some(before) = self.store().get_post(id).await? else {
            return Ok(None);
        };
        self.store().set_post_approved(id, approved).await?;
        let Some((post, ctx)) = self.reload_post(id).await? else {
            return Ok(None);
        };

        if post.is_approved && !before.is_approved {
            info!("Post {} approved", id);
            self.raise(ForumEvent::PostApproved {
                module_id: ctx.module_id(),
                post: post.clone(),
            })
            .await;
        }
        Ok(Some(post))
    }

    /// Sets the rejected flag; rejecting also clears approved.
    pub async fn reject_post(&self, id: Uuid, rejected: bool) -> Result<Option<Post>> {
        self.store().set_post_rejected(id, rejected).await?;
        let Some((post, ctx)) = self.reload_post(id).await? else {
            return Ok(None);
        };

        if post.is_rejected {
            info!("Post {} rejected", id);
            self.raise(ForumEvent::PostRejected {
                module_id: ctx.module_id(),
                post: post.clone(),
            })
            .await;
        }
        Ok(Some(post))
    }

    pub async fn pin_post(&self, id: Uuid, pinned: bool) -> Result<Option<Post>> {
        self.store().set_post_pinned(id, pinned).await?;
        Ok(self.reload_post(id).await?.map(|(post, _)| post))
    }

    pub async fn lock_post(&self, id: Uuid, locked: bool) -> Result<Option<Post>> {
        self.store().set_post_locked(id, locked).await?;
        Ok(self.reload_post(id).await?.map(|(post, _)| post))
    }

    pub async fn set_post_status(&self, id: Uuid, status_id: Option<Uuid>) -> Result<Option<Post>> {
        self.store().set_post_status(id, status_id).await?;
        Ok(self.reload_post(id).await?.map(|(post, _)| post))
    }

    /// Deletes a post with its replies and attachments. Returns false if it did not exist.
    pub async fn delete_post(&self, site: &Site, id: Uuid) -> Result<bool> {
        let Some(post) = self.store().get_post(id).await? else {
            return Ok(false);
        };
        self.remove_post(site, &post).await?;
        self.evict_for_forum(post.forum_id).await?;
        info!("Deleted post {}", id);
        Ok(true)
    }

    /// Children before parent: reply attachments, replies, post attachments,
    /// post subscriptions, then the post row.
    pub(crate) async fn remove_post(&self, site: &Site, post: &Post) -> Result<()> {
        for reply in self.store().list_replies(post.id).await? {
            self.remove_attachments(site, AttachmentOwner::Reply(reply.id)).await?;
            self.store().delete_reply(reply.id).await?;
        }
        self.remove_attachments(site, AttachmentOwner::Post(post.id)).await?;
        self.store()
            .delete_entity_subscriptions(SubscriptionScope::Post, post.id)
            .await?;
        self.store().delete_post(post.id).await?;
        Ok(())
    }

    // -- Replies --

    pub async fn get_reply(&self, id: Uuid) -> Result<Option<Reply>> {
        Ok(self.store().get_reply(id).await?)
    }

    /// Approved replies only, oldest first.
    pub async fn list_post_replies(&self, post_id: Uuid) -> Result<Vec<Reply>> {
        let replies = self.store().list_replies(post_id).await?;
        Ok(replies.into_iter().filter(|r| r.is_approved).collect())
    }

    /// Approved replies plus the viewer's own unapproved ones.
    pub async fn list_post_replies_for_user(&self, post_id: Uuid, user_id: Uuid) -> Result<Vec<Reply>> {
        let replies = self.store().list_replies(post_id).await?;
        Ok(replies
            .into_iter()
            .filter(|r| r.is_approved || r.author_id == user_id)
            .collect())
    }

    /// Visible replies threaded by reply-to chain.
    pub async fn list_threaded_replies(&self, post_id: Uuid, viewer: Option<Uuid>) -> Result<Vec<ThreadedReply>> {
        let replies = match viewer {
            Some(user_id) => self.list_post_replies_for_user(post_id, user_id).await?,
            None => self.list_post_replies(post_id).await?,
        };
        Ok(sort_replies_for_display(replies, self.reply_depth_limit))
    }

    pub async fn create_reply(&self, site: &Site, user: &User, mut reply: Reply) -> Result<Reply> {
        if reply.body.trim().is_empty() {
            return Err(ForumError::Validation("reply body is required".into()));
        }
        let (post, ctx) = self
            .catalog
            .post_context(reply.post_id)
            .await?
            .ok_or_else(|| ForumError::not_found("post", reply.post_id))?;

        if let Some(parent_id) = reply.reply_to_id {
            let parent = self.store().get_reply(parent_id).await?;
            if parent.is_none_or(|p| p.post_id != post.id) {
                return Err(ForumError::Validation(format!(
                    "reply {parent_id} does not belong to post {}",
                    post.id
                )));
            }
        }

        let now = Utc::now();
        reply.author_id = user.id;
        reply.is_approved = self.approved_on_creation(site, user, &ctx);
        reply.is_rejected = false;
        reply.created_at = now;
        reply.updated_at = now;
        reply.attachments.clear();

        self.store().save_reply(&reply).await?;
        self.catalog.evict_forum(ctx.forum.id, ctx.group.id);

        if has_permission(site, Some(user), ctx.permissions(), &ForumScope::Subscribe.scope()) {
            self.auto_subscribe(user.id, &ctx, post.id).await?;
        }

        info!(
            "Reply {} created on post {} (approved: {})",
            reply.id, post.id, reply.is_approved
        );
        self.raise(ForumEvent::ReplyCreate {
            module_id: ctx.module_id(),
            post,
            reply: reply.clone(),
        })
        .await;
        Ok(reply)
    }

    /// Saves an edited body. Everything else is kept from the stored row.
    pub async fn save_reply(&self, reply: &mut Reply) -> Result<()> {
        let existing = self
            .store()
            .get_reply(reply.id)
            .await?
            .ok_or_else(|| ForumError::not_found("reply", reply.id))?;
        if reply.body.trim().is_empty() {
            return Err(ForumError::Validation("reply body is required".into()));
        }

        reply.post_id = existing.post_id;
        reply.reply_to_id = existing.reply_to_id;
        reply.author_id = existing.author_id;
        reply.created_at = existing.created_at;
        reply.is_approved = existing.is_approved;
        reply.is_rejected = existing.is_rejected;
        reply.attachments = existing.attachments;
        reply.updated_at = Utc::now();

        self.store().save_reply(reply).await?;
        self.evict_for_post(reply.post_id).await?;
        Ok(())
    }

    pub async fn approve_reply(&self, id: Uuid, approved: bool) -> Result<Option<Reply>> {
        let Some(before) = self.store().get_reply(id).await? else {
            return Ok(None);
        };
        self.store().set_reply_approved(id, approved).await?;
        let Some((reply, post, ctx)) = self.reload_reply(id).await? else {
            return Ok(None);
        };

        if reply.is_approved && !before.is_approved {
            info!("Reply {} approved", id);
            self.raise(ForumEvent::ReplyApproved {
                module_id: ctx.module_id(),
                post,
                reply: reply.clone(),
            })
            .await;
        }
        Ok(Some(reply))
    }

    pub async fn reject_reply(&self, id: Uuid, rejected: bool) -> Result<Option<Reply>> {
        self.store().set_reply_rejected(id, rejected).await?;
        let Some((reply, post, ctx)) = self.reload_reply(id).await? else {
            return Ok(None);
        };

        if reply.is_rejected {
            info!("Reply {} rejected", id);
            self.raise(ForumEvent::ReplyRejected {
                module_id: ctx.module_id(),
                post,
                reply: reply.clone(),
            })
            .await;
        }
        Ok(Some(reply))
    }

    pub async fn delete_reply(&self, site: &Site, id: Uuid) -> Result<bool> {
        let Some(reply) = self.store().get_reply(id).await? else {
            return Ok(false);
        };
        self.remove_attachments(site, AttachmentOwner::Reply(id)).await?;
        self.store().delete_reply(id).await?;
        self.evict_for_post(reply.post_id).await?;
        info!("Deleted reply {}", id);
        Ok(true)
    }

    // -- Attachments --

    /// Stores `data` through the file collaborator and records the attachment.
    pub async fn add_attachment(
        &self,
        site: &Site,
        owner: AttachmentOwner,
        file_name: &str,
        data: &[u8],
    ) -> Result<Attachment> {
        let post_id = match owner {
            AttachmentOwner::Post(id) => id,
            AttachmentOwner::Reply(id) => {
                self.store()
                    .get_reply(id)
                    .await?
                    .ok_or_else(|| ForumError::not_found("reply", id))?
                    .post_id
            }
        };
        let (_, ctx) = self
            .catalog
            .post_context(post_id)
            .await?
            .ok_or_else(|| ForumError::not_found("post", post_id))?;

        let settings = ctx.settings();
        if !settings.allow_attachments {
            return Err(ForumError::Validation("attachments are disabled for this forum".into()));
        }
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ForumError::Validation("attachment file name is required".into()))?
            .to_string();

        let id = Uuid::new_v4();
        let folder = settings
            .attachments_folder
            .as_deref()
            .unwrap_or(DEFAULT_ATTACHMENTS_FOLDER);
        let file_path = format!("{}/{}/{}", folder.trim_end_matches('/'), id, file_name);

        self.files
            .save_file(site.id, ATTACHMENT_PROVIDER, &file_path, data)
            .await?;

        let attachment = Attachment {
            id,
            owner,
            file_path,
            file_name,
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store().save_attachment(&attachment).await {
            if let Err(cleanup) = self
                .files
                .delete_file(site.id, ATTACHMENT_PROVIDER, &attachment.file_path)
                .await
            {
                warn!("Orphaned attachment file {}: {}", attachment.file_path, cleanup);
            }
            return Err(e.into());
        }

        self.catalog.evict_forum(ctx.forum.id, ctx.group.id);
        debug!("Attachment {} stored at {}", id, attachment.file_path);
        Ok(attachment)
    }

    pub async fn get_attachment_data(&self, site: &Site, id: Uuid) -> Result<Option<Vec<u8>>> {
        let Some(attachment) = self.store().get_attachment(id).await? else {
            return Ok(None);
        };
        Ok(self
            .files
            .get_file(site.id, ATTACHMENT_PROVIDER, &attachment.file_path)
            .await?)
    }

    /// Deletes the file, then the attachment row.
    pub async fn delete_attachment(&self, site: &Site, id: Uuid) -> Result<bool> {
        let Some(attachment) = self.store().get_attachment(id).await? else {
            return Ok(false);
        };
        self.files
            .delete_file(site.id, ATTACHMENT_PROVIDER, &attachment.file_path)
            .await?;
        self.store().delete_attachment(id).await?;

        let post_id = match attachment.owner {
            AttachmentOwner::Post(post_id) => Some(post_id),
            AttachmentOwner::Reply(reply_id) => self.store().get_reply(reply_id).await?.map(|r| r.post_id),
        };
        if let Some(post_id) = post_id {
            self.evict_for_post(post_id).await?;
        }
        Ok(true)
    }

    async fn remove_attachments(&self, site: &Site, owner: AttachmentOwner) -> Result<()> {
        for attachment in self.store().list_attachments(owner).await? {
            self.files
                .delete_file(site.id, ATTACHMENT_PROVIDER, &attachment.file_path)
                .await?;
            self.store().delete_attachment(attachment.id).await?;
        }
        Ok(())
    }

    // -- Helpers --

    /// Publishes an event for a write that is already committed. Handler
    /// failures are logged and never undo or fail the write.
    async fn raise(&self, event: ForumEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(key = ?event.key(), "Event handler failed for post {}: {}", event.post().id, e);
        }
    }

    fn approved_on_creation(&self, site: &Site, user: &User, ctx: &ForumContext) -> bool {
        !ctx.settings().moderated
            || has_permission(site, Some(user), ctx.permissions(), &ForumScope::Moderate.scope())
    }

    /// Re-reads a post after a flag change and evicts its forum.
    async fn reload_post(&self, id: Uuid) -> Result<Option<(Post, ForumContext)>> {
        let Some((post, ctx)) = self.catalog.post_context(id).await? else {
            return Ok(None);
        };
        self.catalog.evict_forum(ctx.forum.id, ctx.group.id);
        Ok(Some((post, ctx)))
    }

    async fn reload_reply(&self, id: Uuid) -> Result<Option<(Reply, Post, ForumContext)>> {
        let Some(reply) = self.store().get_reply(id).await? else {
            return Ok(None);
        };
        let Some((post, ctx)) = self.reload_post(reply.post_id).await? else {
            return Ok(None);
        };
        Ok(Some((reply, post, ctx)))
    }

    async fn evict_for_forum(&self, forum_id: Uuid) -> Result<()> {
        if let Some(forum) = self.catalog.forum_arc(forum_id).await? {
            self.catalog.evict_forum(forum_id, forum.group_id);
        }
        Ok(())
    }

    async fn evict_for_post(&self, post_id: Uuid) -> Result<()> {
        if let Some(post) = self.store().get_post(post_id).await? {
            self.evict_for_forum(post.forum_id).await?;
        }
        Ok(())
    }
}

/// Orders replies for display: roots by creation date, each followed
/// depth-first by its answers.
///
/// Falls back to flat creation-date order (depth 0) when a chain is deeper
/// than `depth_limit` or some reply is unreachable from a root, which is
/// the case for every member of a reply-to cycle.
pub fn sort_replies_for_display(mut replies: Vec<Reply>, depth_limit: usize) -> Vec<ThreadedReply> {
    replies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let index: HashMap<Uuid, usize> = replies.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); replies.len()];
    let mut roots = Vec::new();
    for (i, reply) in replies.iter().enumerate() {
        match reply.reply_to_id.and_then(|parent| index.get(&parent).copied()) {
            Some(parent) => children[parent].push(i),
            None => roots.push(i),
        }
    }

    let order = match walk_threads(&roots, &children, depth_limit) {
        Some(order) if order.len() == replies.len() => order,
        _ => {
            debug!("reply thread is cyclic or too deep, using date order");
            return replies
                .into_iter()
                .map(|reply| ThreadedReply { reply, depth: 0 })
                .collect();
        }
    };

    let mut slots: Vec<Option<Reply>> = replies.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|(i, depth)| slots[i].take().map(|reply| ThreadedReply { reply, depth }))
        .collect()
}

/// Pre-order walk from each root with an explicit stack. `None` when a
/// node sits deeper than `depth_limit` or is reached twice.
fn walk_threads(roots: &[usize], children: &[Vec<usize>], depth_limit: usize) -> Option<Vec<(usize, usize)>> {
    let mut visited = vec![false; children.len()];
    let mut order = Vec::with_capacity(children.len());
    let mut stack: Vec<(usize, usize)> = roots.iter().rev().map(|&root| (root, 0)).collect();
    while let Some((node, depth)) = stack.pop() {
        if depth > depth_limit || visited[node] {
            return None;
        }
        visited[node] = true;
        order.push((node, depth));
        stack.extend(children[node].iter().rev().map(|&child| (child, depth + 1)));
    }
    Some(order)
}

/// First [`EXCERPT_CHARS`] characters of `body`, for digests.
pub fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
