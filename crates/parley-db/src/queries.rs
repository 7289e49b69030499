use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use parley_types::models::{
    Attachment, AttachmentOwner, Forum, ForumStatistics, Group, MailQueueItem, Permission, PermissionType, Post,
    PostTracking, Reply, Role, Subscription, SubscriptionScope, User,
};

use crate::Database;
use crate::models::{
    AttachmentRow, ForumRow, GroupRow, MailQueueRow, PermissionRow, PermissionTypeRow, PostRow, PostTrackingRow,
    ReplyRow, SubscriptionRow, UserRow, owner_columns, parse_time, parse_uuid, settings_text, time_text,
};

const GROUP_COLUMNS: &str = "id, module_id, name, sort_order, settings";
const FORUM_COLUMNS: &str = "id, group_id, name, description, sort_order, use_group_settings, settings";
const POST_COLUMNS: &str = "id, forum_id, subject, body, is_pinned, is_locked, is_approved, is_rejected, status_id, author_id, created_at, updated_at";
const REPLY_COLUMNS: &str = "id, post_id, reply_to_id, body, is_approved, is_rejected, author_id, created_at, updated_at";
const ATTACHMENT_COLUMNS: &str = "id, owner_kind, owner_id, file_path, file_name, size, created_at";
const SUBSCRIPTION_COLUMNS: &str = "scope, entity_id, user_id, frequency, created_at";
const MAIL_QUEUE_COLUMNS: &str = "id, module_id, user_id, template_id, post_id, reply_id, is_sent, sent_at, created_at";
const PERMISSION_COLUMNS: &str = "id, entity_id, permission_type_id, scope, role_id, allow_access, is_disabled";

impl Database {
    // -- Groups --

    pub fn get_group(&self, id: Uuid) -> Result<Option<Group>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {GROUP_COLUMNS} FROM forum_groups WHERE id = ?1");
            conn.query_row(&sql, [id.to_string()], group_row)
                .optional()?
                .map(GroupRow::into_group)
                .transpose()
        })
    }

    pub fn list_groups(&self, module_id: Uuid) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {GROUP_COLUMNS} FROM forum_groups WHERE module_id = ?1 ORDER BY sort_order, name");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([module_id.to_string()], group_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(GroupRow::into_group).collect()
        })
    }

    pub fn save_group(&self, group: &Group) -> Result<()> {
        let settings = settings_text(&group.settings)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO forum_groups (id, module_id, name, sort_order, settings)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    module_id = excluded.module_id,
                    name = excluded.name,
                    sort_order = excluded.sort_order,
                    settings = excluded.settings",
                params![
                    group.id.to_string(),
                    group.module_id.to_string(),
                    group.name,
                    group.sort_order,
                    settings
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_group_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE forum_groups SET sort_order = ?2 WHERE id = ?1",
                params![id.to_string(), sort_order],
            )?;
            Ok(())
        })
    }

    pub fn delete_group(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM forum_groups WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    // -- Forums --

    /// Loads a forum and computes its statistics in the same lock scope.
    pub fn get_forum(&self, id: Uuid) -> Result<Option<Forum>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {FORUM_COLUMNS} FROM forums WHERE id = ?1");
            let Some(row) = conn.query_row(&sql, [id.to_string()], forum_row).optional()? else {
                return Ok(None);
            };
            let statistics = query_forum_statistics(conn, &row.id)?;
            row.into_forum(statistics).map(Some)
        })
    }

    pub fn list_forums(&self, group_id: Uuid) -> Result<Vec<Forum>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {FORUM_COLUMNS} FROM forums WHERE group_id = ?1 ORDER BY sort_order, name");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([group_id.to_string()], forum_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|row| row.into_forum(ForumStatistics::default()))
                .collect()
        })
    }

    pub fn save_forum(&self, forum: &Forum) -> Result<()> {
        let settings = settings_text(&forum.settings)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO forums (id, group_id, name, description, sort_order, use_group_settings, settings)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    group_id = excluded.group_id,
                    name = excluded.name,
                    description = excluded.description,
                    sort_order = excluded.sort_order,
                    use_group_settings = excluded.use_group_settings,
                    settings = excluded.settings",
                params![
                    forum.id.to_string(),
                    forum.group_id.to_string(),
                    forum.name,
                    forum.description,
                    forum.sort_order,
                    forum.use_group_settings,
                    settings
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_forum_sort_order(&self, id: Uuid, sort_order: i32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE forums SET sort_order = ?2 WHERE id = ?1",
                params![id.to_string(), sort_order],
            )?;
            Ok(())
        })
    }

    pub fn delete_forum(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM forums WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    // -- Posts --

    /// Loads a post with its attachments.
    pub fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1");
            let Some(row) = conn.query_row(&sql, [id.to_string()], post_row).optional()? else {
                return Ok(None);
            };
            let mut post = row.into_post()?;
            post.attachments = query_attachments(conn, AttachmentOwner::Post(post.id))?;
            Ok(Some(post))
        })
    }

    pub fn list_posts(&self, forum_id: Uuid) -> Result<Vec<Post>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE forum_id = ?1 ORDER BY is_pinned DESC, created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([forum_id.to_string()], post_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(PostRow::into_post).collect()
        })
    }

    pub fn save_post(&self, post: &Post) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, forum_id, subject, body, is_pinned, is_locked, is_approved, is_rejected,
                                    status_id, author_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    forum_id = excluded.forum_id,
                    subject = excluded.subject,
                    body = excluded.body,
                    is_pinned = excluded.is_pinned,
                    is_locked = excluded.is_locked,
                    is_approved = excluded.is_approved,
                    is_rejected = excluded.is_rejected,
                    status_id = excluded.status_id,
                    updated_at = excluded.updated_at",
                params![
                    post.id.to_string(),
                    post.forum_id.to_string(),
                    post.subject,
                    post.body,
                    post.is_pinned,
                    post.is_locked,
                    post.is_approved,
                    post.is_rejected,
                    post.status_id.map(|s| s.to_string()),
                    post.author_id.to_string(),
                    time_text(&post.created_at),
                    time_text(&post.updated_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_post(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM posts WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    /// Approving clears rejected; un-approving leaves rejected alone.
    pub fn set_post_approved(&self, id: Uuid, approved: bool) -> Result<()> {
        let sql = if approved {
            "UPDATE posts SET is_approved = 1, is_rejected = 0 WHERE id = ?1"
        } else {
            "UPDATE posts SET is_approved = 0 WHERE id = ?1"
        };
        self.execute_for_id(sql, id)
    }

    /// Rejecting clears approved; un-rejecting leaves approved alone.
    pub fn set_post_rejected(&self, id: Uuid, rejected: bool) -> Result<()> {
        let sql = if rejected {
            "UPDATE posts SET is_rejected = 1, is_approved = 0 WHERE id = ?1"
        } else {
            "UPDATE posts SET is_rejected = 0 WHERE id = ?1"
        };
        self.execute_for_id(sql, id)
    }

    pub fn set_post_pinned(&self, id: Uuid, pinned: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE posts SET is_pinned = ?2 WHERE id = ?1",
                params![id.to_string(), pinned],
            )?;
            Ok(())
        })
    }

    pub fn set_post_locked(&self, id: Uuid, locked: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE posts SET is_locked = ?2 WHERE id = ?1",
                params![id.to_string(), locked],
            )?;
            Ok(())
        })
    }

    pub fn set_post_status(&self, id: Uuid, status_id: Option<Uuid>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE posts SET status_id = ?2 WHERE id = ?1",
                params![id.to_string(), status_id.map(|s| s.to_string())],
            )?;
            Ok(())
        })
    }

    // -- Replies --

    pub fn get_reply(&self, id: Uuid) -> Result<Option<Reply>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {REPLY_COLUMNS} FROM replies WHERE id = ?1");
            let Some(row) = conn.query_row(&sql, [id.to_string()], reply_row).optional()? else {
                return Ok(None);
            };
            let mut reply = row.into_reply()?;
            reply.attachments = query_attachments(conn, AttachmentOwner::Reply(reply.id))?;
            Ok(Some(reply))
        })
    }

    pub fn list_replies(&self, post_id: Uuid) -> Result<Vec<Reply>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {REPLY_COLUMNS} FROM replies WHERE post_id = ?1 ORDER BY created_at, id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([post_id.to_string()], reply_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(ReplyRow::into_reply).collect()
        })
    }

    pub fn save_reply(&self, reply: &Reply) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO replies (id, post_id, reply_to_id, body, is_approved, is_rejected, author_id,
                                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    reply_to_id = excluded.reply_to_id,
                    body = excluded.body,
                    is_approved = excluded.is_approved,
                    is_rejected = excluded.is_rejected,
                    updated_at = excluded.updated_at",
                params![
                    reply.id.to_string(),
                    reply.post_id.to_string(),
                    reply.reply_to_id.map(|r| r.to_string()),
                    reply.body,
                    reply.is_approved,
                    reply.is_rejected,
                    reply.author_id.to_string(),
                    time_text(&reply.created_at),
                    time_text(&reply.updated_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_reply(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM replies WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    pub fn set_reply_approved(&self, id: Uuid, approved: bool) -> Result<()> {
        let sql = if approved {
            "UPDATE replies SET is_approved = 1, is_rejected = 0 WHERE id = ?1"
        } else {
            "UPDATE replies SET is_approved = 0 WHERE id = ?1"
        };
        self.execute_for_id(sql, id)
    }

    pub fn set_reply_rejected(&self, id: Uuid, rejected: bool) -> Result<()> {
        let sql = if rejected {
            "UPDATE replies SET is_rejected = 1, is_approved = 0 WHERE id = ?1"
        } else {
            "UPDATE replies SET is_rejected = 0 WHERE id = ?1"
        };
        self.execute_for_id(sql, id)
    }

    // -- Attachments --

    pub fn get_attachment(&self, id: Uuid) -> Result<Option<Attachment>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
            conn.query_row(&sql, [id.to_string()], attachment_row)
                .optional()?
                .map(AttachmentRow::into_attachment)
                .transpose()
        })
    }

    pub fn list_attachments(&self, owner: AttachmentOwner) -> Result<Vec<Attachment>> {
        self.with_conn(|conn| query_attachments(conn, owner))
    }

    pub fn save_attachment(&self, attachment: &Attachment) -> Result<()> {
        let (kind, owner_id) = owner_columns(attachment.owner);
        let size = i64::try_from(attachment.size)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO attachments (id, owner_kind, owner_id, file_path, file_name, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attachment.id.to_string(),
                    kind,
                    owner_id,
                    attachment.file_path,
                    attachment.file_name,
                    size,
                    time_text(&attachment.created_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_attachment(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM attachments WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    // -- Subscriptions --

    pub fn get_subscription(
        &self,
        scope: SubscriptionScope,
        entity_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE scope = ?1 AND entity_id = ?2 AND user_id = ?3"
            );
            conn.query_row(
                &sql,
                params![scope.as_str(), entity_id.to_string(), user_id.to_string()],
                subscription_row,
            )
            .optional()?
            .map(SubscriptionRow::into_subscription)
            .transpose()
        })
    }

    pub fn list_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<Vec<Subscription>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE scope = ?1 AND entity_id = ?2 ORDER BY created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![scope.as_str(), entity_id.to_string()], subscription_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(SubscriptionRow::into_subscription).collect()
        })
    }

    pub fn list_user_subscriptions(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = ?1 ORDER BY created_at");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], subscription_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(SubscriptionRow::into_subscription).collect()
        })
    }

    pub fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscriptions (scope, entity_id, user_id, frequency, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(scope, entity_id, user_id) DO UPDATE SET frequency = excluded.frequency",
                params![
                    subscription.scope.as_str(),
                    subscription.entity_id.to_string(),
                    subscription.user_id.to_string(),
                    subscription.frequency.as_str(),
                    time_text(&subscription.created_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn unsubscribe(&self, scope: SubscriptionScope, entity_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM subscriptions WHERE scope = ?1 AND entity_id = ?2 AND user_id = ?3",
                params![scope.as_str(), entity_id.to_string(), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Dropping a post's subscriptions also drops its tracking rows.
    pub fn delete_entity_subscriptions(&self, scope: SubscriptionScope, entity_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM subscriptions WHERE scope = ?1 AND entity_id = ?2",
                params![scope.as_str(), entity_id.to_string()],
            )?;
            if scope == SubscriptionScope::Post {
                conn.execute("DELETE FROM post_tracking WHERE post_id = ?1", [entity_id.to_string()])?;
            }
            Ok(())
        })
    }

    // -- Post tracking --

    pub fn get_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<PostTracking>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT post_id, user_id, last_viewed_at FROM post_tracking WHERE post_id = ?1 AND user_id = ?2",
                params![post_id.to_string(), user_id.to_string()],
                |row| {
                    Ok(PostTrackingRow {
                        post_id: row.get(0)?,
                        user_id: row.get(1)?,
                        last_viewed_at: row.get(2)?,
                    })
                },
            )
            .optional()?
            .map(PostTrackingRow::into_tracking)
            .transpose()
        })
    }

    pub fn save_post_tracking(&self, tracking: &PostTracking) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO post_tracking (post_id, user_id, last_viewed_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(post_id, user_id) DO UPDATE SET last_viewed_at = excluded.last_viewed_at",
                params![
                    tracking.post_id.to_string(),
                    tracking.user_id.to_string(),
                    time_text(&tracking.last_viewed_at)
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM post_tracking WHERE post_id = ?1 AND user_id = ?2",
                params![post_id.to_string(), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    // -- Mail queue --

    pub fn is_mail_queued(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        reply_id: Option<Uuid>,
        template_id: Uuid,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM mail_queue
                     WHERE user_id = ?1 AND post_id = ?2 AND reply_id IS ?3 AND template_id = ?4 AND is_sent = 0
                     LIMIT 1",
                    params![
                        user_id.to_string(),
                        post_id.to_string(),
                        reply_id.map(|r| r.to_string()),
                        template_id.to_string()
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Single-statement insert guarded by NOT EXISTS on the unsent key.
    pub fn save_mail_queue(&self, item: &MailQueueItem) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO mail_queue (id, module_id, user_id, template_id, post_id, reply_id, is_sent, sent_at, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7
                 WHERE NOT EXISTS (
                    SELECT 1 FROM mail_queue
                    WHERE user_id = ?3 AND post_id = ?5 AND reply_id IS ?6 AND template_id = ?4 AND is_sent = 0
                 )",
                params![
                    item.id.to_string(),
                    item.module_id.to_string(),
                    item.user_id.to_string(),
                    item.template_id.to_string(),
                    item.post_id.to_string(),
                    item.reply_id.map(|r| r.to_string()),
                    time_text(&item.created_at)
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn list_unsent_mail_queue(&self) -> Result<Vec<MailQueueItem>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MAIL_QUEUE_COLUMNS} FROM mail_queue WHERE is_sent = 0 ORDER BY created_at");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(MailQueueRow {
                        id: row.get(0)?,
                        module_id: row.get(1)?,
                        user_id: row.get(2)?,
                        template_id: row.get(3)?,
                        post_id: row.get(4)?,
                        reply_id: row.get(5)?,
                        is_sent: row.get(6)?,
                        sent_at: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(MailQueueRow::into_item).collect()
        })
    }

    pub fn set_mail_queue_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sent_at = time_text(&sent_at);
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE mail_queue SET is_sent = 1, sent_at = ?2 WHERE id = ?1")?;
                for id in ids {
                    stmt.execute(params![id.to_string(), sent_at])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn truncate_mail_queue(&self, sent_before: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM mail_queue WHERE is_sent = 1 AND sent_at < ?1",
                [time_text(&sent_before)],
            )?;
            Ok(removed)
        })
    }

    // -- Permissions --

    pub fn list_permission_types(&self) -> Result<Vec<PermissionType>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, scope, sort_order FROM permission_types ORDER BY sort_order")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(PermissionTypeRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        scope: row.get(2)?,
                        sort_order: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(PermissionTypeRow::into_permission_type).collect()
        })
    }

    /// Ignored when a type with the same scope already exists.
    pub fn add_permission_type(&self, permission_type: &PermissionType) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO permission_types (id, name, scope, sort_order) VALUES (?1, ?2, ?3, ?4)",
                params![
                    permission_type.id.to_string(),
                    permission_type.name,
                    permission_type.scope,
                    permission_type.sort_order
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_permissions(&self, entity_id: Uuid) -> Result<Vec<Permission>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE entity_id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([entity_id.to_string()], |row| {
                    Ok(PermissionRow {
                        id: row.get(0)?,
                        entity_id: row.get(1)?,
                        permission_type_id: row.get(2)?,
                        scope: row.get(3)?,
                        role_id: row.get(4)?,
                        allow_access: row.get(5)?,
                        is_disabled: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(PermissionRow::into_permission).collect()
        })
    }

    pub fn save_permission(&self, permission: &Permission) -> Result<()> {
        let id = permission
            .id
            .ok_or_else(|| anyhow!("Permission row for {} has no id", permission.entity_id))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO permissions (id, entity_id, permission_type_id, scope, role_id, allow_access, is_disabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    entity_id = excluded.entity_id,
                    permission_type_id = excluded.permission_type_id,
                    scope = excluded.scope,
                    role_id = excluded.role_id,
                    allow_access = excluded.allow_access,
                    is_disabled = excluded.is_disabled",
                params![
                    id.to_string(),
                    permission.entity_id.to_string(),
                    permission.permission_type_id.to_string(),
                    permission.scope,
                    permission.role_id.to_string(),
                    permission.allow_access,
                    permission.is_disabled
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_permission(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM permissions WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
    }

    pub fn delete_permissions(&self, entity_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM permissions WHERE entity_id = ?1", [entity_id.to_string()])?;
            Ok(())
        })
    }

    // -- Directory --

    /// Inserts or replaces a user with their role memberships and profile.
    pub fn save_user(&self, user: &User) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let id = user.id.to_string();
            tx.execute(
                "INSERT INTO users (id, username, display_name, is_super_user, is_approved, is_verified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name,
                    is_super_user = excluded.is_super_user,
                    is_approved = excluded.is_approved,
                    is_verified = excluded.is_verified",
                params![
                    id,
                    user.username,
                    user.display_name,
                    user.is_super_user,
                    user.is_approved,
                    user.is_verified
                ],
            )?;
            tx.execute("DELETE FROM user_roles WHERE user_id = ?1", [&id])?;
            for role_id in &user.roles {
                tx.execute(
                    "INSERT INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
                    params![id, role_id.to_string()],
                )?;
            }
            tx.execute("DELETE FROM user_profile WHERE user_id = ?1", [&id])?;
            for (name, value) in &user.profile {
                tx.execute(
                    "INSERT INTO user_profile (user_id, name, value) VALUES (?1, ?2, ?3)",
                    params![id, name, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn save_role(&self, role: &Role) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO roles (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![role.id.to_string(), role.name],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, &id.to_string()))
    }

    pub fn get_role(&self, id: Uuid) -> Result<Option<Role>> {
        self.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row("SELECT id, name FROM roles WHERE id = ?1", [id.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            row.map(|(id, name)| -> Result<Role> { Ok(Role { id: parse_uuid(&id)?, name }) })
                .transpose()
        })
    }

    pub fn list_users_in_role(&self, role_id: Uuid) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id FROM users u
                 JOIN user_roles ur ON ur.user_id = u.id
                 WHERE ur.role_id = ?1
                 ORDER BY u.username",
            )?;
            let ids = stmt
                .query_map([role_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut users = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(user) = query_user(conn, &id)? {
                    users.push(user);
                }
            }
            Ok(users)
        })
    }

    fn execute_for_id(&self, sql: &str, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(sql, [id.to_string()])?;
            Ok(())
        })
    }
}

// -- Row mappers --

fn group_row(row: &Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: row.get(0)?,
        module_id: row.get(1)?,
        name: row.get(2)?,
        sort_order: row.get(3)?,
        settings: row.get(4)?,
    })
}

fn forum_row(row: &Row<'_>) -> rusqlite::Result<ForumRow> {
    Ok(ForumRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        sort_order: row.get(4)?,
        use_group_settings: row.get(5)?,
        settings: row.get(6)?,
    })
}

fn post_row(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        forum_id: row.get(1)?,
        subject: row.get(2)?,
        body: row.get(3)?,
        is_pinned: row.get(4)?,
        is_locked: row.get(5)?,
        is_approved: row.get(6)?,
        is_rejected: row.get(7)?,
        status_id: row.get(8)?,
        author_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn reply_row(row: &Row<'_>) -> rusqlite::Result<ReplyRow> {
    Ok(ReplyRow {
        id: row.get(0)?,
        post_id: row.get(1)?,
        reply_to_id: row.get(2)?,
        body: row.get(3)?,
        is_approved: row.get(4)?,
        is_rejected: row.get(5)?,
        author_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn attachment_row(row: &Row<'_>) -> rusqlite::Result<AttachmentRow> {
    Ok(AttachmentRow {
        id: row.get(0)?,
        owner_kind: row.get(1)?,
        owner_id: row.get(2)?,
        file_path: row.get(3)?,
        file_name: row.get(4)?,
        size: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn subscription_row(row: &Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        scope: row.get(0)?,
        entity_id: row.get(1)?,
        user_id: row.get(2)?,
        frequency: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_attachments(conn: &Connection, owner: AttachmentOwner) -> Result<Vec<Attachment>> {
    let (kind, owner_id) = owner_columns(owner);
    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE owner_kind = ?1 AND owner_id = ?2 ORDER BY created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![kind, owner_id], attachment_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(AttachmentRow::into_attachment).collect()
}

/// Approved posts, approved replies on approved posts, and the newest of either.
fn query_forum_statistics(conn: &Connection, forum_id: &str) -> Result<ForumStatistics> {
    let (post_count, last_post): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(created_at) FROM posts WHERE forum_id = ?1 AND is_approved = 1",
        [forum_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (reply_count, last_reply): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(r.created_at) FROM replies r
         JOIN posts p ON p.id = r.post_id
         WHERE p.forum_id = ?1 AND p.is_approved = 1 AND r.is_approved = 1",
        [forum_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(ForumStatistics {
        post_count: u64::try_from(post_count)?,
        reply_count: u64::try_from(reply_count)?,
        last_activity_at: last_post.max(last_reply).as_deref().map(parse_time).transpose()?,
    })
}

fn query_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    let row = conn
        .query_row(
            "SELECT id, username, display_name, is_super_user, is_approved, is_verified FROM users WHERE id = ?1",
            [id],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    is_super_user: row.get(3)?,
                    is_approved: row.get(4)?,
                    is_verified: row.get(5)?,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT role_id FROM user_roles WHERE user_id = ?1")?;
    let roles = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .iter()
        .map(|r| parse_uuid(r))
        .collect::<Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT name, value FROM user_profile WHERE user_id = ?1")?;
    let profile = stmt
        .query_map([id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    Ok(Some(User {
        id: parse_uuid(&row.id)?,
        username: row.username,
        display_name: row.display_name,
        is_super_user: row.is_super_user,
        is_approved: row.is_approved,
        is_verified: row.is_verified,
        roles,
        profile,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::{NotificationFrequency, Settings};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn seed_forum(db: &Database) -> (Group, Forum) {
        let group = Group::new(Uuid::new_v4(), "General");
        db.save_group(&group).unwrap();
        let forum = Forum::new(group.id, "Announcements");
        db.save_forum(&forum).unwrap();
        (group, forum)
    }

    #[test]
    fn test_group_settings_round_trip() {
        let db = db();
        let mut group = Group::new(Uuid::new_v4(), "General");
        group.settings = Settings {
            moderated: true,
            subscription_template_id: Some(Uuid::new_v4()),
            ..Settings::default()
        };
        db.save_group(&group).unwrap();

        let loaded = db.get_group(group.id).unwrap().unwrap();
        assert_eq!(loaded.settings, group.settings);
        assert!(db.get_group(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_forum_statistics_count_only_approved() {
        let db = db();
        let (_, forum) = seed_forum(&db);

        let mut approved = Post::new(forum.id, Uuid::new_v4(), "Hello", "World");
        approved.is_approved = true;
        db.save_post(&approved).unwrap();
        let pending = Post::new(forum.id, Uuid::new_v4(), "Pending", "...");
        db.save_post(&pending).unwrap();

        let mut reply = Reply::new(approved.id, Uuid::new_v4(), "Hi");
        reply.is_approved = true;
        db.save_reply(&reply).unwrap();
        let mut hidden = Reply::new(pending.id, Uuid::new_v4(), "Hidden");
        hidden.is_approved = true;
        db.save_reply(&hidden).unwrap();

        let stats = db.get_forum(forum.id).unwrap().unwrap().statistics;
        assert_eq!(stats.post_count, 1);
        assert_eq!(stats.reply_count, 1);
        assert!(stats.last_activity_at.is_some());
    }

    #[test]
    fn test_approve_and_reject_are_exclusive() {
        let db = db();
        let (_, forum) = seed_forum(&db);
        let post = Post::new(forum.id, Uuid::new_v4(), "Subject", "Body");
        db.save_post(&post).unwrap();

        db.set_post_rejected(post.id, true).unwrap();
        db.set_post_approved(post.id, true).unwrap();
        let loaded = db.get_post(post.id).unwrap().unwrap();
        assert!(loaded.is_approved && !loaded.is_rejected);

        db.set_post_rejected(post.id, true).unwrap();
        let loaded = db.get_post(post.id).unwrap().unwrap();
        assert!(!loaded.is_approved && loaded.is_rejected);

        db.set_post_rejected(post.id, false).unwrap();
        let loaded = db.get_post(post.id).unwrap().unwrap();
        assert!(!loaded.is_approved && !loaded.is_rejected);
    }

    #[test]
    fn test_list_posts_pinned_first_then_newest() {
        let db = db();
        let (_, forum) = seed_forum(&db);
        let author = Uuid::new_v4();

        let mut old = Post::new(forum.id, author, "old", "");
        old.created_at -= chrono::Duration::hours(2);
        let mut pinned = Post::new(forum.id, author, "pinned", "");
        pinned.created_at -= chrono::Duration::hours(5);
        pinned.is_pinned = true;
        let new = Post::new(forum.id, author, "new", "");
        for post in [&old, &pinned, &new] {
            db.save_post(post).unwrap();
        }

        let subjects: Vec<String> = db.list_posts(forum.id).unwrap().into_iter().map(|p| p.subject).collect();
        assert_eq!(subjects, vec!["pinned", "new", "old"]);
    }

    #[test]
    fn test_mail_queue_insert_is_idempotent_for_unsent_rows() {
        let db = db();
        let (module, user, template, post) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = MailQueueItem::new(module, user, template, post, None);
        let second = MailQueueItem::new(module, user, template, post, None);
        assert!(db.save_mail_queue(&first).unwrap());
        assert!(!db.save_mail_queue(&second).unwrap());
        assert!(db.is_mail_queued(user, post, None, template).unwrap());

        let reply_item = MailQueueItem::new(module, user, template, post, Some(Uuid::new_v4()));
        assert!(db.save_mail_queue(&reply_item).unwrap());
        assert_eq!(db.list_unsent_mail_queue().unwrap().len(), 2);

        db.set_mail_queue_sent(&[first.id], Utc::now()).unwrap();
        assert!(!db.is_mail_queued(user, post, None, template).unwrap());
        assert!(db.save_mail_queue(&second).unwrap());
    }

    #[test]
    fn test_truncate_removes_only_old_sent_rows() {
        let db = db();
        let item = MailQueueItem::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None);
        let unsent = MailQueueItem::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), None);
        db.save_mail_queue(&item).unwrap();
        db.save_mail_queue(&unsent).unwrap();
        db.set_mail_queue_sent(&[item.id], Utc::now() - chrono::Duration::days(40)).unwrap();

        let removed = db.truncate_mail_queue(Utc::now() - chrono::Duration::days(30)).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(db.list_unsent_mail_queue().unwrap().len(), 1);
    }

    #[test]
    fn test_subscribe_upserts_frequency() {
        let db = db();
        let (entity, user) = (Uuid::new_v4(), Uuid::new_v4());
        let mut subscription = Subscription {
            scope: SubscriptionScope::Forum,
            entity_id: entity,
            user_id: user,
            frequency: NotificationFrequency::Immediate,
            created_at: Utc::now(),
        };
        db.subscribe(&subscription).unwrap();
        subscription.frequency = NotificationFrequency::Weekly;
        db.subscribe(&subscription).unwrap();

        let rows = db.list_subscriptions(SubscriptionScope::Forum, entity).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frequency, NotificationFrequency::Weekly);
        assert!(db.get_subscription(SubscriptionScope::Group, entity, user).unwrap().is_none());
    }

    #[test]
    fn test_save_permission_requires_id() {
        let db = db();
        let permission_type = PermissionType {
            id: Uuid::new_v4(),
            name: "View".into(),
            sort_order: 0,
            scope: "forum:view".into(),
        };
        db.add_permission_type(&permission_type).unwrap();
        db.add_permission_type(&permission_type).unwrap();
        assert_eq!(db.list_permission_types().unwrap().len(), 1);

        let mut row = Permission::denied(Uuid::new_v4(), &permission_type, Uuid::new_v4());
        assert!(db.save_permission(&row).is_err());

        row.id = Some(Uuid::new_v4());
        db.save_permission(&row).unwrap();
        row.allow_access = true;
        db.save_permission(&row).unwrap();

        let stored = db.list_permissions(row.entity_id).unwrap();
        assert_eq!(stored, vec![row]);
    }

    #[test]
    fn test_save_permission_moves_row_to_new_role_and_type() {
        let db = db();
        let view = PermissionType {
            id: Uuid::new_v4(),
            name: "View".into(),
            sort_order: 0,
            scope: "forum:view".into(),
        };
        let reply = PermissionType {
            id: Uuid::new_v4(),
            name: "Reply".into(),
            sort_order: 1,
            scope: "forum:reply".into(),
        };
        db.add_permission_type(&view).unwrap();
        db.add_permission_type(&reply).unwrap();

        let mut row = Permission::denied(Uuid::new_v4(), &view, Uuid::new_v4());
        row.id = Some(Uuid::new_v4());
        db.save_permission(&row).unwrap();

        let moved = Permission {
            id: row.id,
            allow_access: true,
            ..Permission::denied(row.entity_id, &reply, Uuid::new_v4())
        };
        db.save_permission(&moved).unwrap();

        let stored = db.list_permissions(row.entity_id).unwrap();
        assert_eq!(stored, vec![moved]);
    }

    #[test]
    fn test_user_with_roles_and_profile() {
        let db = db();
        let role = Role {
            id: Uuid::new_v4(),
            name: "Moderators".into(),
        };
        db.save_role(&role).unwrap();

        let mut user = User {
            id: Uuid::new_v4(),
            username: "ada".into(),
            display_name: "Ada".into(),
            is_approved: true,
            is_verified: true,
            roles: vec![role.id],
            ..User::default()
        };
        user.profile.insert("email".into(), "ada@example.com".into());
        db.save_user(&user).unwrap();

        let loaded = db.get_user(user.id).unwrap().unwrap();
        assert_eq!(loaded.email(), Some("ada@example.com"));
        assert!(loaded.is_in_role(role.id));
        assert_eq!(db.list_users_in_role(role.id).unwrap().len(), 1);
        assert_eq!(db.get_role(role.id).unwrap().map(|r| r.name), Some("Moderators".to_string()));
    }
}
