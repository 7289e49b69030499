//! Database row types. These map directly to SQLite rows; ids and timestamps
//! are TEXT and are parsed into the shared models on the way out.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{
    Attachment, AttachmentOwner, Forum, ForumStatistics, Group, MailQueueItem, NotificationFrequency, Permission,
    PermissionType, Post, PostTracking, Reply, Settings, Subscription, SubscriptionScope,
};

pub struct GroupRow {
    pub id: String,
    pub module_id: String,
    pub name: String,
    pub sort_order: i32,
    pub settings: String,
}

impl GroupRow {
    pub fn into_group(self) -> Result<Group> {
        Ok(Group {
            id: parse_uuid(&self.id)?,
            module_id: parse_uuid(&self.module_id)?,
            name: self.name,
            sort_order: self.sort_order,
            settings: parse_settings(&self.settings)?,
            permissions: Vec::new(),
            forums: Vec::new(),
        })
    }
}

pub struct ForumRow {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub description: String,
    pub sort_order: i32,
    pub use_group_settings: bool,
    pub settings: String,
}

impl ForumRow {
    pub fn into_forum(self, statistics: ForumStatistics) -> Result<Forum> {
        Ok(Forum {
            id: parse_uuid(&self.id)?,
            group_id: parse_uuid(&self.group_id)?,
            name: self.name,
            description: self.description,
            sort_order: self.sort_order,
            use_group_settings: self.use_group_settings,
            settings: parse_settings(&self.settings)?,
            permissions: Vec::new(),
            statistics,
        })
    }
}

pub struct PostRow {
    pub id: String,
    pub forum_id: String,
    pub subject: String,
    pub body: String,
    pub is_pinned: bool,
    pub is_locked: bool,
    pub is_approved: bool,
    pub is_rejected: bool,
    pub status_id: Option<String>,
    pub author_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl PostRow {
    pub fn into_post(self) -> Result<Post> {
        Ok(Post {
            id: parse_uuid(&self.id)?,
            forum_id: parse_uuid(&self.forum_id)?,
            subject: self.subject,
            body: self.body,
            is_pinned: self.is_pinned,
            is_locked: self.is_locked,
            is_approved: self.is_approved,
            is_rejected: self.is_rejected,
            status_id: parse_opt_uuid(self.status_id.as_deref())?,
            author_id: parse_uuid(&self.author_id)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            attachments: Vec::new(),
        })
    }
}

pub struct ReplyRow {
    pub id: String,
    pub post_id: String,
    pub reply_to_id: Option<String>,
    pub body: String,
    pub is_approved: bool,
    pub is_rejected: bool,
    pub author_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ReplyRow {
    pub fn into_reply(self) -> Result<Reply> {
        Ok(Reply {
            id: parse_uuid(&self.id)?,
            post_id: parse_uuid(&self.post_id)?,
            reply_to_id: parse_opt_uuid(self.reply_to_id.as_deref())?,
            body: self.body,
            is_approved: self.is_approved,
            is_rejected: self.is_rejected,
            author_id: parse_uuid(&self.author_id)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            attachments: Vec::new(),
        })
    }
}

pub struct AttachmentRow {
    pub id: String,
    pub owner_kind: String,
    pub owner_id: String,
    pub file_path: String,
    pub file_name: String,
    pub size: i64,
    pub created_at: String,
}

impl AttachmentRow {
    pub fn into_attachment(self) -> Result<Attachment> {
        let owner_id = parse_uuid(&self.owner_id)?;
        let owner = match self.owner_kind.as_str() {
            "post" => AttachmentOwner::Post(owner_id),
            "reply" => AttachmentOwner::Reply(owner_id),
            other => return Err(anyhow!("Unknown attachment owner kind: {}", other)),
        };
        Ok(Attachment {
            id: parse_uuid(&self.id)?,
            owner,
            file_path: self.file_path,
            file_name: self.file_name,
            size: u64::try_from(self.size).context("Negative attachment size")?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// (owner kind, owner id) columns for an attachment owner.
pub fn owner_columns(owner: AttachmentOwner) -> (&'static str, String) {
    match owner {
        AttachmentOwner::Post(id) => ("post", id.to_string()),
        AttachmentOwner::Reply(id) => ("reply", id.to_string()),
    }
}

pub struct SubscriptionRow {
    pub scope: String,
    pub entity_id: String,
    pub user_id: String,
    pub frequency: String,
    pub created_at: String,
}

impl SubscriptionRow {
    pub fn into_subscription(self) -> Result<Subscription> {
        Ok(Subscription {
            scope: SubscriptionScope::parse(&self.scope)
                .ok_or_else(|| anyhow!("Unknown subscription scope: {}", self.scope))?,
            entity_id: parse_uuid(&self.entity_id)?,
            user_id: parse_uuid(&self.user_id)?,
            frequency: NotificationFrequency::parse(&self.frequency)
                .ok_or_else(|| anyhow!("Unknown notification frequency: {}", self.frequency))?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

pub struct PostTrackingRow {
    pub post_id: String,
    pub user_id: String,
    pub last_viewed_at: String,
}

impl PostTrackingRow {
    pub fn into_tracking(self) -> Result<PostTracking> {
        Ok(PostTracking {
            post_id: parse_uuid(&self.post_id)?,
            user_id: parse_uuid(&self.user_id)?,
            last_viewed_at: parse_time(&self.last_viewed_at)?,
        })
    }
}

pub struct MailQueueRow {
    pub id: String,
    pub module_id: String,
    pub user_id: String,
    pub template_id: String,
    pub post_id: String,
    pub reply_id: Option<String>,
    pub is_sent: bool,
    pub sent_at: Option<String>,
    pub created_at: String,
}

impl MailQueueRow {
    pub fn into_item(self) -> Result<MailQueueItem> {
        Ok(MailQueueItem {
            id: parse_uuid(&self.id)?,
            module_id: parse_uuid(&self.module_id)?,
            user_id: parse_uuid(&self.user_id)?,
            template_id: parse_uuid(&self.template_id)?,
            post_id: parse_uuid(&self.post_id)?,
            reply_id: parse_opt_uuid(self.reply_id.as_deref())?,
            is_sent: self.is_sent,
            sent_at: self.sent_at.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

pub struct PermissionTypeRow {
    pub id: String,
    pub name: String,
    pub scope: String,
    pub sort_order: i32,
}

impl PermissionTypeRow {
    pub fn into_permission_type(self) -> Result<PermissionType> {
        Ok(PermissionType {
            id: parse_uuid(&self.id)?,
            name: self.name,
            sort_order: self.sort_order,
            scope: self.scope,
        })
    }
}

pub struct PermissionRow {
    pub id: String,
    pub entity_id: String,
    pub permission_type_id: String,
    pub scope: String,
    pub role_id: String,
    pub allow_access: bool,
    pub is_disabled: bool,
}

impl PermissionRow {
    pub fn into_permission(self) -> Result<Permission> {
        Ok(Permission {
            id: Some(parse_uuid(&self.id)?),
            entity_id: parse_uuid(&self.entity_id)?,
            permission_type_id: parse_uuid(&self.permission_type_id)?,
            scope: self.scope,
            role_id: parse_uuid(&self.role_id)?,
            allow_access: self.allow_access,
            is_disabled: self.is_disabled,
        })
    }
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub is_super_user: bool,
    pub is_approved: bool,
    pub is_verified: bool,
}

// -- Column helpers --

pub fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid UUID in database: {}", s))
}

pub fn parse_opt_uuid(s: Option<&str>) -> Result<Option<Uuid>> {
    s.map(parse_uuid).transpose()
}

pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

/// Fixed-width RFC 3339 so that TEXT ordering matches time ordering.
pub fn time_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_settings(s: &str) -> Result<Settings> {
    serde_json::from_str(s).context("Invalid settings JSON in database")
}

pub fn settings_text(settings: &Settings) -> Result<String> {
    Ok(serde_json::to_string(settings)?)
}
