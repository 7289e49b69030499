use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Well-known roles --

/// Every caller, authenticated or not.
pub const ALL_USERS_ROLE_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001);
/// Any authenticated user.
pub const REGISTERED_USERS_ROLE_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0002);
/// Anonymous callers only.
pub const UNAUTHENTICATED_ROLE_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0003);

/// Profile property holding a user's mail address.
pub const EMAIL_CLAIM: &str = "email";

// -- Site / users --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    /// Members of this role are site administrators.
    pub administrator_role_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub is_super_user: bool,
    pub is_approved: bool,
    pub is_verified: bool,
    pub roles: Vec<Uuid>,
    pub profile: HashMap<String, String>,
}

impl User {
    pub fn is_in_role(&self, role_id: Uuid) -> bool {
        self.roles.contains(&role_id)
    }

    /// The address under [`EMAIL_CLAIM`], if set and non-blank.
    pub fn email(&self) -> Option<&str> {
        self.profile
            .get(EMAIL_CLAIM)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

// -- Settings / permissions --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub visible: bool,
    pub moderated: bool,
    pub allow_attachments: bool,
    pub allow_search_indexing: bool,
    pub attachments_folder: Option<String>,
    pub subscription_template_id: Option<Uuid>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            visible: true,
            moderated: false,
            allow_attachments: false,
            allow_search_indexing: true,
            attachments_folder: None,
            subscription_template_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionType {
    pub id: Uuid,
    pub name: String,
    pub sort_order: i32,
    /// `namespace:operation`, e.g. `forum:create-post`.
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// `None` until the row has been persisted.
    pub id: Option<Uuid>,
    pub entity_id: Uuid,
    pub permission_type_id: Uuid,
    pub scope: String,
    pub role_id: Uuid,
    pub allow_access: bool,
    pub is_disabled: bool,
}

impl Permission {
    /// An unsaved row denying `permission_type` to `role_id`.
    pub fn denied(entity_id: Uuid, permission_type: &PermissionType, role_id: Uuid) -> Self {
        Self {
            id: None,
            entity_id,
            permission_type_id: permission_type.id,
            scope: permission_type.scope.clone(),
            role_id,
            allow_access: false,
            is_disabled: false,
        }
    }
}

/// Anything that owns a set of permission rows.
pub trait PermissionHolder {
    fn entity_id(&self) -> Uuid;
    fn permissions(&self) -> &[Permission];
    fn permissions_mut(&mut self) -> &mut Vec<Permission>;
}

// -- Groups / forums --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub module_id: Uuid,
    pub name: String,
    pub sort_order: i32,
    pub settings: Settings,
    pub permissions: Vec<Permission>,
    /// Populated on load; never persisted through the group row.
    pub forums: Vec<Forum>,
}

impl Group {
    pub fn new(module_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_id,
            name: name.into(),
            sort_order: 0,
            settings: Settings::default(),
            permissions: Vec::new(),
            forums: Vec::new(),
        }
    }
}

impl PermissionHolder for Group {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    fn permissions_mut(&mut self) -> &mut Vec<Permission> {
        &mut self.permissions
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumStatistics {
    pub post_count: u64,
    pub reply_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forum {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub description: String,
    pub sort_order: i32,
    pub use_group_settings: bool,
    pub settings: Settings,
    pub permissions: Vec<Permission>,
    /// Computed by the store on load.
    pub statistics: ForumStatistics,
}

impl Forum {
    pub fn new(group_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            name: name.into(),
            description: String::new(),
            sort_order: 0,
            use_group_settings: true,
            settings: Settings::default(),
            permissions: Vec::new(),
            statistics: ForumStatistics::default(),
        }
    }

    /// Settings that actually govern this forum. `group` must be the parent group.
    pub fn effective_settings<'a>(&'a self, group: &'a Group) -> &'a Settings {
        if self.use_group_settings {
            &group.settings
        } else {
            &self.settings
        }
    }

    /// Permission rows that actually govern this forum. `group` must be the parent group.
    pub fn effective_permissions<'a>(&'a self, group: &'a Group) -> &'a [Permission] {
        if self.use_group_settings {
            &group.permissions
        } else {
            &self.permissions
        }
    }
}

impl PermissionHolder for Forum {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    fn permissions_mut(&mut self) -> &mut Vec<Permission> {
        &mut self.permissions
    }
}

// -- Posts / replies --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub forum_id: Uuid,
    pub subject: String,
    pub body: String,
    pub is_pinned: bool,
    pub is_locked: bool,
    pub is_approved: bool,
    pub is_rejected: bool,
    /// Reference into an externally managed status list.
    pub status_id: Option<Uuid>,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl Post {
    pub fn new(forum_id: Uuid, author_id: Uuid, subject: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            forum_id,
            subject: subject.into(),
            body: body.into(),
            is_pinned: false,
            is_locked: false,
            is_approved: false,
            is_rejected: false,
            status_id: None,
            author_id,
            created_at: now,
            updated_at: now,
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub post_id: Uuid,
    /// The reply this one answers, if any.
    pub reply_to_id: Option<Uuid>,
    pub body: String,
    pub is_approved: bool,
    pub is_rejected: bool,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl Reply {
    pub fn new(post_id: Uuid, author_id: Uuid, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            post_id,
            reply_to_id: None,
            body: body.into(),
            is_approved: false,
            is_rejected: false,
            author_id,
            created_at: now,
            updated_at: now,
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum AttachmentOwner {
    Post(Uuid),
    Reply(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub owner: AttachmentOwner,
    /// Path handed to the file-storage collaborator.
    pub file_path: String,
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

// -- Subscriptions / tracking / mail queue --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionScope {
    Group,
    Forum,
    Post,
}

impl SubscriptionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Forum => "forum",
            Self::Post => "post",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(Self::Group),
            "forum" => Some(Self::Forum),
            "post" => Some(Self::Post),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationFrequency {
    #[default]
    Immediate,
    Daily,
    Weekly,
}

impl NotificationFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(Self::Immediate),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub scope: SubscriptionScope,
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub frequency: NotificationFrequency,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTracking {
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub last_viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailQueueItem {
    pub id: Uuid,
    pub module_id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub post_id: Uuid,
    pub reply_id: Option<Uuid>,
    pub is_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MailQueueItem {
    pub fn new(
        module_id: Uuid,
        user_id: Uuid,
        template_id: Uuid,
        post_id: Uuid,
        reply_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module_id,
            user_id,
            template_id,
            post_id,
            reply_id,
            is_sent: false,
            sent_at: None,
            created_at: Utc::now(),
        }
    }
}
