use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailTemplate {
    pub id: Uuid,
    pub subject: String,
    pub body: String,
}

/// One post or reply inside a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestItem {
    pub module_id: Uuid,
    pub group_name: String,
    pub forum_id: Uuid,
    pub forum_name: String,
    pub post_id: Uuid,
    pub subject: String,
    pub reply_id: Option<Uuid>,
    pub excerpt: String,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Everything a template needs to render one outbound digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestPayload {
    pub user_id: Uuid,
    pub display_name: String,
    pub items: Vec<DigestItem>,
}
