use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Post, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Post,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Create,
    Approved,
    Rejected,
}

/// Routing key for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub entity: EntityKind,
    pub action: EventAction,
}

impl EventKey {
    pub const fn new(entity: EntityKind, action: EventAction) -> Self {
        Self { entity, action }
    }
}

/// Domain events raised by post and reply mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ForumEvent {
    PostCreate { module_id: Uuid, post: Post },
    PostApproved { module_id: Uuid, post: Post },
    PostRejected { module_id: Uuid, post: Post },
    ReplyCreate { module_id: Uuid, post: Post, reply: Reply },
    ReplyApproved { module_id: Uuid, post: Post, reply: Reply },
    ReplyRejected { module_id: Uuid, post: Post, reply: Reply },
}

impl ForumEvent {
    pub fn key(&self) -> EventKey {
        use EntityKind::{Post, Reply};
        use EventAction::{Approved, Create, Rejected};
        match self {
            Self::PostCreate { .. } => EventKey::new(Post, Create),
            Self::PostApproved { .. } => EventKey::new(Post, Approved),
            Self::PostRejected { .. } => EventKey::new(Post, Rejected),
            Self::ReplyCreate { .. } => EventKey::new(Reply, Create),
            Self::ReplyApproved { .. } => EventKey::new(Reply, Approved),
            Self::ReplyRejected { .. } => EventKey::new(Reply, Rejected),
        }
    }

    pub fn module_id(&self) -> Uuid {
        match self {
            Self::PostCreate { module_id, .. }
            | Self::PostApproved { module_id, .. }
            | Self::PostRejected { module_id, .. }
            | Self::ReplyCreate { module_id, .. }
            | Self::ReplyApproved { module_id, .. }
            | Self::ReplyRejected { module_id, .. } => *module_id,
        }
    }

    /// The post the event concerns; for reply events, the reply's parent post.
    pub fn post(&self) -> &Post {
        match self {
            Self::PostCreate { post, .. }
            | Self::PostApproved { post, .. }
            | Self::PostRejected { post, .. }
            | Self::ReplyCreate { post, .. }
            | Self::ReplyApproved { post, .. }
            | Self::ReplyRejected { post, .. } => post,
        }
    }

    /// Returns the reply for reply-scoped events, `None` for post events.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::ReplyCreate { reply, .. }
            | Self::ReplyApproved { reply, .. }
            | Self::ReplyRejected { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Whether the item the event is about is currently approved.
    pub fn item_is_approved(&self) -> bool {
        match self.reply() {
            Some(reply) => reply.is_approved,
            None => self.post().is_approved,
        }
    }
}
