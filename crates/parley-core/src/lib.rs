//! Forum engine: permission resolution, cached group and forum aggregates,
//! post moderation, subscriptions, and notification delivery.
//!
//! Persistence, file storage, and mail transport are reached through the
//! traits in [`ports`].

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod moderation;
pub mod notify;
pub mod permissions;
pub mod ports;
pub mod subscriptions;

pub use config::Config;
pub use error::{ForumError, Result};
pub use manager::{ForumCatalog, ForumContext, ForumManager, MoveDirection, PermissionTarget};
pub use moderation::ThreadedReply;
pub use notify::{DispatchReport, EventBus, EventHandler, MailDispatcher, NotificationHandler};
pub use permissions::{ForumScope, PermissionResolver, has_permission};
