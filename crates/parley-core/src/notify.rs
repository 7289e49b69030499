//! Event routing, notification fan-out, and the mail-queue batch job.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_types::events::{EntityKind, EventAction, EventKey, ForumEvent};
use parley_types::mail::{DigestItem, DigestPayload};
use parley_types::models::MailQueueItem;

use crate::error::Result;
use crate::manager::ForumCatalog;
use crate::moderation::excerpt;
use crate::ports::Mailer;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ForumEvent) -> anyhow::Result<()>;
}

/// Routes events to handlers registered for their (entity, action) key.
/// Handlers run in registration order; the first failure is returned to the publisher.
#[derive(Default, Clone)]
pub struct EventBus {
    handlers: HashMap<EventKey, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: EventKey, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(key).or_default().push(handler);
    }

    pub fn handler_count(&self, key: EventKey) -> usize {
        self.handlers.get(&key).map_or(0, Vec::len)
    }

    pub async fn publish(&self, event: &ForumEvent) -> Result<()> {
        let key = event.key();
        let Some(handlers) = self.handlers.get(&key) else {
            trace!(?key, "no handlers registered");
            return Ok(());
        };
        for handler in handlers {
            handler.handle(event).await?;
        }
        Ok(())
    }
}

/// Events that queue subscriber notifications.
pub const NOTIFICATION_EVENTS: [EventKey; 4] = [
    EventKey::new(EntityKind::Post, EventAction::Create),
    EventKey::new(EntityKind::Post, EventAction::Approved),
    EventKey::new(EntityKind::Reply, EventAction::Create),
    EventKey::new(EntityKind::Reply, EventAction::Approved),
];

/// Queues one mail row per subscriber when approved content appears.
pub struct NotificationHandler {
    catalog: Arc<ForumCatalog>,
}

impl NotificationHandler {
    pub fn new(catalog: Arc<ForumCatalog>) -> Self {
        Self { catalog }
    }

    pub fn register(self: Arc<Self>, bus: &mut EventBus) {
        for key in NOTIFICATION_EVENTS {
            bus.register(key, self.clone());
        }
    }

    /// Writes `item` unless an unsent row with the same (user, post, reply,
    /// template) is already queued. Returns whether a row was written.
    pub async fn save_mail_queue(&self, item: &MailQueueItem) -> anyhow::Result<bool> {
        let store = self.catalog.store();
        if store
            .is_mail_queued(item.user_id, item.post_id, item.reply_id, item.template_id)
            .await?
        {
            trace!(user_id = %item.user_id, post_id = %item.post_id, "already queued");
            return Ok(false);
        }
        store.save_mail_queue(item).await
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    async fn handle(&self, event: &ForumEvent) -> anyhow::Result<()> {
        if !event.item_is_approved() {
            return Ok(());
        }
        let post = event.post();
        let Some(ctx) = self.catalog.forum_context(post.forum_id).await? else {
            return Ok(());
        };
        let Some(template_id) = ctx.settings().subscription_template_id else {
            trace!(forum_id = %post.forum_id, "no subscription template configured");
            return Ok(());
        };

        let subscribers = match event.reply() {
            Some(_) => self.catalog.list_post_subscribers(post.id).await?,
            None => self.catalog.list_forum_subscribers(post.forum_id).await?,
        };
        let reply_id = event.reply().map(|r| r.id);

        let mut queued = 0usize;
        for subscriber in &subscribers {
            let item = MailQueueItem::new(event.module_id(), subscriber.user_id, template_id, post.id, reply_id);
            if self.save_mail_queue(&item).await? {
                queued += 1;
            }
        }

        debug!(
            post_id = %post.id,
            ?reply_id,
            subscribers = subscribers.len(),
            queued,
            "notifications queued"
        );
        Ok(())
    }
}

/// Outcome of one pass over the mail queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub messages_sent: usize,
    pub items_sent: usize,
    pub groups_skipped: usize,
    pub cancelled: bool,
}

/// Unsent rows keyed by (user, template), then by module.
pub type QueueGroups = BTreeMap<(Uuid, Uuid), BTreeMap<Uuid, Vec<MailQueueItem>>>;

pub fn group_mail_queue(items: Vec<MailQueueItem>) -> QueueGroups {
    let mut groups = QueueGroups::new();
    for item in items {
        groups
            .entry((item.user_id, item.template_id))
            .or_default()
            .entry(item.module_id)
            .or_default()
            .push(item);
    }
    groups
}

/// Group and forum names of one module, resolved once per dispatch group.
struct ModuleNames {
    forums: HashMap<Uuid, (String, String)>,
}

impl ModuleNames {
    async fn resolve(catalog: &ForumCatalog, module_id: Uuid) -> Result<Self> {
        let mut forums = HashMap::new();
        for row in catalog.store().list_groups(module_id).await? {
            if let Some(group) = catalog.get_group(row.id).await? {
                for forum in &group.forums {
                    forums.insert(forum.id, (group.name.clone(), forum.name.clone()));
                }
            }
        }
        Ok(Self { forums })
    }
}

/// Drains the mail queue: one message per (user, template) group.
pub struct MailDispatcher {
    catalog: Arc<ForumCatalog>,
    mailer: Arc<dyn Mailer>,
}

impl MailDispatcher {
    pub fn new(catalog: Arc<ForumCatalog>, mailer: Arc<dyn Mailer>) -> Self {
        Self { catalog, mailer }
    }

    /// Sends every pending group. Groups whose user has no address or whose
    /// template cannot be resolved stay queued and are retried next pass.
    /// Stops before the next group once `cancel` fires.
    pub async fn dispatch(&self, cancel: &CancellationToken) -> Result<DispatchReport> {
        let store = self.catalog.store();
        let queue = store.list_unsent_mail_queue().await?;
        let mut report = DispatchReport::default();
        if queue.is_empty() {
            return Ok(report);
        }

        for ((user_id, template_id), modules) in group_mail_queue(queue) {
            if cancel.is_cancelled() {
                info!("Mail dispatch cancelled");
                report.cancelled = true;
                break;
            }

            let Some(user) = store.get_user(user_id).await? else {
                trace!(%user_id, "queued mail for unknown user");
                report.groups_skipped += 1;
                continue;
            };
            let Some(address) = user.email().filter(|a| !a.chars().any(char::is_control)) else {
                trace!(%user_id, "user has no usable email address");
                report.groups_skipped += 1;
                continue;
            };
            let Some(template) = self.mailer.resolve_template(template_id).await? else {
                trace!(%template_id, "mail template not found");
                report.groups_skipped += 1;
                continue;
            };

            let mut ids = Vec::new();
            let mut items = Vec::new();
            for (module_id, rows) in modules {
                let names = ModuleNames::resolve(&self.catalog, module_id).await?;
                for row in rows {
                    ids.push(row.id);
                    if let Some(item) = self.digest_item(&names, &row).await? {
                        items.push(item);
                    }
                }
            }

            if items.is_empty() {
                debug!(%user_id, rows = ids.len(), "queued content is gone, dropping rows");
            } else {
                let payload = DigestPayload {
                    user_id,
                    display_name: user.display_name.clone(),
                    items,
                };
                self.mailer.send(&template, &payload, address).await?;
                report.messages_sent += 1;
                report.items_sent += payload.items.len();
            }
            store.set_mail_queue_sent(&ids, Utc::now()).await?;
        }

        if report.messages_sent > 0 {
            info!(
                "Mail dispatch: {} messages ({} items), {} groups skipped",
                report.messages_sent, report.items_sent, report.groups_skipped
            );
        } else if report.groups_skipped > 0 {
            debug!("Mail dispatch: nothing sent, {} groups skipped", report.groups_skipped);
        }
        Ok(report)
    }

    /// Deletes sent rows older than `sent_before`.
    pub async fn truncate_mail_queue(&self, sent_before: DateTime<Utc>) -> Result<usize> {
        let removed = self.catalog.store().truncate_mail_queue(sent_before).await?;
        if removed > 0 {
            info!("Truncated {} sent mail queue rows", removed);
        }
        Ok(removed)
    }

    /// Builds a digest line for a queued row. Deleted or no longer approved content yields `None`.
    async fn digest_item(&self, names: &ModuleNames, row: &MailQueueItem) -> Result<Option<DigestItem>> {
        let store = self.catalog.store();
        let Some(post) = store.get_post(row.post_id).await? else {
            return Ok(None);
        };
        if !post.is_approved {
            return Ok(None);
        }

        let (body, author_id, created_at) = match row.reply_id {
            Some(reply_id) => match store.get_reply(reply_id).await? {
                Some(reply) if reply.is_approved => (reply.body, reply.author_id, reply.created_at),
                _ => return Ok(None),
            },
            None => (post.body.clone(), post.author_id, post.created_at),
        };

        let (group_name, forum_name) = match names.forums.get(&post.forum_id) {
            Some(pair) => pair.clone(),
            None => {
                warn!(forum_id = %post.forum_id, module_id = %row.module_id, "forum missing from module");
                (String::new(), String::new())
            }
        };

        Ok(Some(DigestItem {
            module_id: row.module_id,
            group_name,
            forum_id: post.forum_id,
            forum_name,
            post_id: post.id,
            subject: post.subject,
            reply_id: row.reply_id,
            excerpt: excerpt(&body),
            author_id,
            created_at,
        }))
    }
}
