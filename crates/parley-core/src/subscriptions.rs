//! Subscription resolution and post tracking.
//!
//! A user subscribed to a group is implicitly subscribed to all of its forums,
//! and a forum subscription covers every post in it. Resolved subscriber
//! lists therefore union the broader scopes and keep the first row per user.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::models::{NotificationFrequency, PostTracking, Subscription, SubscriptionScope};

use crate::error::{ForumError, Result};
use crate::manager::{ForumCatalog, ForumContext, ForumManager};

impl ForumCatalog {
    /// Group and forum subscribers of a forum, one entry per user.
    pub async fn list_forum_subscribers(&self, forum_id: Uuid) -> Result<Vec<Subscription>> {
        let Some(ctx) = self.forum_context(forum_id).await? else {
            return Ok(Vec::new());
        };
        let mut subscribers = self
            .store()
            .list_subscriptions(SubscriptionScope::Group, ctx.group.id)
            .await?;
        subscribers.extend(
            self.store()
                .list_subscriptions(SubscriptionScope::Forum, forum_id)
                .await?,
        );
        Ok(dedup_by_user(subscribers))
    }

    /// Group, forum, and post subscribers of a post, one entry per user.
    pub async fn list_post_subscribers(&self, post_id: Uuid) -> Result<Vec<Subscription>> {
        let Some(post) = self.store().get_post(post_id).await? else {
            return Ok(Vec::new());
        };
        let mut subscribers = self.list_forum_subscribers(post.forum_id).await?;
        subscribers.extend(
            self.store()
                .list_subscriptions(SubscriptionScope::Post, post_id)
                .await?,
        );
        Ok(dedup_by_user(subscribers))
    }

    /// Whether `user_id` already follows the forum through its group or the forum itself.
    pub async fn has_broader_subscription(&self, user_id: Uuid, ctx: &ForumContext) -> Result<bool> {
        if self
            .store()
            .get_subscription(SubscriptionScope::Group, ctx.group.id, user_id)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        Ok(self
            .store()
            .get_subscription(SubscriptionScope::Forum, ctx.forum.id, user_id)
            .await?
            .is_some())
    }
}

impl ForumManager {
    pub async fn get_subscription(
        &self,
        scope: SubscriptionScope,
        entity_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Subscription>> {
        Ok(self.store().get_subscription(scope, entity_id, user_id).await?)
    }

    /// Subscribes a user, or changes the frequency of an existing subscription.
    pub async fn subscribe(
        &self,
        scope: SubscriptionScope,
        entity_id: Uuid,
        user_id: Uuid,
        frequency: NotificationFrequency,
    ) -> Result<Subscription> {
        let exists = match scope {
            SubscriptionScope::Group => self.catalog.group_arc(entity_id).await?.is_some(),
            SubscriptionScope::Forum => self.catalog.forum_arc(entity_id).await?.is_some(),
            SubscriptionScope::Post => self.store().get_post(entity_id).await?.is_some(),
        };
        if !exists {
            return Err(ForumError::not_found(scope.as_str(), entity_id));
        }

        if let Some(mut existing) = self.store().get_subscription(scope, entity_id, user_id).await? {
            if existing.frequency != frequency {
                existing.frequency = frequency;
                self.store().subscribe(&existing).await?;
                debug!(%user_id, %entity_id, frequency = frequency.as_str(), "subscription frequency changed");
            }
            return Ok(existing);
        }

        let subscription = Subscription {
            scope,
            entity_id,
            user_id,
            frequency,
            created_at: Utc::now(),
        };
        self.store().subscribe(&subscription).await?;
        info!("User {} subscribed to {} {}", user_id, scope.as_str(), entity_id);
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, scope: SubscriptionScope, entity_id: Uuid, user_id: Uuid) -> Result<()> {
        self.store().unsubscribe(scope, entity_id, user_id).await?;
        info!("User {} unsubscribed from {} {}", user_id, scope.as_str(), entity_id);
        Ok(())
    }

    pub async fn list_forum_subscribers(&self, forum_id: Uuid) -> Result<Vec<Subscription>> {
        self.catalog.list_forum_subscribers(forum_id).await
    }

    pub async fn list_post_subscribers(&self, post_id: Uuid) -> Result<Vec<Subscription>> {
        self.catalog.list_post_subscribers(post_id).await
    }

    pub async fn get_user_subscriptions(&self, user_id: Uuid) -> Result<Vec<Subscription>> {
        Ok(self.store().list_user_subscriptions(user_id).await?)
    }

    /// Subscribes an author to their own thread unless a group, forum, or
    /// post subscription already covers it. Returns whether a row was added.
    pub(crate) async fn auto_subscribe(&self, user_id: Uuid, ctx: &ForumContext, post_id: Uuid) -> Result<bool> {
        if self.catalog.has_broader_subscription(user_id, ctx).await? {
            return Ok(false);
        }
        if self
            .store()
            .get_subscription(SubscriptionScope::Post, post_id, user_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let subscription = Subscription {
            scope: SubscriptionScope::Post,
            entity_id: post_id,
            user_id,
            frequency: NotificationFrequency::Immediate,
            created_at: Utc::now(),
        };
        self.store().subscribe(&subscription).await?;
        debug!(%user_id, %post_id, "author auto-subscribed");
        Ok(true)
    }

    // -- Post tracking --

    pub async fn get_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<Option<PostTracking>> {
        Ok(self.store().get_post_tracking(post_id, user_id).await?)
    }

    /// Records that `user_id` has just viewed the post.
    pub async fn track_post_view(&self, post_id: Uuid, user_id: Uuid) -> Result<PostTracking> {
        let tracking = PostTracking {
            post_id,
            user_id,
            last_viewed_at: Utc::now(),
        };
        self.store().save_post_tracking(&tracking).await?;
        Ok(tracking)
    }

    pub async fn delete_post_tracking(&self, post_id: Uuid, user_id: Uuid) -> Result<()> {
        Ok(self.store().delete_post_tracking(post_id, user_id).await?)
    }
}

/// Keeps the first subscription seen for each user.
pub fn dedup_by_user(subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    let mut seen = HashSet::new();
    subscriptions
        .into_iter()
        .filter(|s| seen.insert(s.user_id))
        .collect()
}
