mod common;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parley_core::ForumScope;
use parley_core::ports::{MailQueueStore, PostStore};
use parley_types::models::{NotificationFrequency, Post, Reply, Settings, SubscriptionScope, User};

use common::Harness;

struct Board {
    h: Harness,
    template_id: Uuid,
    forum_id: Uuid,
    author: User,
}

async fn board() -> Board {
    let h = Harness::new().await;
    let template_id = Uuid::new_v4();
    h.mailer.add_template(template_id);
    let settings = Settings {
        subscription_template_id: Some(template_id),
        ..Settings::default()
    };
    let group = h.group(settings, &[]).await;
    let forum = h.forum(&group, "Announcements").await;
    let author = h.user("ursula", &[]);
    Board {
        template_id,
        forum_id: forum.id,
        author,
        h,
    }
}

impl Board {
    async fn post(&self, subject: &str) -> Post {
        self.h
            .manager
            .create_post(
                &self.h.site,
                &self.author,
                Post::new(self.forum_id, self.author.id, subject, "Details inside"),
            )
            .await
            .unwrap()
    }

    async fn follow_forum(&self, user: &User) {
        self.h
            .manager
            .subscribe(SubscriptionScope::Forum, self.forum_id, user.id, NotificationFrequency::Immediate)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_digest_covers_every_queued_item() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;

    b.post("One").await;
    b.post("Two").await;
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 2);

    let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.messages_sent, 1);
    assert_eq!(report.items_sent, 2);
    assert!(!report.cancelled);

    let sent = b.h.mailer.sent();
    assert_eq!(sent.len(), 1);
    let (address, payload) = &sent[0];
    assert_eq!(address, "rita@example.com");
    assert_eq!(payload.user_id, reader.id);
    let mut subjects: Vec<&str> = payload.items.iter().map(|i| i.subject.as_str()).collect();
    subjects.sort();
    assert_eq!(subjects, ["One", "Two"]);
    assert!(payload.items.iter().all(|i| i.group_name == "General"));
    assert!(payload.items.iter().all(|i| i.forum_name == "Announcements"));

    assert!(b.h.store.list_unsent_mail_queue().await.unwrap().is_empty());

    // Nothing left for a second pass.
    let again = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(again.messages_sent, 0);
    assert_eq!(b.h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_users_without_address_stay_queued() {
    let b = board().await;
    let mut silent = b.h.user("sid", &[]);
    silent.profile.clear();
    b.h.store.database().save_user(&silent).unwrap();
    b.follow_forum(&silent).await;

    b.post("Hello").await;

    let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.messages_sent, 0);
    assert_eq!(report.groups_skipped, 1);
    assert!(b.h.mailer.sent().is_empty());
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_template_stays_queued() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;
    b.post("Hello").await;
    b.h.mailer.templates.lock().unwrap().clear();

    let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.groups_skipped, 1);
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_dispatch_sends_nothing() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;
    b.post("Hello").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = b.h.dispatcher.dispatch(&cancel).await.unwrap();

    assert!(report.cancelled);
    assert!(b.h.mailer.sent().is_empty());
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deleted_content_is_dropped_from_queue() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;
    let post = b.post("Short lived").await;
    b.h.manager.delete_post(&b.h.site, post.id).await.unwrap();

    let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.messages_sent, 0);
    assert!(b.h.mailer.sent().is_empty());
    assert!(b.h.store.list_unsent_mail_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replies_reach_post_subscribers() {
    let b = board().await;
    let watcher = b.h.user("wes", &[]);
    let post = b.post("Question").await;
    b.h.manager
        .subscribe(SubscriptionScope::Post, post.id, watcher.id, NotificationFrequency::Immediate)
        .await
        .unwrap();

    let reply = b
        .h
        .manager
        .create_reply(&b.h.site, &b.author, Reply::new(post.id, b.author.id, "Answer"))
        .await
        .unwrap();

    let queue = b.h.store.list_unsent_mail_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].user_id, watcher.id);
    assert_eq!(queue[0].reply_id, Some(reply.id));
    assert_eq!(queue[0].template_id, b.template_id);

    b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    let sent = b.h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.items[0].reply_id, Some(reply.id));
    assert_eq!(sent[0].1.items[0].excerpt, "Answer");
}

#[tokio::test]
async fn test_forum_without_template_queues_nothing() {
    let h = Harness::new().await;
    let group = h.group(Settings::default(), &[]).await;
    let forum = h.forum(&group, "Quiet").await;
    let author = h.user("ursula", &[]);
    let reader = h.user("rita", &[]);
    h.manager
        .subscribe(SubscriptionScope::Forum, forum.id, reader.id, NotificationFrequency::Immediate)
        .await
        .unwrap();

    h.manager
        .create_post(&h.site, &author, Post::new(forum.id, author.id, "Hi", ""))
        .await
        .unwrap();

    assert!(h.store.list_unsent_mail_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_moderated_reply_notifies_on_approval() {
    let h = Harness::new().await;
    let template_id = Uuid::new_v4();
    h.mailer.add_template(template_id);
    let moderators = Uuid::new_v4();
    let settings = Settings {
        moderated: true,
        subscription_template_id: Some(template_id),
        ..Settings::default()
    };
    let group = h.group(settings, &[(ForumScope::Moderate, moderators)]).await;
    let forum = h.forum(&group, "Reviewed").await;
    let moderator = h.user("mo", &[moderators]);
    let member = h.user("mia", &[]);
    let post = h
        .manager
        .create_post(&h.site, &moderator, Post::new(forum.id, moderator.id, "Topic", ""))
        .await
        .unwrap();
    h.manager
        .subscribe(SubscriptionScope::Post, post.id, moderator.id, NotificationFrequency::Immediate)
        .await
        .unwrap();

    let reply = h
        .manager
        .create_reply(&h.site, &member, Reply::new(post.id, member.id, "Pending"))
        .await
        .unwrap();
    assert!(h.store.list_unsent_mail_queue().await.unwrap().is_empty());

    h.manager.approve_reply(reply.id, true).await.unwrap();
    let queue = h.store.list_unsent_mail_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].user_id, moderator.id);

    let reply = h.manager.reject_reply(reply.id, true).await.unwrap().unwrap();
    assert!(reply.is_rejected && !reply.is_approved);
    assert!(h.store.get_reply(reply.id).await.unwrap().is_some());

    // The reply is no longer approved, so the row is retired without a message.
    h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert!(h.mailer.sent().is_empty());
    assert!(h.store.list_unsent_mail_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_truncate_keeps_recent_rows() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;
    b.post("Hello").await;
    b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

    let past = chrono::Utc::now() - chrono::Duration::days(1);
    assert_eq!(b.h.dispatcher.truncate_mail_queue(past).await.unwrap(), 0);

    let future = chrono::Utc::now() + chrono::Duration::days(1);
    assert_eq!(b.h.dispatcher.truncate_mail_queue(future).await.unwrap(), 1);
}

#[tokio::test]
async fn test_approving_an_approved_post_does_not_resend() {
    let b = board().await;
    let reader = b.h.user("rita", &[]);
    b.follow_forum(&reader).await;
    let post = b.post("Already live").await;
    assert!(post.is_approved);

    b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(b.h.mailer.sent().len(), 1);

    let post = b.h.manager.approve_post(post.id, true).await.unwrap().unwrap();
    assert!(post.is_approved);
    assert!(b.h.store.list_unsent_mail_queue().await.unwrap().is_empty());

    let again = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(again.messages_sent, 0);
    assert_eq!(b.h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_approving_an_approved_reply_does_not_requeue() {
    let b = board().await;
    let watcher = b.h.user("wes", &[]);
    let post = b.post("Question").await;
    b.h.manager
        .subscribe(SubscriptionScope::Post, post.id, watcher.id, NotificationFrequency::Immediate)
        .await
        .unwrap();
    let reply = b
        .h
        .manager
        .create_reply(&b.h.site, &b.author, Reply::new(post.id, b.author.id, "Answer"))
        .await
        .unwrap();
    b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();

    b.h.manager.approve_reply(reply.id, true).await.unwrap();
    assert!(b.h.store.list_unsent_mail_queue().await.unwrap().is_empty());
    assert_eq!(b.h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_address_with_line_break_is_skipped() {
    let b = board().await;
    let mut sneaky = b.h.user("sam", &[]);
    sneaky
        .profile
        .insert("email".into(), "sam@example.com\r\nBcc: x@evil.example".into());
    b.h.store.database().save_user(&sneaky).unwrap();
    b.follow_forum(&sneaky).await;

    b.post("Hello").await;

    let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.messages_sent, 0);
    assert_eq!(report.groups_skipped, 1);
    assert!(b.h.mailer.sent().is_empty());
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_skipped_groups_are_retried_quietly_each_pass() {
    let b = board().await;
    let mut silent = b.h.user("sid", &[]);
    silent.profile.clear();
    b.h.store.database().save_user(&silent).unwrap();
    b.follow_forum(&silent).await;
    b.post("Hello").await;

    for _ in 0..2 {
        let report = b.h.dispatcher.dispatch(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.messages_sent, report.groups_skipped), (0, 1));
    }
    assert_eq!(b.h.store.list_unsent_mail_queue().await.unwrap().len(), 1);
}
