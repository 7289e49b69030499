use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (directory and forum schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                display_name    TEXT NOT NULL,
                is_super_user   INTEGER NOT NULL DEFAULT 0,
                is_approved     INTEGER NOT NULL DEFAULT 1,
                is_verified     INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE roles (
                id      TEXT PRIMARY KEY,
                name    TEXT NOT NULL UNIQUE
            );

            CREATE TABLE user_roles (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, role_id)
            );

            CREATE INDEX idx_user_roles_role ON user_roles(role_id);

            CREATE TABLE user_profile (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name    TEXT NOT NULL,
                value   TEXT NOT NULL,
                PRIMARY KEY (user_id, name)
            );

            CREATE TABLE permission_types (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                scope       TEXT NOT NULL UNIQUE,
                sort_order  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE permissions (
                id                  TEXT PRIMARY KEY,
                entity_id           TEXT NOT NULL,
                permission_type_id  TEXT NOT NULL REFERENCES permission_types(id),
                scope               TEXT NOT NULL,
                role_id             TEXT NOT NULL,
                allow_access        INTEGER NOT NULL DEFAULT 0,
                is_disabled         INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_permissions_entity ON permissions(entity_id);

            CREATE TABLE forum_groups (
                id          TEXT PRIMARY KEY,
                module_id   TEXT NOT NULL,
                name        TEXT NOT NULL,
                sort_order  INTEGER NOT NULL DEFAULT 0,
                settings    TEXT NOT NULL
            );

            CREATE INDEX idx_forum_groups_module ON forum_groups(module_id, sort_order);

            CREATE TABLE forums (
                id                  TEXT PRIMARY KEY,
                group_id            TEXT NOT NULL REFERENCES forum_groups(id),
                name                TEXT NOT NULL,
                description         TEXT NOT NULL DEFAULT '',
                sort_order          INTEGER NOT NULL DEFAULT 0,
                use_group_settings  INTEGER NOT NULL DEFAULT 1,
                settings            TEXT NOT NULL
            );

            CREATE INDEX idx_forums_group ON forums(group_id, sort_order);

            CREATE TABLE posts (
                id          TEXT PRIMARY KEY,
                forum_id    TEXT NOT NULL REFERENCES forums(id),
                subject     TEXT NOT NULL,
                body        TEXT NOT NULL,
                is_pinned   INTEGER NOT NULL DEFAULT 0,
                is_locked   INTEGER NOT NULL DEFAULT 0,
                is_approved INTEGER NOT NULL DEFAULT 0,
                is_rejected INTEGER NOT NULL DEFAULT 0,
                status_id   TEXT,
                author_id   TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_posts_forum ON posts(forum_id, created_at);

            CREATE TABLE replies (
                id          TEXT PRIMARY KEY,
                post_id     TEXT NOT NULL REFERENCES posts(id),
                reply_to_id TEXT,
                body        TEXT NOT NULL,
                is_approved INTEGER NOT NULL DEFAULT 0,
                is_rejected INTEGER NOT NULL DEFAULT 0,
                author_id   TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX idx_replies_post ON replies(post_id, created_at);

            CREATE TABLE attachments (
                id          TEXT PRIMARY KEY,
                owner_kind  TEXT NOT NULL,
                owner_id    TEXT NOT NULL,
                file_path   TEXT NOT NULL,
                file_name   TEXT NOT NULL,
                size        INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_attachments_owner ON attachments(owner_kind, owner_id);

            CREATE TABLE subscriptions (
                scope       TEXT NOT NULL,
                entity_id   TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                frequency   TEXT NOT NULL DEFAULT 'immediate',
                created_at  TEXT NOT NULL,
                PRIMARY KEY (scope, entity_id, user_id)
            );

            CREATE INDEX idx_subscriptions_user ON subscriptions(user_id);

            CREATE TABLE post_tracking (
                post_id         TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                last_viewed_at  TEXT NOT NULL,
                PRIMARY KEY (post_id, user_id)
            );

            CREATE TABLE mail_queue (
                id          TEXT PRIMARY KEY,
                module_id   TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                template_id TEXT NOT NULL,
                post_id     TEXT NOT NULL,
                reply_id    TEXT,
                is_sent     INTEGER NOT NULL DEFAULT 0,
                sent_at     TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_mail_queue_unsent ON mail_queue(is_sent, user_id, template_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
