#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use parley_core::ports::{FileStorage, Mailer};
use parley_core::{
    Config, EventBus, EventHandler, ForumCatalog, ForumManager, ForumScope, MailDispatcher, NotificationHandler,
};
use parley_db::SqliteStore;
use parley_types::events::EventKey;
use parley_types::mail::{DigestPayload, MailTemplate};
use parley_types::models::{Forum, Group, Permission, Role, Settings, Site, User};

#[derive(Default)]
pub struct MemoryFiles {
    pub files: Mutex<HashMap<(Uuid, String, String), Vec<u8>>>,
}

#[async_trait]
impl FileStorage for MemoryFiles {
    async fn save_file(&self, site_id: Uuid, provider_key: &str, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert((site_id, provider_key.to_string(), path.to_string()), data.to_vec());
        Ok(())
    }

    async fn get_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(site_id, provider_key.to_string(), path.to_string()))
            .cloned())
    }

    async fn delete_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> anyhow::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(&(site_id, provider_key.to_string(), path.to_string()));
        Ok(())
    }
}

impl MemoryFiles {
    pub fn count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub templates: Mutex<HashMap<Uuid, MailTemplate>>,
    pub sent: Mutex<Vec<(String, DigestPayload)>>,
}

impl RecordingMailer {
    pub fn add_template(&self, id: Uuid) {
        self.templates.lock().unwrap().insert(
            id,
            MailTemplate {
                id,
                subject: "New activity".into(),
                body: "{{items}}".into(),
            },
        );
    }

    pub fn sent(&self) -> Vec<(String, DigestPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn resolve_template(&self, template_id: Uuid) -> anyhow::Result<Option<MailTemplate>> {
        Ok(self.templates.lock().unwrap().get(&template_id).cloned())
    }

    async fn send(&self, _template: &MailTemplate, payload: &DigestPayload, address: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((address.to_string(), payload.clone()));
        Ok(())
    }
}

/// Engine wired to an in-memory SQLite store and recording collaborators.
pub struct Harness {
    pub site: Site,
    pub module_id: Uuid,
    pub store: Arc<SqliteStore>,
    pub manager: ForumManager,
    pub dispatcher: MailDispatcher,
    pub files: Arc<MemoryFiles>,
    pub mailer: Arc<RecordingMailer>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_handlers(Vec::new()).await
    }

    /// Like [`Harness::new`], with `extra` registered after the notification handler.
    pub async fn with_handlers(extra: Vec<(EventKey, Arc<dyn EventHandler>)>) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let catalog = Arc::new(ForumCatalog::load(store.clone()).await.unwrap());
        let files = Arc::new(MemoryFiles::default());
        let mailer = Arc::new(RecordingMailer::default());

        let mut events = EventBus::new();
        Arc::new(NotificationHandler::new(catalog.clone())).register(&mut events);
        for (key, handler) in extra {
            events.register(key, handler);
        }

        let manager = ForumManager::new(catalog.clone(), files.clone(), events, &Config::default());
        let dispatcher = MailDispatcher::new(catalog, mailer.clone());

        let site = Site {
            id: Uuid::new_v4(),
            name: "Test site".into(),
            administrator_role_id: Uuid::new_v4(),
        };

        Self {
            site,
            module_id: Uuid::new_v4(),
            store,
            manager,
            dispatcher,
            files,
            mailer,
        }
    }

    pub fn catalog(&self) -> &Arc<ForumCatalog> {
        self.manager.catalog()
    }

    /// Saves an approved, verified user with an email address and the given roles.
    pub fn user(&self, username: &str, roles: &[Uuid]) -> User {
        let db = self.store.database();
        for role_id in roles {
            db.save_role(&Role {
                id: *role_id,
                name: format!("role-{role_id}"),
            })
            .unwrap();
        }

        let mut user = User {
            id: Uuid::new_v4(),
            username: username.into(),
            display_name: username.into(),
            is_approved: true,
            is_verified: true,
            roles: roles.to_vec(),
            ..User::default()
        };
        user.profile.insert("email".into(), format!("{username}@example.com"));
        db.save_user(&user).unwrap();
        user
    }

    /// An unsaved row granting `scope` to `role_id`.
    pub fn grant(&self, entity_id: Uuid, scope: ForumScope, role_id: Uuid) -> Permission {
        let permission_type = self.catalog().resolver().permission_type(scope).unwrap();
        Permission {
            id: None,
            entity_id,
            permission_type_id: permission_type.id,
            scope: permission_type.scope.clone(),
            role_id,
            allow_access: true,
            is_disabled: false,
        }
    }

    pub async fn group(&self, settings: Settings, grants: &[(ForumScope, Uuid)]) -> Group {
        let mut group = Group::new(self.module_id, "General");
        group.settings = settings;
        group.permissions = grants
            .iter()
            .map(|(scope, role)| self.grant(group.id, *scope, *role))
            .collect();
        self.manager.save_group(&mut group).await.unwrap();
        group
    }

    /// A forum that follows its group's settings and permissions.
    pub async fn forum(&self, group: &Group, name: &str) -> Forum {
        let mut forum = Forum::new(group.id, name);
        self.manager.save_forum(&mut forum).await.unwrap();
        forum
    }
}
