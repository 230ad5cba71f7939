//! Message engine: the entry points used by the session layer and importers.
//!
//! Wires the namespace tree, access resolver, message index, export
//! coordinator and system state together, and bootstraps them from the
//! repository at startup.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::{AccessResolver, UserDirectory};
use crate::config::Config;
use crate::db::{self, Repository};
use crate::errors::AppError;
use crate::export::{CommitHook, ExportCoordinator};
use crate::import::{ImportScheduler, ImportSink};
use crate::index::MessageIndex;
use crate::models::{
    property_types, AccessMode, Message, MessageEntry, MessageId, PermissionEntry, Property,
    TopicSchema, User, UserGroup,
};
use crate::namespace::NamespaceTree;
use crate::registry::PluginRegistry;
use crate::system::{
    Audience, FailureReport, FailureReporter, Notifier, SystemMode, SystemState, WireEvent,
};

/// Topic holding system notices.
pub const SYSTEM_TOPIC: &str = "SYSTEM";

/// Login used for messages posted by the system itself.
pub const SYSTEM_USER: &str = "root";

/// Shared services behind every engine operation.
pub struct Engine {
    config: Arc<Config>,
    repo: Arc<Repository>,
    tree: Arc<NamespaceTree>,
    access: Arc<AccessResolver>,
    index: Arc<MessageIndex>,
    export: Arc<ExportCoordinator>,
    system: Arc<SystemState>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<PluginRegistry>,
    reporter: FailureReporter,
}

impl Engine {
    /// Load every persisted record and bring the system to `Ready`.
    pub async fn bootstrap(
        config: Config,
        registry: Arc<PluginRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>, AppError> {
        let config = Arc::new(config);
        db::init_base(&config.base_path).await?;
        let repo = Arc::new(Repository::new(&config.base_path));
        let system = Arc::new(SystemState::new(config.ignore_dirty));

        let mut tree = NamespaceTree::build(&repo.topics().await?);
        let mut builtin_topics = vec![
            (SYSTEM_TOPIC, "System notices"),
            (config.import_emergency_topic.as_str(), "Imported messages with unknown topics"),
        ];
        if config.post_exceptions {
            builtin_topics.push((config.debug_topic.as_str(), "Import and export failure reports"));
        }
        for (path, description) in builtin_topics {
            if !tree.exists(path) && !tree.insert(&TopicSchema::new(path, description)) {
                return Err(AppError::Validation(format!(
                    "Built-in topic '{}' cannot be created",
                    path
                )));
            }
        }
        let tree = Arc::new(tree);

        let (reporter, reports) = if config.post_exceptions {
            let (reporter, reports) = FailureReporter::channel();
            (reporter, Some(reports))
        } else {
            (FailureReporter::disabled(), None)
        };

        let directory = Arc::new(UserDirectory::load(repo.users().await?, repo.groups().await?));
        let access = Arc::new(AccessResolver::new(
            Arc::clone(&tree),
            directory,
            config.default_mask,
        ));

        let index = Arc::new(MessageIndex::open(&repo.index_path()).await?);
        for entry in index.entries_since(None) {
            for topic in &entry.topics {
                tree.add_message(topic, entry.id);
            }
        }

        let hook: CommitHook = {
            let index = Arc::clone(&index);
            let notifier = Arc::clone(&notifier);
            Arc::new(move |id: MessageId, abandoned: &[String]| {
                if !abandoned.is_empty() {
                    warn!(id = %id, schemas = ?abandoned, "Message committed without some exports");
                }
                index.schedule_rewrite();
                notifier.broadcast(WireEvent::IndexCommitted { id }, Audience::Everyone);
            })
        };
        let export = Arc::new(
            ExportCoordinator::new(
                Arc::clone(&system),
                hook,
                config.export_retry_interval,
                config.export_max_attempts,
            )
            .with_reporter(reporter.clone()),
        );
        export.load_schemas(&repo.export_configs().await?, &registry);
        export.load_subscriptions(&tree);

        tree.deploy(&repo).await?;
        if config.create_reports {
            let path = repo.write_report("tree.txt", &tree.tree_report()).await?;
            info!(path = %path.display(), "Topic tree report written");
        }

        let engine = Arc::new(Self {
            config,
            repo,
            tree,
            access,
            index,
            export,
            system,
            notifier,
            registry,
            reporter,
        });
        if let Some(reports) = reports {
            Self::spawn_failure_poster(Arc::downgrade(&engine), reports);
        }

        engine.set_mode(SystemMode::Ready);
        if engine.config.post_init_message {
            engine.post_init_message().await?;
        }
        info!(messages = engine.index.len(), "Engine ready");
        Ok(engine)
    }

    // ==================== ACCESSORS ====================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tree(&self) -> &Arc<NamespaceTree> {
        &self.tree
    }

    pub fn access(&self) -> &Arc<AccessResolver> {
        &self.access
    }

    pub fn index(&self) -> &Arc<MessageIndex> {
        &self.index
    }

    pub fn export(&self) -> &Arc<ExportCoordinator> {
        &self.export
    }

    pub fn system(&self) -> &Arc<SystemState> {
        &self.system
    }

    pub fn set_mode(&self, mode: SystemMode) {
        self.system.set_mode(mode);
        self.notifier
            .broadcast(WireEvent::ModeChanged { mode }, Audience::Everyone);
    }

    // ==================== CHECKS ====================

    fn ensure_writable(&self) -> Result<(), AppError> {
        let mode = self.system.mode();
        if mode.accepts_posts() {
            Ok(())
        } else {
            Err(AppError::SystemNotReady(format!("System is {}", mode)))
        }
    }

    fn ensure_topics(&self, topics: &[String]) -> Result<(), AppError> {
        if topics.is_empty() {
            return Err(AppError::Validation("Message has no topics".to_string()));
        }
        for topic in topics {
            self.tree.get(topic)?;
        }
        Ok(())
    }

    fn ensure_access(&self, principal: &str, topics: &[String], mode: AccessMode) -> Result<(), AppError> {
        match self.access.check_all(principal, topics, mode) {
            Some(i) => Err(AppError::AccessDenied {
                topic: topics[i].clone(),
            }),
            None => Ok(()),
        }
    }

    /// The current author, or ADMIN on every topic of the message.
    fn ensure_author_or_admin(&self, principal: &str, entry: &MessageEntry) -> Result<(), AppError> {
        if principal == entry.current_author {
            return Ok(());
        }
        self.ensure_access(principal, &entry.topics, AccessMode::Admin)
    }

    fn ensure_property_types(&self, properties: &[Property]) -> Result<(), AppError> {
        let types = self.registry.property_types();
        match properties.iter().find(|p| !types.is_registered(&p.kind)) {
            Some(p) => Err(AppError::Validation(format!("Unknown property type '{}'", p.kind))),
            None => Ok(()),
        }
    }

    fn find(&self, id: MessageId) -> Result<MessageEntry, AppError> {
        self.index
            .by_id(id)
            .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))
    }

    // ==================== MESSAGE OPERATIONS ====================

    /// Publish a message on behalf of its author.
    pub async fn publish(&self, message: Message) -> Result<MessageId, AppError> {
        self.publish_inner(message, true).await
    }

    async fn publish_inner(&self, mut message: Message, check_access: bool) -> Result<MessageId, AppError> {
        self.ensure_writable()?;
        self.ensure_topics(&message.entry.topics)?;
        self.ensure_property_types(&message.entry.properties)?;

        let author = message.entry.current_author.clone();
        if check_access {
            self.ensure_access(&author, &message.entry.topics, AccessMode::Post)?;
        }

        message.entry.original_author = match message.entry.previous_id {
            Some(previous) => self.find(previous)?.current_author,
            None => author,
        };

        // Once appended the message is filed and exported whatever happens to
        // its bodies; a failed body write is logged and leaves that copy missing.
        message.entry = self.index.append(message.entry).await?;
        let id = message.id();

        for topic in &message.entry.topics {
            let Some(node) = self.tree.resolve(topic) else {
                continue;
            };
            if let Err(e) = self
                .repo
                .write_body(&node.storage_path, id, &message.content)
                .await
            {
                error!(id = %id, topic = %topic, error = %e, "Failed to write message body");
            }
        }
        for topic in &message.entry.topics {
            self.tree.add_message(topic, id);
        }

        info!(id = %id, topics = ?message.entry.topics, header = %message.entry.header, "Message posted");
        self.notifier.broadcast(
            WireEvent::MessagePosted {
                id,
                topics: message.entry.topics.clone(),
            },
            Audience::Everyone,
        );

        if self.config.io_enabled {
            self.export.publish(&message);
        }
        Ok(id)
    }

    /// Replace the editable fields and body of a message.
    pub async fn modify(&self, principal: &str, id: MessageId, template: Message) -> Result<(), AppError> {
        self.ensure_writable()?;
        let old = self.find(id)?;
        self.ensure_topics(&template.entry.topics)?;
        self.ensure_property_types(&template.entry.properties)?;

        self.ensure_access(principal, &template.entry.topics, AccessMode::Post)?;
        if principal != old.current_author {
            self.ensure_access(principal, &old.topics, AccessMode::Admin)?;
        }
        self.ensure_access(principal, &old.topics, AccessMode::Post)?;

        let mut updated = old.clone();
        updated.apply_template(&template.entry, principal);

        // Bodies first, new topics before kept ones, so a failure leaves the
        // index and membership on the old version.
        let (added, kept): (Vec<&String>, Vec<&String>) = updated
            .topics
            .iter()
            .partition(|t| !old.topics.contains(*t));
        let mut fresh_bodies: Vec<String> = Vec::new();
        for (topic, is_new) in added
            .into_iter()
            .map(|t| (t, true))
            .chain(kept.into_iter().map(|t| (t, false)))
        {
            let node = self.tree.get(topic)?;
            if let Err(e) = self
                .repo
                .write_body(&node.storage_path, id, &template.content)
                .await
            {
                error!(id = %id, topic = %topic, error = %e, "Failed to write modified body");
                for storage_path in &fresh_bodies {
                    if let Err(e) = self.repo.delete_body(storage_path, id).await {
                        warn!(id = %id, path = %storage_path, error = %e, "Failed to undo body write");
                    }
                }
                return Err(e);
            }
            if is_new {
                fresh_bodies.push(node.storage_path.clone());
            }
        }

        self.index.replace(updated.clone())?;

        for topic in old.topics.iter().filter(|t| !updated.topics.contains(*t)) {
            if let Some(node) = self.tree.resolve(topic) {
                if let Err(e) = self.repo.delete_body(&node.storage_path, id).await {
                    error!(id = %id, topic = %topic, error = %e, "Failed to remove moved body");
                }
            }
            self.tree.remove_message(topic, id);
        }
        for topic in &updated.topics {
            self.tree.add_message(topic, id);
        }

        info!(id = %id, editor = principal, "Message modified");
        self.notifier
            .broadcast(WireEvent::MessageModified { id }, Audience::Everyone);
        Ok(())
    }

    /// Remove a message, its bodies, membership and tag references.
    pub async fn delete(&self, principal: &str, id: MessageId) -> Result<(), AppError> {
        self.ensure_writable()?;
        let entry = self.find(id)?;
        self.ensure_author_or_admin(principal, &entry)?;

        self.index.delete(id)?;
        for topic in &entry.topics {
            if let Some(node) = self.tree.resolve(topic) {
                if let Err(e) = self.repo.delete_body(&node.storage_path, id).await {
                    error!(id = %id, topic = %topic, error = %e, "Failed to remove body");
                }
            }
            self.tree.remove_message(topic, id);
        }

        warn!(id = %id, by = principal, "Message removed from the system");
        self.notifier
            .broadcast(WireEvent::MessageDeleted { id }, Audience::Everyone);
        Ok(())
    }

    pub async fn add_property(
        &self,
        principal: &str,
        id: MessageId,
        kind: &str,
        text: Option<String>,
    ) -> Result<Property, AppError> {
        self.ensure_writable()?;
        if !self.registry.property_types().is_registered(kind) {
            return Err(AppError::Validation(format!("Unknown property type '{}'", kind)));
        }
        let entry = self.find(id)?;
        self.ensure_author_or_admin(principal, &entry)?;

        let property = self.index.update(id, |e| {
            e.add_property(kind, principal, text);
            e.properties
                .last()
                .cloned()
                .ok_or_else(|| AppError::Internal("Property was not stored".to_string()))
        })?;

        info!(id = %id, kind, by = principal, "Property added");
        self.notifier
            .broadcast(WireEvent::PropertiesChanged { id }, Audience::Everyone);
        Ok(property)
    }

    /// Remove the property of `kind` created at `timestamp`.
    pub async fn remove_property(
        &self,
        principal: &str,
        id: MessageId,
        kind: &str,
        timestamp: &str,
    ) -> Result<(), AppError> {
        self.ensure_writable()?;
        let entry = self.find(id)?;
        self.ensure_author_or_admin(principal, &entry)?;

        self.index.update(id, |e| {
            if e.remove_property(kind, timestamp) {
                Ok(())
            } else {
                Err(AppError::NotFound(format!(
                    "Property {} at {} not found on message {}",
                    kind, timestamp, id
                )))
            }
        })?;

        info!(id = %id, kind, by = principal, "Property removed");
        self.notifier
            .broadcast(WireEvent::PropertiesChanged { id }, Audience::Everyone);
        Ok(())
    }

    // ==================== READ OPERATIONS ====================

    /// Body of a message as filed under one of its topics.
    pub async fn read_body(&self, principal: &str, id: MessageId, topic: &str) -> Result<String, AppError> {
        let entry = self.find(id)?;
        if !entry.topics.iter().any(|t| t == topic) {
            return Err(AppError::NotFound(format!(
                "Message {} is not filed under '{}'",
                id, topic
            )));
        }
        if !self.access.check(principal, topic, AccessMode::Read) {
            return Err(AppError::AccessDenied {
                topic: topic.to_string(),
            });
        }
        let node = self.tree.get(topic)?;
        self.repo.read_body(&node.storage_path, id).await
    }

    /// Entries newer than `after` that the principal may read on at least one topic.
    pub fn entries_since(&self, principal: &str, after: Option<MessageId>) -> Vec<MessageEntry> {
        self.index
            .entries_since(after)
            .into_iter()
            .filter(|e| {
                e.topics
                    .iter()
                    .any(|t| self.access.check(principal, t, AccessMode::Read))
            })
            .collect()
    }

    // ==================== ADMINISTRATION ====================

    /// Replace a topic's permission list and persist the topic.
    pub async fn set_topic_permissions(
        &self,
        principal: &str,
        topic: &str,
        permissions: Option<Vec<PermissionEntry>>,
    ) -> Result<(), AppError> {
        self.tree.get(topic)?;
        if !self.access.check(principal, topic, AccessMode::Admin) {
            return Err(AppError::AccessDenied {
                topic: topic.to_string(),
            });
        }
        self.tree.set_permissions(topic, permissions)?;
        let schema = self.tree.get(topic)?.to_schema();
        self.repo.save_topic(&schema).await
    }

    /// Check credentials. Disabled and unknown logins are refused.
    pub fn login(&self, login: &str, password_hash: &str) -> Result<User, AppError> {
        let user = self.access.authenticate(login, password_hash)?;
        info!(login, admin = self.access.is_admin(login), "User logged in");
        Ok(user)
    }

    fn ensure_admin(&self, principal: &str) -> Result<(), AppError> {
        if self.access.is_admin(principal) {
            Ok(())
        } else {
            Err(AppError::Unauthorized(format!(
                "User '{}' may not administer users",
                principal
            )))
        }
    }

    /// Create or replace a user. Only administrators may do this.
    pub async fn save_user(&self, principal: &str, user: User) -> Result<(), AppError> {
        self.ensure_admin(principal)?;
        if user.login.is_empty() {
            return Err(AppError::Validation("User has no login".to_string()));
        }
        self.repo.save_user(&user).await?;
        let login = user.login.clone();
        self.access.directory().upsert_user(user);

        info!(login = %login, by = principal, "User saved");
        self.notifier.broadcast(
            WireEvent::UserUpdated {
                login: login.clone(),
            },
            Audience::User(login),
        );
        Ok(())
    }

    /// Create or replace a group. Only administrators may do this.
    pub async fn save_group(&self, principal: &str, group: UserGroup) -> Result<(), AppError> {
        self.ensure_admin(principal)?;
        if group.name.is_empty() {
            return Err(AppError::Validation("Group has no name".to_string()));
        }
        self.repo.save_group(&group).await?;
        let name = group.name.clone();
        self.access.directory().upsert_group(group);

        info!(group = %name, by = principal, "Group saved");
        self.notifier
            .broadcast(WireEvent::GroupUpdated { name }, Audience::Admins);
        Ok(())
    }

    // ==================== FAILURE REPORTS ====================

    fn spawn_failure_poster(engine: Weak<Self>, mut reports: mpsc::UnboundedReceiver<FailureReport>) {
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.post_failure(&report).await {
                    warn!(origin = %report.origin, error = %e, "Failure report not posted");
                }
            }
        });
    }

    /// Post a failure report to the debug topic. Reports are never exported.
    async fn post_failure(&self, report: &FailureReport) -> Result<MessageId, AppError> {
        let content = format!(
            "{}\n\n{}\n\n{}",
            report.origin,
            report.detail,
            chrono::Utc::now().to_rfc3339()
        );
        let mut message = Message::new(
            "Failure report",
            SYSTEM_USER,
            "EN",
            &[self.config.debug_topic.as_str()],
            &["bulletin", "failures"],
            &content,
        );
        message
            .entry
            .add_property(property_types::PROCESSING_FORBIDDEN, SYSTEM_USER, None);
        self.publish_inner(message, false).await
    }

    /// Post the startup notice to the system topic.
    pub async fn post_init_message(&self) -> Result<MessageId, AppError> {
        let content = format!(
            "Bulletin {} started.\nThe system is ready to accept messages.\n\n{}",
            env!("CARGO_PKG_VERSION"),
            chrono::Utc::now().to_rfc3339()
        );
        let message = Message::new(
            "System notice",
            SYSTEM_USER,
            "EN",
            &[SYSTEM_TOPIC],
            &["announcement"],
            &content,
        );
        self.publish_inner(message, false).await
    }

    /// Build the import scheduler and start it when I/O is enabled.
    pub async fn start_imports(self: &Arc<Self>) -> Result<Arc<ImportScheduler>, AppError> {
        let sink: Arc<dyn ImportSink> = Arc::clone(self) as Arc<dyn ImportSink>;
        let scheduler = Arc::new(
            ImportScheduler::new(Arc::clone(&self.system), sink).with_reporter(self.reporter.clone()),
        );
        if !self.config.io_enabled {
            info!("I/O disabled, import sources not started");
            return Ok(scheduler);
        }
        scheduler.load(&self.repo.import_configs().await?, &self.registry);
        scheduler.start();
        Ok(scheduler)
    }

    /// Refuse further writes, stop the export sweeper and flush the index.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.set_mode(SystemMode::Closing);
        self.export.stop();
        self.index.rewrite().await?;
        let dirty = self.system.dirty_modules();
        if !dirty.is_empty() {
            warn!(modules = ?dirty, "Stopping with dirty modules");
        }
        info!(pending_exports = self.export.retry_queue_len(), "Engine stopped");
        Ok(())
    }
}

#[async_trait]
impl ImportSink for Engine {
    /// Publish an imported message, rerouting it to the emergency topic when
    /// any of its topics is unknown.
    async fn accept(&self, mut message: Message) -> Result<MessageId, AppError> {
        let unknown: Vec<_> = message
            .entry
            .topics
            .iter()
            .filter(|t| !self.tree.exists(t))
            .cloned()
            .collect();
        if !unknown.is_empty() || message.entry.topics.is_empty() {
            warn!(
                header = %message.entry.header,
                unknown = ?unknown,
                target = %self.config.import_emergency_topic,
                "Rerouting imported message"
            );
            message.entry.topics = vec![self.config.import_emergency_topic.clone()];
        }
        let before = message.entry.properties.len();
        message.entry.clean_properties();
        if message.entry.properties.len() < before {
            info!(
                header = %message.entry.header,
                dropped = before - message.entry.properties.len(),
                "Dropped imported properties"
            );
        }
        self.publish_inner(message, false).await
    }
}
