//! Exporter trait and the built-in file drop exporter.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::PluginError;
use crate::models::{ExportSchemaConfig, Message};

/// Delivery sink for one configured export schema.
///
/// Implementations must be `Send + Sync`; one instance serves every task of
/// its schema concurrently.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Schema name the instance was configured under.
    fn name(&self) -> &str;

    /// Type name it was resolved from.
    fn module_type(&self) -> &str;

    /// Deliver one message on behalf of one of its topics.
    async fn export(&self, message: &Message, topic: &str) -> Result<(), PluginError>;

    /// Second and later delivery attempts.
    async fn retry(&self, message: &Message, topic: &str) -> Result<(), PluginError> {
        self.export(message, topic).await
    }
}

/// Writes each exported message as a JSON document into a drop directory.
///
/// Settings: `dir` (required).
pub struct FileDropExporter {
    name: String,
    dir: PathBuf,
}

impl FileDropExporter {
    pub const TYPE: &'static str = "file";

    pub fn from_config(config: &ExportSchemaConfig) -> Result<Arc<dyn Exporter>, PluginError> {
        let dir = config
            .settings
            .get("dir")
            .ok_or_else(|| PluginError::Config(format!("schema '{}' has no 'dir'", config.name)))?;
        Ok(Arc::new(Self {
            name: config.name.clone(),
            dir: PathBuf::from(dir),
        }))
    }
}

#[async_trait]
impl Exporter for FileDropExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> &str {
        Self::TYPE
    }

    async fn export(&self, message: &Message, topic: &str) -> Result<(), PluginError> {
        let target = self
            .dir
            .join(format!("{}-{}.json", message.id(), topic.replace('.', "_")));
        let raw = serde_json::to_vec_pretty(message)?;
        tokio::fs::write(&target, raw).await?;
        tracing::debug!(schema = %self.name, path = %target.display(), "Message dropped");
        Ok(())
    }

    async fn retry(&self, message: &Message, topic: &str) -> Result<(), PluginError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.export(message, topic).await
    }
}
