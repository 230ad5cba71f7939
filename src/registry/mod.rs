//! Plugin registry.
//!
//! Maps a configured type name to a factory that builds the exporter or
//! importer for one schema. Populated in-process at startup; there is no
//! discovery from disk.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::errors::PluginError;
use crate::export::{Exporter, FileDropExporter};
use crate::import::{Importer, SpoolImporter};
use crate::models::{ExportSchemaConfig, ImportSchemaConfig, PropertyTypes};

pub type ExporterFactory =
    Arc<dyn Fn(&ExportSchemaConfig) -> Result<Arc<dyn Exporter>, PluginError> + Send + Sync>;
pub type ImporterFactory =
    Arc<dyn Fn(&ImportSchemaConfig) -> Result<Arc<dyn Importer>, PluginError> + Send + Sync>;

/// Registry of exporter and importer factories plus known property types.
pub struct PluginRegistry {
    exporters: RwLock<HashMap<String, ExporterFactory>>,
    importers: RwLock<HashMap<String, ImporterFactory>>,
    property_types: Arc<PropertyTypes>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            exporters: RwLock::new(HashMap::new()),
            importers: RwLock::new(HashMap::new()),
            property_types: Arc::new(PropertyTypes::with_defaults()),
        }
    }

    /// Registry with the built-in file drop exporter and spool importer.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_exporter(FileDropExporter::TYPE, Arc::new(FileDropExporter::from_config));
        registry.register_importer(SpoolImporter::TYPE, Arc::new(SpoolImporter::from_config));
        registry
    }

    pub fn register_exporter(&self, type_name: &str, factory: ExporterFactory) {
        info!(type_name, "Registered exporter type");
        self.exporters.write().insert(type_name.to_string(), factory);
    }

    pub fn register_importer(&self, type_name: &str, factory: ImporterFactory) {
        info!(type_name, "Registered importer type");
        self.importers.write().insert(type_name.to_string(), factory);
    }

    /// Accept an additional message property type.
    pub fn register_property_type(&self, kind: &str) {
        if self.property_types.register(kind) {
            info!(kind, "Registered property type");
        }
    }

    pub fn resolve_exporter(&self, type_name: &str) -> Option<ExporterFactory> {
        self.exporters.read().get(type_name).cloned()
    }

    pub fn resolve_importer(&self, type_name: &str) -> Option<ImporterFactory> {
        self.importers.read().get(type_name).cloned()
    }

    pub fn property_types(&self) -> &Arc<PropertyTypes> {
        &self.property_types
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.resolve_exporter("file").is_some());
        assert!(registry.resolve_importer("spool").is_some());
        assert!(registry.resolve_exporter("mail").is_none());
    }

    #[test]
    fn test_factory_builds_configured_instance() {
        let registry = PluginRegistry::with_builtins();
        let factory = registry.resolve_exporter("file").unwrap();
        let config = ExportSchemaConfig::new("drop", "file").with_setting("dir", "/tmp/drop");
        let exporter = factory(&config).unwrap();
        assert_eq!(exporter.name(), "drop");
        assert_eq!(exporter.module_type(), "file");
    }

    #[test]
    fn test_property_type_registration() {
        let registry = PluginRegistry::new();
        registry.register_property_type("EXPORT_MAIL");
        assert!(registry.property_types().is_registered("EXPORT_MAIL"));
    }
}
