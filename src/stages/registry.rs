//! Stage registry: maps pipeline names to stage factories.

use crate::core::node::{Category, PipelineStage, StageMetadata};
use indexmap::IndexMap;
use std::sync::Arc;

/// Factory function for creating stage instances.
pub type StageFactory = Arc<dyn Fn() -> Box<dyn PipelineStage> + Send + Sync>;

/// Registry entry containing metadata and factory.
#[derive(Clone)]
pub struct RegistryEntry {
    /// Factory function to create instances.
    pub factory: StageFactory,
    /// Cached metadata (avoids creating an instance just to read it).
    pub metadata: StageMetadata,
}

/// Registry of the stages a pipeline may name.
///
/// Built once at startup; the runner instantiates stages from it and the
/// validator reads their contracts without instantiating anything.
pub struct StageRegistry {
    stages: IndexMap<String, RegistryEntry>,
    categories: IndexMap<Category, Vec<String>>,
}

impl StageRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            stages: IndexMap::new(),
            categories: IndexMap::new(),
        }
    }

    /// Create a registry pre-populated with the built-in stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::stages::builtin::register_all(&mut registry);
        registry
    }

    /// Register a stage type.
    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn PipelineStage> + Send + Sync + 'static,
    {
        let metadata = factory().metadata();
        let id = metadata.id.clone();
        let category = metadata.category;

        self.stages.insert(
            id.clone(),
            RegistryEntry {
                factory: Arc::new(factory),
                metadata,
            },
        );
        let ids = self.categories.entry(category).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Create a new instance of a stage by name.
    pub fn create(&self, id: &str) -> Option<Box<dyn PipelineStage>> {
        self.stages.get(id).map(|e| (e.factory)())
    }

    /// Get metadata for a stage without creating an instance.
    pub fn get_metadata(&self, id: &str) -> Option<&StageMetadata> {
        self.stages.get(id).map(|e| &e.metadata)
    }

    /// Check if a stage is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    /// All registered stage names, in registration order.
    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(|s| s.as_str())
    }

    /// Stage names in a category.
    pub fn stages_by_category(&self, category: Category) -> Vec<&str> {
        self.categories
            .get(&category)
            .map(|ids| ids.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Categories that have at least one stage.
    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.keys()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PortType;

    #[test]
    fn test_builtins_registered() {
        let registry = StageRegistry::with_builtins();
        for name in [
            "undistort",
            "colorcarddetect",
            "colorcorrect",
            "traydetect",
            "potdetect",
            "plantextract",
            "featureextract",
            "writefeatures_csv",
            "writefeatures_ndarray",
            "imagewrite",
        ] {
            assert!(registry.contains(name), "{} missing", name);
            let stage = registry.create(name).unwrap();
            assert_eq!(stage.metadata().id, name);
        }
        assert_eq!(registry.len(), 10);
        assert!(registry.create("unknown").is_none());
    }

    #[test]
    fn test_signatures() {
        let registry = StageRegistry::with_builtins();
        let sig = |n: &str| {
            let m = registry.get_metadata(n).unwrap();
            (m.expects.clone(), m.returns.clone())
        };
        assert_eq!(
            sig("traydetect"),
            (
                vec![PortType::Image],
                vec![PortType::Image, PortType::Pyramid, PortType::TrayLocations]
            )
        );
        assert_eq!(
            sig("plantextract"),
            (
                vec![PortType::Image, PortType::PotLocations],
                vec![PortType::Image, PortType::PotMatrix]
            )
        );
        assert_eq!(sig("imagewrite"), (vec![PortType::Image], vec![]));
    }

    #[test]
    fn test_categories() {
        let registry = StageRegistry::with_builtins();
        assert_eq!(
            registry.stages_by_category(Category::Color),
            vec!["colorcarddetect", "colorcorrect"]
        );
        assert_eq!(registry.stages_by_category(Category::Output).len(), 3);
        assert_eq!(registry.categories().count(), 5);
    }
}
