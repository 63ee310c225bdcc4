//! Explicit registration table for in-process analyses and extra routes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use tracing::info;

use super::Analysis;

/// Creates a fresh analysis instance for a new session.
pub type AnalysisFactory = Arc<dyn Fn() -> Box<dyn Analysis> + Send + Sync>;

/// Registry of in-process analysis factories and per-analysis extra routes.
///
/// Populated once at startup by the composition root; the host iterates it
/// instead of discovering implementations at runtime.
#[derive(Default, Clone)]
pub struct AnalysisRegistry {
    factories: HashMap<String, AnalysisFactory>,
    routes: HashMap<String, Router>,
}

impl AnalysisRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the analyses shipped with the host.
    #[must_use]
    pub fn packaged() -> Self {
        let mut registry = Self::new();
        super::packaged::register(&mut registry);
        registry
    }

    /// Registers the factory for an in-process analysis.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Analysis> + Send + Sync + 'static,
    {
        let name = name.into();
        info!(analysis = %name, "in-process analysis registered");
        self.factories.insert(name, Arc::new(factory));
        self
    }

    /// Registers extra routes served under `/<name>/`.
    pub fn register_routes(&mut self, name: impl Into<String>, routes: Router) -> &mut Self {
        self.routes.insert(name.into(), routes);
        self
    }

    /// Factory registered for `name`.
    #[must_use]
    pub fn factory(&self, name: &str) -> Option<AnalysisFactory> {
        self.factories.get(name).cloned()
    }

    /// Extra routes registered for `name`.
    #[must_use]
    pub fn routes(&self, name: &str) -> Option<Router> {
        self.routes.get(name).cloned()
    }

    /// Every registered route set, for mounting.
    #[must_use]
    pub fn all_routes(&self) -> Vec<(String, Router)> {
        self.routes
            .iter()
            .map(|(name, routes)| (name.clone(), routes.clone()))
            .collect()
    }

    /// Names of all registered in-process analyses.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
