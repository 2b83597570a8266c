use std::sync::Arc;

use crate::config::Config;
use crate::errors::ServiceError;
use crate::translate::TranslationEngine;

/// Process-wide state: configuration plus the loaded translation
/// engine. Built once at startup, cloned per request, never mutated.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<TranslationEngine>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let engine = TranslationEngine::load(&config.translator)?;
        Ok(Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
        })
    }

    /// Assemble state around a pre-built engine; used by tests to
    /// inject lightweight collaborators.
    pub fn with_engine(config: Config, engine: TranslationEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
        }
    }
}
