use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MigrateError;
use crate::handler::{EntityHandler, EntitySpec, MappedHandler};

/// Run-wide values handlers are built with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSettings {
    /// Destination company written by handlers that need one.
    pub company_id: Option<i64>,
    /// Destination field that receives the source id on create.
    pub legacy_id_field: Option<String>,
}

/// Builds the handler for one entity type.
pub type HandlerFactory = Box<dyn Fn(&HandlerSettings) -> Box<dyn EntityHandler>>;

/// Entity type name → handler factory.
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
    settings: HandlerSettings,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(settings: HandlerSettings) -> Self {
        Self {
            factories: BTreeMap::new(),
            settings,
        }
    }

    /// Registry holding the built-in entity types.
    #[must_use]
    pub fn with_defaults(settings: HandlerSettings) -> Self {
        let mut registry = Self::new(settings);
        super::builtin::register_defaults(&mut registry);
        registry
    }

    #[must_use]
    pub const fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    /// Register a factory, replacing any previous one for `entity_type`.
    pub fn register(&mut self, entity_type: impl Into<String>, factory: HandlerFactory) {
        let entity_type = entity_type.into();
        if self.factories.insert(entity_type.clone(), factory).is_some() {
            debug!(entity_type = %entity_type, "handler replaced");
        }
    }

    /// Register a declarative [`EntitySpec`].
    pub fn register_spec(&mut self, spec: EntitySpec) {
        let name = spec.name.clone();
        self.register(
            name,
            Box::new(move |settings: &HandlerSettings| -> Box<dyn EntityHandler> {
                Box::new(MappedHandler::new(spec.clone(), settings))
            }),
        );
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.factories.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the handler for `entity_type`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::HandlerNotConfigured`] if nothing is registered.
    pub fn build(&self, entity_type: &str) -> Result<Box<dyn EntityHandler>, MigrateError> {
        self.factories
            .get(entity_type)
            .map(|factory| factory(&self.settings))
            .ok_or_else(|| MigrateError::HandlerNotConfigured(entity_type.to_string()))
    }

    /// Dependencies of a registered entity type, `None` if unregistered.
    #[must_use]
    pub fn dependencies(&self, entity_type: &str) -> Option<Vec<String>> {
        self.build(entity_type).ok().map(|handler| handler.dependencies())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entity_types", &self.factories.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}
