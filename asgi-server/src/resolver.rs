//! `module:attribute` resolution against an in-process module registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::app::{Application, SharedApp};
use crate::errors::ResolutionError;

/// A named value exported by a module.
#[derive(Clone)]
pub enum Export {
    Application(SharedApp),
    Value(Value),
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Export::Application(_) => f.write_str("Application(..)"),
            Export::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

/// The exports of an initialized module.
#[derive(Debug, Default)]
pub struct Module {
    exports: HashMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(self, name: impl Into<String>, app: impl Application) -> Self {
        self.with_shared_app(name, Arc::new(app))
    }

    pub fn with_shared_app(mut self, name: impl Into<String>, app: SharedApp) -> Self {
        self.exports.insert(name.into(), Export::Application(app));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.exports.insert(name.into(), Export::Value(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }
}

type ModuleInit = Box<dyn Fn() -> anyhow::Result<Module> + Send + Sync>;

struct ModuleEntry {
    init: ModuleInit,
    // Failures are cached too: a module is initialized at most once.
    loaded: OnceLock<Result<Arc<Module>, String>>,
}

/// Registry of importable modules.
#[derive(Default)]
pub struct Resolver {
    modules: HashMap<String, ModuleEntry>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver preloaded with the `hello` and `echo` demo modules.
    pub fn with_builtin_modules() -> Self {
        let mut resolver = Self::new();
        crate::demos::register(&mut resolver);
        resolver
    }

    /// Registers `init` under `name`; it runs on first import only.
    pub fn register<F>(&mut self, name: impl Into<String>, init: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Module> + Send + Sync + 'static,
    {
        self.modules.insert(
            name.into(),
            ModuleEntry {
                init: Box::new(init),
                loaded: OnceLock::new(),
            },
        );
        self
    }

    pub fn import(&self, name: &str) -> Result<Arc<Module>, ResolutionError> {
        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| ResolutionError::ModuleNotFound(name.to_owned()))?;

        let loaded = entry.loaded.get_or_init(|| {
            tracing::debug!(module = name, "initializing module");
            (entry.init)()
                .map(Arc::new)
                .map_err(|err| format!("{err:#}"))
        });

        loaded.clone().map_err(|reason| ResolutionError::ModuleInit {
            module: name.to_owned(),
            reason,
        })
    }

    /// Resolves `module:attribute`, splitting on the last colon, and checks
    /// that the export is an application.
    pub fn resolve(&self, reference: &str) -> Result<SharedApp, ResolutionError> {
        let (module, attribute) = reference
            .rsplit_once(':')
            .ok_or_else(|| ResolutionError::MissingSeparator(reference.to_owned()))?;
        if module.is_empty() || attribute.is_empty() {
            return Err(ResolutionError::EmptyComponent(reference.to_owned()));
        }

        let exports = self.import(module)?;
        match exports.get(attribute) {
            Some(Export::Application(app)) => Ok(Arc::clone(app)),
            Some(Export::Value(_)) => Err(ResolutionError::NotAnApplication {
                module: module.to_owned(),
                attribute: attribute.to_owned(),
            }),
            None => Err(ResolutionError::AttributeNotFound {
                module: module.to_owned(),
                attribute: attribute.to_owned(),
            }),
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("Resolver").field("modules", &names).finish()
    }
}
