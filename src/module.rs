// Module subsystem
//
// A module owns its DI registrations, a private sub-router mounted at
// `/<name>`, and its lifecycle hooks. Registration walks the imports graph
// depth-first so a module registers only after everything it imports.

use crate::{AppConfig, Container, Error, Router};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a module needs while registering: the shared container, its
/// private router (mounted at `/<name>` afterwards), and the app config.
pub struct ModuleContext<'a> {
    pub container: &'a Container,
    pub router: &'a mut Router,
    pub config: &'a AppConfig,
}

/// Declare an exported type for [`Module::exports`].
pub fn export<T: Any>() -> (TypeId, &'static str) {
    (TypeId::of::<T>(), type_name::<T>())
}

/// A self-contained feature unit.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique name; doubles as the mount prefix.
    fn name(&self) -> &str;

    /// Modules that must register before this one.
    fn imports(&self) -> Vec<Arc<dyn Module>> {
        Vec::new()
    }

    /// Types `register` promises to put into the container.
    fn exports(&self) -> Vec<(TypeId, &'static str)> {
        Vec::new()
    }

    /// Register providers and routes.
    fn register(&self, ctx: &mut ModuleContext<'_>) -> Result<(), Error>;

    /// Runs before `register`.
    async fn on_init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after a successful `register` and mount.
    async fn on_ready(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs at shutdown, reverse registration order, best effort.
    async fn on_destroy(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Grey,
    Black,
}

/// Pre-boot validation: no two top-level modules may share a name, and the
/// imports graph must be acyclic.
pub fn validate_modules(modules: &[Arc<dyn Module>]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for module in modules {
        if !seen.insert(module.name().to_string()) {
            return Err(Error::DuplicateModuleName(module.name().to_string()));
        }
    }

    let mut colors: HashMap<String, Color> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();
    for module in modules {
        check_cycles(module.as_ref(), &mut colors, &mut stack)?;
    }
    Ok(())
}

fn check_cycles(
    module: &dyn Module,
    colors: &mut HashMap<String, Color>,
    stack: &mut Vec<String>,
) -> Result<(), Error> {
    let name = module.name().to_string();
    match colors.get(&name) {
        Some(Color::Black) => return Ok(()),
        Some(Color::Grey) => {
            let first = stack.iter().position(|n| n == &name).unwrap_or(0);
            let mut chain: Vec<String> = stack[first..].to_vec();
            chain.push(name);
            return Err(Error::CircularModuleImport { chain });
        }
        None => {}
    }

    colors.insert(name.clone(), Color::Grey);
    stack.push(name.clone());
    for import in module.imports() {
        check_cycles(import.as_ref(), colors, stack)?;
    }
    stack.pop();
    colors.insert(name, Color::Black);
    Ok(())
}

/// Tracks registered modules by name so diamond imports register once, and
/// remembers registration order for reverse-order teardown.
#[derive(Default)]
pub struct ModuleRegistry {
    registered: HashSet<String>,
    order: Vec<Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every top-level module (and, depth-first, its imports).
    /// Any failure aborts immediately; already-registered modules stay
    /// registered until shutdown disposes them.
    pub async fn register_all(
        &mut self,
        modules: &[Arc<dyn Module>],
        container: &Container,
        root: &mut Router,
        config: &AppConfig,
    ) -> Result<(), Error> {
        for module in modules {
            self.register_module(module.clone(), container, root, config).await?;
        }
        Ok(())
    }

    fn register_module<'a>(
        &'a mut self,
        module: Arc<dyn Module>,
        container: &'a Container,
        root: &'a mut Router,
        config: &'a AppConfig,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if self.registered.contains(module.name()) {
                return Ok(());
            }
            for import in module.imports() {
                self.register_module(import, container, root, config).await?;
            }

            debug!(module = module.name(), "Registering module");
            module.on_init().await?;

            let mut sub = Router::new();
            {
                let mut ctx = ModuleContext {
                    container,
                    router: &mut sub,
                    config,
                };
                module.register(&mut ctx)?;
            }

            for (type_id, type_name) in module.exports() {
                if !container.has_id(type_id) {
                    return Err(Error::ModuleExportMissing {
                        module: module.name().to_string(),
                        type_name: type_name.to_string(),
                    });
                }
            }

            root.mount(&format!("/{}", module.name()), sub);
            module.on_ready().await?;

            self.registered.insert(module.name().to_string());
            self.order.push(module);
            Ok(())
        })
    }

    /// Registration order, by name.
    pub fn registered_names(&self) -> Vec<String> {
        self.order.iter().map(|m| m.name().to_string()).collect()
    }

    /// Invoke `on_destroy` in reverse registration order. Errors are logged
    /// and never re-raised.
    pub async fn destroy_all(&self) {
        for module in self.order.iter().rev() {
            if let Err(err) = module.on_destroy().await {
                warn!(module = module.name(), error = %err, "on_destroy failed");
            }
        }
    }
}
