// Plugin subsystem
//
// Plugins extend the application after all modules are registered. They run
// in declaration order, share the application container and root router, and
// are disposed in reverse order at shutdown.

use crate::{AppConfig, Container, Error, Router};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registration context handed to each plugin: the shared container, the
/// root router, and the app config.
pub struct PluginContext<'a> {
    pub container: &'a Container,
    pub router: &'a mut Router,
    pub config: &'a AppConfig,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Register providers, routes, or middleware state.
    fn register(&self, ctx: &mut PluginContext<'_>) -> Result<(), Error>;

    /// Runs after a successful `register`, still during boot.
    async fn on_init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs at shutdown, reverse declaration order, best effort.
    async fn on_dispose(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Register every plugin in declaration order. Any failure aborts boot as
/// [`Error::PluginRegistrationFailed`].
pub(crate) async fn register_plugins(
    plugins: &[Arc<dyn Plugin>],
    container: &Container,
    root: &mut Router,
    config: &AppConfig,
) -> Result<(), Error> {
    for plugin in plugins {
        let mut ctx = PluginContext {
            container,
            router: &mut *root,
            config,
        };
        plugin.register(&mut ctx).map_err(|e| Error::PluginRegistrationFailed {
            plugin: plugin.name().to_string(),
            message: e.to_string(),
        })?;
        plugin.on_init().await.map_err(|e| Error::PluginRegistrationFailed {
            plugin: plugin.name().to_string(),
            message: e.to_string(),
        })?;
        debug!(plugin = plugin.name(), "Plugin registered");
    }
    Ok(())
}

/// Invoke `on_dispose` in reverse declaration order; errors are logged and
/// suppressed.
pub(crate) async fn dispose_plugins(plugins: &[Arc<dyn Plugin>]) {
    for plugin in plugins.iter().rev() {
        if let Err(err) = plugin.on_dispose().await {
            warn!(plugin = plugin.name(), error = %err, "on_dispose failed");
        }
    }
}
