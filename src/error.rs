// Error types for the gantry runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Not registered: {0}. Register it on the container before resolving.")]
    NotRegistered(String),

    #[error("Already registered: {0}. Use override_singleton to replace an existing registration.")]
    AlreadyRegistered(String),

    #[error("Circular dependency: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Module '{module}' declares export {type_name} but did not register it")]
    ModuleExportMissing { module: String, type_name: String },

    #[error("Duplicate module name: '{0}'")]
    DuplicateModuleName(String),

    #[error("Circular module import: {}", .chain.join(" -> "))]
    CircularModuleImport { chain: Vec<String> },

    #[error("Plugin '{plugin}' failed to register: {message}")]
    PluginRegistrationFailed { plugin: String, message: String },

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("WebSocket upgrade failed: {0}")]
    WebSocketUpgradeFailed(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status this error surfaces as when it reaches a writer.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RouteNotFound(_) => 404,
            Error::MethodNotAllowed(_) => 405,
            Error::MalformedBody(_) => 400,
            Error::PayloadTooLarge(_) => 413,
            Error::Unauthorized(_) => 401,
            Error::WebSocketUpgradeFailed(_) => 400,
            // Configuration and runtime failures are server faults.
            Error::NotRegistered(_)
            | Error::AlreadyRegistered(_)
            | Error::CircularDependency { .. }
            | Error::ModuleExportMissing { .. }
            | Error::DuplicateModuleName(_)
            | Error::CircularModuleImport { .. }
            | Error::PluginRegistrationFailed { .. }
            | Error::HandlerFailed(_)
            | Error::Cancelled
            | Error::Serialization(_)
            | Error::Internal(_)
            | Error::Io(_) => 500,
        }
    }

    /// True for kinds that abort boot rather than surface as a response.
    pub fn is_boot_error(&self) -> bool {
        matches!(
            self,
            Error::NotRegistered(_)
                | Error::AlreadyRegistered(_)
                | Error::CircularDependency { .. }
                | Error::ModuleExportMissing { .. }
                | Error::DuplicateModuleName(_)
                | Error::CircularModuleImport { .. }
                | Error::PluginRegistrationFailed { .. }
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerFailed(msg.into())
    }
}
