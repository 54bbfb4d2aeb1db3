use thiserror::Error;

#[derive(Debug, Error)]
pub enum WayfareError {
    // Configuration errors: thrown synchronously, never retried internally
    #[error("Run not initialized: call init_new_run or init_existing_run first")]
    NotInitialized,

    #[error("No start locations provided")]
    NoStartLocations,

    #[error("Start locations reference different root objects: {0} vs {1}")]
    MismatchedStartLocations(String, String),

    #[error("Config error: {0}")]
    Config(String),

    // Data-resolution failures: scoped to the affected branch
    #[error("Graph object not found: {object_type} {object_id}")]
    ObjectNotFound {
        object_type: String,
        object_id: String,
    },

    #[error("Location not found: {location_id} in {object_id}")]
    LocationNotFound {
        object_id: String,
        location_id: String,
    },

    #[error("Subroutine context not found for instance {0}")]
    ContextNotFound(String),

    #[error("No navigator registered for graph kind: {0}")]
    NavigatorNotFound(String),

    // Run-level failures
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run has no resumable branches: {0}")]
    NothingToResume(String),

    // Executor errors
    #[error("Subroutine execution failed: {subroutine}: {message}")]
    Execution { subroutine: String, message: String },

    #[error("Unsupported unit type: {0}")]
    UnsupportedUnitType(String),

    // Storage errors: fatal to the loop, authoritative state would diverge
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Notifier errors: logged and swallowed by the loop, never fatal
    #[error("Notifier error: {0}")]
    Notifier(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WayfareError>;
