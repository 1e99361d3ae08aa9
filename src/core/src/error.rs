use thiserror::Error;

/// Bytes of captured stderr kept on a failed RUN.
pub const STDERR_TAIL_LIMIT: usize = 4096;

/// Kiln build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed instruction, or unknown instruction under the strict policy
    #[error("Invalid build script: {0}")]
    ScriptInvalid(String),

    /// Base image could not be located
    #[error("Base image unresolved: {reference} - {message}")]
    BaseUnresolved { reference: String, message: String },

    /// Stage references do not form a DAG
    #[error("Stage cycle detected: {0}")]
    StageCycle(String),

    /// Build context inaccessible or ignore file malformed
    #[error("Build context error: {0}")]
    ContextError(String),

    /// COPY/ADD source missing from the context or the named stage
    #[error("COPY source not found: {0}")]
    CopySourceMissing(String),

    /// RUN exited with a nonzero status
    #[error("RUN failed with exit status {exit_status}: {instruction}")]
    RunFailed {
        exit_status: i32,
        instruction: String,
        stderr_tail: String,
    },

    /// RUN was terminated by a signal
    #[error("RUN killed by signal {signal}")]
    Killed { signal: i32 },

    /// Container runtime could not start the command
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Mount or unmount failure
    #[error("Mount failed: {0}")]
    MountFailed(String),

    /// Insufficient privileges for a sandbox or storage operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// LayerStore or ContentStore failure
    #[error("Storage error: {message}")]
    StorageError {
        message: String,
        layer: Option<String>,
    },

    /// Cached layer chain disagrees with the current top layer
    #[error("Layer cache inconsistent: {0}")]
    CacheInconsistent(String),

    /// External cancellation at a suspension point
    #[error("Build cancelled")]
    Cancelled,

    /// Failure inside a stage, located by stage and instruction index
    #[error("stage {stage}{}, instruction {instruction} ({created_by}): {source}", stage_suffix(.stage_name))]
    Stage {
        stage: usize,
        stage_name: Option<String>,
        instruction: usize,
        created_by: String,
        source: Box<BuildError>,
    },

    /// Failure while producing the named image
    #[error("building {image}: {source}")]
    Image {
        image: String,
        source: Box<BuildError>,
    },

    /// Image not present in the local store
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid command-line usage
    #[error("Usage error: {0}")]
    Usage(String),
}

/// Taxonomy tag of a [`BuildError`], independent of its context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScriptInvalid,
    BaseUnresolved,
    StageCycle,
    ContextError,
    CopySourceMissing,
    RunFailed,
    Killed,
    RuntimeUnavailable,
    MountFailed,
    PermissionDenied,
    StorageError,
    CacheInconsistent,
    Cancelled,
    ImageNotFound,
    Registry,
    Io,
    Serialization,
    Config,
    Usage,
}

impl BuildError {
    /// Shorthand for a storage failure not tied to a layer.
    pub fn storage(message: impl Into<String>) -> Self {
        BuildError::StorageError {
            message: message.into(),
            layer: None,
        }
    }

    /// Shorthand for a storage failure on a known layer.
    pub fn storage_layer(message: impl Into<String>, layer: impl Into<String>) -> Self {
        BuildError::StorageError {
            message: message.into(),
            layer: Some(layer.into()),
        }
    }

    /// The innermost error, with stage and image context removed.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Stage { source, .. } | BuildError::Image { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// `(stage index, instruction index)` of the failure, if known.
    pub fn stage_location(&self) -> Option<(usize, usize)> {
        match self {
            BuildError::Stage {
                stage, instruction, ..
            } => Some((*stage, *instruction)),
            BuildError::Image { source, .. } => source.stage_location(),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Stage { source, .. } | BuildError::Image { source, .. } => source.kind(),
            BuildError::ScriptInvalid(_) => ErrorKind::ScriptInvalid,
            BuildError::BaseUnresolved { .. } => ErrorKind::BaseUnresolved,
            BuildError::StageCycle(_) => ErrorKind::StageCycle,
            BuildError::ContextError(_) => ErrorKind::ContextError,
            BuildError::CopySourceMissing(_) => ErrorKind::CopySourceMissing,
            BuildError::RunFailed { .. } => ErrorKind::RunFailed,
            BuildError::Killed { .. } => ErrorKind::Killed,
            BuildError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            BuildError::MountFailed(_) => ErrorKind::MountFailed,
            BuildError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            BuildError::StorageError { .. } => ErrorKind::StorageError,
            BuildError::CacheInconsistent(_) => ErrorKind::CacheInconsistent,
            BuildError::Cancelled => ErrorKind::Cancelled,
            BuildError::ImageNotFound(_) => ErrorKind::ImageNotFound,
            BuildError::Registry { .. } => ErrorKind::Registry,
            BuildError::Io(_) => ErrorKind::Io,
            BuildError::Serialization(_) => ErrorKind::Serialization,
            BuildError::Config(_) => ErrorKind::Config,
            BuildError::Usage(_) => ErrorKind::Usage,
        }
    }

    /// Process exit code for the CLI.
    ///
    /// 0 is success; 1 general failure; 2 usage; 125 context or engine
    /// failure; 126/127 command not executable / not found; anything else is
    /// the RUN exit status.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            BuildError::RunFailed { exit_status, .. } => {
                if *exit_status == 0 {
                    1
                } else {
                    *exit_status
                }
            }
            BuildError::Killed { signal } => 128 + signal,
            BuildError::Usage(_) => 2,
            BuildError::ContextError(_)
            | BuildError::CopySourceMissing(_)
            | BuildError::BaseUnresolved { .. }
            | BuildError::RuntimeUnavailable(_)
            | BuildError::MountFailed(_)
            | BuildError::PermissionDenied(_)
            | BuildError::StorageError { .. }
            | BuildError::CacheInconsistent(_)
            | BuildError::Cancelled => 125,
            _ => 1,
        }
    }
}

fn stage_suffix(name: &Option<String>) -> String {
    name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default()
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn run_failed(code: i32) -> BuildError {
        BuildError::RunFailed {
            exit_status: code,
            instruction: "RUN false".to_string(),
            stderr_tail: String::new(),
        }
    }

    #[test]
    fn test_script_invalid_display() {
        let error = BuildError::ScriptInvalid("line 3: unknown flag --foo".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid build script: line 3: unknown flag --foo"
        );
    }

    #[test]
    fn test_run_failed_display() {
        assert_eq!(
            run_failed(1).to_string(),
            "RUN failed with exit status 1: RUN false"
        );
    }

    #[test]
    fn test_stage_display_with_name() {
        let error = BuildError::Stage {
            stage: 1,
            stage_name: Some("builder".to_string()),
            instruction: 4,
            created_by: "RUN make".to_string(),
            source: Box::new(run_failed(2)),
        };
        assert!(error
            .to_string()
            .starts_with("stage 1 (builder), instruction 4 (RUN make): "));
    }

    #[test]
    fn test_stage_display_without_name() {
        let error = BuildError::Stage {
            stage: 0,
            stage_name: None,
            instruction: 1,
            created_by: "RUN false".to_string(),
            source: Box::new(run_failed(1)),
        };
        assert!(error
            .to_string()
            .starts_with("stage 0, instruction 1 (RUN false): "));
    }

    #[test]
    fn test_root_cause_unwraps_context() {
        let error = BuildError::Image {
            image: "app:latest".to_string(),
            source: Box::new(BuildError::Stage {
                stage: 0,
                stage_name: None,
                instruction: 1,
                created_by: "RUN false".to_string(),
                source: Box::new(run_failed(1)),
            }),
        };
        assert_eq!(error.kind(), ErrorKind::RunFailed);
        assert_eq!(error.stage_location(), Some((0, 1)));
        assert!(matches!(
            error.root_cause(),
            BuildError::RunFailed { exit_status: 1, .. }
        ));
    }

    #[test]
    fn test_stage_location_absent() {
        assert_eq!(BuildError::Cancelled.stage_location(), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(run_failed(1).exit_code(), 1);
        assert_eq!(run_failed(42).exit_code(), 42);
        assert_eq!(run_failed(127).exit_code(), 127);
        assert_eq!(BuildError::Killed { signal: 9 }.exit_code(), 137);
        assert_eq!(BuildError::Usage("bad".to_string()).exit_code(), 2);
        assert_eq!(BuildError::ContextError("gone".to_string()).exit_code(), 125);
        assert_eq!(BuildError::storage("disk full").exit_code(), 125);
        assert_eq!(BuildError::StageCycle("a -> b -> a".to_string()).exit_code(), 1);
        assert_eq!(BuildError::ScriptInvalid("x".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_storage_layer_keeps_layer_id() {
        let error = BuildError::storage_layer("missing diff", "sha256:abc");
        match error {
            BuildError::StorageError { message, layer } => {
                assert_eq!(message, "missing diff");
                assert_eq!(layer.as_deref(), Some("sha256:abc"));
            }
            _ => panic!("Expected StorageError"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error: BuildError = io_error.into();
        assert!(matches!(error, BuildError::Io(_)));
        assert_eq!(error.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: BuildError = json_err.into();
        assert!(matches!(error, BuildError::Serialization(_)));
    }

    #[test]
    fn test_registry_error_display() {
        let error = BuildError::Registry {
            registry: "ghcr.io".to_string(),
            message: "unauthorized".to_string(),
        };
        assert_eq!(error.to_string(), "Registry error: ghcr.io - unauthorized");
    }
}
