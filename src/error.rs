//! Error types shared by every backend.

use crate::diagnostic::Diagnostic;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced at the `ProgramImpl` call boundary.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend lacks the capability.
    #[error("{operation} is not implemented on the {backend} backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    /// `materialize_runtime` has not run yet.
    #[error("runtime has not been materialized")]
    RuntimeNotMaterialized,

    /// No relink has succeeded yet, so there is no module to resolve from.
    #[error("no module has been linked yet")]
    RuntimeNotLinked,

    /// Toolchain invocation or module load failed during relink.
    /// Fatal for the session.
    #[error("link failed: {message}")]
    LinkFailure {
        message: String,
        diagnostics: Vec<Diagnostic>,
    },

    /// A registered kernel's symbol is missing after a successful relink.
    #[error("symbol `{0}` missing from the linked module")]
    SymbolResolution(String),

    #[error("unknown kernel `{0}`")]
    UnknownKernel(String),

    #[error("kernel `{0}` is already registered with a different body")]
    DuplicateKernel(String),

    #[error("invalid kernel `{kernel}`: {reason}")]
    InvalidKernel { kernel: String, reason: String },

    #[error("invalid snode tree {tree}: {reason}")]
    InvalidTree { tree: u32, reason: String },

    #[error("snode tree {0} is not materialized")]
    UnknownTree(u32),

    #[error("unknown snode {0}")]
    UnknownSNode(String),

    /// A launch indexed a field or ndarray out of range. The access was
    /// dropped (stores) or read as zero (loads).
    #[error("kernel `{0}` indexed a field or ndarray out of range")]
    IndexOutOfBounds(String),

    #[error("argument mismatch for `{kernel}`: {reason}")]
    ArgumentMismatch { kernel: String, reason: String },

    /// Freeing an allocation still referenced by outstanding work.
    #[error("allocation {0} is still referenced by submitted work")]
    DeviceAllocationInUse(u64),

    #[error("unknown allocation {0}")]
    UnknownAllocation(u64),

    #[error("invalid transfer: {0}")]
    Transfer(String),

    #[error("no GPU adapter available")]
    NoAdapter,

    #[error("device error: {0}")]
    Device(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("aot module error: {0}")]
    Aot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A launch panicked while holding the backend state.
    #[error("backend state poisoned by an earlier panic")]
    Poisoned,
}

impl BackendError {
    pub fn invalid_kernel(kernel: &str, reason: impl Into<String>) -> Self {
        BackendError::InvalidKernel {
            kernel: kernel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_tree(tree: u32, reason: impl Into<String>) -> Self {
        BackendError::InvalidTree {
            tree,
            reason: reason.into(),
        }
    }

    pub fn argument_mismatch(kernel: &str, reason: impl Into<String>) -> Self {
        BackendError::ArgumentMismatch {
            kernel: kernel.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_implemented(backend: &'static str, operation: &'static str) -> Self {
        BackendError::NotImplemented { backend, operation }
    }

    /// Whether the session must be abandoned after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::LinkFailure { .. }
                | BackendError::SymbolResolution(_)
                | BackendError::Poisoned
        )
    }
}
