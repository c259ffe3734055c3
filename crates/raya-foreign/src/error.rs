//! Error types for the foreign-call runtime
//!
//! Recoverable conditions are reported as `ForeignError`. Conditions that can
//! only arise from a bug in the runtime itself (an ABI classifier and adapter
//! that disagree, a trampoline patched twice) or from a caller breaking the
//! release contract abort through [`invariant_violation`] and
//! [`programming_error`] instead.

/// Result type for foreign-call operations
pub type ForeignResult<T> = Result<T, ForeignError>;

/// Foreign-call runtime errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForeignError {
    /// No stub was registered for a descriptor during the build phase
    #[error(
        "Missing registration for {kind} with signature {signature} (requested at {call_site}); \
         register this signature at build time"
    )]
    MissingRegistration {
        /// Which registry was consulted ("downcall", "upcall")
        kind: &'static str,
        /// Human-readable signature of the descriptor
        signature: String,
        /// Source location of the binding that needed the stub
        call_site: String,
    },

    /// Executable memory could not be obtained from the OS
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The platform/ABI combination or a requested capability is not supported
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Abort on a broken internal invariant.
///
/// These indicate a logic bug at build time (for example the classifier
/// produced a storage list the adapter cannot reconcile) and are never
/// expected at run time.
#[cold]
#[track_caller]
pub fn invariant_violation(message: impl std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(target: "raya_foreign", %location, "internal invariant violated: {}", message);
    panic!("internal invariant violated: {}", message);
}

/// Abort on a caller contract breach (e.g. releasing an address that was
/// never handed out).
#[cold]
#[track_caller]
pub fn programming_error(message: impl std::fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(target: "raya_foreign", %location, "programming error: {}", message);
    panic!("programming error: {}", message);
}
