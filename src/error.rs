//! Error taxonomy for the plugin host.
//!
//! Every failure the host can surface carries a stable string code (used in
//! the `plugin_error` payload sent to the shell) and a retryability flag
//! consulted by the retry executor. Command-layer code converts these into
//! response envelopes; nothing in the host panics on adversarial plugin
//! behaviour.

use std::net::IpAddr;

/// Convenience alias used throughout the crate.
pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    // -- Manifest & trust -------------------------------------------------
    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("manifest invariant violated: {0}")]
    ManifestInvariant(String),

    #[error("integrity mismatch for \"{path}\"")]
    IntegrityMismatch { path: String },

    #[error("manifest carries no signature")]
    MissingSignature,

    #[error("signature references unknown key id \"{0}\"")]
    UnknownKeyId(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("signature key \"{0}\" is not trusted")]
    SignatureUntrusted(String),

    #[error("plugin declares api version {declared}, runtime supports {supported}")]
    IncompatibleApiVersion { declared: String, supported: String },

    // -- Filesystem & extraction ------------------------------------------
    #[error("path \"{0}\" escapes its root")]
    PathTraversal(String),

    #[error("symbolic link rejected at \"{0}\"")]
    SymlinkRejected(String),

    #[error("archive entry \"{path}\" too large ({size} > {max} bytes)")]
    EntryTooLarge { path: String, size: u64, max: u64 },

    #[error("archive too large ({written} > {max} bytes written)")]
    ArchiveTooLarge { written: u64, max: u64 },

    #[error("archive has too many entries ({count} > {max})")]
    TooManyEntries { count: usize, max: usize },

    #[error("forbidden file extension in \"{0}\"")]
    ForbiddenExtension(String),

    // -- Runtime -----------------------------------------------------------
    #[error("plugin execution timed out")]
    Timeout,

    #[error("plugin exceeded its memory limit")]
    OutOfMemory,

    #[error("plugin exceeded its stack limit")]
    StackOverflow,

    #[error("plugin threw: {0}")]
    JsException(String),

    #[error("sandbox initialisation failed: {0}")]
    RuntimeInit(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {message}")]
    TaskPanic { message: String },

    // -- Capabilities -------------------------------------------------------
    #[error("plugin \"{plugin_id}\" lacks the \"{capability}\" permission")]
    PermissionDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("unsupported api: {0}")]
    UnsupportedApi(String),

    #[error("call depth {depth} exceeds the maximum of {max}")]
    CallDepthExceeded { depth: u32, max: u32 },

    // -- Fetch --------------------------------------------------------------
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("dns resolution failed for \"{0}\"")]
    DnsError(String),

    #[error("address {0} is blocked by network policy")]
    BlockedAddress(IpAddr),

    #[error("too many in-flight requests")]
    TooManyRequests,

    #[error("response too large ({size} > {max} bytes)")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("content-length {0} does not fit in memory on this platform")]
    ContentLengthOverflow(u64),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("failed to read response body: {0}")]
    ReadError(String),

    #[error("http client unavailable for this session")]
    ClientNotInitialized,

    // -- Retry / rate -------------------------------------------------------
    #[error("invalid retry configuration: {0}")]
    RetryConfigError(String),

    #[error("rate limit would be exceeded for \"{plugin_id}\"")]
    WouldExceed { plugin_id: String },

    // -- Concurrency & housekeeping ----------------------------------------
    #[error("lock contention in {0}")]
    LockContention(&'static str),

    #[error("scheduler queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("unknown plugin \"{0}\"")]
    UnknownPlugin(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config value: {0}")]
    ConfigInvalid(String),
}

impl HostError {
    /// Stable machine-readable code, surfaced on `ipc:plugin_error` and in
    /// command envelopes. Never change an existing code; plugins and the
    /// shell match on them.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::ManifestParse(_) => "ManifestParse",
            HostError::ManifestInvariant(_) => "ManifestInvariant",
            HostError::IntegrityMismatch { .. } => "IntegrityMismatch",
            HostError::MissingSignature => "MissingSignature",
            HostError::UnknownKeyId(_) => "UnknownKeyId",
            HostError::MalformedSignature(_) => "MalformedSignature",
            HostError::BadSignature => "BadSignature",
            HostError::SignatureUntrusted(_) => "SignatureUntrusted",
            HostError::IncompatibleApiVersion { .. } => "IncompatibleApiVersion",
            HostError::PathTraversal(_) => "PathTraversal",
            HostError::SymlinkRejected(_) => "SymlinkRejected",
            HostError::EntryTooLarge { .. } => "EntryTooLarge",
            HostError::ArchiveTooLarge { .. } => "ArchiveTooLarge",
            HostError::TooManyEntries { .. } => "TooManyEntries",
            HostError::ForbiddenExtension(_) => "ForbiddenExtension",
            HostError::Timeout => "Timeout",
            HostError::OutOfMemory => "OutOfMemory",
            HostError::StackOverflow => "StackOverflow",
            HostError::JsException(_) => "JsException",
            HostError::RuntimeInit(_) => "RuntimeInit",
            HostError::Cancelled => "Cancelled",
            HostError::TaskPanic { .. } => "TaskPanic",
            HostError::PermissionDenied { .. } => "PermissionDenied",
            HostError::UnsupportedApi(_) => "UnsupportedApi",
            HostError::CallDepthExceeded { .. } => "CallDepthExceeded",
            HostError::InvalidUrl(_) => "InvalidUrl",
            HostError::DnsError(_) => "DnsError",
            HostError::BlockedAddress(_) => "BlockedAddress",
            HostError::TooManyRequests => "TooManyRequests",
            HostError::ResponseTooLarge { .. } => "ResponseTooLarge",
            HostError::ContentLengthOverflow(_) => "ContentLengthOverflow",
            HostError::NetworkError(_) => "NetworkError",
            HostError::ReadError(_) => "ReadError",
            HostError::ClientNotInitialized => "ClientNotInitialized",
            HostError::RetryConfigError(_) => "RetryConfigError",
            HostError::WouldExceed { .. } => "WouldExceed",
            HostError::LockContention(_) => "LockContention",
            HostError::QueueFull { .. } => "QueueFull",
            HostError::UnknownPlugin(_) => "UnknownPlugin",
            HostError::Io(_) => "Io",
            HostError::ConfigInvalid(_) => "ConfigInvalid",
        }
    }

    /// Whether the retry executor may re-attempt an operation that failed
    /// with this error. Only transient network conditions and
    /// rate-limit-after-wait qualify; everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostError::NetworkError(_)
                | HostError::ReadError(_)
                | HostError::DnsError(_)
                | HostError::TooManyRequests
                | HostError::WouldExceed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HostError::BadSignature.code(), "BadSignature");
        assert_eq!(HostError::Timeout.code(), "Timeout");
        assert_eq!(
            HostError::BlockedAddress("127.0.0.1".parse().unwrap()).code(),
            "BlockedAddress"
        );
        assert_eq!(
            HostError::WouldExceed {
                plugin_id: "p".into()
            }
            .code(),
            "WouldExceed"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(HostError::NetworkError("reset".into()).is_retryable());
        assert!(HostError::TooManyRequests.is_retryable());
        assert!(HostError::DnsError("example.test".into()).is_retryable());
        assert!(!HostError::BadSignature.is_retryable());
        assert!(!HostError::PermissionDenied {
            plugin_id: "p".into(),
            capability: "network".into()
        }
        .is_retryable());
        assert!(!HostError::Timeout.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let e = HostError::IntegrityMismatch {
            path: "plugin.js".into(),
        };
        assert!(e.to_string().contains("plugin.js"));

        let e = HostError::CallDepthExceeded { depth: 4, max: 3 };
        assert!(e.to_string().contains('4'));
        assert!(e.to_string().contains('3'));
    }
}
