use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `codewarden`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains at the collaborator seams.
///
/// A rejected approval is never an error — rejection is an expected business
/// outcome and is modeled as data (see `lifecycle::EvaluationOutcome`).
#[derive(Debug, Error)]
pub enum WardenError {
    // ── Control channel ──────────────────────────────────────────────────
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    // ── Approval round trip ──────────────────────────────────────────────
    #[error("timeout: {0}")]
    Timeout(#[from] TimeoutError),

    // ── Token lifecycle ──────────────────────────────────────────────────
    #[error("token: {0}")]
    Token(#[from] TokenError),

    // ── Request validation ───────────────────────────────────────────────
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    // ── Sandbox resources ────────────────────────────────────────────────
    #[error("resource: {0}")]
    Resource(#[from] ResourceError),

    // ── Payload confidentiality ──────────────────────────────────────────
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    // ── Operation context wrapper ────────────────────────────────────────
    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<WardenError>,
    },

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Wrap this error with the name of the lifecycle operation that
    /// observed it (`evaluate` / `execute`). Already-wrapped errors keep
    /// their original operation.
    #[must_use]
    pub fn in_operation(self, operation: &'static str) -> Self {
        match self {
            Self::Operation { .. } => self,
            other => Self::Operation {
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Peel operation wrappers to reach the underlying subsystem error.
    #[must_use]
    pub fn root(&self) -> &WardenError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }
}

// ─── Control-channel errors ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("control channel is not connected")]
    NotConnected,

    #[error("control channel disconnected while a request was in flight")]
    Disconnected,

    #[error("a correlated request is already awaiting a reply")]
    AlreadyAwaiting,

    #[error("transport: {0}")]
    Transport(String),
}

// ─── Approval timeout ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("no reply within {waited_ms} ms")]
pub struct TimeoutError {
    pub waited_ms: u64,
}

// ─── Token errors ───────────────────────────────────────────────────────────

/// A token that is missing, mismatched, or already consumed. The store never
/// distinguishes the three cases — a stale token value must learn nothing
/// about the live one.
#[derive(Debug, Error)]
#[error("{kind} token is missing, mismatched, or already consumed")]
pub struct TokenError {
    pub kind: TokenKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Planning,
    Execution,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

// ─── Validation errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("code body has {actual} lines, exceeding the {max}-line ceiling")]
    CodeTooLarge { max: usize, actual: usize },

    #[error("malformed approval reply: {0}")]
    MalformedReply(String),

    #[error("empty code body")]
    EmptyCode,
}

// ─── Sandbox resource errors ────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no reachable sandbox endpoints for scope '{scope}'")]
    NoEndpoints { scope: String },

    #[error("resource lookup failed: {0}")]
    Lookup(String),
}

// ─── Crypto errors ──────────────────────────────────────────────────────────

/// Key-shape problems, detected before any cipher operation runs.
#[derive(Debug, Error)]
pub enum CryptoConfigError {
    #[error("cipher key must be exactly 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("cipher key is not valid hex: {0}")]
    KeyEncoding(String),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("config: {0}")]
    Config(#[from] CryptoConfigError),

    #[error("encrypted value has no IV delimiter")]
    MissingDelimiter,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_displays_correctly() {
        let err = WardenError::Connection(ConnectionError::NotConnected);
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn operation_wrapper_adds_context_once() {
        let err = WardenError::from(TimeoutError { waited_ms: 300_000 })
            .in_operation("evaluate")
            .in_operation("execute");
        assert!(err.to_string().starts_with("evaluate failed"));
        assert!(matches!(err.root(), WardenError::Timeout(_)));
    }

    #[test]
    fn token_error_names_the_kind() {
        let err = WardenError::Token(TokenError {
            kind: TokenKind::Execution,
        });
        assert!(err.to_string().contains("execution token"));
    }

    #[test]
    fn crypto_config_error_nests_under_crypto() {
        let err = WardenError::Crypto(CryptoError::Config(CryptoConfigError::KeyLength(16)));
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let warden_err: WardenError = anyhow_err.into();
        assert!(warden_err.to_string().contains("something went wrong"));
    }
}
