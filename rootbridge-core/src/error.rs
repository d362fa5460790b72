#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),

    #[error("config parse failed: {0}")]
    DeserializeYaml(#[from] serde_yaml::Error),

    #[error("key store corrupt: {0}")]
    KeyStore(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("AEAD operation failed")]
    AeadFailed,

    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("PTY spawn failed: {0}")]
    PtySpawn(String),

    #[error("no PTY shell found on this system")]
    NoShellFound,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("too many authentication attempts")]
    TooManyAuthAttempts,

    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("daemon is not running")]
    NotRunning,

    #[error("unknown pending identity: {0}")]
    UnknownPendingIdentity(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
