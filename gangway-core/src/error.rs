/// A type alias for `anyhow::Error`, used wherever errors of arbitrary
/// concrete types have to travel through one channel (worker results,
/// admin replies).
pub type AnyError = anyhow::Error;

/// A type alias for `Result<T, E>` where `E` defaults to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}

/// Errors whose text is part of the admin contract: they are returned
/// verbatim over the control socket and matched on by operators. They are
/// never surfaced to proxied clients.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("service not found")]
    ServiceNotFound,
    #[error("target failed to become healthy within configured timeout")]
    TargetFailedToBecomeHealthy,
    #[error("host already in use by service `{0}`")]
    HostInUse(String),
    #[error("rollout target not set")]
    RolloutTargetNotSet,
    #[error("automatic TLS does not support wildcard hostnames")]
    AutomaticTlsDoesNotSupportWildcards,
    #[error("unable to load error pages")]
    UnableToLoadErrorPages,
    #[error("unable to load certificate key pair")]
    UnableToLoadKeyPair,
    #[error("already paused")]
    AlreadyPaused,
    #[error("not paused")]
    NotPaused,
    #[error("invalid host pattern `{0}`")]
    InvalidHostPattern(String),
    #[error("invalid path prefix `{0}`")]
    InvalidPathPrefix(String),
    #[error("invalid target address `{0}`")]
    InvalidTargetAddress(String),
    #[error("no server name")]
    NoServerName,
    #[error("unknown server name `{0}`")]
    UnknownServerName(String),
}
