use thiserror::Error;

/// Error taxonomy for the unlock pipeline and the decrypted read path.
///
/// Kinds mirror spec §7 exactly; `Io` and `Internal` are the two ambient
/// variants every real crate needs but a distilled spec leaves implicit.
#[derive(Debug, Error)]
pub enum BdeError {
    #[error("backing reader I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no recognized FVE signature at any known on-disk start")]
    BadSignature,

    #[error("unsupported metadata or inner version")]
    UnsupportedVersion,

    #[error("corrupt metadata: {0}")]
    Corrupt(&'static str),

    #[error("volume is locked; call unlock() before read()")]
    Locked,

    #[error("no key protector of the requested kind is present in this volume's metadata")]
    NoMatchingProtector,

    #[error("credential did not unwrap the volume master key")]
    WrongCredential,

    #[error("AES-CCM authentication failed")]
    AuthenticationFailed,

    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BdeError>;
