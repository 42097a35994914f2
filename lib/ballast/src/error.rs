use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Process-wide error model. Every error is a `(domain, code)` pair with a
/// per-domain rendering; errors are values and always propagated, never
/// thrown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operating system errno.
    Os(i32),
    /// Name resolution failure, carrying the resolver's message.
    Resolve(String),
    /// Wire protocol decode failure.
    Decode(DecodeError),
    /// Database service failure.
    Db(DbError),
    /// Configuration file failure.
    Config(ConfigError),
    /// TLS failure: kind plus the library-reported reason.
    Tls(TlsKind, String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    EmptyLine,
    InvalidCommand,
    UnexpectedArgument,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbError {
    BrokenConnection,
    Sql,
    Rollback,
    Serialization,
    Deadlock,
    InDoubt,
    Permission,
    UniqueViolation,
    ForeignKeyViolation,
    NotNullViolation,
    CheckViolation,
    Unknown,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigError {
    FileNotFound,
    MalformedLine,
    EmptyKey,
    DuplicateKey,
    ReadFailed,
    MissingRequiredKey,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlsKind {
    Init,
    Context,
    Load,
    Verify,
    Handshake,
    Shutdown,
    Alert,
    Protocol,
}

impl Error {
    /// Maps an `io::Error` into the errno domain. Errors synthesized by
    /// libraries without a raw code land on `EIO`.
    #[inline]
    pub fn from_io(err: &io::Error) -> Error {
        Error::Os(err.raw_os_error().unwrap_or(libc::EIO))
    }

    #[inline]
    pub fn os(code: i32) -> Error {
        Error::Os(code)
    }

    /// True when the error indicates the peer went away rather than a
    /// local fault.
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Os(code) if *code == libc::EPIPE || *code == libc::ECONNRESET)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Error {
        Error::from_io(&err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Os(code) => write!(f, "{}", io::Error::from_raw_os_error(*code)),
            Error::Resolve(msg) => write!(f, "resolve: {}", msg),
            Error::Decode(err) => write!(f, "{}", err),
            Error::Db(err) => write!(f, "{}", err),
            Error::Config(err) => write!(f, "{}", err),
            Error::Tls(kind, reason) => {
                if reason.is_empty() {
                    write!(f, "{}", kind)
                } else {
                    write!(f, "{} (reason: {})", kind, reason)
                }
            }
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DecodeError::EmptyLine => "empty_line",
            DecodeError::InvalidCommand => "invalid_command",
            DecodeError::UnexpectedArgument => "unexpected_argument",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DbError::BrokenConnection => "db.broken_connection",
            DbError::Sql => "db.sql_error",
            DbError::Rollback => "db.transaction_rollback",
            DbError::Serialization => "db.serialization_failure",
            DbError::Deadlock => "db.deadlock_detected",
            DbError::InDoubt => "db.in_doubt",
            DbError::Permission => "db.insufficient_privilege",
            DbError::UniqueViolation => "db.unique_violation",
            DbError::ForeignKeyViolation => "db.foreign_key_violation",
            DbError::NotNullViolation => "db.not_null_violation",
            DbError::CheckViolation => "db.check_violation",
            DbError::Unknown => "db.unknown",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConfigError::FileNotFound => "config file not found",
            ConfigError::MalformedLine => "config malformed line (expected key=value)",
            ConfigError::EmptyKey => "config key is empty",
            ConfigError::DuplicateKey => "config duplicate key",
            ConfigError::ReadFailed => "config read failed",
            ConfigError::MissingRequiredKey => "config missing required key",
        };
        f.write_str(text)
    }
}

impl fmt::Display for TlsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TlsKind::Init => "tls.init_failed",
            TlsKind::Context => "tls.context_failed",
            TlsKind::Load => "tls.load_failed",
            TlsKind::Verify => "tls.verify_failed",
            TlsKind::Handshake => "tls.handshake_failed",
            TlsKind::Shutdown => "tls.shutdown_failed",
            TlsKind::Alert => "tls.alert_received",
            TlsKind::Protocol => "tls.protocol_error",
        };
        f.write_str(name)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_carries_errno() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(Error::from_io(&err), Error::Os(libc::ECONNRESET));
    }

    #[test]
    fn test_from_io_without_raw_code() {
        let err = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(Error::from_io(&err), Error::Os(libc::EIO));
    }

    #[test]
    fn test_is_disconnect() {
        assert!(Error::Os(libc::EPIPE).is_disconnect());
        assert!(Error::Os(libc::ECONNRESET).is_disconnect());
        assert!(!Error::Os(libc::EINVAL).is_disconnect());
        assert!(!Error::Decode(DecodeError::EmptyLine).is_disconnect());
    }

    #[test]
    fn test_display_dispatches_per_domain() {
        assert_eq!(
            Error::Decode(DecodeError::UnexpectedArgument).to_string(),
            "unexpected_argument"
        );
        assert_eq!(
            Error::Config(ConfigError::DuplicateKey).to_string(),
            "config duplicate key"
        );
        assert_eq!(Error::Db(DbError::Deadlock).to_string(), "db.deadlock_detected");
        assert_eq!(
            Error::Tls(TlsKind::Handshake, String::new()).to_string(),
            "tls.handshake_failed"
        );
        assert_eq!(
            Error::Tls(TlsKind::Verify, "bad certificate".into()).to_string(),
            "tls.verify_failed (reason: bad certificate)"
        );
    }
}
