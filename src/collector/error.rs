//! Failure classification for probes.
//!
//! Probe failures never travel as Rust errors past a collector; they are
//! mapped here onto the closed [`ErrorType`] set and recorded on the result.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::model::ErrorType;

/// Errors raised while building or running collectors (not probe failures).
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("failed to build {collector} collector: {reason}")]
    Build { collector: &'static str, reason: String },
    #[error("invalid collector configuration: {0}")]
    Config(String),
    #[error("configuration enables no collectors")]
    NoCollectors,
}

/// Map an I/O error onto the failure taxonomy.
pub fn classify_io_error(err: &io::Error) -> ErrorType {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ErrorType::ConnectionRefused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => ErrorType::ConnectionReset,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorType::Timeout,
        io::ErrorKind::HostUnreachable => ErrorType::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ErrorType::NetworkUnreachable,
        _ => ErrorType::ConnectionError,
    }
}

/// Classification plus the message recorded on the result.
pub fn io_failure(err: &io::Error) -> (ErrorType, String) {
    let kind = classify_io_error(err);
    let message = match kind {
        ErrorType::ConnectionError => err.to_string(),
        known => known.description().to_string(),
    };
    (kind, message)
}

/// Walk an error's source chain looking for the underlying I/O error.
pub fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused), ErrorType::ConnectionRefused);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_io_error(&timed_out), ErrorType::Timeout);

        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(classify_io_error(&unreachable), ErrorType::HostUnreachable);
    }

    #[test]
    fn test_unknown_kind_is_connection_error_with_raw_message() {
        let err = io::Error::new(io::ErrorKind::Other, "weird socket state");
        let (kind, message) = io_failure(&err);
        assert_eq!(kind, ErrorType::ConnectionError);
        assert_eq!(message, "weird socket state");
    }

    #[test]
    fn test_find_io_error_in_chain() {
        #[derive(Debug, Error)]
        #[error("wrapper")]
        struct Wrapper(#[source] io::Error);

        let wrapped = Wrapper(io::Error::from(io::ErrorKind::ConnectionReset));
        let found = find_io_error(&wrapped).unwrap();
        assert_eq!(found.kind(), io::ErrorKind::ConnectionReset);
    }
}
