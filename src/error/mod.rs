// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::driver::Connection;

/// Error type for all cluster operations.
///
/// The first three variants are stable sentinels that callers are expected
/// to match on; everything else is descriptive.
#[derive(Debug, Error)]
pub enum Error {
    /// The target pool had no endpoints at all when the call entered.
    #[error("no connection available: pool is empty")]
    NoConnection,

    /// The target pool had endpoints at entry, but every attempt during the
    /// call failed and was quarantined (endpoints down, or not wsrep ready).
    #[error("no connection available: all endpoints failed or are not wsrep ready")]
    NoConnectionOrWsrep,

    /// Transient network-level failure. Drives quarantine and retry inside
    /// the dispatch loop; only surfaced once a pool is exhausted.
    #[error("network error")]
    Network,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("no rows in result set")]
    NoRows,

    /// Error reported by the underlying driver, passed through verbatim
    /// unless `parse_error` classifies it as transient.
    #[error("driver error: {0}")]
    Driver(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that mark an error as a transient connectivity failure.
///
/// Matched case-insensitively against driver-reported messages as a fallback
/// when no typed classification is possible. Covers the generic socket
/// vocabulary plus the MySQL client (2002/2006/2013) and Postgres
/// (08xxx, 57P0x) families.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection closed",
    "broken pipe",
    "bad connection",
    "invalid connection",
    "i/o timeout",
    "no such host",
    "network is unreachable",
    "unexpected eof",
    "eof",
    "tls handshake",
    "handshake failure",
    "server has gone away",
    "lost connection to mysql server",
    "can't connect to mysql server",
    "the database system is starting up",
    "the database system is shutting down",
    "terminating connection",
    "sqlstate 08",
    "sqlstate 57p",
];

/// Classify an error after a dispatched driver call.
///
/// This is the single classification boundary: the dispatch loop feeds every
/// failure through here and retries on a different endpoint only when the
/// result is [`Error::Network`].
///
/// With no connection to attribute the failure to (`conn` is `None`) the
/// error is returned unchanged. Otherwise I/O errors are classified by
/// [`std::io::ErrorKind`], and driver-reported messages fall back to a
/// case-insensitive scan for known transient markers. Anything that does not
/// match is a domain error and is returned verbatim.
pub fn parse_error(conn: Option<&dyn Connection>, err: Error) -> Error {
    if conn.is_none() {
        return err;
    }

    match &err {
        Error::Network => Error::Network,
        Error::Io(io) => {
            if is_transient_io(io.kind()) || is_transient_message(&io.to_string()) {
                Error::Network
            } else {
                err
            }
        }
        Error::Driver(msg) => {
            if is_transient_message(msg) {
                Error::Network
            } else {
                err
            }
        }
        _ => err,
    }
}

fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
    )
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::testkit::MemoryDriver;

    #[tokio::test]
    async fn unattributed_errors_pass_through() {
        let err = Error::Driver("connection refused".to_string());
        let classified = parse_error(None, err);
        assert!(matches!(classified, Error::Driver(_)));
    }

    #[tokio::test]
    async fn refused_connection_classifies_as_network() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://probe").await.unwrap();
        driver.server("mem://probe").set_reachable(false);

        let err = conn.ping().await.unwrap_err();
        let classified = parse_error(Some(conn.as_ref()), err);
        assert!(matches!(classified, Error::Network));
    }

    #[tokio::test]
    async fn io_kinds_classify_as_network() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://io").await.unwrap();

        for kind in [
            std::io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::TimedOut,
            std::io::ErrorKind::UnexpectedEof,
        ] {
            let err = Error::Io(std::io::Error::new(kind, "boom"));
            assert!(matches!(
                parse_error(Some(conn.as_ref()), err),
                Error::Network
            ));
        }

        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "not allowed",
        ));
        assert!(matches!(parse_error(Some(conn.as_ref()), err), Error::Io(_)));
    }

    #[tokio::test]
    async fn domain_errors_are_not_classified() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://domain").await.unwrap();

        let err = Error::Driver("syntax error at or near \"FORM\"".to_string());
        assert!(matches!(
            parse_error(Some(conn.as_ref()), err),
            Error::Driver(_)
        ));

        let err = Error::NoRows;
        assert!(matches!(parse_error(Some(conn.as_ref()), err), Error::NoRows));
    }

    #[test]
    fn marker_matching_is_case_insensitive() {
        assert!(is_transient_message(
            "dial tcp 10.0.0.1:3306: Connection Refused"
        ));
        assert!(is_transient_message(
            "ERROR 2006 (HY000): MySQL server has gone away"
        ));
        assert!(is_transient_message(
            "FATAL: the database system is starting up"
        ));
        assert!(!is_transient_message(
            "duplicate key value violates unique constraint"
        ));
    }
}
