//! A wire-protocol transport driver for document database replica sets.
//!
//! `docwire` speaks a binary request/reply protocol over TCP: length-prefixed frames carrying
//! opaque documents, correlated by sender-assigned request ids. On top of that it provides the
//! transport machinery a higher-level database client needs and nothing more:
//!
//! - [`Connection`]: one socket, one background reader, concurrent correlated waits, batched
//!   cursor continuation, and long-lived streaming reads.
//! - [`ConnectionPool`]: a replica-set-aware pool with per-host connection budgets,
//!   read-preference host selection, periodic health checks, and automatic membership
//!   reconciliation.
//! - [`SingleHostTransport`]: a direct single-server transport with serialized operations and
//!   self-healing reconnects.
//! - [`BatchCursor`]: client-side iteration over server-side result cursors.
//! - [`Session`]: explicit logical-session and transaction context threaded through calls.
//!
//! Document encoding, command semantics, TLS configuration, and authentication exchanges are
//! collaborator concerns: documents are [`bson`] raw documents written verbatim, and the
//! [`TlsConnect`](runtime::TlsConnect) and [`Authenticate`](auth::Authenticate) traits inject
//! the rest.
//!
//! ```no_run
//! use docwire::{
//!     options::{ClientOptions, ServerAddress},
//!     Command, ConnectionPool, ReadPreference,
//! };
//!
//! # async fn run() -> docwire::error::Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![
//!         ServerAddress::parse("db0.example.com:27017")?,
//!         ServerAddress::parse("db1.example.com:27017")?,
//!     ])
//!     .build();
//! let pool = ConnectionPool::connect(options).await?;
//!
//! let conn = pool.check_out(ReadPreference::Nearest).await?;
//! let response = conn
//!     .run_command(Command::new("ping", "admin", bson::rawdoc! { "ping": 1 }))
//!     .await?;
//! pool.check_in(conn);
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auth;
mod conn;
mod cursor;
pub mod error;
mod handshake;
pub mod options;
mod pool;
mod read_preference;
mod retry;
pub mod runtime;
mod session;
mod single;
#[cfg(test)]
mod test;
mod wire;

pub use crate::{
    auth::{Authenticate, Credential},
    conn::{Batch, Command, Connection, ConnectionStats, Namespace, RatioCounter,
        RawCommandResponse},
    cursor::{BatchCursor, CursorOwner},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    pool::{ConnectionPool, DriverStatus},
    read_preference::ReadPreference,
    retry::RetryExecutor,
    session::Session,
    single::SingleHostTransport,
};
