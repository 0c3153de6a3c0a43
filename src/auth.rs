//! Pluggable authentication support.
//!
//! The driver itself only knows that an authentication exchange must run once per connection,
//! right after the capability handshake, whenever a credential is configured. The mechanics of
//! the exchange live behind the [`Authenticate`] trait.

use futures_core::future::BoxFuture;

use crate::{conn::Connection, error::Result};

/// A username/password credential and the database to authenticate against.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: String,

    /// The password to authenticate with.
    pub password: String,

    /// The database used to authenticate. Defaults to "admin" when empty.
    pub source: String,
}

impl Credential {
    /// Creates a credential for `username`/`password` against `source`.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: source.into(),
        }
    }

    pub(crate) fn source_db(&self) -> &str {
        if self.source.is_empty() {
            "admin"
        } else {
            &self.source
        }
    }
}

/// Performs the authentication exchange on a freshly handshaken connection.
///
/// Implementations may send any number of commands through the supplied connection. Returning an
/// error closes the connection before it is ever handed to a caller; implementations should
/// surface failures as [`ErrorKind::Authentication`](crate::error::ErrorKind::Authentication).
pub trait Authenticate: Send + Sync {
    /// Run the exchange for `credential` over `conn`.
    fn authenticate<'a>(
        &'a self,
        conn: &'a Connection,
        credential: &'a Credential,
    ) -> BoxFuture<'a, Result<()>>;
}
