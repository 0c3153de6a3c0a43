//! Configuration for the driver transports. All plain data, no protocol logic.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    auth::{Authenticate, Credential},
    error::{Error, Result},
    read_preference::ReadPreference,
    runtime::TlsConnect,
};

/// The default TCP port servers listen on.
pub const DEFAULT_PORT: u16 = 27017;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_WAIT_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// An address of a server to which the driver can connect.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address of the server.
        host: String,

        /// The port of the server. Defaults to [`DEFAULT_PORT`] when absent.
        port: Option<u16>,
    },
}

impl ServerAddress {
    /// Constructs an address from a hostname and an explicit port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Parses an address from a `"host"` or `"host:port"` string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address \"{}\": missing hostname",
                    address
                )))
            }
        };

        let port = match parts.next() {
            None => None,
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "invalid server address \"{}\": port must be an integer between 0 and \
                         65535",
                        address
                    ))
                })?;
                Some(port)
            }
        };

        if parts.next().is_some() {
            return Err(Error::invalid_argument(format!(
                "invalid server address \"{}\": too many parts",
                address
            )));
        }

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, with the default applied.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

/// Options for how the driver connects to and communicates with the deployment.
#[derive(Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seed hosts. Replica-set membership discovered at runtime may grow or
    /// shrink the live host list, but connecting requires at least one seed.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The credential to authenticate new connections with, if any.
    pub credential: Option<Credential>,

    /// The authentication exchange run for [`credential`](Self::credential). Ignored when no
    /// credential is configured.
    #[builder(setter(strip_option))]
    pub authenticator: Option<Arc<dyn Authenticate>>,

    /// The secure-transport factory used to wrap new TCP streams. Plain TCP when absent.
    #[builder(setter(strip_option))]
    pub tls: Option<Arc<dyn TlsConnect>>,

    /// The default read preference for connection checkout.
    pub read_preference: ReadPreference,

    /// The number of idle connections the pool maintains per host.
    #[builder(default = 1)]
    pub min_pool_size: u32,

    /// The maximum number of connections per host, idle and borrowed combined.
    #[builder(default = 10)]
    pub max_pool_size: u32,

    /// How long a single dial attempt may take.
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,

    /// How long a caller waits for one correlated reply step. A full wait allows twice this to
    /// absorb scheduling jitter.
    #[builder(default = DEFAULT_REPLY_TIMEOUT)]
    pub reply_timeout: Duration,

    /// How long a checkout may wait for a connection to be returned before failing.
    #[builder(default = DEFAULT_WAIT_QUEUE_TIMEOUT)]
    pub wait_queue_timeout: Duration,

    /// The period of the topology health monitor.
    #[builder(default = DEFAULT_HEARTBEAT_FREQUENCY)]
    pub heartbeat_frequency: Duration,

    /// Idle connections older than this are closed by the monitor. Unlimited when absent.
    pub max_idle_time: Option<Duration>,

    /// Connections that have existed longer than this are closed by the monitor. Unlimited when
    /// absent.
    pub max_connection_lifetime: Option<Duration>,

    /// How many attempts a transport-classified failure is given before surfacing as a network
    /// error.
    #[builder(default = 3)]
    pub retries_on_network_error: u32,

    /// The fixed pause between those attempts.
    #[builder(default = DEFAULT_RETRY_BACKOFF)]
    pub retry_backoff: Duration,

    /// How many consecutive failed health checks a host survives before it is pruned from the
    /// live host list.
    #[builder(default = 3)]
    pub host_failure_threshold: u32,
}

impl ClientOptions {
    /// Options with the given seed hosts and defaults for everything else.
    pub fn with_hosts(hosts: Vec<ServerAddress>) -> Self {
        Self::builder().hosts(hosts).build()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::topology("the seed host list is empty"));
        }
        if self.max_pool_size == 0 {
            return Err(Error::invalid_argument("max_pool_size must be nonzero"));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::invalid_argument(format!(
                "min_pool_size ({}) must not exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("hosts", &self.hosts)
            .field("credential", &self.credential.as_ref().map(|c| &c.username))
            .field("tls", &self.tls.is_some())
            .field("read_preference", &self.read_preference)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("reply_timeout", &self.reply_timeout)
            .field("wait_queue_timeout", &self.wait_queue_timeout)
            .field("heartbeat_frequency", &self.heartbeat_frequency)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_connection_lifetime", &self.max_connection_lifetime)
            .field("retries_on_network_error", &self.retries_on_network_error)
            .field("retry_backoff", &self.retry_backoff)
            .finish()
    }
}
