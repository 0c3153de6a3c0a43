//! The capability-negotiation handshake and the periodic health check both run the `hello`
//! command; this module owns its construction and reply shape.

use std::time::{Duration, Instant};

use bson::rawdoc;
use serde::Deserialize;

use crate::{
    conn::{Command, Connection},
    error::Result,
    options::ServerAddress,
};

/// Constructs the capability-negotiation command.
pub(crate) fn hello_command() -> Command {
    Command::new("hello", "admin", rawdoc! { "hello": 1 })
}

/// Runs `hello` on `conn`, returning the parsed reply and the measured round-trip time.
pub(crate) async fn run_hello(conn: &Connection) -> Result<(HelloReply, Duration)> {
    let start = Instant::now();
    let response = conn.run_command(hello_command()).await?;
    let round_trip = start.elapsed();

    let reply: HelloReply = response.body()?;
    Ok((reply, round_trip))
}

/// The reply to a `hello` command, reduced to the fields the transports act on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloReply {
    /// Whether the server is writable: a replica-set primary or a standalone.
    pub(crate) is_writable_primary: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// All data-bearing members of the replica set, as the server knows them.
    pub(crate) hosts: Option<Vec<String>>,

    /// The address of the current primary, if the server knows one.
    pub(crate) primary: Option<String>,

    /// The name of the replica set.
    pub(crate) set_name: Option<String>,

    /// The maximum permitted size of a wire message.
    pub(crate) max_message_size_bytes: Option<i32>,
}

impl HelloReply {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.set_name.is_some() {
            if self.is_writable_primary == Some(true) {
                ServerType::ReplicaSetPrimary
            } else if self.secondary == Some(true) {
                ServerType::ReplicaSetSecondary
            } else {
                ServerType::ReplicaSetOther
            }
        } else {
            ServerType::Standalone
        }
    }

    /// The announced membership as parsed addresses, skipping any the server reported in a form
    /// the driver cannot parse.
    pub(crate) fn member_addresses(&self) -> Vec<ServerAddress> {
        self.hosts
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|host| ServerAddress::parse(host).ok())
            .collect()
    }

    pub(crate) fn primary_address(&self) -> Option<ServerAddress> {
        self.primary
            .as_deref()
            .and_then(|primary| ServerAddress::parse(primary).ok())
    }
}

/// The role a server reported in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerType {
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ReplicaSetOther,
}

impl ServerType {
    pub(crate) fn is_writable(&self) -> bool {
        matches!(self, ServerType::Standalone | ServerType::ReplicaSetPrimary)
    }
}

#[cfg(test)]
mod test {
    use super::{HelloReply, ServerType};

    fn reply(json: bson::Document) -> HelloReply {
        bson::from_document(json).unwrap()
    }

    #[test]
    fn server_type_classification() {
        let primary = reply(bson::doc! {
            "isWritablePrimary": true,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27017"],
        });
        assert_eq!(primary.server_type(), ServerType::ReplicaSetPrimary);
        assert!(primary.server_type().is_writable());

        let secondary = reply(bson::doc! {
            "isWritablePrimary": false,
            "secondary": true,
            "setName": "rs0",
            "primary": "a:27017",
        });
        assert_eq!(secondary.server_type(), ServerType::ReplicaSetSecondary);
        assert!(!secondary.server_type().is_writable());

        let standalone = reply(bson::doc! { "isWritablePrimary": true });
        assert_eq!(standalone.server_type(), ServerType::Standalone);
    }

    #[test]
    fn membership_parsing() {
        let primary = reply(bson::doc! {
            "isWritablePrimary": true,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27018", "not a host:with:extras"],
            "primary": "a:27017",
        });
        let members = primary.member_addresses();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].port(), 27017);
        assert_eq!(primary.primary_address().unwrap().host(), "a");
    }
}
