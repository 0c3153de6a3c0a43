use serde::{Deserialize, Serialize};

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// The `Preferred` variants fall back rather than fail when no member of the preferred kind can
/// serve the read; see the selection documentation on
/// [`ConnectionPool::check_out`](crate::pool::ConnectionPool::check_out) for the exact cascade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    #[default]
    Primary,

    /// Route this operation to the primary if it has capacity to serve it immediately, but fall
    /// back to a secondary if not.
    PrimaryPreferred,

    /// Only route this operation to a secondary.
    Secondary,

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred,

    /// Route this operation to the member with the least measured network latency, regardless of
    /// whether it's the primary or a secondary.
    Nearest,
}

impl ReadPreference {
    /// Whether this preference can only ever be served by the primary.
    pub(crate) fn requires_primary(&self) -> bool {
        matches!(self, ReadPreference::Primary)
    }

    /// The wire name of this mode.
    pub fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::Secondary => "secondary",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        }
    }
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mode())
    }
}
