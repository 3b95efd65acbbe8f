//! The vote record both wire protocols and the forwarding relay carry.

use serde::{Deserialize, Serialize};

/// One vote cast for a player on a voting site.
///
/// The timestamp is kept as the opaque string the client sent; sites
/// disagree on its format (epoch seconds, milliseconds, formatted dates)
/// and the daemon never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    /// Name of the voting site the vote was cast on.
    pub service_name: String,
    /// Player the vote was cast for.
    pub username: String,
    /// Address the voting site saw the voter from.
    pub address: String,
    /// Opaque client-supplied timestamp.
    pub timestamp: String,
}

impl Vote {
    /// Create a vote record.
    pub fn new(
        service_name: impl Into<String>,
        username: impl Into<String>,
        address: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            username: username.into(),
            address: address.into(),
            timestamp: timestamp.into(),
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} voted on {} from {} at {}",
            self.username, self.service_name, self.address, self.timestamp
        )
    }
}
