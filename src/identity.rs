//! Node identity and protocol role.
//!
//! A node's identity is fixed for the lifetime of the process. The role
//! decides which side of the trust bootstrap a node executes:
//! - Authority: generates the shared bundle and serves it
//! - Follower: retrieves the bundle from the Authority

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the trust bootstrap a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Designated node that generates and distributes the bundle.
    #[serde(alias = "master")]
    Authority,
    /// Every other node.
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Authority => "authority",
            Role::Follower => "follower",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "authority" | "master" => Ok(Role::Authority),
            "follower" => Ok(Role::Follower),
            other => Err(format!(
                "unknown role '{}' (expected 'authority' or 'follower')",
                other
            )),
        }
    }
}

/// Identity of the node running the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub role: Role,
    pub node_name: String,
    pub cluster_name: String,
}

impl NodeIdentity {
    pub fn new(role: Role, node_name: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            role,
            node_name: node_name.into(),
            cluster_name: cluster_name.into(),
        }
    }

    pub fn is_authority(&self) -> bool {
        self.role == Role::Authority
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.cluster_name, self.node_name, self.role)
    }
}
