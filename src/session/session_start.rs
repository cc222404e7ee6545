use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// A member of a session as assigned by the broker
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberDescriptor {
    #[serde(rename = "ID")]
    pub id: u64,
    pub index: u8,
    #[serde(default)]
    pub devices: Vec<String>,
}

/// The broker's notification that a session starts, addressed to one node.
///
/// `Index` is the receiving node's own member index, `IP` and `Port` are the session's multicast
///  group, and `Devices` is the full roster.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionStart {
    #[serde(rename = "ID")]
    pub id: u64,
    pub index: u8,
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    pub port: u16,
    #[serde(rename = "Devices")]
    pub members: Vec<MemberDescriptor>,
}

/// The body of a node's registration with the broker
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Registration {
    pub name: String,
    pub devices: Vec<String>,
    /// where the broker sends session start and stop notifications
    pub control_addr: SocketAddr,
}
