use std::net::IpAddr;

use crate::ids::NodeId;

/// This process's identity on the local network: node id, display name,
/// and the local addresses its discovery sockets are bound to. Created at
/// service start; immutable until restart.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub node_id: NodeId,
    pub display_name: String,
    pub addresses: Vec<IpAddr>,
}

impl LocalIdentity {
    pub fn new(display_name: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            node_id: NodeId::generate(),
            display_name: display_name.into(),
            addresses,
        }
    }
}
