use std::net::SocketAddr;
use std::sync::Mutex;

use crate::ids::NodeId;

/// Notifications the presence protocol publishes to the virtual
/// filesystem: one child entry per live peer of a cloud.
pub trait FederatedViewSink: Send + Sync {
    fn on_peer_added(&self, node_id: NodeId, display_name: &str, endpoint: SocketAddr);
    fn on_peer_removed(&self, node_id: NodeId);
    fn on_peer_renamed(&self, node_id: NodeId, new_name: &str);
}

/// One child of the federated root: a peer's shared folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub node_id: NodeId,
    pub name: String,
}

/// In-memory federated view. The real virtual filesystem lives outside
/// this crate; this sink is what the service wires up by default and what
/// the tests enumerate.
#[derive(Debug, Default)]
pub struct FolderView {
    entries: Mutex<Vec<ViewEntry>>,
}

impl FolderView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry outside the notification path (the local node's own
    /// folder, present from cloud creation).
    pub fn seed(&self, node_id: NodeId, name: &str) {
        let mut entries = self.entries.lock().expect("view lock");
        if entries.iter().all(|e| e.node_id != node_id) {
            entries.push(ViewEntry {
                node_id,
                name: name.to_string(),
            });
        }
    }

    /// Enumerate the children of the federated root, in insertion order.
    pub fn entries(&self) -> Vec<ViewEntry> {
        self.entries.lock().expect("view lock").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("view lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FederatedViewSink for FolderView {
    fn on_peer_added(&self, node_id: NodeId, display_name: &str, _endpoint: SocketAddr) {
        self.seed(node_id, display_name);
    }

    fn on_peer_removed(&self, node_id: NodeId) {
        let mut entries = self.entries.lock().expect("view lock");
        entries.retain(|e| e.node_id != node_id);
    }

    fn on_peer_renamed(&self, node_id: NodeId, new_name: &str) {
        let mut entries = self.entries.lock().expect("view lock");
        if let Some(entry) = entries.iter_mut().find(|e| e.node_id == node_id) {
            entry.name = new_name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep() -> SocketAddr {
        "127.0.0.1:9000".parse().expect("valid addr")
    }

    #[test]
    fn add_remove_rename_flow() {
        let view = FolderView::new();
        let own = NodeId([1u8; 16]);
        let peer = NodeId([2u8; 16]);

        view.seed(own, "me");
        view.on_peer_added(peer, "laptop", ep());
        assert_eq!(view.len(), 2);

        view.on_peer_renamed(peer, "laptop-2");
        assert_eq!(view.entries()[1].name, "laptop-2");

        view.on_peer_removed(peer);
        assert_eq!(view.len(), 1);
        assert_eq!(view.entries()[0].node_id, own);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let view = FolderView::new();
        let peer = NodeId([2u8; 16]);
        view.on_peer_added(peer, "laptop", ep());
        view.on_peer_added(peer, "laptop", ep());
        assert_eq!(view.len(), 1);
    }
}
