pub mod cbor;
pub mod config;
pub mod error;
pub mod identity;
pub mod ids;
pub mod multicast;
pub mod peer_table;
pub mod presence;
pub mod verified_stream;
pub mod view;
pub mod wire;

pub use config::ServiceConfig;
pub use error::{DiscoveryError, StreamError};
pub use identity::LocalIdentity;
pub use ids::{CloudId, NodeId, ShareToken};
pub use multicast::{
    create_client_socket, create_listen_socket, join_groups, send_to, spawn_listen_loop,
    ListenEvent, ANNOUNCE_TTL, LISTEN_TTL, MULTICAST_GROUP_V4, MULTICAST_GROUP_V6,
};
pub use peer_table::{PeerEndpoint, PeerRecord, PeerState, PeerTable, UpsertOutcome};
pub use presence::{CloudMembership, LocalService};
pub use verified_stream::{ChecksumReader, ChecksumWriter, ReadMode, TRAILER_LEN};
pub use view::{FederatedViewSink, FolderView, ViewEntry};
pub use wire::{Announcement, MessageKind, MAX_DATAGRAM_BYTES, PROTOCOL_VERSION};

#[cfg(test)]
mod conformance;
