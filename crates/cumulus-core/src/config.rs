use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Tuning knobs for a [`crate::presence::LocalService`].
///
/// The defaults suit a LAN deployment; tests shrink the intervals so
/// expiry behavior is observable within seconds.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Display name this node announces for itself.
    pub display_name: String,
    /// UDP port shared by all discovery participants.
    pub multicast_port: u16,
    /// Local addresses to bind a listen/client socket pair on.
    pub local_addresses: Vec<IpAddr>,
    /// Interface indices for IPv6 multicast group membership. Index 0 is
    /// skipped when joining (rejected by some OS network stacks).
    pub interface_indices: Vec<u32>,
    /// Interval between presence announcements for shared/joined clouds.
    pub reannounce_interval: Duration,
    /// A peer is expired once its last announcement is older than
    /// `reannounce_interval * expiry_ratio`. The multiple absorbs a couple
    /// of lost announcements.
    pub expiry_ratio: u32,
    /// How long `join_personal_cloud` waits for a matching announcement.
    pub join_timeout: Duration,
    /// Extra unicast announce targets, on top of the multicast group.
    /// Lets several services on one host (different ports) discover each
    /// other; primarily used by tests.
    pub static_peers: Vec<SocketAddr>,
}

pub const DEFAULT_MULTICAST_PORT: u16 = 27270;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            display_name: "cumulus-node".to_string(),
            multicast_port: DEFAULT_MULTICAST_PORT,
            local_addresses: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            interface_indices: vec![],
            reannounce_interval: Duration::from_secs(30),
            expiry_ratio: 4,
            join_timeout: Duration::from_secs(15),
            static_peers: vec![],
        }
    }
}

impl ServiceConfig {
    /// Age past which a silent peer is removed.
    pub fn expiry_threshold(&self) -> Duration {
        self.reannounce_interval * self.expiry_ratio.max(1)
    }

    /// The expiry sweep runs once per reannounce interval, capped at a
    /// fixed maximum so long intervals still get timely sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.reannounce_interval.min(Duration::from_secs(10))
    }
}
