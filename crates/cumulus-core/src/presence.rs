// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Presence protocol: turns raw discovery datagrams into a live,
// time-bounded peer table per cloud membership. Every receive loop fans
// into one dispatcher task, so peer-table mutations are serialized no
// matter how many sockets discover the same peer at once.
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::error::DiscoveryError;
use crate::identity::LocalIdentity;
use crate::ids::{CloudId, NodeId, ShareToken};
use crate::multicast::{
    create_client_socket, create_listen_socket, join_groups, send_to, spawn_listen_loop,
    ListenEvent, MULTICAST_GROUP_V4, MULTICAST_GROUP_V6,
};
use crate::peer_table::{PeerRecord, PeerTable, UpsertOutcome};
use crate::view::{FederatedViewSink, FolderView};
use crate::wire::{Announcement, MessageKind, PROTOCOL_VERSION};

/// One personal cloud this node participates in.
struct CloudState {
    id: CloudId,
    name: String,
    /// This node's display name within the cloud (joiners pick their own).
    own_name: String,
    /// Local folder contributed to the federated view. A joiner that has
    /// not configured one yet has `None`.
    folder: Option<PathBuf>,
    /// Token carried in outgoing announcements while this node is the
    /// active sharer; `None` otherwise. Joining consumes a token but does
    /// not carry it afterwards, so rotating the sharing session really
    /// does invalidate the old token cloud-wide.
    token: StdMutex<Option<ShareToken>>,
    /// Whether the periodic announce loop includes this cloud.
    announcing: StdMutex<bool>,
    /// The only state shared between receive dispatch and the expiry
    /// sweep; all access goes through this one lock.
    peers: StdMutex<PeerTable>,
    view: Arc<FolderView>,
    sinks: StdMutex<Vec<Arc<dyn FederatedViewSink>>>,
}

impl CloudState {
    fn notify_added(&self, record: &PeerRecord) {
        for sink in self.sinks.lock().expect("sink lock").iter() {
            sink.on_peer_added(record.node_id, &record.display_name, record.endpoint);
        }
    }

    fn notify_removed(&self, node_id: NodeId) {
        for sink in self.sinks.lock().expect("sink lock").iter() {
            sink.on_peer_removed(node_id);
        }
    }

    fn notify_renamed(&self, node_id: NodeId, new_name: &str) {
        for sink in self.sinks.lock().expect("sink lock").iter() {
            sink.on_peer_renamed(node_id, new_name);
        }
    }
}

/// Public handle to one cloud membership. Cheap to clone; all handles
/// observe the same live peer table.
#[derive(Clone)]
pub struct CloudMembership {
    state: Arc<CloudState>,
}

// Not derivable: the state holds `dyn FederatedViewSink` sinks.
impl fmt::Debug for CloudMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudMembership")
            .field("id", &self.state.id.to_hex())
            .field("name", &self.state.name)
            .field("own_name", &self.state.own_name)
            .finish_non_exhaustive()
    }
}

impl CloudMembership {
    pub fn id(&self) -> CloudId {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn folder(&self) -> Option<&PathBuf> {
        self.state.folder.as_ref()
    }

    pub fn share_token(&self) -> Option<ShareToken> {
        *self.state.token.lock().expect("token lock")
    }

    /// Snapshot of the current peer records, insertion-ordered.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.state.peers.lock().expect("peer lock").snapshot()
    }

    /// The federated root this membership presents to the virtual
    /// filesystem: one entry per live peer plus this node's own folder.
    pub fn root_view(&self) -> Arc<FolderView> {
        Arc::clone(&self.state.view)
    }

    /// Register an additional consumer of add/remove/rename notifications.
    pub fn attach_sink(&self, sink: Arc<dyn FederatedViewSink>) {
        self.state.sinks.lock().expect("sink lock").push(sink);
    }
}

struct ListenUnit {
    socket: Arc<UdpSocket>,
    local: IpAddr,
    handle: JoinHandle<()>,
}

struct ClientUnit {
    socket: Arc<UdpSocket>,
    local: IpAddr,
}

#[derive(Default)]
struct NetState {
    listen: Vec<ListenUnit>,
    clients: Vec<ClientUnit>,
    tx: Option<mpsc::Sender<ListenEvent>>,
    dispatcher: Option<JoinHandle<()>>,
    announce: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
}

struct JoinWaiter {
    token: ShareToken,
    tx: oneshot::Sender<(Announcement, SocketAddr)>,
}

struct ServiceShared {
    identity: LocalIdentity,
    config: ServiceConfig,
    clouds: RwLock<Vec<Arc<CloudState>>>,
    net: Mutex<NetState>,
    waiters: Mutex<Vec<JoinWaiter>>,
}

/// The presence service: owns the discovery sockets, the announce and
/// expiry timers, and every cloud membership of this node.
pub struct LocalService {
    shared: Arc<ServiceShared>,
}

impl LocalService {
    pub fn new(config: ServiceConfig) -> Self {
        let identity = LocalIdentity::new(config.display_name.clone(), config.local_addresses.clone());
        Self {
            shared: Arc::new(ServiceShared {
                identity,
                config,
                clouds: RwLock::new(Vec::new()),
                net: Mutex::new(NetState::default()),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    /// Bind a listen/client socket pair per local address, join the
    /// discovery groups, and start the receive loops and timers.
    /// Idempotent: a second call while started is a no-op.
    pub async fn start_service(&self) -> Result<(), DiscoveryError> {
        let shared = &self.shared;
        let mut net = shared.net.lock().await;
        if net.tx.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(64);
        net.tx = Some(tx.clone());
        shared.bind_all(&mut net);
        if net.listen.is_empty() {
            net.tx = None;
            return Err(DiscoveryError::NoUsableAddress);
        }

        net.dispatcher = Some(spawn_dispatcher(Arc::downgrade(shared), rx));
        net.announce = Some(spawn_announce_loop(Arc::downgrade(shared)));
        net.sweep = Some(spawn_sweep_loop(Arc::downgrade(shared)));
        tracing::debug!(
            node = %shared.identity.node_id.to_hex(),
            sockets = net.listen.len(),
            "presence service started"
        );
        Ok(())
    }

    /// Create a local cloud: no token, no network traffic, the federated
    /// view holds exactly this node's own folder.
    pub async fn create_personal_cloud(
        &self,
        name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> CloudMembership {
        let shared = &self.shared;
        let view = Arc::new(FolderView::new());
        let own_name = shared.identity.display_name.clone();
        view.seed(shared.identity.node_id, &own_name);
        let state = Arc::new(CloudState {
            id: CloudId::generate(),
            name: name.into(),
            own_name,
            folder: Some(folder.into()),
            token: StdMutex::new(None),
            announcing: StdMutex::new(false),
            peers: StdMutex::new(PeerTable::default()),
            sinks: StdMutex::new(vec![Arc::clone(&view) as Arc<dyn FederatedViewSink>]),
            view,
        });
        shared.clouds.write().await.push(Arc::clone(&state));
        CloudMembership { state }
    }

    /// Generate a fresh share token, begin periodic announces, and return
    /// the token's base-10 string for out-of-band delivery.
    pub async fn share_personal_cloud(&self, membership: &CloudMembership) -> String {
        let token = ShareToken::generate();
        *membership.state.token.lock().expect("token lock") = Some(token);
        *membership.state.announcing.lock().expect("announce lock") = true;
        self.shared
            .announce_cloud(&membership.state, MessageKind::Announce)
            .await;
        token.to_string()
    }

    /// Send one `Bye`, invalidate the token, and stop announcing this
    /// cloud. Already-known peers are kept; they age out normally.
    pub async fn stop_share_personal_cloud(&self, membership: &CloudMembership) {
        // Invalidate before the Bye so no periodic announce carrying the
        // token can be sent after it.
        *membership.state.token.lock().expect("token lock") = None;
        *membership.state.announcing.lock().expect("announce lock") = false;
        self.shared
            .announce_cloud(&membership.state, MessageKind::Bye)
            .await;
    }

    /// Wait for an announcement carrying `token`, then create a membership
    /// seeded with the announcing peer and start announcing symmetrically
    /// so the sharer (and everyone else) discovers this node too.
    pub async fn join_personal_cloud(
        &self,
        token: &str,
        local_name: impl Into<String>,
    ) -> Result<CloudMembership, DiscoveryError> {
        let shared = &self.shared;
        let parsed: ShareToken = token
            .parse()
            .map_err(|_| DiscoveryError::InvalidToken(token.to_string()))?;
        if shared.net.lock().await.tx.is_none() {
            return Err(DiscoveryError::NotStarted);
        }

        let (tx, rx) = oneshot::channel();
        shared.waiters.lock().await.push(JoinWaiter { token: parsed, tx });

        let matched = tokio::time::timeout(shared.config.join_timeout, rx).await;
        let (announcement, from) = match matched {
            Ok(Ok(found)) => found,
            Ok(Err(_)) => return Err(DiscoveryError::Stopped),
            Err(_) => {
                // Drop our abandoned waiter so the list does not grow.
                shared.waiters.lock().await.retain(|w| !w.tx.is_closed());
                return Err(DiscoveryError::JoinTimeout(shared.config.join_timeout));
            }
        };

        let local_name = local_name.into();
        let view = Arc::new(FolderView::new());
        view.seed(shared.identity.node_id, &local_name);
        let state = Arc::new(CloudState {
            id: announcement.cloud_id,
            name: announcement.cloud_name.clone(),
            own_name: local_name,
            folder: None,
            // The token authorized this join; it belongs to the sharer's
            // session and is never echoed in our own announcements.
            token: StdMutex::new(None),
            announcing: StdMutex::new(true),
            peers: StdMutex::new(PeerTable::default()),
            sinks: StdMutex::new(vec![Arc::clone(&view) as Arc<dyn FederatedViewSink>]),
            view,
        });
        shared.clouds.write().await.push(Arc::clone(&state));

        // Seed the sharer so the view is populated before its next announce.
        let endpoint = SocketAddr::new(from.ip(), announcement.service_port);
        let record = {
            let mut peers = state.peers.lock().expect("peer lock");
            peers.upsert(
                announcement.node_id,
                &announcement.display_name,
                endpoint,
                Instant::now(),
            );
            peers.get(announcement.node_id).cloned()
        };
        if let Some(record) = record {
            state.notify_added(&record);
        }

        shared.announce_cloud(&state, MessageKind::Announce).await;
        Ok(CloudMembership { state })
    }

    /// React to a local network configuration change. With `tear_down`
    /// the sockets are dropped and recreated so group membership rebinds
    /// to current interfaces; without it, groups are re-joined on the
    /// live sockets (cheap path for transient blips). Known peers are
    /// never touched.
    pub async fn network_may_changed(&self, tear_down: bool) {
        let shared = &self.shared;
        let mut net = shared.net.lock().await;
        if net.tx.is_none() {
            return;
        }
        if tear_down {
            for unit in net.listen.drain(..) {
                unit.handle.abort();
            }
            net.clients.clear();
            shared.bind_all(&mut net);
            tracing::debug!(sockets = net.listen.len(), "discovery sockets recreated");
        } else {
            for unit in &net.listen {
                join_groups(&unit.socket, unit.local, &shared.config.interface_indices);
            }
            for client in &net.clients {
                join_groups(&client.socket, client.local, &shared.config.interface_indices);
            }
        }
    }

    /// Stop every loop and timer and drop the sockets. Idempotent. Peers
    /// on other nodes age this node out; no `Bye` is sent.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let mut net = shared.net.lock().await;
        for unit in net.listen.drain(..) {
            unit.handle.abort();
        }
        net.clients.clear();
        for handle in [
            net.dispatcher.take(),
            net.announce.take(),
            net.sweep.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        net.tx = None;
        // Pending joiners observe `Stopped` when their senders drop.
        shared.waiters.lock().await.clear();
    }
}

impl ServiceShared {
    /// Bind a listen + client socket per configured local address. Bind
    /// failures are logged and that interface is skipped; discovery keeps
    /// running on whatever did bind.
    fn bind_all(&self, net: &mut NetState) {
        let Some(tx) = net.tx.clone() else { return };
        for &local in &self.config.local_addresses {
            match create_listen_socket(local, self.config.multicast_port) {
                Ok(socket) => {
                    join_groups(&socket, local, &self.config.interface_indices);
                    let socket = Arc::new(socket);
                    let handle = spawn_listen_loop(Arc::clone(&socket), tx.clone());
                    net.listen.push(ListenUnit {
                        socket,
                        local,
                        handle,
                    });
                }
                Err(err) => {
                    tracing::warn!(%local, error = %err, "skipping unbindable local address");
                    continue;
                }
            }
            match create_client_socket(local, &self.config.interface_indices) {
                Ok(socket) => net.clients.push(ClientUnit {
                    socket: Arc::new(socket),
                    local,
                }),
                Err(err) => {
                    tracing::warn!(%local, error = %err, "no client socket for local address");
                }
            }
        }
    }

    /// Recreate one listen socket after its receive loop died.
    async fn recreate_socket(&self, local: IpAddr) {
        let mut net = self.net.lock().await;
        let Some(tx) = net.tx.clone() else { return };
        if let Some(idx) = net.listen.iter().position(|u| u.local == local) {
            let dead = net.listen.remove(idx);
            dead.handle.abort();
        }
        match create_listen_socket(local, self.config.multicast_port) {
            Ok(socket) => {
                join_groups(&socket, local, &self.config.interface_indices);
                let socket = Arc::new(socket);
                let handle = spawn_listen_loop(Arc::clone(&socket), tx);
                net.listen.push(ListenUnit {
                    socket,
                    local,
                    handle,
                });
                tracing::debug!(%local, "discovery socket recreated after receive failure");
            }
            Err(err) => {
                tracing::warn!(%local, error = %err, "could not recreate discovery socket");
            }
        }
    }

    fn build_announcement(&self, cloud: &CloudState, kind: MessageKind) -> Announcement {
        Announcement {
            version: PROTOCOL_VERSION,
            kind,
            node_id: self.identity.node_id,
            display_name: cloud.own_name.clone(),
            cloud_id: cloud.id,
            cloud_name: cloud.name.clone(),
            share_token: *cloud.token.lock().expect("token lock"),
            service_port: self.config.multicast_port,
            sent_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Send one message for `cloud` to the multicast group on every
    /// client socket, plus any configured static peers.
    async fn announce_cloud(&self, cloud: &CloudState, kind: MessageKind) {
        let msg = self.build_announcement(cloud, kind);
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode announcement");
                return;
            }
        };

        let net = self.net.lock().await;
        for client in &net.clients {
            let group = match client.local {
                IpAddr::V4(_) => SocketAddr::new(MULTICAST_GROUP_V4.into(), self.config.multicast_port),
                IpAddr::V6(_) => SocketAddr::new(MULTICAST_GROUP_V6.into(), self.config.multicast_port),
            };
            send_to(&client.socket, group, &payload).await;
            for &peer in &self.config.static_peers {
                if peer.is_ipv4() == client.local.is_ipv4() {
                    send_to(&client.socket, peer, &payload).await;
                }
            }
        }
    }

    async fn announce_all(&self) {
        let clouds = self.clouds.read().await.clone();
        for cloud in clouds {
            if *cloud.announcing.lock().expect("announce lock") {
                self.announce_cloud(&cloud, MessageKind::Announce).await;
            }
        }
    }

    /// Fold one datagram into protocol state. Malformed payloads are
    /// dropped and logged; they never unwind into the receive loop.
    async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let msg = match Announcement::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%from, error = %err, "dropping malformed discovery datagram");
                return;
            }
        };
        // Our own announcements loop back over multicast on some stacks;
        // the peer table must never contain the local node id.
        if msg.node_id == self.identity.node_id {
            return;
        }

        let cloud = {
            let clouds = self.clouds.read().await;
            clouds.iter().find(|c| c.id == msg.cloud_id).cloned()
        };

        match msg.kind {
            MessageKind::Bye => {
                if let Some(cloud) = cloud {
                    let removed = cloud.peers.lock().expect("peer lock").remove(msg.node_id);
                    if removed.is_some() {
                        tracing::debug!(
                            peer = %msg.node_id.to_hex(),
                            cloud = %cloud.name,
                            "peer said bye"
                        );
                        cloud.notify_removed(msg.node_id);
                    }
                }
            }
            MessageKind::Announce => {
                let endpoint = SocketAddr::new(from.ip(), msg.service_port);
                if let Some(cloud) = cloud {
                    let outcome = cloud.peers.lock().expect("peer lock").upsert(
                        msg.node_id,
                        &msg.display_name,
                        endpoint,
                        Instant::now(),
                    );
                    match outcome {
                        UpsertOutcome::Added => {
                            tracing::debug!(
                                peer = %msg.node_id.to_hex(),
                                name = %msg.display_name,
                                cloud = %cloud.name,
                                "peer discovered"
                            );
                            let record = cloud
                                .peers
                                .lock()
                                .expect("peer lock")
                                .get(msg.node_id)
                                .cloned();
                            if let Some(record) = record {
                                cloud.notify_added(&record);
                            }
                        }
                        UpsertOutcome::Renamed { new_name } => {
                            cloud.notify_renamed(msg.node_id, &new_name);
                        }
                        UpsertOutcome::Refreshed => {}
                    }
                }
                self.complete_join_waiters(&msg, from).await;
            }
        }
    }

    /// A join completes only on the token the sharer currently embeds in
    /// its announcements; stale or rotated tokens never match.
    async fn complete_join_waiters(&self, msg: &Announcement, from: SocketAddr) {
        let Some(token) = msg.share_token else { return };
        let mut waiters = self.waiters.lock().await;
        let mut idx = 0;
        while idx < waiters.len() {
            if waiters[idx].token == token {
                let waiter = waiters.remove(idx);
                let _ = waiter.tx.send((msg.clone(), from));
            } else {
                idx += 1;
            }
        }
    }

    /// One expiry pass: drop every record past the threshold and notify
    /// the federated view exactly once per removal.
    async fn sweep_once(&self) {
        let threshold = self.config.expiry_threshold();
        let now = Instant::now();
        let clouds = self.clouds.read().await.clone();
        for cloud in clouds {
            let expired = cloud.peers.lock().expect("peer lock").sweep(threshold, now);
            for record in expired {
                tracing::debug!(
                    peer = %record.node_id.to_hex(),
                    name = %record.display_name,
                    cloud = %cloud.name,
                    "peer expired"
                );
                cloud.notify_removed(record.node_id);
            }
        }
    }
}

/// Pause before rebinding a failed socket, so a persistently failing
/// interface does not spin through fail/recreate cycles.
const RECREATE_BACKOFF: Duration = Duration::from_millis(500);

fn spawn_dispatcher(
    shared: Weak<ServiceShared>,
    mut rx: mpsc::Receiver<ListenEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(shared) = shared.upgrade() else { break };
            match event {
                ListenEvent::Packet { payload, from, .. } => {
                    shared.handle_datagram(&payload, from).await;
                }
                ListenEvent::Failed { local_addr, .. } => {
                    // Backoff off the dispatcher task: datagrams from the
                    // healthy sockets keep flowing meanwhile.
                    tokio::spawn(async move {
                        tokio::time::sleep(RECREATE_BACKOFF).await;
                        shared.recreate_socket(local_addr).await;
                    });
                }
            }
        }
    })
}

fn spawn_announce_loop(shared: Weak<ServiceShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(shared) = shared.upgrade() else { break };
            let interval = shared.config.reannounce_interval;
            shared.announce_all().await;
            drop(shared);
            tokio::time::sleep(interval).await;
        }
    })
}

fn spawn_sweep_loop(shared: Weak<ServiceShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(shared) = shared.upgrade() else { break };
            let interval = shared.config.sweep_interval();
            shared.sweep_once().await;
            drop(shared);
            tokio::time::sleep(interval).await;
        }
    })
}
