// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// One socket pair per local address: multicast group membership and
// multi-homed interface selection differ across platforms, so isolating
// sockets per interface keeps failures local and recoverable.
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;
use crate::wire::MAX_DATAGRAM_BYTES;

/// Well-known discovery group, IPv4.
pub const MULTICAST_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Well-known discovery group, IPv6 (link-local scope).
pub const MULTICAST_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c);

/// Hop limit on the passive listen socket.
pub const LISTEN_TTL: u32 = 5;
/// Hop limit on the announce socket. Sends must reach more hops than the
/// listener needs to defend against.
pub const ANNOUNCE_TTL: u32 = 15;

/// What a receive loop feeds into the dispatcher channel.
#[derive(Debug)]
pub enum ListenEvent {
    Packet {
        payload: Vec<u8>,
        from: SocketAddr,
        local_addr: IpAddr,
    },
    /// Socket-level receive failure. The loop has exited; the owner may
    /// recreate the socket.
    Failed { local_addr: IpAddr, error: io::Error },
}

fn bind_udp(local: IpAddr, port: u16) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(local, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    if local.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn set_multicast_options(socket: &UdpSocket, local: IpAddr, ttl: u32) -> io::Result<()> {
    match local {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(ttl)?;
            socket.set_multicast_loop_v4(false)?;
        }
        IpAddr::V6(_) => {
            socket.set_multicast_loop_v6(false)?;
        }
    }
    Ok(())
}

/// Bind the passive listen socket for one local address. A `Bind` error is
/// not fatal to the caller: it logs and skips that interface.
pub fn create_listen_socket(local: IpAddr, port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = bind_udp(local, port).map_err(|source| DiscoveryError::Bind {
        addr: local,
        port,
        source,
    })?;
    if let Err(err) = set_multicast_options(&socket, local, LISTEN_TTL) {
        tracing::warn!(%local, error = %err, "could not set multicast options on listen socket");
    }
    Ok(socket)
}

/// Bind the ephemeral-port send socket for one local address. Kept
/// separate from the listen socket so send and receive paths have
/// independent lifetimes and TTLs.
pub fn create_client_socket(
    local: IpAddr,
    interface_indices: &[u32],
) -> Result<UdpSocket, DiscoveryError> {
    let socket = bind_udp(local, 0).map_err(|source| DiscoveryError::Bind {
        addr: local,
        port: 0,
        source,
    })?;
    if let Err(err) = set_multicast_options(&socket, local, ANNOUNCE_TTL) {
        tracing::warn!(%local, error = %err, "could not set multicast options on client socket");
    }
    join_groups(&socket, local, interface_indices);
    Ok(socket)
}

/// Join the discovery group on every interface for this socket's address
/// family. Per-interface failures are logged and do not abort the
/// remaining joins.
pub fn join_groups(socket: &UdpSocket, local: IpAddr, interface_indices: &[u32]) {
    match local {
        IpAddr::V4(v4) => {
            // IPv4 membership is selected by the bound local address, not
            // by interface index: every local address has its own socket,
            // so one join per socket covers all interfaces.
            if let Err(err) = socket.join_multicast_v4(MULTICAST_GROUP_V4, v4) {
                tracing::warn!(%local, error = %err, "failed to join IPv4 discovery group");
            }
        }
        IpAddr::V6(_) => {
            for &ifidx in interface_indices {
                // Joining on "any" interface is rejected by some OS stacks.
                if ifidx == 0 {
                    continue;
                }
                if let Err(err) = socket.join_multicast_v6(&MULTICAST_GROUP_V6, ifidx) {
                    tracing::warn!(
                        %local,
                        ifidx,
                        error = %err,
                        "failed to join IPv6 discovery group"
                    );
                }
            }
        }
    }
}

/// Run one receive loop for `socket`, forwarding datagrams into `tx`.
///
/// The protocol layer stops the loop by dropping the receiving half of
/// the channel; a socket error emits [`ListenEvent::Failed`] and exits so
/// the owner can recreate the socket. Each loop is its own task, so a
/// blocked socket never stalls the others.
pub fn spawn_listen_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<ListenEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local_addr = socket
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let event = ListenEvent::Packet {
                        payload: buf[..len].to_vec(),
                        from,
                        local_addr,
                    };
                    if tx.send(event).await.is_err() {
                        // Dispatcher gone: clean stop.
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(%local_addr, %error, "discovery socket receive failed");
                    let _ = tx.send(ListenEvent::Failed { local_addr, error }).await;
                    break;
                }
            }
        }
    })
}

/// Best-effort datagram send. Discovery is inherently lossy; transient
/// send failures are logged, never surfaced.
pub async fn send_to(socket: &UdpSocket, target: SocketAddr, payload: &[u8]) {
    if let Err(error) = socket.send_to(payload, target).await {
        tracing::debug!(%target, %error, "announce send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn listen_loop_delivers_datagrams() {
        let listen = Arc::new(create_listen_socket(loopback(), 0).expect("bind listen"));
        let listen_addr = listen.local_addr().expect("local addr");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_listen_loop(listen, tx);

        let sender = create_client_socket(loopback(), &[]).expect("bind client");
        send_to(&sender, listen_addr, b"hello cloud").await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no timeout")
            .expect("event");
        match event {
            ListenEvent::Packet { payload, from, .. } => {
                assert_eq!(payload, b"hello cloud");
                assert_eq!(from.ip(), loopback());
            }
            ListenEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }

        // Dropping the receiver stops the loop after the next datagram.
        drop(rx);
        send_to(&sender, listen_addr, b"stop").await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .expect("task joins");
    }

    #[tokio::test]
    async fn bind_failure_is_reported_not_panicked() {
        let first = create_listen_socket(loopback(), 0).expect("bind");
        let port = first.local_addr().expect("addr").port();
        // Reuse flags make a same-port bind succeed; an address we cannot
        // own does not.
        let err = create_listen_socket("192.0.2.1".parse().expect("ip"), port);
        assert!(matches!(err, Err(DiscoveryError::Bind { .. })));
    }

    #[tokio::test]
    async fn two_sockets_share_the_discovery_port() {
        let first = create_listen_socket(loopback(), 0).expect("bind first");
        let port = first.local_addr().expect("addr").port();
        let second = create_listen_socket(loopback(), port);
        assert!(second.is_ok());
    }
}
