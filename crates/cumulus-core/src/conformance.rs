// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Multi-node scenarios over real loopback sockets. Two services on the
// same host cannot share a discovery port, so each node gets its own
// port and the other node's port is configured as a static peer; the
// protocol traffic is otherwise identical to the multicast path.
#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::ServiceConfig;
    use crate::error::DiscoveryError;
    use crate::ids::NodeId;
    use crate::presence::LocalService;
    use crate::verified_stream::{ChecksumReader, ChecksumWriter, ReadMode, TRAILER_LEN};
    use crate::view::FederatedViewSink;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .expect("probe bind")
            .local_addr()
            .expect("probe addr")
            .port()
    }

    fn node_config(name: &str, port: u16, peer_ports: &[u16]) -> ServiceConfig {
        ServiceConfig {
            display_name: name.to_string(),
            multicast_port: port,
            local_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            reannounce_interval: Duration::from_millis(250),
            expiry_ratio: 4,
            join_timeout: Duration::from_secs(5),
            static_peers: peer_ports
                .iter()
                .map(|&p| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), p))
                .collect(),
            ..ServiceConfig::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
        let start = tokio::time::Instant::now();
        while !cond() {
            if start.elapsed() > deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn solo_cloud_shows_exactly_the_local_folder() {
        let service = LocalService::new(node_config("solo", free_port(), &[]));
        service.start_service().await.expect("start");

        let cloud = service.create_personal_cloud("home", "/tmp/solo").await;
        assert_eq!(cloud.root_view().len(), 1);
        assert!(cloud.peers().is_empty());

        // No token has been issued, so nothing is announced and the view
        // stays at one entry.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(cloud.root_view().len(), 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn share_and_join_federate_both_views() {
        let port_a = free_port();
        let port_b = free_port();
        let sharer = LocalService::new(node_config("desktop", port_a, &[port_b]));
        let joiner = LocalService::new(node_config("laptop", port_b, &[port_a]));
        sharer.start_service().await.expect("start sharer");
        joiner.start_service().await.expect("start joiner");

        let cloud_a = sharer.create_personal_cloud("home", "/tmp/a").await;
        let token = sharer.share_personal_cloud(&cloud_a).await;

        let cloud_b = joiner
            .join_personal_cloud(&token, "laptop")
            .await
            .expect("join must complete");
        assert_eq!(cloud_b.id(), cloud_a.id());
        assert_eq!(cloud_b.name(), "home");

        // Joiner already seeded the sharer at join time.
        assert_eq!(cloud_b.root_view().len(), 2);
        assert_eq!(cloud_b.peers().len(), 1);
        assert_eq!(cloud_b.peers()[0].display_name, "desktop");
        // The token stays with the sharing session; a member does not
        // hold (or announce) it.
        assert!(cloud_b.share_token().is_none());

        // The joiner announces symmetrically, so the sharer's view grows
        // to two entries on its own.
        wait_until("sharer to discover the joiner", Duration::from_secs(5), || {
            cloud_a.root_view().len() == 2
        })
        .await;
        assert_eq!(cloud_a.peers().len(), 1);
        assert_eq!(cloud_a.peers()[0].display_name, "laptop");

        sharer.shutdown().await;
        joiner.shutdown().await;
    }

    #[tokio::test]
    async fn rotated_token_stays_dead_while_members_keep_announcing() {
        let port_a = free_port();
        let port_b = free_port();
        let port_c = free_port();
        let sharer = LocalService::new(node_config("desktop", port_a, &[port_b, port_c]));
        let member = LocalService::new(node_config("laptop", port_b, &[port_a, port_c]));
        let latecomer = LocalService::new({
            let mut c = node_config("phone", port_c, &[port_a, port_b]);
            c.join_timeout = Duration::from_secs(1);
            c
        });
        sharer.start_service().await.expect("start sharer");
        member.start_service().await.expect("start member");
        latecomer.start_service().await.expect("start latecomer");

        let cloud_a = sharer.create_personal_cloud("home", "/tmp/a").await;
        let first_token = sharer.share_personal_cloud(&cloud_a).await;
        let _cloud_b = member
            .join_personal_cloud(&first_token, "laptop")
            .await
            .expect("join with live token");
        wait_until("sharer to discover the member", Duration::from_secs(5), || {
            cloud_a.root_view().len() == 2
        })
        .await;

        // Rotate the sharing session and let everyone announce a few
        // rounds, so any datagram still carrying the old token would have
        // been delivered by now.
        sharer.stop_share_personal_cloud(&cloud_a).await;
        let second_token = sharer.share_personal_cloud(&cloud_a).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        // The member keeps announcing the cloud, but the rotated token
        // must not be honored through anyone.
        let err = latecomer
            .join_personal_cloud(&first_token, "phone")
            .await
            .expect_err("rotated token must not match");
        assert!(matches!(err, DiscoveryError::JoinTimeout(_)));

        // The current token still works.
        let cloud_c = latecomer
            .join_personal_cloud(&second_token, "phone")
            .await
            .expect("join with current token");
        assert_eq!(cloud_c.id(), cloud_a.id());

        sharer.shutdown().await;
        member.shutdown().await;
        latecomer.shutdown().await;
    }

    #[tokio::test]
    async fn departed_peer_ages_out_of_the_view() {
        let port_a = free_port();
        let port_b = free_port();
        let sharer = LocalService::new(node_config("desktop", port_a, &[port_b]));
        let joiner = LocalService::new(node_config("laptop", port_b, &[port_a]));
        sharer.start_service().await.expect("start sharer");
        joiner.start_service().await.expect("start joiner");

        let cloud_a = sharer.create_personal_cloud("home", "/tmp/a").await;
        let token = sharer.share_personal_cloud(&cloud_a).await;
        let _cloud_b = joiner
            .join_personal_cloud(&token, "laptop")
            .await
            .expect("join must complete");

        wait_until("sharer to discover the joiner", Duration::from_secs(5), || {
            cloud_a.root_view().len() == 2
        })
        .await;

        // Silent departure: no Bye, the record must age out after
        // reannounce_interval * expiry_ratio (1 second here).
        joiner.shutdown().await;
        assert_eq!(cloud_a.root_view().len(), 2);

        wait_until("joiner to expire", Duration::from_secs(5), || {
            cloud_a.root_view().len() == 1
        })
        .await;
        assert!(cloud_a.peers().is_empty());

        sharer.shutdown().await;
    }

    #[derive(Default)]
    struct RemovalCounter {
        removed: AtomicUsize,
    }

    impl FederatedViewSink for RemovalCounter {
        fn on_peer_added(&self, _node_id: NodeId, _display_name: &str, _endpoint: SocketAddr) {}

        fn on_peer_removed(&self, _node_id: NodeId) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_peer_renamed(&self, _node_id: NodeId, _new_name: &str) {}
    }

    #[tokio::test]
    async fn bye_removes_the_peer_without_waiting_for_expiry() {
        let port_a = free_port();
        let port_b = free_port();
        let sharer = LocalService::new({
            // Expiry is pushed far out (10 s) so only the Bye can explain
            // a removal inside this test's window.
            let mut c = node_config("desktop", port_a, &[port_b]);
            c.expiry_ratio = 40;
            c
        });
        let joiner = LocalService::new(node_config("laptop", port_b, &[port_a]));
        sharer.start_service().await.expect("start sharer");
        joiner.start_service().await.expect("start joiner");

        let cloud_a = sharer.create_personal_cloud("home", "/tmp/a").await;
        let token = sharer.share_personal_cloud(&cloud_a).await;
        let cloud_b = joiner
            .join_personal_cloud(&token, "laptop")
            .await
            .expect("join must complete");
        wait_until("sharer to discover the joiner", Duration::from_secs(5), || {
            cloud_a.root_view().len() == 2
        })
        .await;

        let counter = Arc::new(RemovalCounter::default());
        cloud_a.attach_sink(Arc::clone(&counter) as Arc<dyn FederatedViewSink>);

        joiner.stop_share_personal_cloud(&cloud_b).await;
        wait_until("bye to remove the joiner", Duration::from_secs(3), || {
            cloud_a.root_view().len() == 1
        })
        .await;
        assert_eq!(counter.removed.load(Ordering::SeqCst), 1);
        assert!(cloud_a.peers().is_empty());

        sharer.shutdown().await;
        joiner.shutdown().await;
    }

    #[tokio::test]
    async fn network_change_churn_does_not_disturb_the_view() {
        let service = LocalService::new(node_config("churn", free_port(), &[]));
        service.start_service().await.expect("start");
        let cloud = service.create_personal_cloud("home", "/tmp/churn").await;

        for i in 0..100u32 {
            service.network_may_changed(i % 2 == 0).await;
        }

        assert_eq!(cloud.root_view().len(), 1);
        assert!(cloud.peers().is_empty());

        // The service is still functional after the churn.
        let token = service.share_personal_cloud(&cloud).await;
        assert!(token.parse::<u32>().is_ok());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn checksummed_transfer_survives_both_transforms() {
        // A payload framed on the sending side must verify cleanly on the
        // receiving side, and the append-mode reader must produce the
        // identical frame from bare data.
        let payload: Vec<u8> = (0u32..32_768).map(|i| (i * 31 % 256) as u8).collect();

        let mut writer = ChecksumWriter::new(Cursor::new(Vec::new()), true);
        writer.write_all(&payload).await.expect("write");
        writer.shutdown().await.expect("shutdown");
        let framed = writer.into_inner().into_inner();
        assert_eq!(framed.len(), payload.len() + TRAILER_LEN);

        let mut append = ChecksumReader::new(
            Cursor::new(payload.clone()),
            ReadMode::Append,
            payload.len() as u64,
            None,
        );
        let mut synthesized = Vec::new();
        append.read_to_end(&mut synthesized).await.expect("append");
        assert_eq!(synthesized, framed);

        let mut verify = ChecksumReader::new(
            Cursor::new(framed),
            ReadMode::Verify,
            payload.len() as u64,
            None,
        );
        let mut out = Vec::new();
        verify.read_to_end(&mut out).await.expect("verify");
        assert_eq!(out, payload);
    }
}
