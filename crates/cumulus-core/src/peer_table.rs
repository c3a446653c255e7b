// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::ids::NodeId;

/// Reachable endpoint of a peer: datagram source address + announced
/// service port.
pub type PeerEndpoint = SocketAddr;

/// Freshness of a peer record, derived from the age of its last
/// announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Announced within the reannounce interval.
    Fresh,
    /// Interval elapsed; pre-removal grace window.
    Expiring,
    /// Past the expiry threshold. Terminal: the next sweep removes it.
    Expired,
}

/// This node's knowledge of one remote participant. Mutated only by the
/// presence protocol on receipt of an announcement or by the expiry sweep.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub display_name: String,
    pub endpoint: PeerEndpoint,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn state(&self, reannounce: Duration, threshold: Duration, now: Instant) -> PeerState {
        let age = now.saturating_duration_since(self.last_seen);
        if age <= reannounce {
            PeerState::Fresh
        } else if age <= threshold {
            PeerState::Expiring
        } else {
            PeerState::Expired
        }
    }
}

/// Result of folding an announcement into the table, so the caller knows
/// which view notification to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Refreshed,
    Renamed { new_name: String },
}

/// Peer records of one cloud membership, keyed by node id.
///
/// Vec-backed: lookups are linear but the table holds a handful of LAN
/// peers, and insertion order is preserved for stable enumeration.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: Vec<PeerRecord>,
}

impl PeerTable {
    /// Refresh an existing record or insert a new one. Every valid
    /// announcement resets the freshness timer; duplicates and reordered
    /// datagrams are therefore harmless.
    pub fn upsert(
        &mut self,
        node_id: NodeId,
        display_name: &str,
        endpoint: PeerEndpoint,
        now: Instant,
    ) -> UpsertOutcome {
        if let Some(record) = self.records.iter_mut().find(|r| r.node_id == node_id) {
            record.last_seen = now;
            record.endpoint = endpoint;
            if record.display_name != display_name {
                record.display_name = display_name.to_string();
                return UpsertOutcome::Renamed {
                    new_name: display_name.to_string(),
                };
            }
            return UpsertOutcome::Refreshed;
        }
        self.records.push(PeerRecord {
            node_id,
            display_name: display_name.to_string(),
            endpoint,
            last_seen: now,
        });
        UpsertOutcome::Added
    }

    /// Remove one record directly (explicit `Bye`).
    pub fn remove(&mut self, node_id: NodeId) -> Option<PeerRecord> {
        let idx = self.records.iter().position(|r| r.node_id == node_id)?;
        Some(self.records.remove(idx))
    }

    /// Drop every record past the expiry threshold, returning the removed
    /// records so the caller can notify the federated view exactly once
    /// per peer.
    pub fn sweep(&mut self, threshold: Duration, now: Instant) -> Vec<PeerRecord> {
        let mut expired = Vec::new();
        self.records.retain(|record| {
            if now.saturating_duration_since(record.last_seen) > threshold {
                expired.push(record.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn get(&self, node_id: NodeId) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }
}
