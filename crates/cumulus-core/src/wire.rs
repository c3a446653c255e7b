// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};

use crate::ids::{CloudId, NodeId, ShareToken};

/// Current discovery wire-protocol version. Bump when breaking changes land.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound for a discovery datagram accepted from the wire. Matches
/// the receive buffer size, so anything larger was truncated anyway.
pub const MAX_DATAGRAM_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Periodic assertion of continued presence in a cloud.
    Announce,
    /// Explicit departure; the receiver drops the sender's record directly.
    Bye,
}

/// One discovery datagram. CBOR-encoded so payloads are self-describing
/// and garbled input is rejected by the decoder rather than misread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub version: u16,
    pub kind: MessageKind,
    pub node_id: NodeId,
    pub display_name: String,
    pub cloud_id: CloudId,
    /// Human-readable cloud name, so a joiner can label the membership it
    /// creates from this announcement.
    pub cloud_name: String,
    /// Present while the sender is actively sharing the cloud, or when a
    /// joiner echoes the token it joined with. Absent otherwise.
    pub share_token: Option<ShareToken>,
    /// Port of the sender's file service; combined with the datagram's
    /// source address to form the peer endpoint.
    pub service_port: u16,
    /// Sender wall clock, seconds since the Unix epoch. A staleness hint
    /// only — receivers never rely on it for ordering.
    pub sent_at_unix: u64,
}

impl Announcement {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(crate::cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            anyhow::bail!(
                "datagram exceeds max size: {} > {}",
                bytes.len(),
                MAX_DATAGRAM_BYTES
            );
        }
        let msg: Self = crate::cbor::from_slice(bytes)?;
        if msg.version != PROTOCOL_VERSION {
            anyhow::bail!(
                "unsupported announcement version {} (expected {})",
                msg.version,
                PROTOCOL_VERSION
            );
        }
        Ok(msg)
    }
}
