// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express fabric model: transaction layer packet routing through a
//! hierarchy of bridges, switch ports and endpoints, each backed by its own
//! configuration register file.

#![forbid(unsafe_code)]

pub mod decode;
pub mod node;
pub mod port;
pub mod root;
pub mod route;
pub mod switch;
pub mod tlp;
pub mod topology;

#[cfg(test)]
mod test_helpers;

use thiserror::Error;

const VENDOR_ID: u16 = 0x1414;
const HOST_BRIDGE_DEVICE_ID: u16 = 0xC02F;
const ROOT_PORT_DEVICE_ID: u16 = 0xC030;
const UPSTREAM_SWITCH_PORT_DEVICE_ID: u16 = 0xC031;
const DOWNSTREAM_SWITCH_PORT_DEVICE_ID: u16 = 0xC032;

const MAX_DEVICES_PER_BUS: u8 = 32;
const MAX_FUNCTIONS_PER_DEVICE: u8 = 8;

const BDF_DEVICE_SHIFT: u8 = 3;
const BDF_FUNCTION_MASK: u8 = 0x7;

/// The direction a packet is travelling through a node's links.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Toward the root.
    Upstream,
    /// Toward the leaves.
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// Failures that abort the traversal of a packet.
///
/// Protocol-level routing mismatches are never reported this way: they are
/// dropped or answered with an Unsupported Request completion.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A packet had to be forwarded on a link with nothing attached.
    #[error("no transport attached {direction} of {node}")]
    TransportUnavailable {
        /// The node attempting the forward.
        node: String,
        /// The side of the node without a link.
        direction: Direction,
    },
    /// The packet's format/type field is not a recognized TLP kind.
    #[error("unknown TLP format/type {0:#04x}")]
    UnknownPacketKind(u8),
    /// A gather message arrived heading toward the root. No aggregation
    /// policy exists for these.
    #[error("gather message routing toward the root is not implemented")]
    UnimplementedGather,
}
