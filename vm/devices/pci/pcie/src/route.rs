// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-packet routing decisions.
//!
//! A bridge runs one of two tables depending on which side a packet came in
//! on. Endpoint functions only ever receive from upstream and have a table of
//! their own. Packets a bridge transmits itself run through the table for packets
//! arriving from downstream, so its own traffic obeys the same containment
//! rules as traffic it relays.

use crate::RoutingError;
use crate::decode::DecodeView;
use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::tlp::TlpClass;
use std::fmt;

/// Which downstream neighbors a packet is forwarded to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownstreamTarget {
    /// The one child that claims it.
    Child,
    /// Every child.
    AllChildren,
}

/// Why a packet was discarded without a completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A type 1 configuration request for a bus outside the subordinate range.
    ConfigBusOutOfRange,
    /// A configuration request travelling toward the root.
    ConfigFromDownstream,
    /// A completion whose requester is not behind this bridge.
    CompletionOutOfRange,
    /// An ID-routed message whose destination is not behind this bridge.
    MessageOutOfRange,
    /// An I/O request outside the bridge's BARs and I/O window.
    IoOutOfRange,
    /// A memory request outside the bridge's BARs and memory windows.
    MemoryOutOfRange,
    /// A message to the root complex travelling away from the root.
    MessageToRootComplexFromUpstream,
    /// A local message reaching a bridge.
    LocalMessage,
    /// A gather message travelling away from the root.
    GatherFromUpstream,
    /// A broadcast travelling toward the root.
    BroadcastFromDownstream,
    /// A broadcast on a bus with nothing attached.
    NoBroadcastTargets,
    /// A packet delivered to a function with no behavior attached.
    NoHandler,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::ConfigBusOutOfRange => "type 1 config request outside bus range",
            DropReason::ConfigFromDownstream => "config request from downstream",
            DropReason::CompletionOutOfRange => "completion requester outside bus range",
            DropReason::MessageOutOfRange => "ID-routed message outside bus range",
            DropReason::IoOutOfRange => "I/O request outside window",
            DropReason::MemoryOutOfRange => "memory request outside windows",
            DropReason::MessageToRootComplexFromUpstream => "message to root complex from upstream",
            DropReason::LocalMessage => "local message",
            DropReason::GatherFromUpstream => "gather message from upstream",
            DropReason::BroadcastFromDownstream => "broadcast from downstream",
            DropReason::NoBroadcastTargets => "broadcast with no downstream neighbors",
            DropReason::NoHandler => "no handler attached",
        };
        f.write_str(s)
    }
}

/// The next hop for a packet at a bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// The packet terminates at this node.
    DeliverLocally,
    /// Send the packet out of the upstream link.
    ForwardUpstream,
    /// Send the packet out of the downstream side.
    ForwardDownstream {
        /// Which neighbors receive it.
        target: DownstreamTarget,
        /// Rewrite a type 1 configuration request to type 0 first, because
        /// it targets the bus directly below.
        to_type0: bool,
    },
    /// Discard the packet.
    Drop(DropReason),
    /// Answer the packet with an Unsupported Request completion.
    UnsupportedRequest,
}

impl RouteAction {
    const FORWARD_DOWNSTREAM: Self = Self::ForwardDownstream {
        target: DownstreamTarget::Child,
        to_type0: false,
    };
}

/// Routes a packet received on a bridge's upstream link.
pub fn route_from_upstream(tlp: &Tlp, node: &DecodeView<'_>) -> Result<RouteAction, RoutingError> {
    let class = tlp
        .class()
        .ok_or(RoutingError::UnknownPacketKind(tlp.fmt_type.0))?;

    let action = match class {
        // Always consumed at the level it targets.
        TlpClass::ConfigType0 => RouteAction::DeliverLocally,
        TlpClass::ConfigType1 => {
            let bus = tlp.dest_id.bus();
            if node.bus_in_subordinate_range(bus) {
                RouteAction::ForwardDownstream {
                    target: DownstreamTarget::Child,
                    to_type0: node.secondary_bus() == Some(bus),
                }
            } else {
                RouteAction::Drop(DropReason::ConfigBusOutOfRange)
            }
        }
        TlpClass::Completion => {
            if !node.is_root() && node.matches_id(tlp.requester_id) {
                RouteAction::DeliverLocally
            } else if node.bus_in_subordinate_range(tlp.requester_id.bus()) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::Drop(DropReason::CompletionOutOfRange)
            }
        }
        TlpClass::MessageIdRouted => {
            if !node.is_root() && node.matches_id(tlp.dest_id) {
                RouteAction::DeliverLocally
            } else if node.bus_in_subordinate_range(tlp.dest_id.bus()) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::Drop(DropReason::MessageOutOfRange)
            }
        }
        TlpClass::Io => {
            if node.matches_bar(tlp.address, true) {
                RouteAction::DeliverLocally
            } else if node.io_window_contains(tlp.address) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::Drop(DropReason::IoOutOfRange)
            }
        }
        TlpClass::Memory => {
            if node.matches_bar(tlp.address, false) {
                RouteAction::DeliverLocally
            } else if node.memory_window_contains(tlp.address) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::Drop(DropReason::MemoryOutOfRange)
            }
        }
        TlpClass::MessageToRootComplex => {
            RouteAction::Drop(DropReason::MessageToRootComplexFromUpstream)
        }
        TlpClass::MessageLocal => RouteAction::Drop(DropReason::LocalMessage),
        TlpClass::MessageGather => RouteAction::Drop(DropReason::GatherFromUpstream),
        TlpClass::MessageBroadcast => RouteAction::ForwardDownstream {
            target: DownstreamTarget::AllChildren,
            to_type0: false,
        },
    };
    Ok(action)
}

/// Routes a packet received on one of a bridge's downstream links, or
/// transmitted by the bridge itself.
pub fn route_from_downstream(
    tlp: &Tlp,
    node: &DecodeView<'_>,
) -> Result<RouteAction, RoutingError> {
    let class = tlp
        .class()
        .ok_or(RoutingError::UnknownPacketKind(tlp.fmt_type.0))?;

    // The host bridge hands traffic for the host (device 0 on its primary
    // bus) up to the host instead of back down its own bus.
    let for_host = |id: PcieId| {
        node.is_root() && Some(id.bus()) == node.primary_bus() && id.device() == 0
    };

    let action = match class {
        // Only the root originates configuration requests.
        TlpClass::ConfigType0 | TlpClass::ConfigType1 => {
            RouteAction::Drop(DropReason::ConfigFromDownstream)
        }
        TlpClass::Completion => {
            let requester = tlp.requester_id;
            if !node.is_root() && node.matches_id(requester) {
                RouteAction::DeliverLocally
            } else if node.bus_in_subordinate_range(requester.bus()) {
                if for_host(requester) {
                    RouteAction::ForwardUpstream
                } else {
                    RouteAction::FORWARD_DOWNSTREAM
                }
            } else {
                RouteAction::ForwardUpstream
            }
        }
        TlpClass::MessageIdRouted => {
            let dest = tlp.dest_id;
            if !node.is_root() && node.matches_id(dest) {
                RouteAction::DeliverLocally
            } else if node.bus_in_subordinate_range(dest.bus()) {
                if for_host(dest) {
                    RouteAction::ForwardUpstream
                } else {
                    RouteAction::FORWARD_DOWNSTREAM
                }
            } else {
                RouteAction::ForwardUpstream
            }
        }
        TlpClass::Io => {
            if node.matches_bar(tlp.address, true) {
                RouteAction::DeliverLocally
            } else if node.io_window_contains(tlp.address) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::ForwardUpstream
            }
        }
        TlpClass::Memory => {
            if node.matches_bar(tlp.address, false) {
                RouteAction::DeliverLocally
            } else if node.memory_window_contains(tlp.address) {
                RouteAction::FORWARD_DOWNSTREAM
            } else {
                RouteAction::ForwardUpstream
            }
        }
        TlpClass::MessageToRootComplex => RouteAction::ForwardUpstream,
        TlpClass::MessageBroadcast => RouteAction::Drop(DropReason::BroadcastFromDownstream),
        TlpClass::MessageLocal => RouteAction::Drop(DropReason::LocalMessage),
        TlpClass::MessageGather => return Err(RoutingError::UnimplementedGather),
    };
    Ok(action)
}

/// Routes a packet arriving at an endpoint function from its upstream link.
///
/// Functions have no downstream side, so anything they do not claim either
/// fails as an Unsupported Request or, for packets that expect no response,
/// is dropped.
pub fn route_to_function(tlp: &Tlp, node: &DecodeView<'_>) -> Result<RouteAction, RoutingError> {
    let class = tlp
        .class()
        .ok_or(RoutingError::UnknownPacketKind(tlp.fmt_type.0))?;

    let action = match class {
        TlpClass::ConfigType0 => RouteAction::DeliverLocally,
        TlpClass::ConfigType1 => RouteAction::UnsupportedRequest,
        TlpClass::Completion => {
            if node.matches_id(tlp.requester_id) {
                RouteAction::DeliverLocally
            } else {
                RouteAction::Drop(DropReason::CompletionOutOfRange)
            }
        }
        TlpClass::MessageIdRouted => {
            if node.matches_id(tlp.dest_id) {
                RouteAction::DeliverLocally
            } else {
                RouteAction::Drop(DropReason::MessageOutOfRange)
            }
        }
        TlpClass::Io => {
            if node.matches_bar(tlp.address, true) {
                RouteAction::DeliverLocally
            } else {
                RouteAction::UnsupportedRequest
            }
        }
        TlpClass::Memory => {
            if node.matches_bar(tlp.address, false) {
                RouteAction::DeliverLocally
            } else {
                RouteAction::UnsupportedRequest
            }
        }
        TlpClass::MessageBroadcast | TlpClass::MessageLocal => RouteAction::DeliverLocally,
        TlpClass::MessageToRootComplex => {
            RouteAction::Drop(DropReason::MessageToRootComplexFromUpstream)
        }
        TlpClass::MessageGather => RouteAction::Drop(DropReason::GatherFromUpstream),
    };
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::bridge_hardware_ids;
    use crate::test_helpers::endpoint_hardware_ids;
    use crate::tlp::CompletionStatus;
    use crate::tlp::TlpType;
    use pci_core::cfg_space_emu::BarKind;
    use pci_core::cfg_space_emu::ConfigSpaceType0Emulator;
    use pci_core::cfg_space_emu::ConfigSpaceType1Emulator;
    use pci_core::cfg_space_emu::DeviceBars;

    const ID: PcieId = PcieId::from_bdf(4, 0, 0);

    fn bridge() -> ConfigSpaceType1Emulator {
        let mut cfg = ConfigSpaceType1Emulator::new(bridge_hardware_ids())
            .with_bus_numbers(4, 5, 10);
        // memory window 0xC000_0000..=0xC0FF_FFFF, I/O window 0x2000..=0x2FFF
        cfg.write_register(8, 0xC0F0_C000, 0xF);
        cfg.write_register(7, 0x0000_2020, 0x3);
        cfg
    }

    fn host_bridge() -> ConfigSpaceType1Emulator {
        ConfigSpaceType1Emulator::new(bridge_hardware_ids()).with_bus_numbers(0, 0, 255)
    }

    fn completion_for(requester: PcieId) -> Tlp {
        Tlp::completion(
            &Tlp::mem_read(0, 1).with_requester(requester, 0),
            PcieId::new(),
            CompletionStatus::SUCCESSFUL,
        )
    }

    #[test]
    fn type1_config_from_upstream() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);

        let route = |bus| {
            route_from_upstream(&Tlp::config_read_1(PcieId::from_bdf(bus, 0, 0), 0), &view)
                .unwrap()
        };
        assert_eq!(
            route(5),
            RouteAction::ForwardDownstream {
                target: DownstreamTarget::Child,
                to_type0: true
            }
        );
        assert_eq!(route(7), RouteAction::FORWARD_DOWNSTREAM);
        assert_eq!(route(12), RouteAction::Drop(DropReason::ConfigBusOutOfRange));
        assert_eq!(route(4), RouteAction::Drop(DropReason::ConfigBusOutOfRange));

        let type0 = Tlp::config_write_0(ID, 6, 0, 0xF);
        assert_eq!(route_from_upstream(&type0, &view).unwrap(), RouteAction::DeliverLocally);
    }

    #[test]
    fn bus_numbers_at_reset() {
        // primary = secondary = subordinate = 0
        let cfg = ConfigSpaceType1Emulator::new(bridge_hardware_ids());
        let view = DecodeView::bridge(PcieId::from_bdf(0, 1, 0), &cfg);

        assert_eq!(
            route_from_upstream(&Tlp::config_read_1(PcieId::from_bdf(0, 0, 0), 0), &view)
                .unwrap(),
            RouteAction::ForwardDownstream {
                target: DownstreamTarget::Child,
                to_type0: true
            }
        );
        assert_eq!(
            route_from_upstream(&Tlp::config_read_1(PcieId::from_bdf(1, 0, 0), 0), &view)
                .unwrap(),
            RouteAction::Drop(DropReason::ConfigBusOutOfRange)
        );

        // Bus 0 is behind the bridge, so its own completions to bus 0 go down.
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(0, 0, 0)), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(1, 0, 0)), &view).unwrap(),
            RouteAction::ForwardUpstream
        );
    }

    #[test]
    fn completions_from_upstream() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);

        assert_eq!(
            route_from_upstream(&completion_for(ID), &view).unwrap(),
            RouteAction::DeliverLocally
        );
        assert_eq!(
            route_from_upstream(&completion_for(PcieId::from_bdf(9, 0, 0)), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_upstream(&completion_for(PcieId::from_bdf(11, 0, 0)), &view).unwrap(),
            RouteAction::Drop(DropReason::CompletionOutOfRange)
        );
    }

    #[test]
    fn addresses_from_upstream() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);

        assert_eq!(
            route_from_upstream(&Tlp::mem_read(0xC080_0000, 1), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_upstream(&Tlp::mem_read(0xD000_0000, 1), &view).unwrap(),
            RouteAction::Drop(DropReason::MemoryOutOfRange)
        );
        assert_eq!(
            route_from_upstream(&Tlp::io_read(0x2FFC), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_upstream(&Tlp::io_read(0x3000), &view).unwrap(),
            RouteAction::Drop(DropReason::IoOutOfRange)
        );
    }

    #[test]
    fn messages_from_upstream() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);

        assert_eq!(
            route_from_upstream(&Tlp::message_broadcast(0x19), &view).unwrap(),
            RouteAction::ForwardDownstream {
                target: DownstreamTarget::AllChildren,
                to_type0: false
            }
        );
        assert_eq!(
            route_from_upstream(&Tlp::message_to_root_complex(0x20), &view).unwrap(),
            RouteAction::Drop(DropReason::MessageToRootComplexFromUpstream)
        );
        assert_eq!(
            route_from_upstream(&Tlp::message_gather(0x1B), &view).unwrap(),
            RouteAction::Drop(DropReason::GatherFromUpstream)
        );
        assert_eq!(
            route_from_upstream(&Tlp::message_id_routed(ID, 0x7E), &view).unwrap(),
            RouteAction::DeliverLocally
        );
    }

    #[test]
    fn from_downstream() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);

        assert_eq!(
            route_from_downstream(&Tlp::config_read_1(PcieId::from_bdf(7, 0, 0), 0), &view)
                .unwrap(),
            RouteAction::Drop(DropReason::ConfigFromDownstream)
        );
        // Peer-to-peer traffic between functions behind the same bridge turns
        // around; everything else heads up.
        assert_eq!(
            route_from_downstream(&Tlp::mem_write(0xC000_0000, vec![1]), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_downstream(&Tlp::mem_write(0x1000_0000, vec![1]), &view).unwrap(),
            RouteAction::ForwardUpstream
        );
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(0, 0, 0)), &view).unwrap(),
            RouteAction::ForwardUpstream
        );
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(6, 0, 0)), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        assert_eq!(
            route_from_downstream(&Tlp::message_to_root_complex(0x20), &view).unwrap(),
            RouteAction::ForwardUpstream
        );
        assert_eq!(
            route_from_downstream(&Tlp::message_broadcast(0x19), &view).unwrap(),
            RouteAction::Drop(DropReason::BroadcastFromDownstream)
        );
        assert_eq!(
            route_from_downstream(&Tlp::message_local(0x14), &view).unwrap(),
            RouteAction::Drop(DropReason::LocalMessage)
        );
        assert!(matches!(
            route_from_downstream(&Tlp::message_gather(0x1B), &view),
            Err(RoutingError::UnimplementedGather)
        ));
    }

    #[test]
    fn host_bridge_returns_host_traffic_upstream() {
        let cfg = host_bridge();
        let view = DecodeView::root(PcieId::from_bdf(0, 0, 0), &cfg);

        // A completion for the host, even though bus 0 is "behind" the host
        // bridge.
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(0, 0, 0)), &view).unwrap(),
            RouteAction::ForwardUpstream
        );
        assert_eq!(
            route_from_downstream(&Tlp::message_id_routed(PcieId::from_bdf(0, 0, 0), 0), &view)
                .unwrap(),
            RouteAction::ForwardUpstream
        );
        // A completion for a root port on bus 0 stays in the fabric.
        assert_eq!(
            route_from_downstream(&completion_for(PcieId::from_bdf(0, 1, 0)), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
        // The host bridge never claims completions for itself.
        assert_eq!(
            route_from_upstream(&completion_for(PcieId::from_bdf(0, 0, 0)), &view).unwrap(),
            RouteAction::FORWARD_DOWNSTREAM
        );
    }

    #[test]
    fn function_routing() {
        let mut cfg = ConfigSpaceType0Emulator::new(
            endpoint_hardware_ids(),
            DeviceBars::new().bar0(0x1000, BarKind::Memory32),
        );
        cfg.write_register(4, 0xD000_0000, 0xF);
        let id = PcieId::from_bdf(6, 0, 0);
        let view = DecodeView::function(id, &cfg);

        assert_eq!(
            route_to_function(&Tlp::mem_read(0xD000_0800, 1), &view).unwrap(),
            RouteAction::DeliverLocally
        );
        assert_eq!(
            route_to_function(&Tlp::mem_read(0xD000_1000, 1), &view).unwrap(),
            RouteAction::UnsupportedRequest
        );
        assert_eq!(
            route_to_function(&Tlp::config_read_1(id, 0), &view).unwrap(),
            RouteAction::UnsupportedRequest
        );
        assert_eq!(
            route_to_function(&Tlp::config_read_0(id, 0), &view).unwrap(),
            RouteAction::DeliverLocally
        );
        assert_eq!(
            route_to_function(&completion_for(PcieId::from_bdf(6, 0, 1)), &view).unwrap(),
            RouteAction::Drop(DropReason::CompletionOutOfRange)
        );
        assert_eq!(
            route_to_function(&Tlp::message_broadcast(0x19), &view).unwrap(),
            RouteAction::DeliverLocally
        );
    }

    #[test]
    fn unknown_packet_kind() {
        let cfg = bridge();
        let view = DecodeView::bridge(ID, &cfg);
        let mut tlp = Tlp::mem_read(0, 1);
        tlp.fmt_type = TlpType(0x1F);
        assert!(matches!(
            route_from_upstream(&tlp, &view),
            Err(RoutingError::UnknownPacketKind(0x1F))
        ));
        assert!(matches!(
            route_from_downstream(&tlp, &view),
            Err(RoutingError::UnknownPacketKind(0x1F))
        ));
    }
}
