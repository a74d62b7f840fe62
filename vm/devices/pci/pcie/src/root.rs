// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express root complex: the host side of the fabric and the engine that
//! carries packets through it.
//!
//! Packets move one hop at a time through a single FIFO. A node finishes
//! with a packet, including any completion it generates, before the next
//! queued packet is looked at.

use crate::Direction;
use crate::HOST_BRIDGE_DEVICE_ID;
use crate::ROOT_PORT_DEVICE_ID;
use crate::RoutingError;
use crate::VENDOR_ID;
use crate::node::RoutingCounters;
use crate::port::Arrival;
use crate::port::TlpHandler;
use crate::port::TlpSink;
use crate::route::DownstreamTarget;
use crate::route::DropReason;
use crate::route::RouteAction;
use crate::route::route_from_downstream;
use crate::route::route_from_upstream;
use crate::route::route_to_function;
use crate::switch::FanOut;
use crate::switch::select_downstream;
use crate::tlp::Tlp;
use crate::tlp::TlpClass;
use crate::topology::DownstreamLinks;
use crate::topology::NodeId;
use crate::topology::NodeKind;
use crate::topology::Topology;
use crate::topology::UpstreamLink;
use anyhow::Context;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::HardwareIds;
use pci_core::spec::hwid::ProgrammingInterface;
use pci_core::spec::hwid::Subclass;
use std::collections::VecDeque;
use std::sync::Arc;

/// A description of a generic PCIe root port.
#[derive(Debug, Clone)]
pub struct GenericPcieRootPortDefinition {
    /// The name of the root port.
    pub name: Arc<str>,
    /// Device number on the host bridge's bus.
    pub device: u8,
}

impl GenericPcieRootPortDefinition {
    /// Create a new root port definition.
    pub fn new(name: impl Into<Arc<str>>, device: u8) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

fn bridge_hardware_ids(device_id: u16, sub_class: Subclass) -> HardwareIds {
    HardwareIds {
        vendor_id: VENDOR_ID,
        device_id,
        revision_id: 0,
        prog_if: ProgrammingInterface::NONE,
        sub_class,
        base_class: ClassCode::BRIDGE,
        type0_sub_vendor_id: 0,
        type0_sub_system_id: 0,
    }
}

pub(crate) fn host_bridge_hardware_ids() -> HardwareIds {
    bridge_hardware_ids(HOST_BRIDGE_DEVICE_ID, Subclass::BRIDGE_HOST)
}

pub(crate) fn root_port_hardware_ids() -> HardwareIds {
    bridge_hardware_ids(ROOT_PORT_DEVICE_ID, Subclass::BRIDGE_PCI_TO_PCI)
}

type DropObserver = Box<dyn FnMut(&str, &Tlp, DropReason) + Send>;

struct Delivery {
    node: NodeId,
    arrival: Arrival,
    tlp: Tlp,
}

fn transport_unavailable(topology: &Topology, id: NodeId, direction: Direction) -> RoutingError {
    RoutingError::TransportUnavailable {
        node: topology.node(id).name().to_string(),
        direction,
    }
}

/// A PCI Express root complex driving a [`Topology`].
pub struct PcieRootComplex {
    topology: Topology,
    root: NodeId,
    host: Option<Box<dyn TlpSink>>,
    queue: VecDeque<Delivery>,
    drop_observer: Option<DropObserver>,
}

impl PcieRootComplex {
    /// Constructs a new root complex. `topology` must have a host bridge.
    pub fn new(topology: Topology) -> anyhow::Result<Self> {
        let root = topology.root().context("topology has no host bridge")?;
        Ok(Self {
            topology,
            root,
            host: None,
            queue: VecDeque::new(),
            drop_observer: None,
        })
    }

    /// The fabric.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The fabric, for direct register programming.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    /// The host bridge.
    pub fn host_bridge(&self) -> NodeId {
        self.root
    }

    /// Connect the host to the host bridge's upstream link.
    pub fn attach_host(&mut self, sink: Box<dyn TlpSink>) {
        self.host = Some(sink);
    }

    /// Give `node` a behavior for the packets it consumes.
    pub fn attach_handler(&mut self, node: NodeId, handler: Box<dyn TlpHandler>) {
        self.topology.node_mut(node).handler = Some(handler);
    }

    /// Register a callback invoked for every silently dropped packet.
    pub fn set_drop_observer(
        &mut self,
        observer: impl FnMut(&str, &Tlp, DropReason) + Send + 'static,
    ) {
        self.drop_observer = Some(Box::new(observer));
    }

    /// The packet counters of `node`.
    pub fn counters(&self, node: NodeId) -> RoutingCounters {
        self.topology.node(node).counters()
    }

    /// Queue a packet sent by the host into the host bridge.
    pub fn host_send(&mut self, tlp: Tlp) {
        self.enqueue(self.root, Arrival::FromUpstream, tlp);
    }

    /// Queue a packet transmitted by `node` itself.
    pub fn originate(&mut self, node: NodeId, tlp: Tlp) {
        self.enqueue(node, Arrival::Originated, tlp);
    }

    /// Whether no packets are in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Carry every queued packet, and everything generated in response, to
    /// its destination.
    ///
    /// On error, the packet being routed is lost. Other queued packets stay
    /// queued.
    pub fn run_until_idle(&mut self) -> Result<(), RoutingError> {
        while let Some(delivery) = self.queue.pop_front() {
            let fmt_type = delivery.tlp.fmt_type;
            if let Err(err) = self.process(delivery) {
                tracing::error!(
                    ?fmt_type,
                    error = &err as &dyn std::error::Error,
                    "failed to route TLP"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// Return every register file to its power-on state and discard
    /// packets in flight.
    pub fn reset(&mut self) {
        self.queue.clear();
        let ids = self.topology.iter().map(|(id, _)| id).collect::<Vec<_>>();
        for id in ids {
            self.topology.node_mut(id).reset();
        }
    }

    fn enqueue(&mut self, node: NodeId, arrival: Arrival, tlp: Tlp) {
        // Unknown kinds are reported when routed.
        if tlp.class().is_some() && !tlp.check() {
            tracing::warn!(
                node = %self.topology.node(node).name(),
                ?tlp,
                "malformed TLP"
            );
        }
        self.queue.push_back(Delivery { node, arrival, tlp });
    }

    fn route(&self, id: NodeId, arrival: Arrival, tlp: &Tlp) -> Result<RouteAction, RoutingError> {
        let node = self.topology.node(id);
        let view = node.decode_view();
        match (node.kind(), arrival) {
            (NodeKind::Endpoint, Arrival::FromUpstream) => route_to_function(tlp, &view),
            // A function's own transmissions leave through its only link.
            (NodeKind::Endpoint, _) => tlp
                .class()
                .map(|_| RouteAction::ForwardUpstream)
                .ok_or(RoutingError::UnknownPacketKind(tlp.fmt_type.0)),
            (_, Arrival::FromUpstream) => route_from_upstream(tlp, &view),
            (_, Arrival::FromDownstream | Arrival::Originated) => {
                route_from_downstream(tlp, &view)
            }
        }
    }

    fn process(&mut self, delivery: Delivery) -> Result<(), RoutingError> {
        let Delivery {
            node: id,
            arrival,
            mut tlp,
        } = delivery;

        let action = self.route(id, arrival, &tlp)?;
        tracing::debug!(
            node = %self.topology.node(id).name(),
            fmt_type = ?tlp.fmt_type,
            ?arrival,
            ?action,
            "routing decision"
        );

        match action {
            RouteAction::DeliverLocally => self.deliver(id, tlp),
            RouteAction::ForwardUpstream => self.forward_upstream(id, tlp)?,
            RouteAction::ForwardDownstream { target, to_type0 } => {
                if to_type0 {
                    tlp.convert_to_type0();
                }
                self.forward_downstream(id, tlp, target, arrival)?;
            }
            RouteAction::Drop(reason) => self.drop_tlp(id, &tlp, reason),
            RouteAction::UnsupportedRequest => self.unsupported_request(id, &tlp, arrival)?,
        }
        Ok(())
    }

    fn deliver(&mut self, id: NodeId, tlp: Tlp) {
        if tlp.class() == Some(TlpClass::ConfigType0) {
            let completion = self.topology.node_mut(id).service_config(&tlp);
            self.queue.push_back(Delivery {
                node: id,
                arrival: Arrival::Originated,
                tlp: completion,
            });
            return;
        }

        if self.topology.node(id).handler.is_none() {
            self.drop_tlp(id, &tlp, DropReason::NoHandler);
            return;
        }

        let node = self.topology.node_mut(id);
        node.counters.delivered += 1;
        let mut responses = Vec::new();
        if let Some(handler) = node.handler.as_mut() {
            handler.handle_tlp(tlp, &mut responses);
        }
        for response in responses {
            self.enqueue(id, Arrival::Originated, response);
        }
    }

    fn forward_upstream(&mut self, id: NodeId, tlp: Tlp) -> Result<(), RoutingError> {
        match self.topology.node(id).upstream() {
            UpstreamLink::Host => {
                let Some(host) = self.host.as_mut() else {
                    return Err(transport_unavailable(
                        &self.topology,
                        id,
                        Direction::Upstream,
                    ));
                };
                host.send(tlp);
            }
            UpstreamLink::Node(parent) => self.queue.push_back(Delivery {
                node: parent,
                arrival: Arrival::FromDownstream,
                tlp,
            }),
        }
        self.topology.node_mut(id).counters.forwarded_upstream += 1;
        Ok(())
    }

    fn forward_downstream(
        &mut self,
        id: NodeId,
        tlp: Tlp,
        target: DownstreamTarget,
        arrival: Arrival,
    ) -> Result<(), RoutingError> {
        let node = self.topology.node(id);
        let children = node.downstream().nodes().to_vec();
        let fan_out = match (node.downstream(), target) {
            (_, DownstreamTarget::AllChildren) => FanOut::All,
            (DownstreamLinks::Bus(_), DownstreamTarget::Child) => {
                let neighbors = children
                    .iter()
                    .map(|&child| self.topology.node(child).decode_view())
                    .collect::<Vec<_>>();
                select_downstream(&tlp, &neighbors)
            }
            (DownstreamLinks::Single(Some(_)), DownstreamTarget::Child) => FanOut::Neighbor(0),
            (DownstreamLinks::Single(None) | DownstreamLinks::None, DownstreamTarget::Child) => {
                return Err(transport_unavailable(
                    &self.topology,
                    id,
                    Direction::Downstream,
                ));
            }
        };

        match fan_out {
            FanOut::Neighbor(index) => self.send_downstream(id, children[index], tlp),
            FanOut::All if children.is_empty() => {
                self.drop_tlp(id, &tlp, DropReason::NoBroadcastTargets)
            }
            FanOut::All => {
                for child in children {
                    self.send_downstream(id, child, tlp.clone());
                }
            }
            FanOut::Unclaimed => self.unclaimed(id, tlp, arrival)?,
        }
        Ok(())
    }

    fn send_downstream(&mut self, id: NodeId, child: NodeId, tlp: Tlp) {
        self.topology.node_mut(id).counters.forwarded_downstream += 1;
        self.queue.push_back(Delivery {
            node: child,
            arrival: Arrival::FromUpstream,
            tlp,
        });
    }

    /// Nothing on a shared bus claimed `tlp`.
    fn unclaimed(&mut self, id: NodeId, tlp: Tlp, arrival: Arrival) -> Result<(), RoutingError> {
        match tlp.class() {
            // Responses and messages never get a completion.
            Some(TlpClass::Completion) => {
                self.drop_tlp(id, &tlp, DropReason::CompletionOutOfRange)
            }
            Some(TlpClass::MessageIdRouted) => {
                self.drop_tlp(id, &tlp, DropReason::MessageOutOfRange)
            }
            _ => {
                tracing::info!(
                    node = %self.topology.node(id).name(),
                    fmt_type = ?tlp.fmt_type,
                    address = format_args!("{:#x}", tlp.address),
                    dest = %tlp.dest_id,
                    "failed to route TLP, returning unsupported request"
                );
                self.unsupported_request(id, &tlp, arrival)?;
            }
        }
        Ok(())
    }

    /// Answers `request` with an Unsupported Request completion from `id`,
    /// sent back the way the request came.
    fn unsupported_request(
        &mut self,
        id: NodeId,
        request: &Tlp,
        arrival: Arrival,
    ) -> Result<(), RoutingError> {
        let node = self.topology.node_mut(id);
        node.counters.unsupported_requests += 1;
        let completion = request.unsupported_request_completion(node.id());
        match arrival {
            Arrival::FromUpstream => self.forward_upstream(id, completion),
            // The requester is below: the completion takes the same path as
            // anything else this node transmits.
            Arrival::FromDownstream | Arrival::Originated => {
                self.queue.push_back(Delivery {
                    node: id,
                    arrival: Arrival::Originated,
                    tlp: completion,
                });
                Ok(())
            }
        }
    }

    fn drop_tlp(&mut self, id: NodeId, tlp: &Tlp, reason: DropReason) {
        let node = self.topology.node_mut(id);
        node.counters.dropped += 1;
        tracing::warn!(
            node = %node.name(),
            fmt_type = ?tlp.fmt_type,
            %reason,
            "dropping TLP"
        );
        if let Some(observer) = self.drop_observer.as_mut() {
            observer(node.name().as_ref(), tlp, reason);
        }
    }
}
