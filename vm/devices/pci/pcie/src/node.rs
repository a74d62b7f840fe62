// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single node of the fabric: its identity, register file and links.

use crate::decode::DecodeView;
use crate::port::TlpHandler;
use crate::tlp::CompletionStatus;
use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::topology::DownstreamLinks;
use crate::topology::HOST_BRIDGE_BUS_NUMBERS;
use crate::topology::NodeKind;
use crate::topology::UpstreamLink;
use pci_core::cfg_space_emu::ConfigSpaceType0Emulator;
use pci_core::cfg_space_emu::ConfigSpaceType1Emulator;
use std::sync::Arc;

/// The configuration register file of a node.
#[derive(Debug)]
pub enum NodeConfig {
    /// Type 1 header, for every bridge kind.
    Bridge(ConfigSpaceType1Emulator),
    /// Type 0 header, for endpoint functions.
    Function(ConfigSpaceType0Emulator),
}

impl NodeConfig {
    /// Read the register at dword `index`.
    pub fn read_register(&self, index: u16) -> u32 {
        match self {
            NodeConfig::Bridge(cfg) => cfg.read_register(index),
            NodeConfig::Function(cfg) => cfg.read_register(index),
        }
    }

    /// Write the byte lanes of the register at dword `index` enabled in
    /// `byte_enables`.
    pub fn write_register(&mut self, index: u16, data: u32, byte_enables: u8) {
        match self {
            NodeConfig::Bridge(cfg) => cfg.write_register(index, data, byte_enables),
            NodeConfig::Function(cfg) => cfg.write_register(index, data, byte_enables),
        }
    }

    /// Return the register file to its power-on state.
    pub fn reset(&mut self) {
        match self {
            NodeConfig::Bridge(cfg) => cfg.reset(),
            NodeConfig::Function(cfg) => cfg.reset(),
        }
    }
}

/// Per-node packet accounting.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RoutingCounters {
    /// Packets consumed by this node.
    pub delivered: u64,
    /// Packets sent out of the upstream link.
    pub forwarded_upstream: u64,
    /// Packets sent out of a downstream link, counted once per copy.
    pub forwarded_downstream: u64,
    /// Packets discarded without a response.
    pub dropped: u64,
    /// Unsupported Request completions generated by this node.
    pub unsupported_requests: u64,
}

/// A bridge, switch port or endpoint function in the fabric.
pub struct PcieNode {
    name: Arc<str>,
    kind: NodeKind,
    device: u8,
    function: u8,
    /// Latched from the last type 0 configuration request addressed here.
    bus: u8,
    config: NodeConfig,
    pub(crate) upstream: UpstreamLink,
    pub(crate) downstream: DownstreamLinks,
    pub(crate) handler: Option<Box<dyn TlpHandler>>,
    pub(crate) counters: RoutingCounters,
}

impl std::fmt::Debug for PcieNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcieNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("id", &format_args!("{}", self.id()))
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl PcieNode {
    pub(crate) fn new(
        name: Arc<str>,
        kind: NodeKind,
        device: u8,
        function: u8,
        config: NodeConfig,
        upstream: UpstreamLink,
        downstream: DownstreamLinks,
    ) -> Self {
        Self {
            name,
            kind,
            device,
            function,
            bus: 0,
            config,
            upstream,
            downstream,
            handler: None,
            counters: RoutingCounters::default(),
        }
    }

    /// The node's name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The node's current bus/device/function.
    pub fn id(&self) -> PcieId {
        PcieId::from_bdf(self.bus, self.device, self.function)
    }

    /// Where the node's upstream link leads.
    pub fn upstream(&self) -> UpstreamLink {
        self.upstream
    }

    /// The node's downstream links.
    pub fn downstream(&self) -> &DownstreamLinks {
        &self.downstream
    }

    /// The node's packet counters.
    pub fn counters(&self) -> RoutingCounters {
        self.counters
    }

    /// The node's register file.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node's register file, for direct programming.
    pub fn config_mut(&mut self) -> &mut NodeConfig {
        &mut self.config
    }

    /// The node's identity and decode state.
    pub fn decode_view(&self) -> DecodeView<'_> {
        match &self.config {
            NodeConfig::Bridge(cfg) if self.kind == NodeKind::HostBridge => {
                DecodeView::root(self.id(), cfg)
            }
            NodeConfig::Bridge(cfg) => DecodeView::bridge(self.id(), cfg),
            NodeConfig::Function(cfg) => DecodeView::function(self.id(), cfg),
        }
    }

    /// Services a type 0 configuration request against the register file and
    /// returns the completion to transmit.
    pub(crate) fn service_config(&mut self, request: &Tlp) -> Tlp {
        let dest = request.dest_id;
        if dest.device() != self.device || dest.function() != self.function {
            tracing::warn!(
                node = %self.name,
                dest = %dest,
                "config request for another device/function"
            );
            self.counters.unsupported_requests += 1;
            return request.unsupported_request_completion(self.id());
        }

        self.bus = dest.bus();
        self.counters.delivered += 1;
        let index = request.register_number;
        if let Some(&data) = request.data.first() {
            tracing::debug!(
                node = %self.name,
                index,
                data = format_args!("{:#010x}", data),
                byte_enables = request.first_be,
                "config write"
            );
            self.config.write_register(index, data, request.first_be);
            Tlp::completion(request, self.id(), CompletionStatus::SUCCESSFUL)
        } else {
            let value = self.config.read_register(index);
            tracing::debug!(
                node = %self.name,
                index,
                value = format_args!("{:#010x}", value),
                "config read"
            );
            Tlp::completion_with_data(request, self.id(), vec![value])
        }
    }

    /// Return the node to its power-on state: register file, latched bus
    /// number and counters.
    pub fn reset(&mut self) {
        self.bus = 0;
        self.counters = RoutingCounters::default();
        self.config.reset();
        if let (NodeKind::HostBridge, NodeConfig::Bridge(cfg)) = (self.kind, &mut self.config) {
            let (primary, secondary, subordinate) = HOST_BRIDGE_BUS_NUMBERS;
            cfg.set_bus_numbers(primary, secondary, subordinate);
        }
    }
}
