// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The tree of nodes making up a fabric.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. The tree is
//! built once, top down, and never changes shape afterwards.

use crate::BDF_DEVICE_SHIFT;
use crate::BDF_FUNCTION_MASK;
use crate::MAX_DEVICES_PER_BUS;
use crate::MAX_FUNCTIONS_PER_DEVICE;
use crate::node::NodeConfig;
use crate::node::PcieNode;
use crate::root::GenericPcieRootPortDefinition;
use crate::root::host_bridge_hardware_ids;
use crate::root::root_port_hardware_ids;
use crate::switch::GenericPcieSwitchDefinition;
use crate::switch::downstream_switch_port_hardware_ids;
use crate::switch::upstream_switch_port_hardware_ids;
use anyhow::Context;
use anyhow::bail;
use pci_core::cfg_space_emu::CommonHeaderEmulator;
use pci_core::cfg_space_emu::ConfigSpaceType0Emulator;
use pci_core::cfg_space_emu::ConfigSpaceType1Emulator;
use pci_core::cfg_space_emu::DeviceBars;
use pci_core::spec::cfg_space;
use pci_core::spec::hwid::HardwareIds;
use std::sync::Arc;

/// Bus numbers owned by the host bridge: everything.
pub(crate) const HOST_BRIDGE_BUS_NUMBERS: (u8, u8, u8) = (0, 0, u8::MAX);

/// A handle to a node in a [`Topology`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// The role a node plays in the hierarchy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The root of the hierarchy, facing the host.
    HostBridge,
    /// A root port on the host bridge's bus.
    RootPort,
    /// The upstream port of a switch.
    SwitchUpstreamPort,
    /// A downstream port of a switch.
    SwitchDownstreamPort,
    /// A leaf function.
    Endpoint,
}

/// Where a node's upstream link leads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpstreamLink {
    /// The host, through the host's [`TlpSink`](crate::port::TlpSink).
    Host,
    /// Another node's downstream side.
    Node(NodeId),
}

/// A node's downstream links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamLinks {
    /// A leaf function.
    None,
    /// A port with a single link, possibly with nothing attached.
    Single(Option<NodeId>),
    /// A shared bus, searched in declaration order.
    Bus(Vec<NodeId>),
}

impl DownstreamLinks {
    /// The attached neighbors, in declaration order.
    pub fn nodes(&self) -> &[NodeId] {
        match self {
            DownstreamLinks::None | DownstreamLinks::Single(None) => &[],
            DownstreamLinks::Single(Some(id)) => std::slice::from_ref(id),
            DownstreamLinks::Bus(ids) => ids,
        }
    }
}

/// A description of an endpoint function.
#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    /// The name of the function.
    pub name: Arc<str>,
    /// Device number on the parent's secondary bus.
    pub device: u8,
    /// Function number.
    pub function: u8,
    /// The IDs reported in configuration space.
    pub hardware_ids: HardwareIds,
    /// The BARs the function implements.
    pub bars: DeviceBars,
    /// Size of the expansion ROM, if one is implemented.
    pub expansion_rom_size: Option<u64>,
}

impl EndpointDefinition {
    /// A function with no BARs and no expansion ROM.
    pub fn new(
        name: impl Into<Arc<str>>,
        device: u8,
        function: u8,
        hardware_ids: HardwareIds,
    ) -> Self {
        Self {
            name: name.into(),
            device,
            function,
            hardware_ids,
            bars: DeviceBars::new(),
            expansion_rom_size: None,
        }
    }

    /// Implement the BARs described by `bars`.
    pub fn with_bars(mut self, bars: DeviceBars) -> Self {
        self.bars = bars;
        self
    }

    /// Implement an expansion ROM of `size` bytes.
    pub fn with_expansion_rom(mut self, size: u64) -> Self {
        self.expansion_rom_size = Some(size);
        self
    }
}

/// The nodes of a fabric and the links between them.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<PcieNode>,
    root: Option<NodeId>,
}

impl Topology {
    /// An empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// The host bridge, once added.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// The node identified by `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this topology.
    pub fn node(&self, id: NodeId) -> &PcieNode {
        &self.nodes[id.0]
    }

    /// The node identified by `id`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this topology.
    pub fn node_mut(&mut self, id: NodeId) -> &mut PcieNode {
        &mut self.nodes[id.0]
    }

    /// Look up a node by name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name().as_ref() == name)
            .map(NodeId)
    }

    /// All nodes, in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PcieNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i), node))
    }

    /// The downstream neighbors of `id`, in declaration order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).downstream().nodes()
    }

    fn get(&self, id: NodeId) -> anyhow::Result<&PcieNode> {
        self.nodes
            .get(id.0)
            .with_context(|| format!("unknown node {:?}", id))
    }

    fn check_name(&self, name: &str) -> anyhow::Result<()> {
        if self.find(name).is_some() {
            bail!("node name '{}' already in use", name);
        }
        Ok(())
    }

    /// Fails if `device`/`function` is out of range or already taken on the
    /// host bridge's bus.
    fn check_host_bus_slot(&self, host: NodeId, device: u8, function: u8) -> anyhow::Result<()> {
        if device >= MAX_DEVICES_PER_BUS || function >= MAX_FUNCTIONS_PER_DEVICE {
            bail!("invalid device/function {}.{}", device, function);
        }
        let taken = std::iter::once(host)
            .chain(self.children(host).iter().copied())
            .map(|id| self.node(id).id())
            .any(|id| id.device() == device && id.function() == function);
        if taken {
            bail!(
                "device/function {}.{} already in use on the host bridge bus",
                device,
                function
            );
        }
        Ok(())
    }

    fn push(&mut self, node: PcieNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        tracing::debug!(name = %node.name(), kind = ?node.kind(), "adding node");
        self.nodes.push(node);
        id
    }

    /// Add the host bridge, the root of the hierarchy. It owns every bus
    /// number and sits at device 0, function 0 of bus 0.
    pub fn add_host_bridge(&mut self, name: impl Into<Arc<str>>) -> anyhow::Result<NodeId> {
        let name = name.into();
        if self.root.is_some() {
            bail!("topology already has a host bridge");
        }
        self.check_name(&name)?;

        let (primary, secondary, subordinate) = HOST_BRIDGE_BUS_NUMBERS;
        let cfg = ConfigSpaceType1Emulator::new(host_bridge_hardware_ids())
            .with_bus_numbers(primary, secondary, subordinate);
        let id = self.push(PcieNode::new(
            name,
            NodeKind::HostBridge,
            0,
            0,
            NodeConfig::Bridge(cfg),
            UpstreamLink::Host,
            DownstreamLinks::Bus(Vec::new()),
        ));
        self.root = Some(id);
        Ok(id)
    }

    /// Add a root port on the host bridge's bus.
    pub fn add_root_port(
        &mut self,
        host: NodeId,
        definition: GenericPcieRootPortDefinition,
    ) -> anyhow::Result<NodeId> {
        if self.get(host)?.kind() != NodeKind::HostBridge {
            bail!("root ports attach to the host bridge");
        }
        self.check_name(&definition.name)?;
        self.check_host_bus_slot(host, definition.device, 0)
            .with_context(|| format!("failed to add root port '{}'", definition.name))?;

        let id = self.push(PcieNode::new(
            definition.name,
            NodeKind::RootPort,
            definition.device,
            0,
            NodeConfig::Bridge(ConfigSpaceType1Emulator::new(root_port_hardware_ids())),
            UpstreamLink::Node(host),
            DownstreamLinks::Single(None),
        ));
        self.attach_child(host, id);
        Ok(id)
    }

    /// Add a switch below `parent`, which must be a root port or a switch
    /// downstream port with nothing attached. Returns the switch's upstream
    /// port. Downstream port `i` sits at device/function number `i` on the
    /// switch's internal bus.
    pub fn add_switch(
        &mut self,
        parent: NodeId,
        definition: GenericPcieSwitchDefinition,
    ) -> anyhow::Result<NodeId> {
        if definition.downstream_port_count == 0 {
            bail!("switch '{}' has no downstream ports", definition.name);
        }
        self.check_free_link(parent)?;
        self.check_name(&definition.name)?;
        let port_names = (0..definition.downstream_port_count)
            .map(|i| definition.downstream_port_name(i))
            .collect::<Vec<_>>();
        for name in &port_names {
            self.check_name(name)?;
        }

        let upstream_port = self.push(PcieNode::new(
            definition.name.clone(),
            NodeKind::SwitchUpstreamPort,
            0,
            0,
            NodeConfig::Bridge(ConfigSpaceType1Emulator::new(
                upstream_switch_port_hardware_ids(),
            )),
            UpstreamLink::Node(parent),
            DownstreamLinks::Bus(Vec::new()),
        ));
        self.attach_child(parent, upstream_port);

        // If there are multiple downstream ports, they need the multi-function flag set
        let multi_function = definition.downstream_port_count > 1;
        for (devfn, name) in (0..definition.downstream_port_count).zip(port_names) {
            let hardware_ids = downstream_switch_port_hardware_ids();
            let cfg = ConfigSpaceType1Emulator::new(hardware_ids).with_base(Box::new(
                CommonHeaderEmulator::new(hardware_ids, cfg_space::HEADER_TYPE_01)
                    .with_multi_function_bit(multi_function),
            ));
            let port = self.push(PcieNode::new(
                name.into(),
                NodeKind::SwitchDownstreamPort,
                devfn >> BDF_DEVICE_SHIFT,
                devfn & BDF_FUNCTION_MASK,
                NodeConfig::Bridge(cfg),
                UpstreamLink::Node(upstream_port),
                DownstreamLinks::Single(None),
            ));
            self.attach_child(upstream_port, port);
        }
        Ok(upstream_port)
    }

    /// Add an endpoint function below `parent`: either the only function
    /// behind a root port or switch downstream port, or an integrated
    /// function on the host bridge's bus.
    pub fn add_endpoint(
        &mut self,
        parent: NodeId,
        definition: EndpointDefinition,
    ) -> anyhow::Result<NodeId> {
        if definition.device >= MAX_DEVICES_PER_BUS
            || definition.function >= MAX_FUNCTIONS_PER_DEVICE
        {
            bail!(
                "invalid device/function {}.{} for endpoint '{}'",
                definition.device,
                definition.function,
                definition.name
            );
        }
        if self.get(parent)?.kind() == NodeKind::HostBridge {
            self.check_host_bus_slot(parent, definition.device, definition.function)
                .with_context(|| format!("failed to add endpoint '{}'", definition.name))?;
        } else {
            self.check_free_link(parent)?;
        }
        self.check_name(&definition.name)?;

        let mut cfg = ConfigSpaceType0Emulator::new(definition.hardware_ids, definition.bars);
        if let Some(size) = definition.expansion_rom_size {
            cfg = cfg.with_expansion_rom(size);
        }
        let id = self.push(PcieNode::new(
            definition.name,
            NodeKind::Endpoint,
            definition.device,
            definition.function,
            NodeConfig::Function(cfg),
            UpstreamLink::Node(parent),
            DownstreamLinks::None,
        ));
        self.attach_child(parent, id);
        Ok(id)
    }

    fn check_free_link(&self, parent: NodeId) -> anyhow::Result<()> {
        let node = self.get(parent)?;
        match node.downstream() {
            DownstreamLinks::Single(None) => Ok(()),
            DownstreamLinks::Single(Some(_)) => {
                bail!("downstream link of '{}' is already occupied", node.name())
            }
            DownstreamLinks::None | DownstreamLinks::Bus(_) => {
                bail!("'{}' has no single downstream link", node.name())
            }
        }
    }

    fn attach_child(&mut self, parent: NodeId, child: NodeId) {
        match &mut self.node_mut(parent).downstream {
            DownstreamLinks::Single(link) => *link = Some(child),
            DownstreamLinks::Bus(ids) => ids.push(child),
            DownstreamLinks::None => unreachable!("checked before attaching"),
        }
    }
}
