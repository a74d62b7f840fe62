// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express switch definitions and downstream fan-out.
//!
//! A switch is modeled as one upstream switch port sharing an internal bus
//! with its downstream switch ports. Both port kinds are Type 1 PCI-to-PCI
//! bridges. The upstream port (like the host bridge with its root ports)
//! picks which neighbor on that bus receives a packet travelling down.

use crate::DOWNSTREAM_SWITCH_PORT_DEVICE_ID;
use crate::UPSTREAM_SWITCH_PORT_DEVICE_ID;
use crate::VENDOR_ID;
use crate::decode::DecodeView;
use crate::tlp::Tlp;
use crate::tlp::TlpClass;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::HardwareIds;
use pci_core::spec::hwid::ProgrammingInterface;
use pci_core::spec::hwid::Subclass;
use std::sync::Arc;

/// A PCI Express switch definition used for creating switch instances.
#[derive(Debug, Clone)]
pub struct GenericPcieSwitchDefinition {
    /// The name of the switch. Its upstream port carries this name.
    pub name: Arc<str>,
    /// The number of downstream ports to create.
    pub downstream_port_count: u8,
}

impl GenericPcieSwitchDefinition {
    /// Create a new switch definition.
    pub fn new(name: impl Into<Arc<str>>, downstream_port_count: u8) -> Self {
        Self {
            name: name.into(),
            downstream_port_count,
        }
    }

    /// The name given to downstream port `index`.
    pub fn downstream_port_name(&self, index: u8) -> String {
        format!("{}-downstream-{}", self.name, index)
    }
}

fn switch_port_hardware_ids(device_id: u16) -> HardwareIds {
    HardwareIds {
        vendor_id: VENDOR_ID,
        device_id,
        revision_id: 0,
        prog_if: ProgrammingInterface::NONE,
        sub_class: Subclass::BRIDGE_PCI_TO_PCI,
        base_class: ClassCode::BRIDGE,
        type0_sub_vendor_id: 0,
        type0_sub_system_id: 0,
    }
}

pub(crate) fn upstream_switch_port_hardware_ids() -> HardwareIds {
    switch_port_hardware_ids(UPSTREAM_SWITCH_PORT_DEVICE_ID)
}

pub(crate) fn downstream_switch_port_hardware_ids() -> HardwareIds {
    switch_port_hardware_ids(DOWNSTREAM_SWITCH_PORT_DEVICE_ID)
}

/// The outcome of searching a bus for the neighbor that claims a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FanOut {
    /// The neighbor at this index, the first in declaration order to claim it.
    Neighbor(usize),
    /// Every neighbor, in declaration order.
    All,
    /// No neighbor claims the packet.
    Unclaimed,
}

/// Picks the downstream neighbor of a shared bus that receives `tlp`.
///
/// `neighbors` are in declaration order. Neighbor state is only read.
pub fn select_downstream(tlp: &Tlp, neighbors: &[DecodeView<'_>]) -> FanOut {
    if tlp.class() == Some(TlpClass::MessageBroadcast) {
        return FanOut::All;
    }
    neighbors
        .iter()
        .position(|neighbor| neighbor.claims(tlp))
        .map_or(FanOut::Unclaimed, FanOut::Neighbor)
}
