// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address and ID decoding against a node's register state.
//!
//! Every predicate here is evaluated against the registers as they are at the
//! time of the call. Nothing is cached, since software may reprogram a
//! bridge between any two packets.

use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::tlp::TlpClass;
use pci_core::cfg_space_emu::ConfigSpaceType0Emulator;
use pci_core::cfg_space_emu::ConfigSpaceType1Emulator;

/// The register file backing a [`DecodeView`].
#[derive(Debug, Copy, Clone)]
pub enum DecodeRegisters<'a> {
    /// A bridge: decodes its BARs plus the bus range and windows it forwards.
    Bridge(&'a ConfigSpaceType1Emulator),
    /// An endpoint function: decodes its BARs only.
    Function(&'a ConfigSpaceType0Emulator),
}

/// A node's identity and decode state, as seen by the routing engine and by
/// the fan-out router of the node above it.
#[derive(Debug, Copy, Clone)]
pub struct DecodeView<'a> {
    id: PcieId,
    is_root: bool,
    registers: DecodeRegisters<'a>,
}

impl<'a> DecodeView<'a> {
    /// A view of a bridge.
    pub fn bridge(id: PcieId, cfg_space: &'a ConfigSpaceType1Emulator) -> Self {
        Self {
            id,
            is_root: false,
            registers: DecodeRegisters::Bridge(cfg_space),
        }
    }

    /// A view of the host bridge at the root of the hierarchy.
    pub fn root(id: PcieId, cfg_space: &'a ConfigSpaceType1Emulator) -> Self {
        Self {
            id,
            is_root: true,
            registers: DecodeRegisters::Bridge(cfg_space),
        }
    }

    /// A view of an endpoint function.
    pub fn function(id: PcieId, cfg_space: &'a ConfigSpaceType0Emulator) -> Self {
        Self {
            id,
            is_root: false,
            registers: DecodeRegisters::Function(cfg_space),
        }
    }

    /// The node's own ID.
    pub fn id(&self) -> PcieId {
        self.id
    }

    /// Whether this is the host bridge.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Whether this node forwards traffic (has a type 1 header).
    pub fn is_bridge(&self) -> bool {
        matches!(self.registers, DecodeRegisters::Bridge(_))
    }

    /// The primary bus number of a bridge.
    pub fn primary_bus(&self) -> Option<u8> {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => Some(cfg.primary_bus_number()),
            DecodeRegisters::Function(_) => None,
        }
    }

    /// The secondary bus number of a bridge.
    pub fn secondary_bus(&self) -> Option<u8> {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => Some(cfg.secondary_bus_number()),
            DecodeRegisters::Function(_) => None,
        }
    }

    /// True iff bus, device and function all equal this node's.
    pub fn matches_id(&self, id: PcieId) -> bool {
        self.id == id
    }

    /// True iff `address` falls within one of this node's BARs decoding the
    /// requested space.
    pub fn matches_bar(&self, address: u64, is_io: bool) -> bool {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => cfg.matches_bar(address, is_io),
            DecodeRegisters::Function(cfg) => cfg.matches_bar(address, is_io),
        }
    }

    /// True iff `bus` is behind this node. Always false for functions.
    pub fn bus_in_subordinate_range(&self, bus: u8) -> bool {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => cfg.bus_in_subordinate_range(bus),
            DecodeRegisters::Function(_) => false,
        }
    }

    /// True iff `address` falls within the I/O window. Always false for
    /// functions.
    pub fn io_window_contains(&self, address: u64) -> bool {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => cfg.io_window_contains(address),
            DecodeRegisters::Function(_) => false,
        }
    }

    /// True iff `address` falls within the memory or prefetchable memory
    /// window. Always false for functions.
    pub fn memory_window_contains(&self, address: u64) -> bool {
        match self.registers {
            DecodeRegisters::Bridge(cfg) => cfg.memory_window_contains(address),
            DecodeRegisters::Function(_) => false,
        }
    }

    /// Whether a packet travelling down the link to this node should be
    /// handed to it, when choosing among the neighbors on a shared bus.
    ///
    /// Broadcasts are claimed by every neighbor. Packets that are never
    /// routed downstream (messages to the root complex, local and gather
    /// messages) are claimed by none.
    pub fn claims(&self, tlp: &Tlp) -> bool {
        let Some(class) = tlp.class() else {
            return false;
        };
        match class {
            TlpClass::ConfigType0 => {
                tlp.dest_id.device() == self.id.device()
                    && tlp.dest_id.function() == self.id.function()
            }
            TlpClass::ConfigType1 => self.bus_in_subordinate_range(tlp.dest_id.bus()),
            TlpClass::Completion => {
                self.matches_id(tlp.requester_id)
                    || self.bus_in_subordinate_range(tlp.requester_id.bus())
            }
            TlpClass::MessageIdRouted => {
                self.matches_id(tlp.dest_id) || self.bus_in_subordinate_range(tlp.dest_id.bus())
            }
            TlpClass::Io => {
                self.matches_bar(tlp.address, true) || self.io_window_contains(tlp.address)
            }
            TlpClass::Memory => {
                self.matches_bar(tlp.address, false) || self.memory_window_contains(tlp.address)
            }
            TlpClass::MessageBroadcast => true,
            TlpClass::MessageToRootComplex | TlpClass::MessageLocal | TlpClass::MessageGather => {
                false
            }
        }
    }
}
