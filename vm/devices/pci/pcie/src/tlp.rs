// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transaction layer packets, as seen by the routing engine.
//!
//! Packets are already decoded: the wire encoding is handled elsewhere.

use crate::BDF_DEVICE_SHIFT;
use crate::BDF_FUNCTION_MASK;
use bitfield_struct::bitfield;
use pci_core::spec::cfg_space::CONFIG_SPACE_REGISTER_COUNT;
use std::fmt;

/// The largest data payload a single TLP carries, in dwords.
pub const MAX_PAYLOAD_DWORDS: usize = 1024;

/// A bus/device/function triple identifying a PCI function.
#[bitfield(u16)]
#[derive(PartialEq, Eq, Hash)]
pub struct PcieId {
    #[bits(3)]
    pub function: u8,
    #[bits(5)]
    pub device: u8,
    pub bus: u8,
}

impl PcieId {
    /// Build an ID from its parts. `device` and `function` are truncated to
    /// 5 and 3 bits.
    pub const fn from_bdf(bus: u8, device: u8, function: u8) -> Self {
        Self::new()
            .with_bus(bus)
            .with_device(device & 0x1F)
            .with_function(function & 0x7)
    }

    /// Build an ID from a bus number and a combined device/function number.
    pub const fn from_bus_devfn(bus: u8, devfn: u8) -> Self {
        Self::from_bdf(bus, devfn >> BDF_DEVICE_SHIFT, devfn & BDF_FUNCTION_MASK)
    }
}

impl fmt::Display for PcieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// The combined format and type field of a TLP header.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TlpType(pub u8);

#[expect(missing_docs)] // self-explanatory constants
impl TlpType {
    pub const MEM_READ: Self = Self(0x00);
    pub const MEM_READ_64: Self = Self(0x20);
    pub const MEM_READ_LOCKED: Self = Self(0x01);
    pub const MEM_READ_LOCKED_64: Self = Self(0x21);
    pub const MEM_WRITE: Self = Self(0x40);
    pub const MEM_WRITE_64: Self = Self(0x60);
    pub const IO_READ: Self = Self(0x02);
    pub const IO_WRITE: Self = Self(0x42);
    pub const CFG_READ_0: Self = Self(0x04);
    pub const CFG_WRITE_0: Self = Self(0x44);
    pub const CFG_READ_1: Self = Self(0x05);
    pub const CFG_WRITE_1: Self = Self(0x45);
    pub const MSG_TO_RC: Self = Self(0x30);
    pub const MSG_ADDR: Self = Self(0x31);
    pub const MSG_ID: Self = Self(0x32);
    pub const MSG_BCAST: Self = Self(0x33);
    pub const MSG_LOCAL: Self = Self(0x34);
    pub const MSG_GATHER: Self = Self(0x35);
    pub const MSG_DATA_TO_RC: Self = Self(0x70);
    pub const MSG_DATA_ADDR: Self = Self(0x71);
    pub const MSG_DATA_ID: Self = Self(0x72);
    pub const MSG_DATA_BCAST: Self = Self(0x73);
    pub const MSG_DATA_LOCAL: Self = Self(0x74);
    pub const MSG_DATA_GATHER: Self = Self(0x75);
    pub const CPL: Self = Self(0x0A);
    pub const CPL_DATA: Self = Self(0x4A);
    pub const CPL_LOCKED: Self = Self(0x0B);
    pub const CPL_LOCKED_DATA: Self = Self(0x4B);
}

/// The routing-relevant class of a TLP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlpClass {
    /// Type 0 configuration request, consumed by the function it targets.
    ConfigType0,
    /// Type 1 configuration request, routed by bus number.
    ConfigType1,
    /// Completion, routed by requester ID.
    Completion,
    /// I/O request, routed by address.
    Io,
    /// Memory request, routed by address.
    Memory,
    /// Message routed to the root complex.
    MessageToRootComplex,
    /// Message routed by destination ID.
    MessageIdRouted,
    /// Message broadcast from the root complex.
    MessageBroadcast,
    /// Message local to the receiver.
    MessageLocal,
    /// Message gathered and routed to the root complex.
    MessageGather,
}

impl TlpType {
    /// Whether the packet carries a data payload.
    pub fn has_data(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// Whether a memory request uses a 64-bit address.
    pub fn is_64_bit(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Classifies the packet for routing, or `None` for an unrecognized
    /// format/type.
    pub fn class(self) -> Option<TlpClass> {
        let class = match self {
            Self::CFG_READ_0 | Self::CFG_WRITE_0 => TlpClass::ConfigType0,
            Self::CFG_READ_1 | Self::CFG_WRITE_1 => TlpClass::ConfigType1,
            Self::CPL | Self::CPL_DATA | Self::CPL_LOCKED | Self::CPL_LOCKED_DATA => {
                TlpClass::Completion
            }
            Self::IO_READ | Self::IO_WRITE => TlpClass::Io,
            Self::MEM_READ
            | Self::MEM_READ_64
            | Self::MEM_READ_LOCKED
            | Self::MEM_READ_LOCKED_64
            | Self::MEM_WRITE
            | Self::MEM_WRITE_64 => TlpClass::Memory,
            Self::MSG_TO_RC | Self::MSG_DATA_TO_RC => TlpClass::MessageToRootComplex,
            Self::MSG_ID | Self::MSG_DATA_ID => TlpClass::MessageIdRouted,
            Self::MSG_BCAST | Self::MSG_DATA_BCAST => TlpClass::MessageBroadcast,
            Self::MSG_LOCAL | Self::MSG_DATA_LOCAL => TlpClass::MessageLocal,
            Self::MSG_GATHER | Self::MSG_DATA_GATHER => TlpClass::MessageGather,
            _ => return None,
        };
        Some(class)
    }
}

impl fmt::Debug for TlpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::MEM_READ => "MEM_READ",
            Self::MEM_READ_64 => "MEM_READ_64",
            Self::MEM_READ_LOCKED => "MEM_READ_LOCKED",
            Self::MEM_READ_LOCKED_64 => "MEM_READ_LOCKED_64",
            Self::MEM_WRITE => "MEM_WRITE",
            Self::MEM_WRITE_64 => "MEM_WRITE_64",
            Self::IO_READ => "IO_READ",
            Self::IO_WRITE => "IO_WRITE",
            Self::CFG_READ_0 => "CFG_READ_0",
            Self::CFG_WRITE_0 => "CFG_WRITE_0",
            Self::CFG_READ_1 => "CFG_READ_1",
            Self::CFG_WRITE_1 => "CFG_WRITE_1",
            Self::MSG_TO_RC => "MSG_TO_RC",
            Self::MSG_ADDR => "MSG_ADDR",
            Self::MSG_ID => "MSG_ID",
            Self::MSG_BCAST => "MSG_BCAST",
            Self::MSG_LOCAL => "MSG_LOCAL",
            Self::MSG_GATHER => "MSG_GATHER",
            Self::MSG_DATA_TO_RC => "MSG_DATA_TO_RC",
            Self::MSG_DATA_ADDR => "MSG_DATA_ADDR",
            Self::MSG_DATA_ID => "MSG_DATA_ID",
            Self::MSG_DATA_BCAST => "MSG_DATA_BCAST",
            Self::MSG_DATA_LOCAL => "MSG_DATA_LOCAL",
            Self::MSG_DATA_GATHER => "MSG_DATA_GATHER",
            Self::CPL => "CPL",
            Self::CPL_DATA => "CPL_DATA",
            Self::CPL_LOCKED => "CPL_LOCKED",
            Self::CPL_LOCKED_DATA => "CPL_LOCKED_DATA",
            _ => return write!(f, "TlpType({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// Completion status field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CompletionStatus(pub u8);

impl CompletionStatus {
    /// Successful completion.
    pub const SUCCESSFUL: Self = Self(0b000);
    /// Unsupported request.
    pub const UNSUPPORTED_REQUEST: Self = Self(0b001);
    /// Configuration request retry status.
    pub const CONFIG_RETRY: Self = Self(0b010);
    /// Completer abort.
    pub const COMPLETER_ABORT: Self = Self(0b100);
}

/// A transaction layer packet.
///
/// Only the header fields that take part in routing and completion
/// generation are modeled. Payloads are carried as whole dwords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlp {
    /// Format and type.
    pub fmt_type: TlpType,
    /// The function that issued the request (for completions: the function
    /// the completion is returned to).
    pub requester_id: PcieId,
    /// The function that produced a completion.
    pub completer_id: PcieId,
    /// The target of configuration requests and ID-routed messages.
    pub dest_id: PcieId,
    /// Transaction tag, echoed by the completion.
    pub tag: u8,
    /// Target address of memory and I/O requests.
    pub address: u64,
    /// Target dword index of configuration requests.
    pub register_number: u16,
    /// Byte enables for the first dword of the payload.
    pub first_be: u8,
    /// Byte enables for the last dword of the payload.
    pub last_be: u8,
    /// Length in dwords.
    pub length: u16,
    /// Completion status.
    pub status: CompletionStatus,
    /// Message code of messages.
    pub message_code: u8,
    /// Payload.
    pub data: Vec<u32>,
}

impl Tlp {
    fn new(fmt_type: TlpType) -> Self {
        Self {
            fmt_type,
            requester_id: PcieId::new(),
            completer_id: PcieId::new(),
            dest_id: PcieId::new(),
            tag: 0,
            address: 0,
            register_number: 0,
            first_be: 0,
            last_be: 0,
            length: 0,
            status: CompletionStatus::SUCCESSFUL,
            message_code: 0,
            data: Vec::new(),
        }
    }

    fn config(fmt_type: TlpType, dest_id: PcieId, register_number: u16) -> Self {
        Self {
            dest_id,
            register_number,
            first_be: 0xF,
            length: 1,
            ..Self::new(fmt_type)
        }
    }

    /// A type 0 configuration read of dword `register_number`.
    pub fn config_read_0(dest_id: PcieId, register_number: u16) -> Self {
        Self::config(TlpType::CFG_READ_0, dest_id, register_number)
    }

    /// A type 1 configuration read of dword `register_number`.
    pub fn config_read_1(dest_id: PcieId, register_number: u16) -> Self {
        Self::config(TlpType::CFG_READ_1, dest_id, register_number)
    }

    /// A type 0 configuration write of `data` to the lanes of dword
    /// `register_number` enabled in `byte_enables`.
    pub fn config_write_0(
        dest_id: PcieId,
        register_number: u16,
        data: u32,
        byte_enables: u8,
    ) -> Self {
        Self {
            first_be: byte_enables & 0xF,
            data: vec![data],
            ..Self::config(TlpType::CFG_WRITE_0, dest_id, register_number)
        }
    }

    /// A type 1 configuration write of `data` to the lanes of dword
    /// `register_number` enabled in `byte_enables`.
    pub fn config_write_1(
        dest_id: PcieId,
        register_number: u16,
        data: u32,
        byte_enables: u8,
    ) -> Self {
        Self {
            first_be: byte_enables & 0xF,
            data: vec![data],
            ..Self::config(TlpType::CFG_WRITE_1, dest_id, register_number)
        }
    }

    /// A single dword I/O read.
    pub fn io_read(address: u32) -> Self {
        Self {
            address: address.into(),
            first_be: 0xF,
            length: 1,
            ..Self::new(TlpType::IO_READ)
        }
    }

    /// A single dword I/O write.
    pub fn io_write(address: u32, data: u32, byte_enables: u8) -> Self {
        Self {
            address: address.into(),
            first_be: byte_enables & 0xF,
            length: 1,
            data: vec![data],
            ..Self::new(TlpType::IO_WRITE)
        }
    }

    /// A memory read of `length` dwords. Addresses above 4 GiB use the
    /// 64-bit format.
    pub fn mem_read(address: u64, length: u16) -> Self {
        let fmt_type = if address > u32::MAX.into() {
            TlpType::MEM_READ_64
        } else {
            TlpType::MEM_READ
        };
        Self {
            address,
            first_be: 0xF,
            last_be: if length > 1 { 0xF } else { 0 },
            length,
            ..Self::new(fmt_type)
        }
    }

    /// A memory write of `data`. Addresses above 4 GiB use the 64-bit
    /// format.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_PAYLOAD_DWORDS`].
    pub fn mem_write(address: u64, data: Vec<u32>) -> Self {
        assert!(
            data.len() <= MAX_PAYLOAD_DWORDS,
            "payload of {} dwords exceeds the TLP maximum",
            data.len()
        );
        let fmt_type = if address > u32::MAX.into() {
            TlpType::MEM_WRITE_64
        } else {
            TlpType::MEM_WRITE
        };
        Self {
            address,
            first_be: 0xF,
            last_be: if data.len() > 1 { 0xF } else { 0 },
            length: data.len() as u16,
            data,
            ..Self::new(fmt_type)
        }
    }

    fn message(fmt_type: TlpType, message_code: u8) -> Self {
        Self {
            message_code,
            ..Self::new(fmt_type)
        }
    }

    /// A message routed to the root complex.
    pub fn message_to_root_complex(message_code: u8) -> Self {
        Self::message(TlpType::MSG_TO_RC, message_code)
    }

    /// A message routed by destination ID.
    pub fn message_id_routed(dest_id: PcieId, message_code: u8) -> Self {
        Self {
            dest_id,
            ..Self::message(TlpType::MSG_ID, message_code)
        }
    }

    /// A message broadcast from the root complex.
    pub fn message_broadcast(message_code: u8) -> Self {
        Self::message(TlpType::MSG_BCAST, message_code)
    }

    /// A message local to the receiver.
    pub fn message_local(message_code: u8) -> Self {
        Self::message(TlpType::MSG_LOCAL, message_code)
    }

    /// A message gathered and routed to the root complex.
    pub fn message_gather(message_code: u8) -> Self {
        Self::message(TlpType::MSG_GATHER, message_code)
    }

    /// Set the requester ID and tag.
    pub fn with_requester(mut self, requester_id: PcieId, tag: u8) -> Self {
        self.requester_id = requester_id;
        self.tag = tag;
        self
    }

    /// A completion without data for `request`.
    pub fn completion(request: &Tlp, completer_id: PcieId, status: CompletionStatus) -> Self {
        let fmt_type = if request.is_locked() {
            TlpType::CPL_LOCKED
        } else {
            TlpType::CPL
        };
        Self {
            requester_id: request.requester_id,
            completer_id,
            tag: request.tag,
            status,
            ..Self::new(fmt_type)
        }
    }

    /// A successful completion carrying `data` for `request`.
    pub fn completion_with_data(request: &Tlp, completer_id: PcieId, data: Vec<u32>) -> Self {
        let fmt_type = if request.is_locked() {
            TlpType::CPL_LOCKED_DATA
        } else {
            TlpType::CPL_DATA
        };
        Self {
            requester_id: request.requester_id,
            completer_id,
            tag: request.tag,
            length: data.len() as u16,
            data,
            ..Self::new(fmt_type)
        }
    }

    /// Rewrites a type 1 configuration request to type 0, as done by the
    /// bridge whose secondary bus it targets.
    pub fn convert_to_type0(&mut self) {
        self.fmt_type = match self.fmt_type {
            TlpType::CFG_READ_1 => TlpType::CFG_READ_0,
            TlpType::CFG_WRITE_1 => TlpType::CFG_WRITE_0,
            other => other,
        };
    }

    /// The Unsupported Request completion returned to the requester of this
    /// packet when nothing claims it.
    pub fn unsupported_request_completion(&self, completer_id: PcieId) -> Self {
        Self::completion(self, completer_id, CompletionStatus::UNSUPPORTED_REQUEST)
    }

    fn is_locked(&self) -> bool {
        matches!(
            self.fmt_type,
            TlpType::MEM_READ_LOCKED | TlpType::MEM_READ_LOCKED_64
        )
    }

    /// The routing class, or `None` for an unrecognized format/type.
    pub fn class(&self) -> Option<TlpClass> {
        self.fmt_type.class()
    }

    /// Validates the packet's internal consistency.
    pub fn check(&self) -> bool {
        let Some(class) = self.class() else {
            return false;
        };
        let has_data = self.fmt_type.has_data();
        if has_data != !self.data.is_empty() {
            return false;
        }
        if has_data && self.data.len() != self.length as usize {
            return false;
        }
        if self.first_be & !0xF != 0 || self.last_be & !0xF != 0 {
            return false;
        }
        match class {
            TlpClass::ConfigType0 | TlpClass::ConfigType1 => {
                self.length == 1
                    && self.last_be == 0
                    && self.register_number < CONFIG_SPACE_REGISTER_COUNT
            }
            TlpClass::Io => self.length == 1 && self.last_be == 0 && self.address <= u32::MAX.into(),
            TlpClass::Memory => {
                self.length > 0
                    && self.length as usize <= MAX_PAYLOAD_DWORDS
                    && (self.fmt_type.is_64_bit() || self.address <= u32::MAX.into())
            }
            TlpClass::Completion
            | TlpClass::MessageToRootComplex
            | TlpClass::MessageIdRouted
            | TlpClass::MessageBroadcast
            | TlpClass::MessageLocal
            | TlpClass::MessageGather => true,
        }
    }
}
