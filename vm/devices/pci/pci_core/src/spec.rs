// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI spec.
//!
//! This module MUST NOT contain any vendor-specific constants!

pub mod hwid {
    //! Hardware ID types and constants

    #![expect(missing_docs)] // constants/fields are self-explanatory

    use core::fmt;

    /// A collection of hard-coded hardware IDs specific to a particular PCI
    /// function, as reflected in their corresponding PCI configuration space
    /// registers.
    ///
    /// See PCI 2.3 Spec - 6.2.1 for details on each of these fields.
    #[derive(Debug, Copy, Clone)]
    pub struct HardwareIds {
        pub vendor_id: u16,
        pub device_id: u16,
        pub revision_id: u8,
        pub prog_if: ProgrammingInterface,
        pub sub_class: Subclass,
        pub base_class: ClassCode,
        /// Only reported by type 0 (endpoint) headers.
        pub type0_sub_vendor_id: u16,
        /// Only reported by type 0 (endpoint) headers.
        pub type0_sub_system_id: u16,
    }

    /// ClassCode identifies the PCI function's type.
    ///
    /// Values pulled from <https://wiki.osdev.org/PCI#Class_Codes>.
    #[derive(Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ClassCode(pub u8);

    impl ClassCode {
        pub const UNCLASSIFIED: Self = Self(0x00);
        pub const MASS_STORAGE_CONTROLLER: Self = Self(0x01);
        pub const NETWORK_CONTROLLER: Self = Self(0x02);
        pub const DISPLAY_CONTROLLER: Self = Self(0x03);
        pub const MULTIMEDIA_CONTROLLER: Self = Self(0x04);
        pub const MEMORY_CONTROLLER: Self = Self(0x05);
        pub const BRIDGE: Self = Self(0x06);
        pub const SIMPLE_COMMUNICATION_CONTROLLER: Self = Self(0x07);
        pub const BASE_SYSTEM_PERIPHERAL: Self = Self(0x08);
        pub const PROCESSING_ACCELERATOR: Self = Self(0x12);
        /// Vendor specific
        pub const UNASSIGNED: Self = Self(0xFF);

        pub fn is_reserved(&self) -> bool {
            let c = &self.0;
            (0x14..=0x3f).contains(c) || (0x41..=0xfe).contains(c)
        }
    }

    impl fmt::Debug for ClassCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match *self {
                Self::UNCLASSIFIED => "UNCLASSIFIED",
                Self::MASS_STORAGE_CONTROLLER => "MASS_STORAGE_CONTROLLER",
                Self::NETWORK_CONTROLLER => "NETWORK_CONTROLLER",
                Self::DISPLAY_CONTROLLER => "DISPLAY_CONTROLLER",
                Self::MULTIMEDIA_CONTROLLER => "MULTIMEDIA_CONTROLLER",
                Self::MEMORY_CONTROLLER => "MEMORY_CONTROLLER",
                Self::BRIDGE => "BRIDGE",
                Self::SIMPLE_COMMUNICATION_CONTROLLER => "SIMPLE_COMMUNICATION_CONTROLLER",
                Self::BASE_SYSTEM_PERIPHERAL => "BASE_SYSTEM_PERIPHERAL",
                Self::PROCESSING_ACCELERATOR => "PROCESSING_ACCELERATOR",
                Self::UNASSIGNED => "UNASSIGNED",
                _ => return write!(f, "ClassCode({:#04x})", self.0),
            };
            f.write_str(name)
        }
    }

    impl fmt::Display for ClassCode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.is_reserved() {
                return write!(f, "RESERVED({:#04x})", self.0);
            }
            fmt::Debug::fmt(self, f)
        }
    }

    impl From<u8> for ClassCode {
        fn from(c: u8) -> Self {
            Self(c)
        }
    }

    impl From<ClassCode> for u8 {
        fn from(c: ClassCode) -> Self {
            c.0
        }
    }

    // Most subclass/programming interface values aren't used, so only add
    // values as needed.

    /// SubclassCode identifies the PCI function's role within its class.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Subclass(pub u8);

    impl Subclass {
        pub const NONE: Self = Self(0x00);

        // Bridge (Class code: 0x06)
        pub const BRIDGE_HOST: Self = Self(0x00);
        pub const BRIDGE_ISA: Self = Self(0x01);
        pub const BRIDGE_PCI_TO_PCI: Self = Self(0x04);
        pub const BRIDGE_OTHER: Self = Self(0x80);
    }

    impl From<u8> for Subclass {
        fn from(c: u8) -> Self {
            Self(c)
        }
    }

    impl From<Subclass> for u8 {
        fn from(c: Subclass) -> Self {
            c.0
        }
    }

    /// ProgrammingInterface (aka, program interface byte) identifies the PCI
    /// function's register-level programming interface.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ProgrammingInterface(pub u8);

    impl ProgrammingInterface {
        pub const NONE: Self = Self(0x00);
    }

    impl From<u8> for ProgrammingInterface {
        fn from(c: u8) -> Self {
            Self(c)
        }
    }

    impl From<ProgrammingInterface> for u8 {
        fn from(c: ProgrammingInterface) -> Self {
            c.0
        }
    }
}

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6, PCI-to-PCI Bridge Spec 1.2 - Chapter 3
#[expect(missing_docs)] // primarily structs with self-explanatory fields
pub mod cfg_space {
    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Register indices (dword offsets) into the type 00h configuration space
    /// header.
    ///
    /// | Index | Bits 31-24                 | Bits 23-16  | Bits 15-8           | Bits 7-0             |
    /// |-------|----------------------------|-------------|---------------------|--------------------- |
    /// | 0     | Device ID                  |             | Vendor ID           |                      |
    /// | 1     | Status                     |             | Command             |                      |
    /// | 2     | Class code                 |             |                     | Revision ID          |
    /// | 3     | BIST                       | Header type | Latency Timer       | Cache Line Size      |
    /// | 4-9   | Base address #0-#5         |             |                     |                      |
    /// | 10    | Cardbus CIS Pointer        |             |                     |                      |
    /// | 11    | Subsystem ID               |             | Subsystem Vendor ID |                      |
    /// | 12    | Expansion ROM base address |             |                     |                      |
    /// | 13    | Reserved                   |             |                     | Capabilities Pointer |
    /// | 14    | Reserved                   |             |                     |                      |
    /// | 15    | Max latency                | Min Grant   | Interrupt PIN       | Interrupt Line       |
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderType00(pub u16);

    impl HeaderType00 {
        pub const DEVICE_VENDOR: Self = Self(0);
        pub const STATUS_COMMAND: Self = Self(1);
        pub const CLASS_REVISION: Self = Self(2);
        pub const BIST_HEADER: Self = Self(3);
        pub const BAR0: Self = Self(4);
        pub const BAR1: Self = Self(5);
        pub const BAR2: Self = Self(6);
        pub const BAR3: Self = Self(7);
        pub const BAR4: Self = Self(8);
        pub const BAR5: Self = Self(9);
        pub const CARDBUS_CIS_PTR: Self = Self(10);
        pub const SUBSYSTEM_ID: Self = Self(11);
        pub const EXPANSION_ROM_BASE: Self = Self(12);
        pub const RESERVED_CAP_PTR: Self = Self(13);
        pub const RESERVED: Self = Self(14);
        pub const LATENCY_INTERRUPT: Self = Self(15);
    }

    /// Register indices (dword offsets) into the type 01h configuration space
    /// header.
    ///
    /// | Index | Bits 31-24                       | Bits 23-16             | Bits 15-8                | Bits 7-0             |
    /// |-------|----------------------------------|------------------------|--------------------------|--------------------- |
    /// | 0     | Device ID                        |                        | Vendor ID                |                      |
    /// | 1     | Status                           |                        | Command                  |                      |
    /// | 2     | Class code                       |                        |                          | Revision ID          |
    /// | 3     | BIST                             | Header Type            | Latency Timer            | Cache Line Size      |
    /// | 4     | Base address #0 (BAR0)           |                        |                          |                      |
    /// | 5     | Base address #1 (BAR1)           |                        |                          |                      |
    /// | 6     | Secondary Latency Timer          | Subordinate Bus Number | Secondary Bus Number     | Primary Bus Number   |
    /// | 7     | Secondary Status                 |                        | I/O Limit                | I/O Base             |
    /// | 8     | Memory Limit                     |                        | Memory Base              |                      |
    /// | 9     | Prefetchable Memory Limit        |                        | Prefetchable Memory Base |                      |
    /// | 10    | Prefetchable Base Upper 32 Bits  |                        |                          |                      |
    /// | 11    | Prefetchable Limit Upper 32 Bits |                        |                          |                      |
    /// | 12    | I/O Limit Upper 16 Bits          |                        | I/O Base Upper 16 Bits   |                      |
    /// | 13    | Reserved                         |                        |                          | Capabilities Pointer |
    /// | 14    | Expansion ROM Base Address       |                        |                          |                      |
    /// | 15    | Bridge Control                   |                        | Interrupt PIN            | Interrupt Line       |
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderType01(pub u16);

    impl HeaderType01 {
        pub const DEVICE_VENDOR: Self = Self(0);
        pub const STATUS_COMMAND: Self = Self(1);
        pub const CLASS_REVISION: Self = Self(2);
        pub const BIST_HEADER: Self = Self(3);
        pub const BAR0: Self = Self(4);
        pub const BAR1: Self = Self(5);
        pub const LATENCY_BUS_NUMBERS: Self = Self(6);
        pub const SEC_STATUS_IO_RANGE: Self = Self(7);
        pub const MEMORY_RANGE: Self = Self(8);
        pub const PREFETCH_RANGE: Self = Self(9);
        pub const PREFETCH_BASE_UPPER: Self = Self(10);
        pub const PREFETCH_LIMIT_UPPER: Self = Self(11);
        pub const IO_RANGE_UPPER: Self = Self(12);
        pub const RESERVED_CAP_PTR: Self = Self(13);
        pub const EXPANSION_ROM_BASE: Self = Self(14);
        pub const BRIDGE_CTRL_INTERRUPT: Self = Self(15);
    }

    /// Number of dword registers in either standard header.
    pub const HEADER_REGISTER_COUNT: u16 = 16;

    /// Number of dword registers in a PCI Express function's configuration
    /// space (4 KiB).
    pub const CONFIG_SPACE_REGISTER_COUNT: u16 = 1024;

    /// Header type field values (register 3, bits 23:16).
    pub const HEADER_TYPE_00: u8 = 0x00;
    pub const HEADER_TYPE_01: u8 = 0x01;
    pub const HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;

    /// BAR in-band encoding bits.
    ///
    /// The low bits of the BAR are not actually part of the address.
    /// Instead, they are used to in-band encode various bits of
    /// metadata about the BAR, and are masked off when determining the
    /// actual address.
    #[bitfield(u32)]
    pub struct BarEncodingBits {
        pub use_pio: bool,

        _reserved: bool,

        /// False indicates 32 bit.
        /// Only used in MMIO
        pub type_64_bit: bool,
        pub prefetchable: bool,

        #[bits(28)]
        _reserved2: u32,
    }

    /// Command Register
    #[bitfield(u16)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Command {
        pub pio_enabled: bool,
        pub mmio_enabled: bool,
        pub bus_master: bool,
        pub special_cycles: bool,
        pub enable_memory_write_invalidate: bool,
        pub vga_palette_snoop: bool,
        pub parity_error_response: bool,
        /// must be 0
        #[bits(1)]
        _reserved: u16,
        pub enable_serr: bool,
        pub enable_fast_b2b: bool,
        pub intx_disable: bool,
        #[bits(5)]
        _reserved2: u16,
    }

    /// Status Register
    #[bitfield(u16)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Status {
        #[bits(3)]
        _reserved: u16,
        pub interrupt_status: bool,
        pub capabilities_list: bool,
        pub capable_mhz_66: bool,
        _reserved2: bool,
        pub capable_fast_b2b: bool,
        pub err_master_parity: bool,

        #[bits(2)]
        pub devsel: DevSel,

        pub abort_target_signaled: bool,
        pub abort_target_received: bool,
        pub abort_master_received: bool,
        pub err_signaled: bool,
        pub err_detected_parity: bool,
    }

    impl Status {
        /// The error bits software clears by writing 1s.
        pub const WRITE_1_TO_CLEAR: Self = Self::new()
            .with_err_master_parity(true)
            .with_abort_target_signaled(true)
            .with_abort_target_received(true)
            .with_abort_master_received(true)
            .with_err_signaled(true)
            .with_err_detected_parity(true);
    }

    #[derive(Debug)]
    #[repr(u16)]
    pub enum DevSel {
        Fast = 0b00,
        Medium = 0b01,
        Slow = 0b10,
    }

    impl DevSel {
        const fn from_bits(bits: u16) -> Self {
            match bits {
                0b00 => DevSel::Fast,
                0b01 => DevSel::Medium,
                0b10 => DevSel::Slow,
                _ => unreachable!(),
            }
        }

        const fn into_bits(self) -> u16 {
            self as u16
        }
    }

    /// Secondary Status Register (type 01h header, register 7 bits 31:16).
    ///
    /// Every implemented bit is write-1-to-clear.
    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct SecondaryStatus {
        #[bits(8)]
        _reserved: u16,
        pub master_data_parity_error: bool,
        #[bits(2)]
        _devsel: u16,
        pub signaled_target_abort: bool,
        pub received_target_abort: bool,
        pub received_master_abort: bool,
        pub received_system_error: bool,
        pub detected_parity_error: bool,
    }

    impl SecondaryStatus {
        /// All implemented (write-1-to-clear) bits.
        pub const IMPLEMENTED: Self = Self::new()
            .with_master_data_parity_error(true)
            .with_signaled_target_abort(true)
            .with_received_target_abort(true)
            .with_received_master_abort(true)
            .with_received_system_error(true)
            .with_detected_parity_error(true);
    }

    /// Bridge Control Register (type 01h header, register 15 bits 31:16).
    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct BridgeControl {
        pub parity_error_response_enable: bool,
        pub serr_enable: bool,
        pub isa_enable: bool,
        pub vga_enable: bool,
        pub vga_16_bit_decode: bool,
        pub master_abort_mode: bool,
        pub secondary_bus_reset: bool,
        pub fast_b2b_enable: bool,
        #[bits(8)]
        _reserved: u16,
    }

    impl BridgeControl {
        /// The bridge control bits the emulated bridge implements.
        pub const SUPPORTED: Self = Self::new()
            .with_parity_error_response_enable(true)
            .with_serr_enable(true)
            .with_secondary_bus_reset(true);
    }
}
