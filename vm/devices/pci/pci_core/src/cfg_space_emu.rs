// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers that implement standardized PCI configuration space functionality.
//!
//! Registers are addressed by dword index (the `register_number` carried by a
//! configuration request), and writes carry a 4-bit byte-enable mask, one bit
//! per byte lane.

use crate::bar_mapping::BarMappings;
use crate::spec::cfg_space;
use crate::spec::hwid::HardwareIds;
use std::ops::RangeInclusive;

const SUPPORTED_COMMAND_BITS: u16 = cfg_space::Command::new()
    .with_pio_enabled(true)
    .with_mmio_enabled(true)
    .with_bus_master(true)
    .with_special_cycles(true)
    .with_enable_memory_write_invalidate(true)
    .with_vga_palette_snoop(true)
    .with_parity_error_response(true)
    .with_enable_serr(true)
    .with_enable_fast_b2b(true)
    .with_intx_disable(true)
    .into_bits();

/// I/O base/limit capability nibble: 32-bit I/O addressing.
const IO_ADDRESSING_32_BIT: u32 = 0x1;
/// Prefetchable base/limit capability nibble: 64-bit addressing.
const PREFETCH_ADDRESSING_64_BIT: u32 = 0x1;

const EXPANSION_ROM_ADDRESS_MASK: u32 = 0xFFFF_F800;

/// Merges `new` into `old` one byte lane at a time.
///
/// Bits outside `bitmask` are first taken from `old`. Then, for each set bit
/// `k` in `byte_enables`, bits `[8k, 8k+8)` of the result come from the merged
/// value; all other lanes keep `old`.
pub fn byte_mask_update(old: u64, byte_enables: u8, new: u64, bitmask: u64) -> u64 {
    let new = (new & bitmask) | (old & !bitmask);
    let mut lanes = 0u64;
    for lane in 0..8 {
        if byte_enables & (1 << lane) != 0 {
            lanes |= 0xFF << (lane * 8);
        }
    }
    (new & lanes) | (old & !lanes)
}

fn update_u32(old: u32, byte_enables: u8, new: u32, bitmask: u32) -> u32 {
    byte_mask_update(old.into(), byte_enables & 0xF, new.into(), bitmask.into()) as u32
}

/// The generic, per-function portion of configuration space: identification,
/// command/status, class code, header type, capability pointer and interrupt
/// line/pin.
///
/// Header-type specific emulators handle their own registers and delegate
/// every other index here.
pub trait BaseConfigSpace: Send {
    /// Reads the register at dword `index`.
    fn read_base(&self, index: u16) -> u32;
    /// Writes the register at dword `index`, updating only the byte lanes set
    /// in `byte_enables`.
    fn write_base(&mut self, index: u16, data: u32, byte_enables: u8);
    /// Returns the register state to its power-on defaults.
    fn reset(&mut self);
}

#[derive(Debug)]
struct CommonHeaderState {
    command: cfg_space::Command,
    status: cfg_space::Status,
    cache_line_size: u8,
    latency_timer: u8,
    /// Scratch space for firmware to communicate IRQ assignments to the OS.
    interrupt_line: u8,
}

impl CommonHeaderState {
    fn new() -> Self {
        Self {
            command: cfg_space::Command::new(),
            status: cfg_space::Status::new(),
            cache_line_size: 0,
            latency_timer: 0,
            interrupt_line: 0,
        }
    }
}

/// Emulator for the registers shared by the type 0 and type 1 headers.
#[derive(Debug)]
pub struct CommonHeaderEmulator {
    hardware_ids: HardwareIds,
    header_type: u8,
    multi_function_bit: bool,
    interrupt_pin: u8,
    state: CommonHeaderState,
}

impl CommonHeaderEmulator {
    /// Create a new [`CommonHeaderEmulator`] reporting `header_type`
    /// (`HEADER_TYPE_00` or `HEADER_TYPE_01`).
    pub fn new(hardware_ids: HardwareIds, header_type: u8) -> Self {
        Self {
            hardware_ids,
            header_type,
            multi_function_bit: false,
            interrupt_pin: 0,
            state: CommonHeaderState::new(),
        }
    }

    /// If the device is multi-function, enable bit 7 in the Header register.
    pub fn with_multi_function_bit(mut self, bit: bool) -> Self {
        self.multi_function_bit = bit;
        self
    }

    /// Report legacy interrupt pin `pin` (1 = INTA# .. 4 = INTD#, 0 = none).
    pub fn with_interrupt_pin(mut self, pin: u8) -> Self {
        self.interrupt_pin = pin;
        self
    }

    /// The hardware IDs this function reports.
    pub fn hardware_ids(&self) -> &HardwareIds {
        &self.hardware_ids
    }

    /// The current command register.
    pub fn command(&self) -> cfg_space::Command {
        self.state.command
    }

    /// Sets error bits in the status register. Only the write-1-to-clear
    /// error bits can be set this way.
    pub fn signal_status(&mut self, bits: cfg_space::Status) {
        let bits = bits.into_bits() & cfg_space::Status::WRITE_1_TO_CLEAR.into_bits();
        self.state.status = cfg_space::Status::from_bits(self.state.status.into_bits() | bits);
    }
}

impl BaseConfigSpace for CommonHeaderEmulator {
    fn read_base(&self, index: u16) -> u32 {
        use cfg_space::HeaderType00;

        match HeaderType00(index) {
            HeaderType00::DEVICE_VENDOR => {
                (self.hardware_ids.device_id as u32) << 16 | self.hardware_ids.vendor_id as u32
            }
            HeaderType00::STATUS_COMMAND => {
                (self.state.status.into_bits() as u32) << 16
                    | self.state.command.into_bits() as u32
            }
            HeaderType00::CLASS_REVISION => {
                (u8::from(self.hardware_ids.base_class) as u32) << 24
                    | (u8::from(self.hardware_ids.sub_class) as u32) << 16
                    | (u8::from(self.hardware_ids.prog_if) as u32) << 8
                    | self.hardware_ids.revision_id as u32
            }
            HeaderType00::BIST_HEADER => {
                let mut header_type = self.header_type;
                if self.multi_function_bit {
                    header_type |= cfg_space::HEADER_TYPE_MULTI_FUNCTION;
                }
                (header_type as u32) << 16
                    | (self.state.latency_timer as u32) << 8
                    | self.state.cache_line_size as u32
            }
            // No capability list.
            HeaderType00::RESERVED_CAP_PTR => 0,
            HeaderType00::LATENCY_INTERRUPT => {
                (self.interrupt_pin as u32) << 8 | self.state.interrupt_line as u32
            }
            _ if index < cfg_space::HEADER_REGISTER_COUNT => 0,
            _ if index < cfg_space::CONFIG_SPACE_REGISTER_COUNT => {
                tracing::trace!(index, "unimplemented config space read");
                0
            }
            _ => {
                tracing::warn!(index, "config space read out of range");
                0
            }
        }
    }

    fn write_base(&mut self, index: u16, data: u32, byte_enables: u8) {
        use cfg_space::HeaderType00;

        match HeaderType00(index) {
            HeaderType00::STATUS_COMMAND => {
                if byte_enables & 0x3 != 0 {
                    let old = self.state.command.into_bits() as u32;
                    let mut command = update_u32(old, byte_enables & 0x3, data, !0) as u16;
                    if command & !SUPPORTED_COMMAND_BITS != 0 {
                        tracing::warn!(index, value = data, "setting invalid command bits");
                        // still do our best
                        command &= SUPPORTED_COMMAND_BITS;
                    }
                    self.state.command = cfg_space::Command::from_bits(command);
                }
                if byte_enables & 0xC != 0 {
                    let clear = (update_u32(0, byte_enables & 0xC, data, !0) >> 16) as u16
                        & cfg_space::Status::WRITE_1_TO_CLEAR.into_bits();
                    self.state.status =
                        cfg_space::Status::from_bits(self.state.status.into_bits() & !clear);
                }
            }
            HeaderType00::BIST_HEADER => {
                if byte_enables & 0x1 != 0 {
                    self.state.cache_line_size = data as u8;
                }
                if byte_enables & 0x2 != 0 {
                    self.state.latency_timer = (data >> 8) as u8;
                }
            }
            HeaderType00::LATENCY_INTERRUPT => {
                if byte_enables & 0x1 != 0 {
                    self.state.interrupt_line = data as u8;
                }
            }
            // all other base regs are read-only
            _ if index < cfg_space::CONFIG_SPACE_REGISTER_COUNT => (),
            _ => {
                tracing::warn!(index, value = data, "config space write out of range");
            }
        }
    }

    fn reset(&mut self) {
        self.state = CommonHeaderState::new();
    }
}

/// The address space a BAR decodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BarKind {
    /// I/O space.
    Io,
    /// 32-bit, non-prefetchable memory space.
    Memory32,
    /// 64-bit memory space, occupying two consecutive BAR registers.
    Memory64 {
        /// Whether the region is prefetchable.
        prefetchable: bool,
    },
}

/// Container type that describes a device's available BARs
#[derive(Debug, Default, Clone)]
pub struct DeviceBars {
    bars: [Option<(u64, BarKind)>; 6],
}

impl DeviceBars {
    /// Create a new instance of [`DeviceBars`]
    pub fn new() -> DeviceBars {
        DeviceBars {
            bars: Default::default(),
        }
    }

    /// Describe BAR `index` as a region of `len` bytes.
    ///
    /// Lengths are rounded up to a power of two, as required by the BAR
    /// representation. A 64-bit BAR also consumes BAR `index + 1`.
    pub fn bar(mut self, index: usize, len: u64, kind: BarKind) -> Self {
        assert!(index < 6);
        if let BarKind::Memory64 { .. } = kind {
            assert!(index < 5);
        }
        self.bars[index] = Some((len, kind));
        self
    }

    /// Set BAR0
    pub fn bar0(self, len: u64, kind: BarKind) -> Self {
        self.bar(0, len, kind)
    }

    /// Returns true if no BARs are described.
    pub fn is_empty(&self) -> bool {
        self.bars.iter().all(Option::is_none)
    }
}

/// The fixed per-BAR values derived from a [`DeviceBars`].
#[derive(Debug, Clone, Default)]
struct BarRegisters {
    /// Decode masks with the in-band encoding bits set, as consumed by
    /// [`BarMappings::parse`].
    masks: [u32; 6],
    /// The bits software may write.
    writable: [u32; 6],
    /// Register contents at reset (the read-only encoding bits).
    reset_values: [u32; 6],
}

impl BarRegisters {
    fn new(bars: &DeviceBars, count: usize) -> Self {
        let mut regs = Self::default();
        for (bar_index, bar) in bars.bars.iter().enumerate() {
            let Some((len, kind)) = *bar else {
                continue;
            };
            let wide = matches!(kind, BarKind::Memory64 { .. });
            if bar_index >= count || (wide && bar_index + 1 >= count) {
                tracing::warn!(bar_index, count, "BAR not supported by this header type");
                continue;
            }
            match kind {
                BarKind::Io => {
                    let len = len.next_power_of_two().clamp(4, 0x1_0000);
                    let mask = !(len as u32 - 1);
                    let encoding = cfg_space::BarEncodingBits::new().with_use_pio(true);
                    regs.masks[bar_index] = mask | encoding.into_bits();
                    regs.writable[bar_index] = mask & !0x3;
                    regs.reset_values[bar_index] = encoding.into_bits();
                }
                BarKind::Memory32 => {
                    // Round up to at least one page.
                    const MIN_BAR_SIZE: u64 = 4096;
                    let len = len.next_power_of_two().clamp(MIN_BAR_SIZE, 0x8000_0000);
                    let mask = !(len as u32 - 1);
                    regs.masks[bar_index] = mask;
                    regs.writable[bar_index] = mask & !0xF;
                }
                BarKind::Memory64 { prefetchable } => {
                    const MIN_BAR_SIZE: u64 = 4096;
                    let len = std::cmp::max(len.next_power_of_two(), MIN_BAR_SIZE);
                    let mask64 = !(len - 1);
                    let encoding = cfg_space::BarEncodingBits::new()
                        .with_type_64_bit(true)
                        .with_prefetchable(prefetchable);
                    regs.masks[bar_index] = mask64 as u32 | encoding.into_bits();
                    regs.masks[bar_index + 1] = (mask64 >> 32) as u32;
                    regs.writable[bar_index] = mask64 as u32 & !0xF;
                    regs.writable[bar_index + 1] = (mask64 >> 32) as u32;
                    regs.reset_values[bar_index] = encoding.into_bits();
                }
            }
        }
        regs
    }
}

/// Expansion ROM base address register state.
#[derive(Debug, Clone, Copy, Default)]
struct ExpansionRom {
    base: u32,
    enable: bool,
}

impl ExpansionRom {
    fn read(&self) -> u32 {
        self.enable as u32 | (self.base & EXPANSION_ROM_ADDRESS_MASK)
    }

    fn write(&mut self, mask: u32, data: u32, byte_enables: u8) {
        self.base = update_u32(self.base, byte_enables, data, mask) & EXPANSION_ROM_ADDRESS_MASK;
        if byte_enables & 0x1 != 0 {
            self.enable = data & 1 != 0;
        }
    }
}

fn expansion_rom_mask(size: u64) -> u32 {
    if size == 0 {
        return 0;
    }
    let size = size.next_power_of_two().clamp(0x800, 0x100_0000);
    !(size as u32 - 1) & EXPANSION_ROM_ADDRESS_MASK
}

#[derive(Debug)]
struct ConfigSpaceType0EmulatorState {
    /// OS-configured BARs
    base_addresses: [u32; 6],
    expansion_rom: ExpansionRom,
}

/// Emulator for the standard Type 0 PCI configuration space header.
pub struct ConfigSpaceType0Emulator {
    // Fixed configuration
    hardware_ids: HardwareIds,
    bars: BarRegisters,
    expansion_rom_mask: u32,

    base: Box<dyn BaseConfigSpace>,

    // Volatile state
    state: ConfigSpaceType0EmulatorState,
}

impl std::fmt::Debug for ConfigSpaceType0Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpaceType0Emulator")
            .field("hardware_ids", &self.hardware_ids)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ConfigSpaceType0Emulator {
    /// Create a new [`ConfigSpaceType0Emulator`]
    pub fn new(hardware_ids: HardwareIds, bars: DeviceBars) -> Self {
        let bars = BarRegisters::new(&bars, 6);
        Self {
            hardware_ids,
            base: Box::new(CommonHeaderEmulator::new(
                hardware_ids,
                cfg_space::HEADER_TYPE_00,
            )),
            state: ConfigSpaceType0EmulatorState {
                base_addresses: bars.reset_values,
                expansion_rom: ExpansionRom::default(),
            },
            bars,
            expansion_rom_mask: 0,
        }
    }

    /// Replace the generic register file registers are delegated to.
    pub fn with_base(mut self, base: Box<dyn BaseConfigSpace>) -> Self {
        self.base = base;
        self
    }

    /// Implement an expansion ROM of `size` bytes.
    pub fn with_expansion_rom(mut self, size: u64) -> Self {
        self.expansion_rom_mask = expansion_rom_mask(size);
        self
    }

    /// Resets the configuration space state.
    pub fn reset(&mut self) {
        self.state = ConfigSpaceType0EmulatorState {
            base_addresses: self.bars.reset_values,
            expansion_rom: ExpansionRom::default(),
        };
        self.base.reset();
    }

    /// Read the register at dword `index`.
    pub fn read_register(&self, index: u16) -> u32 {
        use cfg_space::HeaderType00;

        match HeaderType00(index) {
            HeaderType00::BAR0
            | HeaderType00::BAR1
            | HeaderType00::BAR2
            | HeaderType00::BAR3
            | HeaderType00::BAR4
            | HeaderType00::BAR5 => {
                self.state.base_addresses[(index - HeaderType00::BAR0.0) as usize]
            }
            HeaderType00::CARDBUS_CIS_PTR => 0,
            HeaderType00::SUBSYSTEM_ID => {
                (self.hardware_ids.type0_sub_system_id as u32) << 16
                    | self.hardware_ids.type0_sub_vendor_id as u32
            }
            HeaderType00::EXPANSION_ROM_BASE => self.state.expansion_rom.read(),
            _ => self.base.read_base(index),
        }
    }

    /// Write the register at dword `index`, updating the byte lanes set in
    /// `byte_enables`.
    pub fn write_register(&mut self, index: u16, data: u32, byte_enables: u8) {
        use cfg_space::HeaderType00;

        match HeaderType00(index) {
            HeaderType00::BAR0
            | HeaderType00::BAR1
            | HeaderType00::BAR2
            | HeaderType00::BAR3
            | HeaderType00::BAR4
            | HeaderType00::BAR5 => {
                let bar_index = (index - HeaderType00::BAR0.0) as usize;
                let bar = &mut self.state.base_addresses[bar_index];
                *bar = update_u32(*bar, byte_enables, data, self.bars.writable[bar_index]);
            }
            HeaderType00::CARDBUS_CIS_PTR | HeaderType00::SUBSYSTEM_ID => (),
            HeaderType00::EXPANSION_ROM_BASE => {
                self.state
                    .expansion_rom
                    .write(self.expansion_rom_mask, data, byte_enables);
            }
            _ => self.base.write_base(index, data, byte_enables),
        }
    }

    /// The currently decoded BARs.
    pub fn active_bars(&self) -> BarMappings {
        BarMappings::parse(&self.state.base_addresses, &self.bars.masks)
    }

    /// Returns true if `address` falls within any implemented BAR decoding
    /// the requested address space.
    pub fn matches_bar(&self, address: u64, is_io: bool) -> bool {
        self.find_bar(address, is_io).is_some()
    }

    /// Finds a BAR + offset by address.
    pub fn find_bar(&self, address: u64, is_io: bool) -> Option<(u8, u64)> {
        self.active_bars().find(address, is_io)
    }
}

#[derive(Debug)]
struct ConfigSpaceType1EmulatorState {
    /// The two BARs a type 1 header has room for.
    base_addresses: [u32; 2],
    /// The primary bus number register, naming the bus on the upstream side
    /// of the bridge.
    primary_bus_number: u8,
    /// The secondary bus number register. Software programs
    /// this register with the bus number assigned to the secondary
    /// side of the bridge.
    secondary_bus_number: u8,
    /// The subordinate bus number register. Software programs
    /// this register with the highest bus number below the bridge.
    subordinate_bus_number: u8,
    /// Full 32-bit I/O window base. The low 12 bits are always 0s.
    io_base: u32,
    /// Full 32-bit I/O window limit. The low 12 bits are always 1s.
    io_limit: u32,
    /// Memory window base. The low 20 bits are always 0s.
    memory_base: u32,
    /// Memory window limit. The low 20 bits are always 1s.
    memory_limit: u32,
    /// Full 64-bit prefetchable window base. The low 20 bits are always 0s.
    prefetch_base: u64,
    /// Full 64-bit prefetchable window limit. The low 20 bits are always 1s.
    prefetch_limit: u64,
    secondary_status: cfg_space::SecondaryStatus,
    expansion_rom: ExpansionRom,
    bridge_control: cfg_space::BridgeControl,
}

impl ConfigSpaceType1EmulatorState {
    fn new(base_addresses: [u32; 2]) -> Self {
        Self {
            base_addresses,
            primary_bus_number: 0,
            secondary_bus_number: 0,
            subordinate_bus_number: 0,
            io_base: 0,
            io_limit: 0xFFF,
            memory_base: 0,
            memory_limit: 0xF_FFFF,
            prefetch_base: 0,
            prefetch_limit: 0xF_FFFF,
            secondary_status: cfg_space::SecondaryStatus::new(),
            expansion_rom: ExpansionRom::default(),
            bridge_control: cfg_space::BridgeControl::new(),
        }
    }
}

/// Emulator for the standard Type 1 PCI configuration space header, the
/// register file of every bridge in the hierarchy.
///
/// Besides the register file itself, this exposes the decode predicates used
/// to route traffic through the bridge. These are evaluated against the
/// current register contents on every call.
pub struct ConfigSpaceType1Emulator {
    bars: BarRegisters,
    expansion_rom_mask: u32,
    base: Box<dyn BaseConfigSpace>,
    state: ConfigSpaceType1EmulatorState,
}

impl std::fmt::Debug for ConfigSpaceType1Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpaceType1Emulator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ConfigSpaceType1Emulator {
    /// Create a new [`ConfigSpaceType1Emulator`]
    pub fn new(hardware_ids: HardwareIds) -> Self {
        let bars = BarRegisters::default();
        Self {
            base: Box::new(CommonHeaderEmulator::new(
                hardware_ids,
                cfg_space::HEADER_TYPE_01,
            )),
            state: ConfigSpaceType1EmulatorState::new([0; 2]),
            bars,
            expansion_rom_mask: 0,
        }
    }

    /// Replace the generic register file registers are delegated to.
    pub fn with_base(mut self, base: Box<dyn BaseConfigSpace>) -> Self {
        self.base = base;
        self
    }

    /// Implement BAR0 and BAR1 as described by `bars`. Other BARs are ignored.
    pub fn with_bars(mut self, bars: DeviceBars) -> Self {
        self.bars = BarRegisters::new(&bars, 2);
        self.state.base_addresses = [self.bars.reset_values[0], self.bars.reset_values[1]];
        self
    }

    /// Implement an expansion ROM of `size` bytes.
    pub fn with_expansion_rom(mut self, size: u64) -> Self {
        self.expansion_rom_mask = expansion_rom_mask(size);
        self
    }

    /// Program the primary, secondary and subordinate bus numbers.
    pub fn with_bus_numbers(mut self, primary: u8, secondary: u8, subordinate: u8) -> Self {
        self.set_bus_numbers(primary, secondary, subordinate);
        self
    }

    /// Resets the configuration space state.
    pub fn reset(&mut self) {
        self.state =
            ConfigSpaceType1EmulatorState::new([self.bars.reset_values[0], self.bars.reset_values[1]]);
        self.base.reset();
    }

    /// Program the primary, secondary and subordinate bus numbers.
    pub fn set_bus_numbers(&mut self, primary: u8, secondary: u8, subordinate: u8) {
        self.state.primary_bus_number = primary;
        self.state.secondary_bus_number = secondary;
        self.state.subordinate_bus_number = subordinate;
    }

    /// The primary bus number.
    pub fn primary_bus_number(&self) -> u8 {
        self.state.primary_bus_number
    }

    /// The secondary bus number.
    pub fn secondary_bus_number(&self) -> u8 {
        self.state.secondary_bus_number
    }

    /// The subordinate bus number.
    pub fn subordinate_bus_number(&self) -> u8 {
        self.state.subordinate_bus_number
    }

    /// Returns the range of bus numbers the bridge is programmed to decode.
    pub fn assigned_bus_range(&self) -> RangeInclusive<u8> {
        self.state.secondary_bus_number..=self.state.subordinate_bus_number
    }

    /// Returns true if `bus` is within `secondary..=subordinate`.
    pub fn bus_in_subordinate_range(&self, bus: u8) -> bool {
        self.assigned_bus_range().contains(&bus)
    }

    /// The I/O window.
    pub fn io_window(&self) -> RangeInclusive<u32> {
        self.state.io_base..=self.state.io_limit
    }

    /// The (non-prefetchable) memory window.
    pub fn memory_window(&self) -> RangeInclusive<u32> {
        self.state.memory_base..=self.state.memory_limit
    }

    /// The prefetchable memory window.
    pub fn prefetch_window(&self) -> RangeInclusive<u64> {
        self.state.prefetch_base..=self.state.prefetch_limit
    }

    /// Returns true if `address` falls within the I/O window.
    pub fn io_window_contains(&self, address: u64) -> bool {
        let window = self.io_window();
        (*window.start() as u64..=*window.end() as u64).contains(&address)
    }

    /// Returns true if `address` falls within either the memory window or the
    /// prefetchable memory window.
    pub fn memory_window_contains(&self, address: u64) -> bool {
        let window = self.memory_window();
        (*window.start() as u64..=*window.end() as u64).contains(&address)
            || self.prefetch_window().contains(&address)
    }

    /// The currently decoded BARs.
    pub fn active_bars(&self) -> BarMappings {
        BarMappings::parse(&self.state.base_addresses, &self.bars.masks[..2])
    }

    /// Returns true if `address` falls within any implemented BAR decoding
    /// the requested address space.
    pub fn matches_bar(&self, address: u64, is_io: bool) -> bool {
        self.active_bars().find(address, is_io).is_some()
    }

    /// The secondary status register.
    pub fn secondary_status(&self) -> cfg_space::SecondaryStatus {
        self.state.secondary_status
    }

    /// Sets bits in the secondary status register. Software clears them by
    /// writing 1s.
    pub fn signal_secondary_status(&mut self, bits: cfg_space::SecondaryStatus) {
        let bits = bits.into_bits() & cfg_space::SecondaryStatus::IMPLEMENTED.into_bits();
        self.state.secondary_status =
            cfg_space::SecondaryStatus::from_bits(self.state.secondary_status.into_bits() | bits);
    }

    /// The bridge control register.
    pub fn bridge_control(&self) -> cfg_space::BridgeControl {
        self.state.bridge_control
    }

    /// Read the register at dword `index`.
    pub fn read_register(&self, index: u16) -> u32 {
        use cfg_space::HeaderType01;

        let state = &self.state;
        match HeaderType01(index) {
            HeaderType01::BAR0 | HeaderType01::BAR1 => {
                state.base_addresses[(index - HeaderType01::BAR0.0) as usize]
            }
            // The secondary latency timer is not implemented and reads 0.
            HeaderType01::LATENCY_BUS_NUMBERS => {
                (state.subordinate_bus_number as u32) << 16
                    | (state.secondary_bus_number as u32) << 8
                    | state.primary_bus_number as u32
            }
            HeaderType01::SEC_STATUS_IO_RANGE => {
                (state.secondary_status.into_bits() as u32) << 16
                    | (state.io_limit & 0xF000)
                    | IO_ADDRESSING_32_BIT << 8
                    | (state.io_base & 0xF000) >> 8
                    | IO_ADDRESSING_32_BIT
            }
            HeaderType01::MEMORY_RANGE => {
                (state.memory_limit & 0xFFF0_0000) | (state.memory_base & 0xFFF0_0000) >> 16
            }
            HeaderType01::PREFETCH_RANGE => {
                // The low nibble of both halves reports 64-bit addressing.
                (state.prefetch_limit as u32 & 0xFFF0_0000)
                    | PREFETCH_ADDRESSING_64_BIT << 16
                    | (state.prefetch_base as u32 & 0xFFF0_0000) >> 16
                    | PREFETCH_ADDRESSING_64_BIT
            }
            HeaderType01::PREFETCH_BASE_UPPER => (state.prefetch_base >> 32) as u32,
            HeaderType01::PREFETCH_LIMIT_UPPER => (state.prefetch_limit >> 32) as u32,
            HeaderType01::IO_RANGE_UPPER => {
                (state.io_limit & 0xFFFF_0000) | (state.io_base & 0xFFFF_0000) >> 16
            }
            HeaderType01::EXPANSION_ROM_BASE => state.expansion_rom.read(),
            HeaderType01::BRIDGE_CTRL_INTERRUPT => {
                (state.bridge_control.into_bits() as u32) << 16
                    | (self.base.read_base(index) & 0xFFFF)
            }
            _ => self.base.read_base(index),
        }
    }

    /// Write the register at dword `index`, updating the byte lanes set in
    /// `byte_enables`.
    pub fn write_register(&mut self, index: u16, data: u32, byte_enables: u8) {
        use cfg_space::HeaderType01;

        let byte_enables = byte_enables & 0xF;
        let data64 = data as u64;
        let state = &mut self.state;
        match HeaderType01(index) {
            HeaderType01::BAR0 | HeaderType01::BAR1 => {
                let bar_index = (index - HeaderType01::BAR0.0) as usize;
                let bar = &mut state.base_addresses[bar_index];
                *bar = update_u32(*bar, byte_enables, data, self.bars.writable[bar_index]);
            }
            HeaderType01::LATENCY_BUS_NUMBERS => {
                if byte_enables & 0x1 != 0 {
                    state.primary_bus_number = data as u8;
                }
                if byte_enables & 0x2 != 0 {
                    state.secondary_bus_number = (data >> 8) as u8;
                }
                if byte_enables & 0x4 != 0 {
                    state.subordinate_bus_number = (data >> 16) as u8;
                }
            }
            HeaderType01::SEC_STATUS_IO_RANGE => {
                if byte_enables & 0x1 != 0 {
                    state.io_base =
                        byte_mask_update(state.io_base.into(), 0x2, data64 << 8, 0xF000) as u32;
                }
                if byte_enables & 0x2 != 0 {
                    state.io_limit =
                        byte_mask_update(state.io_limit.into(), 0x2, data64, 0xF000) as u32 | 0xFFF;
                }
                if byte_enables & 0x8 != 0 {
                    let clear = (data >> 16) as u16
                        & cfg_space::SecondaryStatus::IMPLEMENTED.into_bits();
                    state.secondary_status = cfg_space::SecondaryStatus::from_bits(
                        state.secondary_status.into_bits() & !clear,
                    );
                }
            }
            HeaderType01::MEMORY_RANGE => {
                state.memory_base = byte_mask_update(
                    state.memory_base.into(),
                    (byte_enables & 0x3) << 2,
                    data64 << 16,
                    0xFFF0_0000,
                ) as u32;
                state.memory_limit = byte_mask_update(
                    state.memory_limit.into(),
                    byte_enables & 0xC,
                    data64,
                    0xFFF0_0000,
                ) as u32
                    | 0xF_FFFF;
            }
            HeaderType01::PREFETCH_RANGE => {
                state.prefetch_base = byte_mask_update(
                    state.prefetch_base,
                    (byte_enables & 0x3) << 2,
                    data64 << 16,
                    0xFFF0_0000,
                );
                state.prefetch_limit = byte_mask_update(
                    state.prefetch_limit,
                    byte_enables & 0xC,
                    data64,
                    0xFFF0_0000,
                ) | 0xF_FFFF;
            }
            HeaderType01::PREFETCH_BASE_UPPER => {
                state.prefetch_base =
                    byte_mask_update(state.prefetch_base, byte_enables << 4, data64 << 32, !0);
            }
            HeaderType01::PREFETCH_LIMIT_UPPER => {
                state.prefetch_limit =
                    byte_mask_update(state.prefetch_limit, byte_enables << 4, data64 << 32, !0);
            }
            HeaderType01::IO_RANGE_UPPER => {
                state.io_base = byte_mask_update(
                    state.io_base.into(),
                    (byte_enables & 0x3) << 2,
                    data64 << 16,
                    !0,
                ) as u32;
                state.io_limit =
                    byte_mask_update(state.io_limit.into(), byte_enables & 0xC, data64, !0) as u32;
            }
            HeaderType01::EXPANSION_ROM_BASE => {
                state
                    .expansion_rom
                    .write(self.expansion_rom_mask, data, byte_enables);
            }
            HeaderType01::BRIDGE_CTRL_INTERRUPT => {
                if byte_enables & 0x3 != 0 {
                    self.base.write_base(index, data, byte_enables & 0x3);
                }
                if byte_enables & 0x4 != 0 {
                    let requested = (data >> 16) as u16 & 0xFF;
                    let supported = cfg_space::BridgeControl::SUPPORTED.into_bits();
                    if requested & !supported != 0 {
                        tracing::debug!(
                            index,
                            value = data,
                            "ignoring unsupported bridge control bits"
                        );
                    }
                    state.bridge_control = cfg_space::BridgeControl::from_bits(
                        (state.bridge_control.into_bits() & 0xFF00) | (requested & supported),
                    );
                }
            }
            _ => self.base.write_base(index, data, byte_enables),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::hwid::ClassCode;
    use crate::spec::hwid::ProgrammingInterface;
    use crate::spec::hwid::Subclass;

    fn bridge_ids() -> HardwareIds {
        HardwareIds {
            vendor_id: 0x1111,
            device_id: 0x2222,
            revision_id: 1,
            prog_if: ProgrammingInterface::NONE,
            sub_class: Subclass::BRIDGE_PCI_TO_PCI,
            base_class: ClassCode::BRIDGE,
            type0_sub_vendor_id: 0,
            type0_sub_system_id: 0,
        }
    }

    fn endpoint_ids() -> HardwareIds {
        HardwareIds {
            vendor_id: 0x1414,
            device_id: 0x00AB,
            revision_id: 2,
            prog_if: ProgrammingInterface::NONE,
            sub_class: Subclass::NONE,
            base_class: ClassCode::NETWORK_CONTROLLER,
            type0_sub_vendor_id: 0x3333,
            type0_sub_system_id: 0x4444,
        }
    }

    fn create_type1_emulator() -> ConfigSpaceType1Emulator {
        ConfigSpaceType1Emulator::new(bridge_ids())
    }

    #[test]
    fn test_byte_mask_update() {
        assert_eq!(
            byte_mask_update(0x1122_3344, 0b0101, 0xAABB_CCDD, !0),
            0x11BB_33DD
        );
        assert_eq!(byte_mask_update(0x1122_3344, 0, 0xAABB_CCDD, !0), 0x1122_3344);
        // Bits outside the bitmask keep their old value, even in enabled lanes.
        assert_eq!(byte_mask_update(0x0FFF, 0xF, 0xF000, 0xF000), 0xFFFF);
        assert_eq!(byte_mask_update(0x0ABC, 0xF, 0x0000, 0xF000), 0x0ABC);
        assert_eq!(
            byte_mask_update(0x1_0000_0000, 0xF0, 0x2_0000_0000, !0),
            0x2_0000_0000
        );
    }

    #[test]
    fn test_type1_probe() {
        let emu = create_type1_emulator();
        assert_eq!(emu.read_register(0), 0x2222_1111);
        assert_eq!(emu.read_register(2), 0x0604_0001);
        assert_eq!(emu.read_register(3), 0x0001_0000);
        assert_eq!(emu.read_register(13), 0);

        let emu = ConfigSpaceType1Emulator::new(bridge_ids()).with_base(Box::new(
            CommonHeaderEmulator::new(bridge_ids(), cfg_space::HEADER_TYPE_01)
                .with_multi_function_bit(true),
        ));
        assert_eq!(emu.read_register(3), 0x0081_0000);
    }

    #[test]
    fn test_type1_defaults() {
        let emu = create_type1_emulator();
        assert_eq!(emu.read_register(6), 0);
        assert_eq!(emu.read_register(7), 0x0000_0101);
        assert_eq!(emu.read_register(8), 0);
        assert_eq!(emu.read_register(9), 0x0001_0001);
        assert_eq!(emu.read_register(12), 0);
        assert_eq!(emu.io_window(), 0..=0xFFF);
        assert_eq!(emu.memory_window(), 0..=0xF_FFFF);
        assert_eq!(emu.prefetch_window(), 0..=0xF_FFFF);
    }

    #[test]
    fn test_type1_bus_number_assignment() {
        let mut emu = create_type1_emulator();
        // Before assignment the bridge decodes bus 0 only.
        assert_eq!(emu.assigned_bus_range(), 0..=0);
        assert!(emu.bus_in_subordinate_range(0));
        assert!(!emu.bus_in_subordinate_range(1));

        // Bus numbers can be programmed one lane at a time.
        emu.write_register(6, 0x0000_0500, 0x2);
        assert_eq!(emu.read_register(6), 0x0000_0500);
        emu.write_register(6, 0x000A_0000, 0x4);
        assert_eq!(emu.read_register(6), 0x000A_0500);
        assert_eq!(emu.assigned_bus_range(), 5..=10);

        // The secondary latency timer is read-only.
        emu.write_register(6, 0xFF0A_0501, 0xF);
        assert_eq!(emu.read_register(6), 0x000A_0501);
        assert_eq!(emu.primary_bus_number(), 1);

        for bus in [5, 7, 10] {
            assert!(emu.bus_in_subordinate_range(bus));
        }
        for bus in [0, 4, 11, 12] {
            assert!(!emu.bus_in_subordinate_range(bus));
        }

        // Evaluating the predicate does not change its answer.
        assert_eq!(
            emu.bus_in_subordinate_range(7),
            emu.bus_in_subordinate_range(7)
        );
    }

    #[test]
    fn test_type1_memory_assignment() {
        let mut emu = create_type1_emulator();

        emu.write_register(8, 0xABC0_1230, 0xF);
        assert_eq!(emu.read_register(8), 0xABC0_1230);
        assert_eq!(emu.memory_window(), 0x1230_0000..=0xABCF_FFFF);
        assert!(emu.memory_window_contains(0x1230_0000));
        assert!(emu.memory_window_contains(0xABCF_FFFF));
        assert!(!emu.memory_window_contains(0xABD0_0000));

        // The low nibble of each half is not writable.
        emu.write_register(8, 0x1234_5678, 0xF);
        assert_eq!(emu.read_register(8), 0x1230_5670);
        assert_eq!(emu.memory_window(), 0x5670_0000..=0x123F_FFFF);

        // Only the enabled lanes are updated.
        emu.write_register(8, 0xFFFF_0000, 0x3);
        assert_eq!(emu.read_register(8), 0x1230_0000);
        emu.write_register(8, 0x0000_FFFF, 0xC);
        assert_eq!(emu.read_register(8), 0x0000_0000);
        assert_eq!(emu.memory_window(), 0..=0xF_FFFF);
    }

    #[test]
    fn test_type1_prefetch_assignment() {
        let mut emu = create_type1_emulator();

        emu.write_register(9, 0x2000_1000, 0xF);
        emu.write_register(10, 0x0000_0001, 0xF);
        emu.write_register(11, 0x0000_0002, 0xF);
        assert_eq!(emu.read_register(9), 0x2001_1001);
        assert_eq!(emu.read_register(10), 1);
        assert_eq!(emu.read_register(11), 2);
        assert_eq!(
            emu.prefetch_window(),
            0x1_1000_0000..=0x2_200F_FFFF
        );
        assert!(emu.memory_window_contains(0x1_8000_0000));
        assert!(!emu.memory_window_contains(0x2_2010_0000));

        // Upper halves are byte-lane updated too.
        emu.write_register(10, 0xFFFF_FF03, 0x1);
        assert_eq!(emu.read_register(10), 3);
    }

    #[test]
    fn test_type1_io_assignment() {
        let mut emu = create_type1_emulator();

        emu.write_register(7, 0x0000_F0D0, 0x3);
        assert_eq!(emu.read_register(7), 0x0000_F1D1);
        assert_eq!(emu.io_window(), 0xD000..=0xFFFF);

        emu.write_register(12, 0x0002_0001, 0xF);
        assert_eq!(emu.read_register(12), 0x0002_0001);
        assert_eq!(emu.io_window(), 0x1_D000..=0x2_FFFF);
        assert!(emu.io_window_contains(0x1_D000));
        assert!(!emu.io_window_contains(0xD000));
    }

    #[test]
    fn test_type1_secondary_status_write_1_to_clear() {
        let mut emu = create_type1_emulator();

        emu.signal_secondary_status(
            cfg_space::SecondaryStatus::new()
                .with_received_master_abort(true)
                .with_detected_parity_error(true),
        );
        assert_eq!(emu.read_register(7) & 0xFFFF_0000, 0xA000_0000);

        // Writing 0s leaves the bits set.
        emu.write_register(7, 0, 0x8);
        assert_eq!(emu.read_register(7) & 0xFFFF_0000, 0xA000_0000);

        // The status lane must be enabled for the write to take effect.
        emu.write_register(7, 0x2000_0000, 0x7);
        assert_eq!(emu.read_register(7) & 0xFFFF_0000, 0xA000_0000);

        emu.write_register(7, 0x2000_0000, 0x8);
        assert_eq!(emu.read_register(7) & 0xFFFF_0000, 0x8000_0000);
        assert!(!emu.secondary_status().received_master_abort());
        assert!(emu.secondary_status().detected_parity_error());

        // There is no way to set a bit from software.
        emu.write_register(7, 0xFFFF_0000, 0x8);
        assert_eq!(emu.read_register(7) & 0xFFFF_0000, 0);
    }

    #[test]
    fn test_type1_bars() {
        let mut emu = create_type1_emulator()
            .with_bars(DeviceBars::new().bar0(0x1000, BarKind::Memory32));

        // Sizing probe.
        emu.write_register(4, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(4), 0xFFFF_F000);

        emu.write_register(4, 0xFE00_0000, 0xF);
        assert!(emu.matches_bar(0xFE00_0800, false));
        assert!(!emu.matches_bar(0xFE00_0800, true));
        assert!(!emu.matches_bar(0xFE00_1000, false));

        // BAR1 is not implemented.
        emu.write_register(5, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(5), 0);
    }

    #[test]
    fn test_type1_expansion_rom() {
        let mut emu = create_type1_emulator().with_expansion_rom(0x1_0000);

        emu.write_register(14, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(14), 0xFFFF_0001);

        emu.write_register(14, 0xC000_0000, 0xF);
        assert_eq!(emu.read_register(14), 0xC000_0000);

        // Without a ROM, the register reads back 0 apart from the enable bit.
        let mut emu = create_type1_emulator();
        emu.write_register(14, 0xFFFF_FFFE, 0xF);
        assert_eq!(emu.read_register(14), 0);
    }

    #[test]
    fn test_type1_bridge_control() {
        let mut emu = create_type1_emulator();

        emu.write_register(15, 0xFFFF_FF0A, 0xF);
        assert_eq!(emu.read_register(15), 0x0043_000A);
        let control = emu.bridge_control();
        assert!(control.parity_error_response_enable());
        assert!(control.serr_enable());
        assert!(control.secondary_bus_reset());

        // Only the interrupt line lane.
        emu.write_register(15, 0x0000_0005, 0x1);
        assert_eq!(emu.read_register(15), 0x0043_0005);

        emu.write_register(15, 0, 0x4);
        assert_eq!(emu.read_register(15), 0x0000_0005);
    }

    #[test]
    fn test_type1_command_and_status() {
        let mut emu = create_type1_emulator();

        emu.write_register(1, 0xFFFF_0006, 0xF);
        assert_eq!(emu.read_register(1), 0x0000_0006);

        // Unsupported command bits are dropped.
        emu.write_register(1, 0x0000_F806, 0x3);
        assert_eq!(emu.read_register(1), 0x0000_0006);

        emu.reset();
        assert_eq!(emu.read_register(1), 0);
    }

    #[test]
    fn test_common_header_status_write_1_to_clear() {
        let mut base = CommonHeaderEmulator::new(endpoint_ids(), cfg_space::HEADER_TYPE_00);
        base.signal_status(
            cfg_space::Status::new()
                .with_abort_master_received(true)
                .with_capabilities_list(true),
        );
        assert_eq!(base.read_base(1), 0x2000_0000);
        base.write_base(1, 0x2000_0000, 0x8);
        assert_eq!(base.read_base(1), 0);
    }

    #[test]
    fn test_type1_reset() {
        let mut emu = create_type1_emulator();
        emu.write_register(6, 0x0003_0201, 0xF);
        emu.write_register(8, 0xABC0_1230, 0xF);
        emu.reset();
        assert_eq!(emu.read_register(6), 0);
        assert_eq!(emu.memory_window(), 0..=0xF_FFFF);
    }

    #[test]
    fn test_type0_bars() {
        let mut emu = ConfigSpaceType0Emulator::new(
            endpoint_ids(),
            DeviceBars::new()
                .bar0(0x10_0000, BarKind::Memory64 { prefetchable: true })
                .bar(2, 0x100, BarKind::Io),
        );
        assert_eq!(emu.read_register(4), 0x0000_000C);
        assert_eq!(emu.read_register(6), 0x0000_0001);

        // Sizing probe.
        emu.write_register(4, 0xFFFF_FFFF, 0xF);
        emu.write_register(5, 0xFFFF_FFFF, 0xF);
        emu.write_register(6, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(4), 0xFFF0_000C);
        assert_eq!(emu.read_register(5), 0xFFFF_FFFF);
        assert_eq!(emu.read_register(6), 0xFFFF_FF01);

        emu.write_register(4, 0x8000_0000, 0xF);
        emu.write_register(5, 0x0000_0001, 0xF);
        emu.write_register(6, 0x0000_C000, 0xF);
        assert_eq!(emu.find_bar(0x1_8000_0010, false), Some((0, 0x10)));
        assert!(!emu.matches_bar(0x1_8010_0000, false));
        assert_eq!(emu.find_bar(0xC0FF, true), Some((2, 0xFF)));
        assert!(!emu.matches_bar(0xC0FF, false));
    }

    #[test]
    fn test_type0_probe() {
        let mut emu =
            ConfigSpaceType0Emulator::new(endpoint_ids(), DeviceBars::new()).with_expansion_rom(0x800);
        assert_eq!(emu.read_register(0), 0x00AB_1414);
        assert_eq!(emu.read_register(2), 0x0200_0002);
        assert_eq!(emu.read_register(3), 0);
        assert_eq!(emu.read_register(11), 0x4444_3333);

        emu.write_register(12, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(12), 0xFFFF_F801);

        // Unimplemented BARs read back 0.
        emu.write_register(4, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(4), 0);

        emu.write_register(15, 0x0000_000B, 0x1);
        assert_eq!(emu.read_register(15), 0x0000_000B);

        // Out-of-range indices read 0 and ignore writes.
        emu.write_register(2000, 0xFFFF_FFFF, 0xF);
        assert_eq!(emu.read_register(2000), 0);
    }
}
