// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR decoding.

use crate::spec::cfg_space;

/// A parsed BAR mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarMapping {
    /// Associated BAR register index
    pub index: u8,
    /// Base address of the mapping
    pub base_address: u64,
    /// Length of the mapping
    pub len: u64,
    /// Whether the BAR decodes I/O space rather than memory space
    pub is_io: bool,
}

impl BarMapping {
    /// Returns true if `address` falls inside this mapping.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.len
    }
}

/// A set of parsed BAR mappings.
#[derive(Debug, Default, Clone)]
pub struct BarMappings(Vec<BarMapping>);

impl BarMappings {
    /// Parses a set of BARs into mappings.
    ///
    /// `bar_masks` carries the decode mask of each BAR, with the BAR's
    /// in-band encoding bits (I/O vs. memory, 64-bit) set in the low bits.
    /// A zero mask marks an unimplemented BAR. The upper half of a 64-bit
    /// BAR is consumed together with the lower half.
    pub fn parse(base_addresses: &[u32], bar_masks: &[u32]) -> Self {
        let mut mappings = Vec::new();
        let count = base_addresses.len().min(bar_masks.len());
        let mut i = 0;
        while i < count {
            let encoding = cfg_space::BarEncodingBits::from_bits(bar_masks[i]);
            let bar_address;
            let mut bar_mask;
            let len;
            if encoding.use_pio() {
                bar_mask = (bar_masks[i] & !0x3) as u64 | !0xFFFF_FFFF_u64;
                bar_address = base_addresses[i] as u64;
                len = 1;
            } else if encoding.type_64_bit() && i + 1 < count {
                bar_mask = (bar_masks[i + 1] as u64) << 32 | bar_masks[i] as u64;
                bar_address = (base_addresses[i + 1] as u64) << 32 | base_addresses[i] as u64;
                len = 2;
            } else {
                bar_mask = bar_masks[i] as i32 as i64 as u64; // sign extend
                bar_address = base_addresses[i] as u64;
                len = 1;
            };
            if !encoding.use_pio() {
                bar_mask &= !0xf;
            }
            if bar_mask & 0xFFFF_FFFF != 0 || (len == 2 && bar_mask != 0) {
                let base_address = if encoding.use_pio() {
                    bar_address & bar_mask & 0xFFFF_FFFF
                } else {
                    bar_address & bar_mask
                };
                mappings.push(BarMapping {
                    index: i as u8,
                    base_address,
                    len: (!bar_mask).wrapping_add(1),
                    is_io: encoding.use_pio(),
                });
            }
            i += len;
        }
        Self(mappings)
    }

    /// Finds a BAR + offset by address, considering only BARs decoding the
    /// requested space.
    pub fn find(&self, address: u64, is_io: bool) -> Option<(u8, u64)> {
        self.0
            .iter()
            .find(|bar| bar.is_io == is_io && bar.contains(address))
            .map(|bar| (bar.index, address - bar.base_address))
    }

    /// Gets the base address configured for `bar`.
    pub fn get(&self, bar: u8) -> Option<u64> {
        self.0
            .iter()
            .find(|mapping| mapping.index == bar)
            .map(|mapping| mapping.base_address)
    }

    /// Returns an iterator through the mappings.
    pub fn iter(&self) -> impl Iterator<Item = &BarMapping> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_32_bit_memory_bar() {
        // 4 KiB, 32-bit, non-prefetchable
        let masks = [0xFFFF_F000, 0];
        let bars = BarMappings::parse(&[0xFEB0_0000, 0], &masks);
        let mapping: Vec<_> = bars.iter().cloned().collect();
        assert_eq!(
            mapping,
            vec![BarMapping {
                index: 0,
                base_address: 0xFEB0_0000,
                len: 0x1000,
                is_io: false,
            }]
        );
        assert_eq!(bars.find(0xFEB0_0FFF, false), Some((0, 0xFFF)));
        assert_eq!(bars.find(0xFEB0_1000, false), None);
        assert_eq!(bars.find(0xFEB0_0000, true), None);
    }

    #[test]
    fn parse_64_bit_memory_bar() {
        // 1 MiB, 64-bit, prefetchable
        let masks = [0xFFF0_000C, 0xFFFF_FFFF];
        let bars = BarMappings::parse(&[0x8000_000C, 0x1], &masks);
        assert_eq!(bars.get(0), Some(0x1_8000_0000));
        assert_eq!(bars.get(1), None);
        assert_eq!(bars.find(0x1_800F_FFFF, false), Some((0, 0xF_FFFF)));
        assert_eq!(bars.find(0x8000_0000, false), None);
    }

    #[test]
    fn parse_io_bar() {
        // 256 bytes of I/O space
        let masks = [0, 0xFFFF_FF01];
        let bars = BarMappings::parse(&[0, 0xC001], &masks);
        assert_eq!(bars.find(0xC0FF, true), Some((1, 0xFF)));
        assert_eq!(bars.find(0xC0FF, false), None);
        assert_eq!(bars.find(0xC100, true), None);
    }

    #[test]
    fn unimplemented_bars_are_skipped() {
        let bars = BarMappings::parse(&[0xFFFF_FFFF; 6], &[0; 6]);
        assert_eq!(bars.iter().count(), 0);
        assert_eq!(bars.find(0, false), None);
    }
}
