//! Memory-type range registers.
//!
//! The EPT must reproduce the cache behavior the firmware programmed into
//! the MTRRs: every EPT leaf carries a memory type, and getting one wrong
//! (a write-back mapping over MMIO, say) breaks devices in ways that are
//! miserable to debug. The descriptor snapshots the MTRR state of the
//! current processor once at bring-up and answers "what type covers this
//! physical address" with the architectural precedence rules.
//!
//! See: Intel SDM Vol. 3A, 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)

use {
    crate::intel::support::rdmsr,
    bitfield::bitfield,
    x86::msr::{IA32_MTRRCAP, IA32_MTRR_DEF_TYPE, IA32_MTRR_PHYSBASE0},
};

/// Architectural memory types as encoded in EPT entries and MTRRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    /// Decodes the 3-bit encoding; anything undefined degrades to UC, the
    /// only always-safe type.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Uncacheable,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }
}

bitfield! {
    /// IA32_MTRRCAP.
    #[derive(Clone, Copy)]
    pub struct MtrrCapabilities(u64);
    impl Debug;
    pub u8, variable_range_count, set_variable_range_count: 7, 0;
    pub fixed_range_supported, set_fixed_range_supported: 8;
    pub wc_supported, set_wc_supported: 10;
    pub smrr_supported, set_smrr_supported: 11;
}

bitfield! {
    /// IA32_MTRR_DEF_TYPE.
    #[derive(Clone, Copy)]
    pub struct MtrrDefType(u64);
    impl Debug;
    pub u8, default_memory_type, set_default_memory_type: 7, 0;
    pub fixed_range_mtrr_enable, set_fixed_range_mtrr_enable: 10;
    pub mtrr_enable, set_mtrr_enable: 11;
}

bitfield! {
    /// IA32_MTRR_PHYSBASEn.
    #[derive(Clone, Copy, Default)]
    pub struct MtrrPhysBase(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 7, 0;
    pub u64, page_frame_number, set_page_frame_number: 47, 12;
}

bitfield! {
    /// IA32_MTRR_PHYSMASKn.
    #[derive(Clone, Copy, Default)]
    pub struct MtrrPhysMask(u64);
    impl Debug;
    pub valid, set_valid: 11;
    pub u64, page_frame_number, set_page_frame_number: 47, 12;
}

/// Geometry of the eleven fixed-range MTRRs covering the low megabyte:
/// `(msr, first physical address, bytes per 8-sub-range slot)`.
const FIXED_RANGES: [(u32, u64, u64); 11] = [
    (0x250, 0x00000, 0x10000), // IA32_MTRR_FIX64K_00000
    (0x258, 0x80000, 0x04000), // IA32_MTRR_FIX16K_80000
    (0x259, 0xA0000, 0x04000), // IA32_MTRR_FIX16K_A0000
    (0x268, 0xC0000, 0x01000), // IA32_MTRR_FIX4K_C0000
    (0x269, 0xC8000, 0x01000), // IA32_MTRR_FIX4K_C8000
    (0x26A, 0xD0000, 0x01000), // IA32_MTRR_FIX4K_D0000
    (0x26B, 0xD8000, 0x01000), // IA32_MTRR_FIX4K_D8000
    (0x26C, 0xE0000, 0x01000), // IA32_MTRR_FIX4K_E0000
    (0x26D, 0xE8000, 0x01000), // IA32_MTRR_FIX4K_E8000
    (0x26E, 0xF0000, 0x01000), // IA32_MTRR_FIX4K_F0000
    (0x26F, 0xF8000, 0x01000), // IA32_MTRR_FIX4K_F8000
];

const ONE_MEGABYTE: u64 = 0x10_0000;

/// The largest number of variable ranges we snapshot; IA32_MTRRCAP reports
/// fewer on every contemporary part.
pub const MAX_VARIABLE_RANGES: usize = 16;

/// Raw MSR values backing a descriptor; separated out so the precedence
/// logic can be exercised against synthetic register state.
#[derive(Debug, Clone, Copy)]
pub struct MtrrSnapshot {
    pub capabilities: u64,
    pub def_type: u64,
    pub fixed: [u64; FIXED_RANGES.len()],
    pub variable: [(u64, u64); MAX_VARIABLE_RANGES],
}

/// The per-processor MTRR state, captured once at bring-up.
#[derive(Debug, Clone, Copy)]
pub struct MtrrDescriptor {
    capabilities: MtrrCapabilities,
    def_type: MtrrDefType,
    fixed: [u64; FIXED_RANGES.len()],
    variable: [(MtrrPhysBase, MtrrPhysMask); MAX_VARIABLE_RANGES],
    variable_count: usize,
}

impl MtrrDescriptor {
    /// Reads the MTRR MSR family of the current processor.
    pub fn capture() -> Self {
        let capabilities = rdmsr(IA32_MTRRCAP);
        let def_type = rdmsr(IA32_MTRR_DEF_TYPE);

        let mut fixed = [0u64; FIXED_RANGES.len()];
        if MtrrCapabilities(capabilities).fixed_range_supported() {
            for (slot, &(msr, _, _)) in fixed.iter_mut().zip(FIXED_RANGES.iter()) {
                *slot = rdmsr(msr);
            }
        }

        let count =
            usize::from(MtrrCapabilities(capabilities).variable_range_count()).min(MAX_VARIABLE_RANGES);

        let mut variable = [(0u64, 0u64); MAX_VARIABLE_RANGES];
        for (i, pair) in variable.iter_mut().take(count).enumerate() {
            let base_msr = IA32_MTRR_PHYSBASE0 + (i as u32 * 2);
            *pair = (rdmsr(base_msr), rdmsr(base_msr + 1));
        }

        Self::from_snapshot(MtrrSnapshot { capabilities, def_type, fixed, variable })
    }

    /// Builds a descriptor from raw register values.
    pub fn from_snapshot(snapshot: MtrrSnapshot) -> Self {
        let capabilities = MtrrCapabilities(snapshot.capabilities);
        let variable_count =
            usize::from(capabilities.variable_range_count()).min(MAX_VARIABLE_RANGES);

        let mut variable =
            [(MtrrPhysBase(0), MtrrPhysMask(0)); MAX_VARIABLE_RANGES];
        for (slot, &(base, mask)) in variable.iter_mut().zip(snapshot.variable.iter()) {
            *slot = (MtrrPhysBase(base), MtrrPhysMask(mask));
        }

        Self {
            capabilities,
            def_type: MtrrDefType(snapshot.def_type),
            fixed: snapshot.fixed,
            variable,
            variable_count,
        }
    }

    /// The memory type covering the 4KB page of `pa`.
    ///
    /// Precedence: MTRRs disabled means UC everywhere; the fixed ranges own
    /// the low megabyte when enabled; among overlapping variable ranges UC
    /// beats WT which beats WB; no match falls back to the default type.
    pub fn memory_type(&self, pa: u64) -> MemoryType {
        if !self.def_type.mtrr_enable() {
            return MemoryType::Uncacheable;
        }

        if pa < ONE_MEGABYTE
            && self.capabilities.fixed_range_supported()
            && self.def_type.fixed_range_mtrr_enable()
        {
            return self.fixed_range_type(pa);
        }

        let mut matched: Option<MemoryType> = None;

        for &(base, mask) in self.variable.iter().take(self.variable_count) {
            if !mask.valid() {
                continue;
            }

            let mask_bits = mask.page_frame_number() << 12;
            if pa & mask_bits != (base.page_frame_number() << 12) & mask_bits {
                continue;
            }

            let candidate = MemoryType::from_bits(base.memory_type());
            matched = Some(match (matched, candidate) {
                (_, MemoryType::Uncacheable) | (Some(MemoryType::Uncacheable), _) => {
                    MemoryType::Uncacheable
                }
                (Some(MemoryType::WriteThrough), MemoryType::WriteBack)
                | (Some(MemoryType::WriteBack), MemoryType::WriteThrough) => {
                    MemoryType::WriteThrough
                }
                (Some(existing), _) => existing,
                (None, candidate) => candidate,
            });
        }

        matched.unwrap_or_else(|| MemoryType::from_bits(self.def_type.default_memory_type()))
    }

    fn fixed_range_type(&self, pa: u64) -> MemoryType {
        for (value, &(_, first, slot_size)) in self.fixed.iter().zip(FIXED_RANGES.iter()) {
            let size = slot_size * 8;
            if pa >= first && pa < first + size {
                let slot = ((pa - first) / slot_size) as u32;
                return MemoryType::from_bits((value >> (slot * 8)) as u8);
            }
        }

        // The table tiles the whole megabyte; falling through means a bug.
        MemoryType::Uncacheable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENABLED: u64 = 1 << 11;
    const FIXED_ENABLED: u64 = 1 << 10;
    const CAP: u64 = (1 << 8) | 4; // fixed supported, 4 variable ranges

    fn variable(base_pa: u64, size: u64, memory_type: MemoryType) -> (u64, u64) {
        let mask = !(size - 1) & 0xF_FFFF_F000;
        (base_pa | u64::from(memory_type.bits()), mask | (1 << 11))
    }

    fn snapshot() -> MtrrSnapshot {
        MtrrSnapshot {
            capabilities: CAP,
            def_type: ENABLED | FIXED_ENABLED | u64::from(MemoryType::WriteBack.bits()),
            fixed: [0; 11],
            variable: [(0, 0); MAX_VARIABLE_RANGES],
        }
    }

    #[test]
    fn disabled_mtrrs_mean_uncacheable() {
        let mut raw = snapshot();
        raw.def_type = u64::from(MemoryType::WriteBack.bits());

        let mtrr = MtrrDescriptor::from_snapshot(raw);
        assert_eq!(mtrr.memory_type(0x0), MemoryType::Uncacheable);
        assert_eq!(mtrr.memory_type(0x1234_5000), MemoryType::Uncacheable);
    }

    #[test]
    fn default_type_applies_when_nothing_matches() {
        let mtrr = MtrrDescriptor::from_snapshot(snapshot());
        assert_eq!(mtrr.memory_type(0x4000_0000), MemoryType::WriteBack);
    }

    #[test]
    fn fixed_ranges_cover_the_low_megabyte() {
        let mut raw = snapshot();
        // 64K block 1 (0x10000..0x20000) is WT; 4K slot at 0xF8000 is UC.
        raw.fixed[0] = u64::from(MemoryType::WriteThrough.bits()) << 8;
        raw.fixed[10] = u64::from(MemoryType::Uncacheable.bits());
        // A variable range claiming the same region must lose.
        raw.variable[0] = variable(0x0, 0x10_0000, MemoryType::WriteBack);

        let mtrr = MtrrDescriptor::from_snapshot(raw);
        assert_eq!(mtrr.memory_type(0x10000), MemoryType::WriteThrough);
        assert_eq!(mtrr.memory_type(0x1FFFF), MemoryType::WriteThrough);
        assert_eq!(mtrr.memory_type(0xF8000), MemoryType::Uncacheable);
        assert_eq!(mtrr.memory_type(0x20000), MemoryType::Uncacheable); // fixed[0] slot 2 = 0
    }

    #[test]
    fn variable_range_matching_and_precedence() {
        let mut raw = snapshot();
        raw.variable[0] = variable(0x1000_0000, 0x100_0000, MemoryType::WriteBack);
        raw.variable[1] = variable(0x1080_0000, 0x80_0000, MemoryType::WriteThrough);
        raw.variable[2] = variable(0x1090_0000, 0x10_0000, MemoryType::Uncacheable);

        let mtrr = MtrrDescriptor::from_snapshot(raw);
        // Only the WB range covers this address.
        assert_eq!(mtrr.memory_type(0x1000_0000), MemoryType::WriteBack);
        // WT overlaps WB: WT wins.
        assert_eq!(mtrr.memory_type(0x1080_0000), MemoryType::WriteThrough);
        // UC overlaps both: UC wins.
        assert_eq!(mtrr.memory_type(0x1090_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn undefined_encodings_degrade_to_uncacheable() {
        assert_eq!(MemoryType::from_bits(2), MemoryType::Uncacheable);
        assert_eq!(MemoryType::from_bits(3), MemoryType::Uncacheable);
        assert_eq!(MemoryType::from_bits(7), MemoryType::Uncacheable);
    }
}
