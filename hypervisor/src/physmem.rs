//! Snapshot of the machine's physical RAM layout.
//!
//! Queried from the OS once at start and immutable afterwards; the EPT
//! identity map is built from it and the gaps between ranges are what must
//! stay uncacheable (MMIO, reserved regions).

use {crate::error::HypervisorError, crate::platform, log::trace};

/// Upper bound on the number of RAM ranges we track. Physical memory maps
/// on real machines stay well below this.
pub const MAX_RANGES: usize = 32;

/// One `[begin, end)` physical RAM range, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalMemoryRange {
    begin: u64,
    end: u64,
}

impl PhysicalMemoryRange {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub const fn begin(&self) -> u64 {
        self.begin
    }

    pub const fn end(&self) -> u64 {
        self.end
    }

    pub const fn size(&self) -> u64 {
        self.end - self.begin
    }

    pub const fn contains(&self, pa: u64) -> bool {
        pa >= self.begin && pa < self.end
    }
}

/// Ordered, non-overlapping, ascending list of all physical RAM ranges.
#[derive(Debug, Clone)]
pub struct PhysicalMemoryDescriptor {
    ranges: [PhysicalMemoryRange; MAX_RANGES],
    count: usize,
}

impl PhysicalMemoryDescriptor {
    /// Queries the OS for the physical memory map and validates it.
    pub fn snapshot() -> Result<Self, HypervisorError> {
        let ops = platform::try_ops().ok_or(HypervisorError::PlatformNotInitialized)?;

        let mut ranges = [PhysicalMemoryRange::default(); MAX_RANGES];
        let count = (ops.query_physical_memory_ranges)(&mut ranges);

        if count == 0 {
            return Err(HypervisorError::PhysicalMemoryQueryFailed);
        }

        if count > MAX_RANGES {
            return Err(HypervisorError::TooManyPhysicalMemoryRanges);
        }

        let descriptor = Self { ranges, count };
        descriptor.validate()?;

        trace!(
            "physical memory: {} ranges, {} MB total, top at {:#x}",
            descriptor.count,
            descriptor.total_bytes() / (1024 * 1024),
            descriptor.highest_pa()
        );

        Ok(descriptor)
    }

    /// Builds a descriptor from a caller-supplied range list.
    pub fn from_ranges(list: &[PhysicalMemoryRange]) -> Result<Self, HypervisorError> {
        if list.is_empty() {
            return Err(HypervisorError::PhysicalMemoryQueryFailed);
        }

        if list.len() > MAX_RANGES {
            return Err(HypervisorError::TooManyPhysicalMemoryRanges);
        }

        let mut ranges = [PhysicalMemoryRange::default(); MAX_RANGES];
        ranges[..list.len()].copy_from_slice(list);

        let descriptor = Self { ranges, count: list.len() };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), HypervisorError> {
        let mut previous_end = 0;

        for range in self.ranges() {
            if range.end <= range.begin || range.begin < previous_end {
                return Err(HypervisorError::InvalidArgument);
            }
            previous_end = range.end;
        }

        Ok(())
    }

    pub fn ranges(&self) -> &[PhysicalMemoryRange] {
        &self.ranges[..self.count]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sum of all RAM range sizes in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.ranges().iter().map(PhysicalMemoryRange::size).sum()
    }

    /// One past the highest physical RAM byte.
    pub fn highest_pa(&self) -> u64 {
        self.ranges().last().map_or(0, PhysicalMemoryRange::end)
    }

    /// Whether `pa` falls inside any RAM range.
    pub fn contains(&self, pa: u64) -> bool {
        self.ranges().iter().any(|range| range.contains(pa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_and_inversion() {
        let overlapping = [
            PhysicalMemoryRange::new(0x1000, 0x5000),
            PhysicalMemoryRange::new(0x4000, 0x8000),
        ];
        assert_eq!(
            PhysicalMemoryDescriptor::from_ranges(&overlapping).unwrap_err(),
            HypervisorError::InvalidArgument
        );

        let inverted = [PhysicalMemoryRange::new(0x5000, 0x1000)];
        assert!(PhysicalMemoryDescriptor::from_ranges(&inverted).is_err());
    }

    #[test]
    fn queries_and_totals() {
        let ranges = [
            PhysicalMemoryRange::new(0x1000, 0x9F000),
            PhysicalMemoryRange::new(0x100000, 0x8000000),
        ];
        let descriptor = PhysicalMemoryDescriptor::from_ranges(&ranges).unwrap();

        assert_eq!(descriptor.count(), 2);
        assert_eq!(descriptor.highest_pa(), 0x8000000);
        assert_eq!(descriptor.total_bytes(), 0x9E000 + 0x7F00000);
        assert!(descriptor.contains(0x2000));
        assert!(!descriptor.contains(0xA0000));
    }
}
