//! The OS abstraction layer.
//!
//! The hypervisor core never talks to the host OS directly; the embedding
//! driver installs a [`PlatformOps`] table once, before
//! [`crate::Hypervisor::start`], and everything the core needs from the OS
//! flows through it. All callbacks must be callable at the interrupt
//! priority of a synchronized cross-processor broadcast, except the
//! allocation pair which is only used from the start/stop paths.

use {crate::physmem::PhysicalMemoryRange, core::ffi::c_void, spin::Once};

/// Services the embedding driver must provide.
#[derive(Clone, Copy)]
pub struct PlatformOps {
    /// Allocates `bytes` of physically contiguous, page-aligned, non-paged
    /// memory. Returns a null pointer on failure.
    pub alloc_contiguous: fn(bytes: usize) -> *mut u8,

    /// Releases memory obtained from `alloc_contiguous`.
    pub free_contiguous: fn(ptr: *mut u8, bytes: usize),

    /// Translates a kernel virtual address to a physical address.
    pub pa_from_va: fn(va: *const c_void) -> u64,

    /// Translates a physical address to a kernel virtual address.
    pub va_from_pa: fn(pa: u64) -> *mut c_void,

    /// Fills `ranges` with the ascending, non-overlapping physical RAM
    /// ranges of the machine and returns how many were written. Zero means
    /// the query failed.
    pub query_physical_memory_ranges: fn(ranges: &mut [PhysicalMemoryRange]) -> usize,

    /// Number of logical processors in the system.
    pub processor_count: fn() -> u32,

    /// Index of the logical processor the caller is running on.
    pub current_processor: fn() -> u32,

    /// Runs `callback(context)` on every logical processor, with interrupts
    /// disabled and all processors synchronized on completion. Returns
    /// `false` if the broadcast could not be issued.
    pub run_on_all_processors: fn(callback: fn(*mut c_void), context: *mut c_void) -> bool,

    /// The CR3 of the kernel address space, used as the VM-exit host CR3 so
    /// the exit handlers never run on a page-table hierarchy that can be
    /// torn down under them.
    pub kernel_cr3: fn() -> u64,

    /// Busy-waits or sleeps for the given number of milliseconds.
    pub stall: fn(milliseconds: u64),

    /// Writes one pre-formatted log line. Must be safe at high IRQL.
    pub log_write: fn(line: &str),

    /// Whether a kernel debugger is attached.
    pub debugger_present: fn() -> bool,
}

static PLATFORM: Once<PlatformOps> = Once::new();

/// Installs the platform table. Subsequent calls are ignored.
pub fn init(ops: PlatformOps) {
    PLATFORM.call_once(|| ops);
}

/// Returns the installed platform table, if any.
pub fn try_ops() -> Option<&'static PlatformOps> {
    PLATFORM.get()
}

/// Returns the installed platform table.
///
/// # Panics
///
/// Panics if [`init`] has not been called; this is a driver bug caught at
/// the first use, not a runtime condition.
pub fn ops() -> &'static PlatformOps {
    PLATFORM.get().expect("platform layer is not initialized")
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A hosted stand-in for the driver: identity address translation and
    //! allocations from the test process heap.

    use {super::*, crate::physmem::PhysicalMemoryRange};

    fn alloc_contiguous(bytes: usize) -> *mut u8 {
        let layout = core::alloc::Layout::from_size_align(bytes, 4096).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    fn free_contiguous(ptr: *mut u8, bytes: usize) {
        let layout = core::alloc::Layout::from_size_align(bytes, 4096).unwrap();
        unsafe { std::alloc::dealloc(ptr, layout) }
    }

    fn pa_from_va(va: *const c_void) -> u64 {
        va as u64
    }

    fn va_from_pa(pa: u64) -> *mut c_void {
        pa as *mut c_void
    }

    fn query_physical_memory_ranges(ranges: &mut [PhysicalMemoryRange]) -> usize {
        if ranges.len() < 2 {
            return 0;
        }
        ranges[0] = PhysicalMemoryRange::new(0x0000_1000, 0x0009_F000);
        ranges[1] = PhysicalMemoryRange::new(0x0010_0000, 0x0800_0000);
        2
    }

    fn run_on_all_processors(callback: fn(*mut c_void), context: *mut c_void) -> bool {
        callback(context);
        true
    }

    pub fn ops() -> PlatformOps {
        PlatformOps {
            alloc_contiguous,
            free_contiguous,
            pa_from_va,
            va_from_pa,
            query_physical_memory_ranges,
            processor_count: || 1,
            current_processor: || 0,
            run_on_all_processors,
            kernel_cr3: || 0x1000,
            stall: |_| {},
            log_write: |line| println!("{line}"),
            debugger_present: || false,
        }
    }

    /// Installs the hosted platform table for unit tests.
    pub fn init() {
        super::init(ops());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_query() {
        test_support::init();
        let ops = ops();
        assert_eq!((ops.processor_count)(), 1);
        assert!(!(ops.debugger_present)());
    }
}
