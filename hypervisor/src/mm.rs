//! The memory manager: one bump arena for every VMX structure.
//!
//! The arena is carved out of a single physically contiguous, non-paged OS
//! allocation made at start. Individual frees are no-ops; the whole arena is
//! returned to the OS in one piece at stop. VMXON/VMCS regions, EPT tables,
//! bitmaps and host stacks must never be paged out and a bump arena cannot
//! fragment, so this is all the allocator the hypervisor needs. Runtime
//! allocations (EPT splits from inside a VM-exit) are safe because the
//! bump pointer is guarded by a spinlock held for microseconds and the
//! backing pages are wired.

use {
    crate::{error::HypervisorError, platform},
    core::{
        ffi::c_void,
        mem::{align_of, size_of},
        ptr::NonNull,
        sync::atomic::{AtomicPtr, Ordering},
    },
    log::{debug, trace},
    spin::Mutex,
    x86::current::paging::BASE_PAGE_SIZE,
};

const ARENA_MAGIC: u64 = 0x7070_7668_0a0a_0a0a;

/// Bookkeeping carved off the front of the arena allocation.
#[repr(C)]
struct ArenaHeader {
    magic: u64,
    capacity: usize,
}

/// A bump arena over one contiguous, page-aligned, non-paged allocation.
pub struct MemoryManager {
    base: *mut u8,
    base_pa: u64,
    capacity: usize,
    next: Mutex<usize>,
}

// The raw base pointer never moves and all mutation goes through the lock.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Asks the OS for `pages` contiguous non-paged pages and turns them
    /// into an arena.
    pub fn new(pages: usize) -> Result<Self, HypervisorError> {
        let ops = platform::try_ops().ok_or(HypervisorError::PlatformNotInitialized)?;

        let capacity = pages * BASE_PAGE_SIZE;
        let base = (ops.alloc_contiguous)(capacity);

        if base.is_null() {
            return Err(HypervisorError::NotEnoughMemory);
        }

        let base_pa = (ops.pa_from_va)(base as *const c_void);
        Ok(Self::over(base, base_pa, capacity))
    }

    /// Builds an arena over a caller-provided buffer. The buffer must be
    /// page-aligned and `base_pa` must be its physical address.
    pub fn over(base: *mut u8, base_pa: u64, capacity: usize) -> Self {
        // The header is the only write the arena does outside an allocation.
        let header = base.cast::<ArenaHeader>();
        unsafe {
            (*header).magic = ARENA_MAGIC;
            (*header).capacity = capacity;
        }

        debug!("arena: {} KB at {:#x}", capacity / 1024, base_pa);

        Self {
            base,
            base_pa,
            capacity,
            next: Mutex::new(size_of::<ArenaHeader>().next_multiple_of(16)),
        }
    }

    /// Allocates `bytes` with at least 16-byte alignment.
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, HypervisorError> {
        self.alloc_aligned(bytes, 16)
    }

    /// Allocates `bytes` aligned to `align`, which must be a power of two.
    /// Allocations of page alignment or more always start on a fresh page.
    pub fn alloc_aligned(&self, bytes: usize, align: usize) -> Result<NonNull<u8>, HypervisorError> {
        debug_assert!(align.is_power_of_two());

        let mut next = self.next.lock();

        let offset = next.next_multiple_of(align);
        let end = offset.checked_add(bytes).ok_or(HypervisorError::NotEnoughMemory)?;

        if end > self.capacity {
            return Err(HypervisorError::NotEnoughMemory);
        }

        *next = end;
        drop(next);

        trace!("arena: {} bytes at offset {:#x}", bytes, offset);

        // The OS hands the block out zeroed only on some platforms; make it
        // a guarantee, callers rely on zeroed VMX regions and page tables.
        let ptr = unsafe { self.base.add(offset) };
        unsafe { core::ptr::write_bytes(ptr, 0, bytes) };

        // Freshly-carved arena memory is never null.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Allocates one zeroed, page-aligned `T`. `T` must fit whole pages.
    pub fn alloc_page_aligned<T>(&self) -> Result<NonNull<T>, HypervisorError> {
        let align = align_of::<T>().max(BASE_PAGE_SIZE);
        Ok(self.alloc_aligned(size_of::<T>(), align)?.cast())
    }

    /// Number of bytes handed out so far.
    pub fn used(&self) -> usize {
        *self.next.lock()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn contains_va(&self, va: u64) -> bool {
        let base = self.base as u64;
        va >= base && va < base + self.capacity as u64
    }

    fn contains_pa(&self, pa: u64) -> bool {
        pa >= self.base_pa && pa < self.base_pa + self.capacity as u64
    }

    /// Virtual-to-physical translation: an O(1) offset inside the arena,
    /// the OS translator outside it.
    pub fn pa_from_va(&self, va: *const c_void) -> u64 {
        let va = va as u64;

        if self.contains_va(va) {
            return self.base_pa + (va - self.base as u64);
        }

        (platform::ops().pa_from_va)(va as *const c_void)
    }

    /// Physical-to-virtual translation, same contract as [`Self::pa_from_va`].
    pub fn va_from_pa(&self, pa: u64) -> *mut c_void {
        if self.contains_pa(pa) {
            return unsafe { self.base.add((pa - self.base_pa) as usize) }.cast();
        }

        (platform::ops().va_from_pa)(pa)
    }

    /// Returns the whole arena to the OS. The caller must guarantee nothing
    /// references arena memory anymore.
    pub fn release(&self) {
        (platform::ops().free_contiguous)(self.base, self.capacity);
    }
}

static MANAGER: AtomicPtr<MemoryManager> = AtomicPtr::new(core::ptr::null_mut());

/// Creates the global arena. Fails if one already exists.
pub fn init(pages: usize) -> Result<(), HypervisorError> {
    if !MANAGER.load(Ordering::Acquire).is_null() {
        return Err(HypervisorError::InvalidArgument);
    }

    let manager = alloc::boxed::Box::new(MemoryManager::new(pages)?);
    MANAGER.store(alloc::boxed::Box::into_raw(manager), Ordering::Release);
    Ok(())
}

/// The global arena.
///
/// # Panics
///
/// Panics if called outside a start/stop window; allocation before `start`
/// is a bug in the embedding driver.
pub fn manager() -> &'static MemoryManager {
    let ptr = MANAGER.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "memory manager is not initialized");
    unsafe { &*ptr }
}

/// Tears down the global arena and returns its memory to the OS.
pub fn shutdown() {
    let ptr = MANAGER.swap(core::ptr::null_mut(), Ordering::AcqRel);

    if !ptr.is_null() {
        let manager = unsafe { alloc::boxed::Box::from_raw(ptr) };
        manager.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(pages: usize) -> MemoryManager {
        let capacity = pages * BASE_PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(capacity, BASE_PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        // Pretend physical addresses mirror virtual ones.
        MemoryManager::over(base, base as u64, capacity)
    }

    #[test]
    fn alloc_respects_alignment_modes() {
        let mm = test_arena(8);

        let a = mm.alloc(24).unwrap();
        let b = mm.alloc(24).unwrap();
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert!(b.as_ptr() > a.as_ptr());

        let page = mm.alloc_aligned(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        assert_eq!(page.as_ptr() as usize % BASE_PAGE_SIZE, 0);
    }

    #[test]
    fn alloc_returns_zeroed_memory() {
        let mm = test_arena(4);

        let ptr = mm.alloc_aligned(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        let page = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), BASE_PAGE_SIZE) };
        assert!(page.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn exhaustion_reports_not_enough_memory() {
        let mm = test_arena(2);

        assert!(mm.alloc_aligned(BASE_PAGE_SIZE, BASE_PAGE_SIZE).is_ok());
        assert_eq!(
            mm.alloc_aligned(2 * BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap_err(),
            HypervisorError::NotEnoughMemory
        );
    }

    #[test]
    fn translation_is_an_offset_inside_the_arena() {
        let mm = test_arena(4);

        let ptr = mm.alloc_aligned(BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();
        let pa = mm.pa_from_va(ptr.as_ptr() as *const c_void);
        assert_eq!(mm.va_from_pa(pa) as *mut u8, ptr.as_ptr());
    }
}
