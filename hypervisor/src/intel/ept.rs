//! The Extended Page Tables engine.
//!
//! Builds a 4-level EPT hierarchy that identity-maps host physical memory
//! with 2MB large pages, each leaf carrying the memory type the MTRRs
//! dictate for it. Large pages can be split into 4KB page tables on demand
//! (and joined back) so individual pages can get split permissions, which
//! is what the stealth-hook machinery rides on.
//!
//! All table pages come from the memory manager arena and are released
//! with it; the engine itself never calls the OS. After any modification
//! the caller owns invalidation: nothing here issues INVEPT, and callers
//! sharing one EPT across processors must broadcast it themselves.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use {
    crate::{
        error::HypervisorError,
        intel::mtrr::{MemoryType, MtrrDescriptor},
        mm::MemoryManager,
        physmem::PhysicalMemoryDescriptor,
    },
    bitfield::bitfield,
    bitflags::bitflags,
    core::ffi::c_void,
    core::ptr::NonNull,
    log::trace,
    x86::current::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Identity-map at least the low 4GB so MMIO between and above the RAM
/// ranges keeps responding like bare metal.
const IDENTITY_MAP_FLOOR: u64 = 4 * 1024 * 1024 * 1024;

bitflags! {
    /// EPT access permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitfield! {
    /// An EPT entry at any level of the hierarchy.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 29-1 through Table 29-6
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Epte(u64);
    impl Debug;
    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub u8, memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub u64, pfn, set_pfn: 51, 12;
}

impl Epte {
    pub fn is_present(self) -> bool {
        self.readable() || self.writable() || self.executable()
    }

    fn set_access(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }

    fn access(self) -> AccessType {
        let mut access = AccessType::empty();
        access.set(AccessType::READ, self.readable());
        access.set(AccessType::WRITE, self.writable());
        access.set(AccessType::EXECUTE, self.executable());
        access
    }
}

bitfield! {
    /// The EPTP value installed into the VMCS.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 25-9. Format of Extended-Page-Table Pointer
    #[derive(Clone, Copy)]
    pub struct EptPointer(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 2, 0;
    pub u8, page_walk_length, set_page_walk_length: 5, 3;
    pub dirty_accessed_enable, set_dirty_accessed_enable: 6;
    pub u64, pfn, set_pfn: 51, 12;
}

/// One 512-entry EPT table; every level shares the layout.
#[repr(C, align(4096))]
pub struct EptTable {
    pub entries: [Epte; 512],
}

const INDEX_MASK: u64 = 0x1FF;

const fn pml4_index(pa: u64) -> usize {
    ((pa >> 39) & INDEX_MASK) as usize
}

const fn pdpt_index(pa: u64) -> usize {
    ((pa >> 30) & INDEX_MASK) as usize
}

const fn pd_index(pa: u64) -> usize {
    ((pa >> 21) & INDEX_MASK) as usize
}

const fn pt_index(pa: u64) -> usize {
    ((pa >> 12) & INDEX_MASK) as usize
}

/// A 4-level EPT hierarchy rooted at one PML4 page.
pub struct Ept {
    pml4: NonNull<EptTable>,
    pml4_pa: u64,
    mtrr: MtrrDescriptor,
}

// Table pages live in the non-paged arena; the raw pointers stay valid for
// the arena's lifetime.
unsafe impl Send for Ept {}
unsafe impl Sync for Ept {}

impl Ept {
    /// Creates an empty hierarchy, snapshotting the MTRRs of the current
    /// processor for every later memory-type decision.
    pub fn new(mm: &MemoryManager) -> Result<Self, HypervisorError> {
        Self::with_mtrr(mm, MtrrDescriptor::capture())
    }

    /// Creates an empty hierarchy over a caller-supplied MTRR snapshot.
    pub fn with_mtrr(mm: &MemoryManager, mtrr: MtrrDescriptor) -> Result<Self, HypervisorError> {
        let pml4 = mm.alloc_page_aligned::<EptTable>()?;
        let pml4_pa = mm.pa_from_va(pml4.as_ptr() as *const c_void);
        Ok(Self { pml4, pml4_pa, mtrr })
    }

    /// Identity-maps every RAM range with RWX 2MB pages typed per the
    /// MTRRs, and everything else up to at least 4GB as uncacheable so
    /// MMIO holes behave exactly as before.
    pub fn build_identity(
        &mut self,
        mm: &MemoryManager,
        physmem: &PhysicalMemoryDescriptor,
    ) -> Result<(), HypervisorError> {
        let top = physmem.highest_pa().next_multiple_of(LARGE_PAGE_SIZE as u64).max(IDENTITY_MAP_FLOOR);

        let mut pa = 0;
        while pa < top {
            let memory_type = if physmem.contains(pa) {
                self.mtrr.memory_type(pa)
            } else {
                MemoryType::Uncacheable
            };

            self.map_2mb(pa, pa, AccessType::READ_WRITE_EXECUTE, memory_type, mm)?;
            pa += LARGE_PAGE_SIZE as u64;
        }

        trace!("identity map built up to {:#x}", top);

        Ok(())
    }

    /// Installs one large-page PD entry.
    fn map_2mb(
        &mut self,
        guest_pa: u64,
        host_pa: u64,
        access: AccessType,
        memory_type: MemoryType,
        mm: &MemoryManager,
    ) -> Result<(), HypervisorError> {
        if guest_pa % LARGE_PAGE_SIZE as u64 != 0 || host_pa % LARGE_PAGE_SIZE as u64 != 0 {
            return Err(HypervisorError::InvalidArgument);
        }

        let pd = self.ensure_pd(guest_pa, mm)?;
        let pde = &mut unsafe { &mut *pd.as_ptr() }.entries[pd_index(guest_pa)];

        pde.set_access(access);
        pde.set_memory_type(memory_type.bits());
        pde.set_large(true);
        pde.set_pfn(host_pa >> 12);

        Ok(())
    }

    /// Maps one 4KB page with the given access; the memory type comes from
    /// the MTRRs of `host_pa`.
    ///
    /// The 2MB region must either be split already or hold no mapping at
    /// all; mapping into an intact large page is refused, callers must
    /// split first.
    pub fn map_4kb(
        &mut self,
        guest_pa: u64,
        host_pa: u64,
        access: AccessType,
        mm: &MemoryManager,
    ) -> Result<(), HypervisorError> {
        let guest_pa = guest_pa & !(BASE_PAGE_SIZE as u64 - 1);
        let host_pa = host_pa & !(BASE_PAGE_SIZE as u64 - 1);

        let pd = self.ensure_pd(guest_pa, mm)?;
        let pde = &mut unsafe { &mut *pd.as_ptr() }.entries[pd_index(guest_pa)];

        if pde.large() {
            return Err(HypervisorError::LargePageNotSplit);
        }

        let pt = if pde.is_present() {
            self.table_at(pde.pfn() << 12, mm)
        } else {
            let pt = mm.alloc_page_aligned::<EptTable>()?;
            let pt_pa = mm.pa_from_va(pt.as_ptr() as *const c_void);
            pde.set_access(AccessType::READ_WRITE_EXECUTE);
            pde.set_pfn(pt_pa >> 12);
            pt
        };

        let pte = &mut unsafe { &mut *pt.as_ptr() }.entries[pt_index(guest_pa)];
        pte.set_access(access);
        pte.set_memory_type(self.mtrr.memory_type(host_pa).bits());
        pte.set_pfn(host_pa >> 12);

        Ok(())
    }

    /// Splits one 2MB large-page mapping into a page table whose 512
    /// entries reproduce it exactly, memory types recomputed per 4KB page.
    /// Splitting an already split region is a no-op.
    pub fn split_2mb_to_4kb(
        &mut self,
        guest_pa: u64,
        host_pa: u64,
        mm: &MemoryManager,
    ) -> Result<(), HypervisorError> {
        if guest_pa % LARGE_PAGE_SIZE as u64 != 0 || host_pa % LARGE_PAGE_SIZE as u64 != 0 {
            return Err(HypervisorError::InvalidArgument);
        }

        let pd = self.ensure_pd(guest_pa, mm)?;
        let pde = &mut unsafe { &mut *pd.as_ptr() }.entries[pd_index(guest_pa)];

        if !pde.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        if !pde.large() {
            // Already split.
            return Ok(());
        }

        let access = pde.access();

        let pt = mm.alloc_page_aligned::<EptTable>()?;
        let pt_pa = mm.pa_from_va(pt.as_ptr() as *const c_void);
        let table = unsafe { &mut *pt.as_ptr() };

        for (i, pte) in table.entries.iter_mut().enumerate() {
            let page_pa = host_pa + (i * BASE_PAGE_SIZE) as u64;
            pte.set_access(access);
            pte.set_memory_type(self.mtrr.memory_type(page_pa).bits());
            pte.set_pfn(page_pa >> 12);
        }

        let mut new_pde = Epte(0);
        new_pde.set_access(AccessType::READ_WRITE_EXECUTE);
        new_pde.set_pfn(pt_pa >> 12);
        *pde = new_pde;

        trace!("split 2MB page at {:#x}", guest_pa);

        Ok(())
    }

    /// The inverse of [`Self::split_2mb_to_4kb`]: drops the page table and
    /// restores one RWX large-page entry typed from the MTRRs. Joining an
    /// unsplit region is a no-op. The PT page goes back to the arena,
    /// where frees don't reclaim; that is the arena's contract.
    pub fn join_4kb_to_2mb(
        &mut self,
        guest_pa: u64,
        host_pa: u64,
        mm: &MemoryManager,
    ) -> Result<(), HypervisorError> {
        if guest_pa % LARGE_PAGE_SIZE as u64 != 0 || host_pa % LARGE_PAGE_SIZE as u64 != 0 {
            return Err(HypervisorError::InvalidArgument);
        }

        let pd = self.ensure_pd(guest_pa, mm)?;
        let pde = &mut unsafe { &mut *pd.as_ptr() }.entries[pd_index(guest_pa)];

        if !pde.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        if pde.large() {
            // Already joined.
            return Ok(());
        }

        let mut new_pde = Epte(0);
        new_pde.set_access(AccessType::READ_WRITE_EXECUTE);
        new_pde.set_memory_type(self.mtrr.memory_type(host_pa).bits());
        new_pde.set_large(true);
        new_pde.set_pfn(host_pa >> 12);
        *pde = new_pde;

        trace!("joined 2MB page at {:#x}", guest_pa);

        Ok(())
    }

    /// Rewrites the access bits of one already-split 4KB mapping.
    pub fn modify_page_permissions(
        &mut self,
        guest_pa: u64,
        access: AccessType,
        mm: &MemoryManager,
    ) -> Result<(), HypervisorError> {
        let pte = self.pte_mut(guest_pa, mm)?;
        pte.set_access(access);
        Ok(())
    }

    /// Walks the hierarchy and returns the host physical address `guest_pa`
    /// translates to.
    pub fn translate(&self, guest_pa: u64, mm: &MemoryManager) -> Result<u64, HypervisorError> {
        let pml4e = unsafe { self.pml4.as_ref() }.entries[pml4_index(guest_pa)];
        if !pml4e.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pdpt = self.table_at(pml4e.pfn() << 12, mm);
        let pdpte = unsafe { pdpt.as_ref() }.entries[pdpt_index(guest_pa)];
        if !pdpte.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pd = self.table_at(pdpte.pfn() << 12, mm);
        let pde = unsafe { pd.as_ref() }.entries[pd_index(guest_pa)];
        if !pde.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        if pde.large() {
            let base = (pde.pfn() << 12) & !(LARGE_PAGE_SIZE as u64 - 1);
            return Ok(base + (guest_pa & (LARGE_PAGE_SIZE as u64 - 1)));
        }

        let pt = self.table_at(pde.pfn() << 12, mm);
        let pte = unsafe { pt.as_ref() }.entries[pt_index(guest_pa)];
        if !pte.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        Ok((pte.pfn() << 12) + (guest_pa & (BASE_PAGE_SIZE as u64 - 1)))
    }

    /// The leaf entry covering `guest_pa`, whatever its level.
    pub fn leaf(&self, guest_pa: u64, mm: &MemoryManager) -> Result<Epte, HypervisorError> {
        let pml4e = unsafe { self.pml4.as_ref() }.entries[pml4_index(guest_pa)];
        if !pml4e.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pdpt = self.table_at(pml4e.pfn() << 12, mm);
        let pdpte = unsafe { pdpt.as_ref() }.entries[pdpt_index(guest_pa)];
        if !pdpte.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pd = self.table_at(pdpte.pfn() << 12, mm);
        let pde = unsafe { pd.as_ref() }.entries[pd_index(guest_pa)];
        if !pde.is_present() || pde.large() {
            return Ok(pde);
        }

        let pt = self.table_at(pde.pfn() << 12, mm);
        Ok(unsafe { pt.as_ref() }.entries[pt_index(guest_pa)])
    }

    /// The raw PD entry covering `guest_pa`.
    pub fn pd_entry(&self, guest_pa: u64, mm: &MemoryManager) -> Result<Epte, HypervisorError> {
        let pml4e = unsafe { self.pml4.as_ref() }.entries[pml4_index(guest_pa)];
        if !pml4e.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pdpt = self.table_at(pml4e.pfn() << 12, mm);
        let pdpte = unsafe { pdpt.as_ref() }.entries[pdpt_index(guest_pa)];
        if !pdpte.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        let pd = self.table_at(pdpte.pfn() << 12, mm);
        Ok(unsafe { pd.as_ref() }.entries[pd_index(guest_pa)])
    }

    /// The EPTP value for the VMCS: this PML4, 4-level walk, write-back
    /// paging-structure accesses, no accessed/dirty accounting.
    pub fn ept_pointer(&self) -> u64 {
        let mut eptp = EptPointer(0);
        eptp.set_memory_type(MemoryType::WriteBack.bits());
        eptp.set_page_walk_length(3);
        eptp.set_dirty_accessed_enable(false);
        eptp.set_pfn(self.pml4_pa >> 12);
        eptp.0
    }

    /// Walks to the PD covering `guest_pa`, allocating the PML4E/PDPTE
    /// levels on demand.
    fn ensure_pd(&mut self, guest_pa: u64, mm: &MemoryManager) -> Result<NonNull<EptTable>, HypervisorError> {
        let pml4e = &mut unsafe { &mut *self.pml4.as_ptr() }.entries[pml4_index(guest_pa)];
        let pdpt = if pml4e.is_present() {
            self.table_at(pml4e.pfn() << 12, mm)
        } else {
            let pdpt = mm.alloc_page_aligned::<EptTable>()?;
            let pdpt_pa = mm.pa_from_va(pdpt.as_ptr() as *const c_void);
            pml4e.set_access(AccessType::READ_WRITE_EXECUTE);
            pml4e.set_pfn(pdpt_pa >> 12);
            pdpt
        };

        let pdpte = &mut unsafe { &mut *pdpt.as_ptr() }.entries[pdpt_index(guest_pa)];
        let pd = if pdpte.is_present() {
            self.table_at(pdpte.pfn() << 12, mm)
        } else {
            let pd = mm.alloc_page_aligned::<EptTable>()?;
            let pd_pa = mm.pa_from_va(pd.as_ptr() as *const c_void);
            pdpte.set_access(AccessType::READ_WRITE_EXECUTE);
            pdpte.set_pfn(pd_pa >> 12);
            pd
        };

        Ok(pd)
    }

    fn pte_mut<'a>(&'a mut self, guest_pa: u64, mm: &MemoryManager) -> Result<&'a mut Epte, HypervisorError> {
        let pd = self.ensure_pd(guest_pa, mm)?;
        let pde = unsafe { &*pd.as_ptr() }.entries[pd_index(guest_pa)];

        if !pde.is_present() {
            return Err(HypervisorError::PageNotMapped);
        }

        if pde.large() {
            return Err(HypervisorError::LargePageNotSplit);
        }

        let pt = self.table_at(pde.pfn() << 12, mm);
        Ok(&mut unsafe { &mut *pt.as_ptr() }.entries[pt_index(guest_pa)])
    }

    fn table_at(&self, pa: u64, mm: &MemoryManager) -> NonNull<EptTable> {
        // Table pages always come from the arena, so the translation is the
        // O(1) in-arena path and never null.
        unsafe { NonNull::new_unchecked(mm.va_from_pa(pa).cast()) }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::mtrr::{MtrrSnapshot, MAX_VARIABLE_RANGES},
            physmem::PhysicalMemoryRange,
        },
    };

    const MB: u64 = 1024 * 1024;

    fn test_arena(pages: usize) -> MemoryManager {
        let capacity = pages * BASE_PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(capacity, BASE_PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        MemoryManager::over(base, base as u64, capacity)
    }

    /// MTRRs enabled, default WB, one UC variable range over 16MB..32MB.
    fn test_mtrr() -> MtrrDescriptor {
        let mut variable = [(0u64, 0u64); MAX_VARIABLE_RANGES];
        variable[0] = (16 * MB, (!(16 * MB - 1) & 0xF_FFFF_F000) | (1 << 11));

        MtrrDescriptor::from_snapshot(MtrrSnapshot {
            capabilities: (1 << 8) | 1,
            def_type: (1 << 11) | (1 << 10) | u64::from(MemoryType::WriteBack.bits()),
            fixed: [0; 11],
            variable,
        })
    }

    fn test_physmem() -> PhysicalMemoryDescriptor {
        PhysicalMemoryDescriptor::from_ranges(&[
            PhysicalMemoryRange::new(0, 64 * MB),
            PhysicalMemoryRange::new(128 * MB, 256 * MB),
        ])
        .unwrap()
    }

    fn identity_ept(mm: &MemoryManager) -> Ept {
        let mut ept = Ept::with_mtrr(mm, test_mtrr()).unwrap();
        ept.build_identity(mm, &test_physmem()).unwrap();
        ept
    }

    #[test]
    fn identity_map_translates_identically() {
        let mm = test_arena(64);
        let ept = identity_ept(&mm);

        for pa in [0u64, 0x1000, 2 * MB + 0x123, 63 * MB, 200 * MB, 3 * 1024 * MB] {
            assert_eq!(ept.translate(pa, &mm).unwrap(), pa, "pa {pa:#x}");
        }
    }

    #[test]
    fn identity_map_honours_mtrr_types() {
        let mm = test_arena(64);
        let ept = identity_ept(&mm);

        // RAM with default type.
        let leaf = ept.leaf(4 * MB, &mm).unwrap();
        assert_eq!(leaf.memory_type(), MemoryType::WriteBack.bits());
        assert!(leaf.large());

        // RAM covered by the UC variable MTRR.
        let leaf = ept.leaf(20 * MB, &mm).unwrap();
        assert_eq!(leaf.memory_type(), MemoryType::Uncacheable.bits());

        // A hole between the RAM ranges must be uncacheable.
        let leaf = ept.leaf(100 * MB, &mm).unwrap();
        assert_eq!(leaf.memory_type(), MemoryType::Uncacheable.bits());
    }

    #[test]
    fn split_then_join_is_bit_identical() {
        let mm = test_arena(64);
        let mut ept = identity_ept(&mm);

        let base = 2 * MB;
        let before = ept.pd_entry(base, &mm).unwrap();

        ept.split_2mb_to_4kb(base, base, &mm).unwrap();
        let split = ept.pd_entry(base, &mm).unwrap();
        assert!(!split.large());
        assert_ne!(split.0, before.0);

        // Idempotent.
        ept.split_2mb_to_4kb(base, base, &mm).unwrap();
        assert_eq!(ept.pd_entry(base, &mm).unwrap().0, split.0);

        ept.join_4kb_to_2mb(base, base, &mm).unwrap();
        let after = ept.pd_entry(base, &mm).unwrap();
        assert_eq!(after.0, before.0);

        // Idempotent too.
        ept.join_4kb_to_2mb(base, base, &mm).unwrap();
        assert_eq!(ept.pd_entry(base, &mm).unwrap().0, before.0);
    }

    #[test]
    fn split_preserves_translation_and_types() {
        let mm = test_arena(64);
        let mut ept = identity_ept(&mm);

        // This large page straddles the UC variable range boundary at 16MB
        // only in type, not in translation.
        let base = 16 * MB;
        ept.split_2mb_to_4kb(base, base, &mm).unwrap();

        for offset in [0u64, 0x1000, 0x5000, LARGE_PAGE_SIZE as u64 - 0x1000] {
            let pa = base + offset;
            assert_eq!(ept.translate(pa, &mm).unwrap(), pa);
            let leaf = ept.leaf(pa, &mm).unwrap();
            assert!(!leaf.large());
            assert_eq!(leaf.memory_type(), MemoryType::Uncacheable.bits());
            assert_eq!(leaf.access(), AccessType::READ_WRITE_EXECUTE);
        }
    }

    #[test]
    fn map_4kb_requires_a_split() {
        let mm = test_arena(64);
        let mut ept = identity_ept(&mm);

        let page = 6 * MB + 0x3000;
        assert_eq!(
            ept.map_4kb(page, page, AccessType::EXECUTE, &mm).unwrap_err(),
            HypervisorError::LargePageNotSplit
        );

        ept.split_2mb_to_4kb(6 * MB, 6 * MB, &mm).unwrap();
        ept.map_4kb(page, page, AccessType::EXECUTE, &mm).unwrap();

        let leaf = ept.leaf(page, &mm).unwrap();
        assert_eq!(leaf.access(), AccessType::EXECUTE);

        // Remap the page somewhere else, the hook pattern.
        let shadow = 7 * MB;
        ept.map_4kb(page, shadow, AccessType::READ_WRITE, &mm).unwrap();
        assert_eq!(ept.translate(page, &mm).unwrap(), shadow + 0x0);
    }

    #[test]
    fn map_4kb_into_unmapped_space_builds_the_hierarchy() {
        let mm = test_arena(64);
        let mut ept = Ept::with_mtrr(&mm, test_mtrr()).unwrap();

        let pa = 512 * 1024 * MB; // far outside anything mapped
        ept.map_4kb(pa, 0x1000, AccessType::READ, &mm).unwrap();
        assert_eq!(ept.translate(pa, &mm).unwrap(), 0x1000);
    }

    #[test]
    fn modify_page_permissions_flips_access_only() {
        let mm = test_arena(64);
        let mut ept = identity_ept(&mm);

        let base = 8 * MB;
        ept.split_2mb_to_4kb(base, base, &mm).unwrap();
        ept.modify_page_permissions(base + 0x2000, AccessType::READ_WRITE, &mm).unwrap();

        let leaf = ept.leaf(base + 0x2000, &mm).unwrap();
        assert_eq!(leaf.access(), AccessType::READ_WRITE);
        assert_eq!(leaf.pfn() << 12, base + 0x2000);

        let untouched = ept.leaf(base + 0x3000, &mm).unwrap();
        assert_eq!(untouched.access(), AccessType::READ_WRITE_EXECUTE);
    }

    #[test]
    fn eptp_encoding() {
        let mm = test_arena(8);
        let ept = Ept::with_mtrr(&mm, test_mtrr()).unwrap();

        let eptp = EptPointer(ept.ept_pointer());
        assert_eq!(eptp.memory_type(), MemoryType::WriteBack.bits());
        assert_eq!(eptp.page_walk_length(), 3);
        assert!(!eptp.dirty_accessed_enable());
        assert_eq!(eptp.pfn() << 12, ept.pml4_pa);
        // Reserved low bits beyond the defined fields stay clear.
        assert_eq!(ept.ept_pointer() & 0xF80, 0);
    }

    #[test]
    fn arena_exhaustion_surfaces_not_enough_memory() {
        let mm = test_arena(2);
        let mut ept = Ept::with_mtrr(&mm, test_mtrr()).unwrap();

        // PML4 consumed one page; the walk below needs three more.
        assert_eq!(
            ept.map_4kb(0, 0, AccessType::READ, &mm).unwrap_err(),
            HypervisorError::NotEnoughMemory
        );
    }
}
