//! The per-processor virtual CPU.
//!
//! Bring-up turns the running logical processor into a guest of itself:
//! the current register state is captured, a VMCS is built describing it,
//! and VMLAUNCH resumes execution at the instruction after the capture,
//! now in VMX non-root operation. Teardown reverses the trick via the
//! 0xFF VMCALL, which disables VMX and re-enters the interrupted code
//! natively.

use {
    crate::{
        chain::{ExitStats, HandlerChain},
        error::HypervisorError,
        intel::{
            bitmap::{IoBitmaps, MsrBitmap},
            capture::{capture_registers, GuestRegisters},
            ept::Ept,
            support::{self, vmread},
            vmcs::{Vmcs, VmcsConfig},
            vmlaunch::{devirtualize_guest, launch_vm, vmexit_stub, HostStackLayout},
            vmxon::Vmxon,
        },
        mm,
        physmem::PhysicalMemoryDescriptor,
        platform,
    },
    core::ffi::c_void,
    log::{debug, error, trace},
    x86::{
        bits64::rflags::RFlags,
        cpuid::cpuid,
        dtables::DescriptorTablePointer,
        vmx::vmcs::{guest, ro},
    },
};

/// Lifecycle of a VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Off,
    Initializing,
    Launched,
    Exiting,
}

/// One virtual CPU, pinned to one logical processor for its whole life.
///
/// Every VMX structure it owns lives in the memory manager arena and is
/// reclaimed with it; `Vcpu` itself is heap-allocated by the facade so its
/// address stays stable, which the host stack's back-pointer relies on.
pub struct Vcpu {
    pub index: u32,
    state: VcpuState,

    vmxon: *mut Vmxon,
    vmxon_pa: u64,
    vmcs: *mut Vmcs,
    vmcs_pa: u64,
    msr_bitmap: *mut MsrBitmap,
    io_bitmaps: *mut IoBitmaps,
    host_stack: *mut HostStackLayout,

    /// This VCPU's second-level translation. Built at bring-up on the
    /// target processor so the MTRR snapshot is its own.
    pub ept: Option<Ept>,
    pub eptp: u64,

    /// Captured at bring-up; the launch stub consumes it.
    pub guest_registers: GuestRegisters,

    /// Set by handlers that need the exiting instruction re-executed.
    pub suppress_rip_adjust: bool,

    /// Exit counters maintained by the stats layer.
    pub stats: ExitStats,

    /// Opaque per-VCPU slot for the topmost handler layer.
    user_data: *mut c_void,

    /// CR4 as it was before VMX was enabled; restored at teardown.
    saved_cr4: u64,

    /// Bits CPUID reports as unsupported in XCR0, for XSETBV validation.
    pub xcr0_unsupported_mask: u64,

    pub chain: &'static HandlerChain,
}

// VCPUs never migrate, but the facade constructs them from the start
// thread before handing each to its processor.
unsafe impl Send for Vcpu {}
unsafe impl Sync for Vcpu {}

impl Vcpu {
    pub fn new(index: u32, chain: &'static HandlerChain) -> Self {
        Self {
            index,
            state: VcpuState::Off,
            vmxon: core::ptr::null_mut(),
            vmxon_pa: 0,
            vmcs: core::ptr::null_mut(),
            vmcs_pa: 0,
            msr_bitmap: core::ptr::null_mut(),
            io_bitmaps: core::ptr::null_mut(),
            host_stack: core::ptr::null_mut(),
            ept: None,
            eptp: 0,
            guest_registers: GuestRegisters::default(),
            suppress_rip_adjust: false,
            stats: ExitStats::new(),
            user_data: core::ptr::null_mut(),
            saved_cr4: 0,
            xcr0_unsupported_mask: 0,
            chain,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Virtualizes the calling processor in place. Must run pinned, with
    /// interrupts disabled; the facade's broadcast guarantees both.
    ///
    /// On success the caller continues as the guest. Failure leaves the
    /// processor exactly as it was.
    pub fn virtualize(
        &mut self,
        physmem: &PhysicalMemoryDescriptor,
        unconditional_io_exiting: bool,
    ) -> Result<(), HypervisorError> {
        if self.state != VcpuState::Off {
            return Err(HypervisorError::InvalidArgument);
        }

        Vmxon::check_supported()?;

        self.state = VcpuState::Initializing;
        self.saved_cr4 = support::cr4();

        self.allocate_structures(physmem)?;

        let mut registers = GuestRegisters::default();
        if unsafe { capture_registers(&mut registers) } {
            // We are the guest, resuming right after a successful launch.
            debug!("processor {} is virtualized", self.index);
            return Ok(());
        }

        // Make the guest's second pass through the branch above report
        // success: RAX holds capture_registers' return value there.
        registers.rax = 1;
        self.guest_registers = registers;

        match self.launch(unconditional_io_exiting) {
            Ok(never) => match never {},
            Err(error) => {
                // Unwind so the processor is untouched.
                error!("processor {} failed to launch: {}", self.index, error);
                let _ = support::vmxoff();
                support::cr4_write(self.saved_cr4);
                self.state = VcpuState::Off;
                Err(error)
            }
        }
    }

    /// Allocates and prepares every per-VCPU structure from the arena.
    fn allocate_structures(&mut self, physmem: &PhysicalMemoryDescriptor) -> Result<(), HypervisorError> {
        let mm = mm::manager();

        trace!("allocating VMX regions for processor {}", self.index);

        self.vmxon = mm.alloc_page_aligned::<Vmxon>()?.as_ptr();
        self.vmxon_pa = mm.pa_from_va(self.vmxon as *const c_void);
        unsafe { (*self.vmxon).init() };

        self.vmcs = mm.alloc_page_aligned::<Vmcs>()?.as_ptr();
        self.vmcs_pa = mm.pa_from_va(self.vmcs as *const c_void);
        unsafe { (*self.vmcs).init() };

        // Zeroed bitmaps: no MSR or I/O exits until a layer asks.
        self.msr_bitmap = mm.alloc_page_aligned::<MsrBitmap>()?.as_ptr();
        self.io_bitmaps = mm.alloc_page_aligned::<IoBitmaps>()?.as_ptr();

        self.host_stack = mm.alloc_page_aligned::<HostStackLayout>()?.as_ptr();
        unsafe { (*self.host_stack).vcpu = self as *mut Self as u64 };

        trace!("building identity EPT for processor {}", self.index);

        let mut ept = Ept::new(mm)?;
        ept.build_identity(mm, physmem)?;
        self.eptp = ept.ept_pointer();
        self.ept = Some(ept);

        let xcr0_capabilities = cpuid!(0x0D, 0x00);
        self.xcr0_unsupported_mask =
            !((u64::from(xcr0_capabilities.edx) << 32) | u64::from(xcr0_capabilities.eax));

        Ok(())
    }

    /// Enters VMX root operation, populates the VMCS and launches. Returns
    /// only on failure; the `Ok` arm is uninhabited.
    fn launch(&mut self, unconditional_io_exiting: bool) -> Result<core::convert::Infallible, HypervisorError> {
        trace!("enabling VMX on processor {}", self.index);

        Vmxon::enable_vmx_operation();
        Vmxon::adjust_feature_control_msr()?;
        Vmxon::set_cr0_bits();
        Vmxon::set_cr4_bits();

        support::vmxon(self.vmxon_pa)?;
        support::vmclear(self.vmcs_pa)?;
        support::vmptrld(self.vmcs_pa)?;

        let mm = mm::manager();
        let config = VmcsConfig {
            eptp: self.eptp,
            msr_bitmap_pa: mm.pa_from_va(self.msr_bitmap as *const c_void),
            io_bitmap_a_pa: mm.pa_from_va(self.io_bitmaps as *const c_void),
            io_bitmap_b_pa: mm.pa_from_va(self.io_bitmaps as *const c_void) + 0x1000,
            host_rsp: unsafe { (*self.host_stack).host_rsp() },
            host_rip: vmexit_stub as usize as u64,
            kernel_cr3: (platform::ops().kernel_cr3)(),
            cr0_shadow: support::cr0(),
            cr4_shadow: self.saved_cr4,
            unconditional_io_exiting,
            use_io_bitmaps: !unconditional_io_exiting,
        };

        Vmcs::setup_guest_registers_state(&self.guest_registers);
        Vmcs::setup_host_registers_state(&config);
        Vmcs::setup_vmcs_control_fields(&config);

        let chain = self.chain;
        chain.run_setup(self)?;

        self.state = VcpuState::Launched;

        trace!("launching processor {}", self.index);
        let flags = unsafe { launch_vm(&self.guest_registers) };

        // Reaching this line means VMLAUNCH itself failed.
        Err(Self::vm_entry_error(RFlags::from_raw(flags)))
    }

    /// Decodes the RFLAGS outcome of a failed VM entry.
    fn vm_entry_error(flags: RFlags) -> HypervisorError {
        if flags.contains(RFlags::FLAGS_ZF) {
            HypervisorError::VmxInstructionError(vmread(ro::VM_INSTRUCTION_ERROR) as u32)
        } else if flags.contains(RFlags::FLAGS_CF) {
            HypervisorError::VmFailInvalid
        } else {
            HypervisorError::VmEntryFailure
        }
    }

    /// Tears virtualization down on this processor and resumes the guest
    /// natively, past the VMCALL that asked for it. Runs on the VM-exit
    /// path; never returns.
    pub fn devirtualize(&mut self, registers: &mut GuestRegisters) -> ! {
        debug!("devirtualizing processor {}", self.index);

        let chain = self.chain;
        chain.run_teardown(self);

        self.state = VcpuState::Exiting;

        // Collect the resume context before the VMCS goes away.
        registers.rip = vmread(guest::RIP) + vmread(ro::VMEXIT_INSTRUCTION_LEN);
        registers.rsp = vmread(guest::RSP);
        registers.rflags = vmread(guest::RFLAGS);

        // Hand the guest back its descriptor tables and address space.
        let gdtr = DescriptorTablePointer::<u64> {
            limit: vmread(guest::GDTR_LIMIT) as u16,
            base: vmread(guest::GDTR_BASE) as *const u64,
        };
        let idtr = DescriptorTablePointer::<u64> {
            limit: vmread(guest::IDTR_LIMIT) as u16,
            base: vmread(guest::IDTR_BASE) as *const u64,
        };
        let guest_cr3 = vmread(guest::CR3);

        let _ = support::vmclear(self.vmcs_pa);
        let _ = support::vmxoff();

        support::lgdt(&gdtr);
        support::lidt(&idtr);
        support::cr3_write(guest_cr3);
        support::cr4_write(self.saved_cr4);

        self.state = VcpuState::Off;

        unsafe { devirtualize_guest(registers) }
    }

    /// Marks an I/O port in this VCPU's bitmaps so accesses exit.
    pub fn trace_io_port(&mut self, port: u16, intercept: bool) {
        if !self.io_bitmaps.is_null() {
            unsafe { (*self.io_bitmaps).set(port, intercept) };
        }
    }

    /// The per-VCPU MSR bitmap, for layers that hook MSRs.
    pub fn msr_bitmap_mut(&mut self) -> Option<&mut MsrBitmap> {
        unsafe { self.msr_bitmap.as_mut() }
    }

    /// Installs the opaque per-VCPU pointer owned by the topmost layer.
    pub fn set_user_data(&mut self, user_data: *mut c_void) {
        self.user_data = user_data;
    }

    pub fn user_data(&self) -> *mut c_void {
        self.user_data
    }
}
