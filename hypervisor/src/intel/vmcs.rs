//! The VMCS region and its three field families: guest state, host state
//! and the VM-execution controls.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! - 25.4 GUEST-STATE AREA
//! - 25.5 HOST-STATE AREA
//! - 25.6 VM-EXECUTION CONTROL FIELDS

use {
    crate::intel::{
        capture::GuestRegisters,
        descriptor::{gdt_slice, SegmentDescriptor},
        support::{cr0, cr3, cr4, rdmsr, read_dr, sgdt, sidt, vmwrite},
        vmxon::Vmxon,
    },
    bit_field::BitField,
    derivative::Derivative,
    log::trace,
    static_assertions::const_assert_eq,
    x86::{
        current::paging::BASE_PAGE_SIZE,
        dtables,
        msr::{
            self, IA32_EFER, IA32_FS_BASE, IA32_GS_BASE, IA32_SYSENTER_CS, IA32_SYSENTER_EIP,
            IA32_SYSENTER_ESP, IA32_VMX_BASIC,
        },
        segmentation, task,
        vmx::vmcs::{
            control,
            control::{EntryControls, ExitControls, PrimaryControls, SecondaryControls},
            guest, host,
        },
    },
};

/// The VPID every VCPU runs with. Zero is reserved for VMX root.
pub const VPID_TAG: u16 = 1;

/// Selectors in host state must carry no RPL and no TI.
const HOST_SELECTOR_MASK: u16 = 0xF8;

/// The VMCS region: revision identifier, abort indicator, then
/// implementation-specific data the CPU owns.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's
/// Manual: 25.2 FORMAT OF THE VMCS REGION
#[derive(Derivative)]
#[derivative(Debug)]
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    #[derivative(Debug = "ignore")]
    pub data: [u8; BASE_PAGE_SIZE - 8],
}

const_assert_eq!(core::mem::size_of::<Vmcs>(), BASE_PAGE_SIZE);

/// Everything the VMCS population needs besides the captured guest
/// registers.
#[derive(Debug, Clone, Copy)]
pub struct VmcsConfig {
    pub eptp: u64,
    pub msr_bitmap_pa: u64,
    pub io_bitmap_a_pa: u64,
    pub io_bitmap_b_pa: u64,
    pub host_rsp: u64,
    pub host_rip: u64,
    pub kernel_cr3: u64,
    /// What the guest believes CR0 is; shown through the read shadow.
    pub cr0_shadow: u64,
    /// What the guest believes CR4 is: the pre-virtualization value, so
    /// CR4.VMXE stays invisible.
    pub cr4_shadow: u64,
    /// Exit on every I/O port access instead of consulting the bitmaps.
    pub unconditional_io_exiting: bool,
    /// Consult the I/O bitmaps; mutually exclusive with the above.
    pub use_io_bitmaps: bool,
}

impl Vmcs {
    /// Stamps the revision identifier.
    pub fn init(&mut self) {
        self.revision_id = Vmxon::vmcs_revision_id();
        self.revision_id.set_bit(31, false);
    }

    /// Writes the guest-state area from the captured register snapshot of
    /// the processor being virtualized.
    #[rustfmt::skip]
    pub fn setup_guest_registers_state(registers: &GuestRegisters) {
        let gdtr = sgdt();
        let mut idtr = dtables::DescriptorTablePointer::<u64>::default();
        unsafe { dtables::sidt(&mut idtr) };

        let gdt = gdt_slice(&gdtr);

        let cs = segmentation::cs();
        let ss = segmentation::ss();
        let ds = segmentation::ds();
        let es = segmentation::es();
        let fs = segmentation::fs();
        let gs = segmentation::gs();
        let tr = unsafe { task::tr() };
        let ldtr = unsafe { dtables::ldtr() };

        let cs_descriptor = SegmentDescriptor::from_selector(gdt, cs, false);
        let ss_descriptor = SegmentDescriptor::from_selector(gdt, ss, false);
        let ds_descriptor = SegmentDescriptor::from_selector(gdt, ds, false);
        let es_descriptor = SegmentDescriptor::from_selector(gdt, es, false);
        let fs_descriptor = SegmentDescriptor::from_selector(gdt, fs, false);
        let gs_descriptor = SegmentDescriptor::from_selector(gdt, gs, false);
        let tr_descriptor = SegmentDescriptor::from_selector(gdt, tr, true);
        let ldtr_descriptor = SegmentDescriptor::from_selector(gdt, ldtr, true);

        // Control and debug registers.
        vmwrite(guest::CR0, cr0());
        vmwrite(guest::CR3, cr3());
        vmwrite(guest::CR4, cr4());
        vmwrite(guest::DR7, read_dr(7));

        // The captured thread context becomes the initial guest context.
        vmwrite(guest::RSP, registers.rsp);
        vmwrite(guest::RIP, registers.rip);
        vmwrite(guest::RFLAGS, registers.rflags);

        // Segment selectors.
        vmwrite(guest::CS_SELECTOR, cs.bits());
        vmwrite(guest::SS_SELECTOR, ss.bits());
        vmwrite(guest::DS_SELECTOR, ds.bits());
        vmwrite(guest::ES_SELECTOR, es.bits());
        vmwrite(guest::FS_SELECTOR, fs.bits());
        vmwrite(guest::GS_SELECTOR, gs.bits());
        vmwrite(guest::TR_SELECTOR, tr.bits());
        vmwrite(guest::LDTR_SELECTOR, ldtr.bits());

        // Segment bases.
        vmwrite(guest::CS_BASE, cs_descriptor.base);
        vmwrite(guest::SS_BASE, ss_descriptor.base);
        vmwrite(guest::DS_BASE, ds_descriptor.base);
        vmwrite(guest::ES_BASE, es_descriptor.base);
        vmwrite(guest::FS_BASE, rdmsr(IA32_FS_BASE));
        vmwrite(guest::GS_BASE, rdmsr(IA32_GS_BASE));
        vmwrite(guest::TR_BASE, tr_descriptor.base);
        vmwrite(guest::LDTR_BASE, ldtr_descriptor.base);

        // Segment limits.
        vmwrite(guest::CS_LIMIT, cs_descriptor.limit);
        vmwrite(guest::SS_LIMIT, ss_descriptor.limit);
        vmwrite(guest::DS_LIMIT, ds_descriptor.limit);
        vmwrite(guest::ES_LIMIT, es_descriptor.limit);
        vmwrite(guest::FS_LIMIT, fs_descriptor.limit);
        vmwrite(guest::GS_LIMIT, gs_descriptor.limit);
        vmwrite(guest::TR_LIMIT, tr_descriptor.limit);
        vmwrite(guest::LDTR_LIMIT, ldtr_descriptor.limit);

        // Segment access rights.
        vmwrite(guest::CS_ACCESS_RIGHTS, cs_descriptor.access_rights);
        vmwrite(guest::SS_ACCESS_RIGHTS, ss_descriptor.access_rights);
        vmwrite(guest::DS_ACCESS_RIGHTS, ds_descriptor.access_rights);
        vmwrite(guest::ES_ACCESS_RIGHTS, es_descriptor.access_rights);
        vmwrite(guest::FS_ACCESS_RIGHTS, fs_descriptor.access_rights);
        vmwrite(guest::GS_ACCESS_RIGHTS, gs_descriptor.access_rights);
        vmwrite(guest::TR_ACCESS_RIGHTS, tr_descriptor.access_rights);
        vmwrite(guest::LDTR_ACCESS_RIGHTS, ldtr_descriptor.access_rights);

        // Descriptor tables.
        vmwrite(guest::GDTR_BASE, gdtr.base as u64);
        vmwrite(guest::GDTR_LIMIT, gdtr.limit);
        vmwrite(guest::IDTR_BASE, idtr.base as u64);
        vmwrite(guest::IDTR_LIMIT, idtr.limit);

        // MSR state carried through VM entries and exits.
        vmwrite(guest::IA32_DEBUGCTL_FULL, rdmsr(msr::IA32_DEBUGCTL));
        vmwrite(guest::IA32_SYSENTER_CS, rdmsr(IA32_SYSENTER_CS));
        vmwrite(guest::IA32_SYSENTER_ESP, rdmsr(IA32_SYSENTER_ESP));
        vmwrite(guest::IA32_SYSENTER_EIP, rdmsr(IA32_SYSENTER_EIP));
        vmwrite(guest::IA32_EFER_FULL, rdmsr(IA32_EFER));
        vmwrite(guest::LINK_PTR_FULL, u64::MAX);

        trace!("guest state initialized");
    }

    /// Writes the host-state area: identical to the guest except for
    /// RIP/RSP, which point at the VM-exit trampoline and the per-VCPU
    /// host stack, and CR3, which pins the kernel address space.
    #[rustfmt::skip]
    pub fn setup_host_registers_state(config: &VmcsConfig) {
        let gdtr = sgdt();
        let idtr = sidt();
        let gdt = gdt_slice(&gdtr);

        let tr = unsafe { task::tr() };
        let tr_descriptor = SegmentDescriptor::from_selector(gdt, tr, true);

        vmwrite(host::CR0, cr0());
        vmwrite(host::CR3, config.kernel_cr3);
        vmwrite(host::CR4, cr4());

        vmwrite(host::RSP, config.host_rsp);
        vmwrite(host::RIP, config.host_rip);

        vmwrite(host::CS_SELECTOR, segmentation::cs().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::SS_SELECTOR, segmentation::ss().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::DS_SELECTOR, segmentation::ds().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::ES_SELECTOR, segmentation::es().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::FS_SELECTOR, segmentation::fs().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::GS_SELECTOR, segmentation::gs().bits() & HOST_SELECTOR_MASK);
        vmwrite(host::TR_SELECTOR, tr.bits() & HOST_SELECTOR_MASK);

        vmwrite(host::FS_BASE, rdmsr(IA32_FS_BASE));
        vmwrite(host::GS_BASE, rdmsr(IA32_GS_BASE));
        vmwrite(host::TR_BASE, tr_descriptor.base);
        vmwrite(host::GDTR_BASE, gdtr.base as u64);
        vmwrite(host::IDTR_BASE, idtr.base as u64);

        vmwrite(host::IA32_SYSENTER_CS, rdmsr(IA32_SYSENTER_CS));
        vmwrite(host::IA32_SYSENTER_ESP, rdmsr(IA32_SYSENTER_ESP));
        vmwrite(host::IA32_SYSENTER_EIP, rdmsr(IA32_SYSENTER_EIP));
        vmwrite(host::IA32_EFER_FULL, rdmsr(IA32_EFER));

        trace!("host state initialized");
    }

    /// Writes the execution, entry and exit controls, EPTP, VPID, bitmap
    /// pointers and the control-register shadows.
    #[rustfmt::skip]
    pub fn setup_vmcs_control_fields(config: &VmcsConfig) {
        let mut primary = PrimaryControls::SECONDARY_CONTROLS.bits()
            | PrimaryControls::USE_MSR_BITMAPS.bits();

        if config.unconditional_io_exiting {
            primary |= PrimaryControls::UNCOND_IO_EXITING.bits();
        } else if config.use_io_bitmaps {
            primary |= PrimaryControls::USE_IO_BITMAPS.bits();
        }

        let secondary = SecondaryControls::ENABLE_EPT.bits()
            | SecondaryControls::ENABLE_VPID.bits()
            | SecondaryControls::ENABLE_RDTSCP.bits()
            | SecondaryControls::ENABLE_INVPCID.bits()
            | SecondaryControls::ENABLE_XSAVES_XRSTORS.bits();

        let entry = EntryControls::IA32E_MODE_GUEST.bits()
            | EntryControls::LOAD_IA32_EFER.bits();

        let exit = ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()
            | ExitControls::SAVE_IA32_EFER.bits()
            | ExitControls::LOAD_IA32_EFER.bits();

        vmwrite(control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::PinBased, 0));
        vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased, u64::from(primary)));
        vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased2, u64::from(secondary)));
        vmwrite(control::VMENTRY_CONTROLS, adjust_vmx_controls(VmxControl::VmEntry, u64::from(entry)));
        vmwrite(control::VMEXIT_CONTROLS, adjust_vmx_controls(VmxControl::VmExit, u64::from(exit)));

        vmwrite(control::EPTP_FULL, config.eptp);
        vmwrite(control::VPID, VPID_TAG);

        vmwrite(control::MSR_BITMAPS_ADDR_FULL, config.msr_bitmap_pa);
        vmwrite(control::IO_BITMAP_A_ADDR_FULL, config.io_bitmap_a_pa);
        vmwrite(control::IO_BITMAP_B_ADDR_FULL, config.io_bitmap_b_pa);

        vmwrite(control::EXCEPTION_BITMAP, 0u64);

        // CR4.VMXE belongs to the host; reads land in the shadow, writes
        // from the guest exit. Everything else stays guest-owned.
        vmwrite(control::CR0_GUEST_HOST_MASK, 0u64);
        vmwrite(control::CR4_GUEST_HOST_MASK, crate::intel::vmxon::CR4_VMX_ENABLE);
        vmwrite(control::CR0_READ_SHADOW, config.cr0_shadow);
        vmwrite(control::CR4_READ_SHADOW, config.cr4_shadow);

        trace!("control fields initialized");
    }
}

/// The adjustable VMX control families.
#[derive(Debug, Clone, Copy)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Applies the allowed-0/allowed-1 capability masks to a requested control
/// value, preferring the TRUE capability MSRs when the processor reports
/// them in IA32_VMX_BASIC[55].
pub fn adjust_vmx_controls(control: VmxControl, requested_value: u64) -> u64 {
    const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

    let true_controls_supported = rdmsr(IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0;

    let capability_msr = match (control, true_controls_supported) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        // No TRUE variant exists for the secondary controls.
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = rdmsr(capability_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;

    let mut effective = requested_value as u32;
    effective |= allowed0;
    effective &= allowed1;
    u64::from(effective)
}
