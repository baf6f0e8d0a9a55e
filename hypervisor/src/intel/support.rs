//! Thin, typed wrappers over the instructions the hypervisor core needs.
//!
//! Most wrappers delegate to the `x86` crate; the handful it does not cover
//! (debug registers, `invd`, `xsetbv`, `rdtscp`, `rdpmc`, `invpcid`) are
//! inline assembly. The VMX-class wrappers follow the architectural error
//! contract: success, VMfailInvalid (CF=1) or VMfailValid (ZF=1) carrying
//! the VM-instruction error field. `vmread`/`vmwrite` of valid fields never
//! fail; a failure there is a hypervisor bug and panics.

use {
    crate::error::HypervisorError,
    core::arch::asm,
    x86::{
        controlregs,
        dtables::{self, DescriptorTablePointer},
        vmx::{vmcs::ro, VmFail},
    },
};

/// Maps the RFLAGS-encoded VMX outcome onto the error taxonomy.
fn vmx_result(result: Result<(), VmFail>) -> Result<(), HypervisorError> {
    match result {
        Ok(()) => Ok(()),
        Err(VmFail::VmFailValid) => {
            Err(HypervisorError::VmxInstructionError(vmread(ro::VM_INSTRUCTION_ERROR) as u32))
        }
        Err(VmFail::VmFailInvalid) => Err(HypervisorError::VmFailInvalid),
    }
}

/// Enters VMX root operation with the given VMXON region.
pub fn vmxon(vmxon_region_pa: u64) -> Result<(), HypervisorError> {
    vmx_result(unsafe { x86::bits64::vmx::vmxon(vmxon_region_pa) })
}

/// Leaves VMX root operation.
pub fn vmxoff() -> Result<(), HypervisorError> {
    vmx_result(unsafe { x86::bits64::vmx::vmxoff() })
}

/// Clears the launch state of a VMCS and makes it inactive.
pub fn vmclear(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    vmx_result(unsafe { x86::bits64::vmx::vmclear(vmcs_region_pa) })
}

/// Makes a VMCS active and current.
pub fn vmptrld(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    vmx_result(unsafe { x86::bits64::vmx::vmptrld(vmcs_region_pa) })
}

/// Reads a field from the current VMCS. Valid fields always succeed.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Writes a field of the current VMCS. Valid fields always succeed.
pub fn vmwrite<T: Into<u64>>(field: u32, value: T) {
    unsafe { x86::bits64::vmx::vmwrite(field, value.into()) }.unwrap();
}

/// Issues a VMCALL with the hypercall convention used by this hypervisor:
/// RCX carries the reason, RDX and R8 the arguments.
pub fn vmcall(reason: u64, rdx: u64, r8: u64) -> u64 {
    let result: u64;
    unsafe {
        asm!(
            "vmcall",
            inout("rcx") reason => _,
            in("rdx") rdx,
            in("r8") r8,
            out("rax") result,
            options(nostack),
        );
    }
    result
}

pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) }
}

pub fn cr0() -> u64 {
    unsafe { controlregs::cr0() }.bits() as u64
}

pub fn cr0_write(value: u64) {
    unsafe { controlregs::cr0_write(controlregs::Cr0::from_bits_truncate(value as usize)) }
}

pub fn cr2() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
    value
}

pub fn cr2_write(value: u64) {
    unsafe { asm!("mov cr2, {}", in(reg) value, options(nomem, nostack)) };
}

pub fn cr3() -> u64 {
    unsafe { controlregs::cr3() }
}

pub fn cr3_write(value: u64) {
    unsafe { controlregs::cr3_write(value) }
}

pub fn cr4() -> u64 {
    unsafe { controlregs::cr4() }.bits() as u64
}

pub fn cr4_write(value: u64) {
    unsafe { controlregs::cr4_write(controlregs::Cr4::from_bits_truncate(value as usize)) }
}

/// Reads debug register `index` (0..=7).
pub fn read_dr(index: u8) -> u64 {
    let value: u64;
    unsafe {
        match index {
            0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)),
            1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)),
            2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)),
            3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)),
            4 => asm!("mov {}, dr4", out(reg) value, options(nomem, nostack)),
            5 => asm!("mov {}, dr5", out(reg) value, options(nomem, nostack)),
            6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack)),
            _ => asm!("mov {}, dr7", out(reg) value, options(nomem, nostack)),
        }
    }
    value
}

/// Writes debug register `index` (0..=7).
pub fn write_dr(index: u8, value: u64) {
    unsafe {
        match index {
            0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)),
            1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)),
            2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)),
            3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)),
            4 => asm!("mov dr4, {}", in(reg) value, options(nomem, nostack)),
            5 => asm!("mov dr5, {}", in(reg) value, options(nomem, nostack)),
            6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack)),
            _ => asm!("mov dr7, {}", in(reg) value, options(nomem, nostack)),
        }
    }
}

pub fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    unsafe { dtables::sgdt(&mut gdtr) };
    gdtr
}

pub fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    unsafe { dtables::sidt(&mut idtr) };
    idtr
}

pub fn lgdt(gdtr: &DescriptorTablePointer<u64>) {
    unsafe { dtables::lgdt(gdtr) };
}

pub fn lidt(idtr: &DescriptorTablePointer<u64>) {
    unsafe { dtables::lidt(idtr) };
}

pub fn rdtsc() -> u64 {
    unsafe { x86::time::rdtsc() }
}

/// `rdtscp`: the timestamp counter plus the IA32_TSC_AUX value.
pub fn rdtscp() -> (u64, u32) {
    let (lo, hi, aux): (u32, u32, u32);
    unsafe {
        asm!("rdtscp", out("eax") lo, out("edx") hi, out("ecx") aux, options(nomem, nostack));
    }
    ((u64::from(hi) << 32) | u64::from(lo), aux)
}

/// Reads performance counter `counter`.
pub fn rdpmc(counter: u32) -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        asm!("rdpmc", in("ecx") counter, out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Invalidates caches without writing them back.
pub fn invd() {
    unsafe { asm!("invd", options(nostack)) };
}

/// Writes caches back and invalidates them.
pub fn wbinvd() {
    unsafe { asm!("wbinvd", options(nostack)) };
}

/// Invalidates the linear-address TLB entry.
pub fn invlpg(la: u64) {
    unsafe { asm!("invlpg [{}]", in(reg) la, options(nostack)) };
}

/// `invpcid` invalidation types.
#[repr(u64)]
#[derive(Debug, Clone, Copy)]
pub enum InvPcidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContextsWithGlobals = 2,
    AllContexts = 3,
}

pub fn invpcid(invalidation: InvPcidType, pcid: u64, la: u64) {
    #[repr(C, align(16))]
    struct InvPcidDescriptor {
        pcid: u64,
        linear_address: u64,
    }

    let descriptor = InvPcidDescriptor { pcid, linear_address: la };
    unsafe {
        asm!(
            "invpcid {}, [{}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Writes extended control register `xcr`.
pub fn xsetbv(xcr: u32, value: u64) {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    unsafe {
        asm!("xsetbv", in("ecx") xcr, in("eax") lo, in("edx") hi, options(nomem, nostack));
    }
}

pub fn halt() {
    unsafe { x86::halt() };
}

pub fn pause() {
    core::hint::spin_loop();
}

/// Breaks into the attached kernel debugger.
pub fn int3() {
    unsafe { asm!("int3", options(nomem, nostack)) };
}

/// Switches CR3 for the lifetime of the guard. Used by handlers that must
/// dereference guest virtual addresses while VM-exit runs on the host CR3.
pub struct Cr3Guard {
    previous: u64,
}

impl Cr3Guard {
    pub fn new(target_cr3: u64) -> Self {
        let previous = cr3();
        if previous != target_cr3 {
            cr3_write(target_cr3);
        }
        Self { previous }
    }
}

impl Drop for Cr3Guard {
    fn drop(&mut self) {
        if cr3() != self.previous {
            cr3_write(self.previous);
        }
    }
}
