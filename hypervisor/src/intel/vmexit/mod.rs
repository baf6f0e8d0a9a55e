//! VM-exit dispatch.
//!
//! `vmexit_handler` is the C entry point the trampoline calls with the
//! VCPU and the guest register block it pushed onto the host stack. It
//! decodes the exit reason, builds the transient [`ExitContext`], runs the
//! VCPU's handler chain and advances the guest RIP when the handled
//! instruction calls for it.
//!
//! Errors here are terminal for the processor: the host OS is the guest,
//! so there is nowhere to return a failure to. The processor logs and
//! halts.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: 25.9 VM-EXIT INFORMATION FIELDS

use {
    crate::intel::{
        capture::GuestRegisters,
        support::{vmread, vmwrite},
        vcpu::Vcpu,
        vmerror::{VmInstructionError, VmxBasicExitReason},
    },
    log::error,
    x86::vmx::vmcs::{guest, ro},
};

pub mod control_register;
pub mod cpuid;
pub mod debug_register;
pub mod dt;
pub mod ept;
pub mod exception;
pub mod io;
pub mod misc;
pub mod msr;
pub mod vmcall;
pub mod vmxinstr;
pub mod xsetbv;

/// What the handler decided about guest resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Resume at the same RIP (event injected, EPT flip, re-execution).
    Continue,
    /// The instruction was emulated; resume past it.
    IncrementRip,
    /// Tear down virtualization on this processor and resume natively.
    ExitHypervisor,
}

/// The transient record built for every VM-exit, alive only while the
/// handler chain runs.
pub struct ExitContext<'a> {
    pub exit_reason: VmxBasicExitReason,
    pub exit_qualification: u64,
    pub guest_linear_address: u64,
    pub guest_physical_address: u64,
    pub instruction_length: u64,
    pub instruction_info: u64,
    /// The guest GPRs as pushed by the trampoline; writes land back in the
    /// guest on VMRESUME.
    pub registers: &'a mut GuestRegisters,
    /// Which chain layer is currently executing; used for delegation.
    pub(crate) layer: usize,
}

impl<'a> ExitContext<'a> {
    fn new(exit_reason: VmxBasicExitReason, registers: &'a mut GuestRegisters) -> Self {
        Self {
            exit_reason,
            exit_qualification: vmread(ro::EXIT_QUALIFICATION),
            guest_linear_address: vmread(ro::GUEST_LINEAR_ADDR),
            guest_physical_address: vmread(ro::GUEST_PHYSICAL_ADDR_FULL),
            instruction_length: vmread(ro::VMEXIT_INSTRUCTION_LEN),
            instruction_info: vmread(ro::VMEXIT_INSTRUCTION_INFO),
            registers,
            layer: 0,
        }
    }
}

/// Reads a guest GPR by its architectural operand encoding (RAX=0, RCX=1,
/// ..., R15=15). RSP reads come from the VMCS-refreshed block.
pub fn read_gpr(registers: &GuestRegisters, index: u8) -> u64 {
    match index & 0xF {
        0 => registers.rax,
        1 => registers.rcx,
        2 => registers.rdx,
        3 => registers.rbx,
        4 => registers.rsp,
        5 => registers.rbp,
        6 => registers.rsi,
        7 => registers.rdi,
        8 => registers.r8,
        9 => registers.r9,
        10 => registers.r10,
        11 => registers.r11,
        12 => registers.r12,
        13 => registers.r13,
        14 => registers.r14,
        _ => registers.r15,
    }
}

/// Writes a guest GPR by operand encoding. The stack pointer lives in the
/// VMCS, not in the pushed block, so RSP writes go through `vmwrite`.
pub fn write_gpr(registers: &mut GuestRegisters, index: u8, value: u64) {
    match index & 0xF {
        0 => registers.rax = value,
        1 => registers.rcx = value,
        2 => registers.rdx = value,
        3 => registers.rbx = value,
        4 => {
            registers.rsp = value;
            vmwrite(guest::RSP, value);
        }
        5 => registers.rbp = value,
        6 => registers.rsi = value,
        7 => registers.rdi = value,
        8 => registers.r8 = value,
        9 => registers.r9 = value,
        10 => registers.r10 = value,
        11 => registers.r11 = value,
        12 => registers.r12 = value,
        13 => registers.r13 = value,
        14 => registers.r14 = value,
        _ => registers.r15 = value,
    }
}

/// Whether an exit reason corresponds to an instruction whose emulation
/// naturally moves the guest past it. Fault-like exits (exceptions,
/// interrupts, EPT violations) must re-execute instead.
pub const fn advances_rip(reason: VmxBasicExitReason) -> bool {
    use VmxBasicExitReason::*;
    matches!(
        reason,
        Cpuid
            | Getsec
            | Hlt
            | Invd
            | Invlpg
            | Rdpmc
            | Rdtsc
            | Rdtscp
            | Vmcall
            | Vmclear
            | Vmlaunch
            | Vmptrld
            | Vmptrst
            | Vmread
            | Vmresume
            | Vmwrite
            | Vmxoff
            | Vmxon
            | Invept
            | Invvpid
            | Vmfunc
            | ControlRegisterAccesses
            | MovDr
            | IoInstruction
            | Rdmsr
            | Wrmsr
            | Mwait
            | Monitor
            | Pause
            | WbinvdOrWbnoinvd
            | Xsetbv
            | AccessToGdtrOrIdtr
            | AccessToLdtrOrTr
            | Rdrand
            | Rdseed
            | Invpcid
            | Xsaves
            | Xrstors
    )
}

/// VM-entry failed on a VM-exit reason with the entry-failure bit set.
const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

/// The C entry point of the VM-exit trampoline.
///
/// # Safety
///
/// Called from `vmexit_stub` only, with `vcpu` recovered from the host
/// stack slot and `registers` pointing at the block the stub pushed.
#[no_mangle]
pub unsafe extern "C" fn vmexit_handler(vcpu: *mut Vcpu, registers: *mut GuestRegisters) {
    let vcpu = &mut *vcpu;
    let registers = &mut *registers;

    // The trampoline only spills GPRs; RIP, RSP and RFLAGS live in the
    // VMCS. Complete the block so handlers see the whole picture.
    registers.rip = vmread(guest::RIP);
    registers.rsp = vmread(guest::RSP);
    registers.rflags = vmread(guest::RFLAGS);

    let raw_reason = vmread(ro::EXIT_REASON) as u32;

    if raw_reason & EXIT_REASON_ENTRY_FAILURE != 0 {
        error!("VM-entry failure, exit reason {:#x}", raw_reason);
        fatal_error(crate::error::HypervisorError::VmEntryFailure);
    }

    let Some(exit_reason) = VmxBasicExitReason::from_u32(raw_reason & 0xFFFF) else {
        error!("unknown exit reason {:#x}", raw_reason);
        fatal_error(crate::error::HypervisorError::UnknownExitReason(raw_reason));
    };

    let mut context = ExitContext::new(exit_reason, registers);
    vcpu.suppress_rip_adjust = false;

    let chain = vcpu.chain;
    match chain.dispatch(vcpu, &mut context) {
        Ok(ExitType::Continue) => {}
        Ok(ExitType::IncrementRip) => advance_guest_rip(vcpu, &mut context),
        Ok(ExitType::ExitHypervisor) => vcpu.devirtualize(context.registers),
        Err(error) => {
            error!("handler for {} failed: {}", exit_reason, error);
            fatal_error(error);
        }
    }
}

/// Moves the guest past the instruction that exited, unless a handler
/// asked for re-execution or the reason is not an instruction-like exit
/// in the first place.
fn advance_guest_rip(vcpu: &Vcpu, context: &mut ExitContext<'_>) {
    if vcpu.suppress_rip_adjust || !advances_rip(context.exit_reason) {
        return;
    }

    context.registers.rip += context.instruction_length;
    vmwrite(guest::RIP, context.registers.rip);
}

/// The trampoline lands here when VMRESUME itself fails.
#[no_mangle]
pub extern "C" fn vmentry_failure_handler() -> ! {
    let code = vmread(ro::VM_INSTRUCTION_ERROR) as u32;

    match VmInstructionError::from_u32(code) {
        Some(error) => error!("VM-entry failed: {}", error),
        None => error!("VM-entry failed with unknown instruction error {:#x}", code),
    }

    halt_forever();
}

/// Terminal error path: log and park the processor.
pub fn fatal_error(error: crate::error::HypervisorError) -> ! {
    error!("fatal: {} at guest RIP {:#x}", error, vmread(guest::RIP));
    halt_forever();
}

fn halt_forever() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_table_matches_the_architecture() {
        use VmxBasicExitReason::*;

        // Instruction-like exits move past the instruction.
        for reason in [Cpuid, Hlt, Invd, Rdmsr, Wrmsr, Vmcall, IoInstruction,
                       ControlRegisterAccesses, MovDr, Getsec, WbinvdOrWbnoinvd,
                       Invlpg, Monitor, Mwait, Pause, Rdpmc, Rdtsc, Rdtscp,
                       AccessToGdtrOrIdtr, AccessToLdtrOrTr, Vmxon, Xsetbv,
                       Xrstors, Xsaves] {
            assert!(advances_rip(reason), "{reason} should advance");
        }

        // Fault-like exits re-execute or re-deliver.
        for reason in [ExceptionOrNmi, ExternalInterrupt, TripleFault, InitSignal,
                       StartupIpi, TaskSwitch, EptViolation, EptMisconfiguration,
                       ApicAccess, MonitorTrapFlag] {
            assert!(!advances_rip(reason), "{reason} should not advance");
        }
    }

    #[test]
    fn gpr_indexing_follows_operand_encoding() {
        let mut registers = GuestRegisters { rax: 1, rcx: 2, rbx: 4, rbp: 6, r15: 16, ..Default::default() };

        assert_eq!(read_gpr(&registers, 0), 1);
        assert_eq!(read_gpr(&registers, 1), 2);
        assert_eq!(read_gpr(&registers, 3), 4);
        assert_eq!(read_gpr(&registers, 5), 6);
        assert_eq!(read_gpr(&registers, 15), 16);

        write_gpr(&mut registers, 8, 0x42);
        assert_eq!(registers.r8, 0x42);
    }
}
