//! CPUID passthrough.
//!
//! Executes the leaf the guest asked for on the host and hands the result
//! back unmodified, so a guest that nobody hooks sees exactly the bare
//! metal enumeration.

use {
    crate::{
        error::HypervisorError,
        intel::{
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    log::trace,
    x86::cpuid::cpuid,
};

pub fn handle_cpuid(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let leaf = context.registers.rax as u32;
    let subleaf = context.registers.rcx as u32;

    let result = cpuid!(leaf, subleaf);

    trace!("cpuid {:#x}/{:#x}", leaf, subleaf);

    // CPUID is a 32-bit instruction: the upper halves are zeroed.
    context.registers.rax = u64::from(result.eax);
    context.registers.rbx = u64::from(result.ebx);
    context.registers.rcx = u64::from(result.ecx);
    context.registers.rdx = u64::from(result.edx);

    Ok(ExitType::IncrementRip)
}
