//! The small unconditional and opt-in instruction exits: HLT, INVD,
//! WBINVD, INVLPG, the timestamp family, PAUSE, MONITOR/MWAIT and GETSEC.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            invvpid::invvpid_individual_address,
            support,
            vcpu::Vcpu,
            vmcs::VPID_TAG,
            vmexit::{ExitContext, ExitType},
        },
    },
    log::trace,
};

pub fn handle_hlt(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    support::halt();
    Ok(ExitType::IncrementRip)
}

pub fn handle_invd(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    support::invd();
    Ok(ExitType::IncrementRip)
}

pub fn handle_wbinvd(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    support::wbinvd();
    Ok(ExitType::IncrementRip)
}

/// INVLPG exits carry the operand address in the qualification. The guest
/// TLB is tagged with our VPID, so that is what must be flushed.
pub fn handle_invlpg(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    invvpid_individual_address(VPID_TAG, context.exit_qualification);
    Ok(ExitType::IncrementRip)
}

pub fn handle_rdtsc(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let tsc = support::rdtsc();
    context.registers.rax = tsc & 0xFFFF_FFFF;
    context.registers.rdx = tsc >> 32;
    Ok(ExitType::IncrementRip)
}

pub fn handle_rdtscp(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let (tsc, aux) = support::rdtscp();
    context.registers.rax = tsc & 0xFFFF_FFFF;
    context.registers.rdx = tsc >> 32;
    context.registers.rcx = u64::from(aux);
    Ok(ExitType::IncrementRip)
}

pub fn handle_rdpmc(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let value = support::rdpmc(context.registers.rcx as u32);
    context.registers.rax = value & 0xFFFF_FFFF;
    context.registers.rdx = value >> 32;
    Ok(ExitType::IncrementRip)
}

pub fn handle_pause(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    support::pause();
    Ok(ExitType::IncrementRip)
}

/// MONITOR and MWAIT become no-ops under interception; the guest falls
/// back to its polling path.
pub fn handle_monitor_mwait(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    trace!("monitor/mwait treated as nop, reason {}", context.exit_reason);
    Ok(ExitType::IncrementRip)
}

/// GETSEC without SMX enabled raises #UD on bare metal; CR4.SMXE is never
/// set under this hypervisor.
pub fn handle_getsec(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    EventInjection::vmentry_inject_ud();
    Ok(ExitType::Continue)
}
