//! Exception, NMI and external-interrupt exits.
//!
//! The passthrough stance is reflection: whatever interrupted the guest
//! is re-delivered through VM-entry event injection, so guest behavior is
//! indistinguishable from bare metal. These exits only occur when a layer
//! widens the exception bitmap or the pin-based controls.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{EntryInterruptionInformation, EventInjection},
            support::vmread,
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    log::{error, trace},
    x86::vmx::vmcs::ro,
};

pub fn handle_exception_or_nmi(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let interruption_info = vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32;
    let info = EntryInterruptionInformation(interruption_info);

    if !info.valid() {
        return Err(HypervisorError::InvalidArgument);
    }

    trace!("reflecting vector {} type {}", info.vector(), info.interruption_type());

    EventInjection::vmentry_reflect(interruption_info);
    Ok(ExitType::Continue)
}

pub fn handle_external_interrupt(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let interruption_info = vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32;
    let info = EntryInterruptionInformation(interruption_info);

    if info.valid() {
        EventInjection::vmentry_reflect(interruption_info);
    }

    Ok(ExitType::Continue)
}

/// A triple fault would have reset bare metal; there is no better option
/// available to us either.
pub fn handle_triple_fault(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    error!("guest triple fault at RIP {:#x}", context.registers.rip);
    Err(HypervisorError::TripleFault)
}
