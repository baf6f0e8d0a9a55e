//! The VMCALL hypercall surface.
//!
//! RCX selects the service. The baseline knows exactly one: teardown of
//! the calling processor. Everything else looks like an invalid opcode,
//! exactly as VMCALL outside VMX does on bare metal; hook services in the
//! range 0xC1..=0xC2 are provided by the page-hook layer above this one.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    log::{debug, trace},
};

/// Install an execute-only page hook. RDX = VA of the page whose bytes
/// reads should see, R8 = VA of the page executions should fetch from.
pub const VMCALL_HOOK_INSTALL: u64 = 0xC1;

/// Remove the page hook.
pub const VMCALL_HOOK_REMOVE: u64 = 0xC2;

/// Disable VMX on the calling processor and continue natively.
pub const VMCALL_TEARDOWN: u64 = 0xFF;

pub fn handle_vmcall(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    match context.registers.rcx {
        VMCALL_TEARDOWN => {
            debug!("teardown vmcall");
            Ok(ExitType::ExitHypervisor)
        }
        reason => {
            trace!("unknown vmcall {:#x}", reason);
            EventInjection::vmentry_inject_ud();
            Ok(ExitType::Continue)
        }
    }
}
