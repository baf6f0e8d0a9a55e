//! VMX instructions issued by the guest.
//!
//! Nested virtualization is out of scope: the guest is told, via the #UD
//! a bare-metal OS without VMX enabled would see, that these instructions
//! do not work here.

use crate::{
    error::HypervisorError,
    intel::{
        events::EventInjection,
        vcpu::Vcpu,
        vmexit::{ExitContext, ExitType},
    },
};

pub fn handle_vmx_instruction(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    EventInjection::vmentry_inject_ud();
    Ok(ExitType::Continue)
}
