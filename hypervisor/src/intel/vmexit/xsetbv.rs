//! XSETBV emulation. The instruction exits unconditionally, and Windows
//! executes it early on every processor, so correctness here is a boot
//! requirement.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            support::{self, vmread},
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    log::trace,
    x86::vmx::vmcs::guest,
};

const CR4_OSXSAVE: u64 = 1 << 18;
const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

pub fn handle_xsetbv(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    // XSETBV with CR4.OSXSAVE clear is #UD, not #GP.
    if vmread(guest::CR4) & CR4_OSXSAVE == 0 {
        EventInjection::vmentry_inject_ud();
        return Ok(ExitType::Continue);
    }

    let xcr = context.registers.rcx as u32;
    let value = (context.registers.rdx << 32) | (context.registers.rax & 0xFFFF_FFFF);

    // Only XCR0 exists; bit 0 is architecturally fixed; AVX requires SSE;
    // and bits the processor does not implement must stay clear.
    let invalid = xcr != 0
        || value & XCR0_X87 == 0
        || (value & XCR0_AVX != 0 && value & XCR0_SSE == 0)
        || value & vcpu.xcr0_unsupported_mask != 0;

    if invalid {
        trace!("rejecting xsetbv xcr{} = {:#x}", xcr, value);
        EventInjection::vmentry_inject_gp(0);
        return Ok(ExitType::Continue);
    }

    support::xsetbv(xcr, value);
    Ok(ExitType::IncrementRip)
}
