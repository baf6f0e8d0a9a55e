//! RDMSR/WRMSR passthrough.
//!
//! MSR accesses only reach here when a handler layer hooked them in the
//! MSR bitmap (the default bitmap is empty), or for MSRs outside the two
//! architectural ranges, which exit unconditionally. Valid MSRs are
//! executed on the host; reserved and synthetic ranges earn the guest a
//! #GP, which is also what anti-cheat style probes expect to see.

use {
    crate::{
        error::HypervisorError,
        intel::{
            bitmap::MsrAccessType,
            events::EventInjection,
            support::{rdmsr, wrmsr},
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    core::ops::RangeInclusive,
    log::trace,
};

const MSR_MASK_LOW: u64 = u32::MAX as u64;

const MSR_VALID_RANGE_LOW: RangeInclusive<u32> = 0x0000_0000..=0x0000_1FFF;
const MSR_VALID_RANGE_HIGH: RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;
const MSR_HYPERV_RANGE: RangeInclusive<u32> = 0x4000_0000..=0x4000_00FF;

fn is_valid_msr(msr: u32) -> bool {
    (MSR_VALID_RANGE_LOW.contains(&msr) || MSR_VALID_RANGE_HIGH.contains(&msr))
        && !MSR_HYPERV_RANGE.contains(&msr)
}

pub fn handle_rdmsr(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    handle_msr_access(vcpu, context, MsrAccessType::Read)
}

pub fn handle_wrmsr(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    handle_msr_access(vcpu, context, MsrAccessType::Write)
}

pub fn handle_msr_access(
    _vcpu: &mut Vcpu,
    context: &mut ExitContext<'_>,
    access_type: MsrAccessType,
) -> Result<ExitType, HypervisorError> {
    let msr_id = context.registers.rcx as u32;

    // Under VMware the Hyper-V synthetic range responds instead of
    // faulting, so leave it alone there.
    #[cfg(feature = "vmware")]
    let faulting = !MSR_VALID_RANGE_LOW.contains(&msr_id)
        && !MSR_VALID_RANGE_HIGH.contains(&msr_id)
        && !MSR_HYPERV_RANGE.contains(&msr_id);
    #[cfg(not(feature = "vmware"))]
    let faulting = !is_valid_msr(msr_id);

    if faulting {
        trace!("invalid MSR access: {:#x}", msr_id);
        EventInjection::vmentry_inject_gp(0);
        return Ok(ExitType::Continue);
    }

    match access_type {
        MsrAccessType::Read => {
            let value = rdmsr(msr_id);
            context.registers.rax = value & MSR_MASK_LOW;
            context.registers.rdx = value >> 32;
        }
        MsrAccessType::Write => {
            let value = (context.registers.rdx << 32) | (context.registers.rax & MSR_MASK_LOW);
            wrmsr(msr_id, value);
        }
    }

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msr_range_classification() {
        assert!(is_valid_msr(0x1B)); // IA32_APIC_BASE
        assert!(is_valid_msr(0xC000_0082)); // IA32_LSTAR
        assert!(!is_valid_msr(0x4000_0000)); // Hyper-V synthetic
        assert!(!is_valid_msr(0x2000)); // reserved
        assert!(!is_valid_msr(0xC000_2000));
    }
}
