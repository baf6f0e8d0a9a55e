//! MOV-DR passthrough: only taken when a layer enables `mov_dr_exiting`.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: Table 28-4. Exit Qualification for MOV DR

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::{read_dr, vmread, vmwrite, write_dr},
            vcpu::Vcpu,
            vmexit::{read_gpr, write_gpr, ExitContext, ExitType},
        },
    },
    bitfield::bitfield,
    x86::vmx::vmcs::guest,
};

bitfield! {
    /// Exit qualification for MOV DR.
    #[derive(Clone, Copy)]
    pub struct DrQualification(u64);
    impl Debug;
    pub u8, debug_register, set_debug_register: 2, 0;
    pub direction_from_dr, set_direction_from_dr: 4;
    pub u8, gpr, set_gpr: 11, 8;
}

pub fn handle_dr_access(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let qualification = DrQualification(context.exit_qualification);
    let dr = qualification.debug_register();

    if qualification.direction_from_dr() {
        let value = if dr == 7 { vmread(guest::DR7) } else { read_dr(dr) };
        write_gpr(context.registers, qualification.gpr(), value);
    } else {
        let value = read_gpr(context.registers, qualification.gpr());
        if dr == 7 {
            // DR7 is guest state; the hardware loads it on entry.
            vmwrite(guest::DR7, value);
        } else {
            write_dr(dr, value);
        }
    }

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_decodes_mov_dr7_rcx() {
        // mov dr7, rcx: dr 7, write direction, gpr 1.
        let qualification = DrQualification(0x0000_0107);
        assert_eq!(qualification.debug_register(), 7);
        assert!(!qualification.direction_from_dr());
        assert_eq!(qualification.gpr(), 1);
    }
}
