//! Control-register access passthrough.
//!
//! With the default guest/host masks only CR4.VMXE writes trap, plus
//! whatever CR3 exiting a user layer turns on. The handler still emulates
//! the full MOV-CR/CLTS/LMSW matrix so those configurations work.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: Table 28-3. Exit Qualification for Control-Register Accesses

use {
    crate::{
        error::HypervisorError,
        intel::{
            invvpid::invvpid_single_context,
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmcs::VPID_TAG,
            vmexit::{read_gpr, write_gpr, ExitContext, ExitType},
            vmxon::Vmxon,
        },
    },
    bitfield::bitfield,
    log::trace,
    x86::vmx::vmcs::{control, guest},
};

/// CR3 bit 63 is a PCID no-flush hint, not part of the address.
const CR3_NO_FLUSH_BIT: u64 = 1 << 63;

bitfield! {
    /// Exit qualification for control-register accesses.
    #[derive(Clone, Copy)]
    pub struct CrQualification(u64);
    impl Debug;
    pub u8, register, set_register: 3, 0;
    pub u8, access_type, set_access_type: 5, 4;
    pub lmsw_memory_operand, set_lmsw_memory_operand: 6;
    pub u8, gpr, set_gpr: 11, 8;
    pub u16, lmsw_source, set_lmsw_source: 31, 16;
}

/// Access types in the qualification.
mod access {
    pub const MOV_TO_CR: u8 = 0;
    pub const MOV_FROM_CR: u8 = 1;
    pub const CLTS: u8 = 2;
    pub const LMSW: u8 = 3;
}

pub fn handle_cr_access(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let qualification = CrQualification(context.exit_qualification);

    trace!(
        "cr{} access type {} gpr {}",
        qualification.register(),
        qualification.access_type(),
        qualification.gpr()
    );

    match qualification.access_type() {
        access::MOV_TO_CR => {
            let value = read_gpr(context.registers, qualification.gpr());
            match qualification.register() {
                0 => {
                    // Keep the VMX-mandated bits alive; the guest sees its
                    // own value through the shadow.
                    vmwrite(guest::CR0, Vmxon::adjust_cr0(value));
                    vmwrite(control::CR0_READ_SHADOW, value);
                }
                3 => {
                    vmwrite(guest::CR3, value & !CR3_NO_FLUSH_BIT);
                    // A CR3 load flushes this VPID's non-global mappings.
                    invvpid_single_context(VPID_TAG);
                }
                4 => {
                    vmwrite(guest::CR4, Vmxon::adjust_cr4(value));
                    vmwrite(control::CR4_READ_SHADOW, value);
                }
                _ => return Err(HypervisorError::InvalidArgument),
            }
        }

        access::MOV_FROM_CR => {
            let value = match qualification.register() {
                0 => vmread(control::CR0_READ_SHADOW),
                3 => vmread(guest::CR3),
                4 => vmread(control::CR4_READ_SHADOW),
                _ => return Err(HypervisorError::InvalidArgument),
            };
            write_gpr(context.registers, qualification.gpr(), value);
        }

        access::CLTS => {
            const CR0_TS: u64 = 1 << 3;
            vmwrite(guest::CR0, vmread(guest::CR0) & !CR0_TS);
            vmwrite(control::CR0_READ_SHADOW, vmread(control::CR0_READ_SHADOW) & !CR0_TS);
        }

        _ => {
            // LMSW only reaches CR0's low four bits, and once PE is set it
            // stays set.
            const LMSW_MASK: u64 = 0xF;
            const CR0_PE: u64 = 1 << 0;
            let source = u64::from(qualification.lmsw_source());
            let cr0 = vmread(guest::CR0);
            let value = (cr0 & !LMSW_MASK) | (source & LMSW_MASK) | (cr0 & CR0_PE);
            vmwrite(guest::CR0, Vmxon::adjust_cr0(value));
            vmwrite(control::CR0_READ_SHADOW, value);
        }
    }

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_decodes_mov_cr4_rax() {
        // mov cr4, rax: register 4, type 0, gpr 0.
        let qualification = CrQualification(0x0000_0004);
        assert_eq!(qualification.register(), 4);
        assert_eq!(qualification.access_type(), access::MOV_TO_CR);
        assert_eq!(qualification.gpr(), 0);
    }

    #[test]
    fn qualification_decodes_mov_r8_cr3() {
        // mov r8, cr3: register 3, type 1, gpr 8.
        let qualification = CrQualification(0x0000_0813);
        assert_eq!(qualification.register(), 3);
        assert_eq!(qualification.access_type(), access::MOV_FROM_CR);
        assert_eq!(qualification.gpr(), 8);
    }

    #[test]
    fn qualification_decodes_lmsw() {
        let mut qualification = CrQualification(0);
        qualification.set_access_type(access::LMSW);
        qualification.set_lmsw_source(0xF);
        assert_eq!(qualification.access_type(), access::LMSW);
        assert_eq!(qualification.lmsw_source(), 0xF);
    }
}
