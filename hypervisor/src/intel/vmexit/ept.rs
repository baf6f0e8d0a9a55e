//! EPT violation and misconfiguration exits.
//!
//! Under a pure identity map neither can legally happen, so the baseline
//! treats both as fatal; layers that deliberately narrow permissions (the
//! page-hook layer) override the violation slot above this one.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: Table 28-7. Exit Qualification for EPT Violations

use {
    crate::{
        error::HypervisorError,
        intel::{
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    bitfield::bitfield,
    log::error,
};

bitfield! {
    /// Exit qualification for EPT violations.
    #[derive(Clone, Copy)]
    pub struct EptViolationQualification(u64);
    impl Debug;
    pub data_read, set_data_read: 0;
    pub data_write, set_data_write: 1;
    pub data_execute, set_data_execute: 2;
    pub readable, set_readable: 3;
    pub writable, set_writable: 4;
    pub executable, set_executable: 5;
    pub valid_guest_linear_address, set_valid_guest_linear_address: 7;
    pub translation_fault, set_translation_fault: 8;
}

pub fn handle_ept_violation(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let qualification = EptViolationQualification(context.exit_qualification);

    error!(
        "unexpected EPT violation: GPA {:#x} GLA {:#x} read={} write={} execute={}",
        context.guest_physical_address,
        context.guest_linear_address,
        qualification.data_read(),
        qualification.data_write(),
        qualification.data_execute(),
    );

    Err(HypervisorError::UnhandledEptViolation)
}

pub fn handle_ept_misconfiguration(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    error!("EPT misconfiguration at GPA {:#x}", context.guest_physical_address);
    Err(HypervisorError::EptMisconfiguration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_decodes_write_to_execute_only() {
        // Write access to a page mapped execute-only.
        let qualification = EptViolationQualification(0b10_0010);
        assert!(qualification.data_write());
        assert!(!qualification.data_read());
        assert!(qualification.executable());
        assert!(!qualification.writable());
    }
}
