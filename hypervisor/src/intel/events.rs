//! VM-entry event injection.
//!
//! Handlers that must surface a fault to the guest (#GP on a reserved MSR,
//! #UD on a nested VMX instruction) do it by programming the VM-entry
//! interruption-information field; the event is delivered through the
//! guest's IDT on the next VM-entry, before any guest instruction executes.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 25.8.3 VM-Entry Controls for Event Injection

use {
    crate::intel::support::{vmread, vmwrite},
    bitfield::bitfield,
    x86::vmx::vmcs::{control, ro},
};

/// Interruption types as encoded in the injection field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
}

bitfield! {
    /// The VM-entry interruption-information field.
    #[derive(Clone, Copy)]
    pub struct EntryInterruptionInformation(u32);
    impl Debug;
    pub u8, vector, set_vector: 7, 0;
    pub u8, interruption_type, set_interruption_type: 10, 8;
    pub deliver_error_code, set_deliver_error_code: 11;
    pub valid, set_valid: 31;
}

/// Exception vectors the handlers inject.
pub mod vector {
    pub const DEBUG: u8 = 1;
    pub const BREAKPOINT: u8 = 3;
    pub const INVALID_OPCODE: u8 = 6;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
}

/// Builds and writes VM-entry injection fields.
pub struct EventInjection;

impl EventInjection {
    fn inject(vector: u8, interruption_type: InterruptionType, error_code: Option<u32>) {
        let mut info = EntryInterruptionInformation(0);
        info.set_vector(vector);
        info.set_interruption_type(interruption_type as u8);
        info.set_valid(true);

        if let Some(error_code) = error_code {
            info.set_deliver_error_code(true);
            vmwrite(control::VMENTRY_EXCEPTION_ERR_CODE, u64::from(error_code));
        }

        vmwrite(control::VMENTRY_INTERRUPTION_INFO_FIELD, u64::from(info.0));
    }

    /// #GP(error_code).
    pub fn vmentry_inject_gp(error_code: u32) {
        Self::inject(vector::GENERAL_PROTECTION, InterruptionType::HardwareException, Some(error_code));
    }

    /// #UD. Never carries an error code.
    pub fn vmentry_inject_ud() {
        Self::inject(vector::INVALID_OPCODE, InterruptionType::HardwareException, None);
    }

    /// #PF with the faulting address in CR2.
    pub fn vmentry_inject_pf(error_code: u32, fault_address: u64) {
        crate::intel::support::cr2_write(fault_address);
        Self::inject(vector::PAGE_FAULT, InterruptionType::HardwareException, Some(error_code));
    }

    /// #BP, a software exception; the instruction length must accompany it.
    pub fn vmentry_inject_bp() {
        Self::inject(vector::BREAKPOINT, InterruptionType::SoftwareException, None);
        vmwrite(control::VMENTRY_INSTRUCTION_LEN, vmread(ro::VMEXIT_INSTRUCTION_LEN));
    }

    /// NMI.
    pub fn vmentry_inject_nmi() {
        Self::inject(2, InterruptionType::NonMaskableInterrupt, None);
    }

    /// Re-injects an event taken from the exit interruption fields, used to
    /// reflect exceptions and external interrupts back into the guest.
    pub fn vmentry_reflect(exit_interruption_info: u32) {
        let info = EntryInterruptionInformation(exit_interruption_info);

        let error_code = if info.deliver_error_code() {
            Some(vmread(ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32)
        } else {
            None
        };

        let interruption_type = match info.interruption_type() {
            0 => InterruptionType::ExternalInterrupt,
            2 => InterruptionType::NonMaskableInterrupt,
            4 => InterruptionType::SoftwareInterrupt,
            5 => InterruptionType::PrivilegedSoftwareException,
            6 => InterruptionType::SoftwareException,
            _ => InterruptionType::HardwareException,
        };

        if matches!(
            interruption_type,
            InterruptionType::SoftwareInterrupt
                | InterruptionType::PrivilegedSoftwareException
                | InterruptionType::SoftwareException
        ) {
            vmwrite(control::VMENTRY_INSTRUCTION_LEN, vmread(ro::VMEXIT_INSTRUCTION_LEN));
        }

        Self::inject(info.vector(), interruption_type, error_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_field_layout() {
        let mut info = EntryInterruptionInformation(0);
        info.set_vector(vector::GENERAL_PROTECTION);
        info.set_interruption_type(InterruptionType::HardwareException as u8);
        info.set_deliver_error_code(true);
        info.set_valid(true);

        assert_eq!(info.0, 0x8000_0B0D);
    }
}
