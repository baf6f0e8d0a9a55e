//! The VMXON region and the prerequisites for entering VMX operation.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 24.7 ENABLING AND ENTERING VMX OPERATION

use {
    crate::{
        error::HypervisorError,
        intel::support::{cr0, cr0_write, cr4, cr4_write, rdmsr, wrmsr},
    },
    bit_field::BitField,
    static_assertions::const_assert_eq,
    x86::{
        cpuid::CpuId,
        current::paging::BASE_PAGE_SIZE,
        msr::{
            IA32_FEATURE_CONTROL, IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1,
            IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1,
        },
    },
};

/// CR4.VMXE.
pub const CR4_VMX_ENABLE: u64 = 1 << 13;

const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// The VMXON region: one naturally aligned 4KB page whose first dword is
/// the VMCS revision identifier.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's
/// Manual: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    pub data: [u8; BASE_PAGE_SIZE - 4],
}

const_assert_eq!(core::mem::size_of::<Vmxon>(), BASE_PAGE_SIZE);

impl Vmxon {
    /// Stamps the revision identifier from IA32_VMX_BASIC.
    pub fn init(&mut self) {
        self.revision_id = Self::vmcs_revision_id();
        self.revision_id.set_bit(31, false);
    }

    /// The VMCS revision identifier supported by this processor.
    pub fn vmcs_revision_id() -> u32 {
        rdmsr(IA32_VMX_BASIC) as u32 & 0x7FFF_FFFF
    }

    /// Checks for a GenuineIntel part with VMX.
    pub fn check_supported() -> Result<(), HypervisorError> {
        let cpuid = CpuId::new();

        let is_intel = cpuid
            .get_vendor_info()
            .is_some_and(|vendor| vendor.as_str() == "GenuineIntel");
        if !is_intel {
            return Err(HypervisorError::CpuUnsupported);
        }

        let has_vmx = cpuid.get_feature_info().is_some_and(|features| features.has_vmx());
        if !has_vmx {
            return Err(HypervisorError::FeatureDisabled);
        }

        Ok(())
    }

    /// Sets CR4.VMXE.
    pub fn enable_vmx_operation() {
        cr4_write(cr4() | CR4_VMX_ENABLE);
    }

    /// Verifies IA32_FEATURE_CONTROL allows VMXON outside SMX, locking it
    /// ourselves if the firmware left it unlocked.
    pub fn adjust_feature_control_msr() -> Result<(), HypervisorError> {
        let feature_control = rdmsr(IA32_FEATURE_CONTROL);

        if feature_control & FEATURE_CONTROL_LOCKED == 0 {
            wrmsr(
                IA32_FEATURE_CONTROL,
                feature_control | FEATURE_CONTROL_VMXON_OUTSIDE_SMX | FEATURE_CONTROL_LOCKED,
            );
            return Ok(());
        }

        if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            // Locked with VMX off: only the firmware can change it now.
            return Err(HypervisorError::FeatureDisabled);
        }

        Ok(())
    }

    /// Forces the CR0 bits the IA32_VMX_CR0_FIXED MSRs demand.
    pub fn set_cr0_bits() {
        let fixed0 = rdmsr(IA32_VMX_CR0_FIXED0);
        let fixed1 = rdmsr(IA32_VMX_CR0_FIXED1);
        cr0_write((cr0() | fixed0) & fixed1);
    }

    /// Forces the CR4 bits the IA32_VMX_CR4_FIXED MSRs demand.
    pub fn set_cr4_bits() {
        let fixed0 = rdmsr(IA32_VMX_CR4_FIXED0);
        let fixed1 = rdmsr(IA32_VMX_CR4_FIXED1);
        cr4_write((cr4() | fixed0) & fixed1);
    }

    /// Applies the VMX fixed-bit constraints to an arbitrary CR0 value, as
    /// the MOV-CR handler must when the guest rewrites CR0.
    pub fn adjust_cr0(value: u64) -> u64 {
        (value | rdmsr(IA32_VMX_CR0_FIXED0)) & rdmsr(IA32_VMX_CR0_FIXED1)
    }

    /// Applies the VMX fixed-bit constraints to an arbitrary CR4 value.
    pub fn adjust_cr4(value: u64) -> u64 {
        (value | rdmsr(IA32_VMX_CR4_FIXED0)) & rdmsr(IA32_VMX_CR4_FIXED1)
    }
}
