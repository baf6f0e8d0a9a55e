//! INVVPID: invalidation of VPID-tagged linear and combined mappings.

use core::arch::asm;

/// Descriptor consumed by `invvpid`.
#[repr(C, align(16))]
struct InvVpidDescriptor {
    vpid: u64,
    linear_address: u64,
}

#[repr(u64)]
enum InvVpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
}

fn invvpid(invalidation: InvVpidType, vpid: u16, la: u64) {
    let descriptor = InvVpidDescriptor { vpid: u64::from(vpid), linear_address: la };
    unsafe {
        asm!(
            "invvpid {}, [{}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Flushes the mapping of one linear address tagged with `vpid`.
pub fn invvpid_individual_address(vpid: u16, la: u64) {
    invvpid(InvVpidType::IndividualAddress, vpid, la);
}

/// Flushes all mappings tagged with `vpid`.
pub fn invvpid_single_context(vpid: u16) {
    invvpid(InvVpidType::SingleContext, vpid, 0);
}

/// Flushes all VPID-tagged mappings.
pub fn invvpid_all_contexts() {
    invvpid(InvVpidType::AllContexts, 0, 0);
}
