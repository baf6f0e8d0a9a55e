//! INVEPT: invalidation of EPT-derived guest-physical and combined
//! mappings.

use core::arch::asm;

/// Descriptor consumed by `invept`; the second quadword is reserved.
#[repr(C, align(16))]
struct InvEptDescriptor {
    eptp: u64,
    reserved: u64,
}

#[repr(u64)]
enum InvEptType {
    SingleContext = 1,
    AllContexts = 2,
}

fn invept(invalidation: InvEptType, eptp: u64) {
    let descriptor = InvEptDescriptor { eptp, reserved: 0 };
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Flushes mappings derived from the given EPTP on this processor.
pub fn invept_single_context(eptp: u64) {
    invept(InvEptType::SingleContext, eptp);
}

/// Flushes mappings derived from any EPTP on this processor.
pub fn invept_all_contexts() {
    invept(InvEptType::AllContexts, 0);
}
