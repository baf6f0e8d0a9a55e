//! The hand-written entry and exit paths of the virtual machine.
//!
//! Three stubs live here, and they are the only code in the crate that is
//! not ordinary Rust:
//!
//! - `launch_vm` restores the captured guest registers and executes
//!   VMLAUNCH. It only ever returns on VM-entry failure, reporting RFLAGS.
//! - `vmexit_stub` is the VM-exit trampoline the VMCS host RIP points at.
//!   It materializes a [`GuestRegisters`] block on the per-VCPU host stack,
//!   calls [`vmexit_handler`](crate::intel::vmexit::vmexit_handler) with
//!   the VCPU recovered from its slot above the stack top, restores the
//!   (possibly modified) registers and executes VMRESUME. A failed
//!   VMRESUME falls through into the fatal handler.
//! - `devirtualize_guest` reloads a register block wholesale, stack pointer
//!   and flags included, and jumps back into the (by then no longer
//!   virtualized) guest. The teardown VMCALL ends up here after VMXOFF.
//!
//! The host stack layout makes the VCPU discoverable without any global
//! state: the VMCS host RSP points at the `vcpu` slot at the top of the
//! per-VCPU stack, so the trampoline finds it at a fixed offset above the
//! register block it pushes.

use {
    crate::intel::capture::GuestRegisters,
    core::arch::global_asm,
    core::mem::{offset_of, size_of},
    derivative::Derivative,
    elain::Align,
    static_assertions::const_assert_eq,
    x86::current::paging::BASE_PAGE_SIZE,
};

/// Usable VM-exit scratch space under the top-of-stack slots.
pub const HOST_STACK_CONTENTS_SIZE: usize = 6 * BASE_PAGE_SIZE - 2 * size_of::<u64>();

/// The per-VCPU host stack.
///
/// The VMCS host RSP is `&vcpu`; on every VM-exit the trampoline pushes the
/// guest register block right below that slot and the scratch region
/// becomes the Rust call stack of the exit handlers.
#[derive(Derivative)]
#[derivative(Debug)]
#[repr(C, align(4096))]
pub struct HostStackLayout {
    #[derivative(Debug = "ignore")]
    pub stack_contents: [u8; HOST_STACK_CONTENTS_SIZE],

    /// Recovered by the trampoline at `[rsp + 0x90]` after it pushes the
    /// register block.
    pub vcpu: u64,

    /// Keeps the host RSP 16-byte aligned.
    pub reserved: u64,

    #[derivative(Debug = "ignore")]
    align: Align<4096>,
}

const_assert_eq!(size_of::<HostStackLayout>(), 6 * BASE_PAGE_SIZE);
const_assert_eq!(offset_of!(HostStackLayout, vcpu), HOST_STACK_CONTENTS_SIZE);

impl HostStackLayout {
    /// The value to program into the VMCS host RSP field.
    pub fn host_rsp(&self) -> u64 {
        core::ptr::addr_of!(self.vcpu) as u64
    }
}

extern "C" {
    /// Loads the guest GPRs from `registers` and executes VMLAUNCH.
    ///
    /// On success this never returns: the processor continues in VMX
    /// non-root operation at the captured RIP. On VM-entry failure it
    /// returns the RFLAGS value so the caller can tell VMfailInvalid from
    /// VMfailValid.
    pub fn launch_vm(registers: &GuestRegisters) -> u64;

    /// Reloads the full register block, RSP, RFLAGS and RIP included, and
    /// jumps into it. Used to resume the guest natively after VMXOFF.
    pub fn devirtualize_guest(registers: &GuestRegisters) -> !;

    /// The VM-exit landing point programmed into the VMCS host RIP.
    pub fn vmexit_stub();
}

global_asm!(
    r#"
.global launch_vm
launch_vm:
    // VM-entry obliterates every register; preserve the callee-saved ones
    // for the failure path.
    push    rbx
    push    rbp
    push    rdi
    push    rsi
    push    r12
    push    r13
    push    r14
    push    r15

    mov     rax, [rcx + 0x00]
    mov     rbx, [rcx + 0x08]
    mov     rdx, [rcx + 0x18]
    mov     rdi, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rbp, [rcx + 0x30]
    mov     r8,  [rcx + 0x40]
    mov     r9,  [rcx + 0x48]
    mov     r10, [rcx + 0x50]
    mov     r11, [rcx + 0x58]
    mov     r12, [rcx + 0x60]
    mov     r13, [rcx + 0x68]
    mov     r14, [rcx + 0x70]
    mov     r15, [rcx + 0x78]
    mov     rcx, [rcx + 0x10]

    vmlaunch

    // Only reached when VM-entry failed (CF or ZF set).
    pushfq
    pop     rax
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rsi
    pop     rdi
    pop     rbp
    pop     rbx
    ret

.global vmexit_stub
vmexit_stub:
    // RSP is the VMCS host RSP: the address of the vcpu slot. Build a
    // GuestRegisters block below it; rip and rflags stay zero, the VMCS
    // owns them.
    sub     rsp, 0x10
    push    r15
    push    r14
    push    r13
    push    r12
    push    r11
    push    r10
    push    r9
    push    r8
    push    rax             // placeholder for the rsp slot
    push    rbp
    push    rsi
    push    rdi
    push    rdx
    push    rcx
    push    rbx
    push    rax

    mov     rcx, [rsp + 0x90]
    mov     rdx, rsp
    sub     rsp, 0x20
    call    vmexit_handler
    add     rsp, 0x20

    pop     rax
    pop     rbx
    pop     rcx
    pop     rdx
    pop     rdi
    pop     rsi
    pop     rbp
    add     rsp, 8          // the guest RSP lives in the VMCS
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15
    add     rsp, 0x10

    vmresume

    // VMRESUME failed; no state is worth preserving anymore.
    sub     rsp, 0x28
    call    vmentry_failure_handler
    int3

.global devirtualize_guest
devirtualize_guest:
    mov     rsp, [rcx + 0x38]

    // Park the resume RIP and RFLAGS on the guest stack.
    mov     rax, [rcx + 0x80]
    push    rax
    mov     rax, [rcx + 0x88]
    push    rax
    popfq

    mov     rax, [rcx + 0x00]
    mov     rbx, [rcx + 0x08]
    mov     rdx, [rcx + 0x18]
    mov     rdi, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rbp, [rcx + 0x30]
    mov     r8,  [rcx + 0x40]
    mov     r9,  [rcx + 0x48]
    mov     r10, [rcx + 0x50]
    mov     r11, [rcx + 0x58]
    mov     r12, [rcx + 0x60]
    mov     r13, [rcx + 0x68]
    mov     r14, [rcx + 0x70]
    mov     r15, [rcx + 0x78]
    mov     rcx, [rcx + 0x10]

    ret
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_slot_sits_at_the_stack_top() {
        // The trampoline reads the slot at [rsp + 0x90]: a 0x90-byte
        // register block pushed below the host RSP must land exactly on
        // the vcpu field.
        assert_eq!(
            offset_of!(HostStackLayout, vcpu) - size_of::<GuestRegisters>(),
            HOST_STACK_CONTENTS_SIZE - 0x90
        );
        assert_eq!(size_of::<GuestRegisters>(), 0x90);
    }
}
