//! The guest register block and the register-capture stub.
//!
//! `capture_registers` snapshots the caller's architectural state so the
//! VMCS can describe the running thread as the initial guest. The captured
//! RIP is the instruction right after the call: when VMLAUNCH succeeds the
//! guest resumes there, "returning" from this function a second time with
//! RAX forced to 1 by the bring-up path.

use {core::arch::global_asm, core::mem::offset_of, static_assertions::const_assert_eq};

/// The guest general-purpose state, in the fixed order the assembly stubs
/// rely on. `rip` and `rflags` trail the sixteen GPRs.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

// The stubs address the block with these literal offsets.
const_assert_eq!(offset_of!(GuestRegisters, rax), 0x00);
const_assert_eq!(offset_of!(GuestRegisters, rbx), 0x08);
const_assert_eq!(offset_of!(GuestRegisters, rcx), 0x10);
const_assert_eq!(offset_of!(GuestRegisters, rdx), 0x18);
const_assert_eq!(offset_of!(GuestRegisters, rdi), 0x20);
const_assert_eq!(offset_of!(GuestRegisters, rsi), 0x28);
const_assert_eq!(offset_of!(GuestRegisters, rbp), 0x30);
const_assert_eq!(offset_of!(GuestRegisters, rsp), 0x38);
const_assert_eq!(offset_of!(GuestRegisters, r8), 0x40);
const_assert_eq!(offset_of!(GuestRegisters, r15), 0x78);
const_assert_eq!(offset_of!(GuestRegisters, rip), 0x80);
const_assert_eq!(offset_of!(GuestRegisters, rflags), 0x88);
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x90);

extern "C" {
    /// Captures the caller's GPRs, RFLAGS, RSP and return RIP into
    /// `registers`. Returns `false` on the real call; when the captured
    /// state is later launched as a guest, execution "returns" here again
    /// with RAX patched to report `true`.
    pub fn capture_registers(registers: &mut GuestRegisters) -> bool;
}

global_asm!(
    r#"
.global capture_registers
capture_registers:
    mov     [rcx + 0x00], rax
    mov     [rcx + 0x08], rbx
    mov     [rcx + 0x10], rcx
    mov     [rcx + 0x18], rdx
    mov     [rcx + 0x20], rdi
    mov     [rcx + 0x28], rsi
    mov     [rcx + 0x30], rbp
    mov     [rcx + 0x40], r8
    mov     [rcx + 0x48], r9
    mov     [rcx + 0x50], r10
    mov     [rcx + 0x58], r11
    mov     [rcx + 0x60], r12
    mov     [rcx + 0x68], r13
    mov     [rcx + 0x70], r14
    mov     [rcx + 0x78], r15

    pushfq
    pop     rax
    mov     [rcx + 0x88], rax

    // RSP as the caller sees it once we return.
    lea     rax, [rsp + 8]
    mov     [rcx + 0x38], rax

    // The return address doubles as the guest resume point.
    mov     rax, [rsp]
    mov     [rcx + 0x80], rax

    xor     eax, eax
    ret
"#
);
