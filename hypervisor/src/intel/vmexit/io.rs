//! I/O-instruction passthrough.
//!
//! Replays `in`/`out` and their string forms on the host so the device
//! sees exactly the access the guest issued. String variants walk guest
//! memory through RSI/RDI under the guest CR3, honouring REP and the
//! direction flag.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: Table 28-5. Exit Qualification for I/O Instructions

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::Cr3Guard,
            vcpu::Vcpu,
            vmexit::{ExitContext, ExitType},
        },
    },
    bitfield::bitfield,
    log::trace,
    x86::{
        io::{inb, inl, inw, outb, outl, outw},
        vmx::vmcs::guest,
    },
};

/// RFLAGS.DF.
const RFLAGS_DIRECTION: u64 = 1 << 10;

bitfield! {
    /// Exit qualification for I/O instructions.
    #[derive(Clone, Copy)]
    pub struct IoQualification(u64);
    impl Debug;
    pub u8, size_of_access, set_size_of_access: 2, 0;
    pub direction_in, set_direction_in: 3;
    pub string, set_string: 4;
    pub rep, set_rep: 5;
    pub immediate_operand, set_immediate_operand: 6;
    pub u16, port, set_port: 31, 16;
}

impl IoQualification {
    /// Access width in bytes: the field encodes size minus one.
    pub fn access_bytes(&self) -> u64 {
        u64::from(self.size_of_access()) + 1
    }
}

pub fn handle_io_instruction(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let qualification = IoQualification(context.exit_qualification);
    let port = qualification.port();
    let bytes = qualification.access_bytes();

    trace!(
        "io {} port {:#x}, {} byte(s), string={}",
        if qualification.direction_in() { "in" } else { "out" },
        port,
        bytes,
        qualification.string()
    );

    if qualification.string() {
        handle_string_io(context, &qualification);
    } else if qualification.direction_in() {
        let value = read_port(port, bytes);
        context.registers.rax = match bytes {
            1 => (context.registers.rax & !0xFF) | value,
            2 => (context.registers.rax & !0xFFFF) | value,
            // 32-bit results zero-extend into the full register.
            _ => value,
        };
    } else {
        write_port(port, bytes, context.registers.rax);
    }

    Ok(ExitType::IncrementRip)
}

fn read_port(port: u16, bytes: u64) -> u64 {
    unsafe {
        match bytes {
            1 => u64::from(inb(port)),
            2 => u64::from(inw(port)),
            _ => u64::from(inl(port)),
        }
    }
}

fn write_port(port: u16, bytes: u64, value: u64) {
    unsafe {
        match bytes {
            1 => outb(port, value as u8),
            2 => outw(port, value as u16),
            _ => outl(port, value as u32),
        }
    }
}

/// `ins`/`outs`, with or without REP. The element pointers are guest
/// virtual addresses; the guest shares our flat view of memory but not
/// necessarily our CR3, so the walk runs under the guest's.
fn handle_string_io(context: &mut ExitContext<'_>, qualification: &IoQualification) {
    let port = qualification.port();
    let bytes = qualification.access_bytes();

    let count = if qualification.rep() { context.registers.rcx } else { 1 };
    let backwards = context.registers.rflags & RFLAGS_DIRECTION != 0;
    let step = if backwards { (bytes as i64).wrapping_neg() } else { bytes as i64 };

    let _guard = Cr3Guard::new(crate::intel::support::vmread(guest::CR3));

    if qualification.direction_in() {
        let mut rdi = context.registers.rdi;
        for _ in 0..count {
            let value = read_port(port, bytes);
            unsafe { copy_to(rdi, value, bytes) };
            rdi = rdi.wrapping_add(step as u64);
        }
        context.registers.rdi = rdi;
    } else {
        let mut rsi = context.registers.rsi;
        for _ in 0..count {
            let value = unsafe { copy_from(rsi, bytes) };
            write_port(port, bytes, value);
            rsi = rsi.wrapping_add(step as u64);
        }
        context.registers.rsi = rsi;
    }

    if qualification.rep() {
        context.registers.rcx = 0;
    }
}

// The guest may hand us unaligned string pointers; the real instructions
// do not care either.
unsafe fn copy_to(va: u64, value: u64, bytes: u64) {
    match bytes {
        1 => core::ptr::write_unaligned(va as *mut u8, value as u8),
        2 => core::ptr::write_unaligned(va as *mut u16, value as u16),
        _ => core::ptr::write_unaligned(va as *mut u32, value as u32),
    }
}

unsafe fn copy_from(va: u64, bytes: u64) -> u64 {
    match bytes {
        1 => u64::from(core::ptr::read_unaligned(va as *const u8)),
        2 => u64::from(core::ptr::read_unaligned(va as *const u16)),
        _ => u64::from(core::ptr::read_unaligned(va as *const u32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_decodes_in_al_0x64() {
        // `in al, 0x64`: one byte, direction in, immediate operand.
        let mut qualification = IoQualification(0);
        qualification.set_size_of_access(0);
        qualification.set_direction_in(true);
        qualification.set_immediate_operand(true);
        qualification.set_port(0x64);

        assert_eq!(qualification.0, (0x64 << 16) | (1 << 6) | (1 << 3));
        assert_eq!(qualification.access_bytes(), 1);
        assert!(!qualification.string());
    }

    #[test]
    fn qualification_decodes_rep_outsw() {
        let mut qualification = IoQualification(0);
        qualification.set_size_of_access(1);
        qualification.set_string(true);
        qualification.set_rep(true);
        qualification.set_port(0x5658);

        assert_eq!(qualification.access_bytes(), 2);
        assert!(qualification.string());
        assert!(qualification.rep());
        assert!(!qualification.direction_in());
        assert_eq!(qualification.port(), 0x5658);
    }
}
