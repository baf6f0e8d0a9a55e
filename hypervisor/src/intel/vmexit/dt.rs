//! Descriptor-table access exits: SGDT/SIDT/LGDT/LIDT and
//! SLDT/STR/LLDT/LTR. Only taken when a layer enables
//! `descriptor_table_exiting`, typically to catch descriptor-table
//! tampering or to lie about table locations.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: Table 28-12. Format of the VM-Exit Instruction-Information
//! Field as Used for LIDT, LGDT, SIDT, or SGDT

use {
    crate::{
        error::HypervisorError,
        intel::{
            descriptor::{gdt_slice, SegmentDescriptor},
            support::{vmread, vmwrite, Cr3Guard},
            vcpu::Vcpu,
            vmexit::{read_gpr, write_gpr, ExitContext, ExitType},
        },
    },
    bitfield::bitfield,
    x86::{
        dtables::DescriptorTablePointer,
        segmentation::SegmentSelector,
        vmx::vmcs::guest,
    },
};

bitfield! {
    /// VM-exit instruction information for descriptor-table instructions.
    #[derive(Clone, Copy)]
    pub struct DtInstructionInfo(u64);
    impl Debug;
    pub u8, scaling, set_scaling: 1, 0;
    /// LLDT/LTR/SLDT/STR only: operand is a register, not memory.
    pub register_operand, set_register_operand: 3;
    pub u8, address_size, set_address_size: 9, 7;
    pub operand_size_32, set_operand_size_32: 11;
    pub u8, segment_register, set_segment_register: 17, 15;
    pub u8, index_register, set_index_register: 21, 18;
    pub index_register_invalid, set_index_register_invalid: 22;
    pub u8, base_register, set_base_register: 26, 23;
    pub base_register_invalid, set_base_register_invalid: 27;
    pub u8, instruction_identity, set_instruction_identity: 29, 28;
}

/// Instruction identities for the GDTR/IDTR group.
mod dt_identity {
    pub const SGDT: u8 = 0;
    pub const SIDT: u8 = 1;
    pub const LGDT: u8 = 2;
    pub const LIDT: u8 = 3;
}

/// Instruction identities for the LDTR/TR group.
mod seg_identity {
    pub const SLDT: u8 = 0;
    pub const STR: u8 = 1;
    pub const LLDT: u8 = 2;
    pub const LTR: u8 = 3;
}

/// Computes the guest linear address of a memory operand from the
/// instruction information and the displacement in the qualification.
fn operand_address(context: &ExitContext<'_>, info: DtInstructionInfo) -> u64 {
    let mut address = context.exit_qualification;

    if !info.base_register_invalid() {
        address = address.wrapping_add(read_gpr(context.registers, info.base_register()));
    }

    if !info.index_register_invalid() {
        let index = read_gpr(context.registers, info.index_register());
        address = address.wrapping_add(index << info.scaling());
    }

    // In 64-bit mode only FS and GS carry a base.
    let segment_base = match info.segment_register() {
        4 => vmread(guest::FS_BASE),
        5 => vmread(guest::GS_BASE),
        _ => 0,
    };

    address.wrapping_add(segment_base)
}

/// The 10-byte memory image of a descriptor-table register.
#[repr(C, packed)]
struct DtOperand {
    limit: u16,
    base: u64,
}

pub fn handle_gdtr_idtr_access(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let info = DtInstructionInfo(context.instruction_info);
    let address = operand_address(context, info);

    let (base_field, limit_field) = match info.instruction_identity() {
        dt_identity::SGDT | dt_identity::LGDT => (guest::GDTR_BASE, guest::GDTR_LIMIT),
        _ => (guest::IDTR_BASE, guest::IDTR_LIMIT),
    };

    // The operand is a guest virtual address; walk it under the guest CR3.
    let _guard = Cr3Guard::new(vmread(guest::CR3));
    let operand = address as *mut DtOperand;

    match info.instruction_identity() {
        dt_identity::SGDT | dt_identity::SIDT => unsafe {
            core::ptr::write_unaligned(
                operand,
                DtOperand {
                    limit: vmread(limit_field) as u16,
                    base: vmread(base_field),
                },
            );
        },
        _ => {
            let value = unsafe { core::ptr::read_unaligned(operand) };
            vmwrite(base_field, value.base);
            vmwrite(limit_field, u64::from(value.limit));
        }
    }

    Ok(ExitType::IncrementRip)
}

pub fn handle_ldtr_tr_access(_vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let info = DtInstructionInfo(context.instruction_info);

    let (selector_field, base_field, limit_field, ar_field) = match info.instruction_identity() {
        seg_identity::SLDT | seg_identity::LLDT => {
            (guest::LDTR_SELECTOR, guest::LDTR_BASE, guest::LDTR_LIMIT, guest::LDTR_ACCESS_RIGHTS)
        }
        _ => (guest::TR_SELECTOR, guest::TR_BASE, guest::TR_LIMIT, guest::TR_ACCESS_RIGHTS),
    };

    match info.instruction_identity() {
        seg_identity::SLDT | seg_identity::STR => {
            let selector = vmread(selector_field);
            if info.register_operand() {
                write_gpr(context.registers, info.base_register(), selector);
            } else {
                let address = operand_address(context, info);
                let _guard = Cr3Guard::new(vmread(guest::CR3));
                unsafe { core::ptr::write_unaligned(address as *mut u16, selector as u16) };
            }
        }
        _ => {
            let selector = if info.register_operand() {
                read_gpr(context.registers, info.base_register()) as u16
            } else {
                let address = operand_address(context, info);
                let _guard = Cr3Guard::new(vmread(guest::CR3));
                unsafe { core::ptr::read_unaligned(address as *const u16) }
            };

            // Refresh the cached descriptor state from the guest GDT, the
            // way the real instruction would.
            let gdtr = DescriptorTablePointer::<u64> {
                limit: vmread(guest::GDTR_LIMIT) as u16,
                base: vmread(guest::GDTR_BASE) as *const u64,
            };

            let _guard = Cr3Guard::new(vmread(guest::CR3));
            let descriptor =
                SegmentDescriptor::from_selector(gdt_slice(&gdtr), SegmentSelector::from_raw(selector), true);

            vmwrite(selector_field, selector);
            vmwrite(base_field, descriptor.base);
            vmwrite(limit_field, descriptor.limit);
            vmwrite(ar_field, descriptor.access_rights);
        }
    }

    Ok(ExitType::IncrementRip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_info_decodes_sgdt_memory_operand() {
        // sgdt [rax]: identity 0, base register RAX valid, index invalid.
        let mut info = DtInstructionInfo(0);
        info.set_instruction_identity(dt_identity::SGDT);
        info.set_base_register(0);
        info.set_index_register_invalid(true);

        assert_eq!(info.instruction_identity(), 0);
        assert!(!info.base_register_invalid());
        assert!(info.index_register_invalid());
    }

    #[test]
    fn operand_size_of_dt_image() {
        assert_eq!(core::mem::size_of::<DtOperand>(), 10);
    }
}
