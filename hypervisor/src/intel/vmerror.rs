//! VM-exit reasons and VM-instruction error numbers.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! - APPENDIX C VMX BASIC EXIT REASONS, Table C-1. Basic Exit Reasons
//! - 31.4 VM INSTRUCTION ERROR NUMBERS

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// How many slots a dispatch table indexed by basic exit reason needs.
pub const MAX_EXIT_REASON: usize = 70;

/// The low 16 bits of the VMCS exit-reason field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureInvalidGuestState = 33,
    EntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Enclv = 65,
    SppRelatedEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

impl VmxBasicExitReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        <Self as FromPrimitive>::from_u32(value)
    }

    /// Table index for dispatch purposes.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl core::fmt::Display for VmxBasicExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, *self as u16)
    }
}

/// The VM-instruction error field after a VMX instruction raised
/// VMfailValid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum VmInstructionError {
    VmcallInVmxRootOperation = 1,
    VmclearWithInvalidAddress = 2,
    VmclearWithVmxonPointer = 3,
    VmlaunchWithNonClearVmcs = 4,
    VmresumeWithNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    VmentryWithInvalidControlFields = 7,
    VmentryWithInvalidHostStateFields = 8,
    VmptrldWithInvalidAddress = 9,
    VmptrldWithVmxonPointer = 10,
    VmptrldWithIncorrectRevisionIdentifier = 11,
    VmreadVmwriteToUnsupportedComponent = 12,
    VmwriteToReadOnlyComponent = 13,
    VmxonInVmxRootOperation = 15,
    VmentryWithInvalidExecutiveVmcsPointer = 16,
    VmentryWithNonLaunchedExecutiveVmcs = 17,
    VmentryWithExecutiveVmcsPointerNotVmxonPointer = 18,
    VmcallWithNonClearVmcs = 19,
    VmcallWithInvalidVmExitControlFields = 20,
    VmcallWithIncorrectMsegRevisionIdentifier = 22,
    VmxoffUnderDualMonitorTreatment = 23,
    VmcallWithInvalidSmmMonitorFeatures = 24,
    VmentryWithInvalidVmExecutionControlFields = 25,
    VmentryWithEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        <Self as FromPrimitive>::from_u32(value)
    }
}

impl core::fmt::Display for VmInstructionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_round_trips() {
        assert_eq!(VmxBasicExitReason::from_u32(10), Some(VmxBasicExitReason::Cpuid));
        assert_eq!(VmxBasicExitReason::from_u32(48), Some(VmxBasicExitReason::EptViolation));
        assert_eq!(VmxBasicExitReason::from_u32(69), Some(VmxBasicExitReason::Loadiwkey));
    }

    #[test]
    fn reserved_exit_reasons_are_unknown() {
        for reserved in [35u32, 38, 42, 70, 0xFFFF] {
            assert_eq!(VmxBasicExitReason::from_u32(reserved), None);
        }
    }

    #[test]
    fn every_reason_fits_the_dispatch_table() {
        for value in 0..MAX_EXIT_REASON as u32 {
            if let Some(reason) = VmxBasicExitReason::from_u32(value) {
                assert!(reason.index() < MAX_EXIT_REASON);
            }
        }
    }

    #[test]
    fn instruction_errors_decode() {
        assert_eq!(
            VmInstructionError::from_u32(5),
            Some(VmInstructionError::VmresumeWithNonLaunchedVmcs)
        );
        assert_eq!(VmInstructionError::from_u32(14), None);
        assert_eq!(VmInstructionError::from_u32(0), None);
    }
}
