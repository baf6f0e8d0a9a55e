//! Error taxonomy shared by every component of the hypervisor.

use thiserror_no_std::Error;

/// All the ways virtualization can fail.
///
/// Errors on the start path unwind fully: every partially initialized
/// processor is devirtualized before `start` returns. Errors raised inside a
/// VM-exit handler are fatal for that processor, because once the host OS is
/// the guest there is nothing to return to.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("the processor is not a supported Intel CPU")]
    CpuUnsupported,

    #[error("VMX is not supported or is locked off in firmware")]
    FeatureDisabled,

    #[error("the memory arena is exhausted")]
    NotEnoughMemory,

    #[error("a VMX instruction failed with VM-instruction error {0}")]
    VmxInstructionError(u32),

    #[error("a VMX instruction failed with an invalid current-VMCS pointer")]
    VmFailInvalid,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("the platform layer has not been initialized")]
    PlatformNotInitialized,

    #[error("the OS did not report any physical memory ranges")]
    PhysicalMemoryQueryFailed,

    #[error("too many physical memory ranges reported by the OS")]
    TooManyPhysicalMemoryRanges,

    #[error("a 4KB mapping was requested inside an unsplit 2MB large page")]
    LargePageNotSplit,

    #[error("the guest physical address is not mapped")]
    PageNotMapped,

    #[error("unknown VM-exit reason {0:#x}")]
    UnknownExitReason(u32),

    #[error("no handler is installed for VM-exit reason {0:#x}")]
    UnhandledExitReason(u32),

    #[error("unexpected EPT violation in the identity map")]
    UnhandledEptViolation,

    #[error("EPT misconfiguration")]
    EptMisconfiguration,

    #[error("the guest raised a triple fault")]
    TripleFault,

    #[error("VM-entry failed while loading the guest state")]
    VmEntryFailure,
}
