//! Everything bound to the Intel VT-x architecture: intrinsics, VMX region
//! types, the VMCS, the EPT engine, the per-processor virtual CPU and the
//! VM-exit machinery.

pub mod addresses;
pub mod bitmap;
pub mod capture;
pub mod descriptor;
pub mod ept;
pub mod events;
pub mod invept;
pub mod invvpid;
pub mod mtrr;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmxon;
