//! A minimal type-2 Intel VT-x hypervisor that virtualizes the already
//! running operating system in place. After [`Hypervisor::start`] every
//! logical processor keeps executing the exact same code it was executing
//! before, but as a VMX non-root guest whose VM-exits are routed through a
//! user-composable chain of handler tables.
//!
//! The crate is freestanding; the OS driver that embeds it supplies the
//! services described in [`platform`] (contiguous non-paged memory, address
//! translation, an IPI-style broadcast and a log sink) and everything else
//! is built here: the bump arena backing all VMX structures, the MTRR-aware
//! identity EPT with 2MB split/join support, per-processor VMCS bring-up and
//! the VM-exit dispatch machinery.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod chain;
pub mod error;
pub mod hv;
pub mod intel;
pub mod logger;
pub mod mm;
pub mod physmem;
pub mod platform;

pub use chain::{HandlerChain, HandlerTable};
pub use error::HypervisorError;
pub use hv::{Hypervisor, HvOptions};
