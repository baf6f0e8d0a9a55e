//! The hypervisor facade: fleet-wide start and stop.
//!
//! `start` builds the arena and the shared descriptors at passive level,
//! then virtualizes every logical processor through the OS broadcast
//! primitive. If any processor fails, every one that launched is torn
//! down again before the error is returned, so a failed start leaves the
//! machine untouched. `stop` broadcasts the teardown VMCALL and releases
//! everything; a stopped hypervisor can be started again without memory
//! growth.

use {
    crate::{
        chain::{ExitStats, HandlerChain},
        error::HypervisorError,
        intel::{
            support,
            vcpu::{Vcpu, VcpuState},
            vmexit::vmcall::VMCALL_TEARDOWN,
        },
        mm, physmem::PhysicalMemoryDescriptor,
        platform,
    },
    alloc::{boxed::Box, vec::Vec},
    core::{
        ffi::c_void,
        sync::atomic::{AtomicBool, Ordering},
    },
    log::{debug, error, info},
    spin::Mutex,
};

/// Tunables for [`Hypervisor::start`].
#[derive(Debug, Clone, Copy)]
pub struct HvOptions {
    /// Size of the memory arena backing all VMX structures, in 4KB pages.
    pub arena_pages: usize,

    /// Exit on every I/O port access instead of only bitmap-selected
    /// ports. Expensive; meant for exhaustive I/O tracing.
    pub unconditional_io_exiting: bool,
}

impl Default for HvOptions {
    fn default() -> Self {
        Self { arena_pages: 1024, unconditional_io_exiting: false }
    }
}

/// A running (or stopped) hypervisor instance.
pub struct Hypervisor {
    vcpus: Vec<Box<Vcpu>>,
    chain: &'static HandlerChain,
    physmem: PhysicalMemoryDescriptor,
}

/// Shared context for the bring-up broadcast. Every processor touches
/// only its own VCPU slot.
struct StartContext {
    vcpus: *mut Box<Vcpu>,
    vcpu_count: usize,
    physmem: *const PhysicalMemoryDescriptor,
    unconditional_io_exiting: bool,
    failed: AtomicBool,
    first_error: Mutex<Option<HypervisorError>>,
}

unsafe impl Sync for StartContext {}

fn start_callback(context: *mut c_void) {
    let context = unsafe { &*(context as *const StartContext) };
    let index = (platform::ops().current_processor)() as usize;

    if index >= context.vcpu_count {
        context.failed.store(true, Ordering::SeqCst);
        return;
    }

    let vcpu = unsafe { &mut *context.vcpus.add(index) };
    let physmem = unsafe { &*context.physmem };

    if let Err(e) = vcpu.virtualize(physmem, context.unconditional_io_exiting) {
        error!("processor {} failed to virtualize: {}", index, e);
        context.failed.store(true, Ordering::SeqCst);
        context.first_error.lock().get_or_insert(e);
    }
}

/// Teardown broadcast: issue the 0xFF VMCALL on every processor that is
/// still virtualized. The call "returns" with VMX already disabled.
struct StopContext {
    vcpus: *mut Box<Vcpu>,
    vcpu_count: usize,
}

unsafe impl Sync for StopContext {}

fn stop_callback(context: *mut c_void) {
    let context = unsafe { &*(context as *const StopContext) };
    let index = (platform::ops().current_processor)() as usize;

    if index >= context.vcpu_count {
        return;
    }

    let vcpu = unsafe { &mut *context.vcpus.add(index) };
    if vcpu.state() == VcpuState::Launched {
        support::vmcall(VMCALL_TEARDOWN, 0, 0);
        debug!("processor {} devirtualized", index);
    }
}

impl Hypervisor {
    /// Virtualizes every logical processor with the given handler chain.
    pub fn start(options: HvOptions, chain: HandlerChain) -> Result<Self, HypervisorError> {
        if platform::try_ops().is_none() {
            return Err(HypervisorError::PlatformNotInitialized);
        }

        if chain.is_empty() || options.arena_pages == 0 {
            return Err(HypervisorError::InvalidArgument);
        }

        mm::init(options.arena_pages)?;

        match Self::start_with_arena(options, chain) {
            Ok(hypervisor) => Ok(hypervisor),
            Err(error) => {
                mm::shutdown();
                Err(error)
            }
        }
    }

    fn start_with_arena(options: HvOptions, chain: HandlerChain) -> Result<Self, HypervisorError> {
        let ops = platform::ops();
        let physmem = PhysicalMemoryDescriptor::snapshot()?;

        // The chain must outlive every VM-exit; it is reclaimed at stop.
        let chain: &'static HandlerChain = Box::leak(Box::new(chain));

        let processor_count = (ops.processor_count)() as usize;
        let mut vcpus: Vec<Box<Vcpu>> =
            (0..processor_count).map(|index| Box::new(Vcpu::new(index as u32, chain))).collect();

        info!("starting on {} processors", processor_count);

        let start_context = StartContext {
            vcpus: vcpus.as_mut_ptr(),
            vcpu_count: vcpus.len(),
            physmem: &physmem,
            unconditional_io_exiting: options.unconditional_io_exiting,
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        };

        let broadcast_ok = (ops.run_on_all_processors)(
            start_callback,
            &start_context as *const StartContext as *mut c_void,
        );

        if !broadcast_ok {
            start_context.failed.store(true, Ordering::SeqCst);
        }

        if start_context.failed.load(Ordering::SeqCst) {
            // Unwind the processors that did launch.
            Self::devirtualize_all(&mut vcpus);
            Self::release_chain(chain);

            let error = start_context
                .first_error
                .lock()
                .take()
                .unwrap_or(HypervisorError::InvalidArgument);
            return Err(error);
        }

        info!("hypervisor started; arena usage {} KB", mm::manager().used() / 1024);

        Ok(Self { vcpus, chain, physmem })
    }

    /// Devirtualizes every processor and releases all resources.
    pub fn stop(mut self) {
        info!("stopping hypervisor");

        Self::devirtualize_all(&mut self.vcpus);

        self.vcpus.clear();
        Self::release_chain(self.chain);
        mm::shutdown();

        info!("hypervisor stopped");
    }

    fn devirtualize_all(vcpus: &mut [Box<Vcpu>]) {
        let stop_context = StopContext { vcpus: vcpus.as_mut_ptr(), vcpu_count: vcpus.len() };

        (platform::ops().run_on_all_processors)(
            stop_callback,
            &stop_context as *const StopContext as *mut c_void,
        );
    }

    fn release_chain(chain: &'static HandlerChain) {
        drop(unsafe { Box::from_raw(chain as *const HandlerChain as *mut HandlerChain) });
    }

    /// The physical memory layout the EPTs were built from.
    pub fn physical_memory(&self) -> &PhysicalMemoryDescriptor {
        &self.physmem
    }

    pub fn processor_count(&self) -> usize {
        self.vcpus.len()
    }

    /// A snapshot of the exit counters of one processor, if the stats
    /// layer is installed.
    pub fn stats(&self, processor: usize) -> Option<ExitStats> {
        self.vcpus.get(processor).map(|vcpu| vcpu.stats.snapshot())
    }
}
