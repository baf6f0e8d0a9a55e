//! Handler composition: an ordered chain of dispatch tables.
//!
//! Each layer is a table of per-exit-reason function pointers plus
//! optional per-VCPU setup/teardown hooks. Dispatch picks the topmost
//! layer with a non-null entry for the reason; a layer that only wants to
//! observe calls [`delegate`] to fall through to the next one below it.
//! The bottom layer is normally [`HandlerTable::passthrough`], which
//! emulates faithfully enough that an unhooked guest cannot tell it is
//! virtualized.
//!
//! Built-in layers:
//! - **stats** counts exits per reason into the VCPU.
//! - **dbgbreak** breaks into the kernel debugger on watched I/O ports.
//! - **ept_hook** implements the 0xC1/0xC2 execute-only page hooks and
//!   the CPUID identification leaf.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            ept::AccessType,
            invept::invept_single_context,
            support::{self, vmread, Cr3Guard},
            vcpu::Vcpu,
            vmerror::{VmxBasicExitReason, MAX_EXIT_REASON},
            vmexit::{
                control_register, cpuid, debug_register, dt, ept, exception, io, misc, msr,
                vmcall, vmxinstr, xsetbv, ExitContext, ExitType,
            },
        },
        mm,
    },
    alloc::vec::Vec,
    core::ffi::c_void,
    lazy_static::lazy_static,
    log::{debug, trace},
    spin::Mutex,
    x86::vmx::vmcs::guest,
};

/// One VM-exit handler. Gets the VCPU and the transient exit context;
/// decides how the guest resumes.
pub type ExitHandler = fn(&mut Vcpu, &mut ExitContext<'_>) -> Result<ExitType, HypervisorError>;

/// Per-VCPU setup hook, run after the VMCS is populated and before launch.
pub type SetupHook = fn(&mut Vcpu) -> Result<(), HypervisorError>;

/// Per-VCPU teardown hook, run right before VMX is disabled.
pub type TeardownHook = fn(&mut Vcpu);

/// One dispatch table: a layer of the handler chain.
pub struct HandlerTable {
    pub name: &'static str,
    entries: [Option<ExitHandler>; MAX_EXIT_REASON],
    setup: Option<SetupHook>,
    teardown: Option<TeardownHook>,
}

impl HandlerTable {
    /// An empty layer; populate it with [`Self::set`].
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: [None; MAX_EXIT_REASON], setup: None, teardown: None }
    }

    /// Installs `handler` for `reason`, replacing any previous entry.
    pub fn set(mut self, reason: VmxBasicExitReason, handler: ExitHandler) -> Self {
        self.entries[reason.index()] = Some(handler);
        self
    }

    pub fn on_setup(mut self, hook: SetupHook) -> Self {
        self.setup = Some(hook);
        self
    }

    pub fn on_teardown(mut self, hook: TeardownHook) -> Self {
        self.teardown = Some(hook);
        self
    }

    pub fn handler(&self, reason: VmxBasicExitReason) -> Option<ExitHandler> {
        self.entries[reason.index()]
    }

    /// The baseline: every reason the hypervisor can take by default is
    /// emulated so the guest keeps running as if on bare metal.
    pub fn passthrough() -> Self {
        use VmxBasicExitReason::*;

        Self::new("passthrough")
            .set(ExceptionOrNmi, exception::handle_exception_or_nmi)
            .set(ExternalInterrupt, exception::handle_external_interrupt)
            .set(TripleFault, exception::handle_triple_fault)
            .set(Cpuid, cpuid::handle_cpuid)
            .set(Getsec, misc::handle_getsec)
            .set(Hlt, misc::handle_hlt)
            .set(Invd, misc::handle_invd)
            .set(Invlpg, misc::handle_invlpg)
            .set(Rdpmc, misc::handle_rdpmc)
            .set(Rdtsc, misc::handle_rdtsc)
            .set(Rdtscp, misc::handle_rdtscp)
            .set(Vmcall, vmcall::handle_vmcall)
            .set(Vmclear, vmxinstr::handle_vmx_instruction)
            .set(Vmlaunch, vmxinstr::handle_vmx_instruction)
            .set(Vmptrld, vmxinstr::handle_vmx_instruction)
            .set(Vmptrst, vmxinstr::handle_vmx_instruction)
            .set(Vmread, vmxinstr::handle_vmx_instruction)
            .set(Vmresume, vmxinstr::handle_vmx_instruction)
            .set(Vmwrite, vmxinstr::handle_vmx_instruction)
            .set(Vmxoff, vmxinstr::handle_vmx_instruction)
            .set(Vmxon, vmxinstr::handle_vmx_instruction)
            .set(Invept, vmxinstr::handle_vmx_instruction)
            .set(Invvpid, vmxinstr::handle_vmx_instruction)
            .set(Vmfunc, vmxinstr::handle_vmx_instruction)
            .set(ControlRegisterAccesses, control_register::handle_cr_access)
            .set(MovDr, debug_register::handle_dr_access)
            .set(IoInstruction, io::handle_io_instruction)
            .set(Rdmsr, msr::handle_rdmsr)
            .set(Wrmsr, msr::handle_wrmsr)
            .set(Mwait, misc::handle_monitor_mwait)
            .set(Monitor, misc::handle_monitor_mwait)
            .set(Pause, misc::handle_pause)
            .set(AccessToGdtrOrIdtr, dt::handle_gdtr_idtr_access)
            .set(AccessToLdtrOrTr, dt::handle_ldtr_tr_access)
            .set(EptViolation, ept::handle_ept_violation)
            .set(EptMisconfiguration, ept::handle_ept_misconfiguration)
            .set(WbinvdOrWbnoinvd, misc::handle_wbinvd)
            .set(Xsetbv, xsetbv::handle_xsetbv)
    }

    /// Counts every exit by reason, then falls through.
    pub fn stats() -> Self {
        let mut table = Self::new("stats");
        for slot in table.entries.iter_mut() {
            *slot = Some(stats_count_and_delegate);
        }
        table
    }

    /// Breaks into the kernel debugger on watched I/O ports, then falls
    /// through. Watches the keyboard controller port by default.
    pub fn dbgbreak() -> Self {
        dbgbreak_watch_port(DBGBREAK_DEFAULT_PORT, true);

        Self::new("dbgbreak")
            .set(VmxBasicExitReason::IoInstruction, dbgbreak_io)
            .on_setup(dbgbreak_setup)
    }

    /// The sample stealth-hook layer: execute-only page hooks driven by
    /// the 0xC1/0xC2 VMCALLs, plus the identification CPUID leaf.
    pub fn ept_hook() -> Self {
        Self::new("ept_hook")
            .set(VmxBasicExitReason::Cpuid, ept_hook_cpuid)
            .set(VmxBasicExitReason::Vmcall, ept_hook_vmcall)
            .set(VmxBasicExitReason::EptViolation, ept_hook_violation)
            .on_setup(ept_hook_setup)
            .on_teardown(ept_hook_teardown)
    }
}

/// The ordered chain; index 0 dispatches first.
pub struct HandlerChain {
    layers: Vec<HandlerTable>,
}

impl HandlerChain {
    /// A chain holding only the passthrough baseline.
    pub fn passthrough() -> Self {
        Self { layers: alloc::vec![HandlerTable::passthrough()] }
    }

    /// Stacks `layer` on top of the existing chain.
    pub fn with_layer(mut self, layer: HandlerTable) -> Self {
        self.layers.insert(0, layer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs the topmost handler registered for the context's exit reason.
    pub fn dispatch(&self, vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
        self.dispatch_from(0, vcpu, context)
    }

    pub(crate) fn dispatch_from(
        &self,
        first_layer: usize,
        vcpu: &mut Vcpu,
        context: &mut ExitContext<'_>,
    ) -> Result<ExitType, HypervisorError> {
        let index = context.exit_reason.index();

        for (layer_index, table) in self.layers.iter().enumerate().skip(first_layer) {
            if let Some(handler) = table.entries[index] {
                context.layer = layer_index;
                return handler(vcpu, context);
            }
        }

        Err(HypervisorError::UnhandledExitReason(index as u32))
    }

    /// Runs every layer's setup hook, topmost last so lower layers are
    /// ready when upper ones come up.
    pub fn run_setup(&self, vcpu: &mut Vcpu) -> Result<(), HypervisorError> {
        for table in self.layers.iter().rev() {
            if let Some(setup) = table.setup {
                trace!("layer {} setup on processor {}", table.name, vcpu.index);
                setup(vcpu)?;
            }
        }
        Ok(())
    }

    /// Runs every layer's teardown hook, topmost first.
    pub fn run_teardown(&self, vcpu: &mut Vcpu) {
        for table in self.layers.iter() {
            if let Some(teardown) = table.teardown {
                teardown(vcpu);
            }
        }
    }
}

/// Falls through to the next layer below the one currently running.
pub fn delegate(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let chain = vcpu.chain;
    let current = context.layer;
    chain.dispatch_from(current + 1, vcpu, context)
}

/// Per-VCPU exit counters, indexed by basic exit reason.
#[derive(Clone)]
pub struct ExitStats {
    counts: [u64; MAX_EXIT_REASON],
}

impl ExitStats {
    pub const fn new() -> Self {
        Self { counts: [0; MAX_EXIT_REASON] }
    }

    pub fn record(&mut self, reason: VmxBasicExitReason) {
        self.counts[reason.index()] += 1;
    }

    pub fn count(&self, reason: VmxBasicExitReason) -> u64 {
        self.counts[reason.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// A copy consistent enough for reporting; the owner keeps counting.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

impl Default for ExitStats {
    fn default() -> Self {
        Self::new()
    }
}

fn stats_count_and_delegate(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    vcpu.stats.record(context.exit_reason);
    delegate(vcpu, context)
}

/// The keyboard controller command/status port, the classic thing to
/// watch.
pub const DBGBREAK_DEFAULT_PORT: u16 = 0x64;

lazy_static! {
    /// Ports the dbgbreak layer watches; shared by all processors.
    static ref DBGBREAK_PORTS: Mutex<[u64; 1024]> = Mutex::new([0; 1024]);
}

/// Adds or removes a port from the dbgbreak watch set. Takes effect on
/// VCPUs brought up afterwards.
pub fn dbgbreak_watch_port(port: u16, watch: bool) {
    let mut ports = DBGBREAK_PORTS.lock();
    let word = usize::from(port) / 64;
    let bit = u64::from(port) % 64;
    if watch {
        ports[word] |= 1 << bit;
    } else {
        ports[word] &= !(1 << bit);
    }
}

fn dbgbreak_is_watched(port: u16) -> bool {
    let ports = DBGBREAK_PORTS.lock();
    ports[usize::from(port) / 64] & (1 << (u64::from(port) % 64)) != 0
}

/// Mirrors the watch set into the VCPU's I/O bitmaps so the accesses
/// actually exit.
fn dbgbreak_setup(vcpu: &mut Vcpu) -> Result<(), HypervisorError> {
    let ports = DBGBREAK_PORTS.lock();
    for (word_index, word) in ports.iter().enumerate() {
        let mut remaining = *word;
        while remaining != 0 {
            let bit = remaining.trailing_zeros();
            vcpu.trace_io_port((word_index * 64) as u16 + bit as u16, true);
            remaining &= remaining - 1;
        }
    }
    Ok(())
}

fn dbgbreak_io(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let port = io::IoQualification(context.exit_qualification).port();

    if dbgbreak_is_watched(port) && (crate::platform::ops().debugger_present)() {
        debug!("dbgbreak: port {:#x} accessed at RIP {:#x}", port, context.registers.rip);
        support::int3();
    }

    delegate(vcpu, context)
}

/// Per-VCPU state of the ept_hook layer, stowed in the VCPU's user-data
/// slot. Lives in the arena because it is created at bring-up, where the
/// OS heap is off limits.
#[repr(C)]
struct EptHookData {
    /// Physical address of the page reads should see. Zero means no hook.
    page_read: u64,
    /// Physical address of the page executions should fetch from.
    page_exec: u64,
}

fn ept_hook_data(vcpu: &Vcpu) -> Option<&'static mut EptHookData> {
    unsafe { (vcpu.user_data() as *mut EptHookData).as_mut() }
}

fn ept_hook_setup(vcpu: &mut Vcpu) -> Result<(), HypervisorError> {
    let data = mm::manager().alloc(core::mem::size_of::<EptHookData>())?;
    vcpu.set_user_data(data.as_ptr() as *mut c_void);
    Ok(())
}

fn ept_hook_teardown(vcpu: &mut Vcpu) {
    // The arena reclaims the data block in bulk; just detach it.
    vcpu.set_user_data(core::ptr::null_mut());
}

/// `'hvpp'`: the identification leaf the conformance tests probe.
const CPUID_IDENTIFICATION_LEAF: u32 = 0x6876_7070;

fn ept_hook_cpuid(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    if context.registers.rax as u32 != CPUID_IDENTIFICATION_LEAF {
        return delegate(vcpu, context);
    }

    // "hello from hvpp\0", packed across the result registers.
    context.registers.rax = u64::from(u32::from_le_bytes(*b"hell"));
    context.registers.rbx = u64::from(u32::from_le_bytes(*b"o fr"));
    context.registers.rcx = u64::from(u32::from_le_bytes(*b"om h"));
    context.registers.rdx = u64::from(u32::from_le_bytes(*b"vpp\0"));

    Ok(ExitType::IncrementRip)
}

fn ept_hook_vmcall(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    match context.registers.rcx {
        vmcall::VMCALL_HOOK_INSTALL => ept_hook_install(vcpu, context),
        vmcall::VMCALL_HOOK_REMOVE => ept_hook_remove(vcpu, context),
        _ => delegate(vcpu, context),
    }
}

/// Installs the execute-only hook: reads of the hooked page see its
/// original bytes, executions fetch the replacement.
fn ept_hook_install(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let Some(data) = ept_hook_data(vcpu) else {
        return delegate(vcpu, context);
    };

    let mm = mm::manager();

    // The VMCALL arguments are guest virtual addresses of the caller's
    // process; translate them under the guest's CR3.
    {
        let _guard = Cr3Guard::new(vmread(guest::CR3));
        data.page_read =
            PhysicalAddress::from_va(context.registers.rdx).align_down_to_base_page().raw();
        data.page_exec =
            PhysicalAddress::from_va(context.registers.r8).align_down_to_base_page().raw();
    }

    debug!("vmcall (hook) EXEC: {:#x} READ: {:#x}", data.page_exec, data.page_read);

    let large_page = PhysicalAddress::from_raw(data.page_exec).align_down_to_large_page().raw();
    let eptp = vcpu.eptp;

    let ept = vcpu.ept.as_mut().ok_or(HypervisorError::InvalidArgument)?;
    ept.split_2mb_to_4kb(large_page, large_page, mm)?;
    ept.map_4kb(data.page_exec, data.page_exec, AccessType::EXECUTE, mm)?;

    // The EPT structure changed beyond a leaf flip; flush this context.
    invept_single_context(eptp);

    Ok(ExitType::IncrementRip)
}

/// Removes the hook by gluing the 2MB page back together, which also
/// restores full access.
fn ept_hook_remove(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let Some(data) = ept_hook_data(vcpu) else {
        return delegate(vcpu, context);
    };

    debug!("vmcall (unhook)");

    let large_page = PhysicalAddress::from_raw(data.page_exec).align_down_to_large_page().raw();
    let eptp = vcpu.eptp;

    let ept = vcpu.ept.as_mut().ok_or(HypervisorError::InvalidArgument)?;
    ept.join_4kb_to_2mb(large_page, large_page, mm::manager())?;

    invept_single_context(eptp);

    data.page_read = 0;
    data.page_exec = 0;

    Ok(ExitType::IncrementRip)
}

/// Flips the hooked page between its read view and its execute view.
///
/// An EPT violation invalidates the cached mappings for the faulting
/// guest-physical address by itself, so no INVEPT is needed for these
/// leaf-only changes; the instruction re-executes and takes the fresh
/// translation.
fn ept_hook_violation(vcpu: &mut Vcpu, context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
    let hooked_page = match ept_hook_data(vcpu) {
        Some(data) if data.page_exec != 0 => (data.page_read, data.page_exec),
        _ => return delegate(vcpu, context),
    };
    let (page_read, page_exec) = hooked_page;

    let faulting_page =
        PhysicalAddress::from_raw(context.guest_physical_address).align_down_to_base_page().raw();
    if faulting_page != page_exec {
        return delegate(vcpu, context);
    }

    let qualification = ept::EptViolationQualification(context.exit_qualification);
    let mm = mm::manager();
    let ept_instance = vcpu.ept.as_mut().ok_or(HypervisorError::InvalidArgument)?;

    if qualification.data_read() || qualification.data_write() {
        trace!("hook read/write at GPA {:#x}", context.guest_physical_address);
        ept_instance.map_4kb(page_exec, page_read, AccessType::READ_WRITE, mm)?;
    } else if qualification.data_execute() {
        trace!("hook execute at GPA {:#x}", context.guest_physical_address);
        ept_instance.map_4kb(page_exec, page_exec, AccessType::EXECUTE, mm)?;
    }

    // Re-run the access against the flipped mapping.
    vcpu.suppress_rip_adjust = true;
    Ok(ExitType::Continue)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::intel::capture::GuestRegisters};

    fn probe_continue(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
        Ok(ExitType::Continue)
    }

    fn probe_increment(_vcpu: &mut Vcpu, _context: &mut ExitContext<'_>) -> Result<ExitType, HypervisorError> {
        Ok(ExitType::IncrementRip)
    }

    #[test]
    fn passthrough_covers_the_baseline_reasons() {
        use VmxBasicExitReason::*;

        let table = HandlerTable::passthrough();
        for reason in [Cpuid, Vmcall, Rdmsr, Wrmsr, IoInstruction, Xsetbv,
                       ControlRegisterAccesses, EptViolation, TripleFault, Hlt] {
            assert!(table.handler(reason).is_some(), "{reason} uncovered");
        }

        // Reasons that cannot occur with the default controls stay empty.
        assert!(table.handler(MonitorTrapFlag).is_none());
        assert!(table.handler(ApicAccess).is_none());
    }

    #[test]
    fn topmost_layer_wins() {
        let chain = HandlerChain::passthrough()
            .with_layer(HandlerTable::new("override").set(VmxBasicExitReason::Cpuid, probe_continue));

        let top = chain.layers[0].handler(VmxBasicExitReason::Cpuid).unwrap();
        assert_eq!(top as usize, probe_continue as usize);

        // Reasons the override does not cover resolve to the baseline.
        assert!(chain.layers[0].handler(VmxBasicExitReason::Hlt).is_none());
        assert!(chain.layers[1].handler(VmxBasicExitReason::Hlt).is_some());
    }

    #[test]
    fn layer_order_is_lifo() {
        let chain = HandlerChain::passthrough()
            .with_layer(HandlerTable::new("first").set(VmxBasicExitReason::Cpuid, probe_continue))
            .with_layer(HandlerTable::new("second").set(VmxBasicExitReason::Cpuid, probe_increment));

        assert_eq!(chain.layers[0].name, "second");
        assert_eq!(chain.layers[1].name, "first");
        assert_eq!(chain.layers[2].name, "passthrough");
    }

    #[test]
    fn stats_layer_counts() {
        let mut stats = ExitStats::new();
        stats.record(VmxBasicExitReason::Cpuid);
        stats.record(VmxBasicExitReason::Cpuid);
        stats.record(VmxBasicExitReason::Hlt);

        assert_eq!(stats.count(VmxBasicExitReason::Cpuid), 2);
        assert_eq!(stats.count(VmxBasicExitReason::Hlt), 1);
        assert_eq!(stats.total(), 3);

        let snapshot = stats.snapshot();
        stats.record(VmxBasicExitReason::Hlt);
        assert_eq!(snapshot.total(), 3);
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn dbgbreak_watch_set_round_trips() {
        dbgbreak_watch_port(0x64, true);
        dbgbreak_watch_port(0x8042, true);

        assert!(dbgbreak_is_watched(0x64));
        assert!(dbgbreak_is_watched(0x8042));
        assert!(!dbgbreak_is_watched(0x60));

        dbgbreak_watch_port(0x8042, false);
        assert!(!dbgbreak_is_watched(0x8042));
    }

    #[test]
    fn identification_leaf_spells_the_greeting() {
        let mut bytes = Vec::new();
        for value in [
            u32::from_le_bytes(*b"hell"),
            u32::from_le_bytes(*b"o fr"),
            u32::from_le_bytes(*b"om h"),
            u32::from_le_bytes(*b"vpp\0"),
        ] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        assert_eq!(bytes.as_slice(), b"hello from hvpp\0");

        let _ = GuestRegisters::default();
        // 'hvpp' as a little-endian immediate.
        assert_eq!(CPUID_IDENTIFICATION_LEAF, u32::from_le_bytes(*b"ppvh"));
    }
}
