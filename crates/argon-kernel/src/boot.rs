//! Boot sequence
//!
//! The boot environment finishes CPU bring-up, constructs the HAL
//! collaborators, parses the workload assemblies, and hands everything
//! to [`boot`]. Initialization order: diagnostics, runtime (registry,
//! heap, code heap, JIT, loader, collector, scheduler), system module,
//! fault machinery, finalizer thread, workload modules, then the entry
//! thread. After that the bootstrap context becomes CPU 0's dispatcher.
//! Application processors enter [`secondary_cpu_entry`].

use crate::runtime::{runtime, Runtime};
use argon_bytecode::ParsedModule;
use argon_hal::{CpuId, KernelServices};
use log::LevelFilter;

/// Bring up the managed core and run the workload. Never returns.
pub fn boot(services: KernelServices, assemblies: Vec<ParsedModule>) -> ! {
    crate::diag::init(services.console, LevelFilter::Info);
    log::info!(
        "argon: booting managed core on {} CPUs",
        services.topology.cpus().len()
    );

    let rt = Runtime::create(services);
    rt.init_system().expect("system module failed to load");
    start_finalizer_thread(rt);

    // Load the workload; the first executable module supplies the entry
    let mut entry = None;
    for parsed in assemblies {
        let name = parsed.name.clone();
        let id = match rt.loader.load_module(parsed) {
            Ok(id) => id,
            Err(err) => panic!("loading {name}: {err}"),
        };
        if entry.is_none() {
            if let Ok(md) = rt.loader.entry_point(id) {
                entry = Some(md);
            }
        }
    }
    let entry = entry.expect("no assembly declares an entry point");
    log::info!("argon: entry {}::{}", entry.declaring().name, entry.name);

    // The entry thread is the boot thread: unhandled exceptions on it
    // halt the kernel
    let thread = rt
        .scheduler
        .spawn(Box::new(move || {
            let rt = runtime();
            let current = rt.scheduler.current().expect("entry thread not current");
            // Safety: entry takes no arguments by construction
            let code = unsafe { rt.invoke_method(entry, &[], current.ctx_ptr()) };
            log::info!("argon: entry returned {}", code as i64);
        }))
        .expect("spawning the entry thread");
    rt.set_boot_thread(thread);

    rt.scheduler.start_timer(crate::sched::DEFAULT_TICK_NS);
    // Safety: called once on the bootstrap CPU
    unsafe { rt.scheduler.run_cpu(CpuId(0)) }
}

/// Entry point for application processors, called by the boot
/// environment once per secondary CPU.
///
/// # Safety
///
/// Must run after [`boot`] has installed the runtime, exactly once per
/// CPU, on that CPU.
pub unsafe fn secondary_cpu_entry(cpu: CpuId) -> ! {
    let rt = runtime();
    rt.scheduler.start_timer(crate::sched::DEFAULT_TICK_NS);
    rt.scheduler.run_cpu(cpu)
}

/// Spawn the dedicated finalizer thread. It behaves as an ordinary
/// mutator: invoking finalizers polls safepoints, and the thread sleeps
/// between batches.
fn start_finalizer_thread(rt: &'static Runtime) {
    rt.scheduler
        .spawn(Box::new(|| {
            let rt = runtime();
            let current = rt.scheduler.current().expect("finalizer thread not current");
            loop {
                while let Some(obj) = rt.collector.finalizer.dequeue() {
                    let Some(finalizer) = obj.td().finalizer() else {
                        continue;
                    };
                    // Hold the object across the managed call
                    let handle = rt
                        .handles
                        .create(obj, crate::gc::HandleKind::Strong);
                    let target = rt.handles.get(handle).unwrap();
                    // Safety: finalizers are instance methods of the target
                    unsafe {
                        rt.invoke_method(
                            finalizer,
                            &[target.addr() as u64],
                            current.ctx_ptr(),
                        );
                    }
                    rt.handles.drop_handle(handle);
                }
                // Park until the next batch; the timer wakes us to re-check
                let deadline = rt.services.timer.now_ns() + 10_000_000;
                rt.scheduler.block_current(&current, Some(deadline));
            }
        }))
        .expect("spawning the finalizer thread");
}
