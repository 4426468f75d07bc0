//! The runtime singleton
//!
//! Owns every subsystem and wires them together: registry, heap, code
//! heap, JIT, loader, collector, scheduler, and the managed surface
//! (exception machinery, allocation entry points, managed invocation).
//! Helpers called from emitted code reach it through [`runtime`].

pub mod corlib;

use crate::eh::{self, EhContext, Outcome};
use crate::fault::FaultKind;
use crate::gc::{Collector, Handle, HandleKind, HandleTable, Heap, ObjHeader, TLAB_SIZE};
use crate::jit::code_heap::CodeHeap;
use crate::jit::trampoline::{
    emit_funclet_invoker, emit_invoke_thunk, emit_prepare_stub, FuncletInvokerFn, HelperTable,
    InvokeThunkFn, RuntimeContext,
};
use crate::jit::{JitCompiler, JitError};
use crate::loader::{EntryProvider, LoadError, Loader, MethodEnv, ModuleId};
use crate::object::GcRef;
use crate::sched::{Scheduler, ThreadRecord};
use crate::types::{MethodDesc, TypeDesc, TypeRegistry};
use argon_bytecode::Token;
use argon_hal::KernelServices;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

static RUNTIME: OnceCell<&'static Runtime> = OnceCell::new();

/// The installed runtime.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("runtime not initialized")
}

/// The helper table (test scaffolding needs the pointer without a full
/// runtime).
pub(crate) fn helpers_for_tests() -> &'static HelperTable {
    crate::jit::helpers::table()
}

/// The managed runtime.
pub struct Runtime {
    /// Boot collaborators.
    pub services: KernelServices,
    /// Canonical type table.
    pub registry: &'static TypeRegistry,
    /// Managed heap.
    pub heap: &'static Heap,
    /// GC handles.
    pub handles: &'static HandleTable,
    /// Executable code.
    pub code_heap: &'static CodeHeap,
    /// Tier-0 compiler.
    pub jit: JitCompiler,
    /// Assembly loader.
    pub loader: Loader,
    /// Garbage collector.
    pub collector: Collector,
    /// Thread scheduler.
    pub scheduler: Scheduler,
    invoke_thunk: OnceCell<usize>,
    funclet_invoker: OnceCell<usize>,
    system_module: OnceCell<ModuleId>,
    fault_types: OnceCell<FxHashMap<FaultKind, &'static TypeDesc>>,
    preallocated_oom: OnceCell<Handle>,
    boot_thread: OnceCell<Arc<ThreadRecord>>,
}

impl Runtime {
    /// Build and install the runtime over the boot collaborators.
    pub fn create(services: KernelServices) -> &'static Runtime {
        fn leak<T>(v: T) -> &'static T {
            Box::leak(Box::new(v))
        }
        let registry = leak(TypeRegistry::new());
        let heap = leak(Heap::new(services));
        let handles = leak(HandleTable::new());
        let code_heap = leak(CodeHeap::new(services));

        let rt: &'static Runtime = leak(Runtime {
            services,
            registry,
            heap,
            handles,
            code_heap,
            jit: JitCompiler::new(code_heap),
            loader: Loader::new(registry, heap, handles),
            collector: Collector::new(heap, code_heap, handles, services),
            scheduler: Scheduler::new(
                services,
                crate::jit::helpers::table(),
                std::ptr::null(),
            ),
            invoke_thunk: OnceCell::new(),
            funclet_invoker: OnceCell::new(),
            system_module: OnceCell::new(),
            fault_types: OnceCell::new(),
            preallocated_oom: OnceCell::new(),
            boot_thread: OnceCell::new(),
        });

        rt.scheduler.set_runtime(rt as *const Runtime as *const ());
        rt.loader.set_entry_provider(rt);
        Scheduler::install(&rt.scheduler);

        let thunk = emit_invoke_thunk();
        let invoker = emit_funclet_invoker();
        rt.invoke_thunk
            .set(rt.code_heap.publish(&thunk, None).expect("invoke thunk"))
            .unwrap();
        rt.funclet_invoker
            .set(rt.code_heap.publish(&invoker, None).expect("funclet invoker"))
            .unwrap();

        RUNTIME.set(rt).ok().expect("runtime created twice");
        rt
    }

    /// Load the system module and preallocate the fault machinery.
    pub fn init_system(&'static self) -> Result<(), LoadError> {
        let id = self.loader.load_module(corlib::build())?;
        self.system_module.set(id).ok();

        let module = self.loader.module(id);
        let mut map = FxHashMap::default();
        for kind in FaultKind::all() {
            let row = module
                .parsed
                .types
                .iter()
                .position(|t| t.name == kind.type_name())
                .expect("fault type missing from system module");
            let resolved = match self.loader.resolve_token(id, Token::type_def(row as u32)) {
                Ok(crate::loader::Resolved::Type(td)) => td,
                _ => panic!("fault type failed to resolve"),
            };
            map.insert(*kind, resolved);
        }
        self.fault_types.set(map).ok();

        // One OutOfMemory instance lives forever so the raise path never
        // allocates under pressure
        let oom_td = self.fault_type(FaultKind::OutOfMemory);
        let oom = self
            .heap
            .alloc_object(oom_td)
            .expect("preallocating OutOfMemory");
        self.preallocated_oom
            .set(self.handles.create(oom, HandleKind::Strong))
            .ok();
        log::info!("runtime: system module ready");
        Ok(())
    }

    /// The system module's id.
    pub fn system_module(&self) -> ModuleId {
        *self.system_module.get().expect("system module not loaded")
    }

    /// Exception descriptor for a fault kind.
    pub fn fault_type(&self, kind: FaultKind) -> &'static TypeDesc {
        self.fault_types.get().expect("fault types not resolved")[&kind]
    }

    /// Mark the thread whose unhandled exceptions halt the kernel.
    pub fn set_boot_thread(&self, thread: Arc<ThreadRecord>) {
        self.boot_thread.set(thread).ok();
    }

    /// Whether `thread` is the boot thread.
    pub fn is_boot_thread(&self, thread: &ThreadRecord) -> bool {
        self.boot_thread
            .get()
            .is_some_and(|boot| std::ptr::eq(boot.as_ref(), thread))
    }

    // ===== Compilation =====

    /// Compile (or fetch) the native entry for `md`, honoring
    /// canonical-reference code sharing.
    pub fn prepare(&'static self, md: &'static MethodDesc) -> Result<usize, JitError> {
        let canonical = self
            .loader
            .canonical_method_of(md)
            .map_err(|_| JitError::Unresolved(0))?;
        let env = MethodEnv::new(&self.loader, canonical).map_err(|err| {
            log::warn!("prepare {}::{}: {err}", md.declaring().name, md.name);
            JitError::Unresolved(0)
        })?;
        let entry = self.jit.compile(canonical, &env)?;
        if !std::ptr::eq(canonical, md) {
            md.publish_entry(entry);
        }
        Ok(entry)
    }

    // ===== Allocation =====

    /// Allocate a plain object, bump-allocating from the thread's TLAB
    /// when possible, collecting under pressure.
    pub fn alloc_object(
        &'static self,
        ctx: *mut RuntimeContext,
        td: &'static TypeDesc,
        rbp: usize,
        pc: usize,
    ) -> GcRef {
        let size = ((td.size.max(16) + 7) & !7) as usize;
        if td.finalizer().is_none() && size < TLAB_SIZE / 4 {
            if let Some(obj) = self.try_tlab_alloc(ctx, td, size, rbp, pc) {
                return obj;
            }
        }
        self.alloc_raising(ctx, rbp, pc, || self.heap.alloc_object(td))
    }

    fn try_tlab_alloc(
        &'static self,
        ctx: *mut RuntimeContext,
        td: &'static TypeDesc,
        size: usize,
        rbp: usize,
        pc: usize,
    ) -> Option<GcRef> {
        // Safety: ctx belongs to the calling thread
        let ctx_ref = unsafe { &*ctx };
        loop {
            let ptr = ctx_ref.tlab_ptr.load(Ordering::Relaxed);
            let end = ctx_ref.tlab_end.load(Ordering::Relaxed);
            if ptr != 0 && ptr + size <= end {
                ctx_ref.tlab_ptr.store(ptr + size, Ordering::Relaxed);
                // Safety: TLAB memory is zeroed and exclusively ours
                unsafe {
                    ObjHeader::init(ptr as *mut u8, td);
                    return GcRef::from_ptr(ptr as *mut u8);
                }
            }
            // Refill, collecting first when the heap has grown enough
            if self.heap.should_collect() {
                self.collect_from(ctx, rbp, pc);
            }
            match self.heap.carve_tlab() {
                Ok((start, new_end)) => {
                    ctx_ref.tlab_ptr.store(start, Ordering::Relaxed);
                    ctx_ref.tlab_end.store(new_end, Ordering::Relaxed);
                }
                Err(_) => {
                    self.collect_from(ctx, rbp, pc);
                    match self.heap.carve_tlab() {
                        Ok((start, new_end)) => {
                            ctx_ref.tlab_ptr.store(start, Ordering::Relaxed);
                            ctx_ref.tlab_end.store(new_end, Ordering::Relaxed);
                        }
                        // Fall through to the raising path
                        Err(_) => return None,
                    }
                }
            }
        }
    }

    /// Run an allocation, collecting once on failure and raising
    /// OutOfMemory if it still fails.
    pub fn alloc_raising(
        &'static self,
        ctx: *mut RuntimeContext,
        rbp: usize,
        pc: usize,
        alloc: impl Fn() -> Result<GcRef, FaultKind>,
    ) -> GcRef {
        if self.heap.should_collect() {
            self.collect_from(ctx, rbp, pc);
        }
        match alloc() {
            Ok(obj) => obj,
            Err(_) => {
                self.collect_from(ctx, rbp, pc);
                match alloc() {
                    Ok(obj) => obj,
                    Err(_) => self.raise(ctx, FaultKind::OutOfMemory, rbp, pc),
                }
            }
        }
    }

    /// Trigger a collection from a managed allocation site.
    pub fn collect_from(&'static self, ctx: *mut RuntimeContext, rbp: usize, pc: usize) {
        // Safety: ctx belongs to the calling thread
        let thread = unsafe { &*((*ctx).thread as *const ThreadRecord) };
        let modules = self.loader.modules();
        self.collector
            .collect(&self.scheduler, &modules, Some((thread, pc, rbp)));
        // Compaction moved slabs out from under every TLAB
        for t in self.scheduler.threads() {
            t.rt_ctx.tlab_ptr.store(0, Ordering::Release);
            t.rt_ctx.tlab_end.store(0, Ordering::Release);
        }
    }

    // ===== Exceptions =====

    /// Allocate an exception object for a fault kind. OutOfMemory uses
    /// the preallocated instance.
    pub fn new_exception(&'static self, kind: FaultKind) -> GcRef {
        if kind == FaultKind::OutOfMemory {
            return self.preallocated_oom();
        }
        let td = self.fault_type(kind);
        match self.heap.alloc_object(td) {
            Ok(obj) => {
                if let Ok(message) = self
                    .heap
                    .alloc_string_from(self.registry.string(), &kind.to_string())
                {
                    // Safety: message field offset is fixed by the system
                    // module layout
                    unsafe {
                        obj.write_ref(corlib::EXCEPTION_MESSAGE_OFFSET, Some(message));
                    }
                }
                obj
            }
            Err(_) => self.preallocated_oom(),
        }
    }

    fn preallocated_oom(&self) -> GcRef {
        self.handles
            .get(*self.preallocated_oom.get().expect("oom not preallocated"))
            .expect("oom handle cleared")
    }

    /// Raise a fault at a managed site. Never returns.
    pub fn raise(
        &'static self,
        ctx: *mut RuntimeContext,
        kind: FaultKind,
        rbp: usize,
        pc: usize,
    ) -> ! {
        let exception = self.new_exception(kind);
        self.dispatch_exception(ctx, exception, rbp, pc)
    }

    /// Dispatch a thrown exception. Never returns.
    pub fn dispatch_exception(
        &'static self,
        ctx: *mut RuntimeContext,
        exception: GcRef,
        rbp: usize,
        pc: usize,
    ) -> ! {
        // Safety: ctx belongs to the calling thread
        let thread = unsafe { &*((*ctx).thread as *const ThreadRecord) };
        let invoker: FuncletInvokerFn = unsafe {
            std::mem::transmute::<usize, FuncletInvokerFn>(
                *self.funclet_invoker.get().expect("invoker not emitted"),
            )
        };
        let eh = EhContext {
            code_heap: self.code_heap,
            handles: self.handles,
            cpu: self.services.cpu,
            invoker,
            rt_ctx: ctx,
            thread,
        };
        match eh::dispatch(&eh, exception, pc, rbp) {
            Outcome::Unhandled => self.on_unhandled(thread),
        }
    }

    fn on_unhandled(&'static self, thread: &ThreadRecord) -> ! {
        let kind = thread
            .died_unhandled
            .lock()
            .clone()
            .unwrap_or_else(|| "<unknown>".into());
        log::error!("unhandled exception {kind} on thread {:?}", thread.id);
        if self.is_boot_thread(thread) {
            self.services
                .console
                .write(&format!("argon: unhandled exception {kind} on boot thread; halting\n"));
            self.services.cpu.halt();
        }
        let current = self
            .scheduler
            .current()
            .expect("faulting thread not current");
        debug_assert!(std::ptr::eq(current.as_ref(), thread));
        self.scheduler.exit_current(&current)
    }

    // ===== Managed invocation =====

    /// Call a managed entry point with raw argument words.
    ///
    /// # Safety
    ///
    /// `entry` must be a managed entry point whose signature matches
    /// `args`; `ctx` must be the calling thread's context.
    pub unsafe fn invoke_raw(
        &self,
        entry: usize,
        args: &[u64],
        ctx: *mut RuntimeContext,
        ret_is_float: bool,
    ) -> u64 {
        let thunk: InvokeThunkFn = std::mem::transmute::<usize, InvokeThunkFn>(
            *self.invoke_thunk.get().expect("invoke thunk not emitted"),
        );
        thunk(
            entry,
            args.as_ptr(),
            args.len(),
            ctx,
            usize::from(ret_is_float),
        )
    }

    /// Call a method descriptor with raw argument words.
    ///
    /// # Safety
    ///
    /// As for [`Runtime::invoke_raw`].
    pub unsafe fn invoke_method(
        &self,
        md: &'static MethodDesc,
        args: &[u64],
        ctx: *mut RuntimeContext,
    ) -> u64 {
        let ret_is_float = crate::jit::slot_kind_of(md.sig.ret).is_float();
        self.invoke_raw(md.entry_point(), args, ctx, ret_is_float)
    }
}

impl EntryProvider for Runtime {
    fn trampoline_for(&self, md: &'static MethodDesc) -> usize {
        let stub = emit_prepare_stub(
            md as *const MethodDesc as usize,
            crate::jit::helpers::prepare_entry(),
        );
        self.code_heap
            .publish(&stub, None)
            .expect("code heap exhausted emitting a prepare stub")
    }
}
