//! End-to-end compilation pipeline tests
//!
//! Load a module through the loader, compile methods through the JIT,
//! and check the published artifacts: W^X page discipline, stackmap
//! coverage at safepoints, exception table coverage, and the inline
//! fault checks.

use argon_bytecode::body::{EhKind, EhRegion, InstrWriter, MethodBody};
use argon_bytecode::module::{MethodFlags, MethodRec, TypeDefRec, TypeFlags};
use argon_bytecode::sig::{MethodSig, TypeSig};
use argon_bytecode::{Opcode, ParsedModule, Token};
use argon_kernel::gc::{HandleTable, Heap};
use argon_kernel::hal::mock::{
    FixedTopology, HostMemory, HostPageAllocator, ManualTimer, NullInterrupts, RecordingConsole,
    SingleCpu,
};
use argon_kernel::hal::{KernelServices, PageProt};
use argon_kernel::jit::code_heap::CodeHeap;
use argon_kernel::jit::JitCompiler;
use argon_kernel::loader::{Loader, MethodEnv};
use argon_kernel::types::TypeRegistry;

fn leak<T>(v: T) -> &'static T {
    Box::leak(Box::new(v))
}

struct Env {
    services: KernelServices,
    memory: &'static HostMemory,
    loader: &'static Loader,
    jit: &'static JitCompiler,
}

fn build_env() -> Env {
    let memory = leak(HostMemory::new());
    let services = KernelServices {
        pages: leak(HostPageAllocator::new()),
        memory,
        interrupts: leak(NullInterrupts::new()),
        timer: leak(ManualTimer::new()),
        topology: leak(FixedTopology::new(1)),
        cpu: &SingleCpu,
        console: leak(RecordingConsole::new()),
    };
    let registry = leak(TypeRegistry::new());
    let heap = leak(Heap::new(services));
    let handles = leak(HandleTable::new());
    let loader = leak(Loader::new(registry, heap, handles));
    let code_heap = leak(CodeHeap::new(services));
    let jit = leak(JitCompiler::new(code_heap));
    Env {
        services,
        memory,
        loader,
        jit,
    }
}

fn static_method(name: &str, sig: MethodSig, body: MethodBody) -> MethodRec {
    MethodRec {
        name: name.into(),
        flags: MethodFlags::STATIC,
        sig,
        body: Some(body),
    }
}

fn one_type_module(name: &str, methods: Vec<MethodRec>) -> ParsedModule {
    let mut module = ParsedModule::new(name);
    let count = methods.len() as u32;
    module.methods = methods;
    module.types.push(TypeDefRec {
        namespace: String::new(),
        name: "Program".into(),
        flags: TypeFlags::SEALED,
        base: None,
        interfaces: vec![],
        fields: 0..0,
        methods: 0..count,
        generic_params: 0,
        finalizer: None,
    });
    module.entry_point = Some(Token::method_def(0));
    module
}

fn compile_entry(env: &Env, module: ParsedModule) -> &'static argon_kernel::types::MethodDesc {
    let id = env.loader.load_module(module).unwrap();
    let md = env.loader.entry_point(id).unwrap();
    let body_env = MethodEnv::new(env.loader, md).unwrap();
    env.jit.compile(md, &body_env).unwrap();
    md
}

#[test]
fn test_no_page_is_writable_and_executable() {
    let env = build_env();
    let mut w = InstrWriter::new();
    w.ldc_i4(7).op(Opcode::Ret);
    let module = one_type_module(
        "wx-demo",
        vec![static_method(
            "Main",
            MethodSig::stat(vec![], TypeSig::I4),
            MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            },
        )],
    );
    compile_entry(&env, module);

    // Every protect transition ends read-execute, never write+execute.
    // The mock additionally panics on any W|X request.
    let log = env.memory.protect_log();
    assert!(!log.is_empty());
    for (_, _, prot) in log {
        assert_eq!(prot, PageProt::READ | PageProt::EXECUTE);
    }
    let _ = env.services;
}

#[test]
fn test_loop_method_has_poll_safepoint_with_stackmap() {
    let env = build_env();
    // while (arg0 != 0) arg0 = arg0 - 1; return arg0
    let mut w = InstrWriter::new();
    let top = w.label();
    let exit = w.label();
    w.bind(top);
    w.slot(Opcode::LdArg, 0);
    w.branch(Opcode::BrFalse, exit);
    w.slot(Opcode::LdArg, 0);
    w.ldc_i4(1);
    w.op(Opcode::Sub);
    w.slot(Opcode::StArg, 0);
    w.branch(Opcode::Br, top);
    w.bind(exit);
    w.slot(Opcode::LdArg, 0);
    w.op(Opcode::Ret);

    let module = one_type_module(
        "loop-demo",
        vec![static_method(
            "Main",
            MethodSig::stat(vec![TypeSig::I4], TypeSig::I4),
            MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            },
        )],
    );
    let md = compile_entry(&env, module);
    let code = md.compiled().unwrap();
    assert!(code.code_size > 0);
    // The back edge polls; its record lies inside the emitted code
    assert_eq!(code.stackmap.len(), 1);
    let entry = &code.stackmap.entries()[0];
    assert!((entry.code_offset as usize) < code.code_size);
}

#[test]
fn test_call_sites_record_safepoints() {
    let env = build_env();
    // Main calls Helper twice
    let mut helper = InstrWriter::new();
    helper.ldc_i4(5).op(Opcode::Ret);
    let mut main = InstrWriter::new();
    main.token(Opcode::Call, Token::method_def(1));
    main.token(Opcode::Call, Token::method_def(1));
    main.op(Opcode::Add);
    main.op(Opcode::Ret);

    let module = one_type_module(
        "call-demo",
        vec![
            static_method(
                "Main",
                MethodSig::stat(vec![], TypeSig::I4),
                MethodBody {
                    max_stack: 4,
                    locals: vec![],
                    code: main.finish(),
                    eh: vec![],
                },
            ),
            static_method(
                "Helper",
                MethodSig::stat(vec![], TypeSig::I4),
                MethodBody {
                    max_stack: 4,
                    locals: vec![],
                    code: helper.finish(),
                    eh: vec![],
                },
            ),
        ],
    );
    let md = compile_entry(&env, module);
    let code = md.compiled().unwrap();
    assert_eq!(code.stackmap.len(), 2);
    // Distinct return addresses, in order
    let offsets: Vec<u32> = code
        .stackmap
        .entries()
        .iter()
        .map(|e| e.code_offset)
        .collect();
    assert!(offsets[0] < offsets[1]);
}

#[test]
fn test_bounds_check_raises_index_out_of_range() {
    let env = build_env();
    // return arg0[arg1]
    let mut w = InstrWriter::new();
    w.slot(Opcode::LdArg, 0);
    w.slot(Opcode::LdArg, 1);
    w.token(Opcode::LdElem, Token::new(argon_bytecode::TokenKind::TypeSpec, 0));
    w.op(Opcode::Ret);

    let mut module = one_type_module(
        "bounds-demo",
        vec![static_method(
            "Main",
            MethodSig::stat(
                vec![TypeSig::Array(Box::new(TypeSig::I4)), TypeSig::I4],
                TypeSig::I4,
            ),
            MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            },
        )],
    );
    module.type_specs.push(TypeSig::I4);
    let md = compile_entry(&env, module);
    let code = md.compiled().unwrap();

    let bytes =
        unsafe { std::slice::from_raw_parts(code.code_ptr as *const u8, code.code_size) };
    // Out-of-line raise loads the IndexOutOfRange fault code into esi:
    // mov rsi, imm32 with the kind's code
    let kind_code = argon_kernel::FaultKind::IndexOutOfRange.code();
    let mut expected = vec![0x48, 0xC7, 0xC6];
    expected.extend_from_slice(&kind_code.to_le_bytes());
    assert!(
        bytes.windows(7).any(|w| w == expected.as_slice()),
        "no IndexOutOfRange raise in emitted code"
    );
    // And a null check raising NullReference comes before it
    let null_code = argon_kernel::FaultKind::NullReference.code();
    let mut null_seq = vec![0x48, 0xC7, 0xC6];
    null_seq.extend_from_slice(&null_code.to_le_bytes());
    assert!(bytes.windows(7).any(|w| w == null_seq.as_slice()));
}

#[test]
fn test_eh_table_covers_try_and_finally() {
    let env = build_env();
    // try { nop } finally { nop } with a leave to the tail
    let mut w = InstrWriter::new();
    let after = w.label();
    w.op(Opcode::Nop);
    w.branch(Opcode::Leave, after);
    let handler = w.offset();
    w.op(Opcode::Nop);
    w.op(Opcode::EndFinally);
    let handler_len = w.offset() - handler;
    w.bind(after);
    w.ldc_i4(0);
    w.op(Opcode::Ret);
    let code_bytes = w.finish();

    let module = one_type_module(
        "finally-demo",
        vec![static_method(
            "Main",
            MethodSig::stat(vec![], TypeSig::I4),
            MethodBody {
                max_stack: 4,
                locals: vec![],
                code: code_bytes,
                eh: vec![EhRegion {
                    kind: EhKind::Finally,
                    try_offset: 0,
                    try_len: handler,
                    handler_offset: handler,
                    handler_len,
                }],
            },
        )],
    );
    let md = compile_entry(&env, module);
    let code = md.compiled().unwrap();
    let rows = code.eh.entries();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].try_start < rows[0].try_end);
    assert!(rows[0].handler_pc >= rows[0].try_end);
    assert!((rows[0].handler_pc as usize) < code.code_size);
    // The leave calls the funclet inline: a near call into the handler
    let bytes =
        unsafe { std::slice::from_raw_parts(code.code_ptr as *const u8, code.code_size) };
    assert!(bytes.contains(&0xE8), "leave did not emit a funclet call");
}

#[test]
fn test_method_compiles_exactly_once() {
    let env = build_env();
    let mut w = InstrWriter::new();
    w.ldc_i4(1).op(Opcode::Ret);
    let module = one_type_module(
        "once-demo",
        vec![static_method(
            "Main",
            MethodSig::stat(vec![], TypeSig::I4),
            MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            },
        )],
    );
    let id = env.loader.load_module(module).unwrap();
    let md = env.loader.entry_point(id).unwrap();
    let body_env = MethodEnv::new(env.loader, md).unwrap();
    let first = env.jit.compile(md, &body_env).unwrap();
    let second = env.jit.compile(md, &body_env).unwrap();
    assert_eq!(first, second);
    assert_eq!(env.jit.stats().compiled(), 1);
    assert_eq!(md.entry_point(), first);
}
