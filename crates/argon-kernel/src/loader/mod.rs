//! Assembly loader and symbol resolver
//!
//! Consumes [`ParsedModule`]s from the external bytecode reader, attaches
//! method bodies to method descriptors, and resolves tokens lazily:
//! nothing is laid out or compiled until first touch. Cross-module
//! references resolve by module name; modules are identified by SHA-256
//! checksum, and loading the same bytes twice returns the same handle.

mod module;
mod resolver;

pub use module::{LoadedModule, StaticRegion};
pub use resolver::MethodEnv;

use crate::fault::FaultKind;
use crate::gc::{HandleTable, Heap};
use crate::types::{MethodDesc, TypeDesc, TypeError, TypeRegistry};
use argon_bytecode::module::{ModuleError, TokenKind};
use argon_bytecode::verify::{verify_module, VerifyError};
use argon_bytecode::{ParsedModule, Token};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Index of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Loader errors. Attributable to the workload; the runtime surfaces
/// them as `TypeLoadFailed` / `MissingMember` managed faults.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Structural verification failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// A token addressed a missing row.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Type resolution failed.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// Referenced module is not loaded.
    #[error("module not loaded: {0}")]
    ModuleNotFound(String),

    /// The module declares no entry point.
    #[error("module {0} has no entry point")]
    NoEntryPoint(String),

    /// Allocation of a string literal or static region failed.
    #[error("out of memory while loading")]
    OutOfMemory,
}

impl LoadError {
    /// The managed fault kind this error surfaces as.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            LoadError::Type(TypeError::MemberNotFound { .. }) => FaultKind::MissingMember,
            LoadError::OutOfMemory => FaultKind::OutOfMemory,
            _ => FaultKind::TypeLoadFailed,
        }
    }
}

/// What a token resolved to.
pub enum Resolved {
    /// A type.
    Type(&'static TypeDesc),
    /// A method.
    Method(&'static MethodDesc),
    /// A field access.
    Field(crate::jit::FieldRef),
}

/// Supplies the initial (compile-trampoline) entry point for fresh
/// method descriptors. Implemented by the runtime, which owns the code
/// heap the stubs are emitted into.
pub trait EntryProvider: Sync {
    /// A callable stub that compiles `md` on first entry.
    fn trampoline_for(&self, md: &'static MethodDesc) -> usize;
}

/// The loader.
pub struct Loader {
    registry: &'static TypeRegistry,
    heap: &'static Heap,
    handles: &'static HandleTable,
    modules: RwLock<Vec<&'static LoadedModule>>,
    by_checksum: Mutex<FxHashMap<[u8; 32], ModuleId>>,
    by_name: Mutex<FxHashMap<String, ModuleId>>,
    /// Instantiations under construction (guarded by the layout lock).
    pub(super) building: Mutex<FxHashMap<(crate::types::DefId, Vec<usize>), &'static TypeDesc>>,
    /// Trampoline factory, registered by the runtime before any load.
    pub(super) entries: once_cell::sync::OnceCell<&'static dyn EntryProvider>,
}

impl Loader {
    /// Create a loader over the given registry and heap.
    pub fn new(
        registry: &'static TypeRegistry,
        heap: &'static Heap,
        handles: &'static HandleTable,
    ) -> Self {
        Self {
            registry,
            heap,
            handles,
            modules: RwLock::new(Vec::new()),
            by_checksum: Mutex::new(FxHashMap::default()),
            by_name: Mutex::new(FxHashMap::default()),
            building: Mutex::new(FxHashMap::default()),
            entries: once_cell::sync::OnceCell::new(),
        }
    }

    /// Register the trampoline factory. Must happen before the first
    /// method descriptor is created.
    pub fn set_entry_provider(&self, provider: &'static dyn EntryProvider) {
        let _ = self.entries.set(provider);
    }

    /// The type registry.
    pub fn registry(&self) -> &'static TypeRegistry {
        self.registry
    }

    /// The managed heap (string literals, static regions).
    pub(crate) fn heap(&self) -> &'static Heap {
        self.heap
    }

    /// The handle table (pinned string literals).
    pub(crate) fn handles(&self) -> &'static HandleTable {
        self.handles
    }

    /// Load a parsed module, verifying it first.
    ///
    /// Loading a module whose checksum is already present returns the
    /// existing handle.
    pub fn load_module(&self, parsed: ParsedModule) -> Result<ModuleId, LoadError> {
        verify_module(&parsed)?;
        let checksum = module::checksum_of(&parsed);
        {
            let known = self.by_checksum.lock();
            if let Some(&id) = known.get(&checksum) {
                return Ok(id);
            }
        }
        let mut modules = self.modules.write();
        let id = ModuleId(modules.len() as u32);
        let loaded = LoadedModule::new(id, parsed, checksum);
        log::info!(
            "loader: module {} ({} types, {} methods)",
            loaded.name,
            loaded.parsed.types.len(),
            loaded.parsed.methods.len()
        );
        self.by_checksum.lock().insert(checksum, id);
        self.by_name.lock().insert(loaded.name.clone(), id);
        modules.push(loaded);
        Ok(id)
    }

    /// The loaded module for an id.
    pub fn module(&self, id: ModuleId) -> &'static LoadedModule {
        self.modules.read()[id.0 as usize]
    }

    /// Find a loaded module by name.
    pub fn module_by_name(&self, name: &str) -> Option<&'static LoadedModule> {
        let id = *self.by_name.lock().get(name)?;
        Some(self.module(id))
    }

    /// All loaded modules (GC static-region scanning).
    pub fn modules(&self) -> Vec<&'static LoadedModule> {
        self.modules.read().clone()
    }

    /// The entry-point method of a module.
    pub fn entry_point(&self, id: ModuleId) -> Result<&'static MethodDesc, LoadError> {
        let module = self.module(id);
        let token = module
            .parsed
            .entry_point
            .ok_or_else(|| LoadError::NoEntryPoint(module.name.clone()))?;
        self.resolve_method_token(module, token, &[])
    }

    /// Resolve a token within a module to a type, method or field.
    pub fn resolve_token(
        &self,
        id: ModuleId,
        token: Token,
    ) -> Result<Resolved, LoadError> {
        let module = self.module(id);
        match token.kind() {
            Some(TokenKind::TypeDef | TokenKind::TypeRef | TokenKind::TypeSpec) => Ok(
                Resolved::Type(self.resolve_type_token(module, token, &[])?),
            ),
            Some(TokenKind::MethodDef | TokenKind::MemberRef) => {
                match self.resolve_member_token(module, token, &[])? {
                    resolver::Member::Method(md) => Ok(Resolved::Method(md)),
                    resolver::Member::Field(f) => Ok(Resolved::Field(f)),
                }
            }
            Some(TokenKind::FieldDef) => Ok(Resolved::Field(
                self.resolve_field_token(module, token, &[])?,
            )),
            _ => Err(LoadError::Type(TypeError::BadToken(format!(
                "{:#010x}",
                token.0
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::loader::module::checksum_of;
    use argon_bytecode::module::{MethodFlags, MethodRec, TypeDefRec, TypeFlags};
    use argon_bytecode::sig::{MethodSig, TypeSig};
    use argon_bytecode::body::{InstrWriter, MethodBody};
    use argon_bytecode::Opcode;
    use once_cell::sync::Lazy;

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    static LOADER: Lazy<Loader> = Lazy::new(|| {
        let registry = leak(TypeRegistry::new());
        let heap = leak(Heap::new(*SERVICES));
        let handles = leak(HandleTable::new());
        Loader::new(registry, heap, handles)
    });

    pub(crate) fn trivial_module(name: &str) -> ParsedModule {
        let mut module = ParsedModule::new(name);
        let mut w = InstrWriter::new();
        w.ldc_i4(42).op(Opcode::Ret);
        module.methods.push(MethodRec {
            name: "Main".into(),
            flags: MethodFlags::STATIC,
            sig: MethodSig::stat(vec![], TypeSig::I4),
            body: Some(MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            }),
        });
        module.types.push(TypeDefRec {
            namespace: String::new(),
            name: "Program".into(),
            flags: TypeFlags::SEALED,
            base: None,
            interfaces: vec![],
            fields: 0..0,
            methods: 0..1,
            generic_params: 0,
            finalizer: None,
        });
        module.entry_point = Some(Token::method_def(0));
        module
    }

    #[test]
    fn test_load_module_dedupes_by_checksum() {
        let a = LOADER.load_module(trivial_module("demo")).unwrap();
        let b = LOADER.load_module(trivial_module("demo")).unwrap();
        assert_eq!(a, b);
        assert_eq!(LOADER.module(a).name, "demo");
    }

    #[test]
    fn test_checksum_differs_by_content() {
        let a = checksum_of(&trivial_module("one"));
        let b = checksum_of(&trivial_module("two"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_point_resolves() {
        let id = LOADER.load_module(trivial_module("entry-demo")).unwrap();
        let md = LOADER.entry_point(id).unwrap();
        assert_eq!(md.name, "Main");
        assert_eq!(md.declaring().name, "Program");
        assert!(md.body.is_some());
    }

    #[test]
    fn test_missing_entry_point_reported() {
        let mut module = trivial_module("no-entry");
        module.entry_point = None;
        let id = LOADER.load_module(module).unwrap();
        assert!(matches!(
            LOADER.entry_point(id),
            Err(LoadError::NoEntryPoint(_))
        ));
    }
}
