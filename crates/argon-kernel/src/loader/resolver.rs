//! Token and type resolution
//!
//! The lazy half of the loader: turning tokens and signatures into
//! canonical descriptors. All descriptor construction happens under the
//! registry's reentrant layout lock; publication into the registry (or
//! the module's row cells) is the release point after which readers are
//! lock-free.

use super::{LoadError, Loader, LoadedModule, StaticRegion};
use crate::gc::HandleKind;
use crate::jit::{FieldRef, JitError, SlotKind};
use crate::types::registry::{leak, leak_method};
use crate::types::{
    layout_instance, layout_statics, DefId, MethodDesc, PendingField, ResolvedSig, TypeDesc,
    TypeError, TypeKind,
};
use argon_bytecode::module::{MethodFlags, TokenKind, TypeFlags};
use argon_bytecode::sig::{MethodSig, TypeSig};
use argon_bytecode::{Token};
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use std::sync::atomic::AtomicUsize;

/// A resolved member reference.
pub(super) enum Member {
    Method(&'static MethodDesc),
    Field(FieldRef),
}

impl Loader {
    // ===== Signature resolution =====

    /// Resolve a type signature to a descriptor, substituting generic
    /// parameters from `subst`.
    pub(super) fn resolve_sig(
        &self,
        module: &'static LoadedModule,
        sig: &TypeSig,
        subst: &[&'static TypeDesc],
    ) -> Result<&'static TypeDesc, LoadError> {
        use crate::types::Prim;
        let registry = self.registry();
        Ok(match sig {
            TypeSig::Void => registry.prim(Prim::Void),
            TypeSig::Bool => registry.prim(Prim::Bool),
            TypeSig::Char => registry.prim(Prim::Char),
            TypeSig::I1 => registry.prim(Prim::I1),
            TypeSig::I2 => registry.prim(Prim::I2),
            TypeSig::I4 => registry.prim(Prim::I4),
            TypeSig::I8 => registry.prim(Prim::I8),
            TypeSig::U1 => registry.prim(Prim::U1),
            TypeSig::U2 => registry.prim(Prim::U2),
            TypeSig::U4 => registry.prim(Prim::U4),
            TypeSig::U8 => registry.prim(Prim::U8),
            TypeSig::R4 => registry.prim(Prim::R4),
            TypeSig::R8 => registry.prim(Prim::R8),
            TypeSig::Object => registry.object(),
            TypeSig::String => registry.string(),
            TypeSig::Class(token) | TypeSig::Value(token) => {
                self.resolve_type_token(module, *token, subst)?
            }
            TypeSig::Array(inner) => {
                registry.array_of(self.resolve_sig(module, inner, subst)?, 1)
            }
            TypeSig::MultiArray(inner, rank) => {
                registry.array_of(self.resolve_sig(module, inner, subst)?, *rank)
            }
            TypeSig::Generic(token, args) => {
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    resolved.push(self.resolve_sig(module, arg, subst)?);
                }
                self.resolve_generic_token(module, *token, &resolved)?
            }
            TypeSig::Param(index) => {
                *subst.get(*index as usize).ok_or_else(|| {
                    LoadError::Type(TypeError::BadToken(format!(
                        "generic parameter {index} out of range"
                    )))
                })?
            }
            // Byrefs resolve to their pointee; slot kinds carry the
            // interior-pointer distinction separately
            TypeSig::ByRef(inner) => self.resolve_sig(module, inner, subst)?,
            TypeSig::FnPtr(_) => registry.prim(Prim::U8),
        })
    }

    /// Slot kind for values of a signature (byrefs stay byrefs).
    pub(super) fn sig_kind(
        &self,
        module: &'static LoadedModule,
        sig: &TypeSig,
        subst: &[&'static TypeDesc],
    ) -> Result<SlotKind, LoadError> {
        if matches!(sig, TypeSig::ByRef(_)) {
            return Ok(SlotKind::ByRef);
        }
        Ok(crate::jit::slot_kind_of(self.resolve_sig(module, sig, subst)?))
    }

    // ===== Type resolution =====

    /// Resolve a TypeDef/TypeRef/TypeSpec token.
    pub(super) fn resolve_type_token(
        &self,
        module: &'static LoadedModule,
        token: Token,
        subst: &[&'static TypeDesc],
    ) -> Result<&'static TypeDesc, LoadError> {
        match token.kind() {
            Some(TokenKind::TypeDef) => self.resolve_type_row(module, token.index() as u32, &[]),
            Some(TokenKind::TypeRef) => {
                // Runtime-provided types resolve without a defining module
                if let Some(type_ref) = module.parsed.type_refs.get(token.index()) {
                    if type_ref.namespace == "System" {
                        match type_ref.name.as_str() {
                            "Object" => return Ok(self.registry().object()),
                            "String" => return Ok(self.registry().string()),
                            "Delegate" => return Ok(self.registry().delegate()),
                            _ => {}
                        }
                    }
                }
                let target = self.resolve_type_ref(module, token)?;
                let (target_module, row) = target;
                self.resolve_type_row(target_module, row, &[])
            }
            Some(TokenKind::TypeSpec) => {
                let spec = module
                    .parsed
                    .type_specs
                    .get(token.index())
                    .ok_or_else(|| {
                        LoadError::Type(TypeError::BadToken(format!("{:#010x}", token.0)))
                    })?
                    .clone();
                self.resolve_sig(module, &spec, subst)
            }
            _ => Err(LoadError::Type(TypeError::BadToken(format!(
                "{:#010x}",
                token.0
            )))),
        }
    }

    /// Resolve a generic definition token with explicit arguments.
    fn resolve_generic_token(
        &self,
        module: &'static LoadedModule,
        token: Token,
        args: &[&'static TypeDesc],
    ) -> Result<&'static TypeDesc, LoadError> {
        match token.kind() {
            Some(TokenKind::TypeDef) => self.resolve_type_row(module, token.index() as u32, args),
            Some(TokenKind::TypeRef) => {
                let (target_module, row) = self.resolve_type_ref(module, token)?;
                self.resolve_type_row(target_module, row, args)
            }
            _ => Err(LoadError::Type(TypeError::BadToken(format!(
                "{:#010x}",
                token.0
            )))),
        }
    }

    /// Find the defining module and row for a TypeRef.
    fn resolve_type_ref(
        &self,
        module: &'static LoadedModule,
        token: Token,
    ) -> Result<(&'static LoadedModule, u32), LoadError> {
        let type_ref = module.parsed.type_refs.get(token.index()).ok_or_else(|| {
            LoadError::Type(TypeError::BadToken(format!("{:#010x}", token.0)))
        })?;
        let target = self
            .module_by_name(&type_ref.module)
            .ok_or_else(|| LoadError::ModuleNotFound(type_ref.module.clone()))?;
        let row = target
            .parsed
            .types
            .iter()
            .position(|t| t.namespace == type_ref.namespace && t.name == type_ref.name)
            .ok_or_else(|| {
                LoadError::Type(TypeError::NotFound(format!(
                    "{}.{}",
                    type_ref.namespace, type_ref.name
                )))
            })?;
        Ok((target, row as u32))
    }

    /// Resolve (creating if needed) the canonical descriptor for one
    /// TypeDef row with the given generic arguments.
    pub(super) fn resolve_type_row(
        &self,
        module: &'static LoadedModule,
        row: u32,
        args: &[&'static TypeDesc],
    ) -> Result<&'static TypeDesc, LoadError> {
        let def = DefId {
            module: module.id,
            row,
        };
        // Lock-free fast paths
        if args.is_empty() {
            if let Some(td) = module.tds[row as usize].get().copied() {
                return Ok(td);
            }
        }
        if let Some(td) = self.registry().lookup(def, args) {
            return Ok(td);
        }

        let _guard = self.registry().layout_lock().lock();
        if let Some(td) = self.registry().lookup(def, args) {
            return Ok(td);
        }
        let building_key = (def, args.iter().map(|a| *a as *const TypeDesc as usize).collect::<Vec<_>>());
        if let Some(td) = self.building.lock().get(&building_key).copied() {
            return Ok(td);
        }

        let rec = module
            .parsed
            .types
            .get(row as usize)
            .ok_or_else(|| LoadError::Type(TypeError::NotFound(format!("typedef {row}"))))?
            .clone();
        if rec.generic_params as usize != args.len() {
            return Err(LoadError::Type(TypeError::ArityMismatch {
                type_name: rec.name.clone(),
                expected: rec.generic_params,
                got: args.len(),
            }));
        }

        let kind = if rec.flags.contains(TypeFlags::INTERFACE) {
            TypeKind::Interface
        } else if rec.flags.contains(TypeFlags::VALUE_TYPE) {
            TypeKind::Value
        } else {
            TypeKind::Reference
        };

        // Base type: explicit, or Object for plain classes
        let base = match rec.base {
            Some(token) => Some(self.resolve_type_token(module, token, args)?),
            None if kind == TypeKind::Reference => Some(self.registry().object()),
            None => None,
        };

        let name = display_name(&rec.namespace, &rec.name, args);
        let mut shell = TypeDesc::shell(name, kind, 0, 8, base);
        shell.generic_args = args.to_vec();
        shell.definition = Some(def);
        let td = leak(shell);
        self.building.lock().insert(building_key.clone(), td);

        let result = self.build_type(module, &rec, td, args);
        self.building.lock().remove(&building_key);
        let td = result?;

        self.registry().publish(def, args, td);
        if args.is_empty() {
            let _ = module.tds[row as usize].set(td);
        }
        Ok(td)
    }

    /// Fill a freshly allocated shell: methods, layout, vtable,
    /// interface map, finalizer.
    fn build_type(
        &self,
        module: &'static LoadedModule,
        rec: &argon_bytecode::module::TypeDefRec,
        td: &'static TypeDesc,
        args: &[&'static TypeDesc],
    ) -> Result<&'static TypeDesc, LoadError> {
        // Method descriptors first: the vtable and finalizer point at them
        let mut methods: Vec<&'static MethodDesc> = Vec::new();
        for method_row in rec.methods.clone() {
            let mrec = &module.parsed.methods[method_row as usize];
            let sig = self.resolve_method_sig(module, &mrec.sig, args)?;
            let md = leak_method(MethodDesc {
                name: mrec.name.clone(),
                declaring: OnceCell::new(),
                flags: mrec.flags,
                sig,
                body: mrec.body.clone(),
                module: module.id,
                def_row: method_row,
                entry: AtomicUsize::new(0),
                compiled: OnceCell::new(),
                vtable_slot: OnceCell::new(),
            });
            md.declaring.set(td).expect("declaring bound twice");
            if let Some(provider) = self.entries.get() {
                md.entry
                    .store(provider.trampoline_for(md), std::sync::atomic::Ordering::Release);
            }
            methods.push(md);
        }

        // Instance and static field layout
        let mut pending = Vec::new();
        for field_row in rec.fields.clone() {
            let frec = &module.parsed.fields[field_row as usize];
            let is_static = frec
                .flags
                .contains(argon_bytecode::module::FieldFlags::STATIC);
            let ty = self.resolve_sig(module, &frec.sig, args)?;
            pending.push(PendingField {
                name: frec.name.clone(),
                ty,
                is_static,
            });
        }
        let layout = layout_instance(&td.name, td.kind, td.base, pending)
            .map_err(TypeError::from)?;

        // Vtable: start from the base, override or append
        let mut vtable: Vec<&'static MethodDesc> = td.base.map(|b| b.vtable().to_vec()).unwrap_or_default();
        for md in &methods {
            if td.kind == TypeKind::Interface {
                // Interface methods are numbered by declaration order
                let index = (md.def_row - rec.methods.start) as u32;
                let _ = md.vtable_slot.set(index);
                continue;
            }
            if !md.flags.contains(MethodFlags::VIRTUAL) {
                continue;
            }
            let override_slot = if md.flags.contains(MethodFlags::NEW_SLOT) {
                None
            } else {
                vtable
                    .iter()
                    .position(|base_md| base_md.name == md.name && sig_matches(&base_md.sig, &md.sig))
            };
            match override_slot {
                Some(slot) => {
                    vtable[slot] = md;
                    let _ = md.vtable_slot.set(slot as u32);
                }
                None => {
                    vtable.push(md);
                    let _ = md.vtable_slot.set(vtable.len() as u32 - 1);
                }
            }
        }

        // Interface map: inherited entries plus this type's interfaces,
        // each appending its method block to the vtable
        let mut iface_map: Vec<crate::types::InterfaceEntry> =
            td.base.map(|b| b.iface_map().to_vec()).unwrap_or_default();
        for iface_token in &rec.interfaces {
            let iface = self.resolve_type_token(module, *iface_token, args)?;
            if iface_map.iter().any(|e| std::ptr::eq(e.iface, iface)) {
                continue;
            }
            let base_slot = vtable.len() as u32;
            for iface_md in iface.methods() {
                let implementation = methods
                    .iter()
                    .chain(vtable.iter())
                    .find(|m| m.name == iface_md.name && sig_matches(&m.sig, &iface_md.sig))
                    .copied()
                    .ok_or_else(|| {
                        LoadError::Type(TypeError::MemberNotFound {
                            type_name: td.name.clone(),
                            member: iface_md.name.clone(),
                        })
                    })?;
                vtable.push(implementation);
            }
            iface_map.push(crate::types::InterfaceEntry {
                iface,
                vtable_base: base_slot,
            });
        }

        // Finalizer: declared here or inherited
        let finalizer = match rec.finalizer {
            Some(frow) => {
                let index = (frow - rec.methods.start) as usize;
                Some(methods[index])
            }
            None => td.base.and_then(|b| b.finalizer()),
        };

        // Fix the computed size before sealing; nothing has observed the
        // descriptor yet.
        let td_mut = td as *const TypeDesc as *mut TypeDesc;
        // Safety: under the layout lock, pre-publication
        unsafe {
            (*td_mut).size = layout.size;
            (*td_mut).align = layout.align;
        }

        td.fields
            .set(layout.fields.into_boxed_slice())
            .expect("fields sealed twice");
        td.ref_offsets
            .set(layout.ref_offsets.into_boxed_slice())
            .expect("refs sealed twice");
        td.methods
            .set(methods.into_boxed_slice())
            .expect("methods sealed twice");
        td.seal_vtable(vtable.into_boxed_slice());
        td.iface_map
            .set(iface_map.into_boxed_slice())
            .expect("iface map sealed twice");
        td.finalizer.set(finalizer).expect("finalizer sealed twice");
        Ok(td)
    }

    fn resolve_method_sig(
        &self,
        module: &'static LoadedModule,
        sig: &MethodSig,
        subst: &[&'static TypeDesc],
    ) -> Result<ResolvedSig, LoadError> {
        let mut params = Vec::with_capacity(sig.params.len());
        for p in &sig.params {
            params.push(self.resolve_sig(module, p, subst)?);
        }
        Ok(ResolvedSig {
            has_this: sig.has_this,
            params,
            ret: self.resolve_sig(module, &sig.ret, subst)?,
        })
    }

    // ===== Method and field resolution =====

    /// Resolve a MethodDef/MemberRef token to a method descriptor.
    pub(super) fn resolve_method_token(
        &self,
        module: &'static LoadedModule,
        token: Token,
        subst: &[&'static TypeDesc],
    ) -> Result<&'static MethodDesc, LoadError> {
        match self.resolve_member_token(module, token, subst)? {
            Member::Method(md) => Ok(md),
            Member::Field(_) => Err(LoadError::Type(TypeError::BadToken(
                "field token where a method was expected".into(),
            ))),
        }
    }

    /// Resolve a FieldDef/MemberRef token to a field access.
    pub(super) fn resolve_field_token(
        &self,
        module: &'static LoadedModule,
        token: Token,
        subst: &[&'static TypeDesc],
    ) -> Result<FieldRef, LoadError> {
        match token.kind() {
            Some(TokenKind::FieldDef) => {
                let row = token.index() as u32;
                let type_row = module
                    .parsed
                    .declaring_type_of_field(row)
                    .ok_or_else(|| LoadError::Type(TypeError::NotFound(format!("field {row}"))))?;
                let td = self.resolve_type_row(module, type_row, subst)?;
                self.field_ref(module, td, row)
            }
            Some(TokenKind::MemberRef) => match self.resolve_member_token(module, token, subst)? {
                Member::Field(f) => Ok(f),
                Member::Method(_) => Err(LoadError::Type(TypeError::BadToken(
                    "method token where a field was expected".into(),
                ))),
            },
            _ => Err(LoadError::Type(TypeError::BadToken(format!(
                "{:#010x}",
                token.0
            )))),
        }
    }

    pub(super) fn resolve_member_token(
        &self,
        module: &'static LoadedModule,
        token: Token,
        subst: &[&'static TypeDesc],
    ) -> Result<Member, LoadError> {
        match token.kind() {
            Some(TokenKind::MethodDef) => {
                let row = token.index() as u32;
                if let Some(md) = module.mds[row as usize].get().copied() {
                    return Ok(Member::Method(md));
                }
                let type_row = module.parsed.declaring_type_of_method(row).ok_or_else(|| {
                    LoadError::Type(TypeError::NotFound(format!("method {row}")))
                })?;
                let td = self.resolve_type_row(module, type_row, &[])?;
                let rec = &module.parsed.types[type_row as usize];
                let index = (row - rec.methods.start) as usize;
                let md = td.methods()[index];
                let _ = module.mds[row as usize].set(md);
                Ok(Member::Method(md))
            }
            Some(TokenKind::MemberRef) => {
                let mref = module.parsed.member_refs.get(token.index()).ok_or_else(|| {
                    LoadError::Type(TypeError::BadToken(format!("{:#010x}", token.0)))
                })?;
                let parent = self.resolve_type_token(module, mref.parent, subst)?;
                match &mref.sig {
                    argon_bytecode::module::MemberSig::Method(sig) => {
                        let md = find_method(parent, &mref.name, sig.arg_count()).ok_or_else(
                            || {
                                LoadError::Type(TypeError::MemberNotFound {
                                    type_name: parent.name.clone(),
                                    member: mref.name.clone(),
                                })
                            },
                        )?;
                        Ok(Member::Method(md))
                    }
                    argon_bytecode::module::MemberSig::Field(_) => {
                        let (owner, row) = find_field_row(self, parent, &mref.name)
                            .ok_or_else(|| {
                                LoadError::Type(TypeError::MemberNotFound {
                                    type_name: parent.name.clone(),
                                    member: mref.name.clone(),
                                })
                            })?;
                        let owner_module = self.module(owner.definition.unwrap().module);
                        self.field_ref(owner_module, owner, row)
                            .map(Member::Field)
                    }
                }
            }
            _ => Err(LoadError::Type(TypeError::BadToken(format!(
                "{:#010x}",
                token.0
            )))),
        }
    }

    /// Build a [`FieldRef`] for a FieldDef row of a resolved type.
    pub(super) fn field_ref(
        &self,
        module: &'static LoadedModule,
        td: &'static TypeDesc,
        row: u32,
    ) -> Result<FieldRef, LoadError> {
        let frec = &module.parsed.fields[row as usize];
        if frec
            .flags
            .contains(argon_bytecode::module::FieldFlags::STATIC)
        {
            let region = self.ensure_statics(module)?;
            let offset = *region.field_offsets.get(&row).ok_or_else(|| {
                LoadError::Type(TypeError::MemberNotFound {
                    type_name: td.name.clone(),
                    member: frec.name.clone(),
                })
            })?;
            let ty = self.resolve_sig(module, &frec.sig, &td.generic_args)?;
            return Ok(FieldRef {
                offset,
                ty,
                is_static: true,
                static_base: region.base(),
            });
        }

        let rec_fields_start = td
            .definition
            .map(|d| module.parsed.types[d.row as usize].fields.start)
            .unwrap_or(0);
        let index = (row - rec_fields_start) as usize;
        let field = &td.fields()[index];
        Ok(FieldRef {
            offset: field.offset,
            ty: field.ty,
            is_static: false,
            static_base: 0,
        })
    }

    /// Build (once) the module's static region. Generic types share one
    /// region per definition; parameters resolve as Object.
    pub(super) fn ensure_statics(
        &self,
        module: &'static LoadedModule,
    ) -> Result<&StaticRegion, LoadError> {
        if let Some(region) = module.statics.get() {
            return Ok(region);
        }
        let _guard = self.registry().layout_lock().lock();
        if let Some(region) = module.statics.get() {
            return Ok(region);
        }

        let mut rows: Vec<u32> = Vec::new();
        let mut types: Vec<(&str, &'static TypeDesc)> = Vec::new();
        for (type_row, rec) in module.parsed.types.iter().enumerate() {
            let object_subst =
                vec![self.registry().object(); rec.generic_params as usize];
            for field_row in rec.fields.clone() {
                let frec = &module.parsed.fields[field_row as usize];
                if !frec
                    .flags
                    .contains(argon_bytecode::module::FieldFlags::STATIC)
                {
                    continue;
                }
                let ty = self.resolve_sig(module, &frec.sig, &object_subst)?;
                rows.push(field_row);
                types.push((module.parsed.types[type_row].name.as_str(), ty));
                let _ = type_row;
            }
        }
        let field_types: Vec<(&str, &'static TypeDesc)> = types;
        let (size, offsets, ref_offsets) = layout_statics(&field_types);
        let mut field_offsets = FxHashMap::default();
        for (row, offset) in rows.into_iter().zip(offsets) {
            field_offsets.insert(row, offset);
        }
        let region = StaticRegion::new(size, ref_offsets, field_offsets);
        let _ = module.statics.set(region);
        Ok(module.statics.get().unwrap())
    }

    /// Intern a string literal, pinning it for embedding in code.
    pub(super) fn intern_string(
        &self,
        module: &'static LoadedModule,
        token: Token,
    ) -> Result<usize, LoadError> {
        let row = token.index() as u32;
        if let Some(&addr) = module.strings.lock().get(&row) {
            return Ok(addr);
        }
        let text = module
            .parsed
            .strings
            .get(row as usize)
            .ok_or_else(|| LoadError::Type(TypeError::BadToken(format!("{:#010x}", token.0))))?;
        let obj = self
            .heap()
            .alloc_string_from(self.registry().string(), text)
            .map_err(|_| LoadError::OutOfMemory)?;
        self.handles().create(obj, HandleKind::Pinned);
        let addr = obj.addr();
        module.strings.lock().insert(row, addr);
        Ok(addr)
    }

    /// The method sharing compiled code with `md` (canonical-reference
    /// instantiation sharing). Returns `md` itself when nothing is shared.
    pub fn canonical_method_of(&self, md: &'static MethodDesc) -> Result<&'static MethodDesc, LoadError> {
        let td = md.declaring();
        if td.generic_args.is_empty() {
            return Ok(md);
        }
        let canon = self.registry().canonical_args(&td.generic_args);
        let identical = canon
            .iter()
            .zip(td.generic_args.iter())
            .all(|(a, b)| std::ptr::eq(*a, *b));
        if identical {
            return Ok(md);
        }
        let def = td.definition.expect("instantiated type without definition");
        let module = self.module(def.module);
        let canon_td = self.resolve_type_row(module, def.row, &canon)?;
        let rec = &module.parsed.types[def.row as usize];
        let index = (md.def_row - rec.methods.start) as usize;
        Ok(canon_td.methods()[index])
    }
}

/// Build the environment for compiling one method.
pub struct MethodEnv {
    loader: &'static Loader,
    module: &'static LoadedModule,
    subst: Vec<&'static TypeDesc>,
    arg_kinds: Vec<SlotKind>,
    local_kinds: Vec<SlotKind>,
    ret: Option<SlotKind>,
}

impl MethodEnv {
    /// Create the environment for `md`.
    pub fn new(loader: &'static Loader, md: &'static MethodDesc) -> Result<Self, LoadError> {
        let module = loader.module(md.module);
        let subst = md.declaring().generic_args.clone();
        let mrec = &module.parsed.methods[md.def_row as usize];

        let mut arg_kinds = Vec::with_capacity(mrec.sig.arg_count());
        if mrec.sig.has_this {
            arg_kinds.push(SlotKind::Ref);
        }
        for p in &mrec.sig.params {
            arg_kinds.push(loader.sig_kind(module, p, &subst)?);
        }
        let local_kinds = match &mrec.body {
            Some(body) => {
                let mut kinds = Vec::with_capacity(body.locals.len());
                for l in &body.locals {
                    kinds.push(loader.sig_kind(module, l, &subst)?);
                }
                kinds
            }
            None => Vec::new(),
        };
        let ret = match &mrec.sig.ret {
            TypeSig::Void => None,
            sig => Some(loader.sig_kind(module, sig, &subst)?),
        };
        Ok(Self {
            loader,
            module,
            subst,
            arg_kinds,
            local_kinds,
            ret,
        })
    }
}

fn to_jit(err: LoadError) -> JitError {
    match err {
        LoadError::Type(TypeError::BadToken(_)) => JitError::Unresolved(0),
        other => {
            log::warn!("jit: resolution failed: {other}");
            JitError::Unresolved(0)
        }
    }
}

impl crate::jit::BodyEnv for MethodEnv {
    fn arg_kinds(&self) -> &[SlotKind] {
        &self.arg_kinds
    }

    fn local_kinds(&self) -> &[SlotKind] {
        &self.local_kinds
    }

    fn ret_kind(&self) -> Option<SlotKind> {
        self.ret
    }

    fn method(&self, token: Token) -> Result<&'static MethodDesc, JitError> {
        self.loader
            .resolve_method_token(self.module, token, &self.subst)
            .map_err(to_jit)
    }

    fn signature(&self, token: Token) -> Result<ResolvedSig, JitError> {
        let sig = self
            .module
            .parsed
            .signatures
            .get(token.index())
            .ok_or(JitError::Unresolved(token.0))?
            .clone();
        self.loader
            .resolve_method_sig(self.module, &sig, &self.subst)
            .map_err(to_jit)
    }

    fn field(&self, token: Token) -> Result<crate::jit::FieldRef, JitError> {
        self.loader
            .resolve_field_token(self.module, token, &self.subst)
            .map_err(to_jit)
    }

    fn type_desc(&self, token: Token) -> Result<&'static TypeDesc, JitError> {
        self.loader
            .resolve_type_token(self.module, token, &self.subst)
            .map_err(to_jit)
    }

    fn string_literal(&self, token: Token) -> Result<usize, JitError> {
        self.loader
            .intern_string(self.module, token)
            .map_err(to_jit)
    }

    fn array_type(&self, element: &'static TypeDesc, rank: u8) -> &'static TypeDesc {
        self.loader.registry().array_of(element, rank)
    }

    fn box_type(&self, value: &'static TypeDesc) -> &'static TypeDesc {
        self.loader.registry().box_of(value)
    }

    fn is_delegate(&self, td: &'static TypeDesc) -> bool {
        let delegate = self.loader.registry().delegate();
        let mut cur = Some(td);
        while let Some(t) = cur {
            if std::ptr::eq(t, delegate) {
                return true;
            }
            cur = t.base;
        }
        false
    }
}

fn sig_matches(a: &ResolvedSig, b: &ResolvedSig) -> bool {
    a.params.len() == b.params.len()
        && a.has_this == b.has_this
        && a.params
            .iter()
            .zip(b.params.iter())
            .all(|(x, y)| std::ptr::eq(*x, *y))
}

fn find_method(
    td: &'static TypeDesc,
    name: &str,
    arg_count: usize,
) -> Option<&'static MethodDesc> {
    let mut cur = Some(td);
    while let Some(t) = cur {
        if let Some(md) = t
            .methods()
            .iter()
            .find(|m| m.name == name && m.sig.arg_count() == arg_count)
        {
            return Some(md);
        }
        cur = t.base;
    }
    None
}

fn find_field_row(
    loader: &Loader,
    td: &'static TypeDesc,
    name: &str,
) -> Option<(&'static TypeDesc, u32)> {
    let mut cur = Some(td);
    while let Some(t) = cur {
        if let Some(def) = t.definition {
            let module = loader.module(def.module);
            let rec = &module.parsed.types[def.row as usize];
            for field_row in rec.fields.clone() {
                if module.parsed.fields[field_row as usize].name == name {
                    return Some((t, field_row));
                }
            }
        }
        cur = t.base;
    }
    None
}

fn display_name(namespace: &str, name: &str, args: &[&'static TypeDesc]) -> String {
    let mut out = String::new();
    if !namespace.is_empty() {
        out.push_str(namespace);
        out.push('.');
    }
    out.push_str(name);
    if !args.is_empty() {
        out.push('<');
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&a.name);
        }
        out.push('>');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::tests::SERVICES;
    use crate::gc::{HandleTable, Heap};
    use crate::types::TypeRegistry;
    use argon_bytecode::module::{FieldFlags, FieldRec, MethodRec, ParsedModule, TypeDefRec};
    use once_cell::sync::Lazy;

    fn leak_val<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    static LOADER: Lazy<&'static Loader> = Lazy::new(|| {
        let registry = leak_val(TypeRegistry::new());
        let heap = leak_val(Heap::new(*SERVICES));
        let handles = leak_val(HandleTable::new());
        leak_val(Loader::new(registry, heap, handles))
    });

    fn class(name: &str, fields: std::ops::Range<u32>, methods: std::ops::Range<u32>) -> TypeDefRec {
        TypeDefRec {
            namespace: "Demo".into(),
            name: name.into(),
            flags: TypeFlags::empty(),
            base: None,
            interfaces: vec![],
            fields,
            methods,
            generic_params: 0,
            finalizer: None,
        }
    }

    fn field(name: &str, sig: TypeSig) -> FieldRec {
        FieldRec {
            name: name.into(),
            flags: argon_bytecode::module::FieldFlags::empty(),
            sig,
        }
    }

    fn virtual_method(name: &str) -> MethodRec {
        let mut w = argon_bytecode::body::InstrWriter::new();
        w.ldc_i4(0).op(argon_bytecode::Opcode::Ret);
        MethodRec {
            name: name.into(),
            flags: MethodFlags::VIRTUAL,
            sig: MethodSig::instance(vec![], TypeSig::I4),
            body: Some(argon_bytecode::MethodBody {
                max_stack: 4,
                locals: vec![],
                code: w.finish(),
                eh: vec![],
            }),
        }
    }

    #[test]
    fn test_resolve_class_with_fields() {
        let mut parsed = ParsedModule::new("fields-demo");
        parsed.fields.push(field("count", TypeSig::I4));
        parsed.fields.push(field("next", TypeSig::Object));
        parsed.types.push(class("Node", 0..2, 0..0));
        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);

        let td = LOADER.resolve_type_row(module, 0, &[]).unwrap();
        assert_eq!(td.name, "Demo.Node");
        // header 16 + i4 at 16 + ref aligned at 24 = 32
        assert_eq!(td.size, 32);
        assert_eq!(td.ref_offsets(), &[24]);
        // Second resolve returns the same descriptor
        let again = LOADER.resolve_type_row(module, 0, &[]).unwrap();
        assert!(std::ptr::eq(td, again));
    }

    #[test]
    fn test_virtual_override_shares_slot() {
        let mut parsed = ParsedModule::new("vtable-demo");
        parsed.methods.push(virtual_method("Speak"));
        parsed.methods.push(virtual_method("Speak"));
        let mut base = class("Animal", 0..0, 0..1);
        base.flags = TypeFlags::ABSTRACT;
        parsed.types.push(base);
        let mut derived = class("Dog", 0..0, 1..2);
        derived.base = Some(Token::type_def(0));
        parsed.types.push(derived);

        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        let animal = LOADER.resolve_type_row(module, 0, &[]).unwrap();
        let dog = LOADER.resolve_type_row(module, 1, &[]).unwrap();

        assert_eq!(animal.vtable().len(), 1);
        assert_eq!(dog.vtable().len(), 1);
        // Same slot, different implementation
        assert_eq!(dog.vtable()[0].slot(), Some(0));
        assert!(!std::ptr::eq(animal.vtable()[0], dog.vtable()[0]));
        assert!(dog.is_assignable_to(animal));
        assert!(!animal.is_assignable_to(dog));
    }

    #[test]
    fn test_interface_map_appends_vtable_block() {
        let mut parsed = ParsedModule::new("iface-demo");
        parsed.methods.push(virtual_method("Run"));
        parsed.methods.push(virtual_method("Run"));
        let mut iface = class("IRunnable", 0..0, 0..1);
        iface.flags = TypeFlags::INTERFACE;
        parsed.types.push(iface);
        let mut imp = class("Runner", 0..0, 1..2);
        imp.interfaces = vec![Token::type_def(0)];
        parsed.types.push(imp);

        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        let iface_td = LOADER.resolve_type_row(module, 0, &[]).unwrap();
        let impl_td = LOADER.resolve_type_row(module, 1, &[]).unwrap();

        assert_eq!(impl_td.iface_map().len(), 1);
        assert!(impl_td.is_assignable_to(iface_td));
        let resolved = impl_td.interface_slot(iface_td, 0).unwrap();
        assert_eq!(resolved.name, "Run");
        // The interface block sits after the type's own virtual slots
        assert_eq!(impl_td.iface_map()[0].vtable_base, 1);
    }

    #[test]
    fn test_generic_instantiation_is_canonical() {
        let mut parsed = ParsedModule::new("generic-demo");
        parsed.fields.push(FieldRec {
            name: "item".into(),
            flags: FieldFlags::empty(),
            sig: TypeSig::Param(0),
        });
        let mut cell = class("Cell", 0..1, 0..0);
        cell.generic_params = 1;
        parsed.types.push(cell);

        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        let registry = LOADER.registry();

        let int_cell = LOADER
            .resolve_type_row(module, 0, &[registry.prim(crate::types::Prim::I4)])
            .unwrap();
        let int_cell2 = LOADER
            .resolve_type_row(module, 0, &[registry.prim(crate::types::Prim::I4)])
            .unwrap();
        assert!(std::ptr::eq(int_cell, int_cell2));
        assert_eq!(int_cell.name, "Demo.Cell<System.Int32>");
        // i4 field laid out inline; size rounds up to the 8-byte alignment
        assert_eq!(int_cell.size, 24);
        assert!(int_cell.ref_offsets().is_empty());

        let str_cell = LOADER
            .resolve_type_row(module, 0, &[registry.string()])
            .unwrap();
        assert!(!std::ptr::eq(int_cell, str_cell));
        assert_eq!(str_cell.ref_offsets(), &[16]);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let mut parsed = ParsedModule::new("arity-demo");
        let mut g = class("Pair", 0..0, 0..0);
        g.generic_params = 2;
        parsed.types.push(g);
        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        let registry = LOADER.registry();
        let err = LOADER
            .resolve_type_row(module, 0, &[registry.object()])
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Type(TypeError::ArityMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_static_region_built_lazily() {
        let mut parsed = ParsedModule::new("statics-demo");
        parsed.fields.push(FieldRec {
            name: "counter".into(),
            flags: FieldFlags::STATIC,
            sig: TypeSig::I8,
        });
        parsed.fields.push(FieldRec {
            name: "cache".into(),
            flags: FieldFlags::STATIC,
            sig: TypeSig::Object,
        });
        parsed.types.push(class("Globals", 0..2, 0..0));
        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        assert!(module.statics().is_none());

        let td = LOADER.resolve_type_row(module, 0, &[]).unwrap();
        let fref = LOADER.field_ref(module, td, 1).unwrap();
        assert!(fref.is_static);
        assert_eq!(fref.offset, 8);
        let region = module.statics().unwrap();
        assert_eq!(region.ref_offsets, vec![8]);
        assert!(fref.static_base != 0);
    }

    #[test]
    fn test_canonical_method_sharing_for_reference_args() {
        let mut parsed = ParsedModule::new("canon-demo");
        parsed.methods.push(MethodRec {
            name: "Get".into(),
            flags: MethodFlags::empty(),
            sig: MethodSig::instance(vec![], TypeSig::Param(0)),
            body: None,
        });
        let mut cell = class("Holder", 0..0, 0..1);
        cell.generic_params = 1;
        parsed.types.push(cell);
        let id = LOADER.load_module(parsed).unwrap();
        let module = LOADER.module(id);
        let registry = LOADER.registry();

        let str_holder = LOADER
            .resolve_type_row(module, 0, &[registry.string()])
            .unwrap();
        let md = str_holder.methods()[0];
        let canon = LOADER.canonical_method_of(md).unwrap();
        assert!(!std::ptr::eq(md, canon));
        assert_eq!(canon.declaring().name, "Demo.Holder<System.Object>");

        // Value-type instantiations keep their own body
        let int_holder = LOADER
            .resolve_type_row(module, 0, &[registry.prim(crate::types::Prim::I4)])
            .unwrap();
        let int_md = int_holder.methods()[0];
        assert!(std::ptr::eq(
            LOADER.canonical_method_of(int_md).unwrap(),
            int_md
        ));
    }
}
