//! Structural module verification
//!
//! Checks that tables are internally consistent before the loader touches
//! them: token tags address real tables, field/method ranges nest inside
//! their tables, bodies decode, branch targets land on instruction
//! boundaries, and exception regions sit inside their body. Stack-shape
//! verification is deeper and belongs to the JIT's flow analysis.

use crate::body::{DecodeError, EhKind, InstrReader, Operand};
use crate::module::{ParsedModule, Token, TokenKind};
use thiserror::Error;

/// Structural verification errors.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A definition range points past its table.
    #[error("type {type_index}: {what} range {start}..{end} exceeds table of {len} rows")]
    RangeOutOfBounds {
        /// Index of the offending type row.
        type_index: usize,
        /// "field" or "method".
        what: &'static str,
        /// Range start.
        start: u32,
        /// Range end.
        end: u32,
        /// Table length.
        len: usize,
    },

    /// A body failed to decode.
    #[error("method {method_index}: {source}")]
    BadBody {
        /// Index of the offending method row.
        method_index: usize,
        /// Underlying decode error.
        #[source]
        source: DecodeError,
    },

    /// A branch target does not start an instruction.
    #[error("method {method_index}: branch target {target} is not an instruction boundary")]
    TargetInsideInstruction {
        /// Index of the offending method row.
        method_index: usize,
        /// The bad target offset.
        target: u32,
    },

    /// An exception region lies outside the body.
    #[error("method {method_index}: exception region out of bounds")]
    EhOutOfBounds {
        /// Index of the offending method row.
        method_index: usize,
    },

    /// A token with an invalid or unexpected tag.
    #[error("invalid token {token:#010x} in {context}")]
    BadToken {
        /// The bad token value.
        token: u32,
        /// Where it was found.
        context: &'static str,
    },

    /// The entry point is missing or not a MethodDef.
    #[error("entry point token is not a method definition")]
    BadEntryPoint,
}

/// Verify a module's structural integrity.
pub fn verify_module(module: &ParsedModule) -> Result<(), VerifyError> {
    for (type_index, ty) in module.types.iter().enumerate() {
        check_range(type_index, "field", &ty.fields, module.fields.len())?;
        check_range(type_index, "method", &ty.methods, module.methods.len())?;
        if let Some(base) = ty.base {
            check_type_token(base, "base type")?;
        }
        for &iface in &ty.interfaces {
            check_type_token(iface, "interface list")?;
        }
    }

    if let Some(entry) = module.entry_point {
        if entry.kind() != Some(TokenKind::MethodDef) || entry.index() >= module.methods.len() {
            return Err(VerifyError::BadEntryPoint);
        }
    }

    for (method_index, method) in module.methods.iter().enumerate() {
        let Some(body) = &method.body else { continue };

        // Decode every instruction, collecting boundaries and targets
        let mut boundaries = vec![false; body.code.len() + 1];
        let mut targets: Vec<u32> = Vec::new();
        let mut reader = InstrReader::new(&body.code);
        while !reader.at_end() {
            boundaries[reader.offset() as usize] = true;
            let instr = reader
                .next_instr()
                .map_err(|source| VerifyError::BadBody { method_index, source })?;
            match instr.operand {
                Operand::Target(t) => targets.push(t),
                Operand::Switch(ref ts) => targets.extend_from_slice(ts),
                _ => {}
            }
        }
        boundaries[body.code.len()] = true;

        for target in targets {
            if !boundaries[target as usize] {
                return Err(VerifyError::TargetInsideInstruction { method_index, target });
            }
        }

        let code_len = body.code.len() as u32;
        for region in &body.eh {
            let try_end = region.try_offset.checked_add(region.try_len);
            let handler_end = region.handler_offset.checked_add(region.handler_len);
            let ok = matches!((try_end, handler_end), (Some(te), Some(he)) if te <= code_len && he <= code_len)
                && boundaries[region.try_offset as usize]
                && boundaries[region.handler_offset as usize];
            if !ok {
                return Err(VerifyError::EhOutOfBounds { method_index });
            }
            if let EhKind::Filter { filter_offset } = region.kind {
                if filter_offset >= region.handler_offset || !boundaries[filter_offset as usize] {
                    return Err(VerifyError::EhOutOfBounds { method_index });
                }
            }
            if let EhKind::Catch(token) = region.kind {
                check_type_token(token, "catch clause")?;
            }
        }
    }

    Ok(())
}

fn check_range(
    type_index: usize,
    what: &'static str,
    range: &std::ops::Range<u32>,
    len: usize,
) -> Result<(), VerifyError> {
    if range.start as usize > len || range.end as usize > len || range.start > range.end {
        return Err(VerifyError::RangeOutOfBounds {
            type_index,
            what,
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

fn check_type_token(token: Token, context: &'static str) -> Result<(), VerifyError> {
    match token.kind() {
        Some(TokenKind::TypeDef | TokenKind::TypeRef | TokenKind::TypeSpec) => Ok(()),
        _ => Err(VerifyError::BadToken {
            token: token.0,
            context,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{EhRegion, InstrWriter, MethodBody};
    use crate::module::{MethodFlags, MethodRec, TypeDefRec, TypeFlags};
    use crate::opcode::Opcode;
    use crate::sig::MethodSig;

    fn method_with_code(code: Vec<u8>) -> MethodRec {
        MethodRec {
            name: "m".into(),
            flags: MethodFlags::STATIC,
            sig: MethodSig::stat(vec![], crate::sig::TypeSig::Void),
            body: Some(MethodBody {
                max_stack: 8,
                locals: vec![],
                code,
                eh: vec![],
            }),
        }
    }

    #[test]
    fn test_verify_empty_module() {
        let module = ParsedModule::new("m");
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn test_verify_good_body() {
        let mut w = InstrWriter::new();
        let l = w.label();
        w.ldc_i4(1);
        w.branch(Opcode::BrTrue, l);
        w.bind(l);
        w.op(Opcode::Ret);
        let mut module = ParsedModule::new("m");
        module.methods.push(method_with_code(w.finish()));
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn test_verify_rejects_mid_instruction_target() {
        // br to offset 2, which is inside the br's own operand
        let mut code = vec![Opcode::Br as u8];
        code.extend_from_slice(&(-3i32).to_le_bytes());
        let mut module = ParsedModule::new("m");
        module.methods.push(method_with_code(code));
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::TargetInsideInstruction { target: 2, .. })
        ));
    }

    #[test]
    fn test_verify_rejects_bad_type_range() {
        let mut module = ParsedModule::new("m");
        module.types.push(TypeDefRec {
            namespace: String::new(),
            name: "T".into(),
            flags: TypeFlags::empty(),
            base: None,
            interfaces: vec![],
            fields: 0..3,
            methods: 0..0,
            generic_params: 0,
            finalizer: None,
        });
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::RangeOutOfBounds { what: "field", .. })
        ));
    }

    #[test]
    fn test_verify_rejects_eh_outside_body() {
        let mut w = InstrWriter::new();
        w.op(Opcode::Ret);
        let mut method = method_with_code(w.finish());
        method.body.as_mut().unwrap().eh.push(EhRegion {
            kind: crate::body::EhKind::Finally,
            try_offset: 0,
            try_len: 100,
            handler_offset: 0,
            handler_len: 1,
        });
        let mut module = ParsedModule::new("m");
        module.methods.push(method);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::EhOutOfBounds { .. })
        ));
    }
}
