//! Method body assembly and folding.
//!
//! When a method ends its builder is turned into an [`AssembledBody`]: branches are
//! shortened and patched, exception clauses resolved and validated, the local signature
//! interned, and header, code and EH section encoded. The body is kept on the method until
//! [`Assembler::finish`] patches the pending local references into it and places it.

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        method::{AssembledBody, ClauseKind, CodeLocation, MethodBuilder},
        opcode, Assembler,
    },
    emitter::{MetadataEmitter, SectionAllocator},
    metadata::{
        method::{encode_body, BodyLayout, ExceptionHandler, ExceptionHandlerFlags},
        signatures::encode_local_signature,
        token::Token,
    },
    utils::hash_blob,
    Error, Result,
};

/// Identical method bodies seen so far and where they were placed.
///
/// Bodies are bucketed by their hash; a hit is only returned after comparing the bytes.
#[derive(Debug, Clone, Default)]
pub struct BodyFolder {
    buckets: FxHashMap<u64, Vec<(Vec<u8>, u32)>>,
}

impl BodyFolder {
    /// Creates an empty folder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// RVA of an earlier body with exactly these bytes
    #[must_use]
    pub fn find(&self, bytes: &[u8]) -> Option<u32> {
        self.buckets
            .get(&hash_blob(bytes))?
            .iter()
            .find(|(candidate, _)| candidate == bytes)
            .map(|&(_, rva)| rva)
    }

    /// Remembers that `bytes` were placed at `rva`.
    pub fn insert(&mut self, bytes: Vec<u8>, rva: u32) {
        self.buckets.entry(hash_blob(&bytes)).or_default().push((bytes, rva));
    }

    /// Number of distinct bodies
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Returns true if no body was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn locate(builder: &MethodBuilder, location: &CodeLocation) -> std::result::Result<u32, String> {
    match location {
        CodeLocation::Offset(offset) => Ok(*offset),
        CodeLocation::Label(label) => builder
            .labels
            .get(label)
            .copied()
            .ok_or_else(|| format!("undefined label '{label}'")),
    }
}

fn span(start: u32, end: u32, what: &str) -> std::result::Result<u32, String> {
    end.checked_sub(start)
        .ok_or_else(|| format!("{what} ends at 0x{end:X} before it starts at 0x{start:X}"))
}

/// Resolves the bounds of every clause and checks each against the code.
fn exception_handlers(builder: &MethodBuilder, method: &str) -> (Vec<ExceptionHandler>, Vec<Error>) {
    let code_size = builder.position();
    let mut handlers = Vec::with_capacity(builder.exceptions.len());
    let mut errors = Vec::new();

    for (index, clause) in builder.exceptions.iter().enumerate() {
        let resolved = (|| {
            let try_offset = locate(builder, &clause.try_start)?;
            let try_length = span(try_offset, locate(builder, &clause.try_end)?, "try block")?;
            let handler_offset = locate(builder, &clause.handler_start)?;
            let handler_length = span(handler_offset, locate(builder, &clause.handler_end)?, "handler")?;
            let (flags, class_token, filter_offset) = match &clause.kind {
                ClauseKind::Catch(class) => (ExceptionHandlerFlags::EXCEPTION, *class, 0),
                ClauseKind::Filter(start) => (ExceptionHandlerFlags::FILTER, Token::NIL, locate(builder, start)?),
                ClauseKind::Finally => (ExceptionHandlerFlags::FINALLY, Token::NIL, 0),
                ClauseKind::Fault => (ExceptionHandlerFlags::FAULT, Token::NIL, 0),
            };
            let handler = ExceptionHandler {
                flags,
                try_offset,
                try_length,
                handler_offset,
                handler_length,
                class_token,
                filter_offset,
            };
            match handler.check(code_size, &builder.filter_ends) {
                Some(reason) => Err(reason),
                None => Ok(handler),
            }
        })();

        match resolved {
            Ok(handler) => handlers.push(handler),
            Err(reason) => errors.push(Error::InvalidExceptionClause {
                index,
                method: method.to_string(),
                reason,
            }),
        }
    }
    (handlers, errors)
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Turns the builder of a finished method into its encoded body.
    pub(crate) fn assemble_body(&mut self, mut builder: MethodBuilder) -> Result<()> {
        let id = builder.id;
        let (name, bodyless) = match self.methods.get(id) {
            Some(method) => (method.name.clone(), method.is_bodyless()),
            None => return Err(Error::OutOfBounds),
        };

        if bodyless {
            if !builder.code.is_empty() {
                self.warn(
                    crate::diagnostics::DiagnosticCategory::Policy,
                    format!("Body of method '{name}' ignored"),
                );
            }
            return Ok(());
        }
        if builder.code.is_empty() {
            self.policy(format!("Method '{name}' has no body, 'ret' emitted"))?;
            opcode::encode_opcode(opcode::RET, &mut builder.code);
        }
        if builder.open_scopes.len() > 1 {
            self.warn(
                crate::diagnostics::DiagnosticCategory::Structural,
                format!("Method '{name}' ends with {} open scope(s)", builder.open_scopes.len() - 1),
            );
        }

        if self.options.optimize {
            builder.shorten_branches()?;
        }
        let mut errors = builder.patch_branches();
        let (handlers, clause_errors) = exception_handlers(&builder, &name);
        errors.extend(clause_errors);

        let mut slots = Vec::with_capacity(builder.locals.len());
        for (slot, ty) in builder.locals.iter().enumerate() {
            match ty {
                Some(ty) => slots.push(ty.as_slice()),
                None => errors.push(Error::InvalidLocal(format!(
                    "Local slot {slot} of method '{name}' is not declared"
                ))),
            }
        }

        if !errors.is_empty() {
            return self.report_all(errors);
        }

        let local_var_sig = if slots.is_empty() {
            Token::NIL
        } else {
            let signature = encode_local_signature(&slots);
            let result = self.emitter.get_token_from_sig(&signature);
            match self.recover(result)? {
                Some(token) => token,
                None => return Ok(()),
            }
        };

        let layout = BodyLayout {
            max_stack: builder.max_stack,
            local_var_sig,
            init_locals: builder.init_locals,
        };
        let encoded = encode_body(&layout, &builder.code, &handlers, self.options.preserve_max_stack);
        log::debug!(
            "method '{}' assembled: {} byte(s) of code, {} header, {} clause(s)",
            name,
            builder.code.len(),
            if encoded.is_fat { "fat" } else { "tiny" },
            handlers.len()
        );

        let alignment = encoded.alignment();
        let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
        method.body = Some(AssembledBody {
            bytes: encoded.bytes,
            header_size: encoded.header_size,
            alignment,
            il_fixups: builder.il_fixups,
            member_ref_fixups: builder.member_ref_fixups,
        });
        method.sequence_points = builder.sequence_points;
        method.has_new_body = true;
        method.folded = false;
        method.rva = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembler::{BranchTarget, ClassHeader, ExceptionDecl, LocalDecl, MethodHeader},
        config::AssemblerOptions,
        emitter::{MemoryEmitter, MemorySections},
        metadata::flags::{MethodAttributes, TypeAttributes},
    };

    const STATIC_VOID: [u8; 3] = [0x00, 0x00, 0x01];

    fn open(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
        let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), options);
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        asm.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC))
            .unwrap();
        asm
    }

    fn body(asm: &Assembler<MemoryEmitter, MemorySections>) -> &AssembledBody {
        asm.methods.last().unwrap().body.as_ref().unwrap()
    }

    #[test]
    fn folder_compares_bytes() {
        let mut folder = BodyFolder::new();
        assert!(folder.is_empty());
        folder.insert(vec![0x0A, 0x2A], 0x2050);
        assert_eq!(folder.find(&[0x0A, 0x2A]), Some(0x2050));
        assert_eq!(folder.find(&[0x0A, 0x2B]), None);
        folder.insert(vec![0x0A, 0x2B], 0x2054);
        assert_eq!(folder.len(), 2);
    }

    #[test]
    fn tiny_body() {
        let options = AssemblerOptions {
            preserve_max_stack: false,
            ..AssemblerOptions::default()
        };
        let mut asm = open(options);
        asm.emit_opcode(opcode::RET).unwrap();
        asm.end_method().unwrap();
        assert_eq!(body(&asm).bytes, vec![0x06, 0x2A]);
        assert_eq!(body(&asm).header_size, 1);
    }

    #[test]
    fn small_max_stack_is_preserved() {
        let mut asm = open(AssemblerOptions::default());
        asm.emit_max_stack(2).unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        asm.end_method().unwrap();
        let body = body(&asm);
        assert_eq!(body.header_size, 12);
        assert_eq!(&body.bytes[2..4], &2u16.to_le_bytes());
        assert_eq!(body.bytes[0] & 0x10, 0);
    }

    #[test]
    fn missing_body_gets_ret() {
        let mut asm = open(AssemblerOptions::default());
        asm.end_method().unwrap();
        assert_eq!(*body(&asm).bytes.last().unwrap(), opcode::RET as u8);
        assert!(asm.diagnostics().mentions("no body"));

        let mut strict = open(AssemblerOptions::strict());
        assert!(strict.end_method().is_err());
    }

    #[test]
    fn locals_make_a_fat_header() {
        let mut asm = open(AssemblerOptions::default());
        asm.declare_locals(vec![LocalDecl::new("i", vec![0x08])], true).unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        asm.end_method().unwrap();

        let body = body(&asm);
        assert_eq!(body.header_size, 12);
        assert_ne!(body.bytes[0] & 0x10, 0);
        assert_eq!(&body.bytes[8..12], &0x1100_0001u32.to_le_bytes());
        assert_eq!(asm.emitter().signatures[0].1, vec![0x07, 0x01, 0x08]);
    }

    #[test]
    fn local_gaps_are_rejected() {
        let mut asm = open(AssemblerOptions::default());
        asm.declare_locals(vec![LocalDecl::new("i", vec![0x08]).at_slot(1)], false).unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        assert!(matches!(asm.end_method(), Err(Error::InvalidLocal(_))));
    }

    #[test]
    fn undefined_labels_fail_the_method() {
        let mut asm = open(AssemblerOptions::default());
        asm.emit_branch(opcode::BR, BranchTarget::from("nowhere")).unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        assert!(matches!(asm.end_method(), Err(Error::UndefinedLabel(_))));
        assert!(asm.methods.last().unwrap().body.is_none());
    }

    #[test]
    fn forward_branches_shortened() {
        let mut asm = open(AssemblerOptions::optimized());
        asm.emit_branch(opcode::BR, BranchTarget::from("end")).unwrap();
        asm.emit_opcode(opcode::NOP).unwrap();
        asm.emit_label("end").unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        asm.end_method().unwrap();
        let body = body(&asm);
        assert_eq!(
            &body.bytes[body.header_size..],
            &[opcode::BR_S as u8, 1, opcode::NOP as u8, opcode::RET as u8]
        );
    }

    fn guarded(asm: &mut Assembler<MemoryEmitter, MemorySections>) {
        asm.emit_label("try").unwrap();
        asm.emit_opcode(opcode::NOP).unwrap();
        asm.emit_branch(opcode::LEAVE, BranchTarget::from("out")).unwrap();
        asm.emit_label("handler").unwrap();
        asm.emit_opcode(opcode::ENDFINALLY).unwrap();
        asm.emit_label("out").unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
    }

    #[test]
    fn finally_clause() {
        let mut asm = open(AssemblerOptions::default());
        guarded(&mut asm);
        asm.add_exception_handler(ExceptionDecl {
            try_start: "try".into(),
            try_end: "handler".into(),
            handler_start: "handler".into(),
            handler_end: "out".into(),
            kind: ClauseKind::Finally,
        })
        .unwrap();
        asm.end_method().unwrap();

        let body = body(&asm);
        assert_ne!(body.bytes[0] & 0x08, 0);
        // 12 header + 8 code, section at 20
        assert_eq!(body.bytes[20], 0x01);
        assert_eq!(body.bytes[21], 16);
        assert_eq!(&body.bytes[24..26], &2u16.to_le_bytes());
    }

    #[test]
    fn every_bad_clause_is_reported() {
        let options = AssemblerOptions {
            continue_on_error: true,
            ..AssemblerOptions::default()
        };
        let mut asm = open(options);
        guarded(&mut asm);
        asm.add_exception_handler(ExceptionDecl {
            try_start: "try".into(),
            try_end: "out".into(),
            handler_start: "handler".into(),
            handler_end: "out".into(),
            kind: ClauseKind::Fault,
        })
        .unwrap();
        asm.add_exception_handler(ExceptionDecl {
            try_start: "try".into(),
            try_end: "handler".into(),
            handler_start: "missing".into(),
            handler_end: "out".into(),
            kind: ClauseKind::Finally,
        })
        .unwrap();
        asm.end_method().unwrap();

        assert_eq!(asm.diagnostics().error_count(), 2);
        assert!(asm.diagnostics().mentions("SEH clause #1"));
        assert!(asm.methods.last().unwrap().body.is_none());
    }
}
