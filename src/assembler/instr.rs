//! Instruction emission into the body of the current method.
//!
//! Each `emit_*` callback appends one instruction to the [`MethodBuilder`] of the open
//! method. Operands that are only known later are written as zero placeholders and
//! recorded: branch targets as branch sites, pending local references as member-ref
//! fixups, tokens and data RVAs as IL fixups that become relocations once the body is placed.

use std::collections::hash_map::Entry;

use widestring::U16String;

use crate::{
    assembler::{
        branches::BranchSite,
        method::{BranchTarget, ClauseKind, CodeLocation, ExceptionDecl, IlFixup, IlFixupKind, MemberRefFixup, VarRef},
        opcode::{self, VarKind},
        Assembler,
    },
    emitter::{MetadataEmitter, SectionAllocator},
    metadata::token::TokenRef,
    utils::{fits_i8, push_le},
    Error, Result,
};

const INSTRUCTION: &str = "Instruction";

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Emits an instruction without operand.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_opcode(&mut self, op: u16) -> Result<()> {
        let Some(builder) = self.builder_mut(INSTRUCTION)? else {
            return Ok(());
        };
        opcode::encode_opcode(op, &mut builder.code);
        if op == opcode::ENDFILTER {
            let end = builder.position();
            builder.filter_ends.push(end);
        }
        Ok(())
    }

    /// Emits a variable access (`ldarg`, `ldloca.s`, `stloc`, ...) by index or by name.
    ///
    /// Names are looked up in the open local scopes or among the parameters; instance
    /// methods count `this` as argument 0. With `optimize` the shortest form is chosen:
    /// `ldarg.0`..`stloc.3`, then the `.s` form for indices below 256.
    ///
    /// # Errors
    /// Returns an error for unknown names, non-variable opcodes and indices that do not fit
    /// the requested form.
    pub fn emit_var(&mut self, op: u16, var: VarRef) -> Result<()> {
        let Some(kind) = opcode::var_kind(op) else {
            return self.report(malformed_error!("Opcode 0x{:04X} takes no variable", op));
        };

        let index = {
            let Some(builder) = self.builder_mut(INSTRUCTION)? else {
                return Ok(());
            };
            match &var {
                VarRef::Index(index) => Some(*index),
                VarRef::Name(name) => match kind {
                    VarKind::Argument => builder.arg_index(name),
                    VarKind::Local => builder.local_slot(name),
                },
            }
        };
        let Some(index) = index else {
            let what = match kind {
                VarKind::Argument => "argument",
                VarKind::Local => "local",
            };
            return self.report(Error::UndefinedReference(format!("Undefined {what} {var:?}")));
        };

        let optimize = self.options.optimize;
        let (op, wide) = if optimize {
            if let Some(macro_op) = opcode::macro_var_of(op, index) {
                (macro_op, None)
            } else if index <= u32::from(u8::MAX) {
                (opcode::short_var_of(op).unwrap_or(op), Some(false))
            } else {
                (opcode::long_var_of(op).unwrap_or(op), Some(true))
            }
        } else {
            (op, Some(!opcode::is_short_var(op)))
        };

        let limit = match wide {
            Some(true) => u32::from(u16::MAX),
            Some(false) => u32::from(u8::MAX),
            None => 3,
        };
        if index > limit {
            return self.report(Error::Policy(format!(
                "Variable index {index} does not fit opcode 0x{op:04X}"
            )));
        }

        if let Some(builder) = self.current.as_mut() {
            opcode::encode_opcode(op, &mut builder.code);
            match wide {
                Some(true) => push_le(&mut builder.code, index as u16),
                Some(false) => builder.code.push(index as u8),
                None => {}
            }
        }
        Ok(())
    }

    /// Emits an instruction with a 32-bit integer operand.
    ///
    /// `ldc.i4.s` takes a signed byte. With `optimize`, `ldc.i4` and `ldc.i4.s` become the
    /// shortest of `ldc.i4.m1`..`ldc.i4.8`, `ldc.i4.s` and `ldc.i4`.
    ///
    /// # Errors
    /// Returns an error outside of a method or if the value does not fit `ldc.i4.s`.
    pub fn emit_i32(&mut self, op: u16, value: i32) -> Result<()> {
        let is_ldc = op == opcode::LDC_I4 || op == opcode::LDC_I4_S;
        let (op, operand) = if is_ldc && self.options.optimize {
            opcode::shortest_ldc_i4(value)
        } else if op == opcode::LDC_I4_S {
            if !fits_i8(i64::from(value)) {
                return self.report(Error::Policy(format!("Value {value} does not fit ldc.i4.s")));
            }
            (op, vec![value as i8 as u8])
        } else {
            (op, value.to_le_bytes().to_vec())
        };

        if let Some(builder) = self.builder_mut(INSTRUCTION)? {
            opcode::encode_opcode(op, &mut builder.code);
            builder.code.extend_from_slice(&operand);
        }
        Ok(())
    }

    /// Emits an instruction with a 64-bit integer operand (`ldc.i8`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_i64(&mut self, op: u16, value: i64) -> Result<()> {
        if let Some(builder) = self.builder_mut(INSTRUCTION)? {
            opcode::encode_opcode(op, &mut builder.code);
            push_le(&mut builder.code, value);
        }
        Ok(())
    }

    /// Emits an instruction with a floating point operand. `ldc.r4` stores a `float32`,
    /// everything else a `float64`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_float(&mut self, op: u16, value: f64) -> Result<()> {
        if let Some(builder) = self.builder_mut(INSTRUCTION)? {
            opcode::encode_opcode(op, &mut builder.code);
            if op == opcode::LDC_R4 {
                push_le(&mut builder.code, value as f32);
            } else {
                push_le(&mut builder.code, value);
            }
        }
        Ok(())
    }

    /// Emits a branch to a label or a raw displacement.
    ///
    /// Label operands are written when the method ends. With `optimize` a long branch to a
    /// label that is already defined and within reach is emitted in its short form, and
    /// other long branches may be shortened by the shortening pass. A short branch is never
    /// widened. Raw displacements are written as given and disable shortening for the method.
    ///
    /// # Errors
    /// Returns an error for non-branch opcodes and raw displacements out of the short
    /// form's range.
    pub fn emit_branch(&mut self, op: u16, target: BranchTarget) -> Result<()> {
        let is_short = opcode::is_short_branch(op);
        if !is_short && !opcode::is_long_branch(op) {
            return self.report(malformed_error!("Opcode 0x{:04X} is not a branch", op));
        }
        let optimize = self.options.optimize;

        let mut error = None;
        if let Some(builder) = self.builder_mut(INSTRUCTION)? {
            let opcode_pos = builder.position();
            match target {
                BranchTarget::Offset(displacement) => {
                    builder.raw_offsets = true;
                    if !is_short {
                        opcode::encode_opcode(op, &mut builder.code);
                        push_le(&mut builder.code, displacement);
                    } else if fits_i8(i64::from(displacement)) {
                        opcode::encode_opcode(op, &mut builder.code);
                        builder.code.push(displacement as i8 as u8);
                    } else {
                        error = Some(Error::BranchOutOfRange {
                            label: displacement.to_string(),
                            offset: i64::from(displacement),
                        });
                    }
                }
                BranchTarget::Label(label) => {
                    let reaches_back = builder
                        .labels
                        .get(&label)
                        .is_some_and(|&target| fits_i8(i64::from(target) - i64::from(opcode_pos + 2)));
                    let (op, size, shrinkable) = match opcode::short_branch_of(op) {
                        _ if is_short => (op, 1, false),
                        Some(short) if optimize && reaches_back => (short, 1, false),
                        _ => (op, 4, optimize),
                    };

                    opcode::encode_opcode(op, &mut builder.code);
                    let operand_pos = builder.position();
                    builder.code.resize(builder.code.len() + usize::from(size), 0);
                    builder.sites.push(BranchSite {
                        label,
                        opcode_pos,
                        operand_pos,
                        size,
                        relative_to: operand_pos + u32::from(size),
                        opcode: op,
                        shrinkable,
                    });
                }
            }
        }

        match error {
            Some(error) => self.report(error),
            None => Ok(()),
        }
    }

    /// Emits a `switch` over `targets`.
    ///
    /// Displacements are relative to the end of the whole instruction.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_switch(&mut self, targets: Vec<BranchTarget>) -> Result<()> {
        let Some(builder) = self.builder_mut(INSTRUCTION)? else {
            return Ok(());
        };
        let opcode_pos = builder.position();
        opcode::encode_opcode(opcode::SWITCH, &mut builder.code);
        push_le(&mut builder.code, targets.len() as u32);
        let operands = builder.position();
        let end = operands + 4 * targets.len() as u32;

        for (index, target) in targets.into_iter().enumerate() {
            let operand_pos = operands + 4 * index as u32;
            match target {
                BranchTarget::Label(label) => {
                    builder.code.extend_from_slice(&[0; 4]);
                    builder.sites.push(BranchSite {
                        label,
                        opcode_pos,
                        operand_pos,
                        size: 4,
                        relative_to: end,
                        opcode: 0,
                        shrinkable: false,
                    });
                }
                BranchTarget::Offset(displacement) => {
                    builder.raw_offsets = true;
                    push_le(&mut builder.code, displacement);
                }
            }
        }
        Ok(())
    }

    /// Emits an instruction with a metadata token operand (`call`, `ldfld`, `newobj`, ...).
    ///
    /// A pending local reference leaves a placeholder that is overwritten once the
    /// reference is resolved; a final token is recorded for relocation.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_token(&mut self, op: u16, token: TokenRef) -> Result<()> {
        let Some(builder) = self.builder_mut(INSTRUCTION)? else {
            return Ok(());
        };
        opcode::encode_opcode(op, &mut builder.code);
        let offset = builder.position();
        match token {
            TokenRef::Final(token) => {
                push_le(&mut builder.code, token.value());
                if !token.is_null() {
                    builder.il_fixups.push(IlFixup {
                        offset,
                        kind: IlFixupKind::Token,
                    });
                }
            }
            TokenRef::Pending(local) => {
                builder.code.extend_from_slice(&[0; 4]);
                builder.member_ref_fixups.push(MemberRefFixup { offset, local });
            }
        }
        Ok(())
    }

    /// Emits a string literal instruction (`ldstr`); the string goes to the user string heap
    /// as UTF-16.
    ///
    /// # Errors
    /// Returns an error outside of a method or if the heap rejects the string.
    pub fn emit_string(&mut self, op: u16, value: &str) -> Result<()> {
        if self.builder_mut(INSTRUCTION)?.is_none() {
            return Ok(());
        }
        let wide = U16String::from_str(value);
        let result = self.emitter.define_user_string(wide.as_slice());
        match self.recover(result)? {
            Some(token) => self.emit_token(op, TokenRef::Final(token)),
            None => Ok(()),
        }
    }

    /// Emits an instruction with a stand-alone signature operand (`calli`).
    ///
    /// # Errors
    /// Returns an error outside of a method or if the emitter rejects the signature.
    pub fn emit_sig(&mut self, op: u16, signature: &[u8]) -> Result<()> {
        if self.builder_mut(INSTRUCTION)?.is_none() {
            return Ok(());
        }
        let result = self.emitter.get_token_from_sig(signature);
        match self.recover(result)? {
            Some(token) => self.emit_token(op, TokenRef::Final(token)),
            None => Ok(()),
        }
    }

    /// Emits an instruction whose operand is the RVA of a data label.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_data_rva(&mut self, op: u16, label: &str) -> Result<()> {
        if let Some(builder) = self.builder_mut(INSTRUCTION)? {
            opcode::encode_opcode(op, &mut builder.code);
            let offset = builder.position();
            builder.code.extend_from_slice(&[0; 4]);
            builder.il_fixups.push(IlFixup {
                offset,
                kind: IlFixupKind::DataRva(label.to_string()),
            });
        }
        Ok(())
    }

    /// Defines a code label at the current position.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateLabel`] if the label already exists in this method.
    pub fn emit_label(&mut self, label: impl Into<String>) -> Result<()> {
        let duplicate = {
            let Some(builder) = self.builder_mut("Label")? else {
                return Ok(());
            };
            let position = builder.position();
            match builder.labels.entry(label.into()) {
                Entry::Occupied(entry) => Some(entry.key().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(position);
                    None
                }
            }
        };
        match duplicate {
            Some(label) => self.report(Error::DuplicateLabel(label)),
            None => Ok(()),
        }
    }

    /// Adds an exception clause (`.try`) to the current method.
    ///
    /// Bounds are resolved and validated when the method ends. Numeric bounds disable
    /// branch shortening for the method.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn add_exception_handler(&mut self, clause: ExceptionDecl) -> Result<()> {
        let Some(builder) = self.builder_mut(".try")? else {
            return Ok(());
        };
        let is_numeric = |location: &CodeLocation| matches!(location, CodeLocation::Offset(_));
        let filter_numeric = matches!(&clause.kind, ClauseKind::Filter(start) if is_numeric(start));
        if filter_numeric
            || [&clause.try_start, &clause.try_end, &clause.handler_start, &clause.handler_end]
                .into_iter()
                .any(is_numeric)
        {
            builder.raw_offsets = true;
        }
        builder.exceptions.push(clause);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembler::{opcode, BranchTarget, ClassHeader, LocalDecl, MethodHeader, ParamDecl, VarRef},
        config::AssemblerOptions,
        emitter::{MemoryEmitter, MemorySections},
        metadata::{
            flags::{MethodAttributes, TypeAttributes},
            token::{LocalRef, Token, TokenRef},
        },
        Assembler, Error,
    };

    fn in_method(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
        let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), options);
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        let header = MethodHeader::new("M", vec![0x20, 0x02, 0x01, 0x08, 0x08], MethodAttributes::PUBLIC)
            .param(ParamDecl::new("a"))
            .param(ParamDecl::new("b"));
        asm.start_method(header).unwrap();
        asm
    }

    fn code(asm: &Assembler<MemoryEmitter, MemorySections>) -> &[u8] {
        &asm.current.as_ref().unwrap().code
    }

    #[test]
    fn variables_by_name() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.declare_locals(vec![LocalDecl::new("x", vec![0x08])], false).unwrap();
        asm.emit_var(opcode::LDARG, VarRef::Name("b".to_string())).unwrap();
        asm.emit_var(opcode::STLOC_S, VarRef::Name("x".to_string())).unwrap();
        assert_eq!(code(&asm), &[0xFE, 0x09, 0x02, 0x00, opcode::STLOC_S as u8, 0x00]);

        let missing = asm.emit_var(opcode::LDLOC, VarRef::Name("y".to_string()));
        assert!(matches!(missing, Err(Error::UndefinedReference(_))));
    }

    #[test]
    fn variables_optimized() {
        let mut asm = in_method(AssemblerOptions::optimized());
        asm.emit_var(opcode::LDARG, VarRef::Index(0)).unwrap();
        asm.emit_var(opcode::LDLOC, VarRef::Index(200)).unwrap();
        asm.emit_var(opcode::STLOC_S, VarRef::Index(300)).unwrap();
        asm.emit_var(opcode::LDARGA, VarRef::Index(1)).unwrap();
        assert_eq!(
            code(&asm),
            &[
                opcode::LDARG_0 as u8,
                opcode::LDLOC_S as u8,
                200,
                0xFE,
                0x0E,
                0x2C,
                0x01,
                opcode::LDARGA_S as u8,
                1
            ]
        );
    }

    #[test]
    fn short_variable_index_out_of_range() {
        let mut asm = in_method(AssemblerOptions::default());
        let result = asm.emit_var(opcode::LDLOC_S, VarRef::Index(256));
        assert!(matches!(result, Err(Error::Policy(_))));
    }

    #[test]
    fn integer_constants() {
        let mut asm = in_method(AssemblerOptions::optimized());
        asm.emit_i32(opcode::LDC_I4, 5).unwrap();
        asm.emit_i32(opcode::LDC_I4, -7).unwrap();
        asm.emit_i64(opcode::LDC_I8, 1).unwrap();
        asm.emit_float(opcode::LDC_R4, 1.5).unwrap();
        let mut expected = vec![0x1B, opcode::LDC_I4_S as u8, 0xF9, opcode::LDC_I8 as u8];
        expected.extend_from_slice(&1i64.to_le_bytes());
        expected.push(opcode::LDC_R4 as u8);
        expected.extend_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(code(&asm), expected.as_slice());

        let mut plain = in_method(AssemblerOptions::default());
        plain.emit_i32(opcode::LDC_I4, 5).unwrap();
        assert_eq!(code(&plain), &[opcode::LDC_I4 as u8, 5, 0, 0, 0]);
        assert!(plain.emit_i32(opcode::LDC_I4_S, 300).is_err());
    }

    #[test]
    fn backward_branch_is_short_when_optimizing() {
        let mut asm = in_method(AssemblerOptions::optimized());
        asm.emit_label("top").unwrap();
        asm.emit_opcode(opcode::NOP).unwrap();
        asm.emit_branch(opcode::BR, BranchTarget::from("top")).unwrap();
        let builder = asm.current.as_ref().unwrap();
        assert_eq!(builder.code, vec![opcode::NOP as u8, opcode::BR_S as u8, 0]);
        assert_eq!(builder.sites[0].size, 1);
        assert_eq!(builder.sites[0].relative_to, 3);
    }

    #[test]
    fn forward_branch_stays_long_until_method_end() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.emit_branch(opcode::BRTRUE, BranchTarget::from("done")).unwrap();
        let builder = asm.current.as_ref().unwrap();
        assert_eq!(builder.code.len(), 5);
        assert!(!builder.sites[0].shrinkable);
    }

    #[test]
    fn raw_displacements() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.emit_branch(opcode::BR_S, BranchTarget::Offset(-2)).unwrap();
        assert_eq!(code(&asm), &[opcode::BR_S as u8, 0xFE]);
        assert!(asm.current.as_ref().unwrap().raw_offsets);
        assert!(matches!(
            asm.emit_branch(opcode::BR_S, BranchTarget::Offset(500)),
            Err(Error::BranchOutOfRange { offset: 500, .. })
        ));
        assert!(asm.emit_branch(opcode::CALL, BranchTarget::Offset(0)).is_err());
    }

    #[test]
    fn switch_sites() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.emit_switch(vec![BranchTarget::from("a"), BranchTarget::Offset(4)]).unwrap();
        let builder = asm.current.as_ref().unwrap();
        assert_eq!(builder.code.len(), 1 + 4 + 8);
        assert_eq!(&builder.code[1..5], &2u32.to_le_bytes());
        assert_eq!(&builder.code[9..13], &4i32.to_le_bytes());
        assert_eq!(builder.sites.len(), 1);
        assert_eq!(builder.sites[0].operand_pos, 5);
        assert_eq!(builder.sites[0].relative_to, 13);
    }

    #[test]
    fn token_operands() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.emit_token(opcode::CALL, TokenRef::Final(Token(0x0A000001))).unwrap();
        asm.emit_token(opcode::CALL, TokenRef::Pending(LocalRef::MethodRef(0))).unwrap();
        asm.emit_string(opcode::LDSTR, "hi").unwrap();

        let builder = asm.current.as_ref().unwrap();
        assert_eq!(&builder.code[1..5], &0x0A00_0001u32.to_le_bytes());
        assert_eq!(&builder.code[6..10], &[0; 4]);
        assert_eq!(builder.member_ref_fixups.len(), 1);
        assert_eq!(builder.member_ref_fixups[0].offset, 6);
        assert_eq!(builder.il_fixups.len(), 2);
        assert_eq!(builder.code[11..15][3], 0x70);
        assert_eq!(asm.emitter().calls("define_user_string"), 1);
    }

    #[test]
    fn labels_and_filters() {
        let mut asm = in_method(AssemblerOptions::default());
        asm.emit_label("L").unwrap();
        assert!(matches!(asm.emit_label("L"), Err(Error::DuplicateLabel(_))));
        asm.emit_opcode(opcode::ENDFILTER).unwrap();
        assert_eq!(asm.current.as_ref().unwrap().filter_ends, vec![2]);
    }

    #[test]
    fn instructions_outside_methods() {
        let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
        assert!(matches!(asm.emit_opcode(opcode::RET), Err(Error::InvalidScope(_))));
        assert!(matches!(asm.emit_string(opcode::LDSTR, "x"), Err(Error::InvalidScope(_))));
        assert_eq!(asm.emitter().calls("define_user_string"), 0);
    }
}
