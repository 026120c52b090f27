//! The assembler session: parser callbacks, resolution and emission.
//!
//! An [`Assembler`] is one compilation unit. The parser drives it through its callback
//! methods (`start_class`, `start_method`, `emit_*`, `add_field`, ...) in source order, which
//! builds the descriptor graph: classes in a [`ClassTable`], methods in an arena, members owned
//! by their class, references that cannot be resolved yet recorded as pending local references.
//! Method bodies are assembled when their method ends. [`Assembler::finish`] then runs the
//! emission pipeline in dependency order and returns the [`EmittedImage`].
//!
//! # Error handling
//!
//! Every callback returns [`crate::Result`]. What happens on a violation depends on its kind
//! and on [`AssemblerOptions`]:
//!
//! - policy violations with a safe correction are corrected with a warning, or rejected when
//!   running strict;
//! - reference failures found while emitting are collected until the end of the phase;
//! - with `continue_on_error` errors are recorded and processing continues, and `finish`
//!   fails with [`crate::Error::CompilationFailed`] at the very end.
//!
//! All diagnostics are available through [`Assembler::diagnostics`].
//!
//! # Examples
//!
//! ```rust
//! use dotasm::prelude::*;
//! use dotasm::metadata::flags::{MethodAttributes, TypeAttributes};
//! use dotasm::assembler::opcode;
//!
//! let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
//! asm.start_class(ClassHeader::new("Program", TypeAttributes::PUBLIC))?;
//! asm.start_method(MethodHeader::new(
//!     "Main",
//!     vec![0x00, 0x00, 0x01],
//!     MethodAttributes::PUBLIC | MethodAttributes::STATIC,
//! ))?;
//! asm.emit_entry_point()?;
//! asm.emit_opcode(opcode::RET)?;
//! asm.end_method()?;
//! asm.end_class()?;
//!
//! let image = asm.finish()?;
//! assert_eq!(image.methods.len(), 1);
//! assert_eq!(image.entry_point, Some(image.methods[0].token));
//! # Ok::<(), dotasm::Error>(())
//! ```

pub mod branches;
pub mod class;
pub mod data;
pub mod declare;
pub mod instr;
pub mod members;
pub mod method;
pub mod opcode;
pub mod refs;
pub mod resolver;
pub mod typespec;

mod body;
mod emit;

pub use body::BodyFolder;
pub use class::{Class, ClassHeader, ClassId, ClassSlot, ClassTable, MODULE_CLASS, MODULE_CLASS_NAME};
pub use members::{
    CustomAttribute, EventMethod, FieldDecl, GenericParamDecl, MethodImpl, PInvokeDecl,
    PermissionAttribute, PropertyMethod, SecurityDecl,
};
pub use method::{
    BranchTarget, ClauseKind, CodeLocation, ExceptionDecl, LocalDecl, Method, MethodHeader,
    MethodId, ParamDecl, SequencePoint, VarRef,
};

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        data::DataState,
        members::{AttributeTarget, QueuedAttribute},
        method::MethodBuilder,
        refs::SpecialTypes,
        resolver::LocalRefs,
        typespec::TypeSpecCache,
    },
    config::AssemblerOptions,
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    emitter::{MetadataEmitter, SectionAllocator},
    manifest::AsmMan,
    metadata::token::Token,
    Error, Result,
};

/// A method as it was placed in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedMethod {
    /// `MethodDef` token
    pub token: Token,
    /// Method name
    pub name: String,
    /// Owning type
    pub owner: Token,
    /// RVA of the body (offset into the delta IL in edit-and-continue mode)
    pub rva: u32,
    /// Header, code and exception sections
    pub body: Vec<u8>,
    /// The body shares its RVA with an identical, earlier body
    pub folded: bool,
    /// Sequence points recorded for the method
    pub sequence_points: Vec<SequencePoint>,
}

/// Tokens of a class and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedClass {
    /// `TypeDef` token
    pub token: Token,
    /// Fully qualified name
    pub name: String,
    /// Field tokens
    pub fields: Vec<Token>,
    /// Method tokens
    pub methods: Vec<Token>,
    /// Event tokens
    pub events: Vec<Token>,
    /// Property tokens
    pub properties: Vec<Token>,
}

/// An embedded resource inside the resource blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedResource {
    /// Resource name
    pub name: String,
    /// Offset of the length prefix in the blob
    pub offset: u32,
    /// Size of the resource data
    pub size: u32,
}

/// Everything a [`Assembler::finish`] pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmittedImage {
    /// Methods whose bodies were emitted by this pass
    pub methods: Vec<EmittedMethod>,
    /// Classes defined by this pass
    pub classes: Vec<EmittedClass>,
    /// Entry point method
    pub entry_point: Option<Token>,
    /// Embedded resources in blob order
    pub resources: Vec<EmbeddedResource>,
    /// Concatenated embedded resources
    pub resource_blob: Vec<u8>,
    /// Method bodies of an edit-and-continue pass, prefixed with their total length
    pub delta_il: Vec<u8>,
    /// No data address relocations were needed
    pub il_only: bool,
}

/// Source position reported by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SourcePosition {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// One compilation session.
pub struct Assembler<E: MetadataEmitter, S: SectionAllocator> {
    pub(crate) emitter: E,
    pub(crate) sections: S,
    pub(crate) options: AssemblerOptions,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) classes: ClassTable,
    pub(crate) methods: Vec<Method>,
    pub(crate) namespaces: Vec<String>,
    pub(crate) class_stack: Vec<ClassId>,
    pub(crate) current: Option<MethodBuilder>,
    pub(crate) current_event: Option<(ClassId, usize)>,
    pub(crate) current_property: Option<(ClassId, usize)>,
    pub(crate) target: AttributeTarget,
    pub(crate) refs: LocalRefs,
    pub(crate) typespecs: TypeSpecCache,
    pub(crate) attribute_queue: Vec<QueuedAttribute>,
    pub(crate) module_attributes: Vec<CustomAttribute>,
    pub(crate) data: DataState,
    pub(crate) manifest: AsmMan,
    pub(crate) module_name: Option<String>,
    pub(crate) module_name_emitted: bool,
    pub(crate) module_refs: FxHashMap<String, Token>,
    pub(crate) special: SpecialTypes,
    pub(crate) entry_point: Option<MethodId>,
    pub(crate) source: SourcePosition,
    pub(crate) il_only: bool,
    pub(crate) folder: BodyFolder,
    pub(crate) phase_errors: usize,
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Creates a session emitting into `emitter` and `sections`.
    pub fn new(emitter: E, sections: S, options: AssemblerOptions) -> Self {
        Assembler {
            emitter,
            sections,
            options,
            diagnostics: Diagnostics::new(),
            classes: ClassTable::new(),
            methods: Vec::new(),
            namespaces: Vec::new(),
            class_stack: Vec::new(),
            current: None,
            current_event: None,
            current_property: None,
            target: AttributeTarget::Module,
            refs: LocalRefs::default(),
            typespecs: TypeSpecCache::new(),
            attribute_queue: Vec::new(),
            module_attributes: Vec::new(),
            data: DataState::default(),
            manifest: AsmMan::default(),
            module_name: None,
            module_name_emitted: false,
            module_refs: FxHashMap::default(),
            special: SpecialTypes::default(),
            entry_point: None,
            source: SourcePosition::default(),
            il_only: true,
            folder: BodyFolder::new(),
            phase_errors: 0,
        }
    }

    /// Session options
    #[must_use]
    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    /// Diagnostics recorded so far
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// The metadata emitter
    #[must_use]
    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    /// The section allocator
    #[must_use]
    pub fn sections(&self) -> &S {
        &self.sections
    }

    /// The class table
    #[must_use]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// The method with the given id
    #[must_use]
    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id)
    }

    /// Returns the emitter and section allocator, ending the session.
    pub fn into_parts(self) -> (E, S) {
        (self.emitter, self.sections)
    }

    /// Records the source position of the next callbacks.
    ///
    /// With `debug_info` enabled a sequence point is recorded whenever the position changes
    /// inside a method. Line `0xfeefee` marks a hidden sequence point.
    pub fn set_source_position(&mut self, line: u32, column: u32) {
        self.source.line = line;
        self.source.column = column;
        if self.options.debug_info {
            let file = self.source.file.clone();
            if let Some(builder) = self.current.as_mut() {
                builder.record_sequence_point(line, column, file);
            }
        }
    }

    /// Records the source file of the next callbacks.
    pub fn set_source_file(&mut self, file: impl Into<String>) {
        self.source.file = Some(file.into());
    }

    pub(crate) fn current_class(&self) -> ClassId {
        self.class_stack.last().copied().unwrap_or(MODULE_CLASS)
    }

    pub(crate) fn class_mut(&mut self, id: ClassId) -> Result<&mut Class> {
        let name = self.classes.name(id).to_string();
        self.classes
            .get_mut(id)
            .ok_or(Error::UndefinedClass(name))
    }

    fn diagnostic(&self, severity: DiagnosticSeverity, error: &Error) -> Diagnostic {
        let diagnostic = Diagnostic::new(severity, DiagnosticCategory::from(error), error.to_string());
        if self.source.line > 0 {
            diagnostic.with_line(self.source.line)
        } else {
            diagnostic
        }
    }

    /// Records a hard error. Returns it unless the session continues past errors.
    pub(crate) fn report(&mut self, error: Error) -> Result<()> {
        let diagnostic = self.diagnostic(DiagnosticSeverity::Error, &error);
        self.diagnostics.push(diagnostic);
        if self.options.continue_on_error {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Records every error of a batch, then fails with the first one unless the session
    /// continues past errors.
    pub(crate) fn report_all(&mut self, errors: Vec<Error>) -> Result<()> {
        let mut first = None;
        for error in errors {
            let diagnostic = self.diagnostic(DiagnosticSeverity::Error, &error);
            self.diagnostics.push(diagnostic);
            first.get_or_insert(error);
        }
        match first {
            Some(error) if !self.options.continue_on_error => Err(error),
            _ => Ok(()),
        }
    }

    /// Records a hard error that fails the current phase once the phase is complete.
    pub(crate) fn defer(&mut self, error: Error) {
        let diagnostic = self.diagnostic(DiagnosticSeverity::Error, &error);
        self.diagnostics.push(diagnostic);
        self.phase_errors += 1;
    }

    /// Ends a phase, failing it if errors were deferred.
    pub(crate) fn close_phase(&mut self, phase: &'static str) -> Result<()> {
        let errors = std::mem::take(&mut self.phase_errors);
        log::debug!("phase '{phase}' complete, {errors} error(s)");
        if errors > 0 && !self.options.continue_on_error {
            return Err(Error::PhaseFailed { phase, errors });
        }
        Ok(())
    }

    /// Handles a correctable policy violation.
    ///
    /// Outside strict mode the caller applies the correction after a warning; in strict
    /// mode the violation is reported as [`Error::Policy`].
    pub(crate) fn policy(&mut self, message: String) -> Result<()> {
        if self.options.strict {
            return self.report(Error::Policy(message));
        }
        self.warn(DiagnosticCategory::Policy, message);
        Ok(())
    }

    pub(crate) fn warn(&mut self, category: DiagnosticCategory, message: String) {
        let diagnostic = Diagnostic::new(DiagnosticSeverity::Warning, category, message);
        let diagnostic = if self.source.line > 0 {
            diagnostic.with_line(self.source.line)
        } else {
            diagnostic
        };
        self.diagnostics.push(diagnostic);
    }

    /// Settles the result of one item of an emission phase.
    ///
    /// Reference failures are deferred to the end of the phase; any other failure is
    /// reported at once. Returns `None` when the item failed.
    pub(crate) fn recover<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) if DiagnosticCategory::from(&error) == DiagnosticCategory::Reference => {
                self.defer(error);
                Ok(None)
            }
            Err(error) => {
                self.report(error)?;
                Ok(None)
            }
        }
    }

    pub(crate) fn check_name_length(&mut self, name: &str) -> Result<()> {
        if name.len() > class::MAX_NAME_LENGTH {
            return self.report(Error::Policy(format!(
                "name exceeds {} characters: '{}...'",
                class::MAX_NAME_LENGTH,
                &name[..name.char_indices().nth(32).map_or(name.len(), |(i, _)| i)]
            )));
        }
        Ok(())
    }
}
