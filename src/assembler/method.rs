//! Method descriptors and the per-method assembly state.
//!
//! A [`Method`] is the descriptor that outlives the parse: it is owned by the session's
//! method arena and referenced from its class by [`MethodId`]. While the parser is inside a
//! `.method` block, a [`MethodBuilder`] collects the instruction stream together with every
//! code position that must be patched or shifted later: branch sites, labels, exception
//! clause bounds, `endfilter` boundaries, token fixups and sequence points.

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        branches::BranchSite,
        class::ClassId,
        members::{CustomAttribute, GenericParam, GenericParamDecl, PInvokeDecl, SecurityDecl},
    },
    emitter::Constant,
    metadata::token::{LocalRef, Token},
};

/// Index of a method in the session's method arena.
pub type MethodId = usize;

/// Line number marking a hidden sequence point.
pub const HIDDEN_LINE: u32 = 0x00fe_efee;

/// A parameter as declared in a method header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamDecl {
    /// Parameter name
    pub name: String,
    /// `ParamAttributes`
    pub flags: u32,
    /// Default value
    pub constant: Option<Constant>,
    /// Marshalling descriptor
    pub marshal: Option<Vec<u8>>,
}

impl ParamDecl {
    /// A named parameter without attributes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ParamDecl {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the attribute flags
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the marshalling descriptor
    #[must_use]
    pub fn with_marshal(mut self, native_type: Vec<u8>) -> Self {
        self.marshal = Some(native_type);
        self
    }
}

/// A parameter (or the return value) of a declared method.
#[derive(Debug, Clone, Default)]
pub struct Param {
    /// Parameter name, empty for the return value
    pub name: String,
    /// `ParamAttributes`
    pub flags: u32,
    /// Default value
    pub constant: Option<Constant>,
    /// Marshalling descriptor
    pub marshal: Option<Vec<u8>>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl Param {
    /// Returns true if the parameter needs a `Param` row of its own.
    #[must_use]
    pub fn needs_row(&self) -> bool {
        !self.name.is_empty()
            || self.flags != 0
            || self.constant.is_some()
            || self.marshal.is_some()
            || !self.custom_attributes.is_empty()
    }
}

impl From<ParamDecl> for Param {
    fn from(decl: ParamDecl) -> Self {
        Param {
            name: decl.name,
            flags: decl.flags,
            constant: decl.constant,
            marshal: decl.marshal,
            custom_attributes: Vec::new(),
            token: Token::NIL,
        }
    }
}

/// The header of a `.method` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    /// Method name
    pub name: String,
    /// Method signature blob
    pub signature: Vec<u8>,
    /// `MethodAttributes`
    pub flags: u32,
    /// `MethodImplAttributes`
    pub impl_flags: u32,
    /// Declared parameters
    pub params: Vec<ParamDecl>,
    /// Attributes and marshalling of the return value
    pub return_param: Option<ParamDecl>,
    /// Generic parameters
    pub generic_params: Vec<GenericParamDecl>,
    /// `pinvokeimpl` clause
    pub pinvoke: Option<PInvokeDecl>,
}

impl MethodHeader {
    /// A header with no parameters, impl attributes or generic parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, signature: Vec<u8>, flags: u32) -> Self {
        MethodHeader {
            name: name.into(),
            signature,
            flags,
            impl_flags: 0,
            params: Vec::new(),
            return_param: None,
            generic_params: Vec::new(),
            pinvoke: None,
        }
    }

    /// Sets the impl attributes
    #[must_use]
    pub fn impl_flags(mut self, impl_flags: u32) -> Self {
        self.impl_flags = impl_flags;
        self
    }

    /// Adds a parameter
    #[must_use]
    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    /// Sets the return value attributes
    #[must_use]
    pub fn returns(mut self, param: ParamDecl) -> Self {
        self.return_param = Some(param);
        self
    }

    /// Adds a generic parameter
    #[must_use]
    pub fn generic_param(mut self, param: GenericParamDecl) -> Self {
        self.generic_params.push(param);
        self
    }

    /// Sets the `pinvokeimpl` clause
    #[must_use]
    pub fn pinvoke(mut self, pinvoke: PInvokeDecl) -> Self {
        self.pinvoke = Some(pinvoke);
        self
    }
}

/// A source position attached to an IL offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// IL offset
    pub offset: u32,
    /// Source line, [`HIDDEN_LINE`] for hidden points
    pub line: u32,
    /// Source column
    pub column: u32,
    /// Source file
    pub file: Option<String>,
}

impl SequencePoint {
    /// Returns true for a hidden sequence point
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.line == HIDDEN_LINE
    }
}

/// A `.locals` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDecl {
    /// Variable name
    pub name: Option<String>,
    /// Encoded type of the slot
    pub ty: Vec<u8>,
    /// Explicit slot (`[n]`)
    pub slot: Option<u32>,
}

impl LocalDecl {
    /// A named local in the next free slot.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: Vec<u8>) -> Self {
        LocalDecl {
            name: Some(name.into()),
            ty,
            slot: None,
        }
    }

    /// Places the local in an explicit slot
    #[must_use]
    pub fn at_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }
}

/// Target of a branch instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchTarget {
    /// A code label
    Label(String),
    /// A raw displacement, written as is
    Offset(i32),
}

impl From<&str> for BranchTarget {
    fn from(label: &str) -> Self {
        BranchTarget::Label(label.to_string())
    }
}

/// A boundary of an exception clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeLocation {
    /// A code label
    Label(String),
    /// A raw IL offset
    Offset(u32),
}

impl From<&str> for CodeLocation {
    fn from(label: &str) -> Self {
        CodeLocation::Label(label.to_string())
    }
}

/// Kind of an exception clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseKind {
    /// `catch` with the caught type
    Catch(Token),
    /// `filter` with the start of the filter block
    Filter(CodeLocation),
    /// `finally`
    Finally,
    /// `fault`
    Fault,
}

/// A `.try` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDecl {
    /// Start of the protected block
    pub try_start: CodeLocation,
    /// End of the protected block (exclusive)
    pub try_end: CodeLocation,
    /// Start of the handler
    pub handler_start: CodeLocation,
    /// End of the handler (exclusive)
    pub handler_end: CodeLocation,
    /// Clause kind
    pub kind: ClauseKind,
}

/// Operand of a variable access instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRef {
    /// Slot or argument index
    Index(u32),
    /// Local or parameter name
    Name(String),
}

/// A code position to patch or relocate once the body is placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IlFixupKind {
    /// A token operand, relocated with `MapToken`
    Token,
    /// The RVA of a data label
    DataRva(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IlFixup {
    pub offset: u32,
    pub kind: IlFixupKind,
}

/// A 4-byte operand holding a pending local reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemberRefFixup {
    pub offset: u32,
    pub local: LocalRef,
}

/// A lexical scope of local names.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalScope {
    pub names: FxHashMap<String, u32>,
    pub start: u32,
    pub end: Option<u32>,
}

/// A finished method body, waiting for fixups and placement.
#[derive(Debug, Clone)]
pub struct AssembledBody {
    /// Header, code and EH section
    pub bytes: Vec<u8>,
    /// Size of the header
    pub header_size: usize,
    /// Alignment required in the IL section
    pub alignment: usize,
    pub(crate) il_fixups: Vec<IlFixup>,
    pub(crate) member_ref_fixups: Vec<MemberRefFixup>,
}

/// A declared method.
#[derive(Debug, Clone)]
pub struct Method {
    /// Method name, privatescope suffix removed
    pub name: String,
    /// Owning class
    pub class: ClassId,
    /// Signature, normalized for static and instance methods
    pub signature: Vec<u8>,
    /// `MethodAttributes`
    pub flags: u32,
    /// `MethodImplAttributes`
    pub impl_flags: u32,
    /// Parameters
    pub params: Vec<Param>,
    /// Return value
    pub return_param: Param,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Unmanaged import
    pub pinvoke: Option<PInvokeDecl>,
    /// Declarative security
    pub security: Vec<SecurityDecl>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
    /// The body changed since the last emission pass
    pub has_new_body: bool,
    /// The assembled body
    pub body: Option<AssembledBody>,
    /// Sequence points of the body
    pub sequence_points: Vec<SequencePoint>,
    /// RVA of the placed body
    pub rva: Option<u32>,
    /// The body shares the RVA of an identical earlier body
    pub folded: bool,
    /// Source line of the declaration
    pub line: u32,
}

impl Method {
    /// Returns true for static methods
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags & crate::metadata::flags::MethodAttributes::STATIC != 0
    }

    /// Returns true if the method never carries IL: abstract, P/Invoke, runtime or internal call.
    #[must_use]
    pub fn is_bodyless(&self) -> bool {
        use crate::metadata::flags::{MethodAttributes, MethodImplAttributes};

        self.flags & (MethodAttributes::ABSTRACT | MethodAttributes::PINVOKE_IMPL) != 0
            || self.impl_flags & MethodImplAttributes::CODE_TYPE_MASK == MethodImplAttributes::RUNTIME
            || self.impl_flags & MethodImplAttributes::INTERNAL_CALL != 0
    }

    /// Position of the generic parameter `name`
    #[must_use]
    pub fn generic_param_index(&self, name: &str) -> Option<usize> {
        self.generic_params.iter().position(|p| p.name == name)
    }
}

/// Per-method state while the parser is inside a `.method` block.
#[derive(Debug)]
pub(crate) struct MethodBuilder {
    pub id: MethodId,
    pub code: Vec<u8>,
    pub labels: FxHashMap<String, u32>,
    pub sites: Vec<BranchSite>,
    /// Raw branch displacements or numeric clause offsets were used
    pub raw_offsets: bool,
    pub exceptions: Vec<ExceptionDecl>,
    /// Offsets directly after each `endfilter`
    pub filter_ends: Vec<u32>,
    /// Types of the local slots, `None` for gaps
    pub locals: Vec<Option<Vec<u8>>>,
    pub scopes: Vec<LocalScope>,
    /// Indices of the open scopes, innermost last
    pub open_scopes: Vec<usize>,
    pub max_stack: u16,
    pub init_locals: bool,
    pub il_fixups: Vec<IlFixup>,
    pub member_ref_fixups: Vec<MemberRefFixup>,
    pub sequence_points: Vec<SequencePoint>,
    last_position: Option<(u32, u32)>,
    pub arg_names: Vec<String>,
    pub has_this: bool,
}

impl MethodBuilder {
    pub fn new(id: MethodId, arg_names: Vec<String>, has_this: bool) -> Self {
        MethodBuilder {
            id,
            code: Vec::new(),
            labels: FxHashMap::default(),
            sites: Vec::new(),
            raw_offsets: false,
            exceptions: Vec::new(),
            filter_ends: Vec::new(),
            locals: Vec::new(),
            scopes: vec![LocalScope::default()],
            open_scopes: vec![0],
            max_stack: 8,
            init_locals: false,
            il_fixups: Vec::new(),
            member_ref_fixups: Vec::new(),
            sequence_points: Vec::new(),
            last_position: None,
            arg_names,
            has_this,
        }
    }

    /// Current code offset
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn record_sequence_point(&mut self, line: u32, column: u32, file: Option<String>) {
        if self.last_position == Some((line, column)) {
            return;
        }
        self.last_position = Some((line, column));
        let offset = self.position();
        if let Some(last) = self.sequence_points.last_mut() {
            if last.offset == offset {
                last.line = line;
                last.column = column;
                last.file = file;
                return;
            }
        }
        self.sequence_points.push(SequencePoint {
            offset,
            line,
            column,
            file,
        });
    }

    /// Slot of the local `name`, innermost open scope first.
    pub fn local_slot(&self, name: &str) -> Option<u32> {
        self.open_scopes
            .iter()
            .rev()
            .find_map(|&scope| self.scopes.get(scope)?.names.get(name).copied())
    }

    /// Index of the argument `name`, counting `this` for instance methods.
    pub fn arg_index(&self, name: &str) -> Option<u32> {
        self.arg_names
            .iter()
            .position(|arg| arg == name)
            .map(|index| index as u32 + u32::from(self.has_this))
    }

    /// Moves every recorded position at or after `from` back by `count` bytes.
    pub fn shift_positions(&mut self, from: u32, count: u32) {
        let shift = |value: &mut u32| {
            if *value >= from {
                *value -= count;
            }
        };

        self.labels.values_mut().for_each(shift);
        for site in &mut self.sites {
            shift(&mut site.opcode_pos);
            shift(&mut site.operand_pos);
            shift(&mut site.relative_to);
        }
        self.filter_ends.iter_mut().for_each(shift);
        for fixup in &mut self.il_fixups {
            shift(&mut fixup.offset);
        }
        for fixup in &mut self.member_ref_fixups {
            shift(&mut fixup.offset);
        }
        for point in &mut self.sequence_points {
            shift(&mut point.offset);
        }
        for scope in &mut self.scopes {
            shift(&mut scope.start);
            if let Some(end) = scope.end.as_mut() {
                shift(end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_arguments() {
        let instance = MethodBuilder::new(0, vec!["a".to_string(), "b".to_string()], true);
        assert_eq!(instance.arg_index("a"), Some(1));
        assert_eq!(instance.arg_index("b"), Some(2));
        assert_eq!(instance.arg_index("c"), None);

        let static_method = MethodBuilder::new(0, vec!["a".to_string()], false);
        assert_eq!(static_method.arg_index("a"), Some(0));
    }

    #[test]
    fn sequence_points_collapse_on_same_offset() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        builder.record_sequence_point(1, 1, None);
        builder.record_sequence_point(2, 1, None);
        builder.code.push(0x00);
        builder.record_sequence_point(2, 1, None);
        builder.record_sequence_point(HIDDEN_LINE, 0, None);

        assert_eq!(builder.sequence_points.len(), 2);
        assert_eq!(builder.sequence_points[0].line, 2);
        assert!(builder.sequence_points[1].is_hidden());
        assert_eq!(builder.sequence_points[1].offset, 1);
    }

    #[test]
    fn shifting() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        builder.labels.insert("before".to_string(), 2);
        builder.labels.insert("after".to_string(), 10);
        builder.filter_ends.push(7);
        builder.shift_positions(7, 3);
        assert_eq!(builder.labels["before"], 2);
        assert_eq!(builder.labels["after"], 7);
        assert_eq!(builder.filter_ends, vec![4]);
    }
}
