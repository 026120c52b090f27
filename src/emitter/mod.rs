//! Collaborator interfaces of the assembler.
//!
//! The assembler never lays out metadata tables or PE sections itself. Every definition is
//! handed to a [`MetadataEmitter`], which assigns the final tokens, and every block of bytes
//! (method bodies, static data) is placed through a [`SectionAllocator`]. Both are traits so
//! that a real image writer can be plugged in; [`MemoryEmitter`] and [`MemorySections`] are
//! complete in-memory implementations used by tests, benchmarks and tools that only need the
//! resolved token space.
//!
//! # Key Components
//!
//! - [`MetadataEmitter`] - Defines types, members, references and manifest entries
//! - [`SectionAllocator`] - Allocates blocks in the IL, data and TLS sections and records relocations
//! - [`TypeDefinition`], [`MethodDefinition`], [`FieldDefinition`], ... - Definition records passed to the emitter

mod memory;

pub use memory::{MemberRefRecord, MemoryEmitter, MemorySections, Relocation};

use crate::{metadata::token::Token, Result};

/// A constant value attached to a field, parameter or property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    /// `ELEMENT_TYPE` of the value
    pub element_type: u8,
    /// Little-endian encoded value (UTF-16 for strings)
    pub value: Vec<u8>,
}

/// A type definition handed to [`MetadataEmitter::define_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    /// Simple name
    pub name: String,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// `TypeAttributes`
    pub flags: u32,
    /// Base type, [`Token::NIL`] for interfaces and `System.Object`
    pub extends: Token,
    /// Implemented interfaces
    pub interfaces: Vec<Token>,
    /// Enclosing type of a nested type
    pub encloser: Option<Token>,
}

/// A method definition handed to [`MetadataEmitter::define_method`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefinition {
    /// Owning type
    pub class: Token,
    /// Method name
    pub name: String,
    /// `MethodAttributes`
    pub flags: u32,
    /// `MethodImplAttributes`
    pub impl_flags: u32,
    /// Method signature blob
    pub signature: Vec<u8>,
}

/// A parameter definition handed to [`MetadataEmitter::define_param`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDefinition {
    /// Sequence number, 0 for the return value
    pub sequence: u16,
    /// Parameter name
    pub name: String,
    /// `ParamAttributes`
    pub flags: u32,
    /// Default value
    pub constant: Option<Constant>,
}

/// A field definition handed to [`MetadataEmitter::define_field`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    /// Owning type
    pub class: Token,
    /// Field name
    pub name: String,
    /// `FieldAttributes`
    pub flags: u32,
    /// Field signature blob
    pub signature: Vec<u8>,
    /// Literal value
    pub constant: Option<Constant>,
}

/// An event definition handed to [`MetadataEmitter::define_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDefinition {
    /// Owning type
    pub class: Token,
    /// Event name
    pub name: String,
    /// `EventAttributes`
    pub flags: u32,
    /// Delegate type of the event
    pub event_type: Token,
    /// `add` accessor
    pub add_on: Token,
    /// `remove` accessor
    pub remove_on: Token,
    /// `fire` accessor
    pub fire: Token,
    /// Other accessors
    pub others: Vec<Token>,
}

/// A property definition handed to [`MetadataEmitter::define_property`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDefinition {
    /// Owning type
    pub class: Token,
    /// Property name
    pub name: String,
    /// `PropertyAttributes`
    pub flags: u32,
    /// Property signature blob
    pub signature: Vec<u8>,
    /// Default value
    pub constant: Option<Constant>,
    /// `get` accessor
    pub getter: Token,
    /// `set` accessor
    pub setter: Token,
    /// Other accessors
    pub others: Vec<Token>,
}

/// A generic parameter handed to [`MetadataEmitter::define_generic_param`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericParamDefinition {
    /// Position in the owner's parameter list
    pub number: u16,
    /// `GenericParamAttributes`
    pub flags: u16,
    /// Parameter name
    pub name: String,
}

/// An assembly identity, used for the assembly itself and for assembly references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyDefinition {
    /// Simple name
    pub name: String,
    /// Major, minor, build and revision
    pub version: [u16; 4],
    /// Culture, empty for neutral
    pub locale: String,
    /// Full public key, or the 8 byte public key token of a reference
    pub public_key: Vec<u8>,
    /// `AssemblyHashAlgorithm`
    pub hash_algorithm: u32,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Hash of the referenced assembly (references only)
    pub hash: Vec<u8>,
}

/// A file table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDefinition {
    /// File name
    pub name: String,
    /// Content hash
    pub hash: Vec<u8>,
    /// `FileAttributes`
    pub flags: u32,
}

/// An exported (COM) type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTypeDefinition {
    /// Simple name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// File, assembly reference or enclosing exported type
    pub implementation: Token,
    /// `TypeDef` hint in the implementing module
    pub type_def_id: u32,
    /// `TypeAttributes`
    pub flags: u32,
}

/// A manifest resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefinition {
    /// Resource name
    pub name: String,
    /// [`Token::NIL`] for embedded resources, else a file or assembly reference
    pub implementation: Token,
    /// Offset into the resource blob (embedded) or file
    pub offset: u32,
    /// `ManifestResourceAttributes`
    pub flags: u32,
}

/// The metadata writer the assembler emits into.
///
/// Every `define_*` call returns the token assigned to the new row. Calls are made in
/// dependency order: a token passed as an argument was returned by an earlier call.
pub trait MetadataEmitter {
    /// Defines a top-level or nested type.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_type(&mut self, def: &TypeDefinition) -> Result<Token>;

    /// Defines a method.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_method(&mut self, def: &MethodDefinition) -> Result<Token>;

    /// Defines a parameter (or the return value) of `method`.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_param(&mut self, method: Token, def: &ParamDefinition) -> Result<Token>;

    /// Defines a field.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_field(&mut self, def: &FieldDefinition) -> Result<Token>;

    /// Defines an event together with its accessors.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_event(&mut self, def: &EventDefinition) -> Result<Token>;

    /// Defines a property together with its accessors.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_property(&mut self, def: &PropertyDefinition) -> Result<Token>;

    /// Defines a member reference.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_member_ref(&mut self, parent: Token, name: &str, signature: &[u8]) -> Result<Token>;

    /// Defines a type reference resolved through `scope`.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_type_ref_by_name(&mut self, scope: Token, name: &str) -> Result<Token>;

    /// Returns the `TypeSpec` token of an encoded type.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the signature.
    fn get_token_from_type_spec(&mut self, signature: &[u8]) -> Result<Token>;

    /// Defines a generic method instantiation.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_method_spec(&mut self, parent: Token, instantiation: &[u8]) -> Result<Token>;

    /// Defines a generic parameter of a type or method.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_generic_param(&mut self, owner: Token, def: &GenericParamDefinition)
        -> Result<Token>;

    /// Adds a constraint to a generic parameter.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_generic_param_constraint(&mut self, param: Token, constraint: Token)
        -> Result<Token>;

    /// Attaches a custom attribute to `owner`.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_custom_attribute(&mut self, owner: Token, ctor: Token, blob: &[u8])
        -> Result<Token>;

    /// Attaches a declarative security blob to `owner`.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_permission_set(&mut self, owner: Token, action: u16, blob: &[u8]) -> Result<Token>;

    /// Defines a module reference.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_module_ref(&mut self, name: &str) -> Result<Token>;

    /// Maps a method or field to an unmanaged import.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_pinvoke_map(
        &mut self,
        member: Token,
        flags: u32,
        import_name: &str,
        module_ref: Token,
    ) -> Result<()>;

    /// Interns a stand-alone signature (locals, `calli`).
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the signature.
    fn get_token_from_sig(&mut self, signature: &[u8]) -> Result<Token>;

    /// Adds a string to the user string heap.
    ///
    /// # Errors
    /// Returns an error if the heap is full.
    fn define_user_string(&mut self, value: &[u16]) -> Result<Token>;

    /// Sets packing, class size and explicit field offsets of a type.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the layout.
    fn set_class_layout(
        &mut self,
        class: Token,
        packing: u16,
        size: u32,
        field_offsets: &[(Token, u32)],
    ) -> Result<()>;

    /// Sets the marshalling descriptor of a field or parameter.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the descriptor.
    fn set_marshal(&mut self, owner: Token, native_type: &[u8]) -> Result<()>;

    /// Sets the RVA of a field with initial data.
    ///
    /// # Errors
    /// Returns an error if the field is unknown.
    fn set_field_rva(&mut self, field: Token, rva: u32) -> Result<()>;

    /// Sets the RVA of a method body.
    ///
    /// # Errors
    /// Returns an error if the method is unknown.
    fn set_method_rva(&mut self, method: Token, rva: u32) -> Result<()>;

    /// Records that `body` implements `declaration` in `class`.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_method_impl(&mut self, class: Token, body: Token, declaration: Token) -> Result<()>;

    /// Sets the name of the module.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the name.
    fn set_module_name(&mut self, name: &str) -> Result<()>;

    /// Defines the assembly identity of the module.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_assembly(&mut self, def: &AssemblyDefinition) -> Result<Token>;

    /// Defines a reference to another assembly.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_assembly_ref(&mut self, def: &AssemblyDefinition) -> Result<Token>;

    /// Defines a file of a multi-file assembly.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_file(&mut self, def: &FileDefinition) -> Result<Token>;

    /// Defines an exported type.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_exported_type(&mut self, def: &ExportedTypeDefinition) -> Result<Token>;

    /// Defines a manifest resource.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the definition.
    fn define_manifest_resource(&mut self, def: &ResourceDefinition) -> Result<Token>;
}

/// Sections the assembler places bytes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumIter)]
pub enum Section {
    /// Method bodies
    #[strum(serialize = ".text")]
    Il,
    /// Static data declared with `.data`
    #[strum(serialize = ".sdata")]
    Data,
    /// Thread local data declared with `.data tls`
    #[strum(serialize = ".tls")]
    Tls,
}

/// Kinds of relocations the assembler records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum RelocKind {
    /// Section-relative value to be rebased to an RVA
    Absolute,
    /// 32-bit virtual address
    HighLow,
    /// 64-bit virtual address
    Dir64,
    /// Metadata token that the writer may remap
    MapToken,
    /// File position
    FilePos,
}

/// The section writer the assembler places bodies and data into.
pub trait SectionAllocator {
    /// Allocates `size` bytes in `section` at the given alignment.
    ///
    /// Returns the section offset of the block and the zero-initialized block itself.
    ///
    /// # Errors
    /// Returns an error if the section cannot grow.
    fn allocate_block(
        &mut self,
        section: Section,
        size: usize,
        alignment: usize,
    ) -> Result<(u32, &mut [u8])>;

    /// Current length of `section`.
    fn section_len(&self, section: Section) -> u32;

    /// Overwrites already allocated bytes of `section`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range was never allocated.
    fn patch(&mut self, section: Section, offset: u32, bytes: &[u8]) -> Result<()>;

    /// Records a relocation at `offset` in `section` whose value refers to `target`.
    ///
    /// # Errors
    /// Returns an error if the relocation cannot be recorded.
    fn add_relocation(
        &mut self,
        section: Section,
        offset: u32,
        kind: RelocKind,
        target: Section,
    ) -> Result<()>;

    /// RVA of an offset in `section`.
    fn rva_of(&self, section: Section, offset: u32) -> u32;

    /// RVA of a method body placed at `offset` in the IL section.
    fn method_rva(&self, offset: u32) -> u32 {
        self.rva_of(Section::Il, offset)
    }
}
