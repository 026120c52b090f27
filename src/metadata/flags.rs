//! Attribute flag values of the metadata rows the assembler defines.
//!
//! The values follow ECMA-335 Partition II §23.1. They are plain `u32` constants
//! grouped per table so that the parser can pass raw attribute words straight through
//! and the assembler can test and correct individual bits.

#[allow(non_snake_case)]
/// All possible flags for `TypeAttributes`
pub mod TypeAttributes {
    /// Mask for extracting type visibility information
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    /// Type has no public scope
    pub const NOT_PUBLIC: u32 = 0x0000_0000;
    /// Type has public scope
    pub const PUBLIC: u32 = 0x0000_0001;
    /// Nested type with public visibility
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    /// Nested type with private visibility
    pub const NESTED_PRIVATE: u32 = 0x0000_0003;
    /// Nested type with family visibility
    pub const NESTED_FAMILY: u32 = 0x0000_0004;
    /// Nested type with assembly visibility
    pub const NESTED_ASSEMBLY: u32 = 0x0000_0005;
    /// Nested type with family and assembly visibility
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x0000_0006;
    /// Nested type with family or assembly visibility
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x0000_0007;
    /// Mask for extracting class layout information
    pub const LAYOUT_MASK: u32 = 0x0000_0018;
    /// Class fields are auto-laid out
    pub const AUTO_LAYOUT: u32 = 0x0000_0000;
    /// Class fields are laid out sequentially
    pub const SEQUENTIAL_LAYOUT: u32 = 0x0000_0008;
    /// Layout is supplied explicitly
    pub const EXPLICIT_LAYOUT: u32 = 0x0000_0010;
    /// Type is an interface
    pub const INTERFACE: u32 = 0x0000_0020;
    /// Class is abstract
    pub const ABSTRACT: u32 = 0x0000_0080;
    /// Class cannot be extended
    pub const SEALED: u32 = 0x0000_0100;
    /// Class name is special
    pub const SPECIAL_NAME: u32 = 0x0000_0400;
    /// Class is imported
    pub const IMPORT: u32 = 0x0000_1000;
    /// Class is serializable
    pub const SERIALIZABLE: u32 = 0x0000_2000;
    /// Initialize the class before the first static field access
    pub const BEFORE_FIELD_INIT: u32 = 0x0010_0000;
    /// CLI provides 'special' behavior, depending upon the name of the type
    pub const RTSPECIAL_NAME: u32 = 0x0000_0800;
    /// Type has security associated with it
    pub const HAS_SECURITY: u32 = 0x0004_0000;
    /// Parser hint: the class was declared with the `enum` keyword
    pub const ENUM_HINT: u32 = 0x4000_0000;
    /// Parser hint: the class was declared with the `value` keyword
    pub const VALUE_HINT: u32 = 0x8000_0000;
    /// Mask removing the parser hints
    pub const HINT_MASK: u32 = 0x3FFF_FFFF;
}

#[allow(non_snake_case)]
/// All possible flags for `MethodAttributes`
pub mod MethodAttributes {
    /// Mask for the member access bits
    pub const MEMBER_ACCESS_MASK: u32 = 0x0007;
    /// Member not referenceable
    pub const PRIVATE_SCOPE: u32 = 0x0000;
    /// Accessible only by the parent type
    pub const PRIVATE: u32 = 0x0001;
    /// Accessibly by anyone who has visibility to this scope
    pub const PUBLIC: u32 = 0x0006;
    /// Defined on type, else per instance
    pub const STATIC: u32 = 0x0010;
    /// Method cannot be overridden
    pub const FINAL: u32 = 0x0020;
    /// Method is virtual
    pub const VIRTUAL: u32 = 0x0040;
    /// Method hides by name+sig, else just by name
    pub const HIDE_BY_SIG: u32 = 0x0080;
    /// Method always gets a new slot in the vtable
    pub const NEW_SLOT: u32 = 0x0100;
    /// Method does not provide an implementation
    pub const ABSTRACT: u32 = 0x0400;
    /// Method is special
    pub const SPECIAL_NAME: u32 = 0x0800;
    /// CLI provides 'special' behavior, depending upon the name of the method
    pub const RTSPECIAL_NAME: u32 = 0x1000;
    /// Implementation is forwarded through PInvoke
    pub const PINVOKE_IMPL: u32 = 0x2000;
    /// Method has security associated with it
    pub const HAS_SECURITY: u32 = 0x4000;
}

#[allow(non_snake_case)]
/// All possible flags for `MethodImplAttributes`
pub mod MethodImplAttributes {
    /// Mask for the code type
    pub const CODE_TYPE_MASK: u32 = 0x0003;
    /// Method impl is IL
    pub const IL: u32 = 0x0000;
    /// Method impl is native
    pub const NATIVE: u32 = 0x0001;
    /// Method impl is OPTIL
    pub const OPTIL: u32 = 0x0002;
    /// Method impl is provided by the runtime
    pub const RUNTIME: u32 = 0x0003;
    /// Method impl is unmanaged
    pub const UNMANAGED: u32 = 0x0004;
    /// Method cannot be inlined
    pub const NO_INLINING: u32 = 0x0008;
    /// Method is a synchronized method
    pub const SYNCHRONIZED: u32 = 0x0020;
    /// Method signature is exported as declared
    pub const PRESERVE_SIG: u32 = 0x0080;
    /// Method is implemented inside the runtime
    pub const INTERNAL_CALL: u32 = 0x1000;
}

#[allow(non_snake_case)]
/// All possible flags for `FieldAttributes`
pub mod FieldAttributes {
    /// These 3 bits contain the access level
    pub const FIELD_ACCESS_MASK: u32 = 0x0007;
    /// Member not referenceable
    pub const PRIVATE_SCOPE: u32 = 0x0000;
    /// Accessible only by the parent type
    pub const PRIVATE: u32 = 0x0001;
    /// Accessibly by anyone who has visibility to this scope
    pub const PUBLIC: u32 = 0x0006;
    /// Defined on type, else per instance
    pub const STATIC: u32 = 0x0010;
    /// Field can only be initialized, not written to after init
    pub const INIT_ONLY: u32 = 0x0020;
    /// Value is compile time constant
    pub const LITERAL: u32 = 0x0040;
    /// Field has RVA
    pub const HAS_FIELD_RVA: u32 = 0x0100;
    /// Field is special
    pub const SPECIAL_NAME: u32 = 0x0200;
    /// Field has marshalling information
    pub const HAS_FIELD_MARSHAL: u32 = 0x1000;
    /// Implementation is forwarded through `PInvoke`
    pub const PINVOKE_IMPL: u32 = 0x2000;
    /// Field has default
    pub const HAS_DEFAULT: u32 = 0x8000;
}

#[allow(non_snake_case)]
/// All possible flags for `ParamAttributes`
pub mod ParamAttributes {
    /// Param is `[In]`
    pub const IN: u32 = 0x0001;
    /// Param is `[out]`
    pub const OUT: u32 = 0x0002;
    /// Param is optional
    pub const OPTIONAL: u32 = 0x0010;
    /// Param has default value
    pub const HAS_DEFAULT: u32 = 0x1000;
    /// Param has `FieldMarshal`
    pub const HAS_FIELD_MARSHAL: u32 = 0x2000;
}

#[allow(non_snake_case)]
/// All possible flags for `PropertyAttributes`
pub mod PropertyAttributes {
    /// Property is special
    pub const SPECIAL_NAME: u32 = 0x0200;
    /// Runtime (metadata internal APIs) should check name encoding
    pub const RTSPECIAL_NAME: u32 = 0x0400;
    /// Property has default
    pub const HAS_DEFAULT: u32 = 0x1000;
}

#[allow(non_snake_case)]
/// All possible flags for `PInvokeAttributes`
pub mod PInvokeAttributes {
    /// `PInvoke` is to use the member name as specified
    pub const NO_MANGLE: u32 = 0x0001;
    /// Character set mask
    pub const CHAR_SET_MASK: u32 = 0x0006;
    /// Ansi character set
    pub const CHAR_SET_ANSI: u32 = 0x0002;
    /// Unicode character set
    pub const CHAR_SET_UNICODE: u32 = 0x0004;
    /// Information about target function. Not relevant for fields
    pub const SUPPORTS_LAST_ERROR: u32 = 0x0040;
    /// Calling convention `winapi`
    pub const CALL_CONV_WINAPI: u32 = 0x0100;
    /// Calling convention `cdecl`
    pub const CALL_CONV_CDECL: u32 = 0x0200;
}

#[allow(non_snake_case)]
/// All possible flags for `AssemblyFlags`
pub mod AssemblyFlags {
    /// The assembly reference holds the full (unhashed) public key
    pub const PUBLIC_KEY: u32 = 0x0001;
    /// The implementation of this assembly used at runtime is not expected to match the version seen at compile time
    pub const RETARGETABLE: u32 = 0x0100;
    /// Reserved
    pub const DISABLE_JIT_COMPILE_OPTIMIZER: u32 = 0x4000;
    /// Reserved
    pub const ENABLE_JIT_COMPILE_TRACKING: u32 = 0x8000;
}

#[allow(non_snake_case)]
/// All possible values for `AssemblyHashAlgorithm`
pub mod AssemblyHashAlgorithm {
    /// No hash algorithm specified
    pub const NONE: u32 = 0x0000;
    /// MD5 hash algorithm
    pub const MD5: u32 = 0x8003;
    /// SHA1 hash algorithm
    pub const SHA1: u32 = 0x8004;
}

#[allow(non_snake_case)]
/// All possible flags for `FileAttributes`
pub mod FileAttributes {
    /// This is not a resource file
    pub const CONTAINS_META_DATA: u32 = 0x0000;
    /// This is a resource file or other non-metadata-containing file
    pub const CONTAINS_NO_META_DATA: u32 = 0x0001;
}

#[allow(non_snake_case)]
/// All possible flags for `ManifestResourceAttributes`
pub mod ManifestResourceAttributes {
    /// The Resource is exported from the Assembly
    pub const PUBLIC: u32 = 0x0001;
    /// The Resource is private to the Assembly
    pub const PRIVATE: u32 = 0x0002;
}

#[allow(non_snake_case)]
/// Security actions of a `DeclSecurity` row
pub mod SecurityAction {
    /// Demand permission of all callers
    pub const DEMAND: u16 = 0x0002;
    /// Assert the permission
    pub const ASSERT: u16 = 0x0003;
    /// Deny the permission
    pub const DENY: u16 = 0x0004;
    /// Demand permission of the immediate caller
    pub const LINK_DEMAND: u16 = 0x0006;
    /// Demand permission of inheritors
    pub const INHERITANCE_DEMAND: u16 = 0x0007;
    /// Minimum permissions requested by the assembly
    pub const REQUEST_MINIMUM: u16 = 0x0008;
}

#[allow(non_snake_case, missing_docs)]
/// First byte of a signature blob
pub mod SIGNATURE_HEADER {
    pub const DEFAULT: u8 = 0x00;
    pub const C: u8 = 0x01;
    pub const STDCALL: u8 = 0x02;
    pub const THISCALL: u8 = 0x03;
    pub const FASTCALL: u8 = 0x04;
    pub const VARARG: u8 = 0x05;
    pub const FIELD: u8 = 0x06;
    pub const LOCAL_SIG: u8 = 0x07;
    pub const PROPERTY: u8 = 0x08;
    pub const GENERIC_INST: u8 = 0x0A;
    /// Mask for the calling convention kind in the lower nibble
    pub const KIND_MASK: u8 = 0x0F;
    pub const GENERIC: u8 = 0x10;
    pub const HAS_THIS: u8 = 0x20;
    pub const EXPLICIT_THIS: u8 = 0x40;
}
