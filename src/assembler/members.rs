//! Member descriptors owned by classes and the parser callbacks declaring them.
//!
//! Fields, events and properties live inside their owning [`crate::assembler::Class`];
//! custom attributes, security declarations and generic parameters inside whatever they
//! are attached to. Nothing here talks to the metadata emitter: every descriptor carries
//! an `is_new` flag (or a null token) until the emission driver hands it over.

use crate::{
    assembler::{class::ClassId, method::MethodId, Assembler},
    diagnostics::DiagnosticCategory,
    emitter::{Constant, MetadataEmitter, SectionAllocator},
    metadata::{
        flags::{FieldAttributes, TypeAttributes},
        signatures::{is_void_field, write_compressed_uint, SignatureBuilder},
        token::{Token, TokenRef},
    },
    Error, Result,
};

/// Suffix the disassembler appends to privatescope member names.
pub const PRIVATESCOPE_SUFFIX: &str = "$PST04";

/// Strips the `$PST04xxxxxxxx` disambiguation suffix of a privatescope member.
#[must_use]
pub fn strip_privatescope_suffix(name: &str) -> &str {
    match name.find(PRIVATESCOPE_SUFFIX) {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// A `.field` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    /// Field name
    pub name: String,
    /// Field signature (`FIELD` followed by the type)
    pub signature: Vec<u8>,
    /// `FieldAttributes`
    pub flags: u32,
    /// Explicit offset (`[n]`)
    pub offset: Option<u32>,
    /// Literal value (`= ...`)
    pub constant: Option<Constant>,
    /// Marshalling descriptor
    pub marshal: Option<Vec<u8>>,
    /// Data label of the initial value (`at label`)
    pub rva_label: Option<String>,
}

impl FieldDecl {
    /// A field without offset, constant, marshalling or data.
    #[must_use]
    pub fn new(name: impl Into<String>, signature: Vec<u8>, flags: u32) -> Self {
        FieldDecl {
            name: name.into(),
            signature,
            flags,
            offset: None,
            constant: None,
            marshal: None,
            rva_label: None,
        }
    }

    /// Sets the explicit offset
    #[must_use]
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the literal value
    #[must_use]
    pub fn with_constant(mut self, constant: Constant) -> Self {
        self.constant = Some(constant);
        self
    }

    /// Sets the marshalling descriptor
    #[must_use]
    pub fn with_marshal(mut self, native_type: Vec<u8>) -> Self {
        self.marshal = Some(native_type);
        self
    }

    /// Places the initial value at a data label
    #[must_use]
    pub fn at(mut self, label: impl Into<String>) -> Self {
        self.rva_label = Some(label.into());
        self
    }
}

/// A declared field.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name, privatescope suffix removed
    pub name: String,
    /// Field signature
    pub signature: Vec<u8>,
    /// `FieldAttributes`
    pub flags: u32,
    /// Explicit offset
    pub offset: Option<u32>,
    /// Literal value
    pub constant: Option<Constant>,
    /// Marshalling descriptor
    pub marshal: Option<Vec<u8>>,
    /// Data label of the initial value
    pub rva_label: Option<String>,
    /// Unmanaged import
    pub pinvoke: Option<PInvokeDecl>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
}

impl From<FieldDecl> for Field {
    fn from(decl: FieldDecl) -> Self {
        Field {
            name: decl.name,
            signature: decl.signature,
            flags: decl.flags,
            offset: decl.offset,
            constant: decl.constant,
            marshal: decl.marshal,
            rva_label: decl.rva_label,
            pinvoke: None,
            custom_attributes: Vec::new(),
            token: Token::NIL,
            is_new: true,
        }
    }
}

/// Accessor kinds of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMethod {
    /// `.addon`
    AddOn,
    /// `.removeon`
    RemoveOn,
    /// `.fire`
    Fire,
    /// `.other`
    Other,
}

/// A declared event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name
    pub name: String,
    /// `EventAttributes`
    pub flags: u32,
    /// Delegate type
    pub event_type: Token,
    /// `add` accessor
    pub add_on: Option<TokenRef>,
    /// `remove` accessor
    pub remove_on: Option<TokenRef>,
    /// `fire` accessor
    pub fire: Option<TokenRef>,
    /// Other accessors
    pub others: Vec<TokenRef>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
}

/// Accessor kinds of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyMethod {
    /// `.get`
    Getter,
    /// `.set`
    Setter,
    /// `.other`
    Other,
}

/// A declared property.
#[derive(Debug, Clone)]
pub struct Property {
    /// Property name
    pub name: String,
    /// `PropertyAttributes`
    pub flags: u32,
    /// Property signature
    pub signature: Vec<u8>,
    /// Default value
    pub constant: Option<Constant>,
    /// `get` accessor
    pub getter: Option<TokenRef>,
    /// `set` accessor
    pub setter: Option<TokenRef>,
    /// Other accessors
    pub others: Vec<TokenRef>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
}

/// A generic parameter as declared in a class or method header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericParamDecl {
    /// Parameter name
    pub name: String,
    /// `GenericParamAttributes` (variance and special constraints)
    pub flags: u16,
    /// Type constraints
    pub constraints: Vec<Token>,
}

impl GenericParamDecl {
    /// An unconstrained parameter.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        GenericParamDecl {
            name: name.into(),
            flags: 0,
            constraints: Vec::new(),
        }
    }

    /// Sets the attribute flags
    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Adds a type constraint
    #[must_use]
    pub fn constraint(mut self, constraint: Token) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// A generic parameter of a class or method.
#[derive(Debug, Clone)]
pub struct GenericParam {
    /// Parameter name
    pub name: String,
    /// `GenericParamAttributes`
    pub flags: u16,
    /// Type constraints
    pub constraints: Vec<Token>,
    /// Custom attributes of the parameter
    pub custom_attributes: Vec<CustomAttribute>,
    /// Custom attributes of individual constraints, by constraint index
    pub constraint_attributes: Vec<(usize, CustomAttribute)>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl From<GenericParamDecl> for GenericParam {
    fn from(decl: GenericParamDecl) -> Self {
        GenericParam {
            name: decl.name,
            flags: decl.flags,
            constraints: decl.constraints,
            custom_attributes: Vec::new(),
            constraint_attributes: Vec::new(),
            token: Token::NIL,
        }
    }
}

/// A custom attribute: constructor and value blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAttribute {
    /// Attribute constructor
    pub ctor: TokenRef,
    /// Serialized arguments (prolog `0x0001` included)
    pub blob: Vec<u8>,
}

/// One permission of a `.permission` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionAttribute {
    /// Assembly qualified name of the permission attribute type
    pub type_name: String,
    /// Serialized named arguments
    pub properties: Vec<u8>,
    /// Number of named arguments in `properties`
    pub property_count: u32,
}

/// Declarative security of a class, method or assembly for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDecl {
    /// `SecurityAction`
    pub action: u16,
    /// Permissions declared one by one
    pub permissions: Vec<PermissionAttribute>,
    /// A `.permissionset` blob, used as is
    pub raw: Option<Vec<u8>>,
}

impl SecurityDecl {
    /// The permission set blob.
    ///
    /// Individual permissions are serialized in the attribute format: `.`, the compressed
    /// permission count, then per permission its type name, the compressed size of the
    /// argument block, the compressed argument count and the arguments.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        let mut builder = SignatureBuilder::new();
        builder.u8(b'.').compressed(self.permissions.len() as u32);
        for permission in &self.permissions {
            let mut arguments = Vec::with_capacity(permission.properties.len() + 1);
            write_compressed_uint(permission.property_count, &mut arguments);
            arguments.extend_from_slice(&permission.properties);

            builder
                .serialized_string(&permission.type_name)
                .compressed(arguments.len() as u32)
                .bytes(&arguments);
        }
        builder.into_bytes()
    }
}

/// An `.override`: `body` implements `declaration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodImpl {
    /// Implementing method
    pub body: TokenRef,
    /// Implemented declaration
    pub declaration: TokenRef,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
}

/// A `pinvokeimpl` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvokeDecl {
    /// Library name
    pub dll: String,
    /// Entry point name, defaults to the member name
    pub alias: Option<String>,
    /// `PInvokeAttributes`
    pub flags: u32,
}

impl PInvokeDecl {
    /// An import from `dll` under the member's own name.
    #[must_use]
    pub fn new(dll: impl Into<String>, flags: u32) -> Self {
        PInvokeDecl {
            dll: dll.into(),
            alias: None,
            flags,
        }
    }

    /// Imports under a different entry point name
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Owner of a generic parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericOwner {
    /// Type parameter of a class
    Class(ClassId),
    /// Type parameter of a method
    Method(MethodId),
}

/// Where the next `.custom` directive is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeTarget {
    /// No valid owner
    None,
    /// The module
    Module,
    /// A class
    Class(ClassId),
    /// A method
    Method(MethodId),
    /// Parameter of a method, 0 for the return value
    Param(MethodId, u16),
    /// A field of a class
    Field(ClassId, usize),
    /// An event of a class
    Event(ClassId, usize),
    /// A property of a class
    Property(ClassId, usize),
    /// A generic parameter
    GenericParam(GenericOwner, usize),
    /// A constraint of a generic parameter
    Constraint(GenericOwner, usize, usize),
    /// The assembly
    Assembly,
    /// An assembly reference
    AssemblyRef(usize),
    /// A file
    File(usize),
    /// An exported type
    ComType(usize),
    /// A manifest resource
    Resource(usize),
}

/// A custom attribute whose owner or constructor is only known after resolution.
#[derive(Debug, Clone)]
pub(crate) struct QueuedAttribute {
    pub owner: TokenRef,
    pub attribute: CustomAttribute,
    pub line: u32,
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Declares a field in the current class, or a global field outside of any class.
    ///
    /// Global fields are attached to `<Module>` and must be static; a non-static global
    /// field is made static with a warning (an error when strict).
    ///
    /// # Errors
    /// Returns an error for fields inside methods, `void` fields, duplicates and
    /// policy violations.
    pub fn add_field(&mut self, decl: FieldDecl) -> Result<()> {
        if self.current.is_some() {
            return self.report(Error::InvalidScope(format!(
                "Field '{}' declared inside a method",
                decl.name
            )));
        }
        self.check_name_length(&decl.name)?;

        let mut field = Field::from(decl);
        if field.flags & FieldAttributes::FIELD_ACCESS_MASK == FieldAttributes::PRIVATE_SCOPE {
            field.name = strip_privatescope_suffix(&field.name).to_string();
        }

        if is_void_field(&field.signature)? {
            return self.report(Error::Policy(format!("Field '{}' has type void", field.name)));
        }

        let class_id = self.current_class();
        if class_id == super::MODULE_CLASS {
            if field.flags & FieldAttributes::STATIC == 0 {
                self.policy(format!("Non-static global field '{}', made static", field.name))?;
                field.flags |= FieldAttributes::STATIC;
            }
            if field.offset.take().is_some() {
                self.warn(
                    DiagnosticCategory::Policy,
                    format!("Offset of global field '{}' ignored", field.name),
                );
            }
        }

        if field.rva_label.is_some() && field.flags & FieldAttributes::STATIC == 0 {
            return self.report(Error::Policy(format!(
                "Non-static field '{}' cannot be placed at a data label",
                field.name
            )));
        }

        let class = self.class_mut(class_id)?;
        let is_interface = class.flags & TypeAttributes::INTERFACE != 0;
        let duplicate = field.flags & FieldAttributes::FIELD_ACCESS_MASK
            != FieldAttributes::PRIVATE_SCOPE
            && class
                .fields
                .iter()
                .any(|f| f.name == field.name && f.signature == field.signature);
        let class_name = class.full_name.clone();

        if duplicate {
            return self.report(Error::Duplicate {
                kind: "field",
                name: format!("{}::{}", class_name, field.name),
            });
        }

        if is_interface && field.flags & FieldAttributes::STATIC == 0 {
            if field.flags & FieldAttributes::FIELD_ACCESS_MASK == FieldAttributes::PUBLIC {
                self.warn(
                    DiagnosticCategory::Policy,
                    format!("Instance field '{}' in interface '{}' is not CLS compliant", field.name, class_name),
                );
            } else {
                self.report(Error::Policy(format!(
                    "Non-public instance field '{}' in interface '{}'",
                    field.name, class_name
                )))?;
            }
        }

        if field.constant.is_some() {
            field.flags |= FieldAttributes::HAS_DEFAULT;
        }
        if field.marshal.is_some() {
            field.flags |= FieldAttributes::HAS_FIELD_MARSHAL;
        }
        if field.rva_label.is_some() {
            field.flags |= FieldAttributes::HAS_FIELD_RVA;
        }

        let class = self.class_mut(class_id)?;
        class.fields.push(field);
        let index = class.fields.len() - 1;
        self.target = AttributeTarget::Field(class_id, index);
        Ok(())
    }

    /// Opens an `.event` block in the current class.
    ///
    /// # Errors
    /// Returns an error outside of a class, inside a method or inside another block.
    pub fn start_event(&mut self, name: impl Into<String>, flags: u32, event_type: Token) -> Result<()> {
        let name = name.into();
        let class_id = self.member_block_owner("event", &name)?;
        self.check_name_length(&name)?;

        let class = self.class_mut(class_id)?;
        class.events.push(Event {
            name,
            flags,
            event_type,
            add_on: None,
            remove_on: None,
            fire: None,
            others: Vec::new(),
            custom_attributes: Vec::new(),
            token: Token::NIL,
            is_new: true,
        });
        let index = class.events.len() - 1;
        self.current_event = Some((class_id, index));
        self.target = AttributeTarget::Event(class_id, index);
        Ok(())
    }

    /// Sets an accessor of the open event.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of an `.event` block.
    pub fn set_event_method(&mut self, kind: EventMethod, method: TokenRef) -> Result<()> {
        let Some((class_id, index)) = self.current_event else {
            return self.report(Error::InvalidScope("Event accessor outside of an event".to_string()));
        };
        let event = self
            .class_mut(class_id)?
            .events
            .get_mut(index)
            .ok_or(Error::OutOfBounds)?;
        match kind {
            EventMethod::AddOn => event.add_on = Some(method),
            EventMethod::RemoveOn => event.remove_on = Some(method),
            EventMethod::Fire => event.fire = Some(method),
            EventMethod::Other => event.others.push(method),
        }
        Ok(())
    }

    /// Closes the open `.event` block.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] without a matching [`Assembler::start_event`].
    pub fn end_event(&mut self) -> Result<()> {
        if self.current_event.take().is_none() {
            return self.report(Error::InvalidScope("End of event without start".to_string()));
        }
        self.target = AttributeTarget::Class(self.current_class());
        Ok(())
    }

    /// Opens a `.property` block in the current class.
    ///
    /// # Errors
    /// Returns an error outside of a class, inside a method or inside another block.
    pub fn start_property(
        &mut self,
        name: impl Into<String>,
        flags: u32,
        signature: Vec<u8>,
        constant: Option<Constant>,
    ) -> Result<()> {
        let name = name.into();
        let class_id = self.member_block_owner("property", &name)?;
        self.check_name_length(&name)?;

        let flags = if constant.is_some() {
            flags | crate::metadata::flags::PropertyAttributes::HAS_DEFAULT
        } else {
            flags
        };

        let class = self.class_mut(class_id)?;
        class.properties.push(Property {
            name,
            flags,
            signature,
            constant,
            getter: None,
            setter: None,
            others: Vec::new(),
            custom_attributes: Vec::new(),
            token: Token::NIL,
            is_new: true,
        });
        let index = class.properties.len() - 1;
        self.current_property = Some((class_id, index));
        self.target = AttributeTarget::Property(class_id, index);
        Ok(())
    }

    /// Sets an accessor of the open property.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a `.property` block.
    pub fn set_property_method(&mut self, kind: PropertyMethod, method: TokenRef) -> Result<()> {
        let Some((class_id, index)) = self.current_property else {
            return self.report(Error::InvalidScope(
                "Property accessor outside of a property".to_string(),
            ));
        };
        let property = self
            .class_mut(class_id)?
            .properties
            .get_mut(index)
            .ok_or(Error::OutOfBounds)?;
        match kind {
            PropertyMethod::Getter => property.getter = Some(method),
            PropertyMethod::Setter => property.setter = Some(method),
            PropertyMethod::Other => property.others.push(method),
        }
        Ok(())
    }

    /// Closes the open `.property` block.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] without a matching [`Assembler::start_property`].
    pub fn end_property(&mut self) -> Result<()> {
        if self.current_property.take().is_none() {
            return self.report(Error::InvalidScope("End of property without start".to_string()));
        }
        self.target = AttributeTarget::Class(self.current_class());
        Ok(())
    }

    fn member_block_owner(&mut self, kind: &str, name: &str) -> Result<ClassId> {
        if self.current.is_some() || self.class_stack.is_empty() {
            self.report(Error::InvalidScope(format!(
                "The {kind} '{name}' must be declared inside a class and outside of methods"
            )))?;
        }
        if self.current_event.is_some() || self.current_property.is_some() {
            self.report(Error::InvalidScope(format!(
                "The {kind} '{name}' is declared inside an event or property"
            )))?;
        }
        Ok(self.current_class())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privatescope_suffix() {
        assert_eq!(strip_privatescope_suffix("value$PST04000001"), "value");
        assert_eq!(strip_privatescope_suffix("value"), "value");
        assert_eq!(strip_privatescope_suffix("$PST04"), "$PST04");
    }

    #[test]
    fn permission_set_encoding() {
        let decl = SecurityDecl {
            action: 2,
            permissions: vec![PermissionAttribute {
                type_name: "P".to_string(),
                properties: vec![0x54, 0x02],
                property_count: 1,
            }],
            raw: None,
        };
        assert_eq!(
            decl.encode(),
            vec![b'.', 0x01, 0x01, b'P', 0x03, 0x01, 0x54, 0x02]
        );

        let raw = SecurityDecl {
            action: 2,
            permissions: Vec::new(),
            raw: Some(vec![1, 2, 3]),
        };
        assert_eq!(raw.encode(), vec![1, 2, 3]);
    }

    #[test]
    fn field_decl_builder() {
        let decl = FieldDecl::new("x", vec![0x06, 0x08], FieldAttributes::STATIC)
            .with_offset(4)
            .at("D_0");
        assert_eq!(decl.offset, Some(4));
        assert_eq!(decl.rva_label.as_deref(), Some("D_0"));
    }
}
