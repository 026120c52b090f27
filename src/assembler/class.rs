//! Class descriptors and the class table.
//!
//! Classes are created the first time they are named, either by a reference or by their
//! declaration, and live in one arena for the whole compilation unit. A class that has only
//! been referenced is an [`ClassSlot::Unresolved`] placeholder; its declaration promotes it to
//! [`ClassSlot::Defined`]. Both states carry the same provisional token, `TypeDef | (index + 1)`,
//! which is what signatures built before the declaration embed, and which the metadata emitter
//! must confirm when the class is defined.
//!
//! Nested classes are named `Outer/Inner`; looking up a nested name creates the whole chain of
//! enclosing placeholders.

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        members::{CustomAttribute, Event, Field, GenericParam, GenericParamDecl, MethodImpl, Property, SecurityDecl},
        method::MethodId,
    },
    metadata::{
        flags::TypeAttributes,
        token::{TableId, Token},
    },
};

/// Index of a class in the [`ClassTable`]
pub type ClassId = usize;

/// The implicit class owning global fields and methods
pub const MODULE_CLASS: ClassId = 0;

/// Name of the implicit global class
pub const MODULE_CLASS_NAME: &str = "<Module>";

/// Longest accepted fully qualified class or member name
pub const MAX_NAME_LENGTH: usize = 1023;

/// Nesting separator in fully qualified class names
pub const NESTING_SEPARATOR: char = '/';

/// A class declaration as delivered by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassHeader {
    /// Name relative to the current namespace (top level) or enclosing class (nested)
    pub name: String,
    /// `TypeAttributes`, optionally with the `VALUE_HINT`/`ENUM_HINT` bits
    pub flags: u32,
    /// Generic parameters
    pub generic_params: Vec<GenericParamDecl>,
    /// Base type
    pub extends: Option<Token>,
    /// Implemented interfaces
    pub implements: Vec<Token>,
}

impl ClassHeader {
    /// Creates a header without base type, interfaces or generic parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, flags: u32) -> Self {
        ClassHeader {
            name: name.into(),
            flags,
            ..ClassHeader::default()
        }
    }

    /// Sets the base type.
    #[must_use]
    pub fn extends(mut self, base: Token) -> Self {
        self.extends = Some(base);
        self
    }

    /// Adds an implemented interface.
    #[must_use]
    pub fn implements(mut self, interface: Token) -> Self {
        self.implements.push(interface);
        self
    }

    /// Adds a generic parameter.
    #[must_use]
    pub fn generic_param(mut self, param: GenericParamDecl) -> Self {
        self.generic_params.push(param);
        self
    }
}

/// A defined class.
#[derive(Debug, Clone)]
pub struct Class {
    /// Fully qualified name, nested classes separated by `/`
    pub full_name: String,
    /// Simple name
    pub name: String,
    /// Namespace, empty for nested classes
    pub namespace: String,
    /// Provisional and final `TypeDef` token
    pub token: Token,
    /// `TypeAttributes` without hint bits
    pub flags: u32,
    /// Enclosing class
    pub encloser: Option<ClassId>,
    /// Base type
    pub extends: Option<Token>,
    /// Implemented interfaces
    pub implements: Vec<Token>,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Methods, in declaration order
    pub methods: Vec<MethodId>,
    /// Fields, in declaration order
    pub fields: Vec<Field>,
    /// Events
    pub events: Vec<Event>,
    /// Properties
    pub properties: Vec<Property>,
    /// `.override` declarations
    pub method_impls: Vec<MethodImpl>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Declarative security
    pub security: Vec<SecurityDecl>,
    /// `.pack`
    pub packing: Option<u32>,
    /// `.size`
    pub size: Option<u32>,
    /// Derives from `System.ValueType` or `System.Enum`
    pub is_value_type: bool,
    /// Derives from `System.Enum`
    pub is_enum: bool,
    /// Not yet handed to the metadata emitter
    pub is_new: bool,
    /// Source line of the declaration
    pub line: u32,
}

impl Class {
    /// Creates a class with the given identity and no members.
    #[must_use]
    pub fn new(full_name: &str, token: Token, flags: u32, encloser: Option<ClassId>) -> Self {
        let (namespace, name) = split_class_name(full_name);
        Class {
            full_name: full_name.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            token,
            flags,
            encloser,
            extends: None,
            implements: Vec::new(),
            generic_params: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            events: Vec::new(),
            properties: Vec::new(),
            method_impls: Vec::new(),
            custom_attributes: Vec::new(),
            security: Vec::new(),
            packing: None,
            size: None,
            is_value_type: false,
            is_enum: false,
            is_new: true,
            line: 0,
        }
    }

    /// Returns true for interfaces
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags & TypeAttributes::INTERFACE != 0
    }

    /// Returns true for abstract classes (interfaces included)
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags & TypeAttributes::ABSTRACT != 0
    }

    /// Returns true if the class uses automatic field layout
    #[must_use]
    pub fn is_auto_layout(&self) -> bool {
        self.flags & TypeAttributes::LAYOUT_MASK == TypeAttributes::AUTO_LAYOUT
    }

    /// Index of the generic parameter `name`
    #[must_use]
    pub fn generic_param_index(&self, name: &str) -> Option<usize> {
        self.generic_params.iter().position(|p| p.name == name)
    }
}

/// Splits a fully qualified name into namespace and simple name.
///
/// Nested classes have no namespace of their own: `NS.Outer/Inner` yields `("", "Inner")`.
#[must_use]
pub fn split_class_name(full_name: &str) -> (&str, &str) {
    if let Some(pos) = full_name.rfind(NESTING_SEPARATOR) {
        return ("", &full_name[pos + 1..]);
    }
    match full_name.rfind('.') {
        Some(pos) if pos > 0 => (&full_name[..pos], &full_name[pos + 1..]),
        _ => ("", full_name),
    }
}

/// A class slot: referenced only, or declared.
#[derive(Debug, Clone)]
pub enum ClassSlot {
    /// Named by a reference, no declaration seen yet
    Unresolved {
        /// Fully qualified name
        name: String,
        /// Provisional token
        token: Token,
        /// Enclosing class derived from the name
        encloser: Option<ClassId>,
    },
    /// Declared
    Defined(Box<Class>),
}

impl ClassSlot {
    /// Fully qualified name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            ClassSlot::Unresolved { name, .. } => name,
            ClassSlot::Defined(class) => &class.full_name,
        }
    }

    /// Provisional token
    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            ClassSlot::Unresolved { token, .. } => *token,
            ClassSlot::Defined(class) => class.token,
        }
    }

    /// Enclosing class
    #[must_use]
    pub fn encloser(&self) -> Option<ClassId> {
        match self {
            ClassSlot::Unresolved { encloser, .. } => *encloser,
            ClassSlot::Defined(class) => class.encloser,
        }
    }
}

/// All classes of a compilation unit, indexed by [`ClassId`] and by full name.
#[derive(Debug, Clone)]
pub struct ClassTable {
    slots: Vec<ClassSlot>,
    by_name: FxHashMap<String, ClassId>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    /// Creates a table holding only the implicit `<Module>` class.
    #[must_use]
    pub fn new() -> Self {
        let mut table = ClassTable {
            slots: Vec::new(),
            by_name: FxHashMap::default(),
        };
        let module = Class::new(MODULE_CLASS_NAME, Self::token_for(MODULE_CLASS), 0, None);
        table.slots.push(ClassSlot::Defined(Box::new(module)));
        table
            .by_name
            .insert(MODULE_CLASS_NAME.to_string(), MODULE_CLASS);
        table
    }

    /// Provisional token of the class at `id`
    #[must_use]
    pub fn token_for(id: ClassId) -> Token {
        Token::from_parts(TableId::TypeDef, id as u32 + 1)
    }

    /// Number of slots, `<Module>` included
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if only `<Module>` exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }

    /// Looks a class up by its fully qualified name.
    #[must_use]
    pub fn find(&self, full_name: &str) -> Option<ClassId> {
        self.by_name.get(full_name).copied()
    }

    /// Looks a class up by name, creating placeholders for it and its enclosers.
    pub fn find_create(&mut self, full_name: &str) -> ClassId {
        if let Some(id) = self.find(full_name) {
            return id;
        }

        let encloser = full_name
            .rfind(NESTING_SEPARATOR)
            .map(|pos| self.find_create(&full_name[..pos]));

        let id = self.slots.len();
        self.slots.push(ClassSlot::Unresolved {
            name: full_name.to_string(),
            token: Self::token_for(id),
            encloser,
        });
        self.by_name.insert(full_name.to_string(), id);
        id
    }

    /// Promotes the slot at `id` to a defined class.
    pub fn define(&mut self, id: ClassId, class: Class) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = ClassSlot::Defined(Box::new(class));
        }
    }

    /// The slot at `id`
    #[must_use]
    pub fn slot(&self, id: ClassId) -> Option<&ClassSlot> {
        self.slots.get(id)
    }

    /// The class at `id`, if declared
    #[must_use]
    pub fn get(&self, id: ClassId) -> Option<&Class> {
        match self.slots.get(id) {
            Some(ClassSlot::Defined(class)) => Some(class),
            _ => None,
        }
    }

    /// The class at `id`, if declared
    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        match self.slots.get_mut(id) {
            Some(ClassSlot::Defined(class)) => Some(class),
            _ => None,
        }
    }

    /// The class owning the provisional token `token`
    #[must_use]
    pub fn id_of(&self, token: Token) -> Option<ClassId> {
        if !token.is_table(TableId::TypeDef) || token.row() == 0 {
            return None;
        }
        let id = token.row() as usize - 1;
        (id < self.slots.len()).then_some(id)
    }

    /// Fully qualified name of the slot at `id`
    #[must_use]
    pub fn name(&self, id: ClassId) -> &str {
        self.slots.get(id).map_or("", ClassSlot::name)
    }

    /// Number of enclosing classes of `id`
    #[must_use]
    pub fn depth(&self, id: ClassId) -> usize {
        let mut depth = 0;
        let mut current = self.slots.get(id).and_then(ClassSlot::encloser);
        while let Some(encloser) = current {
            depth += 1;
            current = self.slots.get(encloser).and_then(ClassSlot::encloser);
        }
        depth
    }

    /// All slots in index order
    pub fn slots(&self) -> impl Iterator<Item = (ClassId, &ClassSlot)> {
        self.slots.iter().enumerate()
    }

    /// Classes that were referenced but never declared
    #[must_use]
    pub fn unresolved(&self) -> Vec<(ClassId, String)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot {
                ClassSlot::Unresolved { name, .. } => Some((id, name.clone())),
                ClassSlot::Defined(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_class() {
        let table = ClassTable::new();
        assert_eq!(table.len(), 1);
        assert!(table.is_empty());
        let module = table.get(MODULE_CLASS).unwrap();
        assert_eq!(module.full_name, MODULE_CLASS_NAME);
        assert_eq!(module.token, Token(0x02000001));
    }

    #[test]
    fn nested_round_trip() {
        let mut table = ClassTable::new();
        let id = table.find_create("NS.A/B/C");
        assert_eq!(table.find("NS.A/B/C"), Some(id));
        assert_eq!(table.find_create("NS.A/B/C"), id);
        assert_eq!(table.depth(id), 2);

        let b = table.slot(id).unwrap().encloser().unwrap();
        assert_eq!(table.name(b), "NS.A/B");
        let a = table.slot(b).unwrap().encloser().unwrap();
        assert_eq!(table.name(a), "NS.A");
        assert_eq!(table.slot(a).unwrap().encloser(), None);

        // Enclosers are created first
        assert!(a < b && b < id);
        assert_eq!(table.unresolved().len(), 3);
    }

    #[test]
    fn promotion_keeps_token() {
        let mut table = ClassTable::new();
        let id = table.find_create("Foo");
        let token = table.slot(id).unwrap().token();
        assert_eq!(token, Token(0x02000002));
        assert!(table.get(id).is_none());

        table.define(id, Class::new("Foo", token, TypeAttributes::PUBLIC, None));
        assert_eq!(table.get(id).unwrap().token, token);
        assert_eq!(table.id_of(token), Some(id));
        assert!(table.unresolved().is_empty());
    }

    #[test]
    fn name_split() {
        assert_eq!(split_class_name("System.Collections.List"), ("System.Collections", "List"));
        assert_eq!(split_class_name("Foo"), ("", "Foo"));
        assert_eq!(split_class_name("NS.Outer/Inner"), ("", "Inner"));
        assert_eq!(split_class_name(".Odd"), ("", ".Odd"));
    }

    #[test]
    fn id_of_foreign_tokens() {
        let table = ClassTable::new();
        assert_eq!(table.id_of(Token(0x01000001)), None);
        assert_eq!(table.id_of(Token(0x02000005)), None);
        assert_eq!(table.id_of(Token(0x02000000)), None);
    }
}
