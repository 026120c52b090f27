//! Class, type and module references.
//!
//! Classes of the compilation unit are referenced through their provisional `TypeDef`
//! token, which [`crate::assembler::ClassTable::find_create`] hands out even before the
//! declaration is seen. Classes of other assemblies and modules become `TypeRef` rows scoped
//! by an assembly or module reference; a nested external class is a chain of `TypeRef`s, each
//! scoped by its encloser.
//!
//! The few types the assembler needs on its own (base classes of the auto-inherit rule and
//! the value type and enum detection) are tracked in [`SpecialTypes`]. They are looked up in
//! the base library, which is detected among the declared assembly references.

use crate::{
    assembler::{class::NESTING_SEPARATOR, Assembler},
    emitter::{MetadataEmitter, SectionAllocator},
    metadata::token::Token,
    Error, Result,
};

/// Assembly names that can hold the base class library, in detection order.
pub const BASE_LIBRARIES: [&str; 4] = ["System.Private.CoreLib", "System.Runtime", "mscorlib", "netstandard"];

/// Base library referenced when none of [`BASE_LIBRARIES`] was declared.
pub const FALLBACK_BASE_LIBRARY: &str = "mscorlib";

/// Well known base library types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum SpecialType {
    /// Root of the class hierarchy
    #[strum(to_string = "System.Object")]
    Object,
    /// Strings
    #[strum(to_string = "System.String")]
    String,
    /// Base of value types
    #[strum(to_string = "System.ValueType")]
    ValueType,
    /// Base of enums
    #[strum(to_string = "System.Enum")]
    Enum,
}

impl SpecialType {
    fn from_name(name: &str) -> Option<SpecialType> {
        use strum::IntoEnumIterator;

        SpecialType::iter().find(|special| special.to_string() == name)
    }
}

/// Tokens of the special types referenced so far, and the detected base library.
#[derive(Debug, Clone, Default)]
pub struct SpecialTypes {
    tokens: [Option<Token>; 4],
    base_library: Option<Token>,
}

impl SpecialTypes {
    /// Token of `special`, if it was referenced
    #[must_use]
    pub fn get(&self, special: SpecialType) -> Option<Token> {
        self.tokens[special as usize]
    }

    /// Which special type `token` refers to
    #[must_use]
    pub fn kind_of(&self, token: Token) -> Option<SpecialType> {
        use strum::IntoEnumIterator;

        if token.is_null() {
            return None;
        }
        SpecialType::iter().find(|&special| self.get(special) == Some(token))
    }

    fn note(&mut self, full_name: &str, token: Token) {
        if let Some(special) = SpecialType::from_name(full_name) {
            self.tokens[special as usize].get_or_insert(token);
        }
    }
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Provisional token of the class `full_name` of this compilation unit.
    ///
    /// The class does not need to be declared yet; a placeholder is created and must be
    /// declared before the unit is finished.
    ///
    /// # Errors
    /// Returns an error for names longer than 1023 characters.
    pub fn class_token(&mut self, full_name: &str) -> Result<Token> {
        self.check_name_length(full_name)?;
        let id = self.classes.find_create(full_name);
        let token = self.classes.slot(id).map_or(Token::NIL, |slot| slot.token());
        if self.options.is_core_library {
            self.special.note(full_name, token);
        }
        Ok(token)
    }

    /// `TypeRef` token of `full_name` resolved through `scope`.
    ///
    /// Nested names (`Outer/Inner`) produce one `TypeRef` per level, each scoped by the
    /// reference to its encloser.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects one of the references.
    pub fn type_ref(&mut self, scope: Token, full_name: &str) -> Result<Token> {
        self.check_name_length(full_name)?;
        let mut token = scope;
        for name in full_name.split(NESTING_SEPARATOR) {
            token = self.emitter.define_type_ref_by_name(token, name)?;
        }
        self.special.note(full_name, token);
        Ok(token)
    }

    /// Token of `[assembly]full_name`.
    ///
    /// A reference to the assembly being built (`*` or its own name) is a reference to a
    /// local class.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the reference.
    pub fn external_class(&mut self, assembly: &str, full_name: &str) -> Result<Token> {
        match self.assembly_ref_token(assembly)? {
            Some(scope) => self.type_ref(scope, full_name),
            None => self.class_token(full_name),
        }
    }

    /// Token of `[.module name]full_name`.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedReference`] for undeclared modules.
    pub fn module_class(&mut self, module: &str, full_name: &str) -> Result<Token> {
        let scope = self.module_ref(module)?;
        if scope == Token::MODULE {
            return self.class_token(full_name);
        }
        self.type_ref(scope, full_name)
    }

    /// Token of a well known base library type.
    ///
    /// When assembling the base library itself the local class is used.
    ///
    /// # Errors
    /// Returns an error if the base library reference or the type reference cannot be
    /// defined.
    pub fn special_type(&mut self, special: SpecialType) -> Result<Token> {
        if let Some(token) = self.special.get(special) {
            return Ok(token);
        }
        let name = special.to_string();
        if self.options.is_core_library {
            return self.class_token(&name);
        }
        let scope = self.base_library()?;
        self.type_ref(scope, &name)
    }

    /// Assembly reference of the base library.
    ///
    /// The first declared reference named in [`BASE_LIBRARIES`] wins; without one,
    /// `mscorlib` is declared with a warning.
    ///
    /// # Errors
    /// Returns an error if the fallback reference cannot be defined.
    pub fn base_library(&mut self) -> Result<Token> {
        if let Some(token) = self.special.base_library {
            return Ok(token);
        }

        let declared = BASE_LIBRARIES.iter().find_map(|&name| {
            self.manifest
                .assembly_refs()
                .iter()
                .find(|decl| decl.name == name)
                .map(|decl| decl.token)
        });
        let token = match declared {
            Some(token) => token,
            None => self
                .assembly_ref_token(FALLBACK_BASE_LIBRARY)?
                .unwrap_or(Token::NIL),
        };
        log::debug!("base library reference {token}");
        self.special.base_library = Some(token);
        Ok(token)
    }

    /// Declares a module reference (`.module extern`).
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the reference.
    pub fn declare_module_ref(&mut self, name: &str) -> Result<Token> {
        if let Some(&token) = self.module_refs.get(name) {
            self.warn(
                crate::diagnostics::DiagnosticCategory::Structural,
                format!("Module reference '{name}' declared twice"),
            );
            return Ok(token);
        }
        let token = self.emitter.define_module_ref(name)?;
        self.module_refs.insert(name.to_string(), token);
        Ok(token)
    }

    /// Token of the module `name`: this module, or a declared module reference.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedReference`] for undeclared modules.
    pub fn module_ref(&mut self, name: &str) -> Result<Token> {
        if self.module_name.as_deref() == Some(name) {
            return Ok(Token::MODULE);
        }
        match self.module_refs.get(name) {
            Some(&token) => Ok(token),
            None => {
                self.report(Error::UndefinedReference(format!(
                    "Undefined module ref '{name}'"
                )))?;
                Ok(Token::NIL)
            }
        }
    }

    /// Module reference of a P/Invoke library, defined on first use.
    pub(crate) fn pinvoke_module_ref(&mut self, dll: &str) -> Result<Token> {
        if let Some(&token) = self.module_refs.get(dll) {
            return Ok(token);
        }
        let token = self.emitter.define_module_ref(dll)?;
        self.module_refs.insert(dll.to_string(), token);
        Ok(token)
    }

    /// Sets the name of the module (`.module`).
    ///
    /// # Errors
    /// Returns an error for over-long names.
    pub fn set_module_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.check_name_length(&name)?;
        if let Some(previous) = &self.module_name {
            if *previous != name {
                let message = format!("Module renamed from '{previous}' to '{name}'");
                self.warn(crate::diagnostics::DiagnosticCategory::Structural, message);
            }
        }
        self.module_name = Some(name);
        self.module_name_emitted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_names() {
        assert_eq!(SpecialType::ValueType.to_string(), "System.ValueType");
        assert_eq!(SpecialType::from_name("System.Enum"), Some(SpecialType::Enum));
        assert_eq!(SpecialType::from_name("System.Int32"), None);
    }

    #[test]
    fn first_token_wins() {
        let mut special = SpecialTypes::default();
        special.note("System.Object", Token(0x01000001));
        special.note("System.Object", Token(0x01000009));
        special.note("Other", Token(0x01000002));
        assert_eq!(special.get(SpecialType::Object), Some(Token(0x01000001)));
        assert_eq!(special.kind_of(Token(0x01000001)), Some(SpecialType::Object));
        assert_eq!(special.kind_of(Token(0x01000002)), None);
        assert_eq!(special.kind_of(Token::NIL), None);
    }
}
