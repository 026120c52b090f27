//! Assembly manifest: identity, assembly references, files, exported types and resources.
//!
//! The manifest state ([`AsmMan`]) is filled by the `.assembly`, `.assembly extern`,
//! `.file`, `.class extern` and `.mresource` directives and drained once per
//! [`crate::Assembler::finish`] pass. Assembly references are the exception: they are
//! defined as soon as they are declared, because type references need them as resolution
//! scopes while the rest of the unit is still being parsed.
//!
//! # Key Components
//!
//! - [`AssemblyDecl`] - Identity of the assembly or of a referenced assembly
//! - [`FileDecl`], [`ComTypeDecl`], [`ResourceDecl`] - Manifest entries
//! - [`Originator`] - Public key or public key token
//! - [`resources`] - Late-bound reads of embedded resources
//!
//! # Examples
//!
//! ```rust
//! use dotasm::prelude::*;
//! use dotasm::manifest::{AssemblyDecl, Originator};
//!
//! let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
//! asm.declare_assembly(AssemblyDecl::new("hello").version([1, 0, 0, 0]))?;
//! asm.declare_assembly_ref(
//!     AssemblyDecl::new("mscorlib")
//!         .version([4, 0, 0, 0])
//!         .originator(Originator::Token(vec![0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89])),
//! )?;
//!
//! let image = asm.finish()?;
//! assert!(image.resources.is_empty());
//! # Ok::<(), dotasm::Error>(())
//! ```

mod identity;
pub mod resources;

pub use identity::{compute_hash, Originator, TOKEN_SIZE};

use std::path::PathBuf;

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        class::split_class_name,
        members::{AttributeTarget, CustomAttribute, SecurityDecl},
        Assembler,
    },
    diagnostics::DiagnosticCategory,
    emitter::{
        AssemblyDefinition, ExportedTypeDefinition, FileDefinition, MetadataEmitter,
        ResourceDefinition, SectionAllocator,
    },
    manifest::resources::{entry_span, file_size, MappedFile, PendingResource},
    metadata::{
        flags::{AssemblyFlags, AssemblyHashAlgorithm, FileAttributes},
        token::Token,
    },
    Error, Result,
};

/// Alias naming the assembly being built.
pub const SELF_ALIAS: &str = "*";

/// An `.assembly` or `.assembly extern` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyDecl {
    /// Simple name
    pub name: String,
    /// Alias used in `[alias]` references, defaults to the name
    pub alias: Option<String>,
    /// Major, minor, build and revision
    pub version: [u16; 4],
    /// Culture
    pub locale: String,
    /// Public key or token
    pub originator: Option<Originator>,
    /// `AssemblyHashAlgorithm`
    pub hash_algorithm: u32,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Hash of the referenced assembly
    pub hash: Vec<u8>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Declarative security (own assembly only)
    pub security: Vec<SecurityDecl>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl AssemblyDecl {
    /// A declaration with version 0.0.0.0, neutral culture and no originator.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        AssemblyDecl {
            name: name.into(),
            alias: None,
            version: [0; 4],
            locale: String::new(),
            originator: None,
            hash_algorithm: AssemblyHashAlgorithm::NONE,
            flags: 0,
            hash: Vec::new(),
            custom_attributes: Vec::new(),
            security: Vec::new(),
            token: Token::NIL,
        }
    }

    /// Sets the alias
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets the version
    #[must_use]
    pub fn version(mut self, version: [u16; 4]) -> Self {
        self.version = version;
        self
    }

    /// Sets the culture
    #[must_use]
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Sets the public key or token
    #[must_use]
    pub fn originator(mut self, originator: Originator) -> Self {
        self.originator = Some(originator);
        self
    }

    /// Sets the hash algorithm
    #[must_use]
    pub fn hash_algorithm(mut self, algo: u32) -> Self {
        self.hash_algorithm = algo;
        self
    }

    /// Sets the flags
    #[must_use]
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// The name references use
    #[must_use]
    pub fn alias_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn definition(&self) -> AssemblyDefinition {
        AssemblyDefinition {
            name: self.name.clone(),
            version: self.version,
            locale: self.locale.clone(),
            public_key: self
                .originator
                .as_ref()
                .map(|o| o.as_bytes().to_vec())
                .unwrap_or_default(),
            hash_algorithm: self.hash_algorithm,
            flags: self.flags,
            hash: self.hash.clone(),
        }
    }
}

/// A `.file` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDecl {
    /// File name as stored in metadata
    pub name: String,
    /// Explicit hash (`.hash = (...)`)
    pub hash: Option<Vec<u8>>,
    /// Location to hash when no explicit hash is given
    pub path: Option<PathBuf>,
    /// `FileAttributes`
    pub flags: u32,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl FileDecl {
    /// A file containing metadata, hashed from `name` if it exists.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        FileDecl {
            path: Some(PathBuf::from(&name)),
            name,
            hash: None,
            flags: FileAttributes::CONTAINS_META_DATA,
            custom_attributes: Vec::new(),
            token: Token::NIL,
        }
    }

    /// Uses an explicit hash
    #[must_use]
    pub fn hash(mut self, hash: Vec<u8>) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Hashes the file at `path`
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Marks the file as containing no metadata
    #[must_use]
    pub fn no_metadata(mut self) -> Self {
        self.flags = FileAttributes::CONTAINS_NO_META_DATA;
        self
    }
}

/// Implementation of an exported type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComTypeImpl {
    /// Defined in a file of this assembly
    File(String),
    /// Forwarded to another assembly
    AssemblyRef(String),
    /// Nested in another exported type
    Nested(String),
}

/// A `.class extern` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComTypeDecl {
    /// Full name, or the simple name for nested types
    pub full_name: String,
    /// Where the type lives
    pub implementation: ComTypeImpl,
    /// `TypeDef` hint
    pub type_def_id: u32,
    /// `TypeAttributes`
    pub flags: u32,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl ComTypeDecl {
    /// An exported type.
    #[must_use]
    pub fn new(full_name: impl Into<String>, flags: u32, implementation: ComTypeImpl) -> Self {
        ComTypeDecl {
            full_name: full_name.into(),
            implementation,
            type_def_id: 0,
            flags,
            custom_attributes: Vec::new(),
            token: Token::NIL,
        }
    }
}

/// Where a manifest resource's bytes are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    /// Embedded from a file, read when the resource blob is built
    Embedded(PathBuf),
    /// At an offset inside a file of this assembly
    File {
        /// File name
        name: String,
        /// Offset in the file
        offset: u32,
    },
    /// In another assembly
    AssemblyRef(String),
}

/// A `.mresource` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDecl {
    /// Resource name
    pub name: String,
    /// `ManifestResourceAttributes`
    pub flags: u32,
    /// Source of the data
    pub source: ResourceSource,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token, [`Token::NIL`] until emitted
    pub token: Token,
}

impl ResourceDecl {
    /// A resource.
    #[must_use]
    pub fn new(name: impl Into<String>, flags: u32, source: ResourceSource) -> Self {
        ResourceDecl {
            name: name.into(),
            flags,
            source,
            custom_attributes: Vec::new(),
            token: Token::NIL,
        }
    }
}

/// Manifest state of one compilation unit.
#[derive(Debug, Default)]
pub struct AsmMan {
    pub(crate) assembly: Option<AssemblyDecl>,
    pub(crate) assembly_refs: Vec<AssemblyDecl>,
    ref_aliases: FxHashMap<String, usize>,
    pub(crate) files: Vec<FileDecl>,
    pub(crate) com_types: Vec<ComTypeDecl>,
    pub(crate) resources: Vec<ResourceDecl>,
    pub(crate) pending_resources: Vec<PendingResource>,
    resource_offset: u32,
}

impl AsmMan {
    /// The assembly identity
    #[must_use]
    pub fn assembly(&self) -> Option<&AssemblyDecl> {
        self.assembly.as_ref()
    }

    /// The assembly reference declared under `alias`
    #[must_use]
    pub fn assembly_ref(&self, alias: &str) -> Option<&AssemblyDecl> {
        self.ref_aliases
            .get(alias)
            .and_then(|&index| self.assembly_refs.get(index))
    }

    /// All assembly references in declaration order
    #[must_use]
    pub fn assembly_refs(&self) -> &[AssemblyDecl] {
        &self.assembly_refs
    }

    /// Returns true if `alias` names the assembly being built
    #[must_use]
    pub fn is_self(&self, alias: &str) -> bool {
        alias == SELF_ALIAS
            || self
                .assembly
                .as_ref()
                .is_some_and(|assembly| assembly.alias_name() == alias)
    }

    /// Hands out the resources placed since the last call. The next blob starts at
    /// offset 0 again.
    pub(crate) fn take_pending_resources(&mut self) -> Vec<PendingResource> {
        self.resource_offset = 0;
        std::mem::take(&mut self.pending_resources)
    }

    fn file_token(&self, name: &str) -> Option<Token> {
        self.files
            .iter()
            .find(|file| file.name == name)
            .map(|file| file.token)
            .filter(|token| !token.is_null())
    }

    fn com_type_token(&self, name: &str) -> Option<Token> {
        self.com_types
            .iter()
            .find(|com_type| com_type.full_name == name)
            .map(|com_type| com_type.token)
            .filter(|token| !token.is_null())
    }

    fn hash_algorithm(&self) -> u32 {
        match self.assembly.as_ref().map(|a| a.hash_algorithm) {
            Some(AssemblyHashAlgorithm::MD5) => AssemblyHashAlgorithm::MD5,
            _ => AssemblyHashAlgorithm::SHA1,
        }
    }
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// The manifest state
    #[must_use]
    pub fn manifest(&self) -> &AsmMan {
        &self.manifest
    }

    /// Declares the identity of the assembly being built (`.assembly`).
    ///
    /// # Errors
    /// Returns [`Error::Duplicate`] if an identity was already declared.
    pub fn declare_assembly(&mut self, mut decl: AssemblyDecl) -> Result<()> {
        if let Some(existing) = &self.manifest.assembly {
            return self.report(Error::Duplicate {
                kind: "assembly",
                name: existing.name.clone(),
            });
        }
        if decl.originator.as_ref().is_some_and(Originator::is_public_key) {
            decl.flags |= AssemblyFlags::PUBLIC_KEY;
        }
        log::debug!("assembly '{}' declared", decl.name);
        self.manifest.assembly = Some(decl);
        self.target = AttributeTarget::Assembly;
        Ok(())
    }

    /// Declares and defines an assembly reference (`.assembly extern`).
    ///
    /// A full public key is reduced to its token.
    ///
    /// # Errors
    /// Returns an error for duplicate aliases or if the emitter rejects the reference.
    pub fn declare_assembly_ref(&mut self, mut decl: AssemblyDecl) -> Result<Token> {
        let alias = decl.alias_name().to_string();
        if let Some(existing) = self.manifest.assembly_ref(&alias) {
            let token = existing.token;
            self.report(Error::Duplicate {
                kind: "assembly reference",
                name: alias,
            })?;
            return Ok(token);
        }

        if let Some(Originator::PublicKey(_)) = &decl.originator {
            if let Some(originator) = decl.originator.take() {
                let algo = if decl.hash_algorithm == AssemblyHashAlgorithm::MD5 {
                    AssemblyHashAlgorithm::MD5
                } else {
                    AssemblyHashAlgorithm::SHA1
                };
                decl.originator = Some(Originator::Token(originator.to_token(algo)?));
            }
            decl.flags &= !AssemblyFlags::PUBLIC_KEY;
        }

        decl.token = self.emitter.define_assembly_ref(&decl.definition())?;
        let token = decl.token;
        log::debug!("assembly reference '{}' -> {}", alias, token);

        self.manifest.assembly_refs.push(decl);
        let index = self.manifest.assembly_refs.len() - 1;
        self.manifest.ref_aliases.insert(alias, index);
        self.target = AttributeTarget::AssemblyRef(index);
        Ok(token)
    }

    /// Resolution scope for `[alias]`.
    ///
    /// Returns `None` for the assembly being built. An undeclared alias is declared as a
    /// reference with default identity and a warning.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects an auto-declared reference.
    pub fn assembly_ref_token(&mut self, alias: &str) -> Result<Option<Token>> {
        if self.manifest.is_self(alias) {
            return Ok(None);
        }
        if let Some(decl) = self.manifest.assembly_ref(alias) {
            return Ok(Some(decl.token));
        }

        self.warn(
            DiagnosticCategory::Reference,
            format!("Reference to undeclared extern assembly '{alias}'. Attempting autodetect"),
        );
        let target = self.target;
        let token = self.declare_assembly_ref(AssemblyDecl::new(alias))?;
        self.target = target;
        Ok(Some(token))
    }

    /// Declares a file of a multi-file assembly (`.file`).
    ///
    /// # Errors
    /// Returns [`Error::Duplicate`] for a second file with the same name.
    pub fn declare_file(&mut self, decl: FileDecl) -> Result<()> {
        if self.manifest.files.iter().any(|file| file.name == decl.name) {
            return self.report(Error::Duplicate {
                kind: "file",
                name: decl.name,
            });
        }
        self.manifest.files.push(decl);
        self.target = AttributeTarget::File(self.manifest.files.len() - 1);
        Ok(())
    }

    /// Declares an exported type (`.class extern`).
    ///
    /// # Errors
    /// Returns [`Error::Duplicate`] for a second export of the same type.
    pub fn declare_com_type(&mut self, decl: ComTypeDecl) -> Result<()> {
        if self
            .manifest
            .com_types
            .iter()
            .any(|com_type| com_type.full_name == decl.full_name)
        {
            return self.report(Error::Duplicate {
                kind: "exported type",
                name: decl.full_name,
            });
        }
        self.manifest.com_types.push(decl);
        self.target = AttributeTarget::ComType(self.manifest.com_types.len() - 1);
        Ok(())
    }

    /// Declares a manifest resource (`.mresource`).
    ///
    /// # Errors
    /// Returns [`Error::Duplicate`] for a second resource with the same name.
    pub fn declare_resource(&mut self, decl: ResourceDecl) -> Result<()> {
        if self.manifest.resources.iter().any(|r| r.name == decl.name) {
            return self.report(Error::Duplicate {
                kind: "manifest resource",
                name: decl.name,
            });
        }
        self.manifest.resources.push(decl);
        self.target = AttributeTarget::Resource(self.manifest.resources.len() - 1);
        Ok(())
    }

    /// Emits every manifest entry not emitted by an earlier pass.
    pub(crate) fn emit_manifest(&mut self) -> Result<()> {
        self.emit_files()?;
        self.emit_com_types()?;
        self.emit_resources()?;

        if let Some(assembly) = self.manifest.assembly.as_ref().filter(|a| a.token.is_null()) {
            let definition = assembly.definition();
            let result = self.emitter.define_assembly(&definition);
            if let Some(token) = self.recover(result)? {
                log::debug!("assembly '{}' -> {}", definition.name, token);
                let (attributes, security) = match self.manifest.assembly.as_mut() {
                    Some(assembly) => {
                        assembly.token = token;
                        (
                            std::mem::take(&mut assembly.custom_attributes),
                            std::mem::take(&mut assembly.security),
                        )
                    }
                    None => (Vec::new(), Vec::new()),
                };
                self.emit_security(token, &security)?;
                self.emit_custom_attributes(token, attributes)?;
            }
        } else if let Some(assembly) = self.manifest.assembly.as_mut() {
            // Attributes added by a later pass
            let token = assembly.token;
            let attributes = std::mem::take(&mut assembly.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }

        for index in 0..self.manifest.assembly_refs.len() {
            let decl = &mut self.manifest.assembly_refs[index];
            let token = decl.token;
            let attributes = std::mem::take(&mut decl.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    fn emit_files(&mut self) -> Result<()> {
        let algo = self.manifest.hash_algorithm();
        for index in 0..self.manifest.files.len() {
            let decl = &self.manifest.files[index];
            if !decl.token.is_null() {
                continue;
            }

            let hash = match (&decl.hash, &decl.path) {
                (Some(hash), _) => hash.clone(),
                (None, Some(path)) if path.exists() => {
                    let file = MappedFile::open(path)?;
                    compute_hash(file.data(), algo)
                }
                _ => Vec::new(),
            };
            let definition = FileDefinition {
                name: decl.name.clone(),
                hash,
                flags: decl.flags,
            };

            let result = self.emitter.define_file(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            let decl = &mut self.manifest.files[index];
            decl.token = token;
            let attributes = std::mem::take(&mut decl.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    fn emit_com_types(&mut self) -> Result<()> {
        for index in 0..self.manifest.com_types.len() {
            let decl = self.manifest.com_types[index].clone();
            if !decl.token.is_null() {
                continue;
            }

            let implementation = match &decl.implementation {
                ComTypeImpl::File(name) => self.manifest.file_token(name).ok_or_else(|| {
                    Error::UndefinedReference(format!(
                        "Undefined file '{}' implementing exported type '{}'",
                        name, decl.full_name
                    ))
                }),
                ComTypeImpl::AssemblyRef(alias) => match self.assembly_ref_token(alias)? {
                    Some(token) => Ok(token),
                    None => Err(Error::UndefinedReference(format!(
                        "Exported type '{}' forwarded to its own assembly",
                        decl.full_name
                    ))),
                },
                ComTypeImpl::Nested(encloser) => {
                    self.manifest.com_type_token(encloser).ok_or_else(|| {
                        Error::UndefinedReference(format!(
                            "Undefined enclosing exported type '{}' of '{}'",
                            encloser, decl.full_name
                        ))
                    })
                }
            };
            let Some(implementation) = self.recover(implementation)? else {
                continue;
            };

            let (namespace, name) = split_class_name(&decl.full_name);
            let definition = ExportedTypeDefinition {
                name: name.to_string(),
                namespace: namespace.to_string(),
                implementation,
                type_def_id: decl.type_def_id,
                flags: decl.flags,
            };
            let result = self.emitter.define_exported_type(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            let decl = &mut self.manifest.com_types[index];
            decl.token = token;
            let attributes = std::mem::take(&mut decl.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    fn emit_resources(&mut self) -> Result<()> {
        for index in 0..self.manifest.resources.len() {
            let decl = self.manifest.resources[index].clone();
            if !decl.token.is_null() {
                continue;
            }

            let placement = match &decl.source {
                ResourceSource::Embedded(path) => file_size(path).map(|size| {
                    let offset = self.manifest.resource_offset;
                    self.manifest.resource_offset += entry_span(size);
                    self.manifest.pending_resources.push(PendingResource {
                        name: decl.name.clone(),
                        path: path.clone(),
                        offset,
                        size,
                    });
                    (Token::NIL, offset)
                }),
                ResourceSource::File { name, offset } => self
                    .manifest
                    .file_token(name)
                    .map(|token| (token, *offset))
                    .ok_or_else(|| {
                        Error::UndefinedReference(format!(
                            "Undefined file '{}' holding resource '{}'",
                            name, decl.name
                        ))
                    }),
                ResourceSource::AssemblyRef(alias) => match self.assembly_ref_token(alias)? {
                    Some(token) => Ok((token, 0)),
                    None => Err(Error::UndefinedReference(format!(
                        "Resource '{}' linked to its own assembly",
                        decl.name
                    ))),
                },
            };
            let Some((implementation, offset)) = self.recover(placement)? else {
                continue;
            };

            let definition = ResourceDefinition {
                name: decl.name.clone(),
                implementation,
                offset,
                flags: decl.flags,
            };
            let result = self.emitter.define_manifest_resource(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            let decl = &mut self.manifest.resources[index];
            decl.token = token;
            let attributes = std::mem::take(&mut decl.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_alias() {
        let mut manifest = AsmMan::default();
        assert!(manifest.is_self("*"));
        assert!(!manifest.is_self("hello"));
        manifest.assembly = Some(AssemblyDecl::new("hello"));
        assert!(manifest.is_self("hello"));
    }

    #[test]
    fn alias_defaults_to_name() {
        let decl = AssemblyDecl::new("System.Runtime");
        assert_eq!(decl.alias_name(), "System.Runtime");
        assert_eq!(decl.alias("rt").alias_name(), "rt");
    }

    #[test]
    fn file_hash_algorithm() {
        let mut manifest = AsmMan::default();
        assert_eq!(manifest.hash_algorithm(), AssemblyHashAlgorithm::SHA1);
        manifest.assembly =
            Some(AssemblyDecl::new("a").hash_algorithm(AssemblyHashAlgorithm::MD5));
        assert_eq!(manifest.hash_algorithm(), AssemblyHashAlgorithm::MD5);
    }
}
