//! In-memory metadata emitter and section allocator.
//!
//! [`MemoryEmitter`] records every definition it receives and assigns tokens sequentially
//! per table, the way a fresh metadata writer does. References, module refs, stand-alone
//! signatures and user strings are deduplicated; type specs are not, so callers can observe
//! their own caching. Every operation is counted, and individual names can be configured to
//! fail in order to exercise error paths.
//!
//! [`MemorySections`] keeps one growable buffer per section with fixed base RVAs and records
//! relocations without applying them; [`MemorySections::resolved`] applies them on a copy.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    emitter::{
        AssemblyDefinition, EventDefinition, ExportedTypeDefinition, FieldDefinition,
        FileDefinition, GenericParamDefinition, MetadataEmitter, MethodDefinition,
        ParamDefinition, PropertyDefinition, RelocKind, ResourceDefinition, Section,
        SectionAllocator, TypeDefinition,
    },
    metadata::token::{TableId, Token},
    utils::{align_up, to_u32},
    Error, Result,
};

/// A member reference recorded by [`MemoryEmitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRefRecord {
    /// Assigned token
    pub token: Token,
    /// Parent (type, module, method definition)
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Signature blob
    pub signature: Vec<u8>,
}

/// Metadata emitter that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    rows: FxHashMap<u8, u32>,
    user_string_heap: u32,
    failures: FxHashSet<String>,
    calls: FxHashMap<&'static str, usize>,
    /// Defined types in definition order
    pub types: Vec<(Token, TypeDefinition)>,
    /// Defined methods
    pub methods: Vec<(Token, MethodDefinition)>,
    /// Parameters with their owning method
    pub params: Vec<(Token, Token, ParamDefinition)>,
    /// Defined fields
    pub fields: Vec<(Token, FieldDefinition)>,
    /// Defined events
    pub events: Vec<(Token, EventDefinition)>,
    /// Defined properties
    pub properties: Vec<(Token, PropertyDefinition)>,
    /// Member references
    pub member_refs: Vec<MemberRefRecord>,
    /// Type references as (token, scope, full name)
    pub type_refs: Vec<(Token, Token, String)>,
    /// Type specifications
    pub type_specs: Vec<(Token, Vec<u8>)>,
    /// Method specifications as (token, parent, instantiation)
    pub method_specs: Vec<(Token, Token, Vec<u8>)>,
    /// Generic parameters with their owner
    pub generic_params: Vec<(Token, Token, GenericParamDefinition)>,
    /// Generic parameter constraints as (token, param, constraint)
    pub constraints: Vec<(Token, Token, Token)>,
    /// Custom attributes as (owner, ctor, blob)
    pub custom_attributes: Vec<(Token, Token, Vec<u8>)>,
    /// Declarative security as (owner, action, blob)
    pub permission_sets: Vec<(Token, u16, Vec<u8>)>,
    /// Module references
    pub module_refs: Vec<(Token, String)>,
    /// P/Invoke maps as (member, flags, import name, module ref)
    pub pinvoke_maps: Vec<(Token, u32, String, Token)>,
    /// Stand-alone signatures
    pub signatures: Vec<(Token, Vec<u8>)>,
    /// User strings
    pub user_strings: Vec<(Token, Vec<u16>)>,
    /// Class layouts as (class, packing, size, field offsets)
    pub class_layouts: Vec<(Token, u16, u32, Vec<(Token, u32)>)>,
    /// Marshalling descriptors
    pub marshals: Vec<(Token, Vec<u8>)>,
    /// Field RVAs
    pub field_rvas: FxHashMap<Token, u32>,
    /// Method RVAs
    pub method_rvas: FxHashMap<Token, u32>,
    /// Method impls as (class, body, declaration)
    pub method_impls: Vec<(Token, Token, Token)>,
    /// Module name
    pub module_name: Option<String>,
    /// Assembly identity
    pub assembly: Option<AssemblyDefinition>,
    /// Assembly references
    pub assembly_refs: Vec<(Token, AssemblyDefinition)>,
    /// Files
    pub files: Vec<(Token, FileDefinition)>,
    /// Exported types
    pub exported_types: Vec<(Token, ExportedTypeDefinition)>,
    /// Manifest resources
    pub resources: Vec<(Token, ResourceDefinition)>,
}

impl MemoryEmitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an emitter for a delta on top of an existing module: `<Module>` already
    /// occupies the first `TypeDef` row.
    #[must_use]
    pub fn with_base_module() -> Self {
        let mut emitter = Self::default();
        let token = emitter.next(TableId::TypeDef);
        emitter.types.push((
            token,
            TypeDefinition {
                name: "<Module>".to_string(),
                namespace: String::new(),
                flags: 0,
                extends: Token::NIL,
                interfaces: Vec::new(),
                encloser: None,
            },
        ));
        emitter
    }

    /// Makes every definition or reference named `name` fail with [`Error::Emitter`].
    pub fn fail_on(&mut self, name: impl Into<String>) {
        self.failures.insert(name.into());
    }

    /// Number of times `operation` (the trait method name) was called.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).copied().unwrap_or(0)
    }

    /// Token of the type `full_name` (`Namespace.Name`), nested types by simple name.
    #[must_use]
    pub fn type_token(&self, full_name: &str) -> Option<Token> {
        self.types
            .iter()
            .find(|(_, def)| {
                if def.namespace.is_empty() {
                    def.name == full_name
                } else {
                    full_name
                        .strip_prefix(def.namespace.as_str())
                        .and_then(|rest| rest.strip_prefix('.'))
                        .is_some_and(|rest| rest == def.name)
                }
            })
            .map(|(token, _)| *token)
    }

    /// Returns the method definition behind `token`.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDefinition> {
        self.methods
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, def)| def)
    }

    /// Token of the first method named `name` in `class`.
    #[must_use]
    pub fn method_token(&self, class: Token, name: &str) -> Option<Token> {
        self.methods
            .iter()
            .find(|(_, def)| def.class == class && def.name == name)
            .map(|(token, _)| *token)
    }

    /// Returns the field definition of `name` in `class`.
    #[must_use]
    pub fn field(&self, class: Token, name: &str) -> Option<(Token, &FieldDefinition)> {
        self.fields
            .iter()
            .find(|(_, def)| def.class == class && def.name == name)
            .map(|(token, def)| (*token, def))
    }

    /// Custom attributes attached to `owner`.
    #[must_use]
    pub fn attributes_of(&self, owner: Token) -> Vec<(Token, &[u8])> {
        self.custom_attributes
            .iter()
            .filter(|(o, _, _)| *o == owner)
            .map(|(_, ctor, blob)| (*ctor, blob.as_slice()))
            .collect()
    }

    fn next(&mut self, table: TableId) -> Token {
        let row = self.rows.entry(table as u8).or_insert(0);
        *row += 1;
        Token::from_parts(table, *row)
    }

    fn enter(&mut self, operation: &'static str, name: &str) -> Result<()> {
        *self.calls.entry(operation).or_insert(0) += 1;
        if self.failures.contains(name) {
            return Err(Error::Emitter(format!("{operation} rejected '{name}'")));
        }
        Ok(())
    }
}

impl MetadataEmitter for MemoryEmitter {
    fn define_type(&mut self, def: &TypeDefinition) -> Result<Token> {
        self.enter("define_type", &def.name)?;
        let token = self.next(TableId::TypeDef);
        self.types.push((token, def.clone()));
        Ok(token)
    }

    fn define_method(&mut self, def: &MethodDefinition) -> Result<Token> {
        self.enter("define_method", &def.name)?;
        let token = self.next(TableId::MethodDef);
        self.methods.push((token, def.clone()));
        Ok(token)
    }

    fn define_param(&mut self, method: Token, def: &ParamDefinition) -> Result<Token> {
        self.enter("define_param", &def.name)?;
        let token = self.next(TableId::Param);
        self.params.push((token, method, def.clone()));
        Ok(token)
    }

    fn define_field(&mut self, def: &FieldDefinition) -> Result<Token> {
        self.enter("define_field", &def.name)?;
        let token = self.next(TableId::Field);
        self.fields.push((token, def.clone()));
        Ok(token)
    }

    fn define_event(&mut self, def: &EventDefinition) -> Result<Token> {
        self.enter("define_event", &def.name)?;
        let token = self.next(TableId::Event);
        self.events.push((token, def.clone()));
        Ok(token)
    }

    fn define_property(&mut self, def: &PropertyDefinition) -> Result<Token> {
        self.enter("define_property", &def.name)?;
        let token = self.next(TableId::Property);
        self.properties.push((token, def.clone()));
        Ok(token)
    }

    fn define_member_ref(&mut self, parent: Token, name: &str, signature: &[u8]) -> Result<Token> {
        self.enter("define_member_ref", name)?;
        if let Some(existing) = self
            .member_refs
            .iter()
            .find(|r| r.parent == parent && r.name == name && r.signature == signature)
        {
            return Ok(existing.token);
        }

        let token = self.next(TableId::MemberRef);
        self.member_refs.push(MemberRefRecord {
            token,
            parent,
            name: name.to_string(),
            signature: signature.to_vec(),
        });
        Ok(token)
    }

    fn define_type_ref_by_name(&mut self, scope: Token, name: &str) -> Result<Token> {
        self.enter("define_type_ref_by_name", name)?;
        if let Some((token, _, _)) = self
            .type_refs
            .iter()
            .find(|(_, s, n)| *s == scope && n == name)
        {
            return Ok(*token);
        }

        let token = self.next(TableId::TypeRef);
        self.type_refs.push((token, scope, name.to_string()));
        Ok(token)
    }

    fn get_token_from_type_spec(&mut self, signature: &[u8]) -> Result<Token> {
        self.enter("get_token_from_type_spec", "")?;
        let token = self.next(TableId::TypeSpec);
        self.type_specs.push((token, signature.to_vec()));
        Ok(token)
    }

    fn define_method_spec(&mut self, parent: Token, instantiation: &[u8]) -> Result<Token> {
        self.enter("define_method_spec", "")?;
        let token = self.next(TableId::MethodSpec);
        self.method_specs.push((token, parent, instantiation.to_vec()));
        Ok(token)
    }

    fn define_generic_param(
        &mut self,
        owner: Token,
        def: &GenericParamDefinition,
    ) -> Result<Token> {
        self.enter("define_generic_param", &def.name)?;
        let token = self.next(TableId::GenericParam);
        self.generic_params.push((token, owner, def.clone()));
        Ok(token)
    }

    fn define_generic_param_constraint(
        &mut self,
        param: Token,
        constraint: Token,
    ) -> Result<Token> {
        self.enter("define_generic_param_constraint", "")?;
        let token = self.next(TableId::GenericParamConstraint);
        self.constraints.push((token, param, constraint));
        Ok(token)
    }

    fn define_custom_attribute(
        &mut self,
        owner: Token,
        ctor: Token,
        blob: &[u8],
    ) -> Result<Token> {
        self.enter("define_custom_attribute", "")?;
        let token = self.next(TableId::CustomAttribute);
        self.custom_attributes.push((owner, ctor, blob.to_vec()));
        Ok(token)
    }

    fn define_permission_set(&mut self, owner: Token, action: u16, blob: &[u8]) -> Result<Token> {
        self.enter("define_permission_set", "")?;
        let token = self.next(TableId::DeclSecurity);
        self.permission_sets.push((owner, action, blob.to_vec()));
        Ok(token)
    }

    fn define_module_ref(&mut self, name: &str) -> Result<Token> {
        self.enter("define_module_ref", name)?;
        if let Some((token, _)) = self.module_refs.iter().find(|(_, n)| n == name) {
            return Ok(*token);
        }

        let token = self.next(TableId::ModuleRef);
        self.module_refs.push((token, name.to_string()));
        Ok(token)
    }

    fn define_pinvoke_map(
        &mut self,
        member: Token,
        flags: u32,
        import_name: &str,
        module_ref: Token,
    ) -> Result<()> {
        self.enter("define_pinvoke_map", import_name)?;
        self.pinvoke_maps
            .push((member, flags, import_name.to_string(), module_ref));
        Ok(())
    }

    fn get_token_from_sig(&mut self, signature: &[u8]) -> Result<Token> {
        self.enter("get_token_from_sig", "")?;
        if let Some((token, _)) = self.signatures.iter().find(|(_, s)| s == signature) {
            return Ok(*token);
        }

        let token = self.next(TableId::StandAloneSig);
        self.signatures.push((token, signature.to_vec()));
        Ok(token)
    }

    fn define_user_string(&mut self, value: &[u16]) -> Result<Token> {
        self.enter("define_user_string", "")?;
        if let Some((token, _)) = self.user_strings.iter().find(|(_, s)| s == value) {
            return Ok(*token);
        }

        // Offset 0 is the empty entry; each string is length, UTF-16 and a terminal byte
        if self.user_string_heap == 0 {
            self.user_string_heap = 1;
        }
        let token = Token::from_parts(TableId::UserString, self.user_string_heap);
        let blob_len = to_u32(value.len() * 2 + 1)?;
        let prefix = if blob_len < 0x80 {
            1
        } else if blob_len < 0x4000 {
            2
        } else {
            4
        };
        self.user_string_heap += prefix + blob_len;
        if self.user_string_heap > 0x00FF_FFFF {
            return Err(Error::Emitter("user string heap exceeds 16MB".to_string()));
        }
        self.user_strings.push((token, value.to_vec()));
        Ok(token)
    }

    fn set_class_layout(
        &mut self,
        class: Token,
        packing: u16,
        size: u32,
        field_offsets: &[(Token, u32)],
    ) -> Result<()> {
        self.enter("set_class_layout", "")?;
        self.class_layouts
            .push((class, packing, size, field_offsets.to_vec()));
        Ok(())
    }

    fn set_marshal(&mut self, owner: Token, native_type: &[u8]) -> Result<()> {
        self.enter("set_marshal", "")?;
        self.marshals.push((owner, native_type.to_vec()));
        Ok(())
    }

    fn set_field_rva(&mut self, field: Token, rva: u32) -> Result<()> {
        self.enter("set_field_rva", "")?;
        self.field_rvas.insert(field, rva);
        Ok(())
    }

    fn set_method_rva(&mut self, method: Token, rva: u32) -> Result<()> {
        self.enter("set_method_rva", "")?;
        self.method_rvas.insert(method, rva);
        Ok(())
    }

    fn define_method_impl(&mut self, class: Token, body: Token, declaration: Token) -> Result<()> {
        self.enter("define_method_impl", "")?;
        self.method_impls.push((class, body, declaration));
        Ok(())
    }

    fn set_module_name(&mut self, name: &str) -> Result<()> {
        self.enter("set_module_name", name)?;
        self.module_name = Some(name.to_string());
        Ok(())
    }

    fn define_assembly(&mut self, def: &AssemblyDefinition) -> Result<Token> {
        self.enter("define_assembly", &def.name)?;
        self.assembly = Some(def.clone());
        Ok(Token::from_parts(TableId::Assembly, 1))
    }

    fn define_assembly_ref(&mut self, def: &AssemblyDefinition) -> Result<Token> {
        self.enter("define_assembly_ref", &def.name)?;
        let token = self.next(TableId::AssemblyRef);
        self.assembly_refs.push((token, def.clone()));
        Ok(token)
    }

    fn define_file(&mut self, def: &FileDefinition) -> Result<Token> {
        self.enter("define_file", &def.name)?;
        let token = self.next(TableId::File);
        self.files.push((token, def.clone()));
        Ok(token)
    }

    fn define_exported_type(&mut self, def: &ExportedTypeDefinition) -> Result<Token> {
        self.enter("define_exported_type", &def.name)?;
        let token = self.next(TableId::ExportedType);
        self.exported_types.push((token, def.clone()));
        Ok(token)
    }

    fn define_manifest_resource(&mut self, def: &ResourceDefinition) -> Result<Token> {
        self.enter("define_manifest_resource", &def.name)?;
        let token = self.next(TableId::ManifestResource);
        self.resources.push((token, def.clone()));
        Ok(token)
    }
}

/// A relocation recorded by [`MemorySections`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Section holding the relocated value
    pub section: Section,
    /// Offset of the value in `section`
    pub offset: u32,
    /// Relocation kind
    pub kind: RelocKind,
    /// Section the value refers to
    pub target: Section,
}

/// Image base used when applying `HighLow` and `Dir64` relocations
pub const IMAGE_BASE: u64 = 0x0040_0000;

/// Section allocator that keeps one buffer per section.
#[derive(Debug)]
pub struct MemorySections {
    buffers: [Vec<u8>; 3],
    bases: [u32; 3],
    relocations: Vec<Relocation>,
}

impl Default for MemorySections {
    fn default() -> Self {
        Self::with_bases(0x2000, 0x0001_0000, 0x0002_0000)
    }
}

impl MemorySections {
    /// Creates empty sections at the default base RVAs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty sections at the given base RVAs.
    #[must_use]
    pub fn with_bases(il: u32, data: u32, tls: u32) -> Self {
        MemorySections {
            buffers: [Vec::new(), Vec::new(), Vec::new()],
            bases: [il, data, tls],
            relocations: Vec::new(),
        }
    }

    /// Raw contents of `section`.
    #[must_use]
    pub fn data(&self, section: Section) -> &[u8] {
        &self.buffers[section as usize]
    }

    /// All recorded relocations.
    #[must_use]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Copy of `section` with every address relocation applied.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if a relocation points outside the section.
    pub fn resolved(&self, section: Section) -> Result<Vec<u8>> {
        let mut data = self.buffers[section as usize].clone();
        for reloc in self.relocations.iter().filter(|r| r.section == section) {
            let start = reloc.offset as usize;
            let base = u64::from(self.bases[reloc.target as usize]);
            match reloc.kind {
                RelocKind::Absolute | RelocKind::HighLow => {
                    let slot = data.get_mut(start..start + 4).ok_or(Error::OutOfBounds)?;
                    let mut value = u64::from(u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]));
                    value += base;
                    if reloc.kind == RelocKind::HighLow {
                        value += IMAGE_BASE;
                    }
                    slot.copy_from_slice(&(value as u32).to_le_bytes());
                }
                RelocKind::Dir64 => {
                    let slot = data.get_mut(start..start + 8).ok_or(Error::OutOfBounds)?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(slot);
                    let value = u64::from_le_bytes(raw) + base + IMAGE_BASE;
                    slot.copy_from_slice(&value.to_le_bytes());
                }
                RelocKind::MapToken | RelocKind::FilePos => {}
            }
        }
        Ok(data)
    }
}

impl SectionAllocator for MemorySections {
    fn allocate_block(
        &mut self,
        section: Section,
        size: usize,
        alignment: usize,
    ) -> Result<(u32, &mut [u8])> {
        let buffer = &mut self.buffers[section as usize];
        let start = align_up(buffer.len(), alignment);
        let end = start
            .checked_add(size)
            .ok_or_else(|| Error::Emitter(format!("section {section} overflow")))?;
        let offset = to_u32(start)?;
        to_u32(end)?;

        buffer.resize(end, 0);
        Ok((offset, &mut buffer[start..end]))
    }

    fn section_len(&self, section: Section) -> u32 {
        self.buffers[section as usize].len() as u32
    }

    fn patch(&mut self, section: Section, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let slot = self.buffers[section as usize]
            .get_mut(start..start + bytes.len())
            .ok_or(Error::OutOfBounds)?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    fn add_relocation(
        &mut self,
        section: Section,
        offset: u32,
        kind: RelocKind,
        target: Section,
    ) -> Result<()> {
        self.relocations.push(Relocation {
            section,
            offset,
            kind,
            target,
        });
        Ok(())
    }

    fn rva_of(&self, section: Section, offset: u32) -> u32 {
        self.bases[section as usize] + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_tokens() {
        let mut emitter = MemoryEmitter::new();
        let def = TypeDefinition {
            name: "<Module>".to_string(),
            namespace: String::new(),
            flags: 0,
            extends: Token::NIL,
            interfaces: Vec::new(),
            encloser: None,
        };
        assert_eq!(emitter.define_type(&def).unwrap(), Token(0x02000001));
        assert_eq!(emitter.define_type(&def).unwrap(), Token(0x02000002));
        assert_eq!(emitter.calls("define_type"), 2);
        assert_eq!(emitter.type_token("<Module>"), Some(Token(0x02000001)));
    }

    #[test]
    fn base_module() {
        let emitter = MemoryEmitter::with_base_module();
        assert_eq!(emitter.types.len(), 1);
        assert_eq!(emitter.calls("define_type"), 0);
    }

    #[test]
    fn member_refs_deduplicate() {
        let mut emitter = MemoryEmitter::new();
        let a = emitter
            .define_member_ref(Token(0x01000001), "Foo", &[0x00, 0x00, 0x01])
            .unwrap();
        let b = emitter
            .define_member_ref(Token(0x01000001), "Foo", &[0x00, 0x00, 0x01])
            .unwrap();
        let c = emitter
            .define_member_ref(Token(0x01000001), "Foo", &[0x20, 0x00, 0x01])
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(emitter.member_refs.len(), 2);
    }

    #[test]
    fn user_string_offsets() {
        let mut emitter = MemoryEmitter::new();
        let hello: Vec<u16> = "hello".encode_utf16().collect();
        let first = emitter.define_user_string(&hello).unwrap();
        assert_eq!(first, Token(0x70000001));
        let second = emitter.define_user_string(&[0x41]).unwrap();
        // 1 length byte + 10 + 1 terminal byte
        assert_eq!(second, Token(0x7000000D));
        assert_eq!(emitter.define_user_string(&hello).unwrap(), first);
    }

    #[test]
    fn failure_injection() {
        let mut emitter = MemoryEmitter::new();
        emitter.fail_on("Broken");
        assert!(matches!(
            emitter.define_module_ref("Broken"),
            Err(Error::Emitter(_))
        ));
        assert!(emitter.define_module_ref("kernel32.dll").is_ok());
    }

    #[test]
    fn sections_align_and_relocate() {
        let mut sections = MemorySections::new();
        let (first, block) = sections.allocate_block(Section::Il, 3, 1).unwrap();
        block.copy_from_slice(&[1, 2, 3]);
        assert_eq!(first, 0);

        let (second, block) = sections.allocate_block(Section::Il, 4, 4).unwrap();
        block.copy_from_slice(&0x10u32.to_le_bytes());
        assert_eq!(second, 4);
        assert_eq!(sections.section_len(Section::Il), 8);
        assert_eq!(sections.method_rva(second), 0x2004);

        sections
            .add_relocation(Section::Il, second, RelocKind::Absolute, Section::Data)
            .unwrap();
        let resolved = sections.resolved(Section::Il).unwrap();
        assert_eq!(&resolved[4..8], &0x0001_0010u32.to_le_bytes());
        assert_eq!(&sections.data(Section::Il)[4..8], &0x10u32.to_le_bytes());

        sections.patch(Section::Il, 0, &[9]).unwrap();
        assert_eq!(sections.data(Section::Il)[0], 9);
        assert!(sections.patch(Section::Il, 7, &[0, 0]).is_err());
    }
}
