//! Local member references.
//!
//! A `call` or `ldfld` naming a member of a class of this compilation unit cannot be
//! turned into a token while parsing: the member may be declared later, and members are only
//! handed to the metadata emitter once all classes are known. Such references are recorded
//! here and handed out as [`TokenRef::Pending`]. After fields and methods are emitted,
//! [`Assembler::resolve_local_member_refs`] matches each one by class, name and exact
//! signature bytes, and [`Assembler::do_local_member_ref_fixups`] writes the results into
//! the assembled method bodies.
//!
//! References to members of other modules or assemblies need no matching and are defined
//! as `MemberRef` rows immediately.

use rustc_hash::FxHashMap;

use crate::{
    assembler::{
        class::{ClassId, MODULE_CLASS},
        Assembler,
    },
    emitter::{MetadataEmitter, SectionAllocator},
    metadata::{
        signatures::{is_field_signature, normalize_vararg},
        token::{LocalRef, TableId, Token, TokenRef},
    },
    utils::write_le,
    Error, Result,
};

/// A member of a local class referenced by name and signature.
#[derive(Debug, Clone)]
pub struct PendingMemberRef {
    /// Owning class, [`MODULE_CLASS`] for globals
    pub class: ClassId,
    /// Member name
    pub name: String,
    /// Signature at the reference site
    pub signature: Vec<u8>,
    /// Final token once matched
    pub resolved: Option<Token>,
    /// Matching failed and was reported
    pub failed: bool,
}

/// A generic instantiation of a pending method reference.
#[derive(Debug, Clone)]
pub struct PendingMethodSpec {
    /// The instantiated method
    pub method: LocalRef,
    /// `GENERICINST` blob
    pub instantiation: Vec<u8>,
    /// `MethodSpec` token once defined
    pub resolved: Option<Token>,
}

/// All pending local references of a session.
#[derive(Debug, Clone, Default)]
pub struct LocalRefs {
    method_refs: Vec<PendingMemberRef>,
    field_refs: Vec<PendingMemberRef>,
    method_specs: Vec<PendingMethodSpec>,
    lookup: FxHashMap<(bool, ClassId, String, Vec<u8>), usize>,
}

impl LocalRefs {
    /// Number of pending method references
    #[must_use]
    pub fn method_ref_count(&self) -> usize {
        self.method_refs.len()
    }

    /// Number of pending field references
    #[must_use]
    pub fn field_ref_count(&self) -> usize {
        self.field_refs.len()
    }

    /// The pending reference behind `local`
    #[must_use]
    pub fn member(&self, local: LocalRef) -> Option<&PendingMemberRef> {
        match local {
            LocalRef::MethodRef(index) => self.method_refs.get(index),
            LocalRef::FieldRef(index) => self.field_refs.get(index),
            LocalRef::MethodSpec(_) => None,
        }
    }

    /// Final token of `local`, once resolved
    #[must_use]
    pub fn resolved(&self, local: LocalRef) -> Option<Token> {
        match local {
            LocalRef::MethodRef(index) => self.method_refs.get(index)?.resolved,
            LocalRef::FieldRef(index) => self.field_refs.get(index)?.resolved,
            LocalRef::MethodSpec(index) => self.method_specs.get(index)?.resolved,
        }
    }

    fn intern(&mut self, is_field: bool, class: ClassId, name: &str, signature: Vec<u8>) -> LocalRef {
        let key = (is_field, class, name.to_string(), signature);
        let list = if is_field {
            &mut self.field_refs
        } else {
            &mut self.method_refs
        };
        let index = *self.lookup.entry(key).or_insert_with_key(|(_, class, name, signature)| {
            list.push(PendingMemberRef {
                class: *class,
                name: name.clone(),
                signature: signature.clone(),
                resolved: None,
                failed: false,
            });
            list.len() - 1
        });
        if is_field {
            LocalRef::FieldRef(index)
        } else {
            LocalRef::MethodRef(index)
        }
    }
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Reference to the member `name` of `parent`.
    ///
    /// `parent` is a class of this unit (its provisional `TypeDef` token), [`Token::MODULE`]
    /// or [`Token::NIL`] for globals, or any external type, type spec or module reference.
    /// Field and method references are told apart by the signature.
    ///
    /// # Errors
    /// Returns an error for globals of other assemblies or if the emitter rejects the
    /// reference.
    pub fn member_ref(&mut self, parent: Token, name: &str, signature: Vec<u8>) -> Result<TokenRef> {
        self.check_name_length(name)?;

        let local_class = if parent.is_null() || parent == Token::MODULE {
            Some(MODULE_CLASS)
        } else {
            self.classes.id_of(parent)
        };
        if let Some(class) = local_class {
            let is_field = is_field_signature(&signature);
            let local = self.refs.intern(is_field, class, name, signature);
            return Ok(TokenRef::Pending(local));
        }

        if parent.is_table(TableId::AssemblyRef) {
            self.report(Error::UndefinedReference(format!(
                "Cross-assembly global references are not supported ('{name}')"
            )))?;
            return Ok(TokenRef::Final(Token::NIL));
        }

        let token = self.emitter.define_member_ref(parent, name, &signature)?;
        Ok(TokenRef::Final(token))
    }

    /// Generic instantiation of `method`.
    ///
    /// Instantiations of pending local methods are defined once the method is resolved.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the instantiation.
    pub fn method_spec(&mut self, method: TokenRef, instantiation: Vec<u8>) -> Result<TokenRef> {
        match method {
            TokenRef::Final(parent) => {
                let token = self.emitter.define_method_spec(parent, &instantiation)?;
                Ok(TokenRef::Final(token))
            }
            TokenRef::Pending(local) => {
                self.refs.method_specs.push(PendingMethodSpec {
                    method: local,
                    instantiation,
                    resolved: None,
                });
                Ok(TokenRef::Pending(LocalRef::MethodSpec(
                    self.refs.method_specs.len() - 1,
                )))
            }
        }
    }

    /// The final token behind `reference`, if it is known yet.
    #[must_use]
    pub fn resolve(&self, reference: TokenRef) -> Option<Token> {
        match reference {
            TokenRef::Final(token) => Some(token),
            TokenRef::Pending(local) => self.refs.resolved(local),
        }
    }

    /// Matches every outstanding local reference against the emitted members.
    ///
    /// Resolved references are skipped, so running this again performs no emitter calls.
    /// A vararg call site is matched with its fixed part and becomes a `MemberRef` of the
    /// definition carrying the full call-site signature. Unmatched references are deferred
    /// as [`Error::UnresolvedMember`] to the end of the phase.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects a vararg reference or method spec.
    pub fn resolve_local_member_refs(&mut self) -> Result<()> {
        let mut resolved = 0;

        for index in 0..self.refs.method_refs.len() {
            let pending = &self.refs.method_refs[index];
            if pending.resolved.is_some() || pending.failed {
                continue;
            }
            let (class, name, signature) = (pending.class, pending.name.clone(), pending.signature.clone());

            let fixed = normalize_vararg(&signature)?;
            let lookup = fixed.as_deref().unwrap_or(&signature);
            let Some(definition) = self.find_method(class, &name, lookup) else {
                self.refs.method_refs[index].failed = true;
                self.defer(Error::UnresolvedMember {
                    class: self.classes.name(class).to_string(),
                    name,
                });
                continue;
            };

            let token = if fixed.is_some() {
                let result = self.emitter.define_member_ref(definition, &name, &signature);
                match self.recover(result)? {
                    Some(token) => token,
                    None => {
                        self.refs.method_refs[index].failed = true;
                        continue;
                    }
                }
            } else {
                definition
            };
            self.refs.method_refs[index].resolved = Some(token);
            resolved += 1;
        }

        for index in 0..self.refs.field_refs.len() {
            let pending = &self.refs.field_refs[index];
            if pending.resolved.is_some() || pending.failed {
                continue;
            }
            let (class, name) = (pending.class, pending.name.clone());
            let token = self.classes.get(class).and_then(|owner| {
                owner
                    .fields
                    .iter()
                    .find(|field| field.name == name && field.signature == pending.signature)
                    .map(|field| field.token)
                    .filter(|token| !token.is_null())
            });
            match token {
                Some(token) => {
                    self.refs.field_refs[index].resolved = Some(token);
                    resolved += 1;
                }
                None => {
                    self.refs.field_refs[index].failed = true;
                    self.defer(Error::UnresolvedMember {
                        class: self.classes.name(class).to_string(),
                        name,
                    });
                }
            }
        }

        for index in 0..self.refs.method_specs.len() {
            let spec = &self.refs.method_specs[index];
            if spec.resolved.is_some() {
                continue;
            }
            // An unresolved parent was reported with the parent
            let Some(parent) = self.refs.resolved(spec.method) else {
                continue;
            };
            let instantiation = spec.instantiation.clone();
            let result = self.emitter.define_method_spec(parent, &instantiation);
            if let Some(token) = self.recover(result)? {
                self.refs.method_specs[index].resolved = Some(token);
                resolved += 1;
            }
        }

        if resolved > 0 {
            log::debug!("{resolved} local reference(s) resolved");
        }
        Ok(())
    }

    fn find_method(&self, class: ClassId, name: &str, signature: &[u8]) -> Option<Token> {
        let owner = self.classes.get(class)?;
        owner
            .methods
            .iter()
            .filter_map(|&id| self.methods.get(id))
            .find(|method| method.name == name && method.signature == signature)
            .map(|method| method.token)
            .filter(|token| !token.is_null())
    }

    /// Writes the resolved tokens into the pending reference slots of every new body.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if a recorded slot lies outside its body.
    pub(crate) fn do_local_member_ref_fixups(&mut self) -> Result<()> {
        let Self { methods, refs, .. } = self;
        for method in methods.iter_mut().filter(|method| method.has_new_body) {
            let Some(body) = method.body.as_mut() else {
                continue;
            };
            let header_size = body.header_size;
            for fixup in std::mem::take(&mut body.member_ref_fixups) {
                let Some(token) = refs.resolved(fixup.local) else {
                    continue;
                };
                let start = header_size + fixup.offset as usize;
                let slot = body.bytes.get_mut(start..start + 4).ok_or(Error::OutOfBounds)?;
                write_le(slot, token.value())?;
            }
        }
        Ok(())
    }
}
