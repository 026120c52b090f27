//! Type specification cache.
//!
//! Encoded type signatures handed to [`crate::emitter::MetadataEmitter::get_token_from_type_spec`]
//! are cached by exact bytes, so repeated uses of `class List<int32>` share one `TypeSpec`
//! row. The key orders by hash, then length, then bytes: lookups mostly compare two integers.
//!
//! While a generic parameter referenced by name is still waiting for its position, the
//! signature bytes are not final and the cache is bypassed.

use std::collections::BTreeMap;

use crate::{
    assembler::{members::GenericOwner, Assembler},
    emitter::{MetadataEmitter, SectionAllocator},
    metadata::token::Token,
    utils::hash_blob,
    Error, Result,
};

/// Cache key of an encoded type signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeSpecKey {
    hash: u64,
    len: usize,
    bytes: Vec<u8>,
}

impl TypeSpecKey {
    /// Builds the key of `signature`.
    #[must_use]
    pub fn new(signature: &[u8]) -> Self {
        TypeSpecKey {
            hash: hash_blob(signature),
            len: signature.len(),
            bytes: signature.to_vec(),
        }
    }
}

/// Encoded type signature to `TypeSpec` token.
#[derive(Debug, Clone, Default)]
pub struct TypeSpecCache {
    entries: BTreeMap<TypeSpecKey, Token>,
    pending_fixups: usize,
}

impl TypeSpecCache {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached token of `signature`
    #[must_use]
    pub fn get(&self, signature: &[u8]) -> Option<Token> {
        if self.is_bypassed() {
            return None;
        }
        self.entries.get(&TypeSpecKey::new(signature)).copied()
    }

    /// Caches the token of `signature`, unless the cache is bypassed.
    pub fn insert(&mut self, signature: &[u8], token: Token) {
        if !self.is_bypassed() {
            self.entries.insert(TypeSpecKey::new(signature), token);
        }
    }

    /// Returns true while generic parameter fixups are pending
    #[must_use]
    pub fn is_bypassed(&self) -> bool {
        self.pending_fixups > 0
    }

    /// Number of cached signatures
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Returns the `TypeSpec` token of an encoded type, reusing a cached token for
    /// byte-identical signatures.
    ///
    /// # Errors
    /// Returns an error if the emitter rejects the signature.
    pub fn type_spec(&mut self, signature: &[u8]) -> Result<Token> {
        if let Some(token) = self.typespecs.get(signature) {
            return Ok(token);
        }
        let token = self.emitter.get_token_from_type_spec(signature)?;
        self.typespecs.insert(signature, token);
        Ok(token)
    }

    /// Records that a signature under construction names a generic parameter whose
    /// position is not known yet.
    ///
    /// Type specs are not cached until the next class or method header settles the
    /// generic parameter list.
    pub fn defer_type_param_fixup(&mut self) {
        self.typespecs.pending_fixups += 1;
    }

    pub(crate) fn settle_type_param_fixups(&mut self) {
        if self.typespecs.pending_fixups > 0 {
            log::debug!(
                "{} generic parameter fixup(s) settled",
                self.typespecs.pending_fixups
            );
        }
        self.typespecs.pending_fixups = 0;
    }

    /// Position of the generic parameter `name` of the current method (`!!name`) or the
    /// current class (`!name`).
    ///
    /// # Errors
    /// Returns [`Error::UndefinedGenericParam`] if no such parameter exists.
    pub fn type_param_index(&mut self, name: &str, method_level: bool) -> Result<u32> {
        let index = match self.generic_owner(method_level) {
            Some(GenericOwner::Method(id)) => self
                .methods
                .get(id)
                .and_then(|method| method.generic_param_index(name)),
            Some(GenericOwner::Class(id)) => self
                .classes
                .get(id)
                .and_then(|class| class.generic_param_index(name)),
            None => None,
        };
        match index {
            Some(index) => Ok(index as u32),
            None => {
                self.report(Error::UndefinedGenericParam(name.to_string()))?;
                Ok(0)
            }
        }
    }

    pub(crate) fn generic_owner(&self, method_level: bool) -> Option<GenericOwner> {
        if method_level {
            self.current.as_ref().map(|builder| GenericOwner::Method(builder.id))
        } else {
            self.class_stack.last().map(|&id| GenericOwner::Class(id))
        }
    }
}
