//! Signature blob helpers.
//!
//! The parser hands the assembler fully encoded signature blobs. The assembler only
//! needs to look inside them in a few places: telling field signatures from method
//! signatures, rejecting `void` fields and locals, adjusting the `HASTHIS` bit, and
//! normalizing vararg call-site signatures so they can be matched against the
//! definition. This module provides those walkers plus [`SignatureBuilder`], a small
//! growable blob buffer used to synthesize local variable signatures and
//! security/constant blobs.
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 23.2 - Blobs and signatures

use crate::{
    metadata::{
        flags::SIGNATURE_HEADER,
        token::{TableId, Token},
    },
    Error, Result,
};

#[allow(non_snake_case, dead_code, missing_docs)]
/// Possible bytes that represent various 'Types' for a signature - from coreclr
pub mod ELEMENT_TYPE {
    //Marks end of a list
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    // Followed by type
    pub const PTR: u8 = 0x0f;
    // Followed by type
    pub const BYREF: u8 = 0x10;
    // Followed by TypeDef or TypeRef token
    pub const VALUETYPE: u8 = 0x11;
    // Followed by TypeDef or TypeRef token
    pub const CLASS: u8 = 0x12;
    // Generic parameter in a generic type definition, represented as number
    pub const VAR: u8 = 0x13;
    // type rank boundsCount bound1 … loCount lo1 …
    pub const ARRAY: u8 = 0x14;
    // Generic type instantiation. Followed by type type-arg-count type-1 ... type-n
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    // System.IntPtr
    pub const I: u8 = 0x18;
    // System.UIntPtr
    pub const U: u8 = 0x19;
    // Followed by full method signature
    pub const FNPTR: u8 = 0x1b;
    // System.Object
    pub const OBJECT: u8 = 0x1c;
    // Single-dim array with 0 lower bound
    pub const SZARRAY: u8 = 0x1d;
    // Generic parameter in a generic method definition,represented as number
    pub const MVAR: u8 = 0x1e;
    // Required modifier : followed by a TypeDef or TypeRef token
    pub const CMOD_REQD: u8 = 0x1f;
    // Optional modifier : followed by a TypeDef or TypeRef token
    pub const CMOD_OPT: u8 = 0x20;
    // Sentinel for vararg method signature
    pub const SENTINEL: u8 = 0x41;
    // Denotes a local variable that points at a pinned object
    pub const PINNED: u8 = 0x45;
}

/// Appends a compressed unsigned integer as defined in ECMA-335 II.23.2.
///
/// Values above `0x1FFF_FFFF` cannot be represented; they are clamped into the
/// four byte form.
pub fn write_compressed_uint(value: u32, buffer: &mut Vec<u8>) {
    if value < 0x80 {
        buffer.push(value as u8);
    } else if value < 0x4000 {
        buffer.push(0x80 | (value >> 8) as u8);
        buffer.push(value as u8);
    } else {
        let value = value & 0x1FFF_FFFF;
        buffer.push(0xC0 | (value >> 24) as u8);
        buffer.push((value >> 16) as u8);
        buffer.push((value >> 8) as u8);
        buffer.push(value as u8);
    }
}

/// Reads a compressed unsigned integer at `offset` and advances the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
/// [`crate::Error::Malformed`] for an invalid leading byte.
pub fn read_compressed_uint(data: &[u8], offset: &mut usize) -> Result<u32> {
    let first_byte = *data.get(*offset).ok_or(Error::OutOfBounds)?;

    // 1-byte encoding: 0xxxxxxx
    if (first_byte & 0x80) == 0 {
        *offset += 1;
        return Ok(u32::from(first_byte));
    }

    // 2-byte encoding: 10xxxxxx xxxxxxxx
    if (first_byte & 0xC0) == 0x80 {
        let second = *data.get(*offset + 1).ok_or(Error::OutOfBounds)?;
        *offset += 2;
        return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second));
    }

    // 4-byte encoding: 11xxxxxx xxxxxxxx xxxxxxxx xxxxxxxx
    if (first_byte & 0xE0) == 0xC0 {
        let rest = data.get(*offset + 1..*offset + 4).ok_or(Error::OutOfBounds)?;
        *offset += 4;
        return Ok(((u32::from(first_byte) & 0x1F) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]));
    }

    Err(malformed_error!("Invalid compressed uint - {}", first_byte))
}

/// Encodes a token as a TypeDefOrRef coded index according to ECMA-335 §II.24.2.6.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the token's table is not TypeDef, TypeRef or TypeSpec.
pub fn encode_type_def_or_ref(token: Token) -> Result<u32> {
    let rid = token.row();
    match token.table() {
        0x02 => Ok(rid << 2),       // TypeDef
        0x01 => Ok((rid << 2) | 1), // TypeRef
        0x1B => Ok((rid << 2) | 2), // TypeSpec
        table => Err(malformed_error!(
            "Invalid token table 0x{:02X} for TypeDefOrRef coded index - {}",
            table,
            token
        )),
    }
}

/// A growable byte buffer for building signature and attribute blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureBuilder {
    data: Vec<u8>,
}

impl SignatureBuilder {
    /// Creates an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one raw byte
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Appends raw bytes
    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.data.extend_from_slice(value);
        self
    }

    /// Appends a compressed unsigned integer
    pub fn compressed(&mut self, value: u32) -> &mut Self {
        write_compressed_uint(value, &mut self.data);
        self
    }

    /// Appends a `CLASS` or `VALUETYPE` element followed by the coded type token
    ///
    /// # Errors
    /// Returns an error if `token` is not a TypeDef, TypeRef or TypeSpec token.
    pub fn class(&mut self, token: Token, is_value_type: bool) -> Result<&mut Self> {
        self.data.push(if is_value_type {
            ELEMENT_TYPE::VALUETYPE
        } else {
            ELEMENT_TYPE::CLASS
        });
        let coded = encode_type_def_or_ref(token)?;
        write_compressed_uint(coded, &mut self.data);
        Ok(self)
    }

    /// Appends a length-prefixed UTF-8 string (custom attribute and security blob format)
    pub fn serialized_string(&mut self, value: &str) -> &mut Self {
        write_compressed_uint(value.len() as u32, &mut self.data);
        self.data.extend_from_slice(value.as_bytes());
        self
    }

    /// Current length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing was written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the encoded bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the builder, returning the encoded bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Skips one encoded type starting at `offset`, including custom modifiers and `PINNED`.
///
/// # Errors
/// Returns an error for truncated or malformed type encodings.
pub fn skip_type(sig: &[u8], offset: &mut usize) -> Result<()> {
    loop {
        let element = *sig.get(*offset).ok_or(Error::OutOfBounds)?;
        *offset += 1;

        match element {
            ELEMENT_TYPE::CMOD_REQD | ELEMENT_TYPE::CMOD_OPT => {
                read_compressed_uint(sig, offset)?;
            }
            ELEMENT_TYPE::PINNED => {}
            ELEMENT_TYPE::VOID..=ELEMENT_TYPE::STRING
            | ELEMENT_TYPE::TYPEDBYREF
            | ELEMENT_TYPE::I
            | ELEMENT_TYPE::U
            | ELEMENT_TYPE::OBJECT => return Ok(()),
            ELEMENT_TYPE::PTR | ELEMENT_TYPE::BYREF | ELEMENT_TYPE::SZARRAY => {}
            ELEMENT_TYPE::VALUETYPE | ELEMENT_TYPE::CLASS => {
                read_compressed_uint(sig, offset)?;
                return Ok(());
            }
            ELEMENT_TYPE::VAR | ELEMENT_TYPE::MVAR => {
                read_compressed_uint(sig, offset)?;
                return Ok(());
            }
            ELEMENT_TYPE::ARRAY => {
                skip_type(sig, offset)?;
                let _rank = read_compressed_uint(sig, offset)?;
                let sizes = read_compressed_uint(sig, offset)?;
                for _ in 0..sizes {
                    read_compressed_uint(sig, offset)?;
                }
                let bounds = read_compressed_uint(sig, offset)?;
                for _ in 0..bounds {
                    read_compressed_uint(sig, offset)?;
                }
                return Ok(());
            }
            ELEMENT_TYPE::GENERICINST => {
                skip_type(sig, offset)?;
                let count = read_compressed_uint(sig, offset)?;
                for _ in 0..count {
                    skip_type(sig, offset)?;
                }
                return Ok(());
            }
            ELEMENT_TYPE::FNPTR => {
                skip_method_signature(sig, offset)?;
                return Ok(());
            }
            other => {
                return Err(malformed_error!(
                    "Unsupported element type 0x{:02X} at signature offset {}",
                    other,
                    *offset - 1
                ))
            }
        }
    }
}

/// Returns the element type of the type starting at `offset`, skipping custom
/// modifiers and `PINNED`, without advancing the caller's offset.
///
/// # Errors
/// Returns an error for truncated signatures.
pub fn leading_element(sig: &[u8], offset: usize) -> Result<u8> {
    let mut cursor = offset;
    loop {
        let element = *sig.get(cursor).ok_or(Error::OutOfBounds)?;
        match element {
            ELEMENT_TYPE::CMOD_REQD | ELEMENT_TYPE::CMOD_OPT => {
                cursor += 1;
                read_compressed_uint(sig, &mut cursor)?;
            }
            ELEMENT_TYPE::PINNED => cursor += 1,
            _ => return Ok(element),
        }
    }
}

/// The header of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignatureHeader {
    /// Calling convention byte, including `HASTHIS`/`EXPLICITTHIS`/`GENERIC`
    pub convention: u8,
    /// Number of generic parameters (0 when not generic)
    pub generic_count: u32,
    /// Declared parameter count, including vararg parameters after the sentinel
    pub param_count: u32,
    /// Offset of the return type
    pub return_offset: usize,
}

impl MethodSignatureHeader {
    /// Returns true if the calling convention kind is `VARARG`
    #[must_use]
    pub fn is_vararg(&self) -> bool {
        self.convention & SIGNATURE_HEADER::KIND_MASK == SIGNATURE_HEADER::VARARG
    }

    /// Returns true if the signature describes an instance method
    #[must_use]
    pub fn has_this(&self) -> bool {
        self.convention & SIGNATURE_HEADER::HAS_THIS != 0
    }
}

/// Parses the header of a method signature.
///
/// # Errors
/// Returns an error for truncated signatures or field/local signatures.
pub fn parse_method_header(sig: &[u8]) -> Result<MethodSignatureHeader> {
    let convention = *sig.first().ok_or(Error::OutOfBounds)?;
    let kind = convention & SIGNATURE_HEADER::KIND_MASK;
    if kind == SIGNATURE_HEADER::FIELD || kind == SIGNATURE_HEADER::LOCAL_SIG {
        return Err(malformed_error!(
            "Expected a method signature, found calling convention 0x{:02X}",
            convention
        ));
    }

    let mut offset = 1;
    let generic_count = if convention & SIGNATURE_HEADER::GENERIC != 0 {
        read_compressed_uint(sig, &mut offset)?
    } else {
        0
    };
    let param_count = read_compressed_uint(sig, &mut offset)?;

    Ok(MethodSignatureHeader {
        convention,
        generic_count,
        param_count,
        return_offset: offset,
    })
}

fn skip_method_signature(sig: &[u8], offset: &mut usize) -> Result<()> {
    let header = parse_method_header(sig.get(*offset..).ok_or(Error::OutOfBounds)?)?;
    *offset += header.return_offset;
    skip_type(sig, offset)?;
    for _ in 0..header.param_count {
        if sig.get(*offset) == Some(&ELEMENT_TYPE::SENTINEL) {
            *offset += 1;
        }
        skip_type(sig, offset)?;
    }
    Ok(())
}

/// Returns true if the signature blob is a field signature.
#[must_use]
pub fn is_field_signature(sig: &[u8]) -> bool {
    sig.first()
        .is_some_and(|b| b & SIGNATURE_HEADER::KIND_MASK == SIGNATURE_HEADER::FIELD)
}

/// Returns true if a field signature declares a `void` field.
///
/// # Errors
/// Returns an error for truncated signatures.
pub fn is_void_field(sig: &[u8]) -> Result<bool> {
    Ok(leading_element(sig, 1)? == ELEMENT_TYPE::VOID)
}

/// Returns true if the encoded type (a local slot) is `void`.
///
/// # Errors
/// Returns an error for an empty type encoding.
pub fn is_void_type(ty: &[u8]) -> Result<bool> {
    Ok(leading_element(ty, 0)? == ELEMENT_TYPE::VOID)
}

/// Returns the vararg call-site signature reduced to its fixed part.
///
/// A vararg call site lists the fixed parameters, a `SENTINEL`, then the actual
/// trailing arguments. The definition only lists the fixed parameters, so the call
/// site is matched against its definition after dropping everything from the sentinel
/// on and resetting the parameter count. Returns `None` if the signature is not a
/// vararg signature carrying a sentinel.
///
/// # Errors
/// Returns an error for malformed method signatures.
pub fn normalize_vararg(sig: &[u8]) -> Result<Option<Vec<u8>>> {
    let header = parse_method_header(sig)?;
    if !header.is_vararg() {
        return Ok(None);
    }

    let mut offset = header.return_offset;
    skip_type(sig, &mut offset)?;
    let mut fixed_end = offset;
    let mut fixed_count = 0;
    let mut sentinel = false;
    for _ in 0..header.param_count {
        if sig.get(offset) == Some(&ELEMENT_TYPE::SENTINEL) {
            sentinel = true;
            break;
        }
        skip_type(sig, &mut offset)?;
        fixed_end = offset;
        fixed_count += 1;
    }

    if !sentinel {
        return Ok(None);
    }

    let mut normalized = Vec::with_capacity(sig.len());
    normalized.push(header.convention);
    if header.convention & SIGNATURE_HEADER::GENERIC != 0 {
        write_compressed_uint(header.generic_count, &mut normalized);
    }
    write_compressed_uint(fixed_count, &mut normalized);
    normalized.extend_from_slice(&sig[header.return_offset..fixed_end]);
    Ok(Some(normalized))
}

/// Sets or clears the `HASTHIS` and `EXPLICITTHIS` bits of a method signature.
pub fn set_has_this(sig: &mut [u8], has_this: bool) {
    if let Some(first) = sig.first_mut() {
        if has_this {
            *first |= SIGNATURE_HEADER::HAS_THIS;
        } else {
            *first &= !(SIGNATURE_HEADER::HAS_THIS | SIGNATURE_HEADER::EXPLICIT_THIS);
        }
    }
}

/// Builds a `LOCAL_SIG` blob from the encoded types of every slot.
#[must_use]
pub fn encode_local_signature(slots: &[&[u8]]) -> Vec<u8> {
    let mut builder = SignatureBuilder::new();
    builder
        .u8(SIGNATURE_HEADER::LOCAL_SIG)
        .compressed(slots.len() as u32);
    for slot in slots {
        builder.bytes(slot);
    }
    builder.into_bytes()
}

/// Decodes a TypeDefOrRef coded index back into a token.
///
/// # Errors
/// Returns an error for the reserved tag `3`.
pub fn decode_type_def_or_ref(coded: u32) -> Result<Token> {
    let row = coded >> 2;
    match coded & 0x3 {
        0 => Ok(Token::from_parts(TableId::TypeDef, row)),
        1 => Ok(Token::from_parts(TableId::TypeRef, row)),
        2 => Ok(Token::from_parts(TableId::TypeSpec, row)),
        _ => Err(malformed_error!("Invalid TypeDefOrRef tag in 0x{:X}", coded)),
    }
}
