//! Encoding and decoding of CIL method bodies.
//!
//! A method body is a header (tiny or fat), the code, and optionally a 4-byte aligned
//! exception handling section. [`encode_body`] produces the exact bytes that end up in
//! the IL section; [`MethodBody::from`] parses them back, which the assembler uses to
//! verify what it wrote and which the tests use to inspect results.
//!
//! # Examples
//!
//! ```rust
//! use dotasm::metadata::method::{encode_body, BodyLayout, MethodBody};
//!
//! let layout = BodyLayout { max_stack: 8, ..BodyLayout::default() };
//! let encoded = encode_body(&layout, &[0x2A], &[], true);
//! assert!(!encoded.is_fat);
//!
//! let parsed = MethodBody::from(&encoded.bytes)?;
//! assert_eq!(parsed.size_code, 1);
//! # Ok::<(), dotasm::Error>(())
//! ```
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Method Header Format

use crate::{
    metadata::{
        method::{
            ExceptionHandler, ExceptionHandlerFlags, MethodBodyFlags, SectionFlags,
            FAT_HEADER_DWORDS, FAT_HEADER_SIZE, TINY_CODE_SIZE_LIMIT, TINY_MAX_STACK,
        },
        token::Token,
    },
    utils::{align_up, push_le, read_le, read_le_at},
    Error::OutOfBounds,
    Result,
};

/// Size of one clause in the small EH section format
const SMALL_CLAUSE_SIZE: usize = 12;
/// Size of one clause in the fat EH section format
const FAT_CLAUSE_SIZE: usize = 24;

/// Describes one method that has been compiled to CIL bytecode.
///
/// The `MethodBody` struct represents the parsed body of a method, including header information,
/// code size, stack requirements, local variable signature, and exception handling regions.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Size of the method (length of all instructions, not counting the header) in bytes
    pub size_code: usize,
    /// Size of the method header in bytes
    pub size_header: usize,
    /// `MetaData` token for a signature describing the layout of the local variables for the method. 0 == no local variables
    pub local_var_sig_token: u32,
    /// Maximum number of items on the operand stack
    pub max_stack: usize,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
    /// Flag, indicating to call default constructor on all local variables
    pub is_init_local: bool,
    /// Flag, indicating if this method does have exception handlers
    pub is_exception_data: bool,
    /// A list of exception handlers this method has
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a `MethodBody` object from a sequence of bytes.
    ///
    /// # Arguments
    /// * `data` - The byte slice from which this object shall be created
    ///
    /// # Errors
    /// Returns an error if the data is empty, out of bounds, or malformed.
    pub fn from(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_00000011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    local_var_sig_token: 0,
                    max_stack: usize::from(TINY_MAX_STACK),
                    is_fat: false,
                    is_init_local: false,
                    is_exception_data: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < FAT_HEADER_SIZE {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;

                let size_header = (first_duo >> 12) * 4;
                let size_code = read_le::<u32>(&data[4..])?;
                if data.len() < (size_code as usize + size_header as usize) {
                    return Err(OutOfBounds);
                }

                let local_var_sig_token = read_le::<u32>(&data[8..])?;
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000111111111111_u16);
                let max_stack = read_le::<u16>(&data[2..])? as usize;

                let is_init_local = flags_header.contains(MethodBodyFlags::INIT_LOCALS);

                // Exception Handling -> II.25.4.6
                let mut exception_handlers = Vec::new();
                if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    let mut cursor = align_up(size_header as usize + size_code as usize, 4);

                    while data.len() >= (cursor + 4) {
                        let section_flags =
                            SectionFlags::from_bits_truncate(read_le::<u8>(&data[cursor..])?);
                        if !section_flags.contains(SectionFlags::EHTABLE) {
                            break;
                        }

                        if section_flags.contains(SectionFlags::FAT_FORMAT) {
                            let section_size = (u32::from(data[cursor + 1])
                                | (u32::from(data[cursor + 2]) << 8)
                                | (u32::from(data[cursor + 3]) << 16))
                                as usize;
                            if section_size < 4 || data.len() < (cursor + section_size) {
                                break;
                            }

                            cursor += 4;
                            for _ in 0..(section_size - 4) / FAT_CLAUSE_SIZE {
                                #[allow(clippy::cast_possible_truncation)]
                                let flags = ExceptionHandlerFlags::from_bits_truncate(
                                    read_le_at::<u32>(data, &mut cursor)? as u16,
                                );
                                let try_offset = read_le_at::<u32>(data, &mut cursor)?;
                                let try_length = read_le_at::<u32>(data, &mut cursor)?;
                                let handler_offset = read_le_at::<u32>(data, &mut cursor)?;
                                let handler_length = read_le_at::<u32>(data, &mut cursor)?;
                                let last = read_le_at::<u32>(data, &mut cursor)?;
                                exception_handlers.push(clause(
                                    flags,
                                    [try_offset, try_length, handler_offset, handler_length],
                                    last,
                                ));
                            }
                        } else {
                            let section_size = usize::from(read_le::<u8>(&data[cursor + 1..])?);
                            if section_size < 4 || data.len() < (cursor + section_size) {
                                break;
                            }

                            cursor += 4;
                            for _ in 0..(section_size - 4) / SMALL_CLAUSE_SIZE {
                                let flags = ExceptionHandlerFlags::from_bits_truncate(
                                    read_le_at::<u16>(data, &mut cursor)?,
                                );
                                let try_offset = u32::from(read_le_at::<u16>(data, &mut cursor)?);
                                let try_length = u32::from(read_le_at::<u8>(data, &mut cursor)?);
                                let handler_offset =
                                    u32::from(read_le_at::<u16>(data, &mut cursor)?);
                                let handler_length =
                                    u32::from(read_le_at::<u8>(data, &mut cursor)?);
                                let last = read_le_at::<u32>(data, &mut cursor)?;
                                exception_handlers.push(clause(
                                    flags,
                                    [try_offset, try_length, handler_offset, handler_length],
                                    last,
                                ));
                            }
                        }

                        if !section_flags.contains(SectionFlags::MORE_SECTS) {
                            break;
                        }
                    }
                }

                Ok(MethodBody {
                    size_code: size_code as usize,
                    size_header: size_header as usize,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local,
                    is_exception_data: !exception_handlers.is_empty(),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Get the full size of this method
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_code + self.size_header
    }
}

fn clause(flags: ExceptionHandlerFlags, ranges: [u32; 4], last: u32) -> ExceptionHandler {
    let is_filter = flags.contains(ExceptionHandlerFlags::FILTER);
    ExceptionHandler {
        flags,
        try_offset: ranges[0],
        try_length: ranges[1],
        handler_offset: ranges[2],
        handler_length: ranges[3],
        class_token: if is_filter || !flags.is_empty() {
            Token::NIL
        } else {
            Token(last)
        },
        filter_offset: if is_filter { last } else { 0 },
    }
}

/// The header-relevant properties of a method about to be encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyLayout {
    /// Declared maximum stack depth
    pub max_stack: u16,
    /// Local variable signature token, [`Token::NIL`] when the method has no locals
    pub local_var_sig: Token,
    /// Zero-initialize locals
    pub init_locals: bool,
}

/// An encoded method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    /// Header, code, padding and EH section
    pub bytes: Vec<u8>,
    /// Size of the header (1 or 12)
    pub header_size: usize,
    /// True if a fat header was selected
    pub is_fat: bool,
}

impl EncodedBody {
    /// Alignment the body requires in the IL section
    #[must_use]
    pub fn alignment(&self) -> usize {
        if self.is_fat {
            4
        } else {
            1
        }
    }
}

/// Decides whether a body can use the one byte tiny header.
///
/// A tiny header implies a max stack of 8, no locals, no extra sections and no
/// zero-initialization, and can describe at most 63 bytes of code. With
/// `preserve_max_stack` a declared max stack below 8 also selects the fat header
/// so that the declared value survives.
#[must_use]
pub fn is_tiny(layout: &BodyLayout, code_size: usize, has_sections: bool, preserve_max_stack: bool) -> bool {
    code_size < TINY_CODE_SIZE_LIMIT as usize
        && layout.max_stack <= TINY_MAX_STACK
        && !(preserve_max_stack && layout.max_stack < TINY_MAX_STACK)
        && layout.local_var_sig.is_null()
        && !layout.init_locals
        && !has_sections
}

/// Encodes the EH section for `handlers`, choosing the small format when every clause fits.
#[must_use]
pub fn encode_exception_section(handlers: &[ExceptionHandler]) -> Vec<u8> {
    let small_size = 4 + handlers.len() * SMALL_CLAUSE_SIZE;
    let small = small_size <= 0xFF && handlers.iter().all(ExceptionHandler::fits_small);

    let mut section = Vec::new();
    if small {
        section.push(SectionFlags::EHTABLE.bits());
        section.push(small_size as u8);
        push_le(&mut section, 0u16);
        for handler in handlers {
            push_le(&mut section, handler.flags.bits());
            push_le(&mut section, handler.try_offset as u16);
            section.push(handler.try_length as u8);
            push_le(&mut section, handler.handler_offset as u16);
            section.push(handler.handler_length as u8);
            push_le(&mut section, handler.class_or_filter());
        }
    } else {
        let fat_size = 4 + handlers.len() * FAT_CLAUSE_SIZE;
        section.push((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits());
        section.push(fat_size as u8);
        section.push((fat_size >> 8) as u8);
        section.push((fat_size >> 16) as u8);
        for handler in handlers {
            push_le(&mut section, u32::from(handler.flags.bits()));
            push_le(&mut section, handler.try_offset);
            push_le(&mut section, handler.try_length);
            push_le(&mut section, handler.handler_offset);
            push_le(&mut section, handler.handler_length);
            push_le(&mut section, handler.class_or_filter());
        }
    }
    section
}

/// Encodes header, code and exception handling section of one method.
#[must_use]
pub fn encode_body(
    layout: &BodyLayout,
    code: &[u8],
    handlers: &[ExceptionHandler],
    preserve_max_stack: bool,
) -> EncodedBody {
    let has_sections = !handlers.is_empty();
    if is_tiny(layout, code.len(), has_sections, preserve_max_stack) {
        let mut bytes = Vec::with_capacity(code.len() + 1);
        bytes.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        bytes.extend_from_slice(code);
        return EncodedBody {
            bytes,
            header_size: 1,
            is_fat: false,
        };
    }

    let mut flags = MethodBodyFlags::FAT_FORMAT;
    if has_sections {
        flags |= MethodBodyFlags::MORE_SECTS;
    }
    if layout.init_locals {
        flags |= MethodBodyFlags::INIT_LOCALS;
    }

    let mut bytes = Vec::with_capacity(FAT_HEADER_SIZE + code.len());
    push_le(&mut bytes, flags.bits() | (FAT_HEADER_DWORDS << 12));
    push_le(&mut bytes, layout.max_stack);
    push_le(&mut bytes, code.len() as u32);
    push_le(&mut bytes, layout.local_var_sig.value());
    bytes.extend_from_slice(code);

    if has_sections {
        bytes.resize(align_up(bytes.len(), 4), 0);
        bytes.extend_from_slice(&encode_exception_section(handlers));
    }

    EncodedBody {
        bytes,
        header_size: FAT_HEADER_SIZE,
        is_fat: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finally(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> ExceptionHandler {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            class_token: Token::NIL,
            filter_offset: 0,
        }
    }

    #[test]
    fn tiny() {
        let layout = BodyLayout {
            max_stack: 8,
            ..BodyLayout::default()
        };
        let encoded = encode_body(&layout, &[0x00, 0x2A], &[], true);
        assert_eq!(encoded.bytes, vec![0x0A, 0x00, 0x2A]);
        assert_eq!(encoded.alignment(), 1);

        let method_header = MethodBody::from(&encoded.bytes).unwrap();
        assert!(!method_header.is_fat);
        assert!(!method_header.is_exception_data);
        assert_eq!(method_header.max_stack, 8);
        assert_eq!(method_header.size_code, 2);
        assert_eq!(method_header.size_header, 1);
        assert_eq!(method_header.size(), 3);
    }

    #[test]
    fn small_max_stack_selects_fat() {
        let layout = BodyLayout {
            max_stack: 2,
            ..BodyLayout::default()
        };
        let encoded = encode_body(&layout, &[0x2A], &[], true);
        assert!(encoded.is_fat);
        let parsed = MethodBody::from(&encoded.bytes).unwrap();
        assert_eq!(parsed.max_stack, 2);
        assert!(!parsed.is_init_local);

        let relaxed = encode_body(&layout, &[0x2A], &[], false);
        assert!(!relaxed.is_fat);
    }

    #[test]
    fn fat() {
        let layout = BodyLayout {
            max_stack: 5,
            local_var_sig: Token(0x11000059),
            init_locals: true,
        };
        let code = vec![0x00; 0x9B];
        let encoded = encode_body(&layout, &code, &[], true);
        assert_eq!(encoded.header_size, 12);
        assert_eq!(encoded.alignment(), 4);

        let method_header = MethodBody::from(&encoded.bytes).unwrap();
        assert!(method_header.is_fat);
        assert!(!method_header.is_exception_data);
        assert!(method_header.is_init_local);
        assert_eq!(method_header.max_stack, 5);
        assert_eq!(method_header.size_code, 0x9B);
        assert_eq!(method_header.size_header, 12);
        assert_eq!(method_header.size(), 167);
        assert_eq!(method_header.local_var_sig_token, 0x11000059);
    }

    #[test]
    fn large_code_selects_fat() {
        let layout = BodyLayout {
            max_stack: 8,
            ..BodyLayout::default()
        };
        assert!(!encode_body(&layout, &[0x00; 63], &[], true).is_fat);
        assert!(encode_body(&layout, &[0x00; 64], &[], true).is_fat);
    }

    #[test]
    fn fat_exceptions_small_section() {
        let layout = BodyLayout {
            max_stack: 3,
            local_var_sig: Token(0x1100001A),
            init_locals: true,
        };
        let code = vec![0x00; 0x2E];
        let encoded = encode_body(&layout, &code, &[finally(0x8, 0x1B, 0x23, 0xA)], true);

        // 12 header + 0x2E code, padded to 0x3C, + 4 + 12
        assert_eq!(encoded.bytes.len(), 0x3C + 16);
        assert_eq!(encoded.bytes[0x3C], SectionFlags::EHTABLE.bits());
        assert_eq!(encoded.bytes[0x3D], 16);

        let method_header = MethodBody::from(&encoded.bytes).unwrap();
        assert!(method_header.is_exception_data);
        assert_eq!(method_header.local_var_sig_token, 0x1100001A);
        assert_eq!(method_header.exception_handlers.len(), 1);
        let handler = &method_header.exception_handlers[0];
        assert!(handler.flags.contains(ExceptionHandlerFlags::FINALLY));
        assert_eq!(handler.try_offset, 0x8);
        assert_eq!(handler.try_length, 0x1B);
        assert_eq!(handler.handler_offset, 0x23);
        assert_eq!(handler.handler_length, 0xA);
    }

    #[test]
    fn fat_exceptions_fat_section() {
        let layout = BodyLayout {
            max_stack: 5,
            ..BodyLayout::default()
        };
        let code = vec![0x00; 0x19F];
        let handlers = [finally(0x145, 0x28, 0x16D, 0xE), finally(0x9, 0x18A, 0x193, 0xA)];
        let encoded = encode_body(&layout, &code, &handlers, true);
        let section_start = align_up(12 + 0x19F, 4);
        assert_eq!(
            encoded.bytes[section_start],
            (SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits()
        );

        let method_header = MethodBody::from(&encoded.bytes).unwrap();
        assert_eq!(method_header.exception_handlers.len(), 2);
        assert_eq!(method_header.exception_handlers[1].try_offset, 0x9);
        assert_eq!(method_header.exception_handlers[1].try_length, 0x18A);
        assert_eq!(method_header.exception_handlers[1].handler_offset, 0x193);
    }

    #[test]
    fn typed_and_filter_clauses() {
        let handlers = [
            ExceptionHandler {
                flags: ExceptionHandlerFlags::EXCEPTION,
                try_offset: 0,
                try_length: 4,
                handler_offset: 4,
                handler_length: 2,
                class_token: Token(0x01000007),
                filter_offset: 0,
            },
            ExceptionHandler {
                flags: ExceptionHandlerFlags::FILTER,
                try_offset: 0,
                try_length: 4,
                handler_offset: 10,
                handler_length: 2,
                class_token: Token::NIL,
                filter_offset: 6,
            },
        ];
        let section = encode_exception_section(&handlers);
        assert_eq!(section.len(), 4 + 24);
        assert_eq!(read_le::<u32>(&section[12..]).unwrap(), 0x01000007);
        assert_eq!(read_le::<u32>(&section[24..]).unwrap(), 6);

        let layout = BodyLayout {
            max_stack: 8,
            ..BodyLayout::default()
        };
        let body = encode_body(&layout, &[0x00; 12], &handlers, true);
        let parsed = MethodBody::from(&body.bytes).unwrap();
        assert_eq!(parsed.exception_handlers, handlers.to_vec());
    }

    #[test]
    fn invalid() {
        assert!(MethodBody::from(&[]).is_err());
        assert!(MethodBody::from(&[0x01]).is_err());
        assert!(MethodBody::from(&[0x0A]).is_err());
        assert!(MethodBody::from(&[0x03, 0x30, 0x08]).is_err());
    }
}
