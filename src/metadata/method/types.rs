//! Method body header and data section flags.
//!
//! # Key Types
//! - [`MethodBodyFlags`]: Flags of the tiny and fat method header
//! - [`SectionFlags`]: Flags of the extra data sections following the code

use bitflags::bitflags;

/// Largest code size a tiny header can describe (6 bits)
pub const TINY_CODE_SIZE_LIMIT: u32 = 64;

/// Max stack implied by a tiny header
pub const TINY_MAX_STACK: u16 = 8;

/// Size of a fat header in bytes
pub const FAT_HEADER_SIZE: usize = 12;

/// Size of a fat header in 4-byte units, stored in the upper nibble of the flags word
pub const FAT_HEADER_DWORDS: u16 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body can have
    pub struct MethodBodyFlags: u16 {
        /// Tiny method header format
        const TINY_FORMAT = 0x2;
        /// Fat method header format
        const FAT_FORMAT = 0x3;
        /// Flag of the fat method header, showing that there are more data sections appended to the header
        const MORE_SECTS = 0x8;
        /// Flag to indicate that this method should call the default constructor on all local variables
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags that a method body section can have
    pub struct SectionFlags: u8 {
        /// Indicates that this section contains exception handling data
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// Indicates that the data section format is far
        const FAT_FORMAT = 0x40;
        /// Indicates that the data section is followed by another one
        const MORE_SECTS = 0x80;
    }
}
