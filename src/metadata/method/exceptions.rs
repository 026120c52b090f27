//! Exception handler clauses of an assembled method body.
//!
//! A clause is produced from an exception declaration once all labels of the
//! method are final, validated against the method's code, and encoded into the
//! small or fat EH section following the code.

use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        ///
        /// The `class_token` field contains the metadata token of the exception type
        /// that this handler catches.
        const EXCEPTION = 0x0000;

        /// An exception filter and handler clause.
        ///
        /// The filter block starts at `filter_offset` and ends with `endfilter`
        /// immediately before the handler.
        const FILTER = 0x0001;

        /// A finally clause.
        const FINALLY = 0x0002;

        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// Exception handler defining try/catch/finally blocks within a method.
///
/// # Layout in IL
///
/// ```text
/// try {
///     // try_offset -> try_offset + try_length
/// }
/// filter {
///     // filter_offset -> handler_offset (FILTER only, ends with endfilter)
/// }
/// catch / finally / fault {
///     // handler_offset -> handler_offset + handler_length
/// }
/// ```
///
/// # References
/// - ECMA-335 6th Edition, Partition II, Section 25.4.6 - Exception Handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of the code.
    pub try_offset: u32,
    /// Length in bytes of the try block.
    pub try_length: u32,
    /// Location of the handler for this try block.
    pub handler_offset: u32,
    /// Size of the handler code in bytes.
    pub handler_length: u32,
    /// If flags == EXCEPTION, then this type will handle the exception.
    pub class_token: Token,
    /// Offset in the code of the filter block, for filter clauses.
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// Returns true if this is a filter clause
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FILTER)
    }

    /// The last 4 bytes of the clause: the filter offset for filter clauses,
    /// the class token for typed clauses and 0 otherwise.
    #[must_use]
    pub fn class_or_filter(&self) -> u32 {
        if self.is_filter() {
            self.filter_offset
        } else if self.flags.is_empty() {
            self.class_token.value()
        } else {
            0
        }
    }

    /// Returns true if every field fits the 12-byte small clause encoding
    #[must_use]
    pub fn fits_small(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.handler_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_length <= 0xFF
    }

    /// Checks the clause against the code of its method.
    ///
    /// `filter_ends` holds the offsets directly after every `endfilter` of the method.
    /// Returns a description of the first violation found.
    #[must_use]
    pub fn check(&self, code_size: u32, filter_ends: &[u32]) -> Option<String> {
        let try_end = u64::from(self.try_offset) + u64::from(self.try_length);
        let handler_end = u64::from(self.handler_offset) + u64::from(self.handler_length);
        let code_size_wide = u64::from(code_size);

        if try_end > code_size_wide {
            return Some(format!(
                "try block [0x{:X}, 0x{:X}) exceeds code size 0x{:X}",
                self.try_offset, try_end, code_size
            ));
        }
        if handler_end > code_size_wide {
            return Some(format!(
                "handler block [0x{:X}, 0x{:X}) exceeds code size 0x{:X}",
                self.handler_offset, handler_end, code_size
            ));
        }

        let in_try = |offset: u32| {
            offset >= self.try_offset && u64::from(offset) < try_end
        };
        let in_handler = |offset: u32| {
            offset >= self.handler_offset && u64::from(offset) < handler_end
        };

        if self.is_filter() {
            if self.filter_offset >= code_size {
                return Some(format!(
                    "filter start 0x{:X} outside of code size 0x{:X}",
                    self.filter_offset, code_size
                ));
            }
            if in_try(self.filter_offset) || in_handler(self.filter_offset) {
                return Some(format!(
                    "filter start 0x{:X} overlaps the try or handler block",
                    self.filter_offset
                ));
            }
            if self.filter_offset >= self.handler_offset {
                return Some(format!(
                    "filter start 0x{:X} follows the handler start 0x{:X}",
                    self.filter_offset, self.handler_offset
                ));
            }
            if !filter_ends.contains(&self.handler_offset) {
                return Some(format!(
                    "handler start 0x{:X} does not follow an endfilter",
                    self.handler_offset
                ));
            }
        } else if in_try(self.handler_offset)
            || (self.try_length > 0 && in_handler(self.try_offset))
        {
            return Some(format!(
                "handler block [0x{:X}, 0x{:X}) overlaps the try block [0x{:X}, 0x{:X})",
                self.handler_offset, handler_end, self.try_offset, try_end
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(flags: ExceptionHandlerFlags, t: (u32, u32), h: (u32, u32), filter: u32) -> ExceptionHandler {
        ExceptionHandler {
            flags,
            try_offset: t.0,
            try_length: t.1,
            handler_offset: h.0,
            handler_length: h.1,
            class_token: Token(0x01000001),
            filter_offset: filter,
        }
    }

    #[test]
    fn valid_catch() {
        let c = clause(ExceptionHandlerFlags::EXCEPTION, (0, 10), (10, 5), 0);
        assert!(c.check(16, &[]).is_none());
        assert_eq!(c.class_or_filter(), 0x01000001);
        assert!(c.fits_small());
    }

    #[test]
    fn out_of_code() {
        let c = clause(ExceptionHandlerFlags::FINALLY, (0, 10), (10, 7), 0);
        let reason = c.check(16, &[]).unwrap();
        assert!(reason.contains("handler block"));
        assert_eq!(c.class_or_filter(), 0);

        let c = clause(ExceptionHandlerFlags::FAULT, (10, 10), (0, 2), 0);
        assert!(c.check(16, &[]).unwrap().contains("try block"));
    }

    #[test]
    fn handler_overlapping_try() {
        let c = clause(ExceptionHandlerFlags::EXCEPTION, (0, 10), (5, 5), 0);
        assert!(c.check(16, &[]).unwrap().contains("overlaps"));
    }

    #[test]
    fn filter_rules() {
        // try [0,6) filter [6,10) handler [10,14)
        let good = clause(ExceptionHandlerFlags::FILTER, (0, 6), (10, 4), 6);
        assert!(good.check(16, &[10]).is_none());
        assert_eq!(good.class_or_filter(), 6);

        // handler does not follow an endfilter
        assert!(good.check(16, &[9]).unwrap().contains("endfilter"));

        // filter inside the try block
        let bad = clause(ExceptionHandlerFlags::FILTER, (0, 6), (10, 4), 2);
        assert!(bad.check(16, &[10]).unwrap().contains("overlaps"));

        // filter outside of the code
        let bad = clause(ExceptionHandlerFlags::FILTER, (0, 6), (10, 4), 20);
        assert!(bad.check(16, &[10]).unwrap().contains("outside"));
    }

    #[test]
    fn small_limits() {
        let c = clause(ExceptionHandlerFlags::FINALLY, (0x10000, 1), (0, 1), 0);
        assert!(!c.fits_small());
        let c = clause(ExceptionHandlerFlags::FINALLY, (0, 0x100), (0x100, 1), 0);
        assert!(!c.fits_small());
    }
}
