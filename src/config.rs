//! Assembler configuration
//!
//! This module provides the options of one compilation session. They select how
//! policy violations are handled (auto-correct or fail), whether processing
//! continues past errors, and which optional transformations run on method
//! bodies.

/// Options of an assembler session
///
/// The default configuration auto-corrects policy violations with a warning,
/// stops at the first hard error and emits bodies exactly as written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct AssemblerOptions {
    /// Turn every auto-correctable policy violation into a hard error
    /// (non-static globals, non-sealed value types, nested visibility, ...)
    pub strict: bool,

    /// Record hard errors and keep going; the unit still fails at the very end
    pub continue_on_error: bool,

    /// Choose short instruction forms (`ldarg.0`, `ldc.i4.s`, `br.s`, ...) where possible
    pub optimize: bool,

    /// Share one RVA between byte-identical method bodies
    pub fold_code: bool,

    /// Record sequence points for every source position change
    /// Methods that carry sequence points are never folded
    pub debug_info: bool,

    /// Edit-and-continue mode: skip `<Module>`, write bodies into the delta IL buffer
    pub enc_mode: bool,

    /// A duplicate method declaration resets the existing body instead of failing
    pub tolerate_duplicate_methods: bool,

    /// Classes without an `extends` clause derive from `System.Object`
    /// (`System.ValueType` / `System.Enum` for value and enum classes)
    pub auto_inherit_from_object: bool,

    /// The unit being assembled is the core library itself, so well known
    /// types resolve to local definitions instead of references
    pub is_core_library: bool,

    /// Data addresses are 8 bytes wide (PE32+) instead of 4
    pub pe32_plus: bool,

    /// Select a fat header when the declared max stack is below 8, so the
    /// value survives (a tiny header implies a max stack of 8)
    pub preserve_max_stack: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            strict: false,
            continue_on_error: false,
            optimize: false,
            fold_code: false,
            debug_info: false,
            enc_mode: false,
            tolerate_duplicate_methods: false,
            auto_inherit_from_object: true,
            is_core_library: false,
            pe32_plus: false,
            preserve_max_stack: true,
        }
    }
}

impl AssemblerOptions {
    /// Creates a configuration that rejects every policy violation
    ///
    /// Nothing is auto-corrected; each violation becomes a hard error.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Creates a configuration that reports as many problems as possible in one run
    ///
    /// Errors are recorded and processing continues; [`crate::Assembler::finish`]
    /// still fails when any error was recorded.
    #[must_use]
    pub fn tolerant() -> Self {
        Self {
            continue_on_error: true,
            ..Self::default()
        }
    }

    /// Creates a configuration producing the smallest output
    ///
    /// Enables short instruction forms and body folding.
    #[must_use]
    pub fn optimized() -> Self {
        Self {
            optimize: true,
            fold_code: true,
            ..Self::default()
        }
    }

    /// Creates a configuration for edit-and-continue delta passes
    #[must_use]
    pub fn enc() -> Self {
        Self {
            enc_mode: true,
            ..Self::default()
        }
    }

    /// Size of a data address in bytes
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        if self.pe32_plus {
            8
        } else {
            4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_options_presets() {
        let default = AssemblerOptions::default();
        assert!(!default.strict);
        assert!(!default.continue_on_error);
        assert!(!default.optimize);
        assert!(!default.fold_code);
        assert!(default.auto_inherit_from_object);
        assert!(default.preserve_max_stack);

        let strict = AssemblerOptions::strict();
        assert!(strict.strict);
        assert!(!strict.continue_on_error);

        let tolerant = AssemblerOptions::tolerant();
        assert!(tolerant.continue_on_error);
        assert!(!tolerant.strict);

        let optimized = AssemblerOptions::optimized();
        assert!(optimized.optimize);
        assert!(optimized.fold_code);
        assert!(!optimized.debug_info);

        let enc = AssemblerOptions::enc();
        assert!(enc.enc_mode);
    }

    #[test]
    fn test_pointer_size() {
        assert_eq!(AssemblerOptions::default().pointer_size(), 4);
        let wide = AssemblerOptions {
            pe32_plus: true,
            ..AssemblerOptions::default()
        };
        assert_eq!(wide.pointer_size(), 8);
    }
}
