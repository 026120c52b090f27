use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every parser callback and every emission phase of the [`crate::Assembler`] reports failure
/// through this type. The variants fall into the categories below, which also decide how the
/// session reacts to them (see [`crate::AssemblerOptions`]).
///
/// # Error Categories
///
/// ## Structural Errors
/// - [`Error::Duplicate`] - A class, method, field, entry point or data label was declared twice
/// - [`Error::DuplicateLabel`] - A code label was defined twice within one method
/// - [`Error::InvalidScope`] - A directive appeared where it is not allowed (e.g. a class inside a method)
///
/// ## Reference Errors
/// - [`Error::UndefinedClass`] - A class was referenced but never defined
/// - [`Error::UndefinedLabel`] - A branch, clause or data address names an unknown label
/// - [`Error::UnresolvedMember`] - A local member reference has no matching definition
/// - [`Error::UndefinedReference`] - A module, file or assembly reference is unknown
/// - [`Error::UndefinedGenericParam`] - A generic parameter name does not exist
/// - [`Error::InvalidExceptionClause`] - An exception clause has an invalid topology
/// - [`Error::BranchOutOfRange`] - A short branch cannot reach its target
///
/// ## Policy Errors
/// - [`Error::Policy`] - A rule violation that is auto-corrected unless running strict
/// - [`Error::InvalidPacking`] - Class packing is not a power of two in `[1, 128]`
/// - [`Error::InvalidEntryPoint`] - The entry point is declared in an invalid context
/// - [`Error::InvalidLocal`] - A local variable slot is malformed
///
/// ## Resource and Collaborator Errors
/// - [`Error::Emitter`] - The metadata emitter or section allocator rejected a request
/// - [`Error::TokenMismatch`] - The emitter assigned an unexpected token
/// - [`Error::FileError`] - Filesystem I/O errors (resources, hashed files)
/// - [`Error::Malformed`] - Malformed signature or blob input
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
///
/// ## Unit Errors
/// - [`Error::PhaseFailed`] - An emission phase finished with recorded errors
/// - [`Error::CompilationFailed`] - The unit failed after running in tolerant mode
///
/// # Examples
///
/// ```rust
/// use dotasm::{Assembler, AssemblerOptions, Error};
/// use dotasm::emitter::{MemoryEmitter, MemorySections};
///
/// let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
/// match asm.emit_max_stack(8) {
///     Err(Error::InvalidScope(message)) => eprintln!("{}", message),
///     Err(e) => eprintln!("Other error: {}", e),
///     Ok(()) => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Buffer and input errors
    /// A signature or blob is damaged and could not be processed.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// Raised when reading a signature, a method body or a section block past its end.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors from reading embedded resources or hashing
    /// files referenced by the manifest.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    // Structural errors
    /// An item was declared twice.
    ///
    /// Covers classes with conflicting definitions, methods and fields with the same
    /// name and signature, repeated `.entrypoint` directives and global data labels.
    #[error("Duplicate {kind} declaration: '{name}'")]
    Duplicate {
        /// What kind of item was duplicated (`method`, `field`, ...)
        kind: &'static str,
        /// The name of the duplicated item
        name: String,
    },

    /// A code label was defined twice in the same method.
    #[error("Duplicate label: '{0}'")]
    DuplicateLabel(String),

    /// A directive was used outside of the scope it requires.
    ///
    /// For example a class declared inside a method, `.maxstack` outside of a
    /// method or an `end_event` without a matching `start_event`.
    #[error("{0}")]
    InvalidScope(String),

    // Reference errors
    /// A class was referenced but never defined in this compilation unit.
    ///
    /// The associated value is the fully qualified name of the class.
    #[error("Class '{0}' is referenced but not defined")]
    UndefinedClass(String),

    /// A label used by a branch, exception clause or data address is undefined.
    #[error("Undefined label: '{0}'")]
    UndefinedLabel(String),

    /// A local member reference does not match any definition.
    #[error("Unresolved local member ref '{name}' of class '{class}'")]
    UnresolvedMember {
        /// Fully qualified name of the owning class
        class: String,
        /// Name of the member
        name: String,
    },

    /// A module, file, assembly or COM type reference is unknown.
    #[error("{0}")]
    UndefinedReference(String),

    /// A generic parameter was named but no such parameter exists.
    #[error("Type parameter '{0}' undefined")]
    UndefinedGenericParam(String),

    /// An exception clause has an invalid structure.
    #[error("Invalid SEH clause #{index} in method '{method}': {reason}")]
    InvalidExceptionClause {
        /// Clause index within the method
        index: usize,
        /// Name of the method
        method: String,
        /// What is wrong with the clause
        reason: String,
    },

    /// A branch that was forced into its short form cannot reach its target.
    #[error("Short branch to '{label}' out of range: offset {offset}")]
    BranchOutOfRange {
        /// Target label name
        label: String,
        /// Relative offset that would have been written
        offset: i64,
    },

    // Policy errors
    /// A rule violation that is auto-corrected unless the session runs strict.
    #[error("{0}")]
    Policy(String),

    /// Class packing was not a power of two in `[1, 128]`.
    #[error("Invalid class packing size {0}, must be 1, 2, 4, 8, 16, 32, 64 or 128")]
    InvalidPacking(u32),

    /// The entry point was declared in an invalid context.
    #[error("{0}")]
    InvalidEntryPoint(String),

    /// A local variable slot is malformed.
    #[error("{0}")]
    InvalidLocal(String),

    // Collaborator errors
    /// The metadata emitter or the section allocator rejected a request.
    #[error("Emitter failure: {0}")]
    Emitter(String),

    /// The metadata emitter assigned a token that differs from the provisional one.
    #[error("Token mismatch - expected {expected}, got {actual}")]
    TokenMismatch {
        /// Provisional token
        expected: Token,
        /// Token returned by the emitter
        actual: Token,
    },

    // Unit errors
    /// An emission phase recorded errors and the session does not continue past them.
    #[error("{phase} failed with {errors} error(s)")]
    PhaseFailed {
        /// The failing phase
        phase: &'static str,
        /// Number of errors recorded by the phase
        errors: usize,
    },

    /// The compilation unit failed. No output is produced.
    #[error("Compilation failed with {0} error(s)")]
    CompilationFailed(usize),
}
