//! Diagnostics collection for a compilation unit.
//!
//! Every warning, auto-correction and error raised while the parser drives the
//! [`crate::Assembler`] or while [`crate::Assembler::finish`] emits the unit is
//! recorded here and mirrored to the `log` facade. The collected entries are the
//! only externally visible effect of a failed compilation besides the returned
//! [`crate::Error`].
//!
//! # Key Components
//!
//! - [`Diagnostics`] - Container for diagnostic entries of one session
//! - [`Diagnostic`] - Individual diagnostic entry with severity and context
//! - [`DiagnosticSeverity`] - Severity level (Info, Warning, Error)
//! - [`DiagnosticCategory`] - Which class of rule produced the diagnostic
//!
//! # Usage Examples
//!
//! ```rust
//! use dotasm::diagnostics::{Diagnostics, DiagnosticCategory};
//!
//! let mut diagnostics = Diagnostics::new();
//! diagnostics.warning(DiagnosticCategory::Policy, "Non-static global field 'x', made static");
//! diagnostics.error(DiagnosticCategory::Reference, "Undefined label: 'L1'");
//!
//! assert!(diagnostics.has_errors());
//! for entry in diagnostics.iter() {
//!     println!("{entry}");
//! }
//! ```

use std::fmt::{self, Write};

use crate::{metadata::token::Token, Error};

/// Severity level of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DiagnosticSeverity {
    /// Informational message, not indicating a problem.
    #[strum(to_string = "INFO")]
    Info,

    /// A problem that was tolerated or auto-corrected.
    ///
    /// The unit still produces output.
    #[strum(to_string = "WARN")]
    Warning,

    /// A hard error.
    ///
    /// In tolerant mode processing continues, but the unit fails at the end.
    #[strum(to_string = "ERROR")]
    Error,
}

/// Category indicating which class of rule produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DiagnosticCategory {
    /// Duplicate declarations and malformed nesting.
    Structural,

    /// Unresolved classes, labels, members and references, and invalid SEH topology.
    Reference,

    /// Rule violations that can be auto-corrected unless running strict.
    Policy,

    /// Failures from the metadata emitter, the section allocator or the filesystem.
    Resource,

    /// Everything else.
    General,
}

impl From<&Error> for DiagnosticCategory {
    fn from(error: &Error) -> Self {
        match error {
            Error::Duplicate { .. } | Error::DuplicateLabel(_) | Error::InvalidScope(_) => {
                DiagnosticCategory::Structural
            }
            Error::UndefinedClass(_)
            | Error::UndefinedLabel(_)
            | Error::UnresolvedMember { .. }
            | Error::UndefinedReference(_)
            | Error::UndefinedGenericParam(_)
            | Error::InvalidExceptionClause { .. }
            | Error::BranchOutOfRange { .. } => DiagnosticCategory::Reference,
            Error::Policy(_)
            | Error::InvalidPacking(_)
            | Error::InvalidEntryPoint(_)
            | Error::InvalidLocal(_) => DiagnosticCategory::Policy,
            Error::Emitter(_)
            | Error::TokenMismatch { .. }
            | Error::FileError(_)
            | Error::OutOfBounds
            | Error::Malformed { .. } => DiagnosticCategory::Resource,
            Error::Error(_) | Error::PhaseFailed { .. } | Error::CompilationFailed(_) => {
                DiagnosticCategory::General
            }
        }
    }
}

/// A single diagnostic entry with context information.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level of this diagnostic.
    pub severity: DiagnosticSeverity,

    /// Category indicating the source of this diagnostic.
    pub category: DiagnosticCategory,

    /// Human-readable description of the issue.
    pub message: String,

    /// Optional source line the parser reported when the issue was raised.
    pub line: Option<u32>,

    /// Optional metadata token related to the issue.
    pub token: Option<Token>,

    /// Optional IL offset within the current method.
    pub offset: Option<u32>,
}

impl Diagnostic {
    /// Creates a new diagnostic entry.
    ///
    /// # Arguments
    ///
    /// * `severity` - Severity level of the diagnostic
    /// * `category` - Category of the diagnostic source
    /// * `message` - Human-readable description
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            line: None,
            token: None,
            offset: None,
        }
    }

    /// Adds source line information to the diagnostic.
    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Adds metadata token information to the diagnostic.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Adds an IL offset to the diagnostic.
    #[must_use]
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.message)?;

        if let Some(line) = self.line {
            write!(f, " (line: {})", line)?;
        }

        if let Some(token) = self.token {
            write!(f, " (token: {})", token)?;
        }

        if let Some(offset) = self.offset {
            write!(f, " (IL_{:04x})", offset)?;
        }

        Ok(())
    }
}

/// Container for the diagnostic entries of one compilation session.
///
/// Every entry is also forwarded to the `log` facade with the matching level.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates a new empty diagnostics container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds an informational diagnostic.
    pub fn info(&mut self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Info, category, message));
    }

    /// Adds a warning diagnostic.
    pub fn warning(&mut self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Warning,
            category,
            message,
        ));
    }

    /// Adds an error diagnostic.
    pub fn error(&mut self, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Error,
            category,
            message,
        ));
    }

    /// Adds a diagnostic entry directly.
    ///
    /// Use this for diagnostics that need additional context like a source line,
    /// a token or an IL offset.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Info => log::info!("{diagnostic}"),
            DiagnosticSeverity::Warning => log::warn!("{diagnostic}"),
            DiagnosticSeverity::Error => log::error!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Returns true if any diagnostics have been collected.
    pub fn has_any(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Returns true if any error-level diagnostics have been collected.
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Error)
    }

    /// Returns true if any warning-level diagnostics have been collected.
    pub fn has_warnings(&self) -> bool {
        self.entries
            .iter()
            .any(|d| d.severity == DiagnosticSeverity::Warning)
    }

    /// Returns the total number of diagnostics.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of error-level diagnostics.
    pub fn error_count(&self) -> usize {
        self.count_of(DiagnosticSeverity::Error)
    }

    /// Returns the number of warning-level diagnostics.
    pub fn warning_count(&self) -> usize {
        self.count_of(DiagnosticSeverity::Warning)
    }

    fn count_of(&self, severity: DiagnosticSeverity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Returns an iterator over all diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Returns all errors as a vector.
    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Error)
            .collect()
    }

    /// Returns all warnings as a vector.
    pub fn warnings(&self) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.severity == DiagnosticSeverity::Warning)
            .collect()
    }

    /// Returns diagnostics filtered by category.
    pub fn by_category(&self, category: DiagnosticCategory) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.category == category)
            .collect()
    }

    /// Returns true if any diagnostic message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.entries.iter().any(|d| d.message.contains(needle))
    }

    /// Formats a summary of all diagnostics for display.
    pub fn summary(&self) -> String {
        let mut output = String::new();

        let error_count = self.error_count();
        let warning_count = self.warning_count();

        let _ = writeln!(
            output,
            "Diagnostics: {} error(s), {} warning(s)",
            error_count, warning_count
        );

        if error_count > 0 {
            output.push_str("\nErrors:\n");
            for diag in self.errors() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        if warning_count > 0 {
            output.push_str("\nWarnings:\n");
            for diag in self.warnings() {
                let _ = writeln!(output, "  {diag}");
            }
        }

        output
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_with_context() {
        let diag = Diagnostic::new(
            DiagnosticSeverity::Error,
            DiagnosticCategory::Reference,
            "Undefined label",
        )
        .with_line(12)
        .with_token(Token(0x06000001))
        .with_offset(0x10);

        assert_eq!(diag.line, Some(12));
        assert_eq!(diag.token, Some(Token(0x06000001)));
        assert_eq!(diag.offset, Some(0x10));

        let display = diag.to_string();
        assert!(display.contains("ERROR"));
        assert!(display.contains("Reference"));
        assert!(display.contains("line: 12"));
        assert!(display.contains("0x06000001"));
        assert!(display.contains("IL_0010"));
    }

    #[test]
    fn test_diagnostics_container() {
        let mut diagnostics = Diagnostics::new();

        diagnostics.info(DiagnosticCategory::General, "Info message");
        diagnostics.warning(DiagnosticCategory::Policy, "Warning message");
        diagnostics.error(DiagnosticCategory::Structural, "Error message");

        assert_eq!(diagnostics.count(), 3);
        assert_eq!(diagnostics.error_count(), 1);
        assert_eq!(diagnostics.warning_count(), 1);
        assert!(diagnostics.has_errors());
        assert!(diagnostics.has_warnings());
        assert!(diagnostics.mentions("Warning"));
        assert_eq!(
            diagnostics.by_category(DiagnosticCategory::Policy).len(),
            1
        );
    }

    #[test]
    fn test_category_from_error() {
        assert_eq!(
            DiagnosticCategory::from(&Error::UndefinedLabel("L".into())),
            DiagnosticCategory::Reference
        );
        assert_eq!(
            DiagnosticCategory::from(&Error::InvalidPacking(3)),
            DiagnosticCategory::Policy
        );
        assert_eq!(
            DiagnosticCategory::from(&Error::DuplicateLabel("L".into())),
            DiagnosticCategory::Structural
        );
        assert_eq!(
            DiagnosticCategory::from(&Error::Emitter("x".into())),
            DiagnosticCategory::Resource
        );
    }

    #[test]
    fn test_summary() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(DiagnosticCategory::Reference, "Class 'A.B' is referenced but not defined");
        let summary = diagnostics.summary();
        assert!(summary.contains("1 error(s)"));
        assert!(summary.contains("A.B"));
    }
}
