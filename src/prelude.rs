//! # dotasm Prelude
//!
//! This module provides a convenient prelude for the most commonly used types of the
//! dotasm library. Import it to drive an assembler session without spelling out module
//! paths.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotasm operations
pub use crate::Error;

/// The result type used throughout dotasm
pub use crate::Result;

/// Options of an assembler session
pub use crate::AssemblerOptions;

/// Diagnostics collected during a session
pub use crate::diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics};

// ================================================================================================
// Session
// ================================================================================================

/// The assembler session and its output
pub use crate::assembler::{
    Assembler, EmbeddedResource, EmittedClass, EmittedImage, EmittedMethod,
};

/// Declarations delivered by the parser
pub use crate::assembler::{
    BranchTarget, ClassHeader, ClauseKind, CodeLocation, CustomAttribute, EventMethod,
    ExceptionDecl, FieldDecl, GenericParamDecl, LocalDecl, MethodHeader, PInvokeDecl, ParamDecl,
    PermissionAttribute, PropertyMethod, VarRef,
};

// ================================================================================================
// Collaborators
// ================================================================================================

/// Metadata writer and section allocator interfaces
pub use crate::emitter::{Constant, MetadataEmitter, Section, SectionAllocator};

/// In-memory collaborators
pub use crate::emitter::{MemoryEmitter, MemorySections};

// ================================================================================================
// Metadata
// ================================================================================================

/// Metadata tokens, final or pending
pub use crate::metadata::token::{LocalRef, TableId, Token, TokenRef};

/// Manifest declarations
pub use crate::manifest::{
    AssemblyDecl, ComTypeDecl, ComTypeImpl, FileDecl, Originator, ResourceDecl, ResourceSource,
};
