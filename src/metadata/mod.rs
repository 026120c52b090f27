//! Metadata primitives shared by the assembler and its collaborators.
//!
//! # Key Components
//!
//! - [`token`] - Metadata tokens and the pending local reference space
//! - [`flags`] - Attribute constants for types, members and manifest entries
//! - [`signatures`] - Signature blob construction and inspection
//! - [`method`] - Method body header and exception section encoding

pub mod flags;
pub mod method;
pub mod signatures;
pub mod token;
