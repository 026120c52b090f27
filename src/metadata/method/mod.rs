//! Method body encoding: headers, exception handling sections and their decoding.
//!
//! # Key Components
//!
//! - [`encode_body`] - Selects the header format and produces the final body bytes
//! - [`MethodBody`] - Parsed view of an encoded body
//! - [`ExceptionHandler`] - One resolved exception handling clause
//!
//! # References
//! - ECMA-335 6th Edition, Partition II, Section 25.4 - Common Intermediate Language Physical Layout

mod body;
mod exceptions;
mod types;

pub use body::*;
pub use exceptions::*;
pub use types::*;
