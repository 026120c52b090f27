// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]

//! # dotasm
//!
//! The semantic core of a textual CIL assembler. A front end parses IL source and drives
//! an [`Assembler`] through callbacks (`start_class`, `start_method`, `emit_opcode`,
//! `add_field`, ...); the assembler keeps the declared classes, members and labels,
//! resolves forward references, validates the rules of ECMA-335 and emits everything to a
//! pluggable metadata writer in dependency order.
//!
//! ## Features
//!
//! - **Forward references** - classes and members may be used before they are declared
//! - **Method body assembly** - tiny and fat headers, branch fixups and shortening,
//!   exception clauses and local signatures
//! - **Policy handling** - auto-correction with warnings, or strict rejection
//! - **Manifest** - assembly identity, references, files, exported types and resources
//! - **Edit-and-continue** - repeated passes emit only what was added since the last one
//!
//! ## Quick Start
//!
//! ```rust
//! use dotasm::prelude::*;
//! use dotasm::assembler::opcode;
//! use dotasm::metadata::flags::{MethodAttributes, TypeAttributes};
//!
//! let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
//! asm.start_class(ClassHeader::new("Hello", TypeAttributes::PUBLIC))?;
//! asm.start_method(MethodHeader::new(
//!     "Main",
//!     vec![0x00, 0x00, 0x01],
//!     MethodAttributes::PUBLIC | MethodAttributes::STATIC,
//! ))?;
//! asm.emit_entry_point()?;
//! asm.emit_string(opcode::LDSTR, "Hello")?;
//! asm.emit_opcode(opcode::POP)?;
//! asm.emit_opcode(opcode::RET)?;
//! asm.end_method()?;
//! asm.end_class()?;
//!
//! let image = asm.finish()?;
//! assert!(image.entry_point.is_some());
//! # Ok::<(), dotasm::Error>(())
//! ```
//!
//! ## Collaborators
//!
//! Token assignment and section layout belong to the image writer. They are reached
//! through the [`emitter::MetadataEmitter`] and [`emitter::SectionAllocator`] traits;
//! [`emitter::MemoryEmitter`] and [`emitter::MemorySections`] implement both in memory.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`]. Warnings and errors are additionally collected in
//! the session's [`Diagnostics`] and mirrored to the [`log`] facade.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use dotasm::prelude::*;
///
/// let asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::strict());
/// assert!(asm.options().strict);
/// ```
pub mod prelude;

/// The assembler session: declarations, instructions, resolution and emission
pub mod assembler;

/// Session options
pub mod config;

/// Warnings and errors collected during a session
pub mod diagnostics;

/// Metadata writer and section allocator interfaces, with in-memory implementations
pub mod emitter;

/// Assembly manifest and embedded resources
pub mod manifest;

/// Tokens, attribute flags, signatures and method body encoding based on ECMA-335
pub mod metadata;

/// Little-endian IO, alignment and hashing helpers
pub mod utils;

/// `dotasm` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotasm` Error type
///
/// # Examples
///
/// ```rust
/// use dotasm::prelude::*;
///
/// let mut asm = Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default());
/// match asm.end_class() {
///     Err(Error::InvalidScope(message)) => println!("rejected: {message}"),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
pub use error::Error;

/// The assembler session and the image it produces
pub use assembler::{Assembler, EmittedImage};

/// Session options
pub use config::AssemblerOptions;

/// Diagnostics of a session
pub use diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics};
