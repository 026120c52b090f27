//! Shared helpers: little-endian I/O, hashing and arithmetic.

pub mod hash;
pub mod io;
pub mod math;

pub use hash::hash_blob;
pub use io::{push_le, read_le, read_le_at, write_le, write_le_at, CilIO};
pub use math::{align_up, fits_i8, is_valid_packing, to_u32};
