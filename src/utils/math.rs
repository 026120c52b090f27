//! Mathematical utility functions.

use crate::Result;

/// Converts a `usize` to `u32`, returning an error if the value exceeds `u32::MAX`.
/// Code offsets, section offsets and blob sizes are all bounded well below this limit.
///
/// # Errors
///
/// Returns an error if `value` exceeds `u32::MAX`.
pub fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Value {value} exceeds u32::MAX"))
}

/// Rounds `value` up to the next multiple of `alignment` (a power of two, or 0/1 for none).
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns true if `value` is a legal class packing size: a power of two in `[1, 128]`.
#[must_use]
pub fn is_valid_packing(value: u32) -> bool {
    (1..=128).contains(&value) && value.is_power_of_two()
}

/// Returns true if a signed branch displacement fits into the one byte operand of a short branch.
#[must_use]
pub fn fits_i8(value: i64) -> bool {
    (i64::from(i8::MIN)..=i64::from(i8::MAX)).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_u32() {
        assert_eq!(to_u32(42).unwrap(), 42);
        assert_eq!(to_u32(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(to_u32(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_up(5, 1), 5);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn test_packing() {
        for valid in [1, 2, 4, 8, 16, 32, 64, 128] {
            assert!(is_valid_packing(valid));
        }
        for invalid in [0, 3, 6, 129, 256] {
            assert!(!is_valid_packing(invalid));
        }
    }

    #[test]
    fn test_fits_i8() {
        assert!(fits_i8(127));
        assert!(fits_i8(-128));
        assert!(!fits_i8(128));
        assert!(!fits_i8(-129));
    }
}
