//! Little-endian reading and writing helpers for method bodies, blobs and sections.
//!
//! All readers and writers are bounds-checked and report [`crate::Error::OutOfBounds`]
//! instead of panicking. The [`CilIO`] trait ties each primitive to its fixed-size
//! byte representation.

use crate::{Error::OutOfBounds, Result};

/// Trait for primitives that can be read from and written to little-endian byte buffers.
pub trait CilIO: Sized + Copy {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io!(
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
);

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` at `offset` and advances the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Safely writes a value of type `T` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le<T: CilIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Safely writes a value of type `T` at `offset` and advances the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

/// Appends a value of type `T` in little-endian byte order to a growable buffer.
pub fn push_le<T: CilIO>(buffer: &mut Vec<u8>, value: T) {
    buffer.extend_from_slice(value.to_le_bytes().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_le() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(read_le::<u32>(&data).unwrap(), 0x04030201);
        assert_eq!(read_le::<u16>(&data).unwrap(), 0x0201);

        let mut offset = 3;
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x0504);
        assert_eq!(offset, 5);
        assert!(read_le_at::<u8>(&data, &mut offset).is_err());
    }

    #[test]
    fn test_write_le() {
        let mut data = [0u8; 6];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 0x0201u16).unwrap();
        write_le_at(&mut data, &mut offset, -1i32).unwrap();
        assert_eq!(data, [0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(write_le_at(&mut data, &mut offset, 1u8).is_err());
    }

    #[test]
    fn test_push_le() {
        let mut buffer = vec![0x2A];
        push_le(&mut buffer, 1.5f32);
        push_le(&mut buffer, 0x1122_3344_5566_7788u64);
        assert_eq!(buffer.len(), 13);
        assert_eq!(read_le::<f32>(&buffer[1..]).unwrap(), 1.5);
        assert_eq!(read_le::<u64>(&buffer[5..]).unwrap(), 0x1122_3344_5566_7788);
    }
}
