//! Late-bound reads of embedded resources and hashed files.
//!
//! Resource files may be produced by other build steps until the very end, so their bytes
//! are only read when the resource blob is assembled. Offsets are assigned earlier from
//! the file sizes at manifest emission; a file whose size changed in between fails the
//! unit. Files are memory-mapped rather than read into a buffer.

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{
    assembler::EmbeddedResource,
    utils::{align_up, push_le, to_u32},
    Error, Result,
};

/// Alignment of every entry in the resource blob.
pub const RESOURCE_ALIGNMENT: usize = 8;

/// A read-only view of a file on disk.
pub struct MappedFile {
    data: Option<Mmap>,
}

impl MappedFile {
    /// Maps the file at `path`.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<MappedFile> {
        let file = fs::File::open(path)?;
        // Empty files cannot be mapped.
        if file.metadata()?.len() == 0 {
            return Ok(MappedFile { data: None });
        }
        let mmap = unsafe { Mmap::map(&file) }.map_err(|error| Error::Error(error.to_string()))?;
        Ok(MappedFile { data: Some(mmap) })
    }

    /// The file contents
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

/// Current size of the file at `path`.
///
/// # Errors
/// Returns an error if the file is missing or larger than 4 GiB.
pub fn file_size(path: impl AsRef<Path>) -> Result<u32> {
    let len = fs::metadata(path)?.len();
    u32::try_from(len).map_err(|_| malformed_error!("Resource file of {} bytes is too large", len))
}

/// Space an entry of `size` bytes occupies in the blob, length prefix included.
#[must_use]
pub fn entry_span(size: u32) -> u32 {
    align_up(4 + size as usize, RESOURCE_ALIGNMENT) as u32
}

/// An embedded resource whose offset and size were fixed at manifest emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResource {
    /// Resource name
    pub name: String,
    /// Source file
    pub path: std::path::PathBuf,
    /// Offset in the blob
    pub offset: u32,
    /// Size at manifest emission
    pub size: u32,
}

/// Reads every pending resource and concatenates them into the resource blob.
///
/// Each entry is a `u32` length followed by the bytes, padded to 8 bytes.
///
/// # Errors
/// Returns an error if a file cannot be read or its size changed since its offset was
/// assigned.
pub fn build_resource_blob(entries: &[PendingResource]) -> Result<(Vec<u8>, Vec<EmbeddedResource>)> {
    let mut blob = Vec::new();
    let mut resources = Vec::with_capacity(entries.len());

    for entry in entries {
        let file = MappedFile::open(&entry.path)?;
        let data = file.data();
        let size = to_u32(data.len())?;
        if size != entry.size {
            return Err(Error::Error(format!(
                "Resource '{}' changed size from {} to {} bytes ({})",
                entry.name,
                entry.size,
                size,
                entry.path.display()
            )));
        }
        if to_u32(blob.len())? != entry.offset {
            return Err(malformed_error!(
                "Resource '{}' expected at offset {}, blob is {} bytes",
                entry.name,
                entry.offset,
                blob.len()
            ));
        }

        push_le(&mut blob, size);
        blob.extend_from_slice(data);
        blob.resize(align_up(blob.len(), RESOURCE_ALIGNMENT), 0);

        log::debug!("embedded resource '{}' ({} bytes) at {}", entry.name, size, entry.offset);
        resources.push(EmbeddedResource {
            name: entry.name.clone(),
            offset: entry.offset,
            size,
        });
    }

    Ok((blob, resources))
}
