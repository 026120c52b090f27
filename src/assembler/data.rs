//! The global data sections (`.data`).
//!
//! Data is written straight into the data or TLS section through the
//! [`SectionAllocator`]; labels remember the section and offset they were declared at.
//! An address of a label (`&label`) becomes a pointer-sized slot with a `HighLow` or `Dir64`
//! relocation, which makes the image no longer IL-only. Addresses of labels declared further
//! down are patched by [`Assembler::do_global_fixups`].

use rustc_hash::FxHashMap;
use widestring::U16String;

use crate::{
    assembler::{method::IlFixupKind, Assembler},
    emitter::{MetadataEmitter, RelocKind, Section, SectionAllocator},
    utils::to_u32,
    Error, Result,
};

/// A `&label` slot waiting for its label.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingAddress {
    section: Section,
    offset: u32,
    label: String,
    line: u32,
}

/// Data labels and forward address references of a session.
#[derive(Debug, Clone, Default)]
pub struct DataState {
    labels: FxHashMap<String, (Section, u32)>,
    pending: Vec<PendingAddress>,
    tls: bool,
}

impl DataState {
    /// Section and offset of `label`
    #[must_use]
    pub fn label(&self, label: &str) -> Option<(Section, u32)> {
        self.labels.get(label).copied()
    }

    fn section(&self) -> Section {
        if self.tls {
            Section::Tls
        } else {
            Section::Data
        }
    }
}

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Starts a `.data` directive: selects the data or TLS section and optionally declares
    /// a label at its current end.
    ///
    /// # Errors
    /// Returns [`Error::Duplicate`] for a label declared twice.
    pub fn declare_data(&mut self, label: Option<&str>, tls: bool) -> Result<()> {
        self.data.tls = tls;
        let Some(label) = label else {
            return Ok(());
        };
        if self.data.labels.contains_key(label) {
            return self.report(Error::Duplicate {
                kind: "data label",
                name: label.to_string(),
            });
        }
        let section = self.data.section();
        let offset = self.sections.section_len(section);
        log::trace!("data label '{label}' at {section}+0x{offset:X}");
        self.data.labels.insert(label.to_string(), (section, offset));
        Ok(())
    }

    /// Appends raw bytes to the current data section. Returns their offset.
    ///
    /// # Errors
    /// Returns an error if the section cannot grow.
    pub fn emit_data(&mut self, bytes: &[u8]) -> Result<u32> {
        let section = self.data.section();
        let (offset, block) = self.sections.allocate_block(section, bytes.len(), 1)?;
        block.copy_from_slice(bytes);
        Ok(offset)
    }

    /// Appends `size` zero bytes to the current data section.
    ///
    /// # Errors
    /// Returns an error if the section cannot grow.
    pub fn emit_zero_data(&mut self, size: usize) -> Result<u32> {
        let section = self.data.section();
        let (offset, _) = self.sections.allocate_block(section, size, 1)?;
        Ok(offset)
    }

    /// Appends a zero-terminated UTF-16 string (`char*("...")`).
    ///
    /// # Errors
    /// Returns an error if the section cannot grow.
    pub fn emit_data_string(&mut self, value: &str) -> Result<u32> {
        let wide = U16String::from_str(value);
        let mut bytes = Vec::with_capacity((wide.len() + 1) * 2);
        for unit in wide.as_slice() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        self.emit_data(&bytes)
    }

    /// Appends the address of `label` (`&label`).
    ///
    /// The slot is 8 bytes wide for PE32+ images and 4 bytes otherwise. A label that is not
    /// declared yet is patched once the unit is finished.
    ///
    /// # Errors
    /// Returns an error if the section cannot grow.
    pub fn emit_data_address(&mut self, label: &str) -> Result<u32> {
        let section = self.data.section();
        let size = self.options.pointer_size();
        let (offset, _) = self.sections.allocate_block(section, size, 1)?;
        self.il_only = false;

        match self.data.label(label) {
            Some((target, value)) => self.write_data_address(section, offset, target, value)?,
            None => self.data.pending.push(PendingAddress {
                section,
                offset,
                label: label.to_string(),
                line: self.source.line,
            }),
        }
        Ok(offset)
    }

    fn write_data_address(&mut self, section: Section, offset: u32, target: Section, value: u32) -> Result<()> {
        let kind = if self.options.pe32_plus {
            self.sections
                .patch(section, offset, &u64::from(value).to_le_bytes())?;
            RelocKind::Dir64
        } else {
            self.sections.patch(section, offset, &value.to_le_bytes())?;
            RelocKind::HighLow
        };
        self.sections.add_relocation(section, offset, kind, target)
    }

    /// Patches every address of a label that was declared after its use.
    ///
    /// Undefined labels are deferred as [`Error::UndefinedLabel`].
    ///
    /// # Errors
    /// Returns an error if a slot cannot be patched.
    pub(crate) fn do_global_fixups(&mut self) -> Result<()> {
        for pending in std::mem::take(&mut self.data.pending) {
            match self.data.label(&pending.label) {
                Some((target, value)) => {
                    self.write_data_address(pending.section, pending.offset, target, value)?;
                }
                None => {
                    log::debug!("undefined data label at line {}", pending.line);
                    self.defer(Error::UndefinedLabel(pending.label));
                }
            }
        }
        Ok(())
    }

    /// RVA of the data label `label`
    #[must_use]
    pub fn data_label_rva(&self, label: &str) -> Option<u32> {
        self.data
            .label(label)
            .map(|(section, offset)| self.sections.rva_of(section, offset))
    }

    /// Writes the IL fixups of a body placed at `block_offset` in the IL section and records
    /// their relocations.
    pub(crate) fn relocate_body(
        &mut self,
        block_offset: u32,
        header_size: usize,
        fixups: &[crate::assembler::method::IlFixup],
    ) -> Result<()> {
        for fixup in fixups {
            let offset = block_offset + to_u32(header_size)? + fixup.offset;
            match &fixup.kind {
                IlFixupKind::Token => {
                    self.sections
                        .add_relocation(Section::Il, offset, RelocKind::MapToken, Section::Il)?;
                }
                IlFixupKind::DataRva(label) => match self.data.label(label) {
                    Some((target, value)) => {
                        self.sections.patch(Section::Il, offset, &value.to_le_bytes())?;
                        self.sections
                            .add_relocation(Section::Il, offset, RelocKind::Absolute, target)?;
                    }
                    None => self.defer(Error::UndefinedLabel(label.clone())),
                },
            }
        }
        Ok(())
    }
}
