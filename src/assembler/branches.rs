//! Branch sites, the branch shortening pass and label patching.
//!
//! Every branch or switch target naming a label is recorded as a [`BranchSite`] with a zero
//! placeholder operand. When the method ends, long forward branches whose displacement fits
//! a signed byte are converted to their short form (optimize mode only) and every site is
//! then patched with its final displacement.
//!
//! Shortening a branch removes three operand bytes, so every recorded code position behind
//! it moves; [`MethodBuilder::shift_positions`] keeps labels, sites, clause bounds and
//! fixups consistent. Removing bytes never increases the distance between a branch and its
//! target, so once a branch fits the short form it keeps fitting.

use crate::{
    assembler::{method::MethodBuilder, opcode},
    utils::{fits_i8, write_le},
    Error, Result,
};

/// Upper bound on shortening rounds; every round shortens at least one branch.
const MAX_ITERATIONS: usize = 100;

/// Operand bytes saved by converting a long branch to its short form.
const SHORTENING: u32 = 3;

/// A branch operand to patch once all labels are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSite {
    /// Target label
    pub label: String,
    /// Position of the branch opcode
    pub opcode_pos: u32,
    /// Position of the displacement
    pub operand_pos: u32,
    /// Displacement size: 1 or 4
    pub size: u8,
    /// Position the displacement is relative to (end of the instruction)
    pub relative_to: u32,
    /// Branch opcode, 0 for switch targets
    pub opcode: u16,
    /// A long branch the shortening pass may convert
    pub shrinkable: bool,
}

impl MethodBuilder {
    /// Converts long forward branches that fit a signed byte to their short form.
    ///
    /// # Errors
    /// Returns an error if the code no longer matches the recorded sites.
    pub(crate) fn shorten_branches(&mut self) -> Result<()> {
        if self.raw_offsets {
            return Ok(());
        }

        for _ in 0..MAX_ITERATIONS {
            let shrinkable = self.find_shrinkable();
            if shrinkable.is_empty() {
                break;
            }
            // Back to front: the pending sites keep their indices, the shift
            // updates their positions.
            for index in shrinkable.into_iter().rev() {
                self.shrink(index)?;
            }
        }
        Ok(())
    }

    fn find_shrinkable(&self) -> Vec<usize> {
        let mut shrinkable: Vec<usize> = self
            .sites
            .iter()
            .enumerate()
            .filter(|(_, site)| site.shrinkable && site.size == 4)
            .filter_map(|(index, site)| {
                let target = *self.labels.get(&site.label)?;
                let short_end = i64::from(site.opcode_pos) + 2;
                let target = if target >= site.opcode_pos + 5 {
                    i64::from(target - SHORTENING)
                } else {
                    i64::from(target)
                };
                fits_i8(target - short_end).then_some(index)
            })
            .collect();
        shrinkable.sort_by_key(|&index| self.sites[index].opcode_pos);
        shrinkable
    }

    fn shrink(&mut self, index: usize) -> Result<()> {
        let site = &self.sites[index];
        let short = opcode::short_branch_of(site.opcode).ok_or_else(|| {
            malformed_error!("Branch opcode 0x{:02X} has no short form", site.opcode)
        })?;
        let opcode_pos = site.opcode_pos as usize;
        let end = opcode_pos + 5;
        if end > self.code.len() {
            return Err(Error::OutOfBounds);
        }

        self.code[opcode_pos] = short as u8;
        self.code.drain(opcode_pos + 2..end);

        let site = &mut self.sites[index];
        site.opcode = short;
        site.size = 1;
        site.shrinkable = false;
        self.shift_positions(end as u32, SHORTENING);
        Ok(())
    }

    /// Writes the final displacement of every branch site.
    ///
    /// Every site is checked; the returned list holds one error per undefined label or
    /// out-of-range short branch.
    pub(crate) fn patch_branches(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();
        for site in &self.sites {
            let Some(&target) = self.labels.get(&site.label) else {
                errors.push(Error::UndefinedLabel(site.label.clone()));
                continue;
            };

            let displacement = i64::from(target) - i64::from(site.relative_to);
            let operand = site.operand_pos as usize;
            let written = if site.size == 1 {
                if !fits_i8(displacement) {
                    errors.push(Error::BranchOutOfRange {
                        label: site.label.clone(),
                        offset: displacement,
                    });
                    continue;
                }
                self.code
                    .get_mut(operand..=operand)
                    .map(|slot| slot[0] = displacement as i8 as u8)
                    .ok_or(Error::OutOfBounds)
            } else {
                self.code
                    .get_mut(operand..operand + 4)
                    .ok_or(Error::OutOfBounds)
                    .and_then(|slot| write_le(slot, displacement as i32))
            };
            if let Err(error) = written {
                errors.push(error);
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_branch(builder: &mut MethodBuilder, label: &str) {
        let pos = builder.position();
        builder.code.extend_from_slice(&[opcode::BR as u8, 0, 0, 0, 0]);
        builder.sites.push(BranchSite {
            label: label.to_string(),
            opcode_pos: pos,
            operand_pos: pos + 1,
            size: 4,
            relative_to: pos + 5,
            opcode: opcode::BR,
            shrinkable: true,
        });
    }

    #[test]
    fn forward_branch_is_shortened() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        long_branch(&mut builder, "end");
        builder.code.extend_from_slice(&[opcode::NOP as u8; 10]);
        builder.labels.insert("end".to_string(), builder.position());
        builder.code.push(opcode::RET as u8);

        builder.shorten_branches().unwrap();
        assert!(builder.patch_branches().is_empty());

        assert_eq!(builder.code.len(), 13);
        assert_eq!(builder.code[0], opcode::BR_S as u8);
        assert_eq!(builder.code[1], 10);
        assert_eq!(builder.labels["end"], 12);
    }

    #[test]
    fn distant_branch_stays_long() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        long_branch(&mut builder, "end");
        builder.code.extend_from_slice(&[opcode::NOP as u8; 200]);
        builder.labels.insert("end".to_string(), builder.position());

        builder.shorten_branches().unwrap();
        assert!(builder.patch_branches().is_empty());

        assert_eq!(builder.code[0], opcode::BR as u8);
        assert_eq!(&builder.code[1..5], &200i32.to_le_bytes());
    }

    #[test]
    fn chained_shortening_reaches_fixpoint() {
        // The first branch only fits once the second one was shortened.
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        long_branch(&mut builder, "end");
        builder.code.extend_from_slice(&[opcode::NOP as u8; 124]);
        long_branch(&mut builder, "end");
        builder.labels.insert("end".to_string(), builder.position());

        builder.shorten_branches().unwrap();
        assert!(builder.patch_branches().is_empty());

        assert_eq!(builder.code.len(), 128);
        assert_eq!(builder.code[0], opcode::BR_S as u8);
        assert_eq!(builder.code[126], opcode::BR_S as u8);
        assert_eq!(builder.code[1] as i8, 126);
        assert_eq!(builder.code[127], 0);
    }

    #[test]
    fn raw_offsets_disable_shortening() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        long_branch(&mut builder, "end");
        builder.labels.insert("end".to_string(), builder.position());
        builder.raw_offsets = true;

        builder.shorten_branches().unwrap();
        assert_eq!(builder.code[0], opcode::BR as u8);
    }

    #[test]
    fn short_branch_out_of_range() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        builder.code.extend_from_slice(&[opcode::BR_S as u8, 0]);
        builder.sites.push(BranchSite {
            label: "far".to_string(),
            opcode_pos: 0,
            operand_pos: 1,
            size: 1,
            relative_to: 2,
            opcode: opcode::BR_S,
            shrinkable: false,
        });
        builder.code.extend_from_slice(&[opcode::NOP as u8; 200]);
        builder.labels.insert("far".to_string(), builder.position());

        let errors = builder.patch_branches();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], Error::BranchOutOfRange { offset: 200, .. }));
    }

    #[test]
    fn undefined_label() {
        let mut builder = MethodBuilder::new(0, Vec::new(), false);
        long_branch(&mut builder, "nowhere");
        let errors = builder.patch_branches();
        assert!(matches!(&errors[0], Error::UndefinedLabel(label) if label == "nowhere"));
    }
}
