//! CIL opcode values and short-form selection.
//!
//! Opcodes are carried as `u16`: single-byte opcodes as their byte value, two-byte opcodes
//! with the `0xFE` prefix in the high byte (e.g. [`CEQ`] = `0xFE01`).
#![allow(missing_docs)]

pub const NOP: u16 = 0x00;
pub const LDARG_0: u16 = 0x02;
pub const LDLOC_0: u16 = 0x06;
pub const STLOC_0: u16 = 0x0A;
pub const LDARG_S: u16 = 0x0E;
pub const LDARGA_S: u16 = 0x0F;
pub const STARG_S: u16 = 0x10;
pub const LDLOC_S: u16 = 0x11;
pub const LDLOCA_S: u16 = 0x12;
pub const STLOC_S: u16 = 0x13;
pub const LDNULL: u16 = 0x14;
pub const LDC_I4_M1: u16 = 0x15;
pub const LDC_I4_0: u16 = 0x16;
pub const LDC_I4_S: u16 = 0x1F;
pub const LDC_I4: u16 = 0x20;
pub const LDC_I8: u16 = 0x21;
pub const LDC_R4: u16 = 0x22;
pub const LDC_R8: u16 = 0x23;
pub const DUP: u16 = 0x25;
pub const POP: u16 = 0x26;
pub const JMP: u16 = 0x27;
pub const CALL: u16 = 0x28;
pub const CALLI: u16 = 0x29;
pub const RET: u16 = 0x2A;

// Branches, short form
pub const BR_S: u16 = 0x2B;
pub const BRFALSE_S: u16 = 0x2C;
pub const BRTRUE_S: u16 = 0x2D;
pub const BLT_UN_S: u16 = 0x37;

// Branches, long form
pub const BR: u16 = 0x38;
pub const BRFALSE: u16 = 0x39;
pub const BRTRUE: u16 = 0x3A;
pub const BEQ: u16 = 0x3B;
pub const BLT_UN: u16 = 0x44;

pub const SWITCH: u16 = 0x45;
pub const CALLVIRT: u16 = 0x6F;
pub const LDSTR: u16 = 0x72;
pub const NEWOBJ: u16 = 0x73;
pub const LDFLD: u16 = 0x7B;
pub const LDSFLD: u16 = 0x7E;
pub const THROW: u16 = 0x7A;
pub const LDTOKEN: u16 = 0xD0;
pub const ENDFINALLY: u16 = 0xDC;
pub const LEAVE: u16 = 0xDD;
pub const LEAVE_S: u16 = 0xDE;

// Two-byte opcodes
pub const FE_PREFIX: u8 = 0xFE;
pub const CEQ: u16 = 0xFE01;
pub const LDFTN: u16 = 0xFE06;
pub const LDARG: u16 = 0xFE09;
pub const LDARGA: u16 = 0xFE0A;
pub const STARG: u16 = 0xFE0B;
pub const LDLOC: u16 = 0xFE0C;
pub const LDLOCA: u16 = 0xFE0D;
pub const STLOC: u16 = 0xFE0E;
pub const ENDFILTER: u16 = 0xFE11;
pub const RETHROW: u16 = 0xFE1A;

/// Distance between a long branch and its short form
const SHORT_BRANCH_DELTA: u16 = BR - BR_S;

/// Encoded length of `opcode`.
#[must_use]
pub fn opcode_len(opcode: u16) -> u32 {
    if opcode > 0xFF {
        2
    } else {
        1
    }
}

/// Appends the encoding of `opcode` to `code`.
pub fn encode_opcode(opcode: u16, code: &mut Vec<u8>) {
    if opcode > 0xFF {
        code.push((opcode >> 8) as u8);
    }
    code.push((opcode & 0xFF) as u8);
}

/// Returns true for the long form of a branch with a 4-byte displacement.
#[must_use]
pub fn is_long_branch(opcode: u16) -> bool {
    (BR..=BLT_UN).contains(&opcode) || opcode == LEAVE
}

/// Returns true for the short form of a branch with a 1-byte displacement.
#[must_use]
pub fn is_short_branch(opcode: u16) -> bool {
    (BR_S..=BLT_UN_S).contains(&opcode) || opcode == LEAVE_S
}

/// Short form of a long branch.
#[must_use]
pub fn short_branch_of(opcode: u16) -> Option<u16> {
    if opcode == LEAVE {
        Some(LEAVE_S)
    } else if (BR..=BLT_UN).contains(&opcode) {
        Some(opcode - SHORT_BRANCH_DELTA)
    } else {
        None
    }
}

/// Long form of a short branch.
#[must_use]
pub fn long_branch_of(opcode: u16) -> Option<u16> {
    if opcode == LEAVE_S {
        Some(LEAVE)
    } else if (BR_S..=BLT_UN_S).contains(&opcode) {
        Some(opcode + SHORT_BRANCH_DELTA)
    } else {
        None
    }
}

/// Variable access families with their short forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// `ldarg`, `ldarga`, `starg`
    Argument,
    /// `ldloc`, `ldloca`, `stloc`
    Local,
}

/// Classifies a variable opcode (long or short form).
#[must_use]
pub fn var_kind(opcode: u16) -> Option<VarKind> {
    match opcode {
        LDARG | LDARGA | STARG | LDARG_S | LDARGA_S | STARG_S => Some(VarKind::Argument),
        LDLOC | LDLOCA | STLOC | LDLOC_S | LDLOCA_S | STLOC_S => Some(VarKind::Local),
        _ => None,
    }
}

/// Returns true if `opcode` takes a one byte index.
#[must_use]
pub fn is_short_var(opcode: u16) -> bool {
    (LDARG_S..=STLOC_S).contains(&opcode)
}

/// Short (`.s`) form of a long variable opcode.
#[must_use]
pub fn short_var_of(opcode: u16) -> Option<u16> {
    if (LDARG..=STLOC).contains(&opcode) {
        Some(opcode - LDARG + LDARG_S)
    } else {
        None
    }
}

/// Long form of a short (`.s`) variable opcode.
#[must_use]
pub fn long_var_of(opcode: u16) -> Option<u16> {
    if is_short_var(opcode) {
        Some(opcode - LDARG_S + LDARG)
    } else {
        None
    }
}

/// The one byte macro form (`ldarg.0`, `ldloc.2`, `stloc.3`) of a variable access, if any.
#[must_use]
pub fn macro_var_of(opcode: u16, index: u32) -> Option<u16> {
    if index > 3 {
        return None;
    }
    let index = index as u16;
    match opcode {
        LDARG | LDARG_S => Some(LDARG_0 + index),
        LDLOC | LDLOC_S => Some(LDLOC_0 + index),
        STLOC | STLOC_S => Some(STLOC_0 + index),
        _ => None,
    }
}

/// The shortest encoding of `ldc.i4 value`: opcode and operand bytes.
#[must_use]
pub fn shortest_ldc_i4(value: i32) -> (u16, Vec<u8>) {
    match value {
        -1..=8 => ((LDC_I4_0 as i32 + value) as u16, Vec::new()),
        -128..=127 => (LDC_I4_S, vec![value as i8 as u8]),
        _ => (LDC_I4, value.to_le_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_forms() {
        assert_eq!(short_branch_of(BR), Some(BR_S));
        assert_eq!(short_branch_of(BLT_UN), Some(BLT_UN_S));
        assert_eq!(short_branch_of(LEAVE), Some(LEAVE_S));
        assert_eq!(short_branch_of(RET), None);
        assert_eq!(long_branch_of(BRTRUE_S), Some(BRTRUE));
        assert_eq!(long_branch_of(LEAVE_S), Some(LEAVE));
        assert!(is_long_branch(BEQ));
        assert!(is_short_branch(BRFALSE_S));
        assert!(!is_short_branch(BR));
    }

    #[test]
    fn var_forms() {
        assert_eq!(short_var_of(LDARG), Some(LDARG_S));
        assert_eq!(short_var_of(STLOC), Some(STLOC_S));
        assert_eq!(short_var_of(LDLOCA), Some(LDLOCA_S));
        assert_eq!(long_var_of(STARG_S), Some(STARG));
        assert_eq!(long_var_of(LDARG), None);
        assert_eq!(macro_var_of(LDARG, 0), Some(0x02));
        assert_eq!(macro_var_of(STLOC_S, 3), Some(0x0D));
        assert_eq!(macro_var_of(LDARGA, 0), None);
        assert_eq!(macro_var_of(LDLOC, 4), None);
        assert_eq!(var_kind(LDLOCA_S), Some(VarKind::Local));
        assert_eq!(var_kind(CALL), None);
    }

    #[test]
    fn ldc_forms() {
        assert_eq!(shortest_ldc_i4(-1), (LDC_I4_M1, vec![]));
        assert_eq!(shortest_ldc_i4(8), (0x1E, vec![]));
        assert_eq!(shortest_ldc_i4(-100), (LDC_I4_S, vec![0x9C]));
        assert_eq!(shortest_ldc_i4(1000), (LDC_I4, 1000i32.to_le_bytes().to_vec()));
    }

    #[test]
    fn encoding() {
        let mut code = Vec::new();
        encode_opcode(RET, &mut code);
        encode_opcode(CEQ, &mut code);
        assert_eq!(code, vec![0x2A, 0xFE, 0x01]);
        assert_eq!(opcode_len(ENDFILTER), 2);
    }
}
