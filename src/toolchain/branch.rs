use std::str::FromStr;

use super::{Toolchain, ToolchainError};
use crate::syntax::BranchMnemonic;

/// Primary opcode 18 (`b`), AA and LK cleared.
const BRANCH_OPCODE: u32 = 0x4800_0000;
const ABSOLUTE_FLAG: u32 = 0b10;
const LINK_FLAG: u32 = 0b01;
/// Reach of the 26-bit signed displacement.
const BRANCH_RANGE: i64 = 0x0200_0000;

/// Encode `b`, `ba`, `bl` or `bla` without invoking the assembler.
pub fn encode_branch(mnemonic: BranchMnemonic, distance: i64) -> Result<u32, ToolchainError> {
    if distance % 4 != 0 {
        return Err(ToolchainError::BranchMisaligned(distance));
    }
    if !(-BRANCH_RANGE..BRANCH_RANGE).contains(&distance) {
        return Err(ToolchainError::BranchOutOfRange(distance));
    }

    let mut word = BRANCH_OPCODE | (distance as u32 & 0x03FF_FFFC);
    if mnemonic.is_absolute() {
        word |= ABSOLUTE_FLAG;
    }
    if mnemonic.is_link() {
        word |= LINK_FLAG;
    }

    Ok(word)
}

/// Assemble a branch instruction to hex. Unconditional branches take the fast path, any other
/// mnemonic is handed to the toolchain with the branch placed at offset 0.
#[tracing::instrument(skip(toolchain))]
pub fn assemble_branch(
    mnemonic: &str,
    distance: i64,
    toolchain: &dyn Toolchain,
) -> Result<String, ToolchainError> {
    match BranchMnemonic::from_str(mnemonic.trim()) {
        Ok(branch) => Ok(format!("{:08X}", encode_branch(branch, distance)?)),
        Err(_) => {
            let source = format!("{} {}\n", mnemonic.trim(), format_signed_hex(distance));
            Ok(toolchain.assemble(&source, &[])?.hex())
        }
    }
}

/// Signed displacement encoded in a branch instruction, with the AA/LK bits masked out.
///
/// Handles I-form (`b`, primary opcode 18) and B-form (`bc`, primary opcode 16) branches.
pub fn branch_displacement(word: u32) -> Option<i64> {
    match word >> 26 {
        18 => {
            let li = word & 0x03FF_FFFC;
            Some(sign_extend(li, 26))
        }
        16 => {
            let bd = word & 0x0000_FFFC;
            Some(sign_extend(bd, 16))
        }
        _ => None,
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as i64
}

/// `0x40` or `-0x40`
pub fn format_signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-0x{:X}", value.unsigned_abs())
    } else {
        format!("0x{:X}", value)
    }
}
