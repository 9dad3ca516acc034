use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hex;

/// Fast-path branch encoding and branch operand decoding.
pub mod branch;

/// Runs the GNU assembler and a command line disassembler as subprocesses.
pub mod gnu;

/// Parsers for the assembler listing and the disassembler output.
pub mod listing;

pub use gnu::{GnuToolchain, ToolchainConfig};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ToolchainError {
    #[error("Toolchain executable not found: {0}")]
    Missing(String),
    #[error("Assembly failed:\n{0}")]
    AssemblyFailed(Diagnostics),
    #[error("Disassembly failed: {0}")]
    DisassemblyFailed(String),
    #[error("{0} did not finish within {1:?}")]
    Timeout(String, Duration),
    #[error("I/O error running {0}: {1}")]
    Io(String, String),
    #[error("Unable to parse assembler listing line: '{0}'")]
    Listing(String),
    #[error("Branch distance out of range: {0}")]
    BranchOutOfRange(i64),
    #[error("Branch distance is not a multiple of 4: {0}")]
    BranchMisaligned(i64),
}

/// A message reported by the assembler, optionally tied to a source line (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: Option<usize>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "Line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    /// Translate line numbers, e.g. from generated source back to the user's code.
    pub fn remap<F>(self, map: F) -> Diagnostics
    where
        F: Fn(usize) -> Option<usize>,
    {
        Diagnostics(
            self.0
                .into_iter()
                .map(|diagnostic| Diagnostic {
                    line: diagnostic.line.and_then(&map),
                    message: diagnostic.message,
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

/// Output of a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assembly {
    pub bytes: Vec<u8>,
    /// Byte offset of every label defined in the source
    pub labels: HashMap<String, usize>,
}

impl Assembly {
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// External assembler/disassembler used as a black box.
pub trait Toolchain: fmt::Debug {
    /// Assemble source code, searching `include_paths` for `.include` files.
    fn assemble(&self, source: &str, include_paths: &[PathBuf]) -> Result<Assembly, ToolchainError>;

    /// Disassemble machine code starting at offset 0.
    fn disassemble(&self, code: &[u8]) -> Result<String, ToolchainError>;

    /// Verify that the toolchain can be used at all.
    fn check(&self) -> Result<(), ToolchainError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Tiny stand-in for the assembler which understands `.long`, `.short`, `.byte`, `nop`,
    //! `blr`, `li` and labels. Enough to exercise the pipeline without binutils installed.

    use std::cell::Cell;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeToolchain {
        pub calls: Cell<usize>,
    }

    fn parse_number(text: &str) -> Option<i64> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let value = match digits.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16).ok()?,
            None => digits.parse().ok()?,
        };
        Some(if negative { -value } else { value })
    }

    fn parse_register(text: &str) -> Option<u32> {
        text.trim().strip_prefix('r')?.parse().ok()
    }

    impl Toolchain for FakeToolchain {
        fn assemble(
            &self,
            source: &str,
            _include_paths: &[PathBuf],
        ) -> Result<Assembly, ToolchainError> {
            self.calls.set(self.calls.get() + 1);
            let mut assembly = Assembly::default();
            let mut errors = vec![];

            for (ix, line) in source.lines().enumerate() {
                let line = crate::syntax::strip_comment(line);
                if line.is_empty() {
                    continue;
                }
                if let Some(label) = line.strip_suffix(':') {
                    assembly.labels.insert(label.to_string(), assembly.bytes.len());
                    continue;
                }
                let (mnemonic, operands) = line.split_once(' ').unwrap_or((line, ""));
                let bytes = match mnemonic {
                    ".long" => {
                        // Expressions like `5|3` are OR-ed together.
                        operands
                            .split('|')
                            .map(parse_number)
                            .try_fold(0i64, |acc, v| v.map(|v| acc | v))
                            .map(|v| (v as u32).to_be_bytes().to_vec())
                    }
                    ".short" => parse_number(operands).map(|v| (v as u16).to_be_bytes().to_vec()),
                    ".byte" => operands
                        .split(',')
                        .map(|v| parse_number(v).map(|v| v as u8))
                        .collect(),
                    "nop" => Some(0x6000_0000u32.to_be_bytes().to_vec()),
                    "blr" => Some(0x4E80_0020u32.to_be_bytes().to_vec()),
                    "li" => operands.split_once(',').and_then(|(rd, value)| {
                        let rd = parse_register(rd)?;
                        let value = value
                            .split('|')
                            .map(parse_number)
                            .try_fold(0i64, |acc, v| v.map(|v| acc | v))?;
                        let word = 0x3800_0000 | (rd << 21) | (value as u32 & 0xFFFF);
                        Some(word.to_be_bytes().to_vec())
                    }),
                    _ => None,
                };
                match bytes {
                    Some(bytes) => assembly.bytes.extend(bytes),
                    None => errors.push(Diagnostic {
                        line: Some(ix + 1),
                        message: format!("Error: unrecognized opcode: `{}'", mnemonic),
                    }),
                }
            }

            if errors.is_empty() {
                Ok(assembly)
            } else {
                Err(ToolchainError::AssemblyFailed(Diagnostics(errors)))
            }
        }

        fn disassemble(&self, code: &[u8]) -> Result<String, ToolchainError> {
            Ok(code
                .chunks(4)
                .map(|word| format!(".long 0x{}", hex::encode(word)))
                .collect::<Vec<String>>()
                .join("\n"))
        }
    }
}
