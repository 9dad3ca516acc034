use std::collections::HashMap;

use super::branch::{branch_displacement, format_signed_hex};
use super::{Assembly, ToolchainError};
use crate::hex;

/// Name of a label definition at the start of a source line, e.g. `loop:` or `loop: li r3, 0`.
fn label_definition(source: &str) -> Option<&str> {
    let (label, _) = source.trim().split_once(':')?;
    let valid = !label.is_empty()
        && label
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '$'));
    valid.then_some(label)
}

/// Parse the `-al` listing printed by the GNU assembler.
///
/// Rows have the form `LINE ADDR DATA<tab>SOURCE`. The address is missing on rows which only
/// define a label, and continuation rows of long data carry just the data, e.g.:
///
/// ```text
/// GAS LISTING                     page 1
///
///
///    1              __cs_start_0:
///    2 0000 38600001      li r3, 1
///    3 0004 00000000      .long 0, 0
///    3      00000000
/// ```
#[tracing::instrument(skip_all)]
pub fn parse_listing(listing: &str) -> Result<Assembly, ToolchainError> {
    let mut bytes = vec![];
    let mut labels = HashMap::new();
    let mut pending_labels: Vec<String> = vec![];

    for line in listing.lines() {
        let line = line.trim_start_matches('\x0c').trim_end();
        if line.trim().is_empty() || line.contains("GAS LISTING") {
            continue;
        }

        let (columns, source) = line.split_once('\t').unwrap_or((line, ""));
        let Some(line_number) = columns.split_whitespace().next() else {
            continue;
        };
        if line_number.parse::<usize>().is_err() {
            // Symbol table or other trailer output
            continue;
        }
        let number_end = columns.find(line_number).unwrap_or(0) + line_number.len();
        let rest = &columns[number_end..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let gap = rest.len() - rest.trim_start().len();

        let (address, data) = match fields.as_slice() {
            [] => (None, None),
            [data] if gap > 1 => (None, Some(*data)),
            [address] => (Some(*address), None),
            [address, data] => (Some(*address), Some(*data)),
            _ => return Err(ToolchainError::Listing(line.to_owned())),
        };

        if let Some(label) = label_definition(source) {
            pending_labels.push(label.to_owned());
        }

        if let Some(address) = address {
            let offset = usize::from_str_radix(address, 16)
                .map_err(|_| ToolchainError::Listing(line.to_owned()))?;
            if offset < bytes.len() {
                return Err(ToolchainError::Listing(line.to_owned()));
            }
            // Alignment and `.space` padding is not always printed.
            bytes.resize(offset, 0);
            for label in pending_labels.drain(..) {
                labels.insert(label, offset);
            }
        }

        if let Some(data) = data {
            let data = hex::decode(data).map_err(|_| ToolchainError::Listing(line.to_owned()))?;
            bytes.extend(data);
        }
    }

    for label in pending_labels {
        labels.insert(label, bytes.len());
    }

    Ok(Assembly { bytes, labels })
}

/// One instruction of disassembler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledLine {
    pub offset: u32,
    pub word: u32,
    pub mnemonic: String,
    pub operands: String,
}

impl DisassembledLine {
    /// Rewrite the line into the form the assembler accepts back:
    /// `.word` becomes `.long` and branch targets become signed displacements.
    pub fn canonicalize(mut self) -> Self {
        if self.mnemonic == ".word" {
            self.mnemonic = ".long".to_owned();
        }
        if let Some(displacement) = branch_displacement(self.word) {
            let target = format_signed_hex(displacement);
            self.operands = match self.operands.rsplit_once(',') {
                Some((conditions, _)) => format!("{}, {}", conditions.trim(), target),
                None => target,
            };
        }
        self
    }
}

impl std::fmt::Display for DisassembledLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Parse disassembler output of the form `OFFSET: HEX MNEMONIC OPERANDS...`.
#[tracing::instrument(skip_all)]
pub fn parse_disassembly(output: &str) -> Result<Vec<DisassembledLine>, ToolchainError> {
    let mut lines = vec![];

    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        let invalid = || ToolchainError::DisassemblyFailed(format!("unexpected line '{}'", line));
        let mut columns = line.split_whitespace();
        let offset = columns
            .next()
            .map(|offset| offset.trim_end_matches(':'))
            .and_then(|offset| u32::from_str_radix(offset, 16).ok())
            .ok_or_else(invalid)?;
        let word = columns
            .next()
            .and_then(|word| u32::from_str_radix(word, 16).ok())
            .ok_or_else(invalid)?;
        let mnemonic = columns.next().ok_or_else(invalid)?.to_owned();
        let operands = columns.collect::<Vec<&str>>().join(" ");

        lines.push(DisassembledLine {
            offset,
            word,
            mnemonic,
            operands,
        });
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_listing() {
        let listing = "\x0cGAS LISTING \t\t\tpage 1


   1              \t__cs_start_0:
   2 0000 38600001 \tli r3, 1
   3              \t__cs_end_0:
   4 0004 00000000 \t.long 0, 0, 0
   4      00000000
   4      00000000
   5              \tend:
";
        let assembly = parse_listing(listing).unwrap();

        assert_eq!(
            assembly.hex(),
            "38600001000000000000000000000000"
        );
        assert_eq!(assembly.labels["__cs_start_0"], 0);
        assert_eq!(assembly.labels["__cs_end_0"], 4);
        assert_eq!(assembly.labels["end"], 16);
    }

    #[test]
    fn test_parse_listing_inline_label() {
        let listing = "   1 0000 60000000 \tnop
   2 0004 4E800020 \tdone: blr
";
        let assembly = parse_listing(listing).unwrap();
        assert_eq!(assembly.labels["done"], 4);
        assert_eq!(assembly.bytes.len(), 8);
    }

    #[test]
    fn test_parse_disassembly() {
        let output = "00000000: 7C0802A6  mflr    r0
00000004: 4BFFFFC1  bl      0xffffffc4
00000008: 4082000C  bne-    cr0,0x14
0000000c: 00000000  .word   0x00000000
";
        let lines: Vec<String> = parse_disassembly(output)
            .unwrap()
            .into_iter()
            .map(|line| line.canonicalize().to_string())
            .collect();

        assert_eq!(
            lines,
            vec![
                "mflr r0",
                "bl -0x40",
                "bne- cr0, 0xC",
                ".long 0x00000000",
            ]
        );
    }
}
