use super::ParseError;
use crate::address::RAM_START;
use crate::code_change::{ChangeKind, CodeChange};
use crate::hex;
use crate::syntax;

const NOP: u32 = 0x6000_0000;

enum Parsed {
    Write { address: u32, bytes: Vec<u8> },
    Inject { address: u32, code: Vec<u8> },
}

fn parse_lines(code: &str) -> Result<Vec<(u32, u32)>, ParseError> {
    let mut lines = vec![];
    for line in code.lines() {
        let text = syntax::strip_comment(line);
        if text.is_empty() {
            continue;
        }
        let digits = hex::normalize(text);
        if digits.len() != 16 || !hex::is_hex(&digits) {
            return Err(ParseError::InvalidGecko(line.trim().to_owned()));
        }
        let word = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&digits[range], 16)
                .map_err(|_| ParseError::InvalidGecko(line.trim().to_owned()))
        };
        lines.push((word(0..8)?, word(8..16)?));
    }
    Ok(lines)
}

fn payload(lines: &[(u32, u32)]) -> Vec<u8> {
    lines
        .iter()
        .flat_map(|(first, second)| first.to_be_bytes().into_iter().chain(second.to_be_bytes()))
        .collect()
}

/// The `count` lines following a code's first line.
fn take<'a>(
    lines: &'a [(u32, u32)],
    ix: &mut usize,
    count: usize,
) -> Result<&'a [(u32, u32)], ParseError> {
    let (first, second) = lines[*ix - 1];
    let taken = lines
        .get(*ix..*ix + count)
        .ok_or_else(|| ParseError::InvalidGecko(format!("{:08X} {:08X}", first, second)))?;
    *ix += count;
    Ok(taken)
}

/// Decode supported code types. `None` when the code uses anything else.
fn decode(lines: &[(u32, u32)]) -> Result<Option<Vec<Parsed>>, ParseError> {
    let mut parsed = vec![];
    let mut ix = 0;

    while ix < lines.len() {
        let (first, second) = lines[ix];
        ix += 1;
        let code_type = (first >> 24) as u8 & 0xFE;
        let address = RAM_START | (first & 0x01FF_FFFF);

        match code_type {
            // The upper half holds a repeat count, which is not a plain write.
            0x00 | 0x02 if second >> 16 != 0 => return Ok(None),
            0x00 => parsed.push(Parsed::Write {
                address,
                bytes: vec![second as u8],
            }),
            0x02 => parsed.push(Parsed::Write {
                address,
                bytes: (second as u16).to_be_bytes().to_vec(),
            }),
            0x04 => parsed.push(Parsed::Write {
                address,
                bytes: second.to_be_bytes().to_vec(),
            }),
            0x06 => {
                let length = second as usize;
                let mut bytes = payload(take(lines, &mut ix, length.div_ceil(8))?);
                bytes.truncate(length);
                parsed.push(Parsed::Write { address, bytes });
            }
            0xC2 => {
                let mut code = payload(take(lines, &mut ix, second as usize)?);
                if code.ends_with(&[0; 4]) {
                    code.truncate(code.len() - 4);
                }
                if code.len() % 8 == 4 && code.ends_with(&NOP.to_be_bytes()) {
                    code.truncate(code.len() - 4);
                }
                parsed.push(Parsed::Inject { address, code });
            }
            _ => return Ok(None),
        }
    }

    Ok(Some(parsed))
}

/// Convert a Gecko code block into changes. Contiguous writes become one static overwrite.
/// A block using unsupported code types is kept as a single verbatim Gecko change.
#[tracing::instrument(skip_all)]
pub fn parse_gecko_code(code: &str) -> Result<Vec<CodeChange>, ParseError> {
    let lines = parse_lines(code)?;
    let Some(parsed) = decode(&lines)? else {
        tracing::debug!("keeping Gecko code verbatim");
        return Ok(vec![CodeChange::new(ChangeKind::Gecko, "", code.trim())]);
    };

    let mut merged: Vec<Parsed> = vec![];
    for item in parsed {
        if let (
            Some(Parsed::Write { address, bytes }),
            Parsed::Write {
                address: next,
                bytes: more,
            },
        ) = (merged.last_mut(), &item)
        {
            if *address as usize + bytes.len() == *next as usize {
                bytes.extend(more);
                continue;
            }
        }
        merged.push(item);
    }

    Ok(merged
        .into_iter()
        .map(|item| match item {
            Parsed::Write { address, bytes } => CodeChange::new(
                ChangeKind::StaticOverwrite,
                &format!("0x{:08X}", address),
                &hex::format_words(&hex::encode(&bytes)),
            ),
            Parsed::Inject { address, code } => CodeChange::new(
                ChangeKind::Injection,
                &format!("0x{:08X}", address),
                &hex::format_words(&hex::encode(&code)),
            ),
        })
        .collect())
}
