//! Custom syntax understood on top of regular assembly and hex.
//!
//! Three constructs are recognized:
//!
//! ```text
//! bl <FunctionName>        special branch to a standalone function (or `bl 0x80001234`)
//! lis r3, <<Name>>@h       symbol reference, replaced by the symbol's RAM address
//! li r3, [[Option]]        configuration placeholder, replaced by the option's value
//! ```
//!
//! Everything in this module is a pure function of the source text.

use std::fmt;
use std::str::FromStr;

use crate::address::{is_ram_address, parse_address};
use crate::hex;

/// Branch mnemonics which may target a standalone function or a RAM address directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::EnumString, strum_macros::Display,
)]
pub enum BranchMnemonic {
    #[strum(to_string = "b")]
    B,
    #[strum(to_string = "ba")]
    Ba,
    #[strum(to_string = "bl")]
    Bl,
    #[strum(to_string = "bla", serialize = "bal")]
    Bla,
}

impl BranchMnemonic {
    pub fn is_link(&self) -> bool {
        matches!(self, BranchMnemonic::Bl | BranchMnemonic::Bla)
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self, BranchMnemonic::Ba | BranchMnemonic::Bla)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchTarget {
    /// `<name>` of a standalone function
    Symbol(String),
    /// A RAM address written out as a number
    Address(u32),
}

impl fmt::Display for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchTarget::Symbol(name) => write!(f, "<{}>", name),
            BranchTarget::Address(address) => write!(f, "{:#010x}", address),
        }
    }
}

/// What a custom syntax span needs before it can be turned into final bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxKind {
    SpecialBranch {
        mnemonic: BranchMnemonic,
        target: BranchTarget,
        adjustment: i64,
    },
    SymbolRef {
        names: Vec<String>,
    },
    ConfigOption {
        names: Vec<String>,
    },
}

impl SyntaxKind {
    /// Names of the standalone functions or options this span depends on.
    pub fn names(&self) -> Vec<&str> {
        match self {
            SyntaxKind::SpecialBranch {
                target: BranchTarget::Symbol(name),
                ..
            } => vec![name.as_str()],
            SyntaxKind::SpecialBranch { .. } => vec![],
            SyntaxKind::SymbolRef { names } | SyntaxKind::ConfigOption { names } => {
                names.iter().map(String::as_str).collect()
            }
        }
    }
}

/// A custom syntax occurrence located in pre-processed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxSpan {
    /// Byte offset into the pre-processed code
    pub offset: usize,
    /// Number of bytes reserved for the span
    pub width: usize,
    pub kind: SyntaxKind,
    /// Source line the span was found on, comment stripped
    pub text: String,
    /// Zero based line index into the raw code
    pub line: usize,
}

impl SyntaxSpan {
    pub fn end(&self) -> usize {
        self.offset + self.width
    }
}

/// A special branch parsed from a line, e.g. `bl <Foo> + 0x8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialBranch {
    pub mnemonic: BranchMnemonic,
    pub target: BranchTarget,
    pub adjustment: i64,
}

impl From<SpecialBranch> for SyntaxKind {
    fn from(branch: SpecialBranch) -> Self {
        SyntaxKind::SpecialBranch {
            mnemonic: branch.mnemonic,
            target: branch.target,
            adjustment: branch.adjustment,
        }
    }
}

/// Piece of a line that consists of hex and custom syntax only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Hex digits with whitespace removed
    Hex(String),
    /// `<<name>>`
    Symbol(String),
    /// `[[name]]`, or several placeholders OR-ed together: `[[a]]|[[b]]`
    Options(Vec<String>),
}

/// Classification of a single source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    SpecialBranch(SpecialBranch),
    /// Hex possibly mixed with `<<name>>` and `[[name]]`
    Hex(Vec<Segment>),
    Assembly,
}

/// Remove `#` and `//` comments.
pub fn strip_comment(line: &str) -> &str {
    let end = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    line[..end].trim()
}

fn parse_signed(text: &str) -> Option<i64> {
    let text: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex_digits) => i64::from_str_radix(hex_digits, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

fn parse_adjustment(rest: &str) -> Option<i64> {
    let rest = rest.trim();
    if rest.is_empty() {
        Some(0)
    } else if rest.starts_with('+') || rest.starts_with('-') {
        parse_signed(rest)
    } else {
        None
    }
}

/// Parse `b[a][l] <name>` or `b[a][l] 0x80XXXXXX`, with an optional `+ N`/`- N`.
pub fn parse_special_branch(line: &str) -> Option<SpecialBranch> {
    let line = strip_comment(line);
    let (mnemonic, rest) = line.split_once(char::is_whitespace)?;
    let mnemonic = BranchMnemonic::from_str(mnemonic).ok()?;
    let rest = rest.trim();

    let (target, rest) = if let Some(after) = rest.strip_prefix('<') {
        if after.starts_with('<') {
            return None;
        }
        let (name, rest) = after.split_once('>')?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        (BranchTarget::Symbol(name.to_owned()), rest)
    } else {
        let end = rest
            .find(|ch: char| ch.is_whitespace() || ch == '+' || ch == '-')
            .unwrap_or(rest.len());
        let address = parse_address(&rest[..end])?;
        // Plain branches to small numbers are regular relative branches.
        if !is_ram_address(address) {
            return None;
        }
        (BranchTarget::Address(address), &rest[end..])
    };

    Some(SpecialBranch {
        mnemonic,
        target,
        adjustment: parse_adjustment(rest)?,
    })
}

pub fn is_special_branch(line: &str) -> bool {
    parse_special_branch(line).is_some()
}

fn enclosed<'a>(line: &'a str, open: &str, close: &str) -> Vec<(usize, usize, &'a str)> {
    let mut found = vec![];
    let mut position = 0;
    while let Some(start) = line[position..].find(open) {
        let start = position + start;
        let name_start = start + open.len();
        match line[name_start..].find(close) {
            Some(len) => {
                let end = name_start + len + close.len();
                found.push((start, end, line[name_start..name_start + len].trim()));
                position = end;
            }
            None => break,
        }
    }
    found
}

/// Replace every `open name close` occurrence on the line with `replace(name)`.
pub fn replace_enclosed<E, F>(line: &str, open: &str, close: &str, mut replace: F) -> Result<String, E>
where
    F: FnMut(&str) -> Result<String, E>,
{
    let mut replaced = String::with_capacity(line.len());
    let mut position = 0;
    for (start, end, name) in enclosed(line, open, close) {
        replaced.push_str(&line[position..start]);
        replaced.push_str(&replace(name)?);
        position = end;
    }
    replaced.push_str(&line[position..]);
    Ok(replaced)
}

/// Names of every `<<name>>` symbol reference on the line.
pub fn symbol_names(line: &str) -> Vec<String> {
    enclosed(strip_comment(line), "<<", ">>")
        .into_iter()
        .map(|(_, _, name)| name.to_owned())
        .collect()
}

pub fn contains_symbol_reference(line: &str) -> bool {
    !symbol_names(line).is_empty()
}

/// Names of every `[[name]]` configuration placeholder on the line.
pub fn option_names(line: &str) -> Vec<String> {
    enclosed(strip_comment(line), "[[", "]]")
        .into_iter()
        .map(|(_, _, name)| name.to_owned())
        .collect()
}

pub fn contains_config_placeholder(line: &str) -> bool {
    !option_names(line).is_empty()
}

pub fn contains_custom_syntax(line: &str) -> bool {
    is_special_branch(line) || contains_symbol_reference(line) || contains_config_placeholder(line)
}

/// Split a line into hex and custom syntax segments.
///
/// Returns `None` if anything other than hex digits remains between the custom syntax.
pub fn hex_segments(line: &str) -> Option<Vec<Segment>> {
    let line = strip_comment(line);
    let mut markers: Vec<(usize, usize, Segment)> = enclosed(line, "<<", ">>")
        .into_iter()
        .map(|(start, end, name)| (start, end, Segment::Symbol(name.to_owned())))
        .collect();
    markers.extend(
        enclosed(line, "[[", "]]")
            .into_iter()
            .map(|(start, end, name)| (start, end, Segment::Options(vec![name.to_owned()]))),
    );
    markers.sort_by_key(|(start, _, _)| *start);

    let mut segments: Vec<Segment> = vec![];
    let mut position = 0;
    for (start, end, segment) in markers {
        if start < position {
            return None;
        }
        let between = &line[position..start];
        let joins_previous = between.trim() == "|"
            && matches!(segments.last(), Some(Segment::Options(_)))
            && matches!(segment, Segment::Options(_));

        if joins_previous {
            if let (Some(Segment::Options(names)), Segment::Options(more)) =
                (segments.last_mut(), segment)
            {
                names.extend(more);
            }
        } else {
            push_hex(&mut segments, between)?;
            segments.push(segment);
        }
        position = end;
    }
    push_hex(&mut segments, &line[position..])?;

    Some(segments)
}

fn push_hex(segments: &mut Vec<Segment>, text: &str) -> Option<()> {
    let digits: String = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    if digits.is_empty() {
        return Some(());
    }
    if !hex::is_hex(&digits) {
        return None;
    }
    segments.push(Segment::Hex(digits.to_ascii_uppercase()));
    Some(())
}

pub fn classify_line(line: &str) -> LineKind {
    let stripped = strip_comment(line);
    if stripped.is_empty() {
        return LineKind::Blank;
    }
    if let Some(branch) = parse_special_branch(stripped) {
        return LineKind::SpecialBranch(branch);
    }
    match hex_segments(stripped) {
        Some(segments) => LineKind::Hex(segments),
        None => LineKind::Assembly,
    }
}

/// True if any line of the code needs the assembler.
pub fn is_assembly(raw: &str) -> bool {
    raw.lines()
        .any(|line| matches!(classify_line(line), LineKind::Assembly))
}

/// Standalone functions referenced by the code, in order of first appearance.
pub fn referenced_functions(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = vec![];
    for line in raw.lines() {
        let mut found = symbol_names(line);
        if let Some(SpecialBranch {
            target: BranchTarget::Symbol(name),
            ..
        }) = parse_special_branch(line)
        {
            found.insert(0, name);
        }
        for name in found {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_special_branch() {
        let tests = vec![
            (
                "bl <Foo>",
                Some(SpecialBranch {
                    mnemonic: BranchMnemonic::Bl,
                    target: BranchTarget::Symbol("Foo".to_string()),
                    adjustment: 0,
                }),
            ),
            (
                "  b <Foo> + 0x8  # skip prologue",
                Some(SpecialBranch {
                    mnemonic: BranchMnemonic::B,
                    target: BranchTarget::Symbol("Foo".to_string()),
                    adjustment: 8,
                }),
            ),
            (
                "bal 0x80001234-4",
                Some(SpecialBranch {
                    mnemonic: BranchMnemonic::Bla,
                    target: BranchTarget::Address(0x80001234),
                    adjustment: -4,
                }),
            ),
            (
                "ba 80376a28",
                Some(SpecialBranch {
                    mnemonic: BranchMnemonic::Ba,
                    target: BranchTarget::Address(0x80376a28),
                    adjustment: 0,
                }),
            ),
            ("b 0x40", None),
            ("b loop", None),
            ("bne <Foo>", None),
            ("lis r3, <<Foo>>@h", None),
            ("b <<Foo>>", None),
        ];

        for (input, expected) in tests {
            assert_eq!(parse_special_branch(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(
            symbol_names("lis r3, <<Foo>>@h; ori r3, r3, <<Bar>>@l"),
            vec!["Foo", "Bar"]
        );
        assert_eq!(option_names("li r3, [[ Speed ]] # [[Ignored]]"), vec!["Speed"]);
        assert!(contains_config_placeholder("3860[[Speed]]"));
        assert!(!contains_symbol_reference("bl <Foo>"));
    }

    #[test]
    fn test_hex_segments() {
        assert_eq!(
            hex_segments("3860 [[Speed]]"),
            Some(vec![
                Segment::Hex("3860".to_string()),
                Segment::Options(vec!["Speed".to_string()]),
            ])
        );
        assert_eq!(
            hex_segments("[[A]] | [[B]]0000"),
            Some(vec![
                Segment::Options(vec!["A".to_string(), "B".to_string()]),
                Segment::Hex("0000".to_string()),
            ])
        );
        assert_eq!(
            hex_segments("<<Table>>"),
            Some(vec![Segment::Symbol("Table".to_string())])
        );
        assert_eq!(hex_segments("li r3, [[Speed]]"), None);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify_line("   # just a comment"), LineKind::Blank);
        assert_eq!(
            classify_line("38600001 4E800020"),
            LineKind::Hex(vec![Segment::Hex("386000014E800020".to_string())])
        );
        assert_eq!(classify_line("li r3, 1"), LineKind::Assembly);
        // "add" is valid hex, but the comma is not
        assert_eq!(classify_line("add r3, r3, r4"), LineKind::Assembly);

        assert!(!is_assembly("38600001\nbl <Foo>\n[[Speed]]0000"));
        assert!(is_assembly("38600001\nblr"));
    }

    #[test]
    fn test_referenced_functions() {
        let raw = "bl <Foo>\nlis r3, <<Bar>>@h\nori r3, r3, <<Bar>>@l\nb <Foo>";
        assert_eq!(referenced_functions(raw), vec!["Foo", "Bar"]);
    }
}
