//! A single patch: its raw source, the pre-processed form with placeholders, and the final
//! resolution once install addresses are known.
//!
//! Resolution happens in two passes:
//! 1. [`preprocess`] assembles (or hex-normalizes) the raw code with every custom syntax span
//!    replaced by zero bytes of the right width, producing an [`Intermediate`].
//! 2. [`resolve`] fills the spans in once the change's own install address, the addresses of
//!    the standalone functions and the option values are known.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::address::{AddressError, AddressNormalizer};
use crate::hex;
use crate::options::{self, Configuration, OptionError};
use crate::symbols::SymbolTable;
use crate::syntax::{self, BranchMnemonic, BranchTarget, LineKind, Segment, SyntaxKind, SyntaxSpan};
use crate::toolchain::branch::encode_branch;
use crate::toolchain::{Diagnostics, Toolchain, ToolchainError};

/// Address assumed for symbols while their real address is unknown.
const PLACEHOLDER_ADDRESS: &str = "0x80000000";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
pub enum ChangeKind {
    #[strum(to_string = "static")]
    StaticOverwrite,
    #[strum(to_string = "injection")]
    Injection,
    #[strum(to_string = "standalone")]
    Standalone,
    #[strum(to_string = "gecko")]
    Gecko,
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum EvaluateError {
    #[error("Assembly failed:\n{0}")]
    AssemblyFailed(Diagnostics),
    #[error("Include file not found: {0}")]
    IncludeFileMissing(String),
    #[error("Configuration option not found: {0}")]
    ConfigOptionNotFound(String),
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
    #[error("Placeholder does not start on a byte boundary: {0}")]
    MisalignedPlaceholder(String),
    #[error(transparent)]
    Option(#[from] OptionError),
    #[error(transparent)]
    Toolchain(ToolchainError),
}

impl From<ToolchainError> for EvaluateError {
    fn from(err: ToolchainError) -> Self {
        match err {
            ToolchainError::AssemblyFailed(diagnostics) => EvaluateError::AssemblyFailed(diagnostics),
            err => EvaluateError::Toolchain(err),
        }
    }
}

impl EvaluateError {
    /// True for errors reported by the assembler, as opposed to malformed mod text.
    pub fn is_assembly_error(&self) -> bool {
        matches!(
            self,
            EvaluateError::AssemblyFailed(_) | EvaluateError::Toolchain(_)
        )
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ResolveError {
    #[error("Code has not been evaluated")]
    NotEvaluated,
    #[error("Standalone function '{0}' has no address yet")]
    Unallocated(String),
    #[error("Configuration option not found: {0}")]
    ConfigOptionNotFound(String),
    #[error("Value of '{0}' does not fit in {1} byte(s)")]
    OptionDoesNotFit(String, usize),
    #[error("Re-assembled code is {1} bytes, expected {0}")]
    LengthMismatch(usize, usize),
    #[error("Invalid pre-processed code: {0}")]
    InvalidHex(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

/// Output of the first pass. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intermediate {
    /// Code with every span zero filled
    pub hex: String,
    pub spans: Vec<SyntaxSpan>,
    pub is_assembly: bool,
}

impl Intermediate {
    pub fn length(&self) -> usize {
        self.hex.len() / 2
    }

    /// Spans whose value depends on an address.
    pub fn address_dependent(&self) -> bool {
        self.spans
            .iter()
            .any(|span| !matches!(span.kind, SyntaxKind::ConfigOption { .. }))
    }
}

/// Output of the second pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// Every span was resolved
    Complete(String),
    /// Some standalone functions have no address yet
    Pending { hex: String, outstanding: Vec<String> },
}

/// Everything the second pass needs to know about the world.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// RAM address the change's own code is installed at
    pub install_address: u32,
    pub symbols: &'a SymbolTable,
    pub configurations: &'a [Configuration],
    pub include_paths: &'a [PathBuf],
}

/// Split an optional leading `# comment` line off the code.
pub fn split_annotation(raw: &str) -> (Option<String>, String) {
    let trimmed = raw.trim_start_matches(['\r', '\n']);
    match trimmed.split_once('\n') {
        Some((first, rest)) if first.trim_start().starts_with('#') => (
            Some(first.trim().trim_start_matches('#').trim().to_owned()),
            rest.to_owned(),
        ),
        None if trimmed.trim_start().starts_with('#') => (
            Some(trimmed.trim().trim_start_matches('#').trim().to_owned()),
            String::new(),
        ),
        _ => (None, raw.to_owned()),
    }
}

fn option_width(
    names: &[String],
    configurations: Option<&[Configuration]>,
) -> Result<Option<usize>, EvaluateError> {
    let Some(configurations) = configurations else {
        return Ok(None);
    };
    let mut width = 0;
    for name in names {
        let option = options::find(configurations, name)
            .ok_or_else(|| EvaluateError::ConfigOptionNotFound(name.clone()))?;
        width = width.max(option.kind.width());
    }
    Ok(Some(width))
}

/// Width of a placeholder whose option type is unknown: the bytes missing from the line's
/// last 32-bit word, or a whole word if the line is already word aligned.
fn inferred_width(line_nibbles: usize) -> usize {
    match line_nibbles % 8 {
        0 => 4,
        used => (8 - used) / 2,
    }
}

/// Byte width of every placeholder segment on a hex line, zero for plain hex digits.
///
/// Placeholders of unknown type are sized after every known segment has been counted.
fn placeholder_widths(
    segments: &[Segment],
    configurations: Option<&[Configuration]>,
) -> Result<Vec<usize>, EvaluateError> {
    let mut line_nibbles = 0;
    let mut known = vec![];
    for segment in segments {
        let nibbles = match segment {
            Segment::Hex(digits) => Some(digits.len()),
            Segment::Symbol(_) => Some(8),
            Segment::Options(names) => option_width(names, configurations)?.map(|width| width * 2),
        };
        line_nibbles += nibbles.unwrap_or(0);
        known.push(nibbles);
    }

    let mut widths = vec![];
    for (segment, nibbles) in segments.iter().zip(known) {
        widths.push(match (segment, nibbles) {
            (Segment::Hex(_), _) => 0,
            (_, Some(nibbles)) => nibbles / 2,
            (_, None) => {
                let width = inferred_width(line_nibbles);
                tracing::debug!("inferred {} byte placeholder", width);
                line_nibbles += width * 2;
                width
            }
        });
    }
    Ok(widths)
}

/// Assembler data directives emitting `bytes`: a `.long` per word, then `.short` or `.byte`
/// for the tail.
fn data_directives(bytes: &[u8]) -> Vec<String> {
    let mut words = bytes.chunks_exact(4);
    let mut directives: Vec<String> = words
        .by_ref()
        .map(|word| format!(".long 0x{}", hex::encode(word)))
        .collect();
    match words.remainder() {
        [] => (),
        tail @ [_, _] => directives.push(format!(".short 0x{}", hex::encode(tail))),
        tail => directives.push(format!(
            ".byte {}",
            tail.iter()
                .map(|byte| format!("0x{:02X}", byte))
                .collect::<Vec<String>>()
                .join(", ")
        )),
    }
    directives
}

#[tracing::instrument(skip(configurations))]
fn preprocess_hex(
    raw: &str,
    configurations: Option<&[Configuration]>,
) -> Result<Intermediate, EvaluateError> {
    let mut code = String::new();
    let mut spans = vec![];

    for (ix, line) in raw.lines().enumerate() {
        let text = syntax::strip_comment(line).to_owned();
        match syntax::classify_line(line) {
            LineKind::Blank => (),
            LineKind::SpecialBranch(branch) => {
                if code.len() % 2 != 0 {
                    return Err(EvaluateError::MisalignedPlaceholder(text));
                }
                spans.push(SyntaxSpan {
                    offset: code.len() / 2,
                    width: 4,
                    kind: branch.into(),
                    text,
                    line: ix,
                });
                code.push_str("00000000");
            }
            LineKind::Hex(segments) => {
                let widths = placeholder_widths(&segments, configurations)?;
                for (segment, width) in segments.into_iter().zip(widths) {
                    let kind = match segment {
                        Segment::Hex(digits) => {
                            code.push_str(&digits);
                            continue;
                        }
                        Segment::Symbol(name) => SyntaxKind::SymbolRef { names: vec![name] },
                        Segment::Options(names) => SyntaxKind::ConfigOption { names },
                    };
                    if code.len() % 2 != 0 {
                        return Err(EvaluateError::MisalignedPlaceholder(text));
                    }
                    spans.push(SyntaxSpan {
                        offset: code.len() / 2,
                        width,
                        kind,
                        text: text.clone(),
                        line: ix,
                    });
                    code.push_str(&"00".repeat(width));
                }
            }
            LineKind::Assembly => return Err(EvaluateError::InvalidHex(text)),
        }
    }

    if code.len() % 2 != 0 {
        return Err(EvaluateError::InvalidHex(format!(
            "odd number of hex digits ({})",
            code.len()
        )));
    }

    Ok(Intermediate {
        hex: code,
        spans,
        is_assembly: false,
    })
}

/// Verify that every `.include "file"` can be found before the assembler is started.
fn check_includes(raw: &str, include_paths: &[PathBuf]) -> Result<(), EvaluateError> {
    for line in raw.lines().map(syntax::strip_comment) {
        let Some(rest) = line.strip_prefix(".include") else {
            continue;
        };
        let file = rest.trim().trim_matches('"');
        let found = Path::new(file).is_file()
            || include_paths.iter().any(|dir| dir.join(file).is_file());
        if !found {
            return Err(EvaluateError::IncludeFileMissing(file.to_owned()));
        }
    }
    Ok(())
}

/// Custom syntax on an assembly line, if any.
fn assembly_syntax(line: &str) -> Option<SyntaxKind> {
    if let Some(branch) = syntax::parse_special_branch(line) {
        Some(branch.into())
    } else if syntax::contains_symbol_reference(line) {
        Some(SyntaxKind::SymbolRef {
            names: syntax::symbol_names(line),
        })
    } else if syntax::contains_config_placeholder(line) {
        Some(SyntaxKind::ConfigOption {
            names: syntax::option_names(line),
        })
    } else {
        None
    }
}

/// Replace `<<name>>` and `[[name]]` on a line with concrete text.
fn substitute<S, O>(line: &str, mut symbol: S, mut option: O) -> Result<String, ResolveError>
where
    S: FnMut(&str) -> Result<String, ResolveError>,
    O: FnMut(&str) -> Result<String, ResolveError>,
{
    let line = syntax::replace_enclosed(line, "<<", ">>", &mut symbol)?;
    syntax::replace_enclosed(&line, "[[", "]]", &mut option)
}

#[tracing::instrument(skip(toolchain, configurations))]
fn preprocess_assembly(
    raw: &str,
    toolchain: &dyn Toolchain,
    include_paths: &[PathBuf],
    configurations: Option<&[Configuration]>,
) -> Result<Intermediate, EvaluateError> {
    check_includes(raw, include_paths)?;

    let mut source: Vec<String> = vec![];
    // Raw line number (1-based) of every generated line
    let mut line_map: Vec<usize> = vec![];
    let mut found: Vec<(SyntaxKind, String, usize)> = vec![];

    for (ix, line) in raw.lines().enumerate() {
        let text = syntax::strip_comment(line);
        match syntax::classify_line(line) {
            // Hex lines become data, each placeholder segment wrapped in its own labels.
            LineKind::Hex(segments) => {
                let widths = placeholder_widths(&segments, configurations)?;
                for (segment, width) in segments.into_iter().zip(widths) {
                    let kind = match segment {
                        Segment::Hex(digits) => {
                            let bytes = hex::decode(&digits)
                                .map_err(|_| EvaluateError::InvalidHex(text.to_owned()))?;
                            source.extend(data_directives(&bytes));
                            continue;
                        }
                        Segment::Symbol(name) => SyntaxKind::SymbolRef { names: vec![name] },
                        Segment::Options(names) => SyntaxKind::ConfigOption { names },
                    };
                    let index = found.len();
                    source.push(format!("__cs_start_{}:", index));
                    source.extend(data_directives(&vec![0; width]));
                    source.push(format!("__cs_end_{}:", index));
                    found.push((kind, text.to_owned(), ix));
                }
            }
            _ => match assembly_syntax(text) {
                None => source.push(line.to_owned()),
                Some(kind) => {
                    if let SyntaxKind::ConfigOption { names } = &kind {
                        option_width(names, configurations)?;
                    }
                    let placeholder = match &kind {
                        SyntaxKind::SpecialBranch { .. } => ".long 0".to_owned(),
                        _ => substitute(
                            text,
                            |_| Ok(PLACEHOLDER_ADDRESS.to_owned()),
                            |_| Ok("0".to_owned()),
                        )
                        .map_err(|_| EvaluateError::InvalidHex(text.to_owned()))?,
                    };
                    let index = found.len();
                    source.push(format!("__cs_start_{}:", index));
                    source.push(placeholder);
                    source.push(format!("__cs_end_{}:", index));
                    found.push((kind, text.to_owned(), ix));
                }
            },
        }
        line_map.resize(source.len(), ix + 1);
    }

    let assembly = toolchain
        .assemble(&source.join("\n"), include_paths)
        .map_err(|err| match err {
            ToolchainError::AssemblyFailed(diagnostics) => EvaluateError::AssemblyFailed(
                diagnostics.remap(|line| line_map.get(line.checked_sub(1)?).copied()),
            ),
            err => err.into(),
        })?;

    let mut bytes = assembly.bytes.clone();
    let mut spans = vec![];
    for (index, (kind, text, line)) in found.into_iter().enumerate() {
        let label = |name: &str| {
            assembly
                .labels
                .get(&format!("__cs_{}_{}", name, index))
                .copied()
                .ok_or_else(|| ToolchainError::Listing(format!("missing label for '{}'", text)))
        };
        let (start, end) = (label("start")?, label("end")?);
        if end < start || end > bytes.len() {
            return Err(ToolchainError::Listing(format!("bad span for '{}'", text)).into());
        }
        bytes[start..end].fill(0);
        spans.push(SyntaxSpan {
            offset: start,
            width: end - start,
            kind,
            text,
            line,
        });
    }

    Ok(Intermediate {
        hex: hex::encode(&bytes),
        spans,
        is_assembly: true,
    })
}

/// First pass: turn raw code into hex with zero-filled custom syntax spans.
///
/// `configurations` is `None` when the owning mod's options are not known yet, in which case
/// placeholder widths in hex code are inferred from the surrounding digits.
pub fn preprocess(
    raw: &str,
    toolchain: &dyn Toolchain,
    include_paths: &[PathBuf],
    configurations: Option<&[Configuration]>,
) -> Result<Intermediate, EvaluateError> {
    if syntax::is_assembly(raw) {
        preprocess_assembly(raw, toolchain, include_paths, configurations)
    } else {
        preprocess_hex(raw, configurations)
    }
}

fn symbol_address(name: &str, context: &ResolveContext) -> Option<u32> {
    context.symbols.address_of(name)
}

fn branch_word(
    mnemonic: BranchMnemonic,
    target: &BranchTarget,
    adjustment: i64,
    offset: usize,
    context: &ResolveContext,
) -> Result<u32, ResolveError> {
    let target = match target {
        BranchTarget::Symbol(name) => symbol_address(name, context)
            .ok_or_else(|| ResolveError::Unallocated(name.clone()))?,
        BranchTarget::Address(address) => *address,
    } as i64
        + adjustment;
    let distance = if mnemonic.is_absolute() {
        target
    } else {
        target - (context.install_address as i64 + offset as i64)
    };

    Ok(encode_branch(mnemonic, distance)?)
}

fn option_value(
    names: &[String],
    width: usize,
    context: &ResolveContext,
) -> Result<Vec<u8>, ResolveError> {
    let mut found = vec![];
    for name in names {
        found.push(
            options::find(context.configurations, name)
                .ok_or_else(|| ResolveError::ConfigOptionNotFound(name.clone()))?,
        );
    }
    let Some(first) = found.first() else {
        return Err(ResolveError::ConfigOptionNotFound(String::new()));
    };

    let packed = if found.len() == 1 {
        first.kind.pack(first.value, width)
    } else {
        // Several options OR-ed into one field
        found
            .iter()
            .map(|option| option.value.as_int())
            .try_fold(0i64, |acc, value| value.map(|value| acc | value))
            .and_then(|combined| options::pack_int(combined, width, first.kind.is_signed()))
    };

    packed.ok_or_else(|| ResolveError::OptionDoesNotFit(names.join("|"), width))
}

fn option_text(name: &str, context: &ResolveContext) -> Result<String, ResolveError> {
    options::find(context.configurations, name)
        .map(|option| option.value.to_string())
        .ok_or_else(|| ResolveError::ConfigOptionNotFound(name.to_owned()))
}

fn symbol_text(name: &str, context: &ResolveContext) -> Result<String, ResolveError> {
    symbol_address(name, context)
        .map(|address| format!("0x{:08X}", address))
        .ok_or_else(|| ResolveError::Unallocated(name.to_owned()))
}

fn span_bytes(span: &SyntaxSpan, context: &ResolveContext) -> Result<Vec<u8>, ResolveError> {
    match &span.kind {
        SyntaxKind::SpecialBranch {
            mnemonic,
            target,
            adjustment,
        } => Ok(branch_word(*mnemonic, target, *adjustment, span.offset, context)?
            .to_be_bytes()
            .to_vec()),
        SyntaxKind::SymbolRef { names } => {
            let mut bytes = vec![];
            for name in names {
                let address = symbol_address(name, context)
                    .ok_or_else(|| ResolveError::Unallocated(name.clone()))?;
                bytes.extend(address.to_be_bytes());
            }
            Ok(bytes)
        }
        SyntaxKind::ConfigOption { names } => option_value(names, span.width, context),
    }
}

/// Names of standalone functions the spans need which have no address yet.
fn outstanding_symbols(intermediate: &Intermediate, context: &ResolveContext) -> Vec<String> {
    let mut outstanding: Vec<String> = vec![];
    for span in &intermediate.spans {
        if matches!(span.kind, SyntaxKind::ConfigOption { .. }) {
            continue;
        }
        for name in span.kind.names() {
            if symbol_address(name, context).is_none() && !outstanding.iter().any(|n| n == name) {
                outstanding.push(name.to_owned());
            }
        }
    }
    outstanding
}

/// Second pass: produce the final code once addresses and option values are known.
#[tracing::instrument(skip_all, fields(install_address = context.install_address))]
pub fn resolve(
    intermediate: &Intermediate,
    raw: &str,
    context: &ResolveContext,
    toolchain: &dyn Toolchain,
) -> Result<Finalized, ResolveError> {
    let outstanding = outstanding_symbols(intermediate, context);
    if !outstanding.is_empty() {
        return Ok(Finalized::Pending {
            hex: intermediate.hex.clone(),
            outstanding,
        });
    }

    // Spans on hex lines are plain data and can be spliced in. Spans inside instructions
    // change what the assembler emits.
    let lines: Vec<&str> = raw.lines().collect();
    let needs_reassembly = intermediate.is_assembly
        && intermediate.spans.iter().any(|span| {
            !matches!(span.kind, SyntaxKind::SpecialBranch { .. })
                && lines
                    .get(span.line)
                    .is_some_and(|line| syntax::classify_line(line) == LineKind::Assembly)
        });

    if needs_reassembly {
        let mut source = vec![];
        for (ix, line) in lines.iter().enumerate() {
            let mut line_spans = intermediate.spans.iter().filter(|span| span.line == ix);
            if let LineKind::Hex(segments) = syntax::classify_line(line) {
                for segment in segments {
                    let bytes = match segment {
                        Segment::Hex(digits) => hex::decode(&digits)
                            .map_err(|err| ResolveError::InvalidHex(err.to_string()))?,
                        _ => {
                            let span = line_spans.next().ok_or(ResolveError::NotEvaluated)?;
                            span_bytes(span, context)?
                        }
                    };
                    source.extend(data_directives(&bytes));
                }
                continue;
            }

            let Some(span) = line_spans.next() else {
                source.push(line.to_string());
                continue;
            };
            source.push(match &span.kind {
                SyntaxKind::SpecialBranch {
                    mnemonic,
                    target,
                    adjustment,
                } => format!(
                    ".long 0x{:08X}",
                    branch_word(*mnemonic, target, *adjustment, span.offset, context)?
                ),
                _ => substitute(
                    &span.text,
                    |name| symbol_text(name, context),
                    |name| option_text(name, context),
                )?,
            });
        }

        let assembly = toolchain.assemble(&source.join("\n"), context.include_paths)?;
        if assembly.bytes.len() != intermediate.length() {
            return Err(ResolveError::LengthMismatch(
                intermediate.length(),
                assembly.bytes.len(),
            ));
        }
        return Ok(Finalized::Complete(assembly.hex()));
    }

    let mut bytes = hex::decode(&intermediate.hex)
        .map_err(|err| ResolveError::InvalidHex(err.to_string()))?;
    for span in &intermediate.spans {
        let value = span_bytes(span, context)?;
        if value.len() != span.width || span.end() > bytes.len() {
            return Err(ResolveError::OptionDoesNotFit(span.text.clone(), span.width));
        }
        bytes[span.offset..span.end()].copy_from_slice(&value);
    }

    Ok(Finalized::Complete(hex::encode(&bytes)))
}

/// One atomic patch.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeChange {
    pub kind: ChangeKind,
    /// DOL offset or RAM address, or the function name for standalone functions
    pub target: String,
    pub raw_code: String,
    pub annotation: Option<String>,
    /// Vanilla code at the target, as hex
    pub original_code: Option<String>,
    /// File the code was read from, relative to the mod's directory
    pub source_file: Option<PathBuf>,
    preprocessed: Option<Intermediate>,
    finished: Option<String>,
}

impl CodeChange {
    pub fn new(kind: ChangeKind, target: &str, raw_code: &str) -> Self {
        Self {
            kind,
            target: target.trim().to_owned(),
            raw_code: raw_code.to_owned(),
            annotation: None,
            original_code: None,
            source_file: None,
            preprocessed: None,
            finished: None,
        }
    }

    /// Length of the finished code in bytes, `None` until evaluated.
    pub fn length(&self) -> Option<usize> {
        self.preprocessed.as_ref().map(Intermediate::length)
    }

    pub fn preprocessed(&self) -> Option<&Intermediate> {
        self.preprocessed.as_ref()
    }

    pub fn finished(&self) -> Option<&str> {
        self.finished.as_deref()
    }

    /// Run the first pass and keep the result.
    pub fn evaluate(
        &mut self,
        toolchain: &dyn Toolchain,
        include_paths: &[PathBuf],
        configurations: Option<&[Configuration]>,
    ) -> Result<&Intermediate, EvaluateError> {
        let intermediate = preprocess(&self.raw_code, toolchain, include_paths, configurations)?;
        self.finished = None;
        Ok(self.preprocessed.insert(intermediate))
    }

    /// Run the second pass for code installed at `context.install_address`.
    pub fn finalize(
        &mut self,
        context: &ResolveContext,
        toolchain: &dyn Toolchain,
    ) -> Result<Finalized, ResolveError> {
        let intermediate = self.preprocessed.as_ref().ok_or(ResolveError::NotEvaluated)?;
        let finalized = resolve(intermediate, &self.raw_code, context, toolchain)?;
        if let Finalized::Complete(hex) = &finalized {
            self.finished = Some(hex.clone());
        }
        Ok(finalized)
    }

    /// RAM address of the patched location. Standalone functions have none until allocated.
    pub fn install_address(
        &self,
        normalizer: &dyn AddressNormalizer,
        symbols: &SymbolTable,
    ) -> Result<Option<u32>, AddressError> {
        match self.kind {
            ChangeKind::Standalone => Ok(symbols.address_of(&self.target)),
            ChangeKind::Gecko => Ok(None),
            ChangeKind::StaticOverwrite | ChangeKind::Injection => {
                normalizer.normalize(&self.target).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use crate::symbols::Symbol;
    use crate::toolchain::fake::FakeToolchain;

    use pretty_assertions::assert_eq;

    fn configurations() -> Vec<Configuration> {
        vec![
            Configuration::parse_declaration("uint16 Speed = 300; 0-1000").unwrap(),
            Configuration::parse_declaration("uint8 Lives = 4").unwrap(),
            Configuration::parse_declaration("mask8 FlagA = 0x01").unwrap(),
            Configuration::parse_declaration("mask8 FlagB = 0x04").unwrap(),
            Configuration::parse_declaration("float Gravity = 1.0").unwrap(),
        ]
    }

    fn symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols
            .new_symbol(Symbol {
                name: "Foo".to_string(),
                owner: "Test".to_string(),
                code: "blr".to_string(),
                address: Some(0x80001234),
            })
            .unwrap();
        symbols
    }

    #[test]
    fn test_static_overwrite() {
        let toolchain = FakeToolchain::default();
        let mut change = CodeChange::new(ChangeKind::StaticOverwrite, "0x804d7a4c", "38600001");
        assert_eq!(change.length(), None);

        let intermediate = change.evaluate(&toolchain, &[], Some(&[])).unwrap().clone();
        assert_eq!(intermediate.hex, "38600001");
        assert_eq!(intermediate.spans, vec![]);
        assert_eq!(change.length(), Some(4));
        assert_eq!(toolchain.calls.get(), 0);
    }

    #[test]
    fn test_placeholder_width() {
        let configurations = configurations();
        let intermediate =
            preprocess_hex("3860 [[Speed]]\n[[Lives]]000000", Some(&configurations)).unwrap();

        assert_eq!(intermediate.hex, "3860000000000000");
        assert_eq!(
            intermediate.spans.iter().map(|s| (s.offset, s.width)).collect::<Vec<_>>(),
            vec![(2, 2), (4, 1)]
        );

        // Without the mod's options the width is taken from the rest of the line.
        let intermediate = preprocess_hex("3860 [[Speed]]\n[[Lives]]000000", None).unwrap();
        assert_eq!(
            intermediate.spans.iter().map(|s| (s.offset, s.width)).collect::<Vec<_>>(),
            vec![(2, 2), (4, 1)]
        );
        let intermediate = preprocess_hex("[[Word]]", None).unwrap();
        assert_eq!(intermediate.spans[0].width, 4);
    }

    #[test]
    fn test_hex_errors() {
        let configurations = configurations();
        assert_eq!(
            preprocess_hex("3860[[Missing]]", Some(&configurations)),
            Err(EvaluateError::ConfigOptionNotFound("Missing".to_string()))
        );
        assert_eq!(
            preprocess_hex("386[[Lives]]", Some(&configurations)),
            Err(EvaluateError::MisalignedPlaceholder("386[[Lives]]".to_string()))
        );
        assert!(matches!(
            preprocess_hex("386", None),
            Err(EvaluateError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_idempotent_evaluation() {
        let toolchain = FakeToolchain::default();
        let configurations = configurations();
        let mut change = CodeChange::new(
            ChangeKind::Injection,
            "0x80005000",
            "li r3, [[Lives]]\nbl <Foo>\nblr",
        );

        let first = change.evaluate(&toolchain, &[], Some(&configurations)).unwrap().clone();
        let second = change.evaluate(&toolchain, &[], Some(&configurations)).unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first.length(), 12);
        assert_eq!(first.hex, "00000000000000004E800020");
        assert_eq!(toolchain.calls.get(), 2);
    }

    #[test]
    fn test_assembly_spans() {
        let toolchain = FakeToolchain::default();
        let configurations = configurations();
        let intermediate = preprocess(
            "nop\nbl <Foo>\nli r3, [[Lives]]\nblr",
            &toolchain,
            &[],
            Some(&configurations),
        )
        .unwrap();

        assert!(intermediate.is_assembly);
        assert_eq!(intermediate.hex, "6000000000000000000000004E800020");
        assert_eq!(intermediate.spans.len(), 2);
        assert_eq!(intermediate.spans[0].offset, 4);
        assert_eq!(intermediate.spans[0].line, 1);
        assert_eq!(intermediate.spans[1].offset, 8);
        assert_eq!(
            intermediate.spans[1].kind,
            SyntaxKind::ConfigOption {
                names: vec!["Lives".to_string()]
            }
        );
    }

    #[test]
    fn test_assembly_error_lines() {
        let toolchain = FakeToolchain::default();
        let result = preprocess("bl <Foo>\nnop\nfoo r3", &toolchain, &[], Some(&[]));

        // The branch expands to three generated lines, the error is still reported on line 3.
        match result {
            Err(EvaluateError::AssemblyFailed(diagnostics)) => {
                assert_eq!(diagnostics.0[0].line, Some(3));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_include() {
        let toolchain = FakeToolchain::default();
        assert_eq!(
            preprocess(".include \"missing.s\"\nblr", &toolchain, &[], None),
            Err(EvaluateError::IncludeFileMissing("missing.s".to_string()))
        );
    }

    #[test]
    fn test_resolve_special_branch() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let mut change = CodeChange::new(ChangeKind::Injection, "0x80376a28", "bl <Foo>");
        change.evaluate(&toolchain, &[], Some(&[])).unwrap();

        let context = ResolveContext {
            install_address: 0x80005000,
            symbols: &symbols,
            configurations: &[],
            include_paths: &[],
        };
        let finalized = change.finalize(&context, &toolchain).unwrap();

        assert_eq!(finalized, Finalized::Complete("4BFFC235".to_string()));
        assert_eq!(change.finished(), Some("4BFFC235"));
        assert_eq!(toolchain.calls.get(), 0);
    }

    #[test]
    fn test_resolve_pending() {
        let toolchain = FakeToolchain::default();
        let mut symbols = SymbolTable::new();
        symbols
            .new_symbol(Symbol {
                name: "Foo".to_string(),
                owner: "Test".to_string(),
                code: "blr".to_string(),
                address: None,
            })
            .unwrap();
        let mut change = CodeChange::new(ChangeKind::Injection, "0x80376a28", "38600001\nb <Foo>");
        change.evaluate(&toolchain, &[], Some(&[])).unwrap();

        let context = ResolveContext {
            install_address: 0x80005000,
            symbols: &symbols,
            configurations: &[],
            include_paths: &[],
        };
        assert_eq!(
            change.finalize(&context, &toolchain),
            Ok(Finalized::Pending {
                hex: "3860000100000000".to_string(),
                outstanding: vec!["Foo".to_string()],
            })
        );
        assert_eq!(change.finished(), None);

        symbols.allocate("Foo", 0x80005010).unwrap();
        let context = ResolveContext {
            install_address: 0x80005000,
            symbols: &symbols,
            configurations: &[],
            include_paths: &[],
        };
        assert_eq!(
            change.finalize(&context, &toolchain),
            Ok(Finalized::Complete("386000014800000C".to_string()))
        );
    }

    #[test]
    fn test_resolve_hex_options_and_symbols() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let mut configurations = configurations();
        configurations[1]
            .set_value(OptionValue::Int(9))
            .unwrap();

        let raw = "3860[[Speed]]\n388000[[Lives]]\n[[FlagA]]|[[FlagB]]000000\n<<Foo>>\n[[Gravity]]";
        let intermediate = preprocess(raw, &toolchain, &[], Some(&configurations)).unwrap();
        assert_eq!(intermediate.length(), 20);

        let context = ResolveContext {
            install_address: 0x80001000,
            symbols: &symbols,
            configurations: &configurations,
            include_paths: &[],
        };
        assert_eq!(
            resolve(&intermediate, raw, &context, &toolchain),
            Ok(Finalized::Complete(
                "3860012C3880000905000000800012343F800000".to_string()
            ))
        );
    }

    #[test]
    fn test_resolve_reassembles_assembly_options() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let configurations = configurations();
        let raw = "li r3, [[Lives]]\nbl <Foo>";
        let intermediate = preprocess(raw, &toolchain, &[], Some(&configurations)).unwrap();
        assert_eq!(toolchain.calls.get(), 1);

        let context = ResolveContext {
            install_address: 0x80001000,
            symbols: &symbols,
            configurations: &configurations,
            include_paths: &[],
        };
        let finalized = resolve(&intermediate, raw, &context, &toolchain).unwrap();

        // li r3, 4 followed by bl from 0x80001004 to 0x80001234
        assert_eq!(finalized, Finalized::Complete("3860000448000231".to_string()));
        assert_eq!(toolchain.calls.get(), 2);
    }

    #[test]
    fn test_hex_lines_in_assembly() {
        let toolchain = FakeToolchain::default();
        let intermediate = preprocess("38600001\nblr", &toolchain, &[], Some(&[])).unwrap();

        assert!(intermediate.is_assembly);
        assert_eq!(intermediate.hex, "386000014E800020");
        assert_eq!(intermediate.spans, vec![]);
    }

    #[test]
    fn test_hex_option_in_assembly() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let configurations = configurations();
        let raw = "3860[[Speed]]\nblr";
        let intermediate = preprocess(raw, &toolchain, &[], Some(&configurations)).unwrap();

        assert_eq!(intermediate.hex, "386000004E800020");
        assert_eq!(
            intermediate.spans.iter().map(|s| (s.offset, s.width, s.line)).collect::<Vec<_>>(),
            vec![(2, 2, 0)]
        );

        // The option sits in data, so the value is spliced without another assembler run.
        let context = ResolveContext {
            install_address: 0x80001000,
            symbols: &symbols,
            configurations: &configurations,
            include_paths: &[],
        };
        assert_eq!(
            resolve(&intermediate, raw, &context, &toolchain),
            Ok(Finalized::Complete("3860012C4E800020".to_string()))
        );
        assert_eq!(toolchain.calls.get(), 1);
    }

    #[test]
    fn test_hex_and_assembly_options_reassembled() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let configurations = configurations();
        let raw = "3860[[Speed]]\nli r4, [[Lives]]\n[[FlagA]]000000";
        let intermediate = preprocess(raw, &toolchain, &[], Some(&configurations)).unwrap();
        assert_eq!(intermediate.length(), 12);
        assert_eq!(intermediate.spans.len(), 3);

        let context = ResolveContext {
            install_address: 0x80001000,
            symbols: &symbols,
            configurations: &configurations,
            include_paths: &[],
        };
        assert_eq!(
            resolve(&intermediate, raw, &context, &toolchain),
            Ok(Finalized::Complete("3860012C3880000401000000".to_string()))
        );
        assert_eq!(toolchain.calls.get(), 2);
    }

    #[test]
    fn test_data_directives() {
        assert_eq!(
            data_directives(&[0x38, 0x60, 0x00, 0x01, 0x12, 0x34]),
            vec![".long 0x38600001", ".short 0x1234"]
        );
        assert_eq!(data_directives(&[0xAB]), vec![".byte 0xAB"]);
        assert_eq!(data_directives(&[]), Vec::<String>::new());
    }

    #[test]
    fn test_option_does_not_fit() {
        let toolchain = FakeToolchain::default();
        let symbols = symbols();
        let configurations = configurations();
        // Sized as one byte by the line, but Speed (300) needs two.
        let raw = "386000[[Speed]]";
        let intermediate = preprocess(raw, &toolchain, &[], None).unwrap();
        let context = ResolveContext {
            install_address: 0x80001000,
            symbols: &symbols,
            configurations: &configurations,
            include_paths: &[],
        };
        assert_eq!(
            resolve(&intermediate, raw, &context, &toolchain),
            Err(ResolveError::OptionDoesNotFit("Speed".to_string(), 1))
        );
    }

    #[test]
    fn test_split_annotation() {
        assert_eq!(
            split_annotation("# Skip the intro\n38600001"),
            (Some("Skip the intro".to_string()), "38600001".to_string())
        );
        assert_eq!(split_annotation("38600001"), (None, "38600001".to_string()));
    }
}
