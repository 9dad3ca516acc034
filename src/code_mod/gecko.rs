use thiserror::Error;

use super::{resolve_change, CodeMod};
use crate::address::{AddressError, AddressNormalizer};
use crate::code_change::{ChangeKind, CodeChange, Finalized, Intermediate, ResolveError};
use crate::hex;
use crate::symbols::SymbolTable;
use crate::syntax::{self, BranchMnemonic, BranchTarget, SyntaxKind};
use crate::toolchain::Toolchain;

/// First line of every GCT file.
pub const GCT_HEADER: [u8; 8] = [0x00, 0xD0, 0xC0, 0xDE, 0x00, 0xD0, 0xC0, 0xDE];
/// Last line of every GCT file.
pub const GCT_FOOTER: [u8; 8] = [0xF0, 0, 0, 0, 0, 0, 0, 0];

const NOP: [u8; 4] = [0x60, 0x00, 0x00, 0x00];

#[derive(Error, Debug, PartialEq, Clone)]
pub enum GeckoError {
    #[error("Standalone functions cannot be expressed as Gecko codes: <{0}>")]
    StandaloneUnsupported(String),
    #[error("{0} depends on addresses a Gecko code cannot know")]
    AddressDependent(String),
    #[error("{0} references functions without an address: {1}")]
    Unresolved(String, String),
    #[error("{0} has not been evaluated")]
    NotEvaluated(String),
    #[error("Invalid Gecko code: {0}")]
    InvalidCode(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// One Gecko code line group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeckoRecord {
    /// 00/02/04/06 write, chosen by the length of `bytes`
    Write { address: u32, bytes: Vec<u8> },
    /// C2 insert-assembly at `address`
    Inject { address: u32, code: Vec<u8> },
    /// Lines carried over verbatim
    Raw(Vec<u8>),
}

/// Code type byte and the low 25 bits of the address. Addresses in 0x81xxxxxx set the lowest
/// bit of the code type.
fn address_word(code_type: u8, address: u32) -> [u8; 4] {
    (((code_type as u32) << 24) | (address & 0x01FF_FFFF)).to_be_bytes()
}

impl GeckoRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        match self {
            GeckoRecord::Write { address, bytes } => match bytes.as_slice() {
                [byte] => {
                    out.extend(address_word(0x00, *address));
                    out.extend([0, 0, 0, *byte]);
                }
                [high, low] => {
                    out.extend(address_word(0x02, *address));
                    out.extend([0, 0, *high, *low]);
                }
                [_, _, _, _] => {
                    out.extend(address_word(0x04, *address));
                    out.extend(bytes);
                }
                _ => {
                    out.extend(address_word(0x06, *address));
                    out.extend((bytes.len() as u32).to_be_bytes());
                    out.extend(bytes);
                    out.resize(out.len().div_ceil(8) * 8, 0);
                }
            },
            GeckoRecord::Inject { address, code } => {
                let mut payload = code.clone();
                payload.resize(payload.len().div_ceil(4) * 4, 0);
                // The payload ends with a zero word in the last line's second half.
                if payload.len() % 8 == 0 {
                    payload.extend(NOP);
                }
                payload.extend([0; 4]);

                out.extend(address_word(0xC2, *address));
                out.extend(((payload.len() / 8) as u32).to_be_bytes());
                out.extend(payload);
            }
            GeckoRecord::Raw(bytes) => out.extend(bytes),
        }
        out
    }

    /// Text lines of two words each.
    pub fn to_text(&self) -> String {
        self.to_bytes()
            .chunks(8)
            .map(|line| {
                if line.len() > 4 {
                    let (first, second) = line.split_at(4);
                    format!("{} {}", hex::encode(first), hex::encode(second))
                } else {
                    hex::encode(line)
                }
            })
            .collect::<Vec<String>>()
            .join("\n")
    }
}

/// A complete GCT file: header, every record, footer.
pub fn build_gct(records: &[GeckoRecord]) -> Vec<u8> {
    let mut gct = GCT_HEADER.to_vec();
    for record in records {
        gct.extend(record.to_bytes());
    }
    gct.extend(GCT_FOOTER);
    gct
}

fn describe(change: &CodeChange) -> String {
    format!("{} {}", change.kind, change.target)
}

/// The final branch back of an injection, which a C2 code does on its own.
fn ends_with_return(intermediate: &Intermediate) -> bool {
    intermediate.spans.last().is_some_and(|span| {
        span.end() == intermediate.length()
            && matches!(
                span.kind,
                SyntaxKind::SpecialBranch {
                    mnemonic: BranchMnemonic::B,
                    target: BranchTarget::Address(_),
                    ..
                }
            )
    })
}

impl CodeMod {
    fn gecko_code(
        &self,
        change: &CodeChange,
        address: u32,
        symbols: &SymbolTable,
        toolchain: &dyn Toolchain,
    ) -> Result<Vec<u8>, GeckoError> {
        match resolve_change(self, change, address, symbols, toolchain) {
            Ok(Finalized::Complete(code)) => {
                hex::decode(&code).map_err(|err| GeckoError::InvalidCode(err.to_string()))
            }
            Ok(Finalized::Pending { outstanding, .. }) => Err(GeckoError::Unresolved(
                describe(change),
                outstanding.join(", "),
            )),
            Err(ResolveError::NotEvaluated) => Err(GeckoError::NotEvaluated(describe(change))),
            Err(err) => Err(err.into()),
        }
    }

    /// Gecko records for the changes of a revision. The changes must have been evaluated.
    #[tracing::instrument(skip(self, normalizer, symbols, toolchain), fields(name = %self.name))]
    pub fn to_gecko_records(
        &self,
        revision: &str,
        normalizer: &dyn AddressNormalizer,
        symbols: &SymbolTable,
        toolchain: &dyn Toolchain,
    ) -> Result<Vec<GeckoRecord>, GeckoError> {
        let mut records = vec![];

        for change in self.changes_for(revision) {
            match change.kind {
                ChangeKind::Standalone => {
                    return Err(GeckoError::StandaloneUnsupported(change.target.clone()));
                }
                ChangeKind::Gecko => {
                    let code: String = change.raw_code.lines().map(syntax::strip_comment).collect();
                    let bytes = hex::decode(&code)
                        .map_err(|err| GeckoError::InvalidCode(err.to_string()))?;
                    records.push(GeckoRecord::Raw(bytes));
                }
                ChangeKind::StaticOverwrite => {
                    let address = normalizer.normalize(&change.target)?;
                    let bytes = self.gecko_code(change, address, symbols, toolchain)?;
                    if !bytes.is_empty() {
                        records.push(GeckoRecord::Write { address, bytes });
                    }
                }
                ChangeKind::Injection => {
                    let address = normalizer.normalize(&change.target)?;
                    let intermediate = change
                        .preprocessed()
                        .ok_or_else(|| GeckoError::NotEvaluated(describe(change)))?;
                    let returns = ends_with_return(intermediate);
                    let dependent = intermediate
                        .spans
                        .iter()
                        .filter(|span| !matches!(span.kind, SyntaxKind::ConfigOption { .. }))
                        .count();
                    if dependent > usize::from(returns) {
                        return Err(GeckoError::AddressDependent(describe(change)));
                    }

                    let mut code = self.gecko_code(change, address, symbols, toolchain)?;
                    if returns {
                        code.truncate(code.len().saturating_sub(4));
                    }
                    records.push(GeckoRecord::Inject { address, code });
                }
            }
        }

        Ok(records)
    }

    /// The mod as a textual Gecko code: `$Title [Authors]`, `*description` lines, code lines.
    pub fn to_gecko_string(
        &self,
        revision: &str,
        normalizer: &dyn AddressNormalizer,
        symbols: &SymbolTable,
        toolchain: &dyn Toolchain,
    ) -> Result<String, GeckoError> {
        let records = self.to_gecko_records(revision, normalizer, symbols, toolchain)?;

        let mut lines = vec![if self.authors.is_empty() {
            format!("${}", self.name)
        } else {
            format!("${} [{}]", self.name, self.authors.join(", "))
        }];
        for line in self.description.lines() {
            lines.push(format!("*{}", line));
        }
        for record in &records {
            lines.push(record.to_text());
        }
        Ok(lines.join("\n"))
    }
}
