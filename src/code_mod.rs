use std::fmt;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::address::AddressNormalizer;
use crate::code_change::{
    self, split_annotation, ChangeKind, CodeChange, EvaluateError, Finalized, ResolveContext,
    ResolveError,
};
use crate::hex;
use crate::options::{Configuration, OptionError, OptionValue, RawConfiguration};
use crate::symbols::SymbolTable;
use crate::toolchain::Toolchain;

/// The `codes.json` document and its conversion from and to mods.
pub mod amfs;

/// Gecko code records and GCT files.
pub mod gecko;

/// Writer for the legacy text format.
pub mod legacy;

pub use gecko::{build_gct, GeckoError, GeckoRecord};

/// Revision whose changes apply to every game version.
pub const ALL_REVISIONS: &str = "ALL";

/// Where a mod was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFormat {
    /// A mod inside a `-==-` separated text file
    LegacyText { path: PathBuf },
    /// A directory with a `codes.json`
    Amfs { dir: PathBuf },
    /// A lone assembly file with an address header
    StandaloneFile { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebLink {
    pub url: String,
    pub comment: Option<String>,
}

/// Changes for one game revision, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub label: String,
    pub changes: Vec<CodeChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Two changes start at the same address
    SharedAddress,
    /// Two changes partially overlap
    Overlap,
    /// The vanilla code at the target differs from what the change expects
    OriginalMismatch,
}

/// Memory written by one change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: ChangeKind,
    pub target: String,
    pub address: u32,
    pub length: usize,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.address as u64 + self.length as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub first: Region,
    /// The other change, absent for [`ConflictKind::OriginalMismatch`]
    pub second: Option<Region>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let region = |region: &Region| {
            format!(
                "{} at {:#010x} ({:#x} bytes)",
                region.kind, region.address, region.length
            )
        };
        match (&self.kind, &self.second) {
            (ConflictKind::SharedAddress, Some(second)) => write!(
                f,
                "Conflict: {} and {} share an address",
                region(&self.first),
                region(second)
            ),
            (ConflictKind::Overlap, Some(second)) => write!(
                f,
                "Conflict: {} overlaps {}",
                region(&self.first),
                region(second)
            ),
            _ => write!(
                f,
                "Conflict: original code at {} does not match the game",
                region(&self.first)
            ),
        }
    }
}

/// Find overlapping regions. The result does not depend on the order of `regions`, and regions
/// that merely touch are not reported.
pub fn find_overlaps(regions: &[Region]) -> Vec<Conflict> {
    let mut sorted: Vec<&Region> = regions.iter().filter(|region| region.length > 0).collect();
    sorted.sort_by(|a, b| {
        (a.address, a.length, &a.target).cmp(&(b.address, b.length, &b.target))
    });

    let mut conflicts = vec![];
    for (ix, first) in sorted.iter().enumerate() {
        for second in sorted[ix + 1..].iter() {
            if second.address as u64 >= first.end() {
                break;
            }
            let kind = if first.address == second.address {
                ConflictKind::SharedAddress
            } else {
                ConflictKind::Overlap
            };
            conflicts.push(Conflict {
                kind,
                first: (*first).clone(),
                second: Some((*second).clone()),
            });
        }
    }
    conflicts
}

/// A named set of changes with its metadata and configuration options.
#[derive(Debug, Clone)]
pub struct CodeMod {
    pub name: String,
    pub authors: Vec<String>,
    pub description: String,
    pub web_links: Vec<WebLink>,
    pub revisions: Vec<Revision>,
    pub configurations: Vec<Configuration>,
    pub source: Option<SourceFormat>,
    /// Searched for `.include` files when assembling
    pub include_paths: Vec<PathBuf>,
    current_revision: String,
    errors: Vec<String>,
    has_parsing_error: bool,
    has_assembly_error: bool,
    /// Text the mod was read from, re-emitted while the mod is unmodified
    original_text: Option<String>,
}

impl CodeMod {
    pub fn new(name: &str) -> CodeMod {
        CodeMod {
            name: name.trim().to_owned(),
            authors: vec![],
            description: String::new(),
            web_links: vec![],
            revisions: vec![],
            configurations: vec![],
            source: None,
            include_paths: vec![],
            current_revision: ALL_REVISIONS.to_owned(),
            errors: vec![],
            has_parsing_error: false,
            has_assembly_error: false,
            original_text: None,
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_parsing_error(&self) -> bool {
        self.has_parsing_error
    }

    pub fn has_assembly_error(&self) -> bool {
        self.has_assembly_error
    }

    /// A mod with parsing or assembly errors cannot be installed.
    pub fn is_available(&self) -> bool {
        !self.has_parsing_error && !self.has_assembly_error
    }

    /// Record a problem with the mod. Repeated messages are only kept once.
    pub fn record_error(&mut self, message: impl Into<String>, assembly: bool) {
        let message = message.into();
        if assembly {
            self.has_assembly_error = true;
        } else {
            self.has_parsing_error = true;
        }
        if !self.errors.contains(&message) {
            tracing::warn!("{}: {}", self.name, message);
            self.errors.push(message);
        }
    }

    pub(crate) fn set_original_text(&mut self, text: &str) {
        self.original_text = Some(text.to_owned());
    }

    pub fn original_text(&self) -> Option<&str> {
        self.original_text.as_deref()
    }

    /// Forget the text the mod was read from, so it is written out from its fields.
    pub fn mark_modified(&mut self) {
        self.original_text = None;
    }

    /// Make `label` the revision that following `add_*` calls append to.
    pub fn set_revision(&mut self, label: &str) {
        let label = label.trim();
        if self.revision(label).is_none() {
            self.revisions.push(Revision {
                label: label.to_owned(),
                changes: vec![],
            });
        }
        self.current_revision = label.to_owned();
        self.mark_modified();
    }

    pub fn current_revision(&self) -> &str {
        &self.current_revision
    }

    pub fn revision(&self, label: &str) -> Option<&Revision> {
        self.revisions.iter().find(|revision| revision.label == label)
    }

    /// Changes for a game revision, including those that apply to every revision.
    pub fn changes_for(&self, label: &str) -> Vec<&CodeChange> {
        self.revisions
            .iter()
            .filter(|revision| revision.label == label || revision.label == ALL_REVISIONS)
            .flat_map(|revision| revision.changes.iter())
            .collect()
    }

    pub fn changes(&self) -> impl Iterator<Item = &CodeChange> {
        self.revisions.iter().flat_map(|revision| revision.changes.iter())
    }

    /// Append a change to the current revision as is.
    pub fn push_change(&mut self, change: CodeChange) {
        let label = self.current_revision.clone();
        if self.revision(&label).is_none() {
            self.revisions.push(Revision {
                label: label.clone(),
                changes: vec![],
            });
        }
        if let Some(revision) = self.revisions.iter_mut().find(|r| r.label == label) {
            revision.changes.push(change);
        }
        self.mark_modified();
    }

    fn add(&mut self, kind: ChangeKind, target: &str, raw_code: &str, original: Option<&str>) {
        let (annotation, code) = split_annotation(raw_code);
        let mut change = CodeChange::new(kind, target, code.trim_end());
        change.annotation = annotation;
        change.original_code = original
            .map(hex::normalize)
            .filter(|original| !original.is_empty());
        self.push_change(change);
    }

    pub fn add_static_overwrite(&mut self, offset: &str, raw_code: &str, original: Option<&str>) {
        self.add(ChangeKind::StaticOverwrite, offset, raw_code, original);
    }

    pub fn add_injection(&mut self, offset: &str, raw_code: &str, original: Option<&str>) {
        self.add(ChangeKind::Injection, offset, raw_code, original);
    }

    pub fn add_standalone(&mut self, name: &str, raw_code: &str) {
        self.add(ChangeKind::Standalone, name, raw_code, None);
    }

    pub fn add_gecko(&mut self, raw_code: &str) {
        self.add(ChangeKind::Gecko, "", raw_code, None);
    }

    /// Validate options read from `codes.json`. Broken entries are dropped and recorded.
    #[tracing::instrument(skip_all, fields(name = %self.name))]
    pub fn validate_configurations(&mut self, raw: &Map<String, Value>) {
        for (name, entry) in raw {
            let validated = serde_json::from_value::<RawConfiguration>(entry.clone())
                .map_err(|err| OptionError::InvalidDeclaration(format!("{}: {}", name, err)))
                .and_then(|raw| Configuration::from_raw(name, &raw));
            match validated {
                Ok(configuration) => self.configurations.push(configuration),
                Err(err) => {
                    tracing::warn!("dropping configuration '{}'", name);
                    self.record_error(err.to_string(), false);
                }
            }
        }
    }

    pub fn configuration(&self, name: &str) -> Option<&Configuration> {
        crate::options::find(&self.configurations, name)
    }

    /// Change the current value of an option.
    pub fn set_option_value(&mut self, name: &str, value: OptionValue) -> Result<(), OptionError> {
        let option = self
            .configurations
            .iter_mut()
            .find(|option| option.name == name)
            .ok_or_else(|| OptionError::InvalidDeclaration(name.to_owned()))?;
        option.set_value(value)?;
        self.mark_modified();
        Ok(())
    }

    /// Pre-process every change. Failures are recorded as mod errors.
    #[tracing::instrument(skip_all, fields(name = %self.name))]
    pub fn evaluate(&mut self, toolchain: &dyn Toolchain) {
        let mut failures: Vec<(String, EvaluateError)> = vec![];
        for revision in self.revisions.iter_mut() {
            for change in revision.changes.iter_mut() {
                if let Err(err) =
                    change.evaluate(toolchain, &self.include_paths, Some(&self.configurations))
                {
                    failures.push((format!("{} {}", change.kind, change.target), err));
                }
            }
        }
        for (change, err) in failures {
            self.record_error(format!("{}: {}", change, err), err.is_assembly_error());
        }
    }

    /// Resolve a change for the given install address.
    pub fn finalize(
        &mut self,
        revision: &str,
        index: usize,
        install_address: u32,
        symbols: &SymbolTable,
        toolchain: &dyn Toolchain,
    ) -> Result<Finalized, ResolveError> {
        let context = ResolveContext {
            install_address,
            symbols,
            configurations: &self.configurations,
            include_paths: &self.include_paths,
        };
        let change = self
            .revisions
            .iter_mut()
            .find(|r| r.label == revision)
            .and_then(|r| r.changes.get_mut(index))
            .ok_or(ResolveError::NotEvaluated)?;
        let finalized = change.finalize(&context, toolchain);
        if let Err(err) = &finalized {
            let message = format!("{} {}: {}", change.kind, change.target, err);
            self.record_error(message, true);
        }
        finalized
    }

    /// Memory written by each change of a revision. Changes without a known address or length
    /// are left out.
    fn regions(
        &mut self,
        revision: &str,
        normalizer: &dyn AddressNormalizer,
        symbols: &SymbolTable,
    ) -> Vec<(Region, Option<String>)> {
        let mut regions = vec![];
        let mut failures = vec![];

        for change in self.changes_for(revision) {
            let length = match change.kind {
                ChangeKind::Gecko => continue,
                ChangeKind::Injection => Some(4),
                ChangeKind::StaticOverwrite | ChangeKind::Standalone => change.length(),
            };
            let address = match change.install_address(normalizer, symbols) {
                Ok(address) => address,
                Err(err) => {
                    failures.push(format!("{} {}: {}", change.kind, change.target, err));
                    continue;
                }
            };
            if let (Some(address), Some(length)) = (address, length) {
                let region = Region {
                    kind: change.kind,
                    target: change.target.clone(),
                    address,
                    length,
                };
                regions.push((region, change.original_code.clone()));
            }
        }

        for failure in failures {
            self.record_error(failure, false);
        }
        regions
    }

    /// Check the changes of a revision against each other and against the vanilla game.
    /// Conflicts are also recorded as mod errors.
    #[tracing::instrument(skip(self, normalizer, symbols), fields(name = %self.name))]
    pub fn assess_for_conflicts(
        &mut self,
        revision: &str,
        normalizer: &dyn AddressNormalizer,
        symbols: &SymbolTable,
    ) -> Vec<Conflict> {
        let regions = self.regions(revision, normalizer, symbols);

        let mut conflicts = vec![];
        for (region, original) in &regions {
            let Some(original) = original else {
                continue;
            };
            let expected_len = hex::byte_len(original);
            let Some(actual) = normalizer.original_bytes(region.address, expected_len) else {
                continue;
            };
            if hex::encode(&actual) != *original {
                conflicts.push(Conflict {
                    kind: ConflictKind::OriginalMismatch,
                    first: region.clone(),
                    second: None,
                });
            }
        }

        let regions: Vec<Region> = regions.into_iter().map(|(region, _)| region).collect();
        conflicts.extend(find_overlaps(&regions));

        for conflict in &conflicts {
            self.record_error(conflict.to_string(), false);
        }
        conflicts
    }

    /// Names of standalone functions the mod's code calls or references.
    pub fn referenced_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = vec![];
        for change in self.changes() {
            for name in crate::syntax::referenced_functions(&change.raw_code) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Resolve a change without recording anything on the mod.
pub(crate) fn resolve_change(
    code_mod: &CodeMod,
    change: &CodeChange,
    install_address: u32,
    symbols: &SymbolTable,
    toolchain: &dyn Toolchain,
) -> Result<Finalized, ResolveError> {
    let intermediate = change.preprocessed().ok_or(ResolveError::NotEvaluated)?;
    let context = ResolveContext {
        install_address,
        symbols,
        configurations: &code_mod.configurations,
        include_paths: &code_mod.include_paths,
    };
    code_change::resolve(intermediate, &change.raw_code, &context, toolchain)
}
