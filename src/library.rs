use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

use crate::code_change::ChangeKind;
use crate::code_mod::amfs::CODES_FILE;
use crate::code_mod::{CodeMod, SourceFormat};
use crate::symbols::{Symbol, SymbolError, SymbolTable};
use crate::toolchain::{Toolchain, ToolchainError};

/// Reader for `codes.json` directories and lone assembly files.
pub mod amfs;

/// Conversion of Gecko code lines into changes.
pub mod gecko;

/// Reader for the `-==-` separated text format.
pub mod legacy;

pub use amfs::{parse_amfs_dir, parse_standalone_file};
pub use gecko::parse_gecko_code;
pub use legacy::{parse_legacy_file, parse_mod};

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("Mod has no title")]
    MissingTitle,
    #[error("Invalid change header: {0}")]
    InvalidHeader(String),
    #[error("Code outside of a change: {0}")]
    OrphanCode(String),
    #[error("Invalid Gecko code line: {0}")]
    InvalidGecko(String),
    #[error("Unable to read {0}: {1}")]
    Io(String, String),
    #[error("Invalid JSON in {0}: {1}")]
    InvalidJson(String, String),
    #[error("Source file not found: {0}")]
    MissingSourceFile(String),
    #[error("No address given for {0}")]
    MissingAddress(String),
    #[error("Build entry '{0}' is missing '{1}'")]
    MissingField(String, String),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum LibraryError {
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
    #[error("Library path not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('!') || name.starts_with('.'))
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|extension| extension.to_str())
}

/// A `.txt` next to an assembly file of the same name is that file's cache.
fn is_source_cache(path: &Path) -> bool {
    ["asm", "s"]
        .iter()
        .any(|extension| path.with_extension(extension).is_file())
}

fn mod_dir(code_mod: &CodeMod) -> Option<PathBuf> {
    match code_mod.source.as_ref()? {
        SourceFormat::Amfs { dir } => Some(dir.clone()),
        SourceFormat::LegacyText { path } | SourceFormat::StandaloneFile { path } => {
            path.parent().map(Path::to_path_buf)
        }
    }
}

/// Turns a library directory into mods and keeps the table of standalone functions they define.
#[derive(Debug)]
pub struct CodeLibraryParser {
    toolchain: Box<dyn Toolchain>,
    /// Searched after each mod's own directory
    include_paths: Vec<PathBuf>,
    symbols: SymbolTable,
}

impl CodeLibraryParser {
    /// Fails when the toolchain cannot be used, since no mod could be evaluated.
    pub fn new(
        toolchain: Box<dyn Toolchain>,
        include_paths: Vec<PathBuf>,
    ) -> Result<CodeLibraryParser, LibraryError> {
        toolchain.check()?;
        Ok(CodeLibraryParser {
            toolchain,
            include_paths,
            symbols: SymbolTable::new(),
        })
    }

    pub fn toolchain(&self) -> &dyn Toolchain {
        self.toolchain.as_ref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// Find and parse every mod below `root`. Mods that fail to parse are logged and skipped,
    /// mods with problems are returned with their errors recorded.
    #[tracing::instrument(skip(self))]
    pub fn parse_library(&mut self, root: &Path) -> Result<Vec<CodeMod>, LibraryError> {
        if !root.exists() {
            return Err(LibraryError::NotFound(root.display().to_string()));
        }

        let mut mods = vec![];
        let mut walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("{}", err);
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if path.join(CODES_FILE).is_file() {
                    match amfs::parse_amfs_dir(path) {
                        Ok(found) => mods.extend(found),
                        Err(err) => tracing::error!("skipping {}: {}", path.display(), err),
                    }
                    walker.skip_current_dir();
                }
                continue;
            }

            let parsed = match extension(path) {
                Some("txt") if !is_source_cache(path) => legacy::parse_legacy_file(path),
                Some("asm" | "s") => {
                    amfs::parse_standalone_file(path).map(|found| found.into_iter().collect())
                }
                _ => continue,
            };
            match parsed {
                Ok(found) => mods.extend(found),
                Err(err) => tracing::error!("skipping {}: {}", path.display(), err),
            }
        }

        tracing::debug!("found {} mods", mods.len());
        self.register(&mut mods, Some(root));
        Ok(mods)
    }

    /// Parse a single legacy text file, `codes.json` or assembly file.
    #[tracing::instrument(skip(self))]
    pub fn parse_file(&mut self, path: &Path) -> Result<Vec<CodeMod>, LibraryError> {
        if !path.exists() {
            return Err(LibraryError::NotFound(path.display().to_string()));
        }

        let mut mods = if path.is_dir() {
            amfs::parse_amfs_dir(path)?
        } else if path.file_name().is_some_and(|name| name == CODES_FILE) {
            amfs::parse_amfs_dir(path.parent().unwrap_or(Path::new(".")))?
        } else if matches!(extension(path), Some("asm" | "s")) {
            amfs::parse_standalone_file(path)?.into_iter().collect()
        } else {
            legacy::parse_legacy_file(path)?
        };

        self.register(&mut mods, None);
        Ok(mods)
    }

    /// Set include paths, register standalone functions and check that every function a mod
    /// calls is defined somewhere.
    fn register(&mut self, mods: &mut [CodeMod], root: Option<&Path>) {
        for code_mod in mods.iter_mut() {
            let mut paths: Vec<PathBuf> = mod_dir(code_mod).into_iter().collect();
            paths.extend(root.map(Path::to_path_buf));
            paths.extend(self.include_paths.iter().cloned());
            paths.dedup();
            code_mod.include_paths = paths;

            let mut failures = vec![];
            for change in code_mod.changes() {
                if change.kind != ChangeKind::Standalone {
                    continue;
                }
                let symbol = Symbol {
                    name: change.target.clone(),
                    owner: code_mod.name.clone(),
                    code: change.raw_code.clone(),
                    address: None,
                };
                let defined = self.symbols.find_symbol(&symbol.name).is_some_and(|existing| {
                    existing.owner == symbol.owner
                });
                // The first definition wins within one mod, e.g. across revisions.
                if defined {
                    continue;
                }
                if let Err(err) = self.symbols.new_symbol(symbol) {
                    failures.push(ParseError::from(err));
                }
            }
            for err in failures {
                code_mod.record_error(err.to_string(), false);
            }
        }

        for code_mod in mods.iter_mut() {
            if let Err(err) = self.required_functions(code_mod) {
                code_mod.record_error(ParseError::from(err).to_string(), false);
            }
        }
    }

    /// Every standalone function a mod needs installed, including functions those call.
    pub fn required_functions(&self, code_mod: &CodeMod) -> Result<Vec<String>, SymbolError> {
        self.symbols
            .dependency_closure(&code_mod.referenced_functions(), &code_mod.name)
    }

    /// Pre-process every change of every mod with the parser's toolchain.
    #[tracing::instrument(skip_all, fields(mods = mods.len()))]
    pub fn evaluate(&self, mods: &mut [CodeMod]) {
        for code_mod in mods.iter_mut() {
            code_mod.evaluate(self.toolchain.as_ref());
        }
    }
}
