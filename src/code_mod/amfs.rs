use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{CodeMod, WebLink};
use crate::code_change::{ChangeKind, CodeChange};
use crate::syntax;

/// Name of the mod description file in an AMFS directory.
pub const CODES_FILE: &str = "codes.json";

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AmfsError {
    #[error("Unable to write {0}: {1}")]
    Io(String, String),
    #[error("Unable to serialize {0}: {1}")]
    Json(String, String),
}

/// Contents of `codes.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmfsDocument {
    pub codes: Vec<AmfsCode>,
}

/// Description as one string or as a list of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    Lines(Vec<String>),
}

impl Default for Description {
    fn default() -> Self {
        Description::Text(String::new())
    }
}

impl Description {
    pub fn to_text(&self) -> String {
        match self {
            Description::Text(text) => text.clone(),
            Description::Lines(lines) => lines.join("\n"),
        }
    }

    fn is_empty(&self) -> bool {
        self.to_text().is_empty()
    }
}

fn default_revision() -> String {
    super::ALL_REVISIONS.to_owned()
}

/// One mod revision in `codes.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmfsCode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Description::is_empty")]
    pub description: Description,
    /// `[url]` or `[url, comment]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_links: Vec<Vec<String>>,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub configurations: Map<String, Value>,
    #[serde(default)]
    pub build: Vec<BuildEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildKind {
    /// Static overwrite given inline in `value`
    Replace,
    /// Injection read from `sourceFile`
    Inject,
    /// Static overwrite read from `sourceFile`
    ReplaceCodeBlock,
    /// Standalone function read from `sourceFile`
    Standalone,
    /// One injection per assembly file in `sourceFolder`
    InjectFolder,
    /// Gecko lines given inline in `value`
    Gecko,
}

/// One entry of a code's `build` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEntry {
    #[serde(rename = "type")]
    pub kind: BuildKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recursive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// Vanilla code at `address`, as hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
}

impl BuildEntry {
    pub fn new(kind: BuildKind) -> Self {
        Self {
            kind,
            address: None,
            name: None,
            value: None,
            source_file: None,
            source_folder: None,
            is_recursive: None,
            annotation: None,
            original: None,
        }
    }
}

/// A source file to write next to `codes.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Relative to the mod directory
    pub path: PathBuf,
    pub contents: String,
}

fn file_stem(text: &str) -> String {
    let stem: String = text
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    stem.trim_matches('_').to_owned()
}

/// Picks file names for changes that were not read from a file.
struct FileNames {
    used: HashSet<PathBuf>,
    prefix: Option<String>,
}

impl FileNames {
    fn name_for(&mut self, change: &CodeChange) -> PathBuf {
        if let Some(path) = &change.source_file {
            self.used.insert(path.clone());
            return path.clone();
        }

        let extension = if syntax::is_assembly(&change.raw_code) {
            "asm"
        } else {
            "txt"
        };
        let mut stem = file_stem(&change.target);
        if let Some(prefix) = &self.prefix {
            stem = format!("{}_{}", prefix, stem);
        }
        let mut path = PathBuf::from(format!("{}.{}", stem, extension));
        let mut counter = 2;
        while self.used.contains(&path) {
            path = PathBuf::from(format!("{}_{}.{}", stem, counter, extension));
            counter += 1;
        }
        self.used.insert(path.clone());
        path
    }
}

impl CodeMod {
    /// The mod as `codes.json` entries, one per revision, and the source files they name.
    pub fn to_amfs(&self) -> (Vec<AmfsCode>, Vec<SourceFile>) {
        let mut codes = vec![];
        let mut files = vec![];
        let mut names = FileNames {
            used: HashSet::new(),
            prefix: None,
        };

        let configurations: Map<String, Value> = self
            .configurations
            .iter()
            .filter_map(|option| {
                serde_json::to_value(option.to_raw())
                    .ok()
                    .map(|value| (option.name.clone(), value))
            })
            .collect();

        for revision in &self.revisions {
            names.prefix = (self.revisions.len() > 1).then(|| file_stem(&revision.label));
            let mut build = vec![];

            for change in &revision.changes {
                let mut entry = match change.kind {
                    ChangeKind::StaticOverwrite
                        if change.source_file.is_none() && !change.raw_code.contains('\n') =>
                    {
                        let mut entry = BuildEntry::new(BuildKind::Replace);
                        entry.value = Some(change.raw_code.clone());
                        entry
                    }
                    ChangeKind::Gecko => {
                        let mut entry = BuildEntry::new(BuildKind::Gecko);
                        entry.value = Some(change.raw_code.clone());
                        entry
                    }
                    kind => {
                        let mut entry = BuildEntry::new(match kind {
                            ChangeKind::Injection => BuildKind::Inject,
                            ChangeKind::Standalone => BuildKind::Standalone,
                            _ => BuildKind::ReplaceCodeBlock,
                        });
                        let path = names.name_for(change);
                        files.push(SourceFile {
                            path: path.clone(),
                            contents: format!("{}\n", change.raw_code),
                        });
                        entry.source_file = Some(path);
                        entry
                    }
                };
                match change.kind {
                    ChangeKind::Standalone => entry.name = Some(change.target.clone()),
                    ChangeKind::Gecko => (),
                    _ => entry.address = Some(change.target.clone()),
                }
                entry.annotation = change.annotation.clone();
                entry.original = change.original_code.clone();
                build.push(entry);
            }

            codes.push(AmfsCode {
                name: self.name.clone(),
                authors: self.authors.clone(),
                description: Description::Text(self.description.clone()),
                web_links: self
                    .web_links
                    .iter()
                    .map(|link: &WebLink| {
                        let mut entry = vec![link.url.clone()];
                        entry.extend(link.comment.clone());
                        entry
                    })
                    .collect(),
                revision: revision.label.clone(),
                configurations: configurations.clone(),
                build,
            });
        }

        (codes, files)
    }

    /// Write the mod as `codes.json` plus source files into `dir`.
    #[tracing::instrument(skip(self), fields(name = %self.name))]
    pub fn save_amfs(&self, dir: &Path) -> Result<(), AmfsError> {
        let io_error =
            |path: &Path, err: std::io::Error| AmfsError::Io(path.display().to_string(), err.to_string());
        let (codes, files) = self.to_amfs();

        for file in files {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
            }
            std::fs::write(&path, file.contents).map_err(|err| io_error(&path, err))?;
        }

        let path = dir.join(CODES_FILE);
        let json = serde_json::to_string_pretty(&AmfsDocument { codes })
            .map_err(|err| AmfsError::Json(path.display().to_string(), err.to_string()))?;
        std::fs::create_dir_all(dir).map_err(|err| io_error(dir, err))?;
        std::fs::write(&path, json).map_err(|err| io_error(&path, err))?;
        Ok(())
    }
}
