use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::gecko::parse_gecko_code;
use super::ParseError;
use crate::code_change::{ChangeKind, CodeChange};
use crate::code_mod::amfs::{AmfsCode, AmfsDocument, BuildEntry, BuildKind, CODES_FILE};
use crate::code_mod::{CodeMod, SourceFormat, WebLink, ALL_REVISIONS};
use crate::hex;

/// Details given in the comment block at the top of a source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHeader {
    pub address: Option<String>,
    pub authors: Vec<String>,
    pub name: Option<String>,
}

fn is_banner(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|ch| ch == '#')
}

fn comment_text(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix("//")
        .or_else(|| line.strip_prefix('#'))
        .map(|text| text.trim_start_matches('#').trim())
}

/// Read the header of a source file. Either a single comment line such as
/// `# To be inserted at 80001234`, or a banner:
///
/// ```text
/// ################################
/// # Name: Faster Menus
/// # Address: 80001234
/// # Authors: Ann, Bo
/// ################################
/// ```
pub fn parse_source_header(text: &str) -> SourceHeader {
    let mut header = SourceHeader::default();
    let mut lines = text.lines().map(str::trim).skip_while(|line| line.is_empty());

    let Some(first) = lines.next() else {
        return header;
    };
    if !is_banner(first) {
        if let Some(comment) = comment_text(first) {
            let lower = comment.to_ascii_lowercase();
            if let Some(ix) = lower.find("inserted at") {
                header.address = comment[ix + "inserted at".len()..]
                    .split_whitespace()
                    .next()
                    .map(|address| address.trim_matches(':').to_owned());
            }
        }
        return header;
    }

    for line in lines.take_while(|line| !is_banner(line)) {
        let Some((key, value)) = comment_text(line).and_then(|text| text.split_once(':')) else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "address" | "inject at" | "injection address" => {
                header.address = Some(value.to_owned())
            }
            "author" | "authors" => {
                header.authors = value
                    .split(',')
                    .map(str::trim)
                    .filter(|author| !author.is_empty())
                    .map(str::to_owned)
                    .collect()
            }
            "name" | "title" => header.name = Some(value.to_owned()),
            _ => (),
        }
    }
    header
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Code from a `.bin` or `.txt` file next to an assembly source, if it is at least as new as
/// the source.
fn cached_code(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?;
    if !matches!(extension, "asm" | "s") {
        return None;
    }
    let source_time = modified(path)?;

    for cache_extension in ["bin", "txt"] {
        let cache = path.with_extension(cache_extension);
        let Some(cache_time) = modified(&cache) else {
            continue;
        };
        if cache_time < source_time {
            tracing::debug!("ignoring stale cache {}", cache.display());
            continue;
        }
        let code = match cache_extension {
            "bin" => std::fs::read(&cache)
                .ok()
                .map(|bytes| hex::format_words(&hex::encode(&bytes))),
            _ => std::fs::read_to_string(&cache)
                .ok()
                .map(|text| text.trim_end().to_owned()),
        };
        if code.is_some() {
            tracing::debug!("using cache {}", cache.display());
            return code;
        }
    }
    None
}

/// Code and header of a source file, preferring an up to date cache for the code.
pub fn read_source(path: &Path) -> Result<(String, SourceHeader), ParseError> {
    let text = std::fs::read_to_string(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => ParseError::MissingSourceFile(path.display().to_string()),
        _ => ParseError::Io(path.display().to_string(), err.to_string()),
    })?;
    let header = parse_source_header(&text);
    let code = cached_code(path).unwrap_or_else(|| text.trim_end().to_owned());
    Ok((code, header))
}

fn is_assembly_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|extension| extension.to_str()),
        Some("asm" | "s")
    )
}

/// A lone assembly file with an address in its header is a one-injection mod. Files without
/// an address are include files and yield `None`.
#[tracing::instrument]
pub fn parse_standalone_file(path: &Path) -> Result<Option<CodeMod>, ParseError> {
    let (code, header) = read_source(path)?;
    let Some(address) = header.address else {
        tracing::debug!("no address in {}, skipping", path.display());
        return Ok(None);
    };

    let name = header.name.unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let mut code_mod = CodeMod::new(&name);
    code_mod.authors = header.authors;
    code_mod.set_revision(ALL_REVISIONS);
    let mut change = CodeChange::new(ChangeKind::Injection, &address, &code);
    change.source_file = path.file_name().map(PathBuf::from);
    code_mod.push_change(change);
    code_mod.source = Some(SourceFormat::StandaloneFile {
        path: path.to_path_buf(),
    });
    Ok(Some(code_mod))
}

fn source_change(
    dir: &Path,
    kind: ChangeKind,
    source_file: &Path,
    target: Option<&str>,
) -> Result<(CodeChange, SourceHeader), ParseError> {
    let path = dir.join(source_file);
    let (code, header) = read_source(&path)?;
    let target = match kind {
        ChangeKind::Standalone => target.map(str::to_owned).or_else(|| header.name.clone()),
        _ => target.map(str::to_owned).or_else(|| header.address.clone()),
    }
    .ok_or_else(|| ParseError::MissingAddress(path.display().to_string()))?;

    let mut change = CodeChange::new(kind, &target, &code);
    change.source_file = Some(source_file.to_path_buf());
    Ok((change, header))
}

fn build_changes(dir: &Path, entry: &BuildEntry) -> Result<Vec<(CodeChange, SourceHeader)>, ParseError> {
    let missing = |field: &str| ParseError::MissingField(format!("{:?}", entry.kind), field.to_owned());
    let source_file = || entry.source_file.as_deref().ok_or_else(|| missing("sourceFile"));

    let changes = match entry.kind {
        BuildKind::Replace => {
            let address = entry.address.as_deref().ok_or_else(|| missing("address"))?;
            let value = entry.value.as_deref().ok_or_else(|| missing("value"))?;
            vec![(
                CodeChange::new(ChangeKind::StaticOverwrite, address, value),
                SourceHeader::default(),
            )]
        }
        BuildKind::Gecko => {
            let value = entry.value.as_deref().ok_or_else(|| missing("value"))?;
            parse_gecko_code(value)?
                .into_iter()
                .map(|change| (change, SourceHeader::default()))
                .collect()
        }
        BuildKind::Inject => vec![source_change(
            dir,
            ChangeKind::Injection,
            source_file()?,
            entry.address.as_deref(),
        )?],
        BuildKind::ReplaceCodeBlock => vec![source_change(
            dir,
            ChangeKind::StaticOverwrite,
            source_file()?,
            entry.address.as_deref(),
        )?],
        BuildKind::Standalone => vec![source_change(
            dir,
            ChangeKind::Standalone,
            source_file()?,
            entry.name.as_deref(),
        )?],
        BuildKind::InjectFolder => {
            let folder = entry.source_folder.as_deref().ok_or_else(|| missing("sourceFolder"))?;
            let depth = if entry.is_recursive.unwrap_or(false) {
                usize::MAX
            } else {
                1
            };
            let mut changes = vec![];
            for file in WalkDir::new(dir.join(folder))
                .max_depth(depth)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
                .filter(|file| file.file_type().is_file() && is_assembly_file(file.path()))
            {
                let relative = file.path().strip_prefix(dir).unwrap_or(file.path());
                changes.push(source_change(dir, ChangeKind::Injection, relative, None)?);
            }
            changes
        }
    };
    Ok(changes)
}

fn apply_code(code_mod: &mut CodeMod, dir: &Path, code: &AmfsCode) {
    code_mod.set_revision(&code.revision);
    for entry in &code.build {
        match build_changes(dir, entry) {
            Ok(changes) => {
                for (mut change, header) in changes {
                    if code_mod.authors.is_empty() {
                        code_mod.authors = header.authors;
                    }
                    if entry.annotation.is_some() {
                        change.annotation = entry.annotation.clone();
                    }
                    change.original_code = entry
                        .original
                        .as_deref()
                        .map(hex::normalize)
                        .filter(|original| !original.is_empty());
                    code_mod.push_change(change);
                }
            }
            Err(err) => code_mod.record_error(err.to_string(), false),
        }
    }
}

/// Read the mods of an AMFS directory. Entries with the same name are revisions of one mod.
#[tracing::instrument]
pub fn parse_amfs_dir(dir: &Path) -> Result<Vec<CodeMod>, ParseError> {
    let path = dir.join(CODES_FILE);
    let json = std::fs::read_to_string(&path)
        .map_err(|err| ParseError::Io(path.display().to_string(), err.to_string()))?;
    let document: AmfsDocument = serde_json::from_str(&json)
        .map_err(|err| ParseError::InvalidJson(path.display().to_string(), err.to_string()))?;

    let mut mods: Vec<CodeMod> = vec![];
    for code in &document.codes {
        let ix = match mods.iter().position(|code_mod| code_mod.name == code.name.trim()) {
            Some(ix) => ix,
            None => {
                let mut code_mod = CodeMod::new(&code.name);
                code_mod.authors = code.authors.clone();
                code_mod.description = code.description.to_text();
                code_mod.web_links = code
                    .web_links
                    .iter()
                    .filter_map(|link| {
                        Some(WebLink {
                            url: link.first()?.clone(),
                            comment: link.get(1).cloned(),
                        })
                    })
                    .collect();
                code_mod.validate_configurations(&code.configurations);
                code_mod.source = Some(SourceFormat::Amfs {
                    dir: dir.to_path_buf(),
                });
                mods.push(code_mod);
                mods.len() - 1
            }
        };
        apply_code(&mut mods[ix], dir, code);
    }
    Ok(mods)
}
