use std::path::Path;

use super::gecko::parse_gecko_code;
use super::ParseError;
use crate::address::parse_address;
use crate::code_change::split_annotation;
use crate::code_mod::legacy::MOD_SEPARATOR;
use crate::code_mod::{CodeMod, SourceFormat, WebLink, ALL_REVISIONS};
use crate::options::Configuration;

/// Header line that starts a change.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChangeHeader {
    Offset {
        revision: String,
        offset: String,
        original: Option<String>,
        injection: bool,
        inline: Option<String>,
    },
    Standalone {
        name: String,
        revision: String,
    },
    Gecko {
        revision: String,
    },
}

/// Split a legacy text file into the text of each mod. Separator lines are dropped and the mod
/// text is kept byte for byte.
pub fn split_mods(text: &str) -> Vec<&str> {
    let mut blocks = vec![];
    let mut start = 0;
    let mut position = 0;

    for line in text.split_inclusive('\n') {
        if line.trim() == MOD_SEPARATOR {
            blocks.push(&text[start..position]);
            start = position + line.len();
        }
        position += line.len();
    }
    blocks.push(&text[start..]);

    blocks
        .into_iter()
        .filter(|block| !block.trim().is_empty())
        .collect()
}

/// `ALL`, `NTSC`, `PAL` or a region with a version such as `NTSC 1.02`.
pub fn is_revision_label(line: &str) -> bool {
    let line = line.trim();
    if line == ALL_REVISIONS {
        return true;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["NTSC" | "PAL"] => true,
        ["NTSC" | "PAL", version] => {
            version.contains('.') && version.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
        }
        _ => false,
    }
}

fn parse_authors(line: &str) -> Option<Vec<String>> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|author| !author.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

/// `<name> rest`, not for `<<name>>` references.
fn angle_bracketed(line: &str) -> Option<(&str, &str)> {
    if line.starts_with("<<") {
        return None;
    }
    let (inner, rest) = line.strip_prefix('<')?.split_once('>')?;
    Some((inner.trim(), rest.trim()))
}

fn parse_web_link(line: &str) -> Option<WebLink> {
    let (url, comment) = angle_bracketed(line)?;
    if !url.contains("://") && !url.starts_with("www.") {
        return None;
    }
    Some(WebLink {
        url: url.to_owned(),
        comment: (!comment.is_empty()).then(|| comment.to_owned()),
    })
}

fn is_table_header(line: &str) -> bool {
    (line.starts_with("Revision") || line.starts_with("Version"))
        && line.contains("--")
        && !line.contains("->")
}

fn parse_offset_header(line: &str, last_revision: Option<&str>) -> Result<ChangeHeader, ParseError> {
    let invalid = || ParseError::InvalidHeader(line.to_owned());
    let (left, right) = line.split_once("->").ok_or_else(invalid)?;
    let parts: Vec<&str> = left
        .split('-')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let is_offset = |text: &str| parse_address(text).is_some();
    let (revision, offset, original) = match parts.as_slice() {
        [offset] if is_offset(offset) => (last_revision.ok_or_else(invalid)?, *offset, None),
        [offset, original] if is_offset(offset) => {
            (last_revision.ok_or_else(invalid)?, *offset, Some(*original))
        }
        [revision, offset] => (*revision, *offset, None),
        [revision, offset, original] => (*revision, *offset, Some(*original)),
        _ => return Err(invalid()),
    };
    if !is_offset(offset) {
        return Err(invalid());
    }

    let right = right.trim();
    let injection = right.eq_ignore_ascii_case("branch");
    Ok(ChangeHeader::Offset {
        revision: revision.to_owned(),
        offset: offset.to_owned(),
        original: original.map(str::to_owned),
        injection,
        inline: (!injection && !right.is_empty()).then(|| right.to_owned()),
    })
}

fn is_offset_header(line: &str) -> bool {
    line.contains("---") && line.contains("->")
}

fn parse_standalone_header(line: &str) -> Option<ChangeHeader> {
    let (name, revision) = angle_bracketed(line)?;
    if name.is_empty() || name.contains("://") || !is_revision_label(revision) {
        return None;
    }
    Some(ChangeHeader::Standalone {
        name: name.to_owned(),
        revision: revision.to_owned(),
    })
}

fn is_change_start(line: &str) -> bool {
    is_offset_header(line) || parse_standalone_header(line).is_some() || is_revision_label(line)
}

fn parse_change_header(line: &str, last_revision: Option<&str>) -> Result<ChangeHeader, ParseError> {
    if is_offset_header(line) {
        parse_offset_header(line, last_revision)
    } else if let Some(header) = parse_standalone_header(line) {
        Ok(header)
    } else if is_revision_label(line) {
        Ok(ChangeHeader::Gecko {
            revision: line.to_owned(),
        })
    } else {
        Err(ParseError::OrphanCode(line.to_owned()))
    }
}

fn parse_configurations(code_mod: &mut CodeMod, lines: &[&str]) {
    for line in lines.iter().filter(|line| !line.trim().is_empty()) {
        let trimmed = line.trim();
        let is_member = !trimmed.contains('=') && trimmed.contains(':');
        let parsed = match code_mod.configurations.last_mut() {
            Some(option) if is_member => option
                .parse_member(trimmed)
                .map(|member| option.members.push(member)),
            _ => Configuration::parse_declaration(trimmed)
                .map(|option| code_mod.configurations.push(option)),
        };
        if let Err(err) = parsed {
            code_mod.record_error(err.to_string(), false);
        }
    }
}

/// Body lines without surrounding blank lines.
fn body_text(lines: &[&str]) -> String {
    let start = lines.iter().position(|line| !line.trim().is_empty());
    let end = lines.iter().rposition(|line| !line.trim().is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end]
            .iter()
            .map(|line| line.trim_end())
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn add_change(code_mod: &mut CodeMod, header: ChangeHeader, body: &str) -> Result<(), ParseError> {
    match header {
        ChangeHeader::Offset {
            revision,
            offset,
            original,
            injection,
            inline,
        } => {
            code_mod.set_revision(&revision);
            match (inline, injection) {
                (Some(inline), _) => {
                    code_mod.add_static_overwrite(&offset, &inline, original.as_deref());
                    if !body.is_empty() {
                        return Err(ParseError::OrphanCode(body.to_owned()));
                    }
                }
                (None, true) => code_mod.add_injection(&offset, body, original.as_deref()),
                (None, false) => code_mod.add_static_overwrite(&offset, body, original.as_deref()),
            }
        }
        ChangeHeader::Standalone { name, revision } => {
            code_mod.set_revision(&revision);
            code_mod.add_standalone(&name, body);
        }
        ChangeHeader::Gecko { revision } => {
            code_mod.set_revision(&revision);
            let (annotation, code) = split_annotation(body);
            for mut change in parse_gecko_code(&code)? {
                change.annotation = annotation.clone();
                code_mod.push_change(change);
            }
        }
    }
    Ok(())
}

/// Parse the text of one mod.
#[tracing::instrument(skip_all)]
pub fn parse_mod(text: &str) -> Result<CodeMod, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    // Comment lines above the title only survive in the original text.
    let mut ix = lines
        .iter()
        .position(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .ok_or(ParseError::MissingTitle)?;

    let mut code_mod = CodeMod::new(lines[ix]);
    ix += 1;

    let mut description = vec![];
    while ix < lines.len() {
        let trimmed = lines[ix].trim();
        if is_change_start(trimmed) {
            break;
        }
        ix += 1;

        if trimmed == "Configurations:" {
            let start = ix;
            while ix < lines.len()
                && (lines[ix].trim().is_empty() || lines[ix].starts_with([' ', '\t']))
            {
                ix += 1;
            }
            parse_configurations(&mut code_mod, &lines[start..ix]);
        } else if is_table_header(trimmed) {
            continue;
        } else if let Some(authors) = parse_authors(trimmed) {
            code_mod.authors.extend(authors);
        } else if let Some(link) = parse_web_link(trimmed) {
            code_mod.web_links.push(link);
        } else {
            description.push(lines[ix - 1]);
        }
    }
    code_mod.description = body_text(&description);

    let mut last_revision: Option<String> = None;
    while ix < lines.len() {
        let trimmed = lines[ix].trim();
        ix += 1;
        if trimmed.is_empty() {
            continue;
        }

        let header = match parse_change_header(trimmed, last_revision.as_deref()) {
            Ok(header) => header,
            Err(err) => {
                code_mod.record_error(err.to_string(), false);
                continue;
            }
        };
        let start = ix;
        while ix < lines.len() && !is_change_start(lines[ix].trim()) {
            ix += 1;
        }
        let body = body_text(&lines[start..ix]);

        if let ChangeHeader::Offset { revision, .. } = &header {
            last_revision = Some(revision.clone());
        }
        if let Err(err) = add_change(&mut code_mod, header, &body) {
            code_mod.record_error(err.to_string(), false);
        }
    }

    code_mod.set_original_text(text);
    Ok(code_mod)
}

/// Parse every mod of a legacy text file.
#[tracing::instrument]
pub fn parse_legacy_file(path: &Path) -> Result<Vec<CodeMod>, ParseError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| ParseError::Io(path.display().to_string(), err.to_string()))?;

    let mut mods = vec![];
    for block in split_mods(&text) {
        match parse_mod(block) {
            Ok(mut code_mod) => {
                code_mod.source = Some(SourceFormat::LegacyText {
                    path: path.to_path_buf(),
                });
                mods.push(code_mod);
            }
            Err(err) => tracing::warn!("{}: {}", path.display(), err),
        }
    }
    Ok(mods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_change::ChangeKind;
    use crate::options::OptionValue;

    use pretty_assertions::assert_eq;

    const EXAMPLE: &str = "Faster Menus
Skips the menu fade.
Works with every controller.
<https://example.com/thread> discussion
[Ann, Bo]
Configurations:
    uint8 Frames = 2; 0-10 # Frames to wait
        0: Instant
        2: Normal
Revision ---- DOL Offset ---- Hex to Replace ---------- ASM Code
NTSC 1.02 ---- 0x80001000 ---- 38600000 -> 38600001
------------- 0x80001004 ---- 38800000 ->
# Two words
38800001
38A00001
NTSC 1.02 ---- 0x80002000 ---- 7C0802A6 -> Branch
li r3, [[Frames]]
b 0x80002004

<Helper> NTSC 1.02
blr
PAL
04001000 38600001
";

    #[test]
    fn test_split_mods() {
        let text = "First\n38600001\n-==-\n\nSecond\n  -==-  \nThird";
        assert_eq!(split_mods(text), vec!["First\n38600001\n", "\nSecond\n", "Third"]);
    }

    #[test]
    fn test_is_revision_label() {
        assert!(is_revision_label("NTSC 1.02"));
        assert!(is_revision_label("PAL"));
        assert!(is_revision_label("ALL"));
        assert!(!is_revision_label("NTSC rules"));
        assert!(!is_revision_label("blr"));
    }

    #[test]
    fn test_parse_mod() {
        let code_mod = parse_mod(EXAMPLE).unwrap();

        assert_eq!(code_mod.name, "Faster Menus");
        assert_eq!(
            code_mod.description,
            "Skips the menu fade.\nWorks with every controller."
        );
        assert_eq!(code_mod.authors, vec!["Ann", "Bo"]);
        assert_eq!(
            code_mod.web_links,
            vec![WebLink {
                url: "https://example.com/thread".to_string(),
                comment: Some("discussion".to_string()),
            }]
        );
        assert_eq!(code_mod.configurations.len(), 1);
        assert_eq!(code_mod.configurations[0].default, OptionValue::Int(2));
        assert_eq!(code_mod.configurations[0].members.len(), 2);
        assert_eq!(code_mod.errors(), &[] as &[String]);

        let ntsc = code_mod.revision("NTSC 1.02").unwrap();
        let summary: Vec<(ChangeKind, &str, &str)> = ntsc
            .changes
            .iter()
            .map(|c| (c.kind, c.target.as_str(), c.raw_code.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::StaticOverwrite, "0x80001000", "38600001"),
                (ChangeKind::StaticOverwrite, "0x80001004", "38800001\n38A00001"),
                (ChangeKind::Injection, "0x80002000", "li r3, [[Frames]]\nb 0x80002004"),
                (ChangeKind::Standalone, "Helper", "blr"),
            ]
        );
        assert_eq!(ntsc.changes[1].annotation, Some("Two words".to_string()));
        assert_eq!(ntsc.changes[1].original_code, Some("38800000".to_string()));
        assert_eq!(ntsc.changes[2].original_code, Some("7C0802A6".to_string()));

        let pal = code_mod.revision("PAL").unwrap();
        assert_eq!(pal.changes[0].kind, ChangeKind::StaticOverwrite);
        assert_eq!(pal.changes[0].target, "0x80001000");

        // Unmodified mods are written back exactly.
        assert_eq!(code_mod.to_legacy_text(), EXAMPLE);
    }

    #[test]
    fn test_round_trip() {
        let mut code_mod = parse_mod(EXAMPLE).unwrap();
        code_mod.mark_modified();
        let written = code_mod.to_legacy_text();
        let reparsed = parse_mod(&written).unwrap();

        assert_eq!(reparsed.name, code_mod.name);
        assert_eq!(reparsed.description, code_mod.description);
        assert_eq!(reparsed.authors, code_mod.authors);
        assert_eq!(reparsed.web_links, code_mod.web_links);
        assert_eq!(reparsed.configurations, code_mod.configurations);
        assert_eq!(reparsed.revisions, code_mod.revisions);
    }

    #[test]
    fn test_comment_above_title() {
        let text = "# Note from the library maintainer
Return One
Returns one.
[Ann]
NTSC 1.02 ---- 0x80001000 ---- 38600000 -> 38600001
";
        let code_mod = parse_mod(text).unwrap();

        assert_eq!(code_mod.name, "Return One");
        assert_eq!(code_mod.description, "Returns one.");
        assert_eq!(code_mod.authors, vec!["Ann"]);
        assert_eq!(code_mod.to_legacy_text(), text);
    }

    // ** Error cases **
    #[test]
    fn test_missing_title() {
        assert_eq!(parse_mod("\n  \n").unwrap_err(), ParseError::MissingTitle);
        assert_eq!(parse_mod("# only a note\n").unwrap_err(), ParseError::MissingTitle);
    }

    #[test]
    fn test_broken_changes_are_recorded() {
        let code_mod = parse_mod(
            "Broken
---- 0x80001000 ---- -> 38600001
NTSC 1.02 ---- 0x80001000 ---- -> 38600001
stray
",
        )
        .unwrap();

        assert_eq!(
            code_mod.errors(),
            &[
                "Invalid change header: ---- 0x80001000 ---- -> 38600001".to_string(),
                "Code outside of a change: stray".to_string(),
            ]
        );
        assert!(code_mod.has_parsing_error());
        assert_eq!(code_mod.revision("NTSC 1.02").unwrap().changes.len(), 1);
    }
}
