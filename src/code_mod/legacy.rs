use super::{CodeMod, Revision};
use crate::code_change::{ChangeKind, CodeChange};

/// Line separating mods in a legacy text file.
pub const MOD_SEPARATOR: &str = "-==-";

/// Column header written above the first offset change.
pub const TABLE_HEADER: &str = "Revision ---- DOL Offset ---- Hex to Replace ---------- ASM Code";

fn code_with_annotation(change: &CodeChange) -> String {
    match &change.annotation {
        Some(annotation) => format!("# {}\n{}", annotation, change.raw_code),
        None => change.raw_code.clone(),
    }
}

fn change_text(revision: &str, change: &CodeChange) -> String {
    let code = code_with_annotation(change);
    match change.kind {
        ChangeKind::StaticOverwrite | ChangeKind::Injection => {
            let header = match change.original_code.as_deref() {
                Some(original) => format!("{} ---- {} ---- {} ->", revision, change.target, original),
                None => format!("{} ---- {} ---- ->", revision, change.target),
            };
            if change.kind == ChangeKind::Injection {
                format!("{} Branch\n{}", header, code)
            } else if !code.is_empty() && !code.contains('\n') {
                format!("{} {}", header, code)
            } else {
                format!("{}\n{}", header, code)
            }
        }
        ChangeKind::Standalone => format!("<{}> {}\n{}", change.target, revision, code),
        ChangeKind::Gecko => format!("{}\n{}", revision, code),
    }
}

fn has_offset_changes(revisions: &[Revision]) -> bool {
    revisions.iter().flat_map(|r| r.changes.iter()).any(|change| {
        matches!(
            change.kind,
            ChangeKind::StaticOverwrite | ChangeKind::Injection
        )
    })
}

impl CodeMod {
    /// The mod in the legacy text format. A mod read from text and not modified since is
    /// returned exactly as it was read.
    pub fn to_legacy_text(&self) -> String {
        if let Some(text) = self.original_text() {
            return text.to_owned();
        }

        let mut lines = vec![self.name.clone()];
        if !self.description.is_empty() {
            lines.push(self.description.clone());
        }
        for link in &self.web_links {
            match &link.comment {
                Some(comment) => lines.push(format!("<{}> {}", link.url, comment)),
                None => lines.push(format!("<{}>", link.url)),
            }
        }
        if !self.authors.is_empty() {
            lines.push(format!("[{}]", self.authors.join(", ")));
        }

        if !self.configurations.is_empty() {
            lines.push("Configurations:".to_owned());
            for option in &self.configurations {
                lines.push(format!("    {}", option.declaration()));
                for member in &option.members {
                    lines.push(format!("        {}", option.member_line(member)));
                }
            }
        }

        if has_offset_changes(&self.revisions) {
            lines.push(TABLE_HEADER.to_owned());
        }
        for revision in &self.revisions {
            for change in &revision.changes {
                lines.push(change_text(&revision.label, change));
            }
        }

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// A complete legacy text file holding `mods`.
pub fn legacy_file_text(mods: &[CodeMod]) -> String {
    mods.iter()
        .map(CodeMod::to_legacy_text)
        .collect::<Vec<String>>()
        .join(&format!("{}\n", MOD_SEPARATOR))
}
