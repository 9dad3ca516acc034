use std::fs;
use std::path::PathBuf;

use pretty_assertions::assert_eq;

use modpatch::address::RamAddresses;
use modpatch::code_change::{ChangeKind, Finalized};
use modpatch::code_mod::legacy::legacy_file_text;
use modpatch::code_mod::{build_gct, CodeMod};
use modpatch::hex;
use modpatch::library::{parse_amfs_dir, CodeLibraryParser};
use modpatch::options::Configuration;
use modpatch::toolchain::{Assembly, Diagnostic, Diagnostics, Toolchain, ToolchainError};

/// Assembles `.long`, `nop`, `blr` and labels, which covers the placeholders the pipeline
/// emits for custom syntax.
#[derive(Debug)]
struct LongToolchain;

impl Toolchain for LongToolchain {
    fn assemble(&self, source: &str, _include_paths: &[PathBuf]) -> Result<Assembly, ToolchainError> {
        let mut assembly = Assembly::default();
        for (ix, line) in source.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(label) = line.strip_suffix(':') {
                assembly.labels.insert(label.to_string(), assembly.bytes.len());
                continue;
            }
            let word = match line.split_once(' ') {
                Some((".long", value)) => {
                    let value = value.trim();
                    match value.strip_prefix("0x") {
                        Some(digits) => u32::from_str_radix(digits, 16).ok(),
                        None => value.parse().ok(),
                    }
                }
                None if line == "nop" => Some(0x6000_0000),
                None if line == "blr" => Some(0x4E80_0020),
                _ => None,
            };
            match word {
                Some(word) => assembly.bytes.extend(word.to_be_bytes()),
                None => {
                    return Err(ToolchainError::AssemblyFailed(Diagnostics(vec![Diagnostic {
                        line: Some(ix + 1),
                        message: format!("Error: unrecognized opcode: `{}'", line),
                    }])))
                }
            }
        }
        Ok(assembly)
    }

    fn disassemble(&self, _code: &[u8]) -> Result<String, ToolchainError> {
        Err(ToolchainError::DisassemblyFailed("not supported".to_string()))
    }
}

const MODS: &str = "Return One
Makes the function return one.
[Ann]
Revision ---- DOL Offset ---- Hex to Replace ---------- ASM Code
NTSC 1.02 ---- 0x80001000 ---- 38600000 -> 38600001
NTSC 1.02 ---- 0x80002000 ---- 7C0802A6 -> Branch
nop
b 0x80002004
-==-
Helpers
[Bo]
<Helper> ALL
blr
-==-
Caller
[Bo]
NTSC 1.02 ---- 0x80005000 ---- 48000001 -> bl <Helper>
";

fn library() -> (tempfile::TempDir, CodeLibraryParser, Vec<CodeMod>) {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("mods.txt"), MODS).unwrap();

    let mut parser = CodeLibraryParser::new(Box::new(LongToolchain), vec![]).unwrap();
    let mut mods = parser.parse_library(root.path()).unwrap();
    parser.evaluate(&mut mods);
    (root, parser, mods)
}

#[test]
fn test_scan_library() {
    let (_root, parser, mods) = library();

    let names: Vec<&str> = mods.iter().map(|code_mod| code_mod.name.as_str()).collect();
    assert_eq!(names, vec!["Return One", "Helpers", "Caller"]);
    assert!(mods.iter().all(|code_mod| code_mod.is_available()));
    assert_eq!(parser.required_functions(&mods[2]).unwrap(), vec!["Helper"]);
}

#[test]
fn test_resolve_function_call() {
    let (_root, mut parser, mut mods) = library();
    let caller = &mut mods[2];

    let pending = caller
        .finalize("NTSC 1.02", 0, 0x80005000, parser.symbols(), &LongToolchain)
        .unwrap();
    assert!(matches!(pending, Finalized::Pending { .. }));

    parser.symbols_mut().allocate("Helper", 0x80001234).unwrap();
    let finished = caller
        .finalize("NTSC 1.02", 0, 0x80005000, parser.symbols(), &LongToolchain)
        .unwrap();
    assert_eq!(finished, Finalized::Complete("4BFFC235".to_string()));
}

#[test]
fn test_legacy_file_round_trip() {
    let (_root, _parser, mut mods) = library();

    // Unmodified mods are written back byte for byte.
    assert_eq!(legacy_file_text(&mods), MODS);

    for code_mod in mods.iter_mut() {
        code_mod.mark_modified();
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("written.txt");
    fs::write(&path, legacy_file_text(&mods)).unwrap();

    let mut parser = CodeLibraryParser::new(Box::new(LongToolchain), vec![]).unwrap();
    let reparsed = parser.parse_file(&path).unwrap();
    assert_eq!(reparsed.len(), mods.len());
    for (reparsed, code_mod) in reparsed.iter().zip(&mods) {
        assert_eq!(reparsed.name, code_mod.name);
        assert_eq!(reparsed.description, code_mod.description);
        assert_eq!(reparsed.authors, code_mod.authors);
        let changes = |code_mod: &CodeMod| -> Vec<(ChangeKind, String, String)> {
            code_mod
                .changes()
                .map(|change| (change.kind, change.target.clone(), change.raw_code.clone()))
                .collect()
        };
        assert_eq!(changes(reparsed), changes(code_mod));
    }
}

#[test]
fn test_amfs_round_trip() {
    let (_root, _parser, mut mods) = library();
    let mut code_mod = mods.remove(0);
    code_mod.configurations = [
        "uint16 Speed = 0x12C; 0x0-0x3E8 # Walk speed",
        "mask8 Flags = 0x05; (0x0F)",
        "float Gravity = 0.5",
        "int8 Offset = -4; -10-10",
    ]
    .into_iter()
    .map(|declaration| Configuration::parse_declaration(declaration).unwrap())
    .collect();
    let member = code_mod.configurations[3].parse_member("-4: Default").unwrap();
    code_mod.configurations[3].members.push(member);

    let dir = tempfile::tempdir().unwrap();
    code_mod.save_amfs(dir.path()).unwrap();

    let loaded = parse_amfs_dir(dir.path()).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, "Return One");
    assert_eq!(loaded[0].authors, vec!["Ann"]);
    assert_eq!(loaded[0].errors(), &[] as &[String]);
    assert_eq!(loaded[0].configurations, code_mod.configurations);
    assert!(loaded[0].configurations[0].hex);

    let summary = |code_mod: &CodeMod| -> Vec<(ChangeKind, String, String, Option<String>)> {
        code_mod
            .changes()
            .map(|change| {
                (
                    change.kind,
                    change.target.clone(),
                    change.raw_code.clone(),
                    change.original_code.clone(),
                )
            })
            .collect()
    };
    assert_eq!(summary(&loaded[0]), summary(&code_mod));
    assert_eq!(
        loaded[0].changes().map(|change| change.original_code.clone()).collect::<Vec<_>>(),
        vec![Some("38600000".to_string()), Some("7C0802A6".to_string())]
    );
}

#[test]
fn test_gecko_export() {
    let (_root, parser, mods) = library();
    let code_mod = &mods[0];

    assert_eq!(
        code_mod
            .to_gecko_string("NTSC 1.02", &RamAddresses, parser.symbols(), &LongToolchain)
            .unwrap(),
        "$Return One [Ann]
*Makes the function return one.
04001000 38600001
C2002000 00000001
60000000 00000000"
    );

    let records = code_mod
        .to_gecko_records("NTSC 1.02", &RamAddresses, parser.symbols(), &LongToolchain)
        .unwrap();
    assert_eq!(
        hex::encode(&build_gct(&records)),
        "00D0C0DE00D0C0DE\
         0400100038600001\
         C200200000000001\
         6000000000000000\
         F000000000000000"
    );
}
