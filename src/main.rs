use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use modpatch::{
    address::{AddressNormalizer, RamAddresses},
    code_change::{ChangeKind, Finalized},
    code_mod::{build_gct, legacy::legacy_file_text, CodeMod, ALL_REVISIONS},
    hex,
    instrumentation,
    library::CodeLibraryParser,
    toolchain::{branch::assemble_branch, GnuToolchain, Toolchain, ToolchainConfig},
};

#[derive(Parser)]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[clap(long, global = true)]
    #[clap(help = "Enable chrome tracing")]
    #[clap(long_help = "Enable chrome tracing which on program exit will generate
a json file to be opened with a chrome tracing compatible
viewer.")]
    trace: bool,
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    #[clap(help = "More log output, repeat for more")]
    verbose: u8,
    #[clap(long, global = true, default_value = "powerpc-eabi-as")]
    #[clap(help = "Assembler executable")]
    assembler: PathBuf,
    #[clap(long, global = true, default_value = "vdappc")]
    #[clap(help = "Disassembler executable")]
    disassembler: PathBuf,
    #[clap(long, global = true)]
    #[clap(help = "Kill toolchain processes after this many seconds")]
    timeout: Option<u64>,
    #[clap(short = 'I', long = "include", global = true)]
    #[clap(help = "Additional directory searched for .include files")]
    include_paths: Vec<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Parse and evaluate a mod library, reporting problems")]
    #[clap(aliases = &["s"])]
    Scan(ScanArgs),
    #[clap(about = "Resolve a mod's changes at their own addresses and dump the result")]
    #[clap(aliases = &["b"])]
    Build(BuildArgs),
    #[clap(about = "Export a mod as a Gecko code or a GCT file")]
    #[clap(aliases = &["g"])]
    Gecko(GeckoArgs),
    #[clap(about = "Convert mods between the legacy text and AMFS formats")]
    #[clap(aliases = &["c"])]
    Convert(ConvertArgs),
    #[clap(about = "Disassemble hex machine code")]
    #[clap(aliases = &["d", "dis"])]
    Disassemble(DisassembleArgs),
    #[clap(about = "Encode a branch between two addresses")]
    Branch(BranchArgs),
}

#[derive(Args)]
struct ScanArgs {
    #[clap(help = "Library directory or single mod file")]
    path: PathBuf,
    #[clap(short, long)]
    #[clap(help = "Check the changes of this revision for conflicts")]
    revision: Option<String>,
}

#[derive(Args)]
struct BuildArgs {
    #[clap(help = "Mod file or AMFS directory")]
    path: PathBuf,
    #[clap(help = "Name of the mod, if the file holds several")]
    name: Option<String>,
    #[clap(short, long, default_value = "ALL")]
    revision: String,
}

#[derive(Args)]
struct GeckoArgs {
    #[clap(help = "Mod file or AMFS directory")]
    path: PathBuf,
    #[clap(help = "Name of the mod, if the file holds several")]
    name: Option<String>,
    #[clap(short, long, default_value = "ALL")]
    revision: String,
    #[clap(short, long)]
    #[clap(help = "Write a binary GCT file instead of printing the code")]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Legacy,
    Amfs,
}

#[derive(Args)]
struct ConvertArgs {
    #[clap(help = "Mod file or AMFS directory")]
    path: PathBuf,
    #[clap(short, long, value_enum)]
    to: Format,
    #[clap(short, long)]
    #[clap(help = "Output file (legacy) or directory (AMFS)")]
    output: PathBuf,
}

#[derive(Args)]
struct DisassembleArgs {
    #[clap(help = "Hex machine code, e.g. \"38600001 4E800020\"")]
    code: String,
}

#[derive(Args)]
struct BranchArgs {
    #[clap(help = "Branch mnemonic, e.g. b, bl or beq")]
    mnemonic: String,
    #[clap(help = "Address of the branch instruction")]
    from: String,
    #[clap(help = "Branch target")]
    to: String,
}

fn toolchain(cli: &Cli) -> GnuToolchain {
    GnuToolchain::new(ToolchainConfig {
        assembler: cli.assembler.clone(),
        disassembler: cli.disassembler.clone(),
        timeout: cli.timeout.map(Duration::from_secs),
        ..ToolchainConfig::default()
    })
}

fn parser(cli: &Cli) -> Result<CodeLibraryParser> {
    CodeLibraryParser::new(Box::new(toolchain(cli)), cli.include_paths.clone())
        .context("Unable to use the toolchain")
}

fn load_mods(parser: &mut CodeLibraryParser, path: &Path) -> Result<Vec<CodeMod>> {
    let mut mods = if path.is_dir() && !path.join("codes.json").is_file() {
        parser.parse_library(path)
    } else {
        parser.parse_file(path)
    }
    .with_context(|| format!("Unable to read mods from {}", path.display()))?;
    parser.evaluate(&mut mods);
    Ok(mods)
}

fn select_mod(mut mods: Vec<CodeMod>, name: Option<&str>) -> Result<CodeMod> {
    match name {
        Some(name) => mods
            .into_iter()
            .find(|code_mod| code_mod.name == name)
            .ok_or_else(|| anyhow!("No mod named '{}'", name)),
        None if mods.len() == 1 => Ok(mods.remove(0)),
        None => bail!(
            "Found {} mods, pick one of: {}",
            mods.len(),
            mods.iter()
                .map(|code_mod| code_mod.name.as_str())
                .collect::<Vec<&str>>()
                .join(", ")
        ),
    }
}

fn scan(cli: &Cli, args: &ScanArgs) -> Result<()> {
    let mut parser = parser(cli)?;
    let mut mods = load_mods(&mut parser, &args.path)?;

    if let Some(revision) = &args.revision {
        for code_mod in mods.iter_mut() {
            code_mod.assess_for_conflicts(revision, &RamAddresses, parser.symbols());
        }
    }

    let mut broken = 0;
    for code_mod in &mods {
        let revisions: Vec<&str> = code_mod
            .revisions
            .iter()
            .map(|revision| revision.label.as_str())
            .collect();
        if code_mod.is_available() {
            println!("ok      {} [{}]", code_mod.name, revisions.join(", "));
        } else {
            broken += 1;
            println!("broken  {} [{}]", code_mod.name, revisions.join(", "));
            for error in code_mod.errors() {
                println!("        {}", error);
            }
        }
    }
    println!(
        "{} mods, {} standalone functions, {} broken",
        mods.len(),
        parser.symbols().symbols.len(),
        broken
    );
    Ok(())
}

fn build(cli: &Cli, args: &BuildArgs) -> Result<()> {
    let mut parser = parser(cli)?;
    let mods = load_mods(&mut parser, &args.path)?;
    let mut code_mod = select_mod(mods, args.name.as_deref())?;

    let labels: Vec<String> = code_mod
        .revisions
        .iter()
        .filter(|revision| revision.label == args.revision || revision.label == ALL_REVISIONS)
        .map(|revision| revision.label.clone())
        .collect();

    for label in labels {
        let changes: Vec<(ChangeKind, String)> = code_mod
            .revision(&label)
            .map(|revision| {
                revision
                    .changes
                    .iter()
                    .map(|change| (change.kind, change.target.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (index, (kind, target)) in changes.into_iter().enumerate() {
            let address = match kind {
                ChangeKind::Gecko => continue,
                ChangeKind::Standalone => match parser.symbols().address_of(&target) {
                    Some(address) => address,
                    None => {
                        println!("<{}> has no address, skipped", target);
                        continue;
                    }
                },
                _ => RamAddresses
                    .normalize(&target)
                    .with_context(|| format!("Unable to place {} {}", kind, target))?,
            };
            let finalized = code_mod
                .finalize(&label, index, address, parser.symbols(), parser.toolchain())
                .with_context(|| format!("Unable to resolve {} {}", kind, target))?;
            match finalized {
                Finalized::Complete(code) => {
                    let bytes = hex::decode(&code)?;
                    println!("{} {}", kind, target);
                    println!("{}", hex::hexdump(&bytes, address, 16));
                }
                Finalized::Pending { outstanding, .. } => {
                    println!("{} {} waits for {}", kind, target, outstanding.join(", "));
                }
            }
        }
    }
    Ok(())
}

fn gecko(cli: &Cli, args: &GeckoArgs) -> Result<()> {
    let mut parser = parser(cli)?;
    let mods = load_mods(&mut parser, &args.path)?;
    let code_mod = select_mod(mods, args.name.as_deref())?;
    if !code_mod.is_available() {
        bail!("{} has errors:\n{}", code_mod.name, code_mod.errors().join("\n"));
    }

    match &args.output {
        Some(output) => {
            let records = code_mod.to_gecko_records(
                &args.revision,
                &RamAddresses,
                parser.symbols(),
                parser.toolchain(),
            )?;
            std::fs::write(output, build_gct(&records))
                .with_context(|| format!("Unable to write {}", output.display()))?;
        }
        None => println!(
            "{}",
            code_mod.to_gecko_string(
                &args.revision,
                &RamAddresses,
                parser.symbols(),
                parser.toolchain()
            )?
        ),
    }
    Ok(())
}

fn convert(cli: &Cli, args: &ConvertArgs) -> Result<()> {
    let mut parser = parser(cli)?;
    let mods = load_mods(&mut parser, &args.path)?;

    match args.to {
        Format::Legacy => std::fs::write(&args.output, legacy_file_text(&mods))
            .with_context(|| format!("Unable to write {}", args.output.display()))?,
        Format::Amfs => {
            for code_mod in &mods {
                let dir = args.output.join(&code_mod.name);
                code_mod
                    .save_amfs(&dir)
                    .with_context(|| format!("Unable to save {}", code_mod.name))?;
            }
        }
    }
    println!("Converted {} mods", mods.len());
    Ok(())
}

fn disassemble(cli: &Cli, args: &DisassembleArgs) -> Result<()> {
    let toolchain = toolchain(cli);
    toolchain.check()?;
    let bytes = hex::decode(&args.code).context("Invalid machine code")?;
    println!("{}", toolchain.disassemble(&bytes)?);
    Ok(())
}

fn branch(cli: &Cli, args: &BranchArgs) -> Result<()> {
    let from = RamAddresses.normalize(&args.from)?;
    let to = RamAddresses.normalize(&args.to)?;
    let distance = to as i64 - from as i64;
    println!("{}", assemble_branch(&args.mnemonic, distance, &toolchain(cli))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _trace_guard = instrumentation::init(cli.verbose, cli.trace);

    match &cli.command {
        Command::Scan(args) => scan(&cli, args),
        Command::Build(args) => build(&cli, args),
        Command::Gecko(args) => gecko(&cli, args),
        Command::Convert(args) => convert(&cli, args),
        Command::Disassemble(args) => disassemble(&cli, args),
        Command::Branch(args) => branch(&cli, args),
    }
}
