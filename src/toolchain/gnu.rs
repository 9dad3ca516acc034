use std::ffi::OsString;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::listing::{parse_disassembly, parse_listing};
use super::{Assembly, Diagnostic, Diagnostics, Toolchain, ToolchainError};

#[cfg(windows)]
const NULL_DEVICE: &str = "nul";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Where to find the external tools and how to run them.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolchainConfig {
    pub assembler: PathBuf,
    pub disassembler: PathBuf,
    /// Directory for the scratch file handed to the disassembler
    pub scratch_dir: PathBuf,
    /// Kill a tool that runs longer than this
    pub timeout: Option<Duration>,
    /// Pass assembler warnings through instead of `--no-warn`
    pub warnings: bool,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            assembler: PathBuf::from("powerpc-eabi-as"),
            disassembler: PathBuf::from("vdappc"),
            scratch_dir: std::env::temp_dir(),
            timeout: None,
            warnings: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GnuToolchain {
    config: ToolchainConfig,
}

struct Output {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Parse `{standard input}:12: Error: message` lines.
pub fn parse_diagnostics(stderr: &str) -> Diagnostics {
    let mut diagnostics = vec![];

    for line in stderr.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if line.ends_with("Assembler messages:") {
            continue;
        }
        let located = line.split_once(':').and_then(|(_, rest)| {
            let (number, message) = rest.split_once(':')?;
            Some((number.trim().parse::<usize>().ok()?, message.trim()))
        });
        diagnostics.push(match located {
            Some((line, message)) => Diagnostic {
                line: Some(line),
                message: message.to_owned(),
            },
            None => Diagnostic {
                line: None,
                message: line.to_owned(),
            },
        });
    }

    Diagnostics(diagnostics)
}

fn find_executable(program: &Path) -> bool {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(program);
                candidate.is_file() || candidate.with_extension("exe").is_file()
            })
        })
        .unwrap_or(false)
}

fn wait_with_timeout(
    child: &mut Child,
    program: &Path,
    timeout: Duration,
) -> Result<ExitStatus, ToolchainError> {
    let io_error = |err: std::io::Error| ToolchainError::Io(program.display().to_string(), err.to_string());
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait().map_err(io_error)? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            tracing::error!("{} timed out after {:?}", program.display(), timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(ToolchainError::Timeout(
                program.display().to_string(),
                timeout,
            ));
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = vec![];
            let _ = pipe.read_to_end(&mut bytes);
            text = String::from_utf8_lossy(&bytes).into_owned();
        }
        text
    })
}

impl GnuToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    fn assembler_args(&self, include_paths: &[PathBuf]) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-mgekko", "-mregnames", "-al", "--listing-cont-lines", "100000"]
            .into_iter()
            .map(OsString::from)
            .collect();
        if !self.config.warnings {
            args.push("--no-warn".into());
        }
        for path in include_paths {
            args.push("-I".into());
            args.push(path.clone().into_os_string());
        }
        args.push("-o".into());
        args.push(NULL_DEVICE.into());
        args
    }

    #[tracing::instrument(skip(self, input))]
    fn run(
        &self,
        program: &Path,
        args: &[OsString],
        input: Option<&str>,
    ) -> Result<Output, ToolchainError> {
        let name = program.display().to_string();
        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => ToolchainError::Missing(name.clone()),
                _ => ToolchainError::Io(name.clone(), err.to_string()),
            })?;

        // Feed stdin and drain the pipes on their own threads so a chatty tool cannot block us.
        let writer = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.to_owned();
                Some(thread::spawn(move || stdin.write_all(input.as_bytes())))
            }
            _ => None,
        };
        let stdout = read_pipe(child.stdout.take());
        let stderr = read_pipe(child.stderr.take());

        let status = match self.config.timeout {
            Some(timeout) => wait_with_timeout(&mut child, program, timeout)?,
            None => child
                .wait()
                .map_err(|err| ToolchainError::Io(name.clone(), err.to_string()))?,
        };

        if let Some(writer) = writer {
            if let Ok(Err(err)) = writer.join() {
                tracing::debug!("{} closed stdin early: {}", name, err);
            }
        }
        let join = |handle: thread::JoinHandle<String>| {
            handle
                .join()
                .map_err(|_| ToolchainError::Io(name.clone(), "output reader panicked".into()))
        };

        Ok(Output {
            status,
            stdout: join(stdout)?,
            stderr: join(stderr)?,
        })
    }
}

impl Toolchain for GnuToolchain {
    #[tracing::instrument(skip(self, source))]
    fn assemble(&self, source: &str, include_paths: &[PathBuf]) -> Result<Assembly, ToolchainError> {
        let mut source = source.to_owned();
        if !source.ends_with('\n') {
            source.push('\n');
        }

        let args = self.assembler_args(include_paths);
        let output = self.run(&self.config.assembler, &args, Some(&source))?;
        let diagnostics = parse_diagnostics(&output.stderr);

        if !output.status.success() {
            return Err(ToolchainError::AssemblyFailed(diagnostics));
        }
        if !diagnostics.is_empty() {
            tracing::warn!("Assembler warnings:\n{}", diagnostics);
        }

        parse_listing(&output.stdout)
    }

    #[tracing::instrument(skip(self, code), fields(len = code.len()))]
    fn disassemble(&self, code: &[u8]) -> Result<String, ToolchainError> {
        // The disassembler only reads from files.
        let scratch = self.config.scratch_dir.join("modpatch-disassembly.bin");
        std::fs::write(&scratch, code)
            .map_err(|err| ToolchainError::Io(scratch.display().to_string(), err.to_string()))?;

        let args = vec![scratch.clone().into_os_string(), OsString::from("0")];
        let output = self.run(&self.config.disassembler, &args, None)?;
        if !output.status.success() {
            return Err(ToolchainError::DisassemblyFailed(output.stderr.trim().to_owned()));
        }

        let lines = parse_disassembly(&output.stdout)?;
        Ok(lines
            .into_iter()
            .map(|line| line.canonicalize().to_string())
            .collect::<Vec<String>>()
            .join("\n"))
    }

    fn check(&self) -> Result<(), ToolchainError> {
        for program in [&self.config.assembler, &self.config.disassembler] {
            if !find_executable(program) {
                return Err(ToolchainError::Missing(program.display().to_string()));
            }
        }
        Ok(())
    }
}
