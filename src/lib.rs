/// Address strings, RAM ranges and the normalizer supplied by the host.
pub mod address;

/// A single patch: pre-processing of custom syntax and final resolution.
///
/// The steps are:
/// 1. **Pre-processing** - replacing custom syntax with placeholders and assembling the rest
/// 2. **Resolution** - filling the placeholders once the install address, standalone function
///    addresses and option values are known
pub mod code_change;

/// A named collection of changes per game revision, with options and serialization.
pub mod code_mod;

/// Hex text helpers and a hexdump for display.
pub mod hex;

/// Logging and chrome tracing setup.
pub mod instrumentation;

/// Discovery and parsing of mod libraries on disk.
pub mod library;

/// Typed mod options and their placeholder values.
pub mod options;

/// Table of standalone functions shared between mods.
pub mod symbols;

/// Recognizes the custom syntax embedded in mod code.
pub mod syntax;

/// The external assembler and disassembler.
pub mod toolchain;
