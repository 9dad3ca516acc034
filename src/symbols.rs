use std::fmt;

use thiserror::Error;

use crate::syntax;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum SymbolError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("Standalone function '{0}' is already defined differently by '{1}'")]
    SymbolAlreadyDefined(String, String),
    #[error("Standalone function '{0}' is referenced by '{1}' but never defined")]
    UndefinedSymbol(String, String),
}

/// A standalone function known to the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Name used in `<name>` and `<<name>>` references
    pub name: String,
    /// Mod that defines the function
    pub owner: String,
    /// Raw code of the function, scanned for further references
    pub code: String,
    /// RAM address, once an installer has placed the function
    pub address: Option<u32>,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "<{}> @ {:#010x} ({})", self.name, address, self.owner),
            None => write!(f, "<{}> unallocated ({})", self.name, self.owner),
        }
    }
}

/// The symbol table maps standalone function names to their definitions and addresses.
///
/// It is an explicit value handed to parsing and resolution rather than shared global state.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    pub symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            symbols: Vec::new(),
        }
    }

    pub fn find_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|symbol| symbol.name == name)
    }

    /// Register a function. Several mods may share a function as long as the code is identical.
    #[tracing::instrument(skip_all, fields(name = %symbol.name, owner = %symbol.owner))]
    pub fn new_symbol(&mut self, symbol: Symbol) -> Result<(), SymbolError> {
        if let Some(existing) = self.find_symbol(&symbol.name) {
            if normalize_code(&existing.code) == normalize_code(&symbol.code) {
                tracing::debug!("'{}' shared with '{}'", symbol.name, existing.owner);
                return Ok(());
            }
            return Err(SymbolError::SymbolAlreadyDefined(
                symbol.name,
                existing.owner.clone(),
            ));
        }
        self.symbols.push(symbol);
        Ok(())
    }

    /// Record the address an installer chose for a function.
    pub fn allocate(&mut self, name: &str, address: u32) -> Result<(), SymbolError> {
        let symbol = self
            .symbols
            .iter_mut()
            .find(|symbol| symbol.name == name)
            .ok_or_else(|| SymbolError::SymbolNotFound(name.to_owned()))?;
        symbol.address = Some(address);
        Ok(())
    }

    pub fn address_of(&self, name: &str) -> Option<u32> {
        self.find_symbol(name).and_then(|symbol| symbol.address)
    }

    /// Functions directly referenced by a function's code.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.find_symbol(name)
            .map(|symbol| syntax::referenced_functions(&symbol.code))
            .unwrap_or_default()
    }

    /// Every function reachable from `roots`, roots included, in discovery order.
    ///
    /// `referrer` names the mod asking, for error messages.
    #[tracing::instrument(skip(self))]
    pub fn dependency_closure(
        &self,
        roots: &[String],
        referrer: &str,
    ) -> Result<Vec<String>, SymbolError> {
        let mut closure: Vec<String> = vec![];
        let mut queue: Vec<String> = roots.to_vec();

        while let Some(name) = queue.pop() {
            if closure.contains(&name) {
                continue;
            }
            if self.find_symbol(&name).is_none() {
                return Err(SymbolError::UndefinedSymbol(name, referrer.to_owned()));
            }
            let mut dependencies = self.dependencies(&name);
            dependencies.reverse();
            closure.push(name);
            queue.extend(dependencies);
        }

        Ok(closure)
    }
}

fn normalize_code(code: &str) -> String {
    code.lines()
        .map(syntax::strip_comment)
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}
