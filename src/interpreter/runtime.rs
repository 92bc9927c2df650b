//! The embedded Rhai runtime shared by every plugin instance.
//!
//! A `ScriptRuntime` is only ever reachable through
//! [`InterpreterSession::with_lock`](super::session::InterpreterSession::with_lock),
//! so holding `&mut ScriptRuntime` means holding the global lock.
//!
//! Failing operations do not hand their error back directly. They record a
//! [`ScriptFault`] as the runtime's pending error state and return [`Raised`];
//! the caller then goes through [`ErrorReporter`](super::error_reporter::ErrorReporter)
//! to fetch and clear it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, FnAccess, ParseError, Position, Scope};
use tracing::{debug, info, warn};

/// File extension of script modules on the search path.
pub const SCRIPT_EXTENSION: &str = "rhai";

/// Budget of one script run (a module body or a single call).
pub const MAX_OPERATIONS: u64 = 1_000_000;
/// Debug builds use far more stack per script call level.
pub const MAX_CALL_LEVELS: usize = if cfg!(debug_assertions) { 8 } else { 64 };

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Module or function could not be found.
    NotFound,
    /// Script source could not be read.
    Io,
    /// Script source does not parse.
    Compile,
    /// Script raised while running.
    Runtime,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::NotFound => "NotFoundError",
            FaultKind::Io => "IoError",
            FaultKind::Compile => "CompileError",
            FaultKind::Runtime => "RuntimeError",
        })
    }
}

/// The runtime's error state: what went wrong, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    pub kind: FaultKind,
    pub message: Option<String>,
    pub source: Option<String>,
    pub position: Position,
}

impl ScriptFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            message: (!message.trim().is_empty()).then_some(message),
            source: None,
            position: Position::NONE,
        }
    }

    fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    fn from_parse(err: &ParseError, module: &str) -> Self {
        let position = err.position();
        Self {
            position,
            ..Self::new(FaultKind::Compile, strip_position(err.to_string(), position))
        }
        .with_source(module)
    }

    fn from_eval(err: &EvalAltResult, module: &str) -> Self {
        let position = err.position();
        Self {
            position,
            ..Self::new(FaultKind::Runtime, strip_position(err.to_string(), position))
        }
        .with_source(module)
    }
}

/// Rhai's `Display` appends ` (line x, position y)`; the position is kept separately.
fn strip_position(text: String, position: Position) -> String {
    if position.is_none() {
        return text;
    }
    let suffix = format!(" ({position})");
    match text.strip_suffix(&suffix) {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

/// Marker returned by failing runtime operations: the fault is pending in the
/// runtime and must be fetched through the error reporter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use = "a raised fault stays pending until it is captured"]
pub struct Raised;

/// A compiled module whose top-level statements have run.
#[derive(Debug)]
pub struct LoadedModule {
    name: String,
    path: PathBuf,
    epoch: u64,
    generation: u64,
    ast: AST,
}

impl LoadedModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Which runtime incarnation compiled this module.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Bumped on every import or reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the module defines a public script function called `entry`.
    pub fn has_function(&self, entry: &str) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == entry && matches!(f.access, FnAccess::Public))
    }
}

pub struct ScriptRuntime {
    engine: Engine,
    program: String,
    epoch: u64,
    generation: u64,
    search_path: Vec<PathBuf>,
    modules: HashMap<String, Arc<LoadedModule>>,
    error: Option<ScriptFault>,
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("program", &self.program)
            .field("epoch", &self.epoch)
            .field("search_path", &self.search_path)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

impl ScriptRuntime {
    pub(crate) fn new(program: &str, epoch: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_call_levels(MAX_CALL_LEVELS);

        let print_program = program.to_string();
        engine.on_print(move |text| {
            info!(target: "script", program = %print_program, "{text}");
        });
        let debug_program = program.to_string();
        engine.on_debug(move |text, source, pos| {
            debug!(target: "script", program = %debug_program, source = source.unwrap_or_default(), %pos, "{text}");
        });

        Self {
            engine,
            program: program.to_string(),
            epoch,
            generation: 0,
            search_path: Vec::new(),
            modules: HashMap::new(),
            error: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Put `dir` in front of the search path. A directory already present
    /// moves to the front instead of being listed twice.
    pub fn insert_search_path(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.search_path.retain(|existing| existing != &dir);
        self.search_path.insert(0, dir);
    }

    pub fn is_loaded(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Record a fault as the pending error state.
    pub fn raise(&mut self, fault: ScriptFault) -> Raised {
        if let Some(previous) = self.error.replace(fault) {
            warn!(?previous, "pending script error overwritten before it was reported");
        }
        Raised
    }

    pub fn error_occurred(&self) -> bool {
        self.error.is_some()
    }

    /// Take the pending error state, leaving the runtime clean.
    pub fn take_error(&mut self) -> Option<ScriptFault> {
        self.error.take()
    }

    /// Import a module by name. A module already in the module table is
    /// returned as is; otherwise it is located, compiled and executed.
    pub fn import(&mut self, name: &str) -> Result<Arc<LoadedModule>, Raised> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Arc::clone(module));
        }
        let module = self.execute_module(name)?;
        self.modules.insert(name.to_string(), Arc::clone(&module));
        Ok(module)
    }

    /// Re-read and re-execute a module, replacing its module-table entry.
    /// On failure the table keeps whatever it had before.
    pub fn reload(&mut self, module: &LoadedModule) -> Result<Arc<LoadedModule>, Raised> {
        if module.epoch != self.epoch {
            return Err(self.raise(
                ScriptFault::new(
                    FaultKind::NotFound,
                    format!("module `{}` belongs to a finalized runtime", module.name),
                )
                .with_source(&module.name),
            ));
        }
        let reloaded = self.execute_module(&module.name)?;
        self.modules.insert(module.name.clone(), Arc::clone(&reloaded));
        Ok(reloaded)
    }

    /// Check that `entry` is a callable function of `module`.
    pub fn lookup_function(&mut self, module: &LoadedModule, entry: &str) -> Result<(), Raised> {
        if module.has_function(entry) {
            Ok(())
        } else {
            Err(self.raise(
                ScriptFault::new(
                    FaultKind::NotFound,
                    format!("module `{}` has no function `{entry}`", module.name),
                )
                .with_source(&module.name),
            ))
        }
    }

    /// Call `entry` in `module` with one string argument.
    pub fn call(&mut self, module: &LoadedModule, entry: &str, message: &str) -> Result<Dynamic, Raised> {
        if module.epoch != self.epoch {
            return Err(self.raise(
                ScriptFault::new(
                    FaultKind::NotFound,
                    format!("module `{}` belongs to a finalized runtime", module.name),
                )
                .with_source(&module.name),
            ));
        }

        let engine = &self.engine;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut scope = Scope::new();
            let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
            engine.call_fn_with_options::<Dynamic>(
                options,
                &mut scope,
                &module.ast,
                entry,
                (message.to_string(),),
            )
        }));

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.raise(ScriptFault::from_eval(&err, &module.name))),
            Err(_) => Err(self.raise(
                ScriptFault::new(FaultKind::Runtime, format!("script function `{entry}` panicked"))
                    .with_source(&module.name),
            )),
        }
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(format!("{name}.{SCRIPT_EXTENSION}")))
            .find(|candidate| candidate.is_file())
    }

    fn execute_module(&mut self, name: &str) -> Result<Arc<LoadedModule>, Raised> {
        if !is_valid_module_name(name) {
            return Err(self.raise(ScriptFault::new(
                FaultKind::NotFound,
                format!("`{name}` is not a valid module name"),
            )));
        }

        let Some(path) = self.locate(name) else {
            let fault = ScriptFault::new(
                FaultKind::NotFound,
                format!("no module named `{name}` on the search path {:?}", self.search_path),
            )
            .with_source(name);
            return Err(self.raise(fault));
        };

        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                let fault = ScriptFault::new(FaultKind::Io, format!("{}: {err}", path.display()))
                    .with_source(name);
                return Err(self.raise(fault));
            }
        };

        let mut ast = match self.engine.compile(&source) {
            Ok(ast) => ast,
            Err(err) => {
                let fault = ScriptFault::from_parse(&err, name);
                return Err(self.raise(fault));
            }
        };
        ast.set_source(name);

        // Top-level statements run once per import, like a module body.
        let mut scope = Scope::new();
        let engine = &self.engine;
        let body = catch_unwind(AssertUnwindSafe(|| engine.run_ast_with_scope(&mut scope, &ast)));
        match body {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let fault = ScriptFault::from_eval(&err, name);
                return Err(self.raise(fault));
            }
            Err(_) => {
                let fault = ScriptFault::new(FaultKind::Runtime, "module body panicked").with_source(name);
                return Err(self.raise(fault));
            }
        }

        self.generation += 1;
        debug!(module = name, path = %path.display(), generation = self.generation, "script module executed");

        Ok(Arc::new(LoadedModule {
            name: name.to_string(),
            path,
            epoch: self.epoch,
            generation: self.generation,
            ast,
        }))
    }

    /// Drop every module and search path entry.
    pub(crate) fn finalize(mut self) {
        let modules = self.modules.len();
        self.modules.clear();
        self.search_path.clear();
        if let Some(fault) = self.error.take() {
            warn!(?fault, "script error still pending at finalization");
        }
        info!(program = %self.program, epoch = self.epoch, modules, "script runtime finalized");
    }
}

fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.')
}
