//! The public evaluation handle.
//!
//! A [`Vm`] owns everything that outlives a single evaluation: configuration,
//! the identifier intern pool, external variables, library search paths and
//! the import cache. Each `evaluate_*` call spins up a fresh heap and stack,
//! runs the program, and manifests the result in the requested mode.
//!
//! Source text only enters the system through two pluggable seams: an
//! [`ImportCallback`] locates and reads imported files (a `jpath`-aware
//! filesystem loader is the default), and a [`Frontend`] compiles source
//! into the desugared core AST (there is no default; embedders bring their
//! own compiler pipeline).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::{Expr, Interner, Location};
use crate::evaluator::Interpreter;
use crate::{
    DEFAULT_GC_GROWTH_TRIGGER, DEFAULT_GC_MIN_OBJECTS, DEFAULT_MAX_STACK, DEFAULT_MAX_TRACE,
    RuntimeError, TraceFrame, analysis,
};

/// Compiles source text into an annotated core AST.
///
/// Called for `evaluate_snippet`/`evaluate_file`, for every `import`, and
/// for code-mode external variables. The result does not need to be
/// annotated; the evaluator annotates it before use.
pub trait Frontend {
    fn compile(
        &mut self,
        interner: &mut Interner,
        filename: &str,
        source: &str,
    ) -> Result<Rc<Expr>, String>;
}

/// Locates and reads an imported file.
///
/// `base_dir` is the directory of the importing file (with trailing slash,
/// or empty), so relative imports chain correctly. On success returns the
/// resolved path and the file content; on failure a reason that is embedded
/// into the `Couldn't open import` error.
pub trait ImportCallback {
    fn import(&mut self, base_dir: &str, path: &str) -> Result<(String, String), String>;
}

/// An external variable: a raw string, or source code evaluated on use.
#[derive(Debug, Clone)]
pub(crate) struct ExtVar {
    pub data: String,
    pub is_code: bool,
}

/// Cached result of one import lookup; the cache owns the source text for
/// the lifetime of the [`Vm`], so re-importing is referentially transparent
/// even if the file changes on disk mid-evaluation.
#[derive(Debug)]
pub(crate) struct ImportCacheEntry {
    pub found_here: String,
    pub content: String,
}

/// The default [`ImportCallback`]: resolve against the importing file's
/// directory, then against each library path, most recently added first.
#[derive(Debug, Default)]
pub struct FileImporter {
    jpaths: Vec<PathBuf>,
}

impl FileImporter {
    pub fn add_jpath(&mut self, path: PathBuf) {
        self.jpaths.push(path);
    }
}

impl ImportCallback for FileImporter {
    fn import(&mut self, base_dir: &str, path: &str) -> Result<(String, String), String> {
        let rel = Path::new(path);
        if rel.is_absolute() {
            return match std::fs::read_to_string(rel) {
                Ok(content) => Ok((path.to_owned(), content)),
                Err(e) => Err(e.to_string()),
            };
        }
        let mut candidates = vec![Path::new(base_dir).join(rel)];
        candidates.extend(self.jpaths.iter().rev().map(|jp| jp.join(rel)));
        for candidate in candidates {
            if let Ok(content) = std::fs::read_to_string(&candidate) {
                return Ok((candidate.to_string_lossy().into_owned(), content));
            }
        }
        Err("no match locally or in the library search paths".to_owned())
    }
}

/// A virtual machine instance. Nothing is shared across instances.
pub struct Vm {
    pub(crate) max_stack: usize,
    pub(crate) gc_min_objects: usize,
    pub(crate) gc_growth_trigger: f64,
    pub(crate) max_trace: usize,
    pub(crate) string_output: bool,
    pub(crate) ext_vars: HashMap<String, ExtVar>,
    pub(crate) interner: Interner,
    pub(crate) import_cache: HashMap<(String, String), Rc<ImportCacheEntry>>,
    pub(crate) file_importer: FileImporter,
    pub(crate) import_callback: Option<Box<dyn ImportCallback>>,
    pub(crate) frontend: Option<Box<dyn Frontend>>,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            max_stack: DEFAULT_MAX_STACK,
            gc_min_objects: DEFAULT_GC_MIN_OBJECTS,
            gc_growth_trigger: DEFAULT_GC_GROWTH_TRIGGER,
            max_trace: DEFAULT_MAX_TRACE,
            string_output: false,
            ext_vars: HashMap::new(),
            interner: Interner::new(),
            import_cache: HashMap::new(),
            file_importer: FileImporter::default(),
            import_callback: None,
            frontend: None,
        }
    }

    /// The identifier pool, exposed so embedders can build ASTs directly.
    pub fn interner(&mut self) -> &mut Interner {
        &mut self.interner
    }

    /// Upper bound on live call frames.
    pub fn max_stack(&mut self, n: usize) {
        self.max_stack = n;
    }

    /// Lower bound on heap entities before a collection is considered.
    pub fn gc_min_objects(&mut self, n: usize) {
        self.gc_min_objects = n;
    }

    /// Heap growth ratio that triggers a collection.
    pub fn gc_growth_trigger(&mut self, ratio: f64) {
        self.gc_growth_trigger = ratio;
    }

    /// Maximum trace entries retained in a returned error; the middle of a
    /// longer trace is elided.
    pub fn max_trace(&mut self, n: usize) {
        self.max_trace = n;
    }

    /// Manifest the top-level value as a raw string instead of JSON.
    pub fn string_output(&mut self, enable: bool) {
        self.string_output = enable;
    }

    /// Register a raw external variable, visible through the `extVar`
    /// builtin.
    pub fn ext_var(&mut self, key: &str, value: &str) {
        self.ext_vars.insert(
            key.to_owned(),
            ExtVar {
                data: value.to_owned(),
                is_code: false,
            },
        );
    }

    /// Register a code external variable; the source is compiled and
    /// evaluated at the `extVar` call site.
    pub fn ext_code(&mut self, key: &str, code: &str) {
        self.ext_vars.insert(
            key.to_owned(),
            ExtVar {
                data: code.to_owned(),
                is_code: true,
            },
        );
    }

    /// Push a directory onto the default importer's search list.
    pub fn jpath_add(&mut self, path: impl Into<PathBuf>) {
        self.file_importer.add_jpath(path.into());
    }

    /// Replace the default file importer.
    pub fn set_import_callback(&mut self, callback: Box<dyn ImportCallback>) {
        self.import_callback = Some(callback);
    }

    pub fn set_frontend(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    //
    // Evaluation over a prebuilt AST.
    //

    /// Evaluate to a single document: JSON text, or the raw string when
    /// `string_output` is set.
    pub fn evaluate_ast(&mut self, expr: &Rc<Expr>) -> Result<String, RuntimeError> {
        analysis::annotate(expr);
        let string_output = self.string_output;
        let max_trace = self.max_trace;
        let result = {
            let mut interp = Interpreter::new(self);
            interp.evaluate(expr, 0).and_then(|()| {
                let loc = Location::synthetic("During manifestation");
                if string_output {
                    interp.manifest_string(&loc)
                } else {
                    interp.manifest_json(&loc, true, "")
                }
            })
        };
        result.map_err(|e| truncate_trace(e, max_trace))
    }

    /// Evaluate in multi mode: the result object maps filenames to
    /// documents, returned sorted by name.
    pub fn evaluate_ast_multi(
        &mut self,
        expr: &Rc<Expr>,
    ) -> Result<Vec<(String, String)>, RuntimeError> {
        analysis::annotate(expr);
        let string_output = self.string_output;
        let max_trace = self.max_trace;
        let result = {
            let mut interp = Interpreter::new(self);
            interp
                .evaluate(expr, 0)
                .and_then(|()| interp.manifest_multi(string_output))
        };
        result.map_err(|e| truncate_trace(e, max_trace))
    }

    /// Evaluate in stream mode: the result array yields one document per
    /// element.
    pub fn evaluate_ast_stream(&mut self, expr: &Rc<Expr>) -> Result<Vec<String>, RuntimeError> {
        analysis::annotate(expr);
        let max_trace = self.max_trace;
        let result = {
            let mut interp = Interpreter::new(self);
            interp
                .evaluate(expr, 0)
                .and_then(|()| interp.manifest_stream())
        };
        result.map_err(|e| truncate_trace(e, max_trace))
    }

    //
    // Evaluation from source, through the configured frontend.
    //

    pub fn evaluate_snippet(
        &mut self,
        filename: &str,
        source: &str,
    ) -> Result<String, RuntimeError> {
        let expr = self.compile_snippet(filename, source)?;
        self.evaluate_ast(&expr)
    }

    pub fn evaluate_snippet_multi(
        &mut self,
        filename: &str,
        source: &str,
    ) -> Result<Vec<(String, String)>, RuntimeError> {
        let expr = self.compile_snippet(filename, source)?;
        self.evaluate_ast_multi(&expr)
    }

    pub fn evaluate_snippet_stream(
        &mut self,
        filename: &str,
        source: &str,
    ) -> Result<Vec<String>, RuntimeError> {
        let expr = self.compile_snippet(filename, source)?;
        self.evaluate_ast_stream(&expr)
    }

    pub fn evaluate_file(&mut self, path: &str) -> Result<String, RuntimeError> {
        let source = self.read_file(path)?;
        self.evaluate_snippet(path, &source)
    }

    pub fn evaluate_file_multi(
        &mut self,
        path: &str,
    ) -> Result<Vec<(String, String)>, RuntimeError> {
        let source = self.read_file(path)?;
        self.evaluate_snippet_multi(path, &source)
    }

    pub fn evaluate_file_stream(&mut self, path: &str) -> Result<Vec<String>, RuntimeError> {
        let source = self.read_file(path)?;
        self.evaluate_snippet_stream(path, &source)
    }

    fn read_file(&self, path: &str) -> Result<String, RuntimeError> {
        std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::new(format!("Failed to read \"{path}\": {e}"), Vec::new())
        })
    }

    fn compile_snippet(&mut self, filename: &str, source: &str) -> Result<Rc<Expr>, RuntimeError> {
        if self.frontend.is_none() {
            return Err(RuntimeError::new(
                format!("No frontend is configured to compile \"{filename}\""),
                Vec::new(),
            ));
        }
        let result = match &mut self.frontend {
            Some(frontend) => frontend.compile(&mut self.interner, filename, source),
            None => unreachable!(),
        };
        match result {
            Ok(expr) => {
                analysis::annotate(&expr);
                Ok(expr)
            }
            Err(msg) => Err(RuntimeError::new(
                msg,
                vec![TraceFrame::new(Location::synthetic(filename))],
            )),
        }
    }
}

/// Keep the outermost and innermost halves of an oversized trace, eliding
/// the middle.
fn truncate_trace(mut err: RuntimeError, max_trace: usize) -> RuntimeError {
    if max_trace == 0 || err.trace.len() <= max_trace {
        return err;
    }
    let front = max_trace / 2;
    let back = max_trace - front - 1;
    let mut trace = Vec::with_capacity(max_trace);
    trace.extend_from_slice(&err.trace[..front]);
    trace.push(TraceFrame::new(Location::synthetic("...")));
    trace.extend_from_slice(&err.trace[err.trace.len() - back..]);
    err.trace = trace;
    err
}
