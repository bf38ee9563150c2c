//! Single-pass compiler from script text (or a value graph) to DATEX blocks.
//!
//! ## Design
//!
//! There is no syntax tree. A [`session`](self::session) pulls one token at a
//! time from the lexer and writes opcodes straight into a growable buffer.
//! Constructs whose final shape depends on later input are handled by
//! rewriting what was already written:
//! - a `,` or key turns the enclosing bracket into a tuple after the fact;
//! - assignments rewrite the preceding `CHILD_GET` opcode;
//! - forward jumps and back-references are patched or spliced in later.
//!
//! Every offset that a splice could move is held as a dynamic index, so
//! splices keep jump targets and pending offsets consistent.
//!
//! Nested blocks (`scope (...)`, `always (...)`, remote calls) are compiled by
//! child sessions. Variables of the parent are pulled into a child block
//! through a getter prefix in front of the block body.
//!
//! ## Example
//!
//! ```rust
//! use dxb_lang::{CompileOptions, Compiler, ValueGraph};
//!
//! let compiler = Compiler::default();
//! let output = compiler
//!     .compile("1 + 2", &CompileOptions::body_only(), &ValueGraph::new())
//!     .unwrap();
//!
//! assert_eq!(output.block(), Some(&[0xc1, 0x01, 0x92, 0xc1, 0x02, 0x01][..]));
//! ```

mod escape;
mod jump;
mod scope;
mod session;
#[cfg(test)]
mod test_compiler;
mod value;

use std::sync::Arc;

use base64::prelude::*;
use itertools::Itertools;
use sha2::{Digest, Sha256};

use crate::config::{CompileOptions, Config};
use crate::error::{CompileError, Error, InnerError};
use crate::framer::{BlockStream, CryptoProvider, FrameContext, Output};
use crate::quantity::{SiUnits, UnitSystem};
use crate::sid::ScopeIdRegistry;
use crate::value::{Value, ValueGraph, ValueId};
use session::{Finished, Session, Shared};

/// Evaluates `insert (...)` and `compile (...)` commands at compile time.
pub trait ResourceResolver: Send + Sync {
    /// Runs the compiled `body` of `command` and returns the resulting value.
    fn evaluate(&self, command: &str, body: &[u8]) -> Result<(ValueGraph, ValueId), CompileError>;
}

/// Resolver of a compiler without a runtime attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuntime;

impl ResourceResolver for NoRuntime {
    fn evaluate(&self, command: &str, _body: &[u8]) -> Result<(ValueGraph, ValueId), CompileError> {
        Err(CompileError::Unsupported(format!("'{command}' needs a runtime")))
    }
}

/// Compiles scripts and values into framed blocks.
///
/// One compiler can be shared between threads; the scope id registry keeps
/// block counters consistent across calls.
#[derive(Clone)]
pub struct Compiler {
    config: Config,
    registry: Arc<ScopeIdRegistry>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    resolver: Arc<dyn ResourceResolver>,
    units: Arc<dyn UnitSystem>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("config", &self.config)
            .field("scopes", &self.registry.len())
            .field("crypto", &self.crypto.is_some())
            .field("units", &self.units)
            .finish()
    }
}

impl Compiler {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(ScopeIdRegistry::new(config.sid_ttl)),
            config,
            crypto: None,
            resolver: Arc::new(NoRuntime),
            units: Arc::new(SiUnits),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ScopeIdRegistry> {
        &self.registry
    }

    pub fn set_crypto(&mut self, crypto: Arc<dyn CryptoProvider>) {
        self.crypto = Some(crypto);
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn ResourceResolver>) {
        self.resolver = resolver;
    }

    pub fn set_units(&mut self, units: Arc<dyn UnitSystem>) {
        self.units = units;
    }

    /// Shares the scope id registry of another compiler.
    pub fn set_registry(&mut self, registry: Arc<ScopeIdRegistry>) {
        self.registry = registry;
    }

    /// Compiles `code`. Placeholders (`?`, `?n`) are filled from
    /// `options.inserted_values`, which must point into `graph`.
    #[allow(clippy::result_large_err)]
    pub fn compile(&self, code: &str, options: &CompileOptions, graph: &ValueGraph) -> Result<Output, Error> {
        tracing::debug!(len = code.len(), data_type = %options.data_type, "compiling script");
        let shared = Shared::new(&self.config, options, graph, self.units.as_ref(), self.resolver.as_ref());
        let finished = Session::root(&shared, code)
            .run()
            .map_err(|e| Error::from_error(code, e, shared.line.get()))?;
        self.frame(code, options, finished)
    }

    /// Compiles a single value without going through script text.
    #[allow(clippy::result_large_err)]
    pub fn compile_value(&self, graph: &ValueGraph, id: ValueId, options: &CompileOptions) -> Result<Output, Error> {
        tracing::debug!(data_type = %options.data_type, "compiling value");
        let shared = Shared::new(&self.config, options, graph, self.units.as_ref(), self.resolver.as_ref());
        let mut session = Session::for_value(&shared);
        session
            .insert_value(graph, id)
            .map_err(|e| Error::from_error("", e, 0))?;
        let finished = session.finish_value().map_err(|e| Error::from_error("", e, 0))?;
        self.frame("", options, finished)
    }

    /// SHA-256 over the bare body of a value. Structurally equal values
    /// hash equally.
    #[allow(clippy::result_large_err)]
    pub fn value_hash(&self, graph: &ValueGraph, id: ValueId) -> Result<[u8; 32], Error> {
        let options = CompileOptions {
            collapse_first_inserted: true,
            ..CompileOptions::body_only()
        };
        let body = self.compile_value(graph, id, &options)?.into_blocks()?.concat();
        Ok(Sha256::digest(&body).into())
    }

    /// [`Compiler::value_hash`] in standard base64.
    #[allow(clippy::result_large_err)]
    pub fn value_hash_string(&self, graph: &ValueGraph, id: ValueId) -> Result<String, Error> {
        Ok(BASE64_STANDARD.encode(self.value_hash(graph, id)?))
    }

    /// `$` and the hex id for pointers, the value hash for anything else.
    #[allow(clippy::result_large_err)]
    pub fn unique_value_identifier(&self, graph: &ValueGraph, id: ValueId) -> Result<String, Error> {
        match graph.get(id) {
            Some(Value::Pointer(pointer)) => Ok(format!("${}", pointer.id.iter().map(|b| format!("{b:02X}")).join(""))),
            _ => self.value_hash_string(graph, id),
        }
    }

    #[allow(clippy::result_large_err)]
    fn frame(&self, code: &str, options: &CompileOptions, finished: Finished) -> Result<Output, Error> {
        let to_error = |e: InnerError| Error::from_error(code, e, 0);
        let end_of_scope = options.end_of_scope;
        let Finished { body, bodies, .. } = finished;

        let context = if options.add_header {
            Some(
                FrameContext::new(Arc::clone(&self.registry), self.crypto.clone(), options, &self.config)
                    .map_err(|e| to_error(e.into()))?,
            )
        } else {
            None
        };

        if !bodies.is_empty() {
            let mut bodies = bodies;
            bodies.push(body);
            tracing::debug!(blocks = bodies.len(), "streaming blocks");
            return Ok(Output::Blocks(BlockStream::from_bodies(context, bodies, end_of_scope, code)));
        }

        if let Some(max) = options.max_block_size.or(self.config.max_block_size) {
            let (size, chunk_size) = match &context {
                Some(context) => (
                    context.framed_len(body.len()).map_err(to_error)?,
                    context.chunk_size(max).map_err(to_error)?,
                ),
                None => (body.len(), max.max(1)),
            };
            if size >= max {
                return Ok(Output::Blocks(BlockStream::split(context, &body, chunk_size, end_of_scope, code)));
            }
        }

        match context {
            Some(context) => {
                let block = context.frame(&body, end_of_scope).map_err(to_error)?;
                tracing::debug!(sid = context.sid(), size = block.len(), "framed block");
                Ok(Output::Block(block))
            }
            None => Ok(Output::Block(body)),
        }
    }
}
