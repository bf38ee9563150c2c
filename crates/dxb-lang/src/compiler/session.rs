//! The statement state machine: one [`Session`] per compiled script or
//! nested block, consuming tokens and writing opcodes into its [`Buffer`].
use std::cell::{Cell, RefCell};

use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use super::ResourceResolver;
use super::escape::{strip_escapes, unescape};
use super::scope::{Extracted, Extraction, Mode, Subscope};
use crate::bigint::BigInt;
use crate::binary::{ActionType, BinaryCode};
use crate::buffer::{Buffer, VarName, std_type_code};
use crate::config::{CompileOptions, Config};
use crate::dynamic_index::DynamicIndex;
use crate::error::{CompileError, InnerError, SyntaxError, ValueError};
use crate::lexer::token::{Assign, BlockKind, DeclarationKind, PathTail, Sigil, TargetSigil, TokenKind};
use crate::lexer::error::LexerError;
use crate::lexer::{self, LexState};
use crate::quantity::{Quantity, UnitSystem};
use crate::value::{Identity, Target, Value, ValueGraph, decode_hex};

/// State shared by a root session and every nested session it spawns.
pub(crate) struct Shared<'c> {
    pub config: &'c Config,
    pub options: &'c CompileOptions,
    /// Graph holding `options.inserted_values`.
    pub graph: &'c ValueGraph,
    pub units: &'c dyn UnitSystem,
    pub resolver: &'c dyn ResourceResolver,
    /// 1-based line of the token being compiled.
    pub line: Cell<usize>,
    /// Next implicit `?` placeholder.
    pub data_index: Cell<usize>,
    pub unused_plugins: RefCell<Vec<SmolStr>>,
}

impl<'c> Shared<'c> {
    pub(crate) fn new(
        config: &'c Config,
        options: &'c CompileOptions,
        graph: &'c ValueGraph,
        units: &'c dyn UnitSystem,
        resolver: &'c dyn ResourceResolver,
    ) -> Self {
        Self {
            config,
            options,
            graph,
            units,
            resolver,
            line: Cell::new(1),
            data_index: Cell::new(0),
            unused_plugins: RefCell::new(options.required_plugins.clone()),
        }
    }
}

/// Lookups a nested session forwards to the session that spawned it.
pub(crate) trait ParentScope {
    /// Declared kind and internal variable of `name`, as seen by the parent.
    fn resolve_var(&mut self, name: &str) -> Result<Option<(DeclarationKind, u32)>, InnerError>;

    fn resolve_slot(&self, name: &str) -> Option<u16>;
}

/// Remaining script text.
#[derive(Debug, Default)]
pub(crate) struct Source {
    text: String,
    cursor: usize,
}

impl Source {
    pub(crate) fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cursor: 0,
        }
    }

    pub(crate) fn rest(&self) -> &str {
        &self.text[self.cursor..]
    }

    /// Consumes `len` bytes and returns the number of newlines among them.
    fn advance(&mut self, len: usize) -> usize {
        let end = (self.cursor + len).min(self.text.len());
        let newlines = self.text[self.cursor..end].matches('\n').count();
        self.cursor = end;
        newlines
    }

    /// Gives back the last `len` consumed bytes.
    fn rewind(&mut self, len: usize) -> usize {
        let start = self.cursor.saturating_sub(len);
        let newlines = self.text[start..self.cursor].matches('\n').count();
        self.cursor = start;
        newlines
    }

    /// Puts generated script text in front of the remainder.
    fn prepend(&mut self, code: &str) {
        let mut text = String::with_capacity(code.len() + self.text.len() - self.cursor);
        text.push_str(code);
        text.push_str(self.rest());
        self.text = text;
        self.cursor = 0;
    }

    fn next_char(&self) -> Option<char> {
        self.rest().chars().next()
    }
}

/// How a nested session relates to the one that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildKind {
    /// Shares the parent's variables directly (init blocks, skimmed text).
    Pseudo,
    /// A scope block; parent variables are extracted into a getter prefix.
    Block { extract_pointers: bool },
    /// No access to the parent at all (`insert (...)`, `compile (...)`).
    Standalone,
}

/// Result of a finished session.
#[derive(Debug)]
pub(crate) struct Finished {
    pub body: Vec<u8>,
    pub source: Source,
    pub var_index: u32,
    /// Bodies cut off before a streamed value, in order.
    pub bodies: Vec<Vec<u8>>,
}

pub(crate) struct Session<'s, 'c> {
    pub(super) shared: &'s Shared<'c>,
    parent: Option<&'s mut (dyn ParentScope + 's)>,
    pseudo_parent: bool,
    pub(super) root: bool,

    pub(super) source: Source,
    pub(super) buf: Buffer,
    mode: Mode,
    pub(super) subscopes: Vec<Subscope>,
    end: bool,
    last_command_end: bool,
    close_at_end: bool,
    var_index: u32,

    pub(super) extract: Option<Extraction>,
    pub(super) extract_pointers: bool,

    /// Start offsets of already encoded values, for back-references.
    pub(super) inserted: FxHashMap<Identity, DynamicIndex>,
    /// Back-reference variables created so far.
    pub(super) internal_vars: FxHashMap<Identity, u32>,
    pub(super) internal_var_index: u32,
    pub(super) first_insert_done: bool,

    pub(super) labels: FxHashMap<SmolStr, DynamicIndex>,
    pub(super) used_labels: FxHashSet<SmolStr>,
    /// Jump fields waiting for a label further down.
    pub(super) waiting: FxHashMap<SmolStr, Vec<DynamicIndex>>,
    pub(super) cache_point: bool,
    pub(super) bodies: Vec<Vec<u8>>,
}

impl<'s, 'c> Session<'s, 'c> {
    /// The outermost session of a compile call.
    pub(crate) fn root(shared: &'s Shared<'c>, code: &str) -> Self {
        let code = if code.is_empty() { ";" } else { code };
        let mut session = Self::new(shared, None, Source::new(code), Mode::Full, shared.config.var_start);
        session.root = true;
        session.close_at_end = shared.options.end_of_scope;
        session
    }

    /// A session without script text, used to encode a value directly.
    pub(crate) fn for_value(shared: &'s Shared<'c>) -> Self {
        let mut session = Self::new(shared, None, Source::default(), Mode::Full, shared.config.var_start);
        session.root = true;
        session.close_at_end = shared.options.end_of_scope;
        session
    }

    fn new(
        shared: &'s Shared<'c>,
        parent: Option<&'s mut (dyn ParentScope + 's)>,
        source: Source,
        mode: Mode,
        var_index: u32,
    ) -> Self {
        Self {
            shared,
            parent,
            pseudo_parent: false,
            root: false,
            source,
            buf: Buffer::new(),
            mode,
            subscopes: vec![Subscope::root()],
            end: false,
            last_command_end: false,
            close_at_end: true,
            var_index,
            extract: None,
            extract_pointers: false,
            inserted: FxHashMap::default(),
            internal_vars: FxHashMap::default(),
            internal_var_index: 0,
            first_insert_done: false,
            labels: FxHashMap::default(),
            used_labels: FxHashSet::default(),
            waiting: FxHashMap::default(),
            cache_point: false,
            bodies: Vec::new(),
        }
    }

    /// Compiles until the end of the input or of the nested construct.
    pub(crate) fn run(mut self) -> Result<Finished, InnerError> {
        let limit = self.shared.config.iteration_limit;
        for _ in 0..limit {
            self.step()?;
            if self.end || self.source.rest().is_empty() {
                return self.finish();
            }
        }
        Err(CompileError::IterationLimit(limit).into())
    }

    /// Body bytes written so far, closed like a finished session.
    pub(crate) fn finish_value(mut self) -> Result<Finished, InnerError> {
        if self.close_at_end {
            self.buf.write_code(BinaryCode::CloseAndStore);
        }
        Ok(Finished {
            body: self.buf.into_vec(),
            source: self.source,
            var_index: self.var_index,
            bodies: self.bodies,
        })
    }

    pub(super) fn scope(&mut self) -> &mut Subscope {
        let last = self.subscopes.len() - 1;
        &mut self.subscopes[last]
    }

    pub(super) fn scope_ref(&self) -> &Subscope {
        &self.subscopes[self.subscopes.len() - 1]
    }

    fn advance(&mut self, len: usize) {
        let newlines = self.source.advance(len);
        self.shared.line.set(self.shared.line.get() + newlines);
    }

    fn rewind(&mut self, len: usize) {
        let newlines = self.source.rewind(len);
        self.shared.line.set(self.shared.line.get().saturating_sub(newlines));
    }

    fn skip_whitespace(&mut self) {
        let rest = self.source.rest();
        let len = rest.len() - rest.trim_start().len();
        self.advance(len);
    }

    fn step(&mut self) -> Result<(), InnerError> {
        let last_command_end = self.last_command_end;
        let rest = self.source.rest();
        let skipped = rest.len() - lexer::skip_spaces(rest).len();
        self.advance(skipped);
        self.last_command_end = false;

        if self.source.rest().is_empty() {
            self.end = true;
            self.last_command_end = last_command_end;
            return Ok(());
        }

        let len = self.subscopes.len();
        let state = LexState {
            in_template: self.scope_ref().in_template,
            template_close: len >= 3 && self.subscopes[len - 3].in_template,
            function_arg_compat: self.mode == Mode::Signature,
        };
        let line = self.shared.line.get();
        let token = lexer::next_token(self.source.rest(), &state, line)?;
        self.advance(token.len);
        tracing::trace!(token = %token.kind, line, "dispatch");

        let is_value = token.kind.is_value();
        self.dispatch(token.kind, token.len, last_command_end)?;
        if self.end {
            return Ok(());
        }

        if is_value {
            self.try_plus_or_minus();
        }
        if self.scope_ref().value_count_done() {
            self.epilogue()?;
        }
        Ok(())
    }

    /// `1+2` without spaces: a directly following `+`/`-` is an operator.
    fn try_plus_or_minus(&mut self) {
        let rest = self.source.rest().as_bytes();
        let code = match (rest.first(), rest.get(1)) {
            (Some(b'+'), next) if next != Some(&b'+') => BinaryCode::Add,
            (Some(b'-'), next) if !matches!(next, Some(b'-' | b'>')) => BinaryCode::Subtract,
            _ => return,
        };
        self.buf.write_code(code);
        self.advance(1);
    }

    /// Ends a nested session before a token it does not own.
    fn stop_before(&mut self, len: usize, last_command_end: bool) {
        self.rewind(len);
        self.end = true;
        self.last_command_end = last_command_end;
    }

    fn is_single_expression(&self) -> bool {
        self.mode >= Mode::Expression && self.subscopes.len() == 1
    }

    fn dispatch(&mut self, kind: TokenKind, len: usize, last_command_end: bool) -> Result<(), InnerError> {
        match kind {
            TokenKind::Newline | TokenKind::Comment | TokenKind::DocComment => {
                self.last_command_end = last_command_end;
            }
            TokenKind::Separator | TokenKind::ConstructorMethod | TokenKind::Accept | TokenKind::Leave => {}

            TokenKind::Url(url) => {
                let url = url::Url::parse(&strip_escapes(&url))
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| strip_escapes(&url));
                self.value_index();
                self.buf.write_long_string(BinaryCode::Url, &url);
            }
            TokenKind::Insert(index) => {
                let index = index.unwrap_or_else(|| {
                    let next = self.shared.data_index.get();
                    self.shared.data_index.set(next + 1);
                    next
                });
                let graph = self.shared.graph;
                match self.shared.options.inserted_values.get(index) {
                    Some(id) => self.insert_value(graph, *id)?,
                    None => {
                        self.value_index();
                        self.buf.write_code(BinaryCode::Void);
                    }
                }
            }
            TokenKind::InsertCommand { bracket } => self.resolve_at_compile_time("insert", bracket)?,
            TokenKind::Compile { bracket } => self.resolve_at_compile_time("compile", bracket)?,

            TokenKind::Key { slot, name } => self.key(&name, slot)?,
            TokenKind::String { content, key: true } => {
                if self.scope_ref().parent_type == Some(BinaryCode::ArrayStart) {
                    return Err(SyntaxError::InvalidKeyInArray.into());
                }
                self.key(&unescape(&content)?, false)?;
            }
            TokenKind::String { content, key: false } => {
                self.value_index();
                self.buf.write_text(&unescape(&content)?);
            }
            TokenKind::DynamicKeyEnd => self.dynamic_key_end()?,

            TokenKind::Command(code) => {
                self.value_index();
                self.buf.write_code(code);
            }
            TokenKind::Fun => {
                self.value_index();
                self.buf.write_code(BinaryCode::StdTypeFunction);
            }
            TokenKind::Skip => self.skip()?,
            TokenKind::Iterate => self.iterate()?,
            TokenKind::While => self.while_loop(),
            TokenKind::If { has_else } => self.if_branch(has_else)?,
            TokenKind::Else => self.else_branch()?,
            TokenKind::Jump { code, label } => self.jump(code, label),
            TokenKind::Label(name) => self.label(name)?,

            TokenKind::Void | TokenKind::QuasiVoid => {
                self.value_index();
                self.buf.write_code(BinaryCode::Void);
            }
            TokenKind::RemoteCall { bracket } => {
                if self.is_single_expression() {
                    self.stop_before(len, last_command_end);
                } else {
                    self.add_scope_block(BinaryCode::Remote, bracket, false)?;
                }
            }
            TokenKind::Block { kind, bracket } => self.block(kind, bracket)?,
            TokenKind::SubscopeStart => self.enter_subscope(Some(BinaryCode::SubscopeStart), None),
            TokenKind::SubscopeEnd => {
                if self.is_single_expression() {
                    self.stop_before(len, last_command_end);
                } else {
                    self.exit_subscope(BinaryCode::SubscopeEnd)?;
                }
            }
            TokenKind::StreamOperator(code) | TokenKind::Operator(code) => self.buf.write_code(code),
            TokenKind::CreatePointer => self.buf.write_code(BinaryCode::CreatePointer),

            TokenKind::Type {
                namespace,
                name,
                variation,
                paren,
                assign,
            } => {
                if paren {
                    self.rewind(1);
                    self.scope().param_type_close = true;
                }
                if assign {
                    self.buf.write_code(BinaryCode::Template);
                }
                self.value_index();
                self.buf.write_type(
                    namespace.as_deref().unwrap_or("std"),
                    &name,
                    variation.as_deref(),
                    paren,
                )?;
            }
            TokenKind::Comparator(BinaryCode::Greater) if self.scope_ref().param_type_close => {
                self.scope().param_type_close = false;
            }
            TokenKind::Comparator(code) => self.buf.write_code(code),
            TokenKind::Try { bracket } => {
                self.enter_subscope(Some(BinaryCode::SubscopeStart), None);
                if !bracket {
                    self.scope().auto_close = Some(BinaryCode::SubscopeEnd);
                }
            }
            TokenKind::RelativePath(path) => {
                self.value_index();
                self.buf.write_long_string(BinaryCode::ResolveRelativePath, &strip_escapes(&path));
            }
            TokenKind::Spread => {
                self.value_index();
                self.buf.write_code(BinaryCode::Extend);
            }
            TokenKind::Range => {
                let at = match self.scope_ref().last_value {
                    Some(index) => self.buf.resolve(index),
                    None => self.buf.pos(),
                };
                self.buf.insert_at(at, &[BinaryCode::Range.byte()], at);
            }
            TokenKind::PathSeparator(tail) => self.path(BinaryCode::ChildGet, tail),
            TokenKind::PathRef(tail) => self.path(BinaryCode::ChildGetRef, tail),

            TokenKind::UseProps(list) => {
                let index = self.declare(None, DeclarationKind::Var, false, false)?;
                let imported = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|entry| match entry.split_once(" as ") {
                        Some((name, alias)) => (SmolStr::new(name.trim()), Some(SmolStr::new(alias.trim()))),
                        None => (SmolStr::new(entry), None),
                    })
                    .collect();
                let scope = self.scope();
                scope.use_index = Some(index);
                scope.imported = imported;
                self.buf.write_code(BinaryCode::Get);
            }
            TokenKind::UseAll(name) => {
                self.declare(Some(&name), DeclarationKind::Var, false, false)?;
                self.buf.write_code(BinaryCode::Get);
            }
            TokenKind::Use => {
                self.buf.write_variable(
                    None,
                    BinaryCode::InternalVar,
                    ActionType::Set,
                    None,
                    VarName::Name("void"),
                )?;
                self.buf.write_code(BinaryCode::Get);
            }

            TokenKind::Bool(value) => {
                self.value_index();
                self.buf.write_bool(value);
            }
            TokenKind::Null => {
                self.value_index();
                self.buf.write_code(BinaryCode::Null);
            }
            TokenKind::EmptyArray => {
                self.value_index();
                self.buf.write_code(BinaryCode::StdTypeArray);
                self.buf.write_code(BinaryCode::Void);
            }
            TokenKind::EmptyObject => {
                self.value_index();
                self.buf.write_code(BinaryCode::StdTypeObject);
                self.buf.write_code(BinaryCode::Void);
            }
            TokenKind::ArrayStart => self.open_structure(BinaryCode::ArrayStart),
            TokenKind::ObjectStart => self.open_structure(BinaryCode::ObjectStart),
            TokenKind::ArrayEnd | TokenKind::ObjectEnd if self.is_single_expression() => {
                self.stop_before(len, last_command_end);
            }
            TokenKind::ArrayEnd => self.exit_subscope(BinaryCode::ArrayEnd)?,
            TokenKind::ObjectEnd => self.exit_subscope(BinaryCode::ObjectEnd)?,
            TokenKind::Comma if self.is_single_expression() => self.stop_before(len, last_command_end),
            TokenKind::Comma => self.comma()?,
            TokenKind::CloseAndStore => {
                let open_brackets = self.subscopes.iter().any(Subscope::is_bracket);
                if self.mode >= Mode::Expression && !open_brackets {
                    self.stop_before(len, last_command_end);
                } else {
                    self.close_and_store()?;
                }
            }

            TokenKind::TemplateStart(text) => {
                self.scope().in_template = true;
                self.enter_subscope(Some(BinaryCode::SubscopeStart), None);
                if !text.is_empty() {
                    self.value_index();
                    self.buf.write_text(&unescape(&text)?);
                    self.buf.write_code(BinaryCode::Add);
                }
                self.buf.write_code(BinaryCode::StdTypeText);
                self.enter_subscope(Some(BinaryCode::SubscopeStart), None);
            }
            TokenKind::TemplateContinue(text) => {
                self.exit_subscope(BinaryCode::SubscopeEnd)?;
                if !text.is_empty() {
                    self.buf.write_code(BinaryCode::Add);
                    self.buf.write_text(&unescape(&text)?);
                }
                self.buf.write_code(BinaryCode::Add);
                self.buf.write_code(BinaryCode::StdTypeText);
                self.enter_subscope(Some(BinaryCode::SubscopeStart), None);
            }
            TokenKind::TemplateEnd(text) => {
                self.exit_subscope(BinaryCode::SubscopeEnd)?;
                if !text.is_empty() {
                    self.buf.write_code(BinaryCode::Add);
                    self.buf.write_text(&unescape(&text)?);
                }
                self.exit_subscope(BinaryCode::SubscopeEnd)?;
                self.scope().in_template = false;
            }

            TokenKind::Buffer(hex) => {
                let data = if hex.is_empty() {
                    Vec::new()
                } else {
                    decode_hex(&hex).ok_or(SyntaxError::InvalidBuffer)?
                };
                self.value_index();
                self.buf.write_buffer(&data);
            }
            TokenKind::Infinity { negative } => {
                self.value_index();
                self.buf
                    .write_float(if negative { f64::NEG_INFINITY } else { f64::INFINITY });
            }
            TokenKind::Nan => {
                self.value_index();
                self.buf.write_float(f64::NAN);
            }
            TokenKind::Target { sigil, name, instance } => {
                let target = match sigil {
                    TargetSigil::Person => Target::person(&name),
                    TargetSigil::Institution => Target::institution(&name),
                    TargetSigil::Endpoint => Target::endpoint(decode_hex(&name).ok_or(SyntaxError::InvalidBuffer)?),
                    TargetSigil::Broadcast => Target::broadcast(),
                };
                let target = match instance {
                    Some(instance) => target.with_instance(instance),
                    None => target,
                };
                self.value_index();
                self.buf.write_target(&target)?;
            }
            TokenKind::Default { bracket } => {
                self.buf.write_code(BinaryCode::Default);
                self.init_block(bracket)?;
                self.value_index();
            }

            TokenKind::Function { export, name } => self.function(export, name)?,
            TokenKind::Plugin(name) => self.plugin(&name)?,
            TokenKind::Pointer { id, assign, bracket } => self.pointer(&id, assign, bracket)?,
            TokenKind::Declaration {
                export,
                kind,
                name,
                init,
                bracket,
            } => {
                if !init && bracket {
                    self.rewind(1);
                }
                let index = self.declare(Some(&name), kind, init, bracket)?;
                if export {
                    self.scope().exports.push((name, index));
                }
            }
            TokenKind::DirectExport(name) => {
                let index = match self.scope_ref().vars.get(&name) {
                    Some((_, index)) => *index,
                    None => return Err(CompileError::ExportUndeclared(name).into()),
                };
                self.scope().exports.push((name, index));
            }
            TokenKind::Variable {
                sigil,
                name,
                assign,
                bracket,
            } => self.variable(sigil, &name, assign, bracket)?,

            TokenKind::Hex(digits) => self.integer(&digits, 16)?,
            TokenKind::Bin(digits) => self.integer(&digits, 2)?,
            TokenKind::Oct(digits) => self.integer(&digits, 8)?,
            TokenKind::Int(digits) => self.integer(&digits, 10)?,
            TokenKind::Float(digits) => {
                let value: f64 = digits
                    .replace('_', "")
                    .parse()
                    .map_err(|_| ValueError::InvalidQuantity(digits.to_string()))?;
                self.value_index();
                self.buf.write_float(value);
            }
            TokenKind::Quantity { value, unit } => {
                let quantity = Quantity::parse(&value, &unit, self.shared.units)?;
                self.value_index();
                self.buf.write_quantity(&quantity)?;
            }
            TokenKind::Time(text) => {
                let millis = parse_time(&text).ok_or_else(|| ValueError::InvalidTime(text.to_string()))?;
                self.value_index();
                self.buf.write_time(millis);
            }

            TokenKind::AssignSet if self.mode == Mode::Signature && self.subscopes.len() == 1 => {
                self.stop_before(len, last_command_end);
            }
            TokenKind::AssignSet => self.assign_path(BinaryCode::ChildSet, None)?,
            TokenKind::AssignReference => self.assign_path(BinaryCode::ChildSetReference, None)?,
            TokenKind::AssignUpdate(code) => self.assign_path(BinaryCode::ChildAction, Some(code))?,
            TokenKind::AssignPower => self.assign_path(BinaryCode::ChildAction, Some(BinaryCode::Power))?,
        }
        Ok(())
    }

    /// Registers the cursor as the start of a value in the current subscope.
    pub(super) fn value_index(&mut self) {
        let pos = self.buf.pos();
        if let Some(path) = self.scope_ref().path_info {
            if self.buf.resolve(path) + 1 == pos {
                return;
            }
        }
        let index = self.buf.dynamic_index(pos);
        let scope = self.scope();
        scope.count_value();
        scope.last_value = Some(index);
        if scope.first_value.is_none() {
            scope.first_value = Some(index);
        }
    }

    pub(super) fn enter_subscope(&mut self, code: Option<BinaryCode>, start: Option<usize>) {
        let pos = self.buf.pos();
        let here = self.buf.dynamic_index(pos);
        let parent = self.scope();
        parent.last_value = Some(here);
        if parent.first_value.is_none() {
            parent.first_value = Some(here);
        }
        parent.count_value();
        let loop_start = parent.loop_start;

        if let Some(code) = code {
            match start {
                Some(start) => self.buf.wrap_at(start, &[code.byte()]),
                None => self.buf.write_code(code),
            }
        }
        let start = start.unwrap_or_else(|| self.buf.pos().saturating_sub(1));
        let start = self.buf.dynamic_index(start);
        self.subscopes.push(Subscope::nested(code, start, loop_start));
    }

    pub(super) fn exit_subscope(&mut self, code: BinaryCode) -> Result<(), InnerError> {
        while let Some(auto) = self.scope().auto_close.take() {
            self.exit_subscope(auto)?;
        }

        if code == BinaryCode::SubscopeEnd && self.mode == Mode::Bracketed && self.subscopes.len() == 1 {
            self.end = true;
            return Ok(());
        }

        let parent_type = self.scope_ref().parent_type;
        let code = match (parent_type, code) {
            (Some(BinaryCode::TupleStart), BinaryCode::SubscopeEnd) => BinaryCode::TupleEnd,
            _ => code,
        };

        match parent_type {
            Some(BinaryCode::ObjectStart) if code != BinaryCode::ObjectEnd => {
                return Err(SyntaxError::MissingClosingObjectBracket.into());
            }
            Some(BinaryCode::ArrayStart) if code != BinaryCode::ArrayEnd => {
                return Err(SyntaxError::MissingClosingArrayBracket.into());
            }
            Some(BinaryCode::SubscopeStart) if code != BinaryCode::SubscopeEnd => {
                return Err(SyntaxError::MissingClosingBracket.into());
            }
            Some(BinaryCode::TupleStart) if code != BinaryCode::TupleEnd => {
                return Err(SyntaxError::MissingClosingBracket.into());
            }
            _ => {}
        }

        if self.subscopes.len() == 1 {
            return Err(match code {
                BinaryCode::ObjectEnd => SyntaxError::InvalidClosingObjectBracket,
                BinaryCode::ArrayEnd => SyntaxError::InvalidClosingArrayBracket,
                _ => SyntaxError::InvalidClosingBracket,
            }
            .into());
        }

        if !self.scope_ref().exports.is_empty() {
            self.insert_exports()?;
        }

        if code != BinaryCode::SubscopeEnd {
            while let Some(comma) = self.scope().comma_indices.pop() {
                let pos = self.buf.pos();
                if self.buf.resolve(comma) + 1 != pos {
                    break;
                }
                self.buf.set_pos(pos - 1);
            }
        }
        self.buf.write_code(code);
        self.subscopes.pop();
        Ok(())
    }

    /// `; { name: #var, ... };` for the exports of the current subscope.
    fn insert_exports(&mut self) -> Result<(), InnerError> {
        if self.buf.last() != Some(BinaryCode::CloseAndStore.byte()) {
            self.buf.write_code(BinaryCode::CloseAndStore);
        }
        self.buf.write_code(BinaryCode::ObjectStart);
        let exports = std::mem::take(&mut self.scope().exports);
        for (name, index) in &exports {
            self.buf.write_key(name)?;
            self.buf
                .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(*index))?;
        }
        self.buf.write_code(BinaryCode::ObjectEnd);
        self.buf.write_code(BinaryCode::CloseAndStore);
        Ok(())
    }

    /// A key turns a plain group (or the top level) into a tuple.
    fn detect_record(&mut self) {
        let scope = self.scope_ref();
        match scope.parent_type {
            Some(BinaryCode::SubscopeStart) if !scope.has_ce => {
                if let Some(start) = scope.start {
                    let start = self.buf.resolve(start);
                    self.buf.set_byte(start, BinaryCode::TupleStart.byte());
                }
                self.scope().parent_type = Some(BinaryCode::TupleStart);
            }
            None | Some(BinaryCode::SubscopeStart) => {
                self.enter_subscope(Some(BinaryCode::TupleStart), None);
                self.scope().auto_close = Some(BinaryCode::TupleEnd);
            }
            _ => {}
        }
    }

    fn key(&mut self, name: &str, slot: bool) -> Result<(), InnerError> {
        if let Some(first) = self.scope_ref().first_element_pos {
            let first = self.buf.resolve(first);
            self.buf.set_pos(first);
        }
        self.detect_record();

        if slot {
            let slot = self.scope().object_slot(name);
            self.buf.write_object_slot(slot);
        } else if let Ok(index) = name.parse::<u32>() {
            self.buf.write_int_key(index);
        } else {
            self.buf.write_key(name)?;
        }
        Ok(())
    }

    fn dynamic_key_end(&mut self) -> Result<(), InnerError> {
        self.exit_subscope(BinaryCode::SubscopeEnd)?;
        let current = self.buf.pos();
        if let Some(first) = self.scope_ref().first_element_pos {
            let first = self.buf.resolve(first);
            self.buf.set_pos(first);
        }
        self.detect_record();
        self.buf.write_code(BinaryCode::ElementWithDynamicKey);
        self.buf.set_pos(current.max(self.buf.pos()));
        Ok(())
    }

    fn open_structure(&mut self, code: BinaryCode) {
        self.enter_subscope(Some(code), None);
        self.write_element();
    }

    /// `ELEMENT` placeholder a following key may overwrite.
    fn write_element(&mut self) {
        let pos = self.buf.pos();
        let first = self.buf.dynamic_index(pos);
        let comma = self.buf.dynamic_index(pos);
        let scope = self.scope();
        scope.first_element_pos = Some(first);
        scope.comma_indices.push(comma);
        self.buf.write_code(BinaryCode::Element);
    }

    fn comma(&mut self) -> Result<(), InnerError> {
        let scope = self.scope_ref();
        if matches!(scope.parent_type, None | Some(BinaryCode::SubscopeStart)) {
            let start = scope.start.map(|s| self.buf.resolve(s));
            let first_value = scope.first_value.map(|f| self.buf.resolve(f));
            let is_group = scope.parent_type == Some(BinaryCode::SubscopeStart);

            match (start, first_value) {
                (Some(start), Some(first)) if is_group && start + 1 == first => {
                    self.buf.set_byte(start, BinaryCode::TupleStart.byte());
                    self.scope().parent_type = Some(BinaryCode::TupleStart);
                    let comma = self.buf.dynamic_index(start + 1);
                    self.scope().comma_indices.push(comma);
                    self.buf.insert_at(start + 1, &[BinaryCode::Element.byte()], start + 1);
                }
                (_, first) => {
                    let first = first.ok_or(SyntaxError::InvalidLeadingComma)?;
                    let ce = self.scope_ref().ce_index.map(|c| self.buf.resolve(c)).unwrap_or(0);
                    let index = ce.max(first);
                    let comma = self.buf.dynamic_index(index);
                    self.scope().comma_indices.push(comma);
                    self.buf.wrap_at(index, &[BinaryCode::Element.byte()]);
                    self.enter_subscope(Some(BinaryCode::TupleStart), Some(index));
                    self.scope().auto_close = Some(BinaryCode::TupleEnd);
                }
            }
        }
        self.write_element();
        Ok(())
    }

    fn close_and_store(&mut self) -> Result<(), InnerError> {
        while let Some(auto) = self.scope().auto_close.take() {
            self.exit_subscope(auto)?;
        }
        self.buf.write_code(BinaryCode::CloseAndStore);
        let pos = self.buf.pos();
        let ce = self.buf.dynamic_index(pos);
        let scope = self.scope();
        scope.has_ce = true;
        scope.ce_index = Some(ce);
        scope.if_ends.clear();
        self.last_command_end = true;

        let use_index = self.scope().use_index.take();
        let imported = std::mem::take(&mut self.scope().imported);
        if let Some(use_index) = use_index {
            for (name, alias) in imported {
                let var = alias.as_ref().unwrap_or(&name);
                self.declare(Some(var), DeclarationKind::Var, false, false)?;
                self.buf
                    .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(use_index))?;
                self.buf.write_code(BinaryCode::ChildGet);
                self.buf.write_text(&name);
                self.buf.write_code(BinaryCode::CloseAndStore);
            }
        }
        Ok(())
    }

    fn path(&mut self, code: BinaryCode, tail: PathTail) {
        if self.extract_pointers && code == BinaryCode::ChildGetRef && tail != PathTail::Wildcard {
            if let Some(extract) = self.extract.as_mut() {
                extract.buf.write_code(code);
                if let PathTail::Property(name) = &tail {
                    extract.buf.write_text(name);
                }
                return;
            }
        }

        let pos = self.buf.pos();
        let path = self.buf.dynamic_index(pos);
        self.scope().path_info = Some(path);
        self.buf.write_code(code);
        match tail {
            PathTail::Wildcard => self.buf.write_code(BinaryCode::Wildcard),
            PathTail::Property(name) => self.buf.write_text(&name),
            PathTail::None => {}
        }
    }

    /// Rewrites the last `CHILD_GET` into the matching assignment.
    fn assign_path(&mut self, code: BinaryCode, update: Option<BinaryCode>) -> Result<(), InnerError> {
        let path = self
            .scope_ref()
            .path_info
            .map(|p| self.buf.resolve(p))
            .ok_or(SyntaxError::InvalidAssignment)?;
        self.buf.set_byte(path, code.byte());
        if let Some(update) = update {
            self.buf.insert_at(path + 1, &[update.byte()], path + 1);
        }
        Ok(())
    }

    fn integer(&mut self, digits: &str, radix: u32) -> Result<(), InnerError> {
        let value = BigInt::from_str_radix(digits, radix).ok_or_else(|| LexerError::InvalidToken {
            line: self.shared.line.get(),
            near: digits.to_string(),
        })?;
        self.value_index();
        match value.to_i64() {
            Some(int) => self.buf.write_int(int),
            None => self.buf.write_bigint(&value)?,
        }
        Ok(())
    }

    /// Declares `name` in the current subscope and writes its assignment head.
    fn declare(
        &mut self,
        name: Option<&str>,
        kind: DeclarationKind,
        init: bool,
        bracket: bool,
    ) -> Result<u32, InnerError> {
        if let Some(name) = name {
            if self.scope_ref().declares(name) {
                return Err(CompileError::Redeclared {
                    kind: kind.as_str(),
                    name: name.into(),
                }
                .into());
            }
        }
        let index = self.var_index;
        self.var_index += 1;
        if let Some(name) = name {
            self.scope().vars.insert(name.into(), (kind, index));
        }

        let action = if init { ActionType::Init } else { ActionType::SetReference };
        self.buf
            .write_variable(None, BinaryCode::InternalVar, action, None, VarName::Id(index))?;
        if init {
            self.init_block(bracket)?;
        } else {
            match kind {
                DeclarationKind::Ref => self.buf.write_code(BinaryCode::CreatePointer),
                DeclarationKind::Val => self.buf.write_code(BinaryCode::Copy),
                DeclarationKind::Var | DeclarationKind::Const => {}
            }
        }
        Ok(index)
    }

    /// Looks `name` up in this session and then in the enclosing ones.
    ///
    /// Returns the kind, the index usable in this session and whether the
    /// variable comes from a parent session.
    fn lookup_var(&mut self, name: &str) -> Result<Option<(DeclarationKind, u32, bool)>, InnerError> {
        if let Some((kind, index)) = self.subscopes.iter().rev().find_map(|s| s.vars.get(name)) {
            return Ok(Some((*kind, *index, false)));
        }
        let Some(parent) = self.parent.as_deref_mut() else {
            return Ok(None);
        };
        let Some((kind, index)) = parent.resolve_var(name)? else {
            return Ok(None);
        };
        if self.pseudo_parent {
            return Ok(Some((kind, index, true)));
        }
        let index = self.extracted(Extracted::Var(index), name)?;
        Ok(Some((kind, index, true)))
    }

    /// Index of an outer variable, label or pointer inside this block,
    /// writing its getter into the block prefix on first use.
    pub(super) fn extracted(&mut self, value: Extracted, name: &str) -> Result<u32, InnerError> {
        let Some(extract) = self.extract.as_mut() else {
            return Err(CompileError::ExtractOutsideChildScope(name.into()).into());
        };
        let (index, new) = extract.index(value.clone());
        if new {
            match value {
                Extracted::Var(var) => {
                    extract
                        .buf
                        .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(var))?;
                }
                Extracted::Label(label) => {
                    extract
                        .buf
                        .write_variable(None, BinaryCode::Label, ActionType::Get, None, VarName::Name(&label))?;
                }
                Extracted::Pointer(id) => {
                    extract.buf.write_code(BinaryCode::Pointer);
                    extract.buf.write_pointer_id(&id)?;
                }
            }
        }
        Ok(index)
    }

    fn write_extracted(&mut self, value: Extracted, name: &str) -> Result<(), InnerError> {
        let index = self.extracted(value, name)?;
        self.buf
            .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(index))?;
        Ok(())
    }

    fn variable(&mut self, sigil: Sigil, name: &str, assign: Option<Assign>, bracket: bool) -> Result<(), InnerError> {
        let (action, specifier) = action_of(assign);
        if bracket && action != ActionType::Init {
            self.rewind(1);
        }
        if action == ActionType::Get {
            self.value_index();
        }

        match sigil {
            Sigil::Root => self.root_variable(name, action, specifier, bracket),
            Sigil::Internal => {
                let (base, var) = match internal_var_code(name, action)? {
                    Some(code) => (code, VarName::None),
                    None if is_hex_name(name) => (BinaryCode::InternalVar, VarName::Id(hex_id(name))),
                    None => {
                        let slot = self
                            .resolve_slot(name)
                            .ok_or_else(|| CompileError::UnknownInternalVar(name.into()))?;
                        (BinaryCode::InternalVar, VarName::Id(slot as u32))
                    }
                };
                self.buf.write_variable(None, base, action, specifier, var)?;
                if action == ActionType::Init {
                    self.init_block(bracket)?;
                }
                Ok(())
            }
            Sigil::Label => {
                if self.extract_pointers && action == ActionType::Get {
                    return self.write_extracted(Extracted::Label(name.into()), name);
                }
                let var = if is_hex_name(name) {
                    VarName::Id(hex_id(name))
                } else {
                    VarName::Name(name)
                };
                self.buf.write_variable(None, BinaryCode::Label, action, specifier, var)?;
                if action == ActionType::Init {
                    self.init_block(bracket)?;
                }
                Ok(())
            }
        }
    }

    fn root_variable(
        &mut self,
        name: &str,
        action: ActionType,
        specifier: Option<BinaryCode>,
        bracket: bool,
    ) -> Result<(), InnerError> {
        let Some((kind, index, borrowed)) = self.lookup_var(name)? else {
            if action == ActionType::Get {
                if let Some(code) = std_type_code(name) {
                    self.buf.write_code(code);
                    return Ok(());
                }
            }
            return Err(CompileError::UndeclaredVariable(name.into()).into());
        };

        match (action, kind) {
            (ActionType::SetReference, DeclarationKind::Ref) => {
                return Err(CompileError::ReferenceOverride(name.into()).into());
            }
            (ActionType::SetReference, DeclarationKind::Val) => {
                return Err(CompileError::ValueReferenceOverride(name.into()).into());
            }
            (action, DeclarationKind::Val) if action != ActionType::Get && borrowed => {
                return Err(CompileError::BorrowedReadonly(name.into()).into());
            }
            (ActionType::SetReference | ActionType::Set, DeclarationKind::Const) => {
                return Err(CompileError::ConstReadonly(name.into()).into());
            }
            _ => {}
        }

        self.buf
            .write_variable(None, BinaryCode::InternalVar, action, specifier, VarName::Id(index))?;
        if action == ActionType::Init {
            self.init_block(bracket)?;
        }
        Ok(())
    }

    fn pointer(&mut self, id: &str, assign: Option<Assign>, bracket: bool) -> Result<(), InnerError> {
        let (action, specifier) = action_of(assign);
        let id = decode_hex(id).ok_or(SyntaxError::InvalidBuffer)?;
        if bracket && action != ActionType::Init {
            self.rewind(1);
        }
        if self.extract_pointers && action == ActionType::Get {
            let name = id.iter().map(|b| format!("{b:02x}")).join("");
            return self.write_extracted(Extracted::Pointer(id), &name);
        }
        if action == ActionType::Get {
            self.value_index();
        }
        self.write_pointer(&id, action, specifier)?;
        if action == ActionType::Init {
            self.init_block(bracket)?;
        }
        Ok(())
    }

    pub(super) fn write_pointer(
        &mut self,
        id: &[u8],
        action: ActionType,
        specifier: Option<BinaryCode>,
    ) -> Result<(), InnerError> {
        self.buf.write_u8(BinaryCode::Pointer.with_action(action));
        if let Some(specifier) = specifier {
            self.buf.write_code(specifier);
        }
        self.buf.write_pointer_id(id)?;
        if action != ActionType::Get {
            let pos = self.buf.pos();
            self.buf.indices_mut().add_assignment_end(pos);
        }
        Ok(())
    }

    /// Compiles a nested session on the remaining source and takes the
    /// source back once it is done.
    fn compile_child(&mut self, mode: Mode, kind: ChildKind) -> Result<Finished, InnerError> {
        let source = std::mem::take(&mut self.source);
        let shared = self.shared;
        let var_start = shared.config.var_start;
        let pseudo = kind == ChildKind::Pseudo;
        let var_index = if pseudo { self.var_index } else { var_start };

        let finished = match kind {
            ChildKind::Standalone => Session::new(shared, None, source, mode, var_index).run(),
            ChildKind::Pseudo | ChildKind::Block { .. } => {
                let mut child = Session::new(shared, Some(self), source, mode, var_index);
                child.pseudo_parent = pseudo;
                if let ChildKind::Block { extract_pointers } = kind {
                    child.extract = Some(Extraction::default());
                    child.extract_pointers = extract_pointers;
                }
                child.run()
            }
        }?;

        if pseudo {
            self.var_index = finished.var_index;
        }
        Ok(finished)
    }

    fn child_mode(bracket: bool) -> Mode {
        if bracket { Mode::Bracketed } else { Mode::Expression }
    }

    /// Value of an `:=` initialization as a length-prefixed block.
    fn init_block(&mut self, bracket: bool) -> Result<(), InnerError> {
        let mut finished = self.compile_child(Self::child_mode(bracket), ChildKind::Pseudo)?;
        self.source = std::mem::take(&mut finished.source);
        if self.source.next_char() == Some(';') {
            self.advance(1);
        }
        let len = u32::try_from(finished.body.len()).map_err(|_| CompileError::ScriptTooBig)?;
        self.buf.write_u32(len);
        self.buf.write_bytes(&finished.body);
        Ok(())
    }

    /// A child scope block: `code [getters] SCOPE_BLOCK len body`.
    pub(super) fn add_scope_block(
        &mut self,
        code: BinaryCode,
        bracket: bool,
        extract_pointers: bool,
    ) -> Result<(), InnerError> {
        let mut finished = self.compile_child(Self::child_mode(bracket), ChildKind::Block { extract_pointers })?;
        self.source = std::mem::take(&mut finished.source);
        self.buf.write_code(code);
        self.buf.write_bytes(&finished.body);
        Ok(())
    }

    fn block(&mut self, kind: BlockKind, bracket: bool) -> Result<(), InnerError> {
        self.value_index();
        self.add_scope_block(kind.code(), bracket, kind.extracts())
    }

    /// Compiles a snippet in isolation, evaluates it through the resolver
    /// and inserts the result.
    fn resolve_at_compile_time(&mut self, command: &str, bracket: bool) -> Result<(), InnerError> {
        let mut finished = self.compile_child(Self::child_mode(bracket), ChildKind::Standalone)?;
        self.source = std::mem::take(&mut finished.source);
        let (graph, id) = self.shared.resolver.evaluate(command, &finished.body)?;

        if command == "compile" {
            if let Some(Value::Scope(scope)) = graph.get(id) {
                let len = u32::try_from(scope.compiled.len()).map_err(|_| CompileError::ScriptTooBig)?;
                self.value_index();
                self.buf.write_code(BinaryCode::Do);
                self.buf.write_code(BinaryCode::ScopeBlock);
                self.buf.write_u32(len);
                self.buf.write_bytes(&scope.compiled);
                return Ok(());
            }
        }

        let inserted = std::mem::take(&mut self.inserted);
        let internal_vars = std::mem::take(&mut self.internal_vars);
        let result = self.insert_value(&graph, id);
        self.inserted = inserted;
        self.internal_vars = internal_vars;
        result
    }

    /// Compiles a nested construct only to find where it ends.
    ///
    /// Returns the consumed text and the character it stopped at.
    fn skim(&mut self, mode: Mode) -> Result<(String, Option<char>), InnerError> {
        let before = self.source.rest().to_string();
        let mut finished = self.compile_child(mode, ChildKind::Pseudo)?;
        self.source = std::mem::take(&mut finished.source);
        let after = self.source.rest();
        let consumed = before.strip_suffix(after).unwrap_or_default().trim().to_string();
        Ok((consumed, self.source.next_char()))
    }

    /// `function name(a, named b: T = 1) (body)` is rewritten into a typed
    /// `<Function(...)>` followed by a scope binding the parameters.
    fn function(&mut self, export: bool, name: Option<SmolStr>) -> Result<(), InnerError> {
        match name {
            Some(name) => {
                let index = self.declare(Some(&name), DeclarationKind::Ref, false, false)?;
                if export {
                    self.scope().exports.push((name, index));
                }
            }
            None if export => return Err(SyntaxError::UnexportableFunction.into()),
            None => {}
        }

        struct Param {
            named: bool,
            export: bool,
            kind: DeclarationKind,
            name: SmolStr,
            ty: String,
            default: Option<String>,
        }
        let mut params: Vec<Param> = Vec::new();

        while let Some((param, len)) = lexer::function_param(self.source.rest()) {
            self.advance(len);
            if params.iter().any(|p| p.name == param.name) {
                return Err(CompileError::FunctionParamRedeclared(param.name).into());
            }
            let mut entry = Param {
                named: param.named,
                export: param.export,
                kind: param.kind,
                name: param.name,
                ty: "<Any>".to_string(),
                default: None,
            };
            let mut end = param.end;

            if end == Some(':') {
                let (ty, next) = self.skim(Mode::Signature)?;
                entry.ty = ty;
                if next == Some(')') {
                    params.push(entry);
                    break;
                }
                if next == Some('=') {
                    end = Some('=');
                }
                self.advance(1);
                self.skip_whitespace();
            }

            if end == Some('=') {
                let (default, next) = self.skim(Mode::Expression)?;
                entry.default = Some(default);
                if next == Some(')') {
                    params.push(entry);
                    break;
                }
                self.advance(1);
                self.skip_whitespace();
            }

            if end == Some(')') {
                self.rewind(1);
                params.push(entry);
                break;
            }
            params.push(entry);
        }

        self.skip_whitespace();
        if self.source.next_char() != Some(')') {
            return Err(SyntaxError::InvalidFunctionParameters.into());
        }
        self.advance(1);
        self.skip_whitespace();
        if self.source.rest().starts_with("=>") {
            self.advance(2);
            self.skip_whitespace();
        }
        if self.source.next_char() == Some('(') {
            self.advance(1);
            self.skip_whitespace();
        }

        let mut signature = String::from("<Function((");
        let mut init = String::from("scope (");
        for (i, param) in params.iter().enumerate() {
            init.push_str(&format!(
                "\n{}{} {} = (#it.{}{});",
                if param.export { "export " } else { "" },
                param.kind.as_str(),
                param.name,
                i,
                param.default.as_ref().map(|d| format!(" default {d}")).unwrap_or_default(),
            ));
            if param.named {
                signature.push_str(&format!("{}: ", param.name));
            }
            signature.push_str(&param.ty);
            signature.push(',');
        }
        init.push(';');
        signature.push_str("),)>");

        self.source.prepend(&format!("{signature}{init}"));
        Ok(())
    }

    /// `plugin NAME (...)` is exported as a constant when enabled and
    /// skipped otherwise.
    fn plugin(&mut self, name: &str) -> Result<(), InnerError> {
        if self.shared.options.plugin_enabled(name) {
            self.shared.unused_plugins.borrow_mut().retain(|p| p != name);
            self.source.prepend(&format!("export const {name} = ("));
            return Ok(());
        }
        tracing::debug!(plugin = name, "skipping disabled plugin");
        let mut finished = self.compile_child(Mode::Bracketed, ChildKind::Block { extract_pointers: false })?;
        self.source = std::mem::take(&mut finished.source);
        Ok(())
    }

    fn finish(mut self) -> Result<Finished, InnerError> {
        if self.root {
            let unused = self.shared.unused_plugins.borrow();
            match unused.as_slice() {
                [] => {}
                [plugin] => return Err(CompileError::MissingPlugin(plugin.to_string()).into()),
                plugins => return Err(CompileError::MissingPlugins(plugins.iter().join(",")).into()),
            }
        }

        for scope in &self.subscopes {
            if let Some(statement) = scope.pending_statement() {
                return Err(SyntaxError::MissingStatementBody(statement).into());
            }
            if scope.auto_close.is_some() {
                continue;
            }
            match scope.parent_type {
                Some(BinaryCode::ObjectStart) => return Err(SyntaxError::MissingClosingObjectBracket.into()),
                Some(BinaryCode::ArrayStart) => return Err(SyntaxError::MissingClosingArrayBracket.into()),
                Some(BinaryCode::SubscopeStart | BinaryCode::TupleStart) => {
                    return Err(SyntaxError::MissingClosingBracket.into());
                }
                _ => {}
            }
        }

        if !self.waiting.is_empty() {
            let labels = self.waiting.keys().sorted().join(",");
            return Err(SyntaxError::UnresolvedLabels(labels).into());
        }

        if self.close_at_end && !self.last_command_end {
            while let Some(auto) = self.scope().auto_close.take() {
                self.exit_subscope(auto)?;
            }
            self.buf.write_code(BinaryCode::CloseAndStore);
        }

        if !self.subscopes[0].exports.is_empty() {
            let exports = std::mem::take(&mut self.subscopes[0].exports);
            let last = self.subscopes.len() - 1;
            self.subscopes[last].exports = exports;
            self.insert_exports()?;
        }

        let body = self.buf.into_vec();
        let body = match self.extract.take() {
            Some(mut extract) => {
                let len = u32::try_from(body.len()).map_err(|_| CompileError::ScriptTooBig)?;
                extract.buf.write_code(BinaryCode::ScopeBlock);
                extract.buf.write_u32(len);
                extract.buf.write_bytes(&body);
                extract.buf.into_vec()
            }
            None => body,
        };

        if self.root {
            tracing::debug!(size = body.len(), bodies = self.bodies.len(), "compiled body");
        }
        Ok(Finished {
            body,
            source: self.source,
            var_index: self.var_index,
            bodies: self.bodies,
        })
    }
}

impl ParentScope for Session<'_, '_> {
    fn resolve_var(&mut self, name: &str) -> Result<Option<(DeclarationKind, u32)>, InnerError> {
        Ok(self.lookup_var(name)?.map(|(kind, index, _)| (kind, index)))
    }

    fn resolve_slot(&self, name: &str) -> Option<u16> {
        self.scope_ref()
            .object_slots
            .get(name)
            .copied()
            .or_else(|| self.parent.as_deref().and_then(|p| p.resolve_slot(name)))
    }
}

fn action_of(assign: Option<Assign>) -> (ActionType, Option<BinaryCode>) {
    match assign {
        None | Some(Assign::Ignored) => (ActionType::Get, None),
        Some(Assign::Set) => (ActionType::Set, None),
        Some(Assign::Init) => (ActionType::Init, None),
        Some(Assign::SetReference) => (ActionType::SetReference, None),
        Some(Assign::Update(code)) => (ActionType::Other, Some(code)),
    }
}

/// Opcode of a named internal variable. Most of them are read-only.
pub(super) fn internal_var_code(name: &str, action: ActionType) -> Result<Option<BinaryCode>, CompileError> {
    let writable = match name {
        "result" => Some(BinaryCode::VarResult),
        "sub_result" => Some(BinaryCode::VarSubResult),
        "_origin" => Some(BinaryCode::VarOriginInternal),
        "it" => Some(BinaryCode::VarIt),
        "void" => Some(BinaryCode::VarVoid),
        _ => None,
    };
    if writable.is_some() {
        return Ok(writable);
    }

    let readonly = match name {
        "origin" => BinaryCode::VarOrigin,
        "endpoint" => BinaryCode::VarEndpoint,
        "location" => BinaryCode::VarLocation,
        "env" => BinaryCode::VarEnv,
        "meta" => BinaryCode::VarMeta,
        "public" => BinaryCode::VarPublic,
        "this" => BinaryCode::VarThis,
        "remote" => BinaryCode::VarRemote,
        "entrypoint" => BinaryCode::VarEntrypoint,
        "std" => BinaryCode::VarStd,
        _ => return Ok(None),
    };
    if action != ActionType::Get {
        return Err(CompileError::InvalidInternalVarAction(name.into()));
    }
    Ok(Some(readonly))
}

fn is_hex_name(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_hexdigit() || c == '_')
}

fn hex_id(name: &str) -> u32 {
    let digits: String = name.chars().filter(|c| *c != '_' && *c != '-').collect();
    if digits.is_empty() {
        return 0;
    }
    u32::from_str_radix(&digits, 16).unwrap_or(u32::MAX)
}

/// Milliseconds since the Unix epoch of a `~...~` literal.
fn parse_time(text: &str) -> Option<i64> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    let text = text.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(time.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(text, format) {
            return Some(time.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|time| time.and_utc().timestamp_millis())
}
