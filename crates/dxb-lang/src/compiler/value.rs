//! Encoding of [`Value`]s into the instruction stream.
//!
//! Values are written the same way a literal in the script would be, with two
//! additions: a value reached a second time is replaced by a read of an
//! internal variable assigned at its first occurrence, and a container that
//! (transitively) contains itself is written with a placeholder and patched
//! by trailing child assignments.
use rustc_hash::FxHashSet;

use super::scope::{Extracted, Subscope};
use super::session::{Session, internal_var_code};
use crate::binary::{ActionType, BinaryCode};
use crate::buffer::{Buffer, VarName};
use crate::dynamic_index::DynamicIndex;
use crate::error::{CompileError, InnerError, ValueError};
use crate::value::{Identity, PointerRef, PropertyKey, ScopeBlock, TupleKey, TypeRef, Value, ValueGraph, ValueId};

/// `parent[key] = value`, emitted after the root container is complete.
struct Unassigned {
    parent: u32,
    key: PropertyKey,
    value: u32,
}

impl Session<'_, '_> {
    /// Writes the value `id` of `graph` at the cursor.
    pub(crate) fn insert_value(&mut self, graph: &ValueGraph, id: ValueId) -> Result<(), InnerError> {
        let mut unassigned = Vec::new();
        self.insert_node(graph, id, true, &FxHashSet::default(), &mut unassigned)
    }

    fn insert_node(
        &mut self,
        graph: &ValueGraph,
        id: ValueId,
        is_root: bool,
        parents: &FxHashSet<ValueId>,
        unassigned: &mut Vec<Unassigned>,
    ) -> Result<(), InnerError> {
        let Some(value) = graph.get(id) else {
            return Err(ValueError::UnsupportedNative(format!("dangling value {id:?}")).into());
        };

        if let Value::BoundSlot(name) = value {
            let code = internal_var_code(name, ActionType::Get)?
                .ok_or_else(|| CompileError::UnknownInternalVar(name.clone()))?;
            if is_root {
                self.value_index();
            }
            self.buf
                .write_variable(None, code, ActionType::Get, None, VarName::None)?;
            return Ok(());
        }

        if let Value::Stream(chunks) = value {
            return self.insert_stream(chunks);
        }

        let identity = graph.identity(id, !self.shared.options.no_duplicate_value_optimization);
        if let Some(identity) = &identity {
            if let Some(start) = self.inserted.get(identity).copied() {
                let var = self.internal_var_at(start, identity.clone())?;
                if is_root {
                    self.value_index();
                }
                self.buf
                    .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(var))?;
                self.first_insert_done = true;
                return Ok(());
            }
        }

        let pos = self.buf.pos();
        let start = self.buf.dynamic_index(pos);
        if let Some(identity) = identity {
            self.inserted.insert(identity, start);
        }
        if is_root {
            self.value_index();
        }

        if let Value::Pointer(pointer) = value {
            return self.insert_pointer(graph, pointer, is_root, parents, unassigned);
        }
        self.first_insert_done = true;

        match value {
            Value::Void => self.buf.write_code(BinaryCode::Void),
            Value::Null => self.buf.write_code(BinaryCode::Null),
            Value::Bool(b) => self.buf.write_bool(*b),
            Value::Int(i) => self.buf.write_int(*i),
            Value::BigInt(b) => self.buf.write_bigint(b)?,
            Value::Float(f) => self.buf.write_float(*f),
            Value::Text(s) => self.buf.write_text(s),
            Value::Quantity(q) => self.buf.write_quantity(q)?,
            Value::Url(url) => self.buf.write_long_string(BinaryCode::Url, url.as_str()),
            Value::Time(time) => self.buf.write_time(time.timestamp_millis()),
            Value::Buffer(data) => self.buf.write_buffer(data),
            Value::Target(target) => self.buf.write_target(target)?,
            Value::Type(ty) => self.insert_type(graph, ty, parents, unassigned)?,
            Value::Typed { ty, value } => {
                self.insert_type(graph, ty, parents, unassigned)?;
                self.insert_node(graph, *value, is_root, parents, unassigned)?;
            }
            Value::Error { code, message } => {
                self.buf.write_type("std", "Error", None, false)?;
                self.buf.write_code(BinaryCode::TupleStart);
                self.buf.write_key("code")?;
                self.buf.write_text(code);
                self.buf.write_key("message")?;
                self.buf.write_text(message);
                self.buf.write_code(BinaryCode::TupleEnd);
            }
            Value::Scope(scope) => self.insert_scope_block(graph, BinaryCode::PlainScope, scope)?,
            Value::PointerProperty { pointer, key } => self.insert_pointer_property(graph, pointer, *key)?,
            Value::Disjunction(items) | Value::Conjunction(items) => {
                let code = match value {
                    Value::Disjunction(_) => BinaryCode::Disjunction,
                    _ => BinaryCode::Conjunction,
                };
                self.buf.write_code(code);
                self.buf.write_u32(items.len() as u32);
                for item in items {
                    self.insert_node(graph, *item, false, parents, unassigned)?;
                }
            }
            Value::Negation(inner) => {
                self.buf.write_code(BinaryCode::Not);
                self.insert_node(graph, *inner, false, parents, unassigned)?;
            }
            Value::Array(items) => {
                let entries = items.iter().enumerate().map(|(i, item)| (TupleKey::Index(i as i64), *item));
                self.insert_container(graph, id, start, ContainerKind::Array, entries, is_root, parents, unassigned)?;
            }
            Value::Tuple(entries) => {
                let entries = entries.iter().cloned();
                self.insert_container(graph, id, start, ContainerKind::Tuple, entries, is_root, parents, unassigned)?;
            }
            Value::Object(entries) => {
                let entries = entries.iter().map(|(k, v)| (TupleKey::Name(k.clone()), *v));
                self.insert_container(graph, id, start, ContainerKind::Object, entries, is_root, parents, unassigned)?;
            }
            Value::Symbol(name) => {
                tracing::warn!(symbol = %name, "symbol has no wire form, sending void");
                self.buf.write_code(BinaryCode::Void);
            }
            Value::Native(name) => return Err(ValueError::UnsupportedNative(name.to_string()).into()),
            Value::Pointer(_) | Value::BoundSlot(_) | Value::Stream(_) => {}
        }
        Ok(())
    }

    fn insert_type(
        &mut self,
        graph: &ValueGraph,
        ty: &TypeRef,
        parents: &FxHashSet<ValueId>,
        unassigned: &mut Vec<Unassigned>,
    ) -> Result<(), InnerError> {
        let parameters = ty.parameters.as_deref().unwrap_or_default();
        self.buf
            .write_type(&ty.namespace, &ty.name, ty.variation.as_deref(), ty.parameters.is_some())?;
        if ty.parameters.is_some() {
            self.buf.write_code(BinaryCode::TupleStart);
            for parameter in parameters {
                self.buf.write_code(BinaryCode::Element);
                self.insert_node(graph, *parameter, false, parents, unassigned)?;
            }
            self.buf.write_code(BinaryCode::TupleEnd);
        }
        Ok(())
    }

    /// `code (captured)* SCOPE_BLOCK len compiled`
    fn insert_scope_block(&mut self, graph: &ValueGraph, code: BinaryCode, scope: &ScopeBlock) -> Result<(), InnerError> {
        self.buf.write_code(code);
        for captured in &scope.internal_vars {
            self.buf.write_code(BinaryCode::SubscopeStart);
            self.insert_value(graph, *captured)?;
            self.buf.write_code(BinaryCode::SubscopeEnd);
        }
        let len = u32::try_from(scope.compiled.len()).map_err(|_| CompileError::ScriptTooBig)?;
        self.buf.write_code(BinaryCode::ScopeBlock);
        self.buf.write_u32(len);
        self.buf.write_bytes(&scope.compiled);
        Ok(())
    }

    /// A pointer is sent as a reference unless the options ask for its
    /// value, in which case the value (or its transform) is inlined.
    fn insert_pointer(
        &mut self,
        graph: &ValueGraph,
        pointer: &PointerRef,
        is_root: bool,
        parents: &FxHashSet<ValueId>,
        unassigned: &mut Vec<Unassigned>,
    ) -> Result<(), InnerError> {
        let options = self.shared.options;
        let skip_first_collapse = !self.first_insert_done && options.collapse_first_inserted;
        let option_collapse =
            options.collapse_pointers && !(options.keep_external_pointers && !pointer.origin);
        let no_proxify = pointer.anonymous || option_collapse || skip_first_collapse;

        if no_proxify {
            if let Some(transform) = &pointer.transform {
                if !skip_first_collapse || options.keep_first_transform {
                    self.first_insert_done = true;
                    return self.insert_scope_block(graph, BinaryCode::Transform, transform);
                }
            }
            if let Some(value) = pointer.value {
                self.first_insert_done = true;
                if option_collapse && !skip_first_collapse {
                    self.buf.write_code(BinaryCode::CreatePointer);
                }
                return self.insert_node(graph, value, is_root, parents, unassigned);
            }
        }
        self.first_insert_done = true;

        if self.extract_pointers {
            let name = hex(&pointer.id);
            let index = self.extracted(Extracted::Pointer(pointer.id.clone()), &name)?;
            self.buf
                .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(index))?;
            return Ok(());
        }
        self.write_pointer(&pointer.id, ActionType::Get, None)
    }

    /// `$pointer->key`. In a block that extracts pointers the whole path is
    /// read once in the block prefix.
    fn insert_pointer_property(
        &mut self,
        graph: &ValueGraph,
        pointer: &PointerRef,
        key: ValueId,
    ) -> Result<(), InnerError> {
        self.first_insert_done = true;
        if self.extract_pointers {
            if let Some(extract) = self.extract.as_mut() {
                extract.buf.write_code(BinaryCode::Pointer);
                extract.buf.write_pointer_id(&pointer.id)?;
                extract.buf.write_code(BinaryCode::ChildGetRef);
                write_property_key(&mut extract.buf, graph, key)?;
                let index = extract.reserve();
                self.buf
                    .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(index))?;
                return Ok(());
            }
        }

        self.write_pointer(&pointer.id, ActionType::Get, None)?;
        let pos = self.buf.pos();
        let path = self.buf.dynamic_index(pos);
        self.scope().path_info = Some(path);
        self.buf.write_code(BinaryCode::ChildGetRef);
        write_property_key(&mut self.buf, graph, key)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_container(
        &mut self,
        graph: &ValueGraph,
        id: ValueId,
        start: DynamicIndex,
        kind: ContainerKind,
        entries: impl Iterator<Item = (TupleKey, ValueId)>,
        is_root: bool,
        parents: &FxHashSet<ValueId>,
        unassigned: &mut Vec<Unassigned>,
    ) -> Result<(), InnerError> {
        let mut parents = parents.clone();
        parents.insert(id);
        let numbers_and_text = !self.shared.options.no_duplicate_value_optimization;
        let mut parent_var = None;

        self.buf.write_code(kind.open());
        for (key, child) in entries {
            let child_identity = graph.identity(child, numbers_and_text);
            let recursive = parents.contains(&child)
                && child_identity
                    .as_ref()
                    .is_some_and(|identity| self.inserted.contains_key(identity));

            if recursive {
                let parent = match parent_var {
                    Some(var) => var,
                    None => {
                        let var = self.internal_var_at(start, Identity::Node(id))?;
                        parent_var = Some(var);
                        var
                    }
                };
                let value = match child_identity {
                    Some(identity) if child != id => match self.inserted.get(&identity).copied() {
                        Some(child_start) => self.internal_var_at(child_start, identity)?,
                        None => parent,
                    },
                    _ => parent,
                };
                unassigned.push(Unassigned {
                    parent,
                    key: key.into(),
                    value,
                });
                // arrays keep their indices with a placeholder
                if kind == ContainerKind::Array {
                    self.buf.write_code(BinaryCode::Element);
                    self.buf.write_code(BinaryCode::Void);
                }
                continue;
            }

            match (kind, &key) {
                (ContainerKind::Array, _) | (ContainerKind::Tuple, TupleKey::Index(_)) => {
                    self.buf.write_code(BinaryCode::Element)
                }
                (_, TupleKey::Name(name)) => self.buf.write_key(name)?,
                (ContainerKind::Object, TupleKey::Index(i)) => self.buf.write_key(&i.to_string())?,
            }
            self.insert_node(graph, child, false, &parents, unassigned)?;
        }
        self.buf.write_code(kind.close());

        if is_root && !unassigned.is_empty() {
            self.add_children_assignments(start, std::mem::take(unassigned))?;
        }
        Ok(())
    }

    /// `( VALUE ; parent.key = value ... )` closing the reference cycles.
    fn add_children_assignments(&mut self, start: DynamicIndex, unassigned: Vec<Unassigned>) -> Result<(), InnerError> {
        let at = self.buf.resolve(start);
        self.buf.insert_at(at, &[BinaryCode::SubscopeStart.byte()], at);
        for assignment in unassigned {
            self.buf.write_code(BinaryCode::CloseAndStore);
            self.buf.write_variable(
                None,
                BinaryCode::InternalVar,
                ActionType::Get,
                None,
                VarName::Id(assignment.parent),
            )?;
            self.buf.write_code(BinaryCode::ChildSet);
            match &assignment.key {
                PropertyKey::Index(i) => self.buf.write_int(*i),
                PropertyKey::Name(name) => self.buf.write_text(name),
            }
            self.buf.write_variable(
                None,
                BinaryCode::InternalVar,
                ActionType::Get,
                None,
                VarName::Id(assignment.value),
            )?;
        }
        self.buf.write_code(BinaryCode::SubscopeEnd);
        Ok(())
    }

    /// Internal variable holding the value written at `start`, creating the
    /// assignment in front of it on first use.
    fn internal_var_at(&mut self, start: DynamicIndex, identity: Identity) -> Result<u32, InnerError> {
        if let Some(var) = self.internal_vars.get(&identity) {
            return Ok(*var);
        }
        let var = self.internal_var_index;
        self.internal_var_index += 1;

        let mut at = self.buf.resolve(start);
        let add_global = !self.buf.indices().is_assignment_end(at);
        let gap = 4 + usize::from(add_global);
        self.buf.open_gap(at, gap);
        if add_global {
            self.buf.set_byte(at, BinaryCode::SetVarSubResult.byte());
            at += 1;
        }
        self.buf
            .write_variable(Some(at), BinaryCode::InternalVar, ActionType::Set, None, VarName::Id(var))?;

        self.internal_vars.insert(identity, var);
        Ok(var)
    }

    /// Chunks following a `<<` at the top level are cut into blocks of their
    /// own; anywhere else they are inlined as buffers.
    fn insert_stream(&mut self, chunks: &[Vec<u8>]) -> Result<(), InnerError> {
        let streaming = self.root
            && self.subscopes.len() == 1
            && self.waiting.is_empty()
            && self.buf.last() == Some(BinaryCode::Stream.byte());

        if !streaming {
            for chunk in chunks {
                self.buf.write_buffer(chunk);
            }
            return Ok(());
        }

        tracing::debug!(chunks = chunks.len(), "cutting stream into separate blocks");
        let body = std::mem::take(&mut self.buf).into_vec();
        self.bodies.push(body);
        for chunk in chunks {
            let mut block = Buffer::new();
            block.write_buffer(chunk);
            self.bodies.push(block.into_vec());
        }

        // offsets into the finished body are meaningless in the next one
        let old = std::mem::replace(&mut self.subscopes[0], Subscope::root());
        let scope = self.scope();
        scope.vars = old.vars;
        scope.exports = old.exports;
        scope.object_slots = old.object_slots;
        self.buf = Buffer::new();
        self.inserted.clear();
        self.internal_vars.clear();
        self.labels.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Array,
    Tuple,
    Object,
}

impl ContainerKind {
    fn open(self) -> BinaryCode {
        match self {
            ContainerKind::Array => BinaryCode::ArrayStart,
            ContainerKind::Tuple => BinaryCode::TupleStart,
            ContainerKind::Object => BinaryCode::ObjectStart,
        }
    }

    fn close(self) -> BinaryCode {
        match self {
            ContainerKind::Array => BinaryCode::ArrayEnd,
            ContainerKind::Tuple => BinaryCode::TupleEnd,
            ContainerKind::Object => BinaryCode::ObjectEnd,
        }
    }
}

/// Key after a `->`. Only scalar keys have a wire form here.
fn write_property_key(buf: &mut Buffer, graph: &ValueGraph, key: ValueId) -> Result<(), InnerError> {
    match graph.get(key) {
        Some(Value::Text(name)) => buf.write_text(name),
        Some(Value::Int(i)) => buf.write_int(*i),
        Some(Value::BigInt(b)) => buf.write_bigint(b)?,
        Some(Value::Float(f)) => buf.write_float(*f),
        Some(Value::Void) => buf.write_code(BinaryCode::Void),
        Some(other) => return Err(ValueError::UnsupportedNative(format!("{} as property key", other.kind())).into()),
        None => return Err(ValueError::UnsupportedNative("dangling property key".to_string()).into()),
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
