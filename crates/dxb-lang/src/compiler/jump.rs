//! Labels, jumps and the `if`/`while`/`iterate` constructs.
//!
//! Forward jumps are written with a zero target and patched once the target
//! offset is known. Every jump field is registered with the buffer, so a later
//! splice in front of a target moves the target value along with it.
use smol_str::SmolStr;

use super::scope::IterateStep;
use super::session::Session;
use crate::binary::{ActionType, BinaryCode};
use crate::buffer::VarName;
use crate::dynamic_index::DynamicIndex;
use crate::error::{InnerError, SyntaxError};

impl Session<'_, '_> {
    /// Points the jump field `field` at the current cursor.
    fn patch_jump(&mut self, field: DynamicIndex) {
        let target = self.buf.pos();
        self.patch_jump_to(field, target);
    }

    fn patch_jump_to(&mut self, field: DynamicIndex, target: usize) {
        let at = self.buf.resolve(field);
        self.buf.put_u32_at(at, target as u32);
    }

    pub(super) fn jump(&mut self, code: BinaryCode, label: Option<SmolStr>) {
        self.value_index();
        let label = label.unwrap_or_default();
        match self.labels.get(&label).copied() {
            Some(target) => {
                let target = self.buf.resolve(target) as u32;
                self.buf.write_jump(code, Some(target));
                self.used_labels.insert(label);
            }
            None => {
                let field = self.buf.write_jump(code, None);
                self.waiting.entry(label).or_default().push(field);
            }
        }
    }

    pub(super) fn label(&mut self, label: Option<SmolStr>) -> Result<(), InnerError> {
        let label = label.unwrap_or_default();
        if self.labels.contains_key(&label) {
            return Err(SyntaxError::DuplicateLabel(label).into());
        }
        let pos = self.buf.pos();
        let target = self.buf.anchor(pos);
        self.labels.insert(label.clone(), target);

        if let Some(fields) = self.waiting.remove(&label) {
            for field in fields {
                self.patch_jump_to(field, pos);
            }
        }

        if !self.cache_point {
            self.cache_point = true;
            self.buf.write_code(BinaryCode::CachePoint);
        }
        Ok(())
    }

    /// `iterate VALUE (BODY)`: `#i = iterator VALUE;` then a `next` loop.
    pub(super) fn iterate(&mut self) -> Result<(), InnerError> {
        self.value_index();
        let scope = self.scope();
        scope.iterate = Some(IterateStep::Source);
        scope.value_count = Some(1);
        self.buf.write_code(BinaryCode::SubscopeStart);
        self.buf
            .write_variable(None, BinaryCode::InternalVar, ActionType::Set, None, VarName::Name("i"))?;
        self.buf.write_code(BinaryCode::CreatePointer);
        self.buf.write_code(BinaryCode::StdTypeIterator);
        Ok(())
    }

    /// `while COND (BODY)`
    pub(super) fn while_loop(&mut self) {
        self.value_index();
        self.buf.write_code(BinaryCode::SubscopeStart);
        let pos = self.buf.pos();
        let loop_start = self.buf.dynamic_index(pos);
        let scope = self.scope();
        scope.loop_start = Some(loop_start);
        scope.value_count = Some(2);
        let field = self.buf.write_jump(BinaryCode::Jfa, None);
        self.scope().while_jfa = Some(field);
    }

    /// `if COND (BODY)` and `else if COND (BODY)`.
    pub(super) fn if_branch(&mut self, has_else: bool) -> Result<(), InnerError> {
        if has_else {
            if self.scope_ref().if_ends.is_empty() {
                return Err(SyntaxError::ElseIfWithoutIf.into());
            }
            // continue inside the chain's subscope
            let pos = self.buf.pos();
            self.buf.set_pos(pos - 1);
        } else {
            self.value_index();
            self.buf.write_code(BinaryCode::SubscopeStart);
        }
        self.scope().value_count = Some(2);
        let field = self.buf.write_jump(BinaryCode::Jfa, None);
        self.scope().if_jfa = Some(field);
        Ok(())
    }

    pub(super) fn else_branch(&mut self) -> Result<(), InnerError> {
        if self.scope_ref().if_ends.is_empty() {
            return Err(SyntaxError::ElseWithoutIf.into());
        }
        let pos = self.buf.pos();
        self.buf.set_pos(pos - 1);
        let scope = self.scope();
        scope.else_branch = true;
        scope.value_count = Some(1);
        Ok(())
    }

    pub(super) fn skip(&mut self) -> Result<(), InnerError> {
        let loop_start = self.scope_ref().loop_start.ok_or(SyntaxError::InvalidSkip)?;
        let target = self.buf.resolve(loop_start) as u32;
        self.buf.write_jump(BinaryCode::Jmp, Some(target));
        self.value_index();
        Ok(())
    }

    /// Closes the pending construct once its operands are all compiled.
    pub(super) fn epilogue(&mut self) -> Result<(), InnerError> {
        let mut keep_count = false;

        match self.scope_ref().iterate {
            Some(IterateStep::Source) => {
                self.buf.write_code(BinaryCode::CloseAndStore);
                let pos = self.buf.pos();
                let loop_start = self.buf.dynamic_index(pos);
                self.scope().loop_start = Some(loop_start);
                let field = self.buf.write_jump(BinaryCode::Jfa, None);
                self.scope().iterate_jfa = Some(field);

                self.buf.write_code(BinaryCode::SubscopeStart);
                self.buf.write_code(BinaryCode::Next);
                self.buf
                    .write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Name("i"))?;
                self.buf.write_code(BinaryCode::SubscopeEnd);
                self.buf.write_code(BinaryCode::CloseAndStore);

                let scope = self.scope();
                scope.iterate = Some(IterateStep::Body);
                scope.value_count = Some(1);
                keep_count = true;
            }
            Some(IterateStep::Body) => {
                self.close_loop(|scope| scope.iterate_jfa.take());
                self.scope().iterate = None;
            }
            None if self.scope_ref().while_jfa.is_some() => {
                self.close_loop(|scope| scope.while_jfa.take());
            }
            None if self.scope_ref().if_jfa.is_some() || self.scope_ref().else_branch => {
                self.close_if_branch();
            }
            None => {}
        }

        if !keep_count {
            self.scope().value_count = None;
        }
        Ok(())
    }

    /// Jumps back to the loop head and lets the exit jump land behind it.
    fn close_loop(&mut self, exit: impl FnOnce(&mut super::scope::Subscope) -> Option<DynamicIndex>) {
        if let Some(loop_start) = self.scope_ref().loop_start {
            let target = self.buf.resolve(loop_start) as u32;
            self.buf.write_jump(BinaryCode::Jmp, Some(target));
        }
        if let Some(field) = exit(self.scope()) {
            self.patch_jump(field);
        }
        self.buf.write_code(BinaryCode::SubscopeEnd);
        self.scope().loop_start = None;
    }

    /// Ends an `if`/`else if` branch, or the trailing `else` of a chain.
    ///
    /// Each branch leaves with a jump onto the chain's closing
    /// `SUBSCOPE_END`. Until an `else` follows, that byte is provisional and
    /// the next `else`/`else if` overwrites it.
    fn close_if_branch(&mut self) {
        let mut end = None;
        if let Some(condition) = self.scope().if_jfa.take() {
            let end_jump = self.buf.write_jump(BinaryCode::Jmp, None);
            self.scope().if_ends.push(end_jump);
            self.patch_jump(condition);
            end = Some(self.buf.pos());
            self.buf.write_code(BinaryCode::SubscopeEnd);
        }

        let end = end.unwrap_or_else(|| self.buf.pos());
        let ends = self.scope_ref().if_ends.clone();
        for field in ends {
            self.patch_jump_to(field, end);
        }

        if self.scope_ref().else_branch {
            let scope = self.scope();
            scope.if_ends.clear();
            scope.else_branch = false;
            self.buf.write_code(BinaryCode::SubscopeEnd);
        }
    }
}
