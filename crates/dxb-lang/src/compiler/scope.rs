//! Per-bracket compile state.
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::binary::{BinaryCode, CUSTOM_SLOT_START};
use crate::buffer::Buffer;
use crate::dynamic_index::DynamicIndex;
use crate::lexer::token::DeclarationKind;

/// Where a nested compile stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Mode {
    /// Runs to the end of the input.
    Full,
    /// Ends at the `)` matching an already consumed `(`.
    Bracketed,
    /// Ends before the first top-level `,`, `;` or closing bracket.
    Expression,
    /// Parameter type of a function signature; also ends before `=`.
    Signature,
}

/// Two-pass state of an `iterate` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterateStep {
    /// Waiting for the iterated value.
    Source,
    /// Waiting for the loop body.
    Body,
}

/// One open bracket, structure or control-flow construct.
///
/// All offsets are dynamic indices so that splices before them keep them valid.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscope {
    /// Offset of the opening opcode. `None` for the outermost subscope.
    pub start: Option<DynamicIndex>,
    pub parent_type: Option<BinaryCode>,
    pub last_value: Option<DynamicIndex>,
    pub first_value: Option<DynamicIndex>,
    /// Offset of the `ELEMENT` byte a following key overwrites.
    pub first_element_pos: Option<DynamicIndex>,
    /// Offset of the last `CHILD_GET`/`CHILD_GET_REF`, rewritten by assignments.
    pub path_info: Option<DynamicIndex>,

    /// Values still expected before the control-flow epilogue runs.
    pub value_count: Option<i32>,
    pub iterate: Option<IterateStep>,
    pub loop_start: Option<DynamicIndex>,
    /// Jump field of the `iterate` exit.
    pub iterate_jfa: Option<DynamicIndex>,
    /// Jump field of the `while` exit.
    pub while_jfa: Option<DynamicIndex>,
    /// Jump field of the current `if`/`else if` condition.
    pub if_jfa: Option<DynamicIndex>,
    /// Fields of the jumps from each finished branch to the end of the chain.
    pub if_ends: Vec<DynamicIndex>,
    pub else_branch: bool,

    pub in_template: bool,
    /// A `<Type(` waits for its closing `>`.
    pub param_type_close: bool,
    /// Closing opcode written when the subscope is left implicitly.
    pub auto_close: Option<BinaryCode>,
    pub comma_indices: Vec<DynamicIndex>,
    /// A `;` was seen inside this subscope.
    pub has_ce: bool,
    pub ce_index: Option<DynamicIndex>,

    pub vars: FxHashMap<SmolStr, (DeclarationKind, u32)>,
    pub exports: Vec<(SmolStr, u32)>,
    pub object_slots: FxHashMap<SmolStr, u16>,
    next_slot: u16,

    pub use_index: Option<u32>,
    /// `(name, alias)` pairs of a pending `use (...) from`.
    pub imported: Vec<(SmolStr, Option<SmolStr>)>,
}

impl Subscope {
    pub(crate) fn root() -> Self {
        Self {
            next_slot: CUSTOM_SLOT_START,
            ..Default::default()
        }
    }

    /// A subscope opened by `parent_type`, inheriting the enclosing loop.
    pub(crate) fn nested(parent_type: Option<BinaryCode>, start: DynamicIndex, loop_start: Option<DynamicIndex>) -> Self {
        Self {
            start: Some(start),
            parent_type,
            loop_start,
            next_slot: CUSTOM_SLOT_START,
            ..Default::default()
        }
    }

    /// Counts a value towards a pending control-flow construct.
    pub(crate) fn count_value(&mut self) {
        if let Some(count) = self.value_count.as_mut() {
            *count -= 1;
        }
    }

    pub(crate) fn value_count_done(&self) -> bool {
        self.value_count.is_none_or(|count| count <= 0)
    }

    /// Name of a control-flow statement still waiting for its condition or body.
    pub(crate) fn pending_statement(&self) -> Option<&'static str> {
        if self.iterate.is_some() {
            Some("iterate")
        } else if self.while_jfa.is_some() {
            Some("while")
        } else if self.else_branch {
            Some("else")
        } else if self.if_jfa.is_some() {
            Some("if")
        } else {
            None
        }
    }

    pub(crate) fn is_bracket(&self) -> bool {
        matches!(
            self.parent_type,
            Some(BinaryCode::ObjectStart | BinaryCode::ArrayStart | BinaryCode::SubscopeStart)
        )
    }

    /// Returns the slot id of `#name:`, allocating a custom slot on first use.
    pub(crate) fn object_slot(&mut self, name: &str) -> u16 {
        let slot = match name {
            "write" => crate::binary::SLOT_WRITE,
            "read" => crate::binary::SLOT_READ,
            "exec" => crate::binary::SLOT_EXEC,
            "get" => crate::binary::SLOT_GET,
            "set" => crate::binary::SLOT_SET,
            _ => match self.object_slots.get(name) {
                Some(slot) => return *slot,
                None => {
                    let slot = self.next_slot;
                    self.next_slot = self.next_slot.wrapping_add(1);
                    slot
                }
            },
        };
        self.object_slots.insert(name.into(), slot);
        slot
    }

    /// Whether `name` was declared directly in this subscope.
    pub(crate) fn declares(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }
}

/// Values a child scope block pulls in from its parent.
///
/// Each distinct variable, label or pointer gets one internal variable of the
/// block; the getters are emitted in front of the block body.
#[derive(Debug, Default)]
pub(crate) struct Extraction {
    pub buf: Buffer,
    indices: FxHashMap<Extracted, u32>,
    next: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Extracted {
    Var(u32),
    Label(SmolStr),
    Pointer(Vec<u8>),
}

impl Extraction {
    /// Index of `value` inside the block, and whether it was just added.
    pub(crate) fn index(&mut self, value: Extracted) -> (u32, bool) {
        if let Some(index) = self.indices.get(&value) {
            return (*index, false);
        }
        let index = self.next;
        self.next += 1;
        self.indices.insert(value, index);
        (index, true)
    }

    /// Reserves an index without a getter (pointer properties).
    pub(crate) fn reserve(&mut self) -> u32 {
        let index = self.next;
        self.next += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::write("write", 0xfef0)]
    #[case::read("read", 0xfef1)]
    #[case::exec("exec", 0xfef2)]
    #[case::get("get", 0xfef3)]
    #[case::set("set", 0xfef4)]
    #[case::custom("count", 0xfa00)]
    fn test_object_slot(#[case] name: &str, #[case] expected: u16) {
        let mut scope = Subscope::root();
        assert_eq!(scope.object_slot(name), expected);
    }

    #[test]
    fn test_custom_slots_are_stable() {
        let mut scope = Subscope::root();
        assert_eq!(scope.object_slot("a"), 0xfa00);
        assert_eq!(scope.object_slot("b"), 0xfa01);
        assert_eq!(scope.object_slot("a"), 0xfa00);
    }

    #[rstest]
    #[case::unset(None, true)]
    #[case::pending(Some(1), false)]
    #[case::done(Some(0), true)]
    fn test_value_count_done(#[case] count: Option<i32>, #[case] expected: bool) {
        let scope = Subscope {
            value_count: count,
            ..Subscope::root()
        };
        assert_eq!(scope.value_count_done(), expected);
    }

    #[test]
    fn test_extraction_reuses_indices() {
        let mut extraction = Extraction::default();
        assert_eq!(extraction.index(Extracted::Var(0x100)), (0, true));
        assert_eq!(extraction.index(Extracted::Label("x".into())), (1, true));
        assert_eq!(extraction.index(Extracted::Var(0x100)), (0, false));
        assert_eq!(extraction.reserve(), 2);
    }
}
