//! Buffer offsets that stay valid when bytes are spliced in before them.
use rustc_hash::FxHashSet;

use crate::arena::{Arena, ArenaId};

/// Handle of a registered offset.
pub type DynamicIndex = ArenaId<usize>;

/// Registry of every offset that a mid-buffer insertion must correct.
///
/// Four kinds of offsets are tracked:
/// - plain cells ([`DynamicIndex`]), e.g. the start of an emitted value;
/// - anchors, cells that name a position between two instructions (labels);
/// - jump fields, cells whose 4-byte payload is itself an absolute offset;
/// - assignment ends, the positions right after `#x =`-style prefixes.
#[derive(Debug, Clone, Default)]
pub struct DynamicIndexRegistry {
    cells: Arena<usize>,
    anchors: Vec<DynamicIndex>,
    jump_fields: Vec<DynamicIndex>,
    assignment_ends: FxHashSet<usize>,
}

impl DynamicIndexRegistry {
    pub fn new() -> Self {
        Self {
            cells: Arena::new(32),
            anchors: Vec::new(),
            jump_fields: Vec::new(),
            assignment_ends: FxHashSet::default(),
        }
    }

    pub fn register(&mut self, offset: usize) -> DynamicIndex {
        self.cells.alloc(offset)
    }

    /// Registers a jump destination that stays in front of code wrapped by [`wrap`](Self::wrap).
    pub fn register_anchor(&mut self, offset: usize) -> DynamicIndex {
        let index = self.register(offset);
        self.anchors.push(index);
        index
    }

    /// Registers the offset of a 4-byte jump target field.
    pub fn register_jump_field(&mut self, offset: usize) -> DynamicIndex {
        let index = self.register(offset);
        self.jump_fields.push(index);
        index
    }

    pub fn get(&self, index: DynamicIndex) -> usize {
        self.cells[index]
    }

    pub fn set(&mut self, index: DynamicIndex, offset: usize) {
        self.cells[index] = offset;
    }

    pub fn add_assignment_end(&mut self, offset: usize) {
        self.assignment_ends.insert(offset);
    }

    pub fn is_assignment_end(&self, offset: usize) -> bool {
        self.assignment_ends.contains(&offset)
    }

    pub fn jump_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.jump_fields.iter().map(|i| self.cells[*i])
    }

    /// Moves every offset `>= from` by `delta`.
    ///
    /// `bytes` must already contain the shifted tail: jump fields are read
    /// at their new position and targets `>= from` rewritten in place, also
    /// for fields in front of the splice.
    pub fn shift(&mut self, from: usize, delta: usize, bytes: &mut [u8]) {
        self.shift_cells(from, delta);
        self.shift_targets(from, delta, bytes);
        self.shift_assignment_ends(from, delta);
    }

    /// Moves offsets for `delta` bytes inserted in front of the code at `at`.
    ///
    /// Unlike [`shift`](Self::shift), anchors and jump targets equal to `at`
    /// keep their value, so jumps to that position land on the inserted bytes.
    pub fn wrap(&mut self, at: usize, delta: usize, bytes: &mut [u8]) {
        let pinned = self
            .anchors
            .iter()
            .copied()
            .filter(|anchor| self.cells[*anchor] == at)
            .collect::<Vec<_>>();
        self.shift_cells(at, delta);
        for anchor in pinned {
            self.cells[anchor] = at;
        }
        self.shift_targets(at + 1, delta, bytes);
        self.shift_assignment_ends(at, delta);
    }

    fn shift_cells(&mut self, from: usize, delta: usize) {
        for cell in self.cells.iter_mut() {
            if *cell >= from {
                *cell += delta;
            }
        }
    }

    fn shift_targets(&self, from: usize, delta: usize, bytes: &mut [u8]) {
        for field in self.jump_fields.iter().map(|i| self.cells[*i]) {
            if field + 4 > bytes.len() {
                continue;
            }
            let mut target = [0u8; 4];
            target.copy_from_slice(&bytes[field..field + 4]);
            let target = u32::from_le_bytes(target) as usize;
            if target >= from {
                let moved = (target + delta) as u32;
                bytes[field..field + 4].copy_from_slice(&moved.to_le_bytes());
            }
        }
    }

    fn shift_assignment_ends(&mut self, from: usize, delta: usize) {
        self.assignment_ends = self
            .assignment_ends
            .iter()
            .map(|i| if *i >= from { i + delta } else { *i })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::before_pivot(3, 5, 2, 3)]
    #[case::at_pivot(5, 5, 2, 7)]
    #[case::after_pivot(6, 5, 2, 8)]
    fn test_shift_cell(#[case] offset: usize, #[case] from: usize, #[case] delta: usize, #[case] expected: usize) {
        let mut registry = DynamicIndexRegistry::new();
        let index = registry.register(offset);
        registry.shift(from, delta, &mut []);
        assert_eq!(registry.get(index), expected);
    }

    #[test]
    fn test_shift_rewrites_jump_targets() {
        let mut registry = DynamicIndexRegistry::new();
        // jmp at 1 pointing to 10, jmp at 6 pointing to 2
        let mut bytes = vec![0u8; 16];
        bytes[2..6].copy_from_slice(&10u32.to_le_bytes());
        bytes[7..11].copy_from_slice(&2u32.to_le_bytes());
        let first = registry.register_jump_field(2);
        let second = registry.register_jump_field(7);

        // one byte inserted at offset 1: tail moves right first
        bytes.copy_within(1..15, 2);
        registry.shift(1, 1, &mut bytes);

        assert_eq!(registry.get(first), 3);
        assert_eq!(registry.get(second), 8);
        assert_eq!(&bytes[3..7], &11u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());
    }

    #[test]
    fn test_shift_rewrites_forward_jump_before_pivot() {
        let mut registry = DynamicIndexRegistry::new();
        let mut bytes = vec![0u8; 16];
        bytes[1..5].copy_from_slice(&10u32.to_le_bytes());
        let field = registry.register_jump_field(1);
        bytes.copy_within(6..14, 8);
        registry.shift(6, 2, &mut bytes);
        assert_eq!(registry.get(field), 1);
        assert_eq!(&bytes[1..5], &12u32.to_le_bytes());
    }

    #[test]
    fn test_shift_keeps_targets_before_pivot() {
        let mut registry = DynamicIndexRegistry::new();
        let mut bytes = vec![0u8; 12];
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
        registry.register_jump_field(6);
        registry.shift(5, 2, &mut bytes);
        assert_eq!(registry.jump_fields().collect::<Vec<_>>(), vec![8]);
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
    }

    #[test]
    fn test_wrap_keeps_anchors_and_targets_at_pivot() {
        let mut registry = DynamicIndexRegistry::new();
        // jmp at 0 pointing to 6, label anchor at 6, plain cell at 6
        let mut bytes = vec![0u8; 12];
        bytes[1..5].copy_from_slice(&6u32.to_le_bytes());
        let field = registry.register_jump_field(1);
        let anchor = registry.register_anchor(6);
        let cell = registry.register(6);
        let after = registry.register(8);

        bytes.copy_within(6..10, 8);
        registry.wrap(6, 2, &mut bytes);

        assert_eq!(registry.get(field), 1);
        assert_eq!(&bytes[1..5], &6u32.to_le_bytes());
        assert_eq!(registry.get(anchor), 6);
        assert_eq!(registry.get(cell), 8);
        assert_eq!(registry.get(after), 10);
    }

    #[test]
    fn test_assignment_ends_shift() {
        let mut registry = DynamicIndexRegistry::new();
        registry.add_assignment_end(4);
        registry.add_assignment_end(9);
        registry.shift(6, 3, &mut []);
        assert!(registry.is_assignment_end(4));
        assert!(registry.is_assignment_end(12));
        assert!(!registry.is_assignment_end(9));
    }
}
