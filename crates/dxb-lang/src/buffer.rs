//! Growable output buffer with a write cursor and the primitive emitters.
use crate::bigint::BigInt;
use crate::binary::{ActionType, BinaryCode, MAX_POINTER_ID_SIZE};
use crate::dynamic_index::{DynamicIndex, DynamicIndexRegistry};
use crate::error::CompileError;
use crate::quantity::Quantity;
use crate::value::Target;
use smol_str::SmolStr;

const CHUNK_SIZE: usize = 64;

/// Name operand of a variable instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarName<'a> {
    /// Predefined variables whose opcode is the name (`#it`, `#std`, ...).
    None,
    Id(u32),
    Name(&'a str),
}

#[derive(Debug, Clone, Default)]
pub struct Buffer {
    bytes: Vec<u8>,
    pos: usize,
    indices: DynamicIndexRegistry,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            pos: 0,
            indices: DynamicIndexRegistry::new(),
        }
    }

    #[inline(always)]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the cursor back (e.g. over trailing commas). Bytes past the
    /// cursor are ignored.
    pub fn set_pos(&mut self, pos: usize) {
        self.ensure_capacity(pos);
        self.pos = pos;
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.bytes.truncate(self.pos);
        self.bytes
    }

    pub fn byte_at(&self, index: usize) -> Option<u8> {
        (index < self.pos).then(|| self.bytes[index])
    }

    /// Byte right before the cursor.
    pub fn last(&self) -> Option<u8> {
        self.pos.checked_sub(1).and_then(|i| self.byte_at(i))
    }

    pub fn set_byte(&mut self, index: usize, byte: u8) {
        self.ensure_capacity(index);
        self.bytes[index] = byte;
    }

    pub fn indices(&self) -> &DynamicIndexRegistry {
        &self.indices
    }

    pub fn indices_mut(&mut self) -> &mut DynamicIndexRegistry {
        &mut self.indices
    }

    /// Grows the backing storage so that offset `size` is writable.
    ///
    /// Growth happens in steps of at least 64 bytes, rounded to multiples
    /// of 8, and never shrinks.
    pub fn ensure_capacity(&mut self, size: usize) {
        let len = self.bytes.len();
        if size + 1 >= len {
            let missing = (size + 2).saturating_sub(len);
            let add = std::cmp::max(CHUNK_SIZE, missing.div_ceil(8) * 8);
            self.bytes.resize(len + add, 0);
        }
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.ensure_capacity(self.pos);
        self.bytes[self.pos] = byte;
        self.pos += 1;
    }

    #[inline(always)]
    pub fn write_code(&mut self, code: BinaryCode) {
        self.write_u8(code.byte());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_capacity(self.pos + bytes.len());
        self.bytes[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub fn put_u32_at(&mut self, offset: usize, value: u32) {
        self.ensure_capacity(offset + 4);
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Registers an offset that follows later insertions.
    pub fn dynamic_index(&mut self, offset: usize) -> DynamicIndex {
        self.indices.register(offset)
    }

    /// Registers a label position.
    pub fn anchor(&mut self, offset: usize) -> DynamicIndex {
        self.indices.register_anchor(offset)
    }

    pub fn resolve(&self, index: DynamicIndex) -> usize {
        self.indices.get(index)
    }

    /// Splices `bytes` in at `offset` and moves every registered offset
    /// `>= from` (and the cursor) by `bytes.len()`.
    pub fn insert_at(&mut self, offset: usize, bytes: &[u8], from: usize) {
        if offset == self.pos {
            self.write_bytes(bytes);
            return;
        }
        self.splice(offset, bytes);
        self.indices.shift(from, bytes.len(), &mut self.bytes);
        if self.pos >= from {
            self.pos += bytes.len();
        }
    }

    /// Splices `bytes` in front of the code at `offset`, e.g. a tuple opener
    /// around an already written value. Labels and jump targets at `offset`
    /// stay there and now point at `bytes`.
    pub fn wrap_at(&mut self, offset: usize, bytes: &[u8]) {
        if offset == self.pos {
            self.write_bytes(bytes);
            return;
        }
        self.splice(offset, bytes);
        self.indices.wrap(offset, bytes.len(), &mut self.bytes);
        self.pos += bytes.len();
    }

    fn splice(&mut self, offset: usize, bytes: &[u8]) {
        let gap = bytes.len();
        self.ensure_capacity(self.pos + gap);
        self.bytes.copy_within(offset..self.pos, offset + gap);
        self.bytes[offset..offset + gap].copy_from_slice(bytes);
        tracing::trace!(offset, gap, "buffer splice");
    }

    /// Opens a gap of `gap` zero bytes at `offset`, shifting offsets
    /// strictly after it. The caller fills the gap.
    pub fn open_gap(&mut self, offset: usize, gap: usize) {
        let filler = vec![0u8; gap];
        self.insert_at(offset, &filler, offset + 1);
    }

    /// Writes a jump opcode with a 4-byte target field and registers the field.
    pub fn write_jump(&mut self, code: BinaryCode, target: Option<u32>) -> DynamicIndex {
        self.write_code(code);
        let field = self.indices.register_jump_field(self.pos);
        self.write_u32(target.unwrap_or(0));
        field
    }

    /// `base + action [specifier] [name]`, either at the cursor or into an
    /// already opened gap at `at`. Returns the offset after the instruction.
    pub fn write_variable(
        &mut self,
        at: Option<usize>,
        base: BinaryCode,
        action: ActionType,
        specifier: Option<BinaryCode>,
        name: VarName<'_>,
    ) -> Result<usize, CompileError> {
        let mut encoded: smallvec::SmallVec<[u8; 16]> = smallvec::smallvec![base.with_action(action)];
        if let Some(specifier) = specifier {
            encoded.push(specifier.byte());
        }
        match name {
            VarName::None => {}
            VarName::Id(id) => {
                let id = u16::try_from(id).map_err(|_| CompileError::InvalidVariableId(id))?;
                encoded.push(0);
                encoded.extend_from_slice(&id.to_le_bytes());
            }
            VarName::Name(name) => {
                let len = u8::try_from(name.len()).map_err(|_| CompileError::NameTooLong(name.into()))?;
                encoded.push(len);
                encoded.extend_from_slice(name.as_bytes());
            }
        }

        let end = match at {
            Some(offset) if offset != self.pos => {
                self.ensure_capacity(offset + encoded.len());
                self.bytes[offset..offset + encoded.len()].copy_from_slice(&encoded);
                offset + encoded.len()
            }
            _ => {
                self.write_bytes(&encoded);
                self.pos
            }
        };

        if action != ActionType::Get {
            self.indices.add_assignment_end(end);
        }
        Ok(end)
    }

    /// Integer with the narrowest of the 8/16/32/64 bit opcodes.
    pub fn write_int(&mut self, value: i64) {
        if let Ok(v) = i8::try_from(value) {
            self.write_code(BinaryCode::Int8);
            self.write_u8(v as u8);
        } else if let Ok(v) = i16::try_from(value) {
            self.write_code(BinaryCode::Int16);
            self.write_bytes(&v.to_le_bytes());
        } else if let Ok(v) = i32::try_from(value) {
            self.write_code(BinaryCode::Int32);
            self.write_bytes(&v.to_le_bytes());
        } else {
            self.write_code(BinaryCode::Int64);
            self.write_i64(value);
        }
    }

    /// Integers beyond 64 bits as `BIG_INT sign len16 magnitude`.
    pub fn write_bigint(&mut self, value: &BigInt) -> Result<(), CompileError> {
        if let Some(small) = value.to_i64() {
            self.write_int(small);
            return Ok(());
        }
        self.write_code(BinaryCode::BigInt);
        self.write_u8(if value.is_negative() { 0 } else { 1 });
        self.write_magnitude(value.magnitude())
    }

    fn write_magnitude(&mut self, magnitude: &[u8]) -> Result<(), CompileError> {
        let magnitude: &[u8] = if magnitude.is_empty() { &[0] } else { magnitude };
        let len = u16::try_from(magnitude.len()).map_err(|_| CompileError::BigIntTooLarge)?;
        self.write_u16(len);
        self.write_bytes(magnitude);
        Ok(())
    }

    /// Decimal, demoted to an 8 or 32 bit integer form when integral.
    pub fn write_float(&mut self, value: f64) {
        let integral = value.is_finite() && value.fract() == 0.0 && !(value == 0.0 && value.is_sign_negative());
        if integral && value >= i8::MIN as f64 && value <= i8::MAX as f64 {
            self.write_code(BinaryCode::FloatAsInt8);
            self.write_u8(value as i8 as u8);
        } else if integral && value >= i32::MIN as f64 && value <= i32::MAX as f64 {
            self.write_code(BinaryCode::FloatAsInt32);
            self.write_bytes(&(value as i32).to_le_bytes());
        } else {
            self.write_code(BinaryCode::Float64);
            self.write_f64(value);
        }
    }

    /// Text with a 1-byte length below 256 bytes, a 4-byte length otherwise.
    pub fn write_text(&mut self, text: &str) {
        let len = text.len();
        if len < 256 {
            self.write_code(BinaryCode::ShortText);
            self.write_u8(len as u8);
        } else {
            self.write_code(BinaryCode::Text);
            self.write_u32(len as u32);
        }
        self.write_bytes(text.as_bytes());
    }

    /// `code len32 utf8`, used for urls and relative paths.
    pub fn write_long_string(&mut self, code: BinaryCode, s: &str) {
        self.write_code(code);
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_buffer(&mut self, data: &[u8]) {
        self.write_code(BinaryCode::Buffer);
        self.write_u32(data.len() as u32);
        self.write_bytes(data);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_code(if value { BinaryCode::True } else { BinaryCode::False });
    }

    /// Milliseconds since the unix epoch.
    pub fn write_time(&mut self, millis: i64) {
        self.write_code(BinaryCode::Time);
        self.write_i64(millis);
    }

    pub fn write_quantity(&mut self, quantity: &Quantity) -> Result<(), CompileError> {
        self.write_code(BinaryCode::Quantity);
        self.write_u8(if quantity.is_negative() { 0 } else { 1 });
        let numerator = quantity.numerator_bytes();
        let denominator = quantity.denominator_bytes();
        let num_len = u16::try_from(numerator.len()).map_err(|_| CompileError::BigIntTooLarge)?;
        let den_len = u16::try_from(denominator.len()).map_err(|_| CompileError::BigIntTooLarge)?;
        self.write_u16(num_len);
        self.write_u16(den_len);
        self.write_bytes(&numerator);
        self.write_bytes(&denominator);
        self.write_u8(quantity.unit().len() as u8);
        for (code, exponent) in quantity.unit() {
            self.write_u8(*code);
            self.write_u8(*exponent as u8);
        }
        Ok(())
    }

    /// Key of the next element: text keys up to 255 bytes, or a u32 index.
    pub fn write_key(&mut self, key: &str) -> Result<(), CompileError> {
        let len = u8::try_from(key.len()).map_err(|_| CompileError::NameTooLong(key.into()))?;
        self.write_code(BinaryCode::ElementWithKey);
        self.write_u8(len);
        self.write_bytes(key.as_bytes());
        Ok(())
    }

    pub fn write_int_key(&mut self, key: u32) {
        self.write_code(BinaryCode::ElementWithIntKey);
        self.write_u32(key);
    }

    pub fn write_object_slot(&mut self, slot: u16) {
        self.write_code(BinaryCode::InternalObjectSlot);
        self.write_u16(slot);
    }

    /// `type name_len subspaces instance_len name [instance]`.
    ///
    /// A missing instance is written as length 255, a `*` instance as
    /// length 0 on the wildcard opcode.
    pub fn write_target(&mut self, target: &Target) -> Result<(), CompileError> {
        let wildcard = target.is_wildcard();
        let code = target.kind.code().byte() + u8::from(wildcard);
        let name_len = u8::try_from(target.name.len())
            .map_err(|_| CompileError::NameTooLong(SmolStr::from(String::from_utf8_lossy(&target.name).as_ref())))?;
        let instance = target.instance.as_deref().filter(|i| !i.is_empty());
        let instance_len = match instance {
            None => 255,
            Some("*") => 0,
            Some(i) => u8::try_from(i.len()).map_err(|_| CompileError::NameTooLong(i.into()))?,
        };

        self.write_u8(code);
        self.write_u8(name_len);
        self.write_u8(0);
        self.write_u8(instance_len);
        self.write_bytes(&target.name);
        if let Some(instance) = instance.filter(|i| *i != "*") {
            self.write_bytes(instance.as_bytes());
        }
        Ok(())
    }

    /// Type reference. Plain `std` types use their single-byte opcode;
    /// parameters, if any, must be written by the caller right after.
    pub fn write_type(
        &mut self,
        namespace: &str,
        name: &str,
        variation: Option<&str>,
        has_parameters: bool,
    ) -> Result<(), CompileError> {
        let extended = variation.is_some() || has_parameters;
        if (namespace.is_empty() || namespace == "std") && !extended {
            if let Some(code) = std_type_code(name) {
                self.write_code(code);
                return Ok(());
            }
        }

        let too_long = |s: &str| CompileError::NameTooLong(s.into());
        let ns_len = u8::try_from(namespace.len()).map_err(|_| too_long(namespace))?;
        let name_len = u8::try_from(name.len()).map_err(|_| too_long(name))?;

        self.write_code(if extended { BinaryCode::ExtendedType } else { BinaryCode::Type });
        self.write_u8(ns_len);
        self.write_u8(name_len);
        if extended {
            let variation_len = match variation {
                Some(v) => u8::try_from(v.len()).map_err(|_| too_long(v))?,
                None => 0,
            };
            self.write_u8(variation_len);
            self.write_u8(u8::from(has_parameters));
        }
        self.write_bytes(namespace.as_bytes());
        self.write_bytes(name.as_bytes());
        if let Some(variation) = variation {
            self.write_bytes(variation.as_bytes());
        }
        Ok(())
    }

    /// Pointer id padded to 26 bytes, followed by the flag byte.
    pub fn write_pointer_id(&mut self, id: &[u8]) -> Result<(), CompileError> {
        if id.len() > MAX_POINTER_ID_SIZE {
            return Err(CompileError::PointerIdTooLarge);
        }
        let mut padded = [0u8; MAX_POINTER_ID_SIZE];
        padded[..id.len()].copy_from_slice(id);
        self.write_bytes(&padded);
        self.write_u8(0);
        Ok(())
    }
}

/// Single-byte opcode of a `std` type, if it has one.
pub fn std_type_code(name: &str) -> Option<BinaryCode> {
    let code = match name {
        "text" => BinaryCode::StdTypeText,
        "integer" => BinaryCode::StdTypeInt,
        "decimal" => BinaryCode::StdTypeFloat,
        "boolean" => BinaryCode::StdTypeBoolean,
        "null" => BinaryCode::StdTypeNull,
        "void" => BinaryCode::StdTypeVoid,
        "buffer" => BinaryCode::StdTypeBuffer,
        "datex" => BinaryCode::StdTypeCodeBlock,
        "unit" => BinaryCode::StdTypeUnit,
        "time" => BinaryCode::StdTypeTime,
        "url" => BinaryCode::StdTypeUrl,
        "Array" => BinaryCode::StdTypeArray,
        "Object" => BinaryCode::StdTypeObject,
        "Set" => BinaryCode::StdTypeSet,
        "Map" => BinaryCode::StdTypeMap,
        "Tuple" => BinaryCode::StdTypeTuple,
        "Function" => BinaryCode::StdTypeFunction,
        "Stream" => BinaryCode::StdTypeStream,
        "Any" => BinaryCode::StdTypeAny,
        "Task" => BinaryCode::StdTypeTask,
        "Assertion" => BinaryCode::StdTypeAssertion,
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn emitted(f: impl FnOnce(&mut Buffer)) -> Vec<u8> {
        let mut buffer = Buffer::new();
        f(&mut buffer);
        buffer.into_vec()
    }

    #[rstest]
    #[case::int8(5, vec![0xc1, 0x05])]
    #[case::negative_int8(-128, vec![0xc1, 0x80])]
    #[case::int16(300, vec![0xc2, 0x2c, 0x01])]
    #[case::int32(70_000, vec![0xc3, 0x70, 0x11, 0x01, 0x00])]
    #[case::int64(1 << 40, vec![0xc4, 0, 0, 0, 0, 0, 0x01, 0, 0])]
    fn test_write_int(#[case] value: i64, #[case] expected: Vec<u8>) {
        assert_eq!(emitted(|b| b.write_int(value)), expected);
    }

    #[rstest]
    #[case::as_int8(3.0, vec![0xde, 0x03])]
    #[case::as_int32(1000.0, vec![0xcd, 0xe8, 0x03, 0x00, 0x00])]
    #[case::fraction(0.5, [vec![0xc5], 0.5f64.to_le_bytes().to_vec()].concat())]
    #[case::negative_zero(-0.0, [vec![0xc5], (-0.0f64).to_le_bytes().to_vec()].concat())]
    #[case::infinity(f64::INFINITY, [vec![0xc5], f64::INFINITY.to_le_bytes().to_vec()].concat())]
    fn test_write_float(#[case] value: f64, #[case] expected: Vec<u8>) {
        assert_eq!(emitted(|b| b.write_float(value)), expected);
    }

    #[rstest]
    #[case::short("hi", vec![0xce, 0x02, b'h', b'i'])]
    #[case::empty("", vec![0xce, 0x00])]
    fn test_write_text(#[case] text: &str, #[case] expected: Vec<u8>) {
        assert_eq!(emitted(|b| b.write_text(text)), expected);
    }

    #[test]
    fn test_write_long_text_uses_u32_length() {
        let text = "x".repeat(300);
        let out = emitted(|b| b.write_text(&text));
        assert_eq!(&out[..5], &[0xc0, 0x2c, 0x01, 0x00, 0x00]);
        assert_eq!(out.len(), 305);
    }

    #[test]
    fn test_write_bigint() {
        let big = BigInt::from_str_radix("-18446744073709551616", 10).unwrap();
        let out = emitted(|b| b.write_bigint(&big).unwrap());
        assert_eq!(out, vec![0xd7, 0x00, 0x09, 0x00, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[rstest]
    #[case::get_by_id(ActionType::Get, None, VarName::Id(0x0100), vec![0xa4, 0x00, 0x00, 0x01])]
    #[case::set_by_name(ActionType::Set, None, VarName::Name("x"), vec![0xaa, 0x01, b'x'])]
    #[case::compound(ActionType::Other, Some(BinaryCode::Add), VarName::Id(1), vec![0xa7, 0x92, 0x00, 0x01, 0x00])]
    #[case::predefined(ActionType::Get, None, VarName::None, vec![0x49])]
    fn test_write_variable(
        #[case] action: ActionType,
        #[case] specifier: Option<BinaryCode>,
        #[case] name: VarName<'static>,
        #[case] expected: Vec<u8>,
    ) {
        let base = match name {
            VarName::Name(_) => BinaryCode::Label,
            VarName::None => BinaryCode::VarStd,
            VarName::Id(_) => BinaryCode::InternalVar,
        };
        let mut buffer = Buffer::new();
        let end = buffer.write_variable(None, base, action, specifier, name).unwrap();
        assert_eq!(end, expected.len());
        assert_eq!(buffer.indices().is_assignment_end(end), action != ActionType::Get);
        assert_eq!(buffer.into_vec(), expected);
    }

    #[test]
    fn test_write_variable_id_too_big() {
        let mut buffer = Buffer::new();
        assert_eq!(
            buffer.write_variable(None, BinaryCode::InternalVar, ActionType::Get, None, VarName::Id(70_000)),
            Err(CompileError::InvalidVariableId(70_000))
        );
    }

    #[rstest]
    #[case::no_instance(Target::person("ab"), vec![0xcf, 2, 0, 255, b'a', b'b'])]
    #[case::instance(Target::institution("a").with_instance("x"), vec![0xd1, 1, 0, 1, b'a', b'x'])]
    #[case::wildcard(Target::endpoint(vec![0xff]).with_instance("*"), vec![0xd6, 1, 0, 0, 0xff])]
    fn test_write_target(#[case] target: Target, #[case] expected: Vec<u8>) {
        assert_eq!(emitted(|b| b.write_target(&target).unwrap()), expected);
    }

    #[rstest]
    #[case::std_short("std", "text", None, false, vec![0x10])]
    #[case::empty_ns("", "Any", None, false, vec![0x22])]
    #[case::custom("my", "T", None, false, vec![0xd9, 2, 1, b'm', b'y', b'T'])]
    #[case::variation("std", "integer", Some("8"), false, vec![0xda, 3, 7, 1, 0, b's', b't', b'd', b'i', b'n', b't', b'e', b'g', b'e', b'r', b'8'])]
    #[case::params("std", "Function", None, true, vec![0xda, 3, 8, 0, 1, b's', b't', b'd', b'F', b'u', b'n', b'c', b't', b'i', b'o', b'n'])]
    fn test_write_type(
        #[case] namespace: &str,
        #[case] name: &str,
        #[case] variation: Option<&str>,
        #[case] params: bool,
        #[case] expected: Vec<u8>,
    ) {
        assert_eq!(emitted(|b| b.write_type(namespace, name, variation, params).unwrap()), expected);
    }

    #[test]
    fn test_write_pointer_id() {
        let out = emitted(|b| b.write_pointer_id(&[0xab, 0xcd]).unwrap());
        assert_eq!(out.len(), MAX_POINTER_ID_SIZE + 1);
        assert_eq!(&out[..3], &[0xab, 0xcd, 0x00]);

        let mut buffer = Buffer::new();
        assert_eq!(buffer.write_pointer_id(&[0; 27]), Err(CompileError::PointerIdTooLarge));
    }

    #[test]
    fn test_insert_at_shifts_jumps_and_cursor() {
        let mut buffer = Buffer::new();
        buffer.write_code(BinaryCode::CloseAndStore);
        let start = buffer.dynamic_index(buffer.pos());
        buffer.write_int(1);
        let field = buffer.write_jump(BinaryCode::Jmp, Some(1));
        buffer.insert_at(1, &[BinaryCode::SubscopeStart.byte()], 1);

        assert_eq!(buffer.pos(), 9);
        assert_eq!(buffer.resolve(start), 2);
        assert_eq!(buffer.resolve(field), 5);
        assert_eq!(buffer.u32_at(5), 2);
        assert_eq!(buffer.as_slice(), &[0x01, 0x02, 0xc1, 0x01, 0x56, 0x02, 0, 0, 0]);
    }

    #[test]
    fn test_open_gap_keeps_offset_at_gap() {
        let mut buffer = Buffer::new();
        buffer.write_int(1);
        let start = buffer.dynamic_index(0);
        let after = buffer.dynamic_index(1);
        buffer.open_gap(0, 3);
        assert_eq!(buffer.resolve(start), 0);
        assert_eq!(buffer.resolve(after), 4);
        assert_eq!(buffer.pos(), 5);
    }

    proptest! {
        #[test]
        fn test_write_int_uses_narrowest_width(value in any::<i64>()) {
            let out = emitted(|b| b.write_int(value));
            let expected_len = if i8::try_from(value).is_ok() {
                2
            } else if i16::try_from(value).is_ok() {
                3
            } else if i32::try_from(value).is_ok() {
                5
            } else {
                9
            };
            prop_assert_eq!(out.len(), expected_len);
        }

        #[test]
        fn test_write_float_demotes_integral_values(value in any::<i32>()) {
            let out = emitted(|b| b.write_float(value as f64));
            let expected = if i8::try_from(value).is_ok() { 0xde } else { 0xcd };
            prop_assert_eq!(out[0], expected);
        }

        #[test]
        fn test_ensure_capacity_never_shrinks(sizes in proptest::collection::vec(0usize..5000, 1..20)) {
            let mut buffer = Buffer::new();
            let mut last = 0;
            for size in sizes {
                buffer.ensure_capacity(size);
                prop_assert!(buffer.bytes.len() > size + 1);
                prop_assert!(buffer.bytes.len() >= last);
                last = buffer.bytes.len();
            }
        }
    }
}
