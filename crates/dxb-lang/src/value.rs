//! Values that can be compiled directly, without going through script text.
//!
//! Composite values live in a [`ValueGraph`] and refer to their children by
//! [`ValueId`]. Two references to the same id are the same value, which is
//! what the encoder uses to deduplicate aliased values and to detect cycles.
use std::fmt;

use chrono::{DateTime, Utc};
use smol_str::SmolStr;
use url::Url;

use crate::arena::{Arena, ArenaId};
use crate::bigint::BigInt;
use crate::binary::BinaryCode;
use crate::quantity::Quantity;

pub type ValueId = ArenaId<Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Null,
    Bool(bool),
    /// Integer value, encoded with the narrowest integer opcode.
    Int(i64),
    BigInt(BigInt),
    /// Decimal value, demoted to an integer encoding when lossless.
    Float(f64),
    Text(SmolStr),
    Quantity(Quantity),
    Url(Url),
    Time(DateTime<Utc>),
    Buffer(Vec<u8>),
    Target(Target),
    Type(TypeRef),
    Pointer(PointerRef),
    /// `$pointer->key`
    PointerProperty { pointer: PointerRef, key: ValueId },
    /// A precompiled scope together with the values it captures.
    Scope(ScopeBlock),
    Error { code: SmolStr, message: SmolStr },
    /// Chunks sent as separate blocks after a `<<` stream operator.
    Stream(Vec<Vec<u8>>),
    /// Refers to an internal slot of the receiver (`#env`, `#location`, ...).
    BoundSlot(SmolStr),
    /// A value serialized under an explicit type: `<ns:name> value`.
    Typed { ty: TypeRef, value: ValueId },
    Array(Vec<ValueId>),
    Tuple(Vec<(TupleKey, ValueId)>),
    Object(Vec<(SmolStr, ValueId)>),
    Disjunction(Vec<ValueId>),
    Conjunction(Vec<ValueId>),
    Negation(ValueId),
    /// Host symbol without a wire form; encoded as `void`.
    Symbol(SmolStr),
    /// Host value the encoder does not know how to serialize.
    Native(SmolStr),
}

impl Value {
    /// Short name of the value kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::BigInt(_) => "integer",
            Value::Float(_) => "decimal",
            Value::Text(_) => "text",
            Value::Quantity(_) => "quantity",
            Value::Url(_) => "url",
            Value::Time(_) => "time",
            Value::Buffer(_) => "buffer",
            Value::Target(_) => "endpoint",
            Value::Type(_) => "type",
            Value::Pointer(_) => "pointer",
            Value::PointerProperty { .. } => "pointer property",
            Value::Scope(_) => "scope",
            Value::Error { .. } => "error",
            Value::Stream(_) => "stream",
            Value::BoundSlot(_) => "bound slot",
            Value::Typed { .. } => "typed value",
            Value::Array(_) => "Array",
            Value::Tuple(_) => "Tuple",
            Value::Object(_) => "Object",
            Value::Disjunction(_) => "disjunction",
            Value::Conjunction(_) => "conjunction",
            Value::Negation(_) => "negation",
            Value::Symbol(_) => "symbol",
            Value::Native(_) => "native",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TupleKey {
    Index(i64),
    Name(SmolStr),
}

/// Key of a deferred property assignment that closes a reference cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Index(i64),
    Name(SmolStr),
}

impl From<TupleKey> for PropertyKey {
    fn from(key: TupleKey) -> Self {
        match key {
            TupleKey::Index(i) => PropertyKey::Index(i),
            TupleKey::Name(n) => PropertyKey::Name(n),
        }
    }
}

/// What the encoder treats as "the same value" when deduplicating.
///
/// Text and numbers compare by content, everything else by node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Node(ValueId),
    Text(SmolStr),
    Int(i64),
    BigInt(BigInt),
    Float(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Person,
    Institution,
    Endpoint,
}

impl TargetKind {
    pub fn code(self) -> BinaryCode {
        match self {
            TargetKind::Person => BinaryCode::PersonAlias,
            TargetKind::Institution => BinaryCode::InstitutionAlias,
            TargetKind::Endpoint => BinaryCode::Endpoint,
        }
    }
}

/// An addressable endpoint: `@alias`, `@+institution` or `@@id`, each with
/// an optional `/instance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub kind: TargetKind,
    pub name: Vec<u8>,
    pub instance: Option<SmolStr>,
}

impl Target {
    pub fn person(name: &str) -> Self {
        Self {
            kind: TargetKind::Person,
            name: name.as_bytes().to_vec(),
            instance: None,
        }
    }

    pub fn institution(name: &str) -> Self {
        Self {
            kind: TargetKind::Institution,
            name: name.as_bytes().to_vec(),
            instance: None,
        }
    }

    pub fn endpoint(id: Vec<u8>) -> Self {
        Self {
            kind: TargetKind::Endpoint,
            name: id,
            instance: None,
        }
    }

    /// The `@*` broadcast endpoint.
    pub fn broadcast() -> Self {
        Self::endpoint(vec![0xff; 16])
    }

    pub fn with_instance(mut self, instance: impl Into<SmolStr>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.instance.as_deref() == Some("*")
    }

    /// Parses `@name`, `@+name`, `@@hexid` or `@*`, with an optional `/instance`.
    pub fn parse(s: &str) -> Option<Self> {
        let (main, instance) = match s.split_once('/') {
            Some((main, instance)) if !instance.is_empty() => (main, Some(instance)),
            Some(_) => return None,
            None => (s, None),
        };

        let target = if main == "@*" {
            Self::broadcast()
        } else if let Some(id) = main.strip_prefix("@@") {
            Self::endpoint(decode_hex(id)?)
        } else if let Some(name) = main.strip_prefix("@+") {
            valid_alias(name).then(|| Self::institution(name))?
        } else if let Some(name) = main.strip_prefix('@') {
            valid_alias(name).then(|| Self::person(name))?
        } else {
            return None;
        };

        Some(match instance {
            Some(instance) => target.with_instance(instance),
            None => target,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Person => write!(f, "@{}", String::from_utf8_lossy(&self.name))?,
            TargetKind::Institution => write!(f, "@+{}", String::from_utf8_lossy(&self.name))?,
            TargetKind::Endpoint => {
                write!(f, "@@")?;
                for b in &self.name {
                    write!(f, "{:02X}", b)?;
                }
            }
        }
        if let Some(instance) = &self.instance {
            write!(f, "/{}", instance)?;
        }
        Ok(())
    }
}

fn valid_alias(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || ('\u{c0}'..='\u{17e}').contains(&c))
}

/// Decodes hex digits (underscores and dashes ignored), padding an odd
/// trailing digit with zero.
pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let digits = s
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.is_empty() {
        return None;
    }
    Some(
        digits
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
            .collect(),
    )
}

/// `<namespace:name/variation>` with optional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeRef {
    pub namespace: SmolStr,
    pub name: SmolStr,
    pub variation: Option<SmolStr>,
    pub parameters: Option<Vec<ValueId>>,
}

impl TypeRef {
    pub fn std(name: &str) -> Self {
        Self {
            namespace: "std".into(),
            name: name.into(),
            variation: None,
            parameters: None,
        }
    }
}

/// Reference to a shared pointer, optionally with its current value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointerRef {
    pub id: Vec<u8>,
    /// Current value, used when the pointer is collapsed.
    pub value: Option<ValueId>,
    /// Anonymous pointers are always sent by value.
    pub anonymous: bool,
    /// Whether this runtime owns the pointer.
    pub origin: bool,
    /// Transform that derives the pointer value on the receiver.
    pub transform: Option<ScopeBlock>,
}

impl PointerRef {
    pub fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Compiled scope body and the values injected into it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopeBlock {
    pub internal_vars: Vec<ValueId>,
    pub compiled: Vec<u8>,
}

/// Owns every value node of one compile call.
#[derive(Debug, Clone, Default)]
pub struct ValueGraph {
    nodes: Arena<Value>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self { nodes: Arena::new(16) }
    }

    pub fn add(&mut self, value: Value) -> ValueId {
        self.nodes.alloc(value)
    }

    pub fn get(&self, id: ValueId) -> Option<&Value> {
        self.nodes.get(id)
    }

    /// Replaces the node behind `id`, keeping every reference to it.
    ///
    /// This is how cyclic structures are built: allocate the container
    /// first, then fill in children that point back at it.
    pub fn set(&mut self, id: ValueId, value: Value) {
        if let Some(slot) = self.nodes.get_mut(id) {
            *slot = value;
        }
    }

    pub fn text(&mut self, s: impl Into<SmolStr>) -> ValueId {
        self.add(Value::Text(s.into()))
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = ValueId>) -> ValueId {
        let items = items.into_iter().collect();
        self.add(Value::Array(items))
    }

    pub fn object<K: Into<SmolStr>>(&mut self, entries: impl IntoIterator<Item = (K, ValueId)>) -> ValueId {
        let entries = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.add(Value::Object(entries))
    }

    /// Appends `item` to the array or tuple `container`.
    pub fn push(&mut self, container: ValueId, item: ValueId) {
        match self.nodes.get_mut(container) {
            Some(Value::Array(items)) => items.push(item),
            Some(Value::Tuple(entries)) => {
                let index = entries.len() as i64;
                entries.push((TupleKey::Index(index), item));
            }
            _ => {}
        }
    }

    /// Sets `key` on the object `container`, replacing an existing entry.
    pub fn insert(&mut self, container: ValueId, key: impl Into<SmolStr>, item: ValueId) {
        let key = key.into();
        if let Some(Value::Object(entries)) = self.nodes.get_mut(container) {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = item,
                None => entries.push((key, item)),
            }
        }
    }

    /// Dedup identity of a node, or `None` for values too small to be worth a
    /// back-reference (void, null, booleans and numbers within 32 bits).
    pub fn identity(&self, id: ValueId, numbers_and_text: bool) -> Option<Identity> {
        let in_i32 = |f: f64| f <= i32::MAX as f64 && f >= i32::MIN as f64;
        match self.get(id)? {
            Value::Void | Value::Null | Value::Bool(_) => None,
            Value::Int(i) if i32::try_from(*i).is_ok() => None,
            Value::Float(f) if in_i32(*f) => None,
            Value::Int(i) => numbers_and_text.then_some(Identity::Int(*i)),
            Value::BigInt(b) => numbers_and_text.then(|| Identity::BigInt(b.clone())),
            Value::Float(f) => numbers_and_text.then_some(Identity::Float(f.to_bits())),
            Value::Text(s) => numbers_and_text.then(|| Identity::Text(s.clone())),
            _ => Some(Identity::Node(id)),
        }
    }

    /// Builds nodes for a JSON document. Integral numbers become [`Value::Int`].
    pub fn from_json(&mut self, json: &serde_json::Value) -> ValueId {
        match json {
            serde_json::Value::Null => self.add(Value::Null),
            serde_json::Value::Bool(b) => self.add(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                let value = match (n.as_i64(), n.as_u64(), n.as_f64()) {
                    (Some(i), _, _) => Value::Int(i),
                    (None, Some(u), _) => Value::BigInt(BigInt::from_i128(u as i128)),
                    (_, _, Some(f)) => Value::Float(f),
                    _ => Value::Null,
                };
                self.add(value)
            }
            serde_json::Value::String(s) => self.add(Value::Text(s.as_str().into())),
            serde_json::Value::Array(items) => {
                let items: Vec<ValueId> = items.iter().map(|item| self.from_json(item)).collect();
                self.add(Value::Array(items))
            }
            serde_json::Value::Object(map) => {
                let entries: Vec<(SmolStr, ValueId)> = map
                    .iter()
                    .map(|(k, v)| (SmolStr::new(k), self.from_json(v)))
                    .collect();
                self.add(Value::Object(entries))
            }
        }
    }
}

impl std::ops::Index<ValueId> for ValueGraph {
    type Output = Value;

    fn index(&self, index: ValueId) -> &Self::Output {
        &self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::person("@alice", Some(Target::person("alice")))]
    #[case::institution("@+unyt", Some(Target::institution("unyt")))]
    #[case::instance("@alice/phone", Some(Target::person("alice").with_instance("phone")))]
    #[case::wildcard("@alice/*", Some(Target::person("alice").with_instance("*")))]
    #[case::id("@@00ff12", Some(Target::endpoint(vec![0x00, 0xff, 0x12])))]
    #[case::broadcast("@*", Some(Target::broadcast()))]
    #[case::missing_at("alice", None)]
    #[case::empty_instance("@alice/", None)]
    #[case::bad_hex("@@zz", None)]
    fn test_target_parse(#[case] input: &str, #[case] expected: Option<Target>) {
        assert_eq!(Target::parse(input), expected);
    }

    #[rstest]
    #[case("@alice/phone")]
    #[case("@+unyt")]
    #[case("@@00FF12")]
    fn test_target_display(#[case] input: &str) {
        assert_eq!(Target::parse(input).unwrap().to_string(), input);
    }

    #[rstest]
    #[case::small_int(Value::Int(5), true, None)]
    #[case::large_int(Value::Int(1 << 40), true, Some(Identity::Int(1 << 40)))]
    #[case::large_int_disabled(Value::Int(1 << 40), false, None)]
    #[case::small_float(Value::Float(1.5), true, None)]
    #[case::text(Value::Text("x".into()), true, Some(Identity::Text("x".into())))]
    #[case::null(Value::Null, true, None)]
    #[case::boolean(Value::Bool(true), true, None)]
    fn test_identity(#[case] value: Value, #[case] numbers_and_text: bool, #[case] expected: Option<Identity>) {
        let mut graph = ValueGraph::new();
        let id = graph.add(value);
        assert_eq!(graph.identity(id, numbers_and_text), expected);
    }

    #[test]
    fn test_identity_of_composites_is_the_node() {
        let mut graph = ValueGraph::new();
        let a = graph.array([]);
        let b = graph.array([]);
        assert_eq!(graph.identity(a, false), Some(Identity::Node(a)));
        assert_ne!(graph.identity(a, true), graph.identity(b, true));
    }

    #[test]
    fn test_cyclic_object() {
        let mut graph = ValueGraph::new();
        let obj = graph.object::<&str>([]);
        graph.insert(obj, "self", obj);
        assert_eq!(graph[obj], Value::Object(vec![("self".into(), obj)]));
    }

    #[test]
    fn test_from_json() {
        let mut graph = ValueGraph::new();
        let json: serde_json::Value = serde_json::from_str(r#"{"a": [1, 2.5, "x", null, true]}"#).unwrap();
        let root = graph.from_json(&json);
        let Value::Object(entries) = &graph[root] else {
            panic!("expected object");
        };
        let Value::Array(items) = &graph[entries[0].1] else {
            panic!("expected array");
        };
        let kinds: Vec<&str> = items.iter().map(|id| graph[*id].kind()).collect();
        assert_eq!(kinds, vec!["integer", "decimal", "text", "null", "boolean"]);
    }

    #[test]
    fn test_decode_hex_pads_odd_digit() {
        assert_eq!(decode_hex("abc"), Some(vec![0xab, 0xc0]));
        assert_eq!(decode_hex("a_b-c_d"), Some(vec![0xab, 0xcd]));
    }
}
