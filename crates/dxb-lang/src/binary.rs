//! Opcodes and protocol constants of the binary form.
use std::fmt;
use std::str::FromStr;

/// Maximum number of bytes in a pointer id.
pub const MAX_POINTER_ID_SIZE: usize = 26;
/// Size of the initialization vector prepended to encrypted bodies.
pub const IV_SIZE: usize = 16;
/// Size of the signature appended to signed blocks.
pub const SIGNATURE_SIZE: usize = 96;
/// Size of the encrypted symmetric key a receiver entry may carry.
pub const RECEIVER_KEY_SIZE: usize = 512;

pub const SLOT_WRITE: u16 = 0xfef0;
pub const SLOT_READ: u16 = 0xfef1;
pub const SLOT_EXEC: u16 = 0xfef2;
pub const SLOT_GET: u16 = 0xfef3;
pub const SLOT_SET: u16 = 0xfef4;
/// First id handed out for custom object slots (`#name:` keys).
pub const CUSTOM_SLOT_START: u16 = 0xfa00;

/// Single-byte instruction tags of a compiled body.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryCode {
    Exit = 0x00,
    CloseAndStore = 0x01,
    SubscopeStart = 0x02,
    SubscopeEnd = 0x03,
    CachePoint = 0x04,
    CacheReset = 0x05,

    StdTypeText = 0x10,
    StdTypeInt = 0x11,
    StdTypeFloat = 0x12,
    StdTypeBoolean = 0x13,
    StdTypeNull = 0x14,
    StdTypeVoid = 0x15,
    StdTypeBuffer = 0x16,
    StdTypeCodeBlock = 0x17,
    StdTypeUnit = 0x18,
    StdTypeTime = 0x19,
    StdTypeUrl = 0x1a,
    StdTypeArray = 0x1b,
    StdTypeObject = 0x1c,
    StdTypeSet = 0x1d,
    StdTypeMap = 0x1e,
    StdTypeTuple = 0x1f,
    StdTypeFunction = 0x20,
    StdTypeStream = 0x21,
    StdTypeAny = 0x22,
    StdTypeAssertion = 0x23,
    StdTypeTask = 0x24,
    StdTypeIterator = 0x25,

    VarResult = 0x30,
    SetVarResult = 0x31,
    SetVarResultReference = 0x32,
    VarResultAction = 0x33,
    VarSubResult = 0x34,
    SetVarSubResult = 0x35,
    SetVarSubResultReference = 0x36,
    VarSubResultAction = 0x37,
    VarVoid = 0x38,
    SetVarVoid = 0x39,
    SetVarVoidReference = 0x3a,
    VarVoidAction = 0x3b,
    VarOriginInternal = 0x3c,
    SetVarOriginInternal = 0x3d,
    SetVarOriginInternalReference = 0x3e,
    VarOriginInternalAction = 0x3f,
    VarIt = 0x40,
    SetVarIt = 0x41,
    SetVarItReference = 0x42,
    VarItAction = 0x43,
    VarRemote = 0x44,
    VarRemoteAction = 0x45,
    VarOrigin = 0x46,
    VarEndpoint = 0x47,
    VarEntrypoint = 0x48,
    VarStd = 0x49,
    VarMeta = 0x4b,
    VarPublic = 0x4c,
    VarThis = 0x4d,
    VarLocation = 0x4e,
    VarEnv = 0x4f,

    Return = 0x50,
    Template = 0x51,
    Extends = 0x52,
    Implements = 0x53,
    Matches = 0x54,
    Debugger = 0x55,
    Jmp = 0x56,
    Jtr = 0x57,
    Jfa = 0x58,
    Count = 0x59,
    About = 0x5a,
    New = 0x5b,
    DeletePointer = 0x5c,
    Copy = 0x5f,
    Clone = 0x60,
    Origin = 0x61,
    Subscribers = 0x62,
    PlainScope = 0x63,
    Transform = 0x65,
    Observe = 0x66,
    Run = 0x67,
    Await = 0x68,
    Defer = 0x69,
    Function = 0x6a,
    Assert = 0x6b,
    Iterator = 0x6c,
    Next = 0x6d,
    Freeze = 0x6e,
    Seal = 0x6f,
    Has = 0x70,
    Keys = 0x71,
    GetType = 0x72,
    Get = 0x73,
    Range = 0x74,
    ResolveRelativePath = 0x75,
    Do = 0x76,
    Default = 0x77,
    Collapse = 0x78,
    Response = 0x79,

    EqualValue = 0x80,
    NotEqualValue = 0x81,
    Equal = 0x82,
    NotEqual = 0x83,
    Greater = 0x84,
    Less = 0x85,
    GreaterEqual = 0x86,
    LessEqual = 0x87,
    CloneCollapse = 0x88,

    And = 0x90,
    Or = 0x91,
    Add = 0x92,
    Subtract = 0x93,
    Multiply = 0x94,
    Divide = 0x95,
    Not = 0x96,
    Modulo = 0x97,
    Power = 0x98,
    Increment = 0x99,
    Decrement = 0x9a,

    InternalVar = 0xa4,
    SetInternalVar = 0xa5,
    InitInternalVar = 0xa6,
    InternalVarAction = 0xa7,
    SetInternalVarReference = 0xa8,
    Label = 0xa9,
    SetLabel = 0xaa,
    InitLabel = 0xab,
    LabelAction = 0xac,
    Pointer = 0xad,
    SetPointer = 0xae,
    InitPointer = 0xaf,
    PointerAction = 0xb0,
    CreatePointer = 0xb1,
    ChildGet = 0xb2,
    ChildSet = 0xb3,
    ChildSetReference = 0xb4,
    ChildAction = 0xb5,
    ChildGetRef = 0xb6,
    Wildcard = 0xb7,

    Text = 0xc0,
    Int8 = 0xc1,
    Int16 = 0xc2,
    Int32 = 0xc3,
    Int64 = 0xc4,
    Float64 = 0xc5,
    True = 0xc6,
    False = 0xc7,
    Null = 0xc8,
    Void = 0xc9,
    Buffer = 0xca,
    ScopeBlock = 0xcb,
    Quantity = 0xcc,
    FloatAsInt32 = 0xcd,
    ShortText = 0xce,
    PersonAlias = 0xcf,
    PersonAliasWildcard = 0xd0,
    InstitutionAlias = 0xd1,
    InstitutionAliasWildcard = 0xd2,
    Bot = 0xd3,
    BotWildcard = 0xd4,
    Endpoint = 0xd5,
    EndpointWildcard = 0xd6,
    BigInt = 0xd7,
    Url = 0xd8,
    Type = 0xd9,
    ExtendedType = 0xda,
    Conjunction = 0xdb,
    Disjunction = 0xdc,
    Time = 0xdd,
    FloatAsInt8 = 0xde,

    ArrayStart = 0xe0,
    ArrayEnd = 0xe1,
    ObjectStart = 0xe2,
    ObjectEnd = 0xe3,
    TupleStart = 0xe4,
    TupleEnd = 0xe5,
    ElementWithKey = 0xe6,
    ElementWithIntKey = 0xe7,
    ElementWithDynamicKey = 0xe8,
    KeyPermission = 0xe9,
    Element = 0xea,
    InternalObjectSlot = 0xef,

    Sync = 0xf0,
    StopSync = 0xf1,
    Stream = 0xf2,
    StopStream = 0xf3,
    Extend = 0xf4,
    Yeet = 0xf5,
    Remote = 0xf6,
    SyncSilent = 0xf7,
}

impl BinaryCode {
    #[inline(always)]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Byte of this opcode shifted by an assign action (`GET` keeps the base opcode).
    #[inline(always)]
    pub const fn with_action(self, action: ActionType) -> u8 {
        self as u8 + action as u8
    }

    /// The opcode closing a structure opened by `self`, if any.
    pub fn closing(self) -> Option<BinaryCode> {
        match self {
            BinaryCode::ArrayStart => Some(BinaryCode::ArrayEnd),
            BinaryCode::ObjectStart => Some(BinaryCode::ObjectEnd),
            BinaryCode::TupleStart => Some(BinaryCode::TupleEnd),
            BinaryCode::SubscopeStart => Some(BinaryCode::SubscopeEnd),
            _ => None,
        }
    }
}

impl From<BinaryCode> for u8 {
    fn from(code: BinaryCode) -> Self {
        code as u8
    }
}

/// Action attached to variable, pointer and child opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Get = 0,
    Set = 1,
    Init = 2,
    Other = 3,
    SetReference = 4,
}

/// Message kind carried in the signed header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolDataType {
    #[default]
    Request = 0,
    Response = 1,
    Data = 2,
    TmpScope = 3,
    Local = 4,
    Hello = 5,
    Debugger = 6,
    SourceMap = 7,
    Update = 8,
    Goodbye = 9,
}

impl ProtocolDataType {
    /// Whether blocks of this kind are executable unless overridden.
    pub fn executable_by_default(self) -> bool {
        matches!(self, ProtocolDataType::Request | ProtocolDataType::Local)
    }
}

impl fmt::Display for ProtocolDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolDataType::Request => "request",
            ProtocolDataType::Response => "response",
            ProtocolDataType::Data => "data",
            ProtocolDataType::TmpScope => "tmp_scope",
            ProtocolDataType::Local => "local",
            ProtocolDataType::Hello => "hello",
            ProtocolDataType::Debugger => "debugger",
            ProtocolDataType::SourceMap => "source_map",
            ProtocolDataType::Update => "update",
            ProtocolDataType::Goodbye => "goodbye",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ProtocolDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(ProtocolDataType::Request),
            "response" => Ok(ProtocolDataType::Response),
            "data" => Ok(ProtocolDataType::Data),
            "tmp_scope" => Ok(ProtocolDataType::TmpScope),
            "local" => Ok(ProtocolDataType::Local),
            "hello" => Ok(ProtocolDataType::Hello),
            "debugger" => Ok(ProtocolDataType::Debugger),
            "source_map" => Ok(ProtocolDataType::SourceMap),
            "update" => Ok(ProtocolDataType::Update),
            "goodbye" => Ok(ProtocolDataType::Goodbye),
            _ => Err(format!("Unknown message type `{}`", s)),
        }
    }
}
