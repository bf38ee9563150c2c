use std::fmt::{self, Display, Formatter};

use smol_str::SmolStr;

use crate::binary::BinaryCode;

/// One matched token and the number of source bytes it consumed.
#[derive(PartialEq, Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub len: usize,
}

/// Assignment suffix of a variable, pointer or type token.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Assign {
    /// `=`
    Set,
    /// `:=`
    Init,
    /// `$=`
    SetReference,
    /// `+=`, `-=`, `*=`, `/=`, `&=`, `|=`
    Update(BinaryCode),
    /// Recognized but without an action (`^=`, `,=`, `.=`), read as a get.
    Ignored,
}

impl Assign {
    pub(crate) fn parse(suffix: &str) -> Self {
        let compact: String = suffix.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.as_str() {
            "=" => Assign::Set,
            ":=" => Assign::Init,
            "$=" => Assign::SetReference,
            "+=" => Assign::Update(BinaryCode::Add),
            "-=" => Assign::Update(BinaryCode::Subtract),
            "*=" => Assign::Update(BinaryCode::Multiply),
            "/=" => Assign::Update(BinaryCode::Divide),
            "&=" => Assign::Update(BinaryCode::And),
            "|=" => Assign::Update(BinaryCode::Or),
            _ => Assign::Ignored,
        }
    }
}

/// What follows a `.` or `->` path separator.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum PathTail {
    None,
    Wildcard,
    Property(SmolStr),
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Sigil {
    /// `#name`
    Internal,
    /// `$name`
    Label,
    /// plain identifier
    Root,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum DeclarationKind {
    Var,
    Ref,
    Val,
    Const,
}

impl DeclarationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclarationKind::Var => "var",
            DeclarationKind::Ref => "ref",
            DeclarationKind::Val => "val",
            DeclarationKind::Const => "const",
        }
    }
}

/// A parameter of a `function` declaration.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct FunctionParam {
    pub export: bool,
    /// Passed by key instead of by position.
    pub named: bool,
    pub kind: DeclarationKind,
    pub name: SmolStr,
    /// `:` (type follows), `=` (default follows), `,`, `)` or nothing.
    pub end: Option<char>,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TargetSigil {
    Person,
    Institution,
    Endpoint,
    Broadcast,
}

/// Keyword commands that compile to a nested scope block.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum BlockKind {
    Scope,
    Always,
    Run,
    Do,
    Assert,
    Response,
    Defer,
}

impl BlockKind {
    pub fn code(self) -> BinaryCode {
        match self {
            BlockKind::Scope => BinaryCode::PlainScope,
            BlockKind::Always => BinaryCode::Transform,
            BlockKind::Run => BinaryCode::Run,
            BlockKind::Do => BinaryCode::Do,
            BlockKind::Assert => BinaryCode::Assert,
            BlockKind::Response => BinaryCode::Response,
            BlockKind::Defer => BinaryCode::Defer,
        }
    }

    /// Whether outer variables are extracted into the block prefix.
    pub fn extracts(self) -> bool {
        matches!(self, BlockKind::Always)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum TokenKind {
    Url(SmolStr),
    Separator,
    Insert(Option<usize>),
    InsertCommand { bracket: bool },
    Compile { bracket: bool },
    Key { slot: bool, name: SmolStr },
    /// Keyword commands that write a single opcode (`exit`, `freeze`, ...).
    Command(BinaryCode),
    Skip,
    Leave,
    Iterate,
    While,
    If { has_else: bool },
    Else,
    Fun,
    Newline,
    DocComment,
    Comment,
    Void,
    QuasiVoid,
    RemoteCall { bracket: bool },
    Block { kind: BlockKind, bracket: bool },
    SubscopeStart,
    SubscopeEnd,
    /// Stream and sync operators written as raw opcodes.
    StreamOperator(BinaryCode),
    Type {
        namespace: Option<SmolStr>,
        name: SmolStr,
        variation: Option<SmolStr>,
        paren: bool,
        assign: bool,
    },
    Comparator(BinaryCode),
    Try { bracket: bool },
    Accept,
    RelativePath(SmolStr),
    Spread,
    Range,
    PathSeparator(PathTail),
    PathRef(PathTail),
    Jump { code: BinaryCode, label: Option<SmolStr> },
    Label(Option<SmolStr>),
    UseProps(SmolStr),
    UseAll(SmolStr),
    Use,
    Bool(bool),
    Null,
    EmptyArray,
    EmptyObject,
    ArrayStart,
    ArrayEnd,
    TemplateStart(SmolStr),
    TemplateContinue(SmolStr),
    TemplateEnd(SmolStr),
    ObjectStart,
    ObjectEnd,
    Comma,
    Buffer(SmolStr),
    CloseAndStore,
    Infinity { negative: bool },
    Nan,
    Target {
        sigil: TargetSigil,
        name: SmolStr,
        instance: Option<SmolStr>,
    },
    String { content: SmolStr, key: bool },
    DynamicKeyEnd,
    Default { bracket: bool },
    ConstructorMethod,
    Function { export: bool, name: Option<SmolStr> },
    Plugin(SmolStr),
    Pointer {
        id: SmolStr,
        assign: Option<Assign>,
        bracket: bool,
    },
    Declaration {
        export: bool,
        kind: DeclarationKind,
        name: SmolStr,
        init: bool,
        bracket: bool,
    },
    DirectExport(SmolStr),
    Variable {
        sigil: Sigil,
        name: SmolStr,
        assign: Option<Assign>,
        bracket: bool,
    },
    CreatePointer,
    Hex(SmolStr),
    Bin(SmolStr),
    Oct(SmolStr),
    Quantity { value: SmolStr, unit: SmolStr },
    Time(SmolStr),
    Float(SmolStr),
    Int(SmolStr),
    AssignSet,
    AssignReference,
    AssignUpdate(BinaryCode),
    /// `^=`, matched so it is not read as `^` followed by `=`.
    AssignPower,
    /// Operators written as a single opcode (`+`, `++`, `!`, `and`, ...).
    Operator(BinaryCode),
}

impl TokenKind {
    /// Tokens after which an implicit `+`/`-` is read as an operator.
    pub fn is_value(&self) -> bool {
        matches!(
            self,
            TokenKind::Url(_)
                | TokenKind::Insert(_)
                | TokenKind::Key { .. }
                | TokenKind::Fun
                | TokenKind::Void
                | TokenKind::QuasiVoid
                | TokenKind::PathSeparator(PathTail::Wildcard | PathTail::Property(_))
                | TokenKind::Bool(_)
                | TokenKind::Null
                | TokenKind::EmptyArray
                | TokenKind::EmptyObject
                | TokenKind::Infinity { .. }
                | TokenKind::Nan
                | TokenKind::Hex(_)
                | TokenKind::Bin(_)
                | TokenKind::Oct(_)
                | TokenKind::Quantity { .. }
                | TokenKind::Time(_)
                | TokenKind::Float(_)
                | TokenKind::Int(_)
                | TokenKind::ArrayEnd
                | TokenKind::ObjectEnd
                | TokenKind::TemplateEnd(_)
                | TokenKind::Buffer(_)
                | TokenKind::Target { .. }
                | TokenKind::String { .. }
                | TokenKind::SubscopeEnd
                | TokenKind::Pointer { .. }
                | TokenKind::Variable { .. }
        )
    }
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            TokenKind::Url(url) => write!(f, "{}", url),
            TokenKind::Key { slot, name } => write!(f, "{}{}:", if *slot { "#" } else { "" }, name),
            TokenKind::Command(code) | TokenKind::Operator(code) | TokenKind::Comparator(code) => {
                write!(f, "{:?}", code)
            }
            TokenKind::Type { namespace, name, .. } => match namespace {
                Some(ns) => write!(f, "<{}:{}>", ns, name),
                None => write!(f, "<{}>", name),
            },
            TokenKind::String { content, .. } => write!(f, "\"{}\"", content),
            TokenKind::Variable { name, .. } => write!(f, "{}", name),
            TokenKind::Pointer { id, .. } => write!(f, "${}", id),
            TokenKind::Int(s) | TokenKind::Float(s) => write!(f, "{}", s),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::set("=", Assign::Set)]
    #[case::spaced(" = ", Assign::Set)]
    #[case::init(":=", Assign::Init)]
    #[case::reference("$=", Assign::SetReference)]
    #[case::add("+=", Assign::Update(BinaryCode::Add))]
    #[case::or("|=", Assign::Update(BinaryCode::Or))]
    #[case::power("^=", Assign::Ignored)]
    fn test_assign_parse(#[case] suffix: &str, #[case] expected: Assign) {
        assert_eq!(Assign::parse(suffix), expected);
    }

    #[rstest]
    #[case::always(BlockKind::Always, BinaryCode::Transform, true)]
    #[case::run(BlockKind::Run, BinaryCode::Run, false)]
    #[case::scope(BlockKind::Scope, BinaryCode::PlainScope, false)]
    fn test_block_kind(#[case] kind: BlockKind, #[case] code: BinaryCode, #[case] extracts: bool) {
        assert_eq!(kind.code(), code);
        assert_eq!(kind.extracts(), extracts);
    }
}
