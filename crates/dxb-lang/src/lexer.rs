pub mod error;
pub mod token;

use error::LexerError;
use nom::Parser;
use nom::error::ErrorKind;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1, take_while_m_n},
    character::complete::{char, multispace0, multispace1, one_of, satisfy, space0, space1},
    combinator::{map, not, opt, recognize, success, value, verify},
    multi::{many_m_n, many0, many1},
    sequence::{delimited, pair, preceded, terminated},
};
use smol_str::SmolStr;
use token::{Assign, BlockKind, DeclarationKind, FunctionParam, PathTail, Sigil, TargetSigil, Token, TokenKind};

use crate::binary::BinaryCode;

/// Assignment prefixes accepted after types, pointers and labels.
const TYPED_ASSIGN_PREFIXES: &str = ":+,-./*&|^";
const INTERNAL_ASSIGN_PREFIXES: &str = ":+,-./*&|$^";
const ROOT_ASSIGN_PREFIXES: &str = "+,-./*&|$";
const QUANTITY_PREFIXES: &str = "YZEPTGMkhdcmµunpfazy";

macro_rules! define_token_parser {
    ($name:ident, $tag:expr, $kind:expr) => {
        fn $name(input: &str) -> IResult<&str, TokenKind> {
            map(tag($tag), |_| $kind).parse(input)
        }
    };
}

macro_rules! define_keyword_parser {
    ($name:ident, $keyword:expr, $kind:expr) => {
        fn $name(input: &str) -> IResult<&str, TokenKind> {
            map(terminated(tag($keyword), word_boundary), |_| $kind).parse(input)
        }
    };
}

/// Keyword optionally followed by an opening bracket: `run (`, `scope`, ...
macro_rules! define_block_parser {
    ($name:ident, $keyword:expr, $bracket:ident => $kind:expr) => {
        fn $name(input: &str) -> IResult<&str, TokenKind> {
            map(
                preceded(terminated(tag($keyword), word_boundary), opening_bracket),
                |$bracket| $kind,
            )
            .parse(input)
        }
    };
}

/// Context the compiler passes in for the few patterns that depend on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexState {
    /// Inside a template string: `'` no longer starts a new one.
    pub in_template: bool,
    /// A template string waits for `)...(` or `)...'`.
    pub template_close: bool,
    /// Function parameter lists: type tokens take no assignment suffix.
    pub function_arg_compat: bool,
}

/// Matches the next token at the start of `input`.
///
/// Leading spaces must already be skipped. The table is tried in a fixed
/// order because many patterns are prefixes of others.
pub fn next_token(input: &str, state: &LexState, line: usize) -> Result<Token, LexerError> {
    match token(input, state) {
        Ok((rest, kind)) => Ok(Token {
            kind,
            len: input.len() - rest.len(),
        }),
        Err(_) => Err(LexerError::InvalidToken {
            line,
            near: input.lines().next().unwrap_or_default().to_string(),
        }),
    }
}

/// Drops spaces, tabs and carriage returns. Newlines are tokens.
pub fn skip_spaces(input: &str) -> &str {
    input.trim_start_matches(|c: char| c.is_whitespace() && c != '\n')
}

fn token<'a>(input: &'a str, state: &LexState) -> IResult<&'a str, TokenKind> {
    let compat = state.function_arg_compat;
    let type_literal = move |i: &'a str| type_token(i, compat);
    let open_template = |i: &'a str| {
        if state.in_template {
            reject(i)
        } else {
            template_start(i)
        }
    };
    let close_template = |i: &'a str| {
        if state.template_close {
            template_part(i)
        } else {
            reject(i)
        }
    };

    alt((
        leading_tokens,
        comments_and_blocks,
        type_literal,
        operators_and_paths,
        empty_literals,
        open_template,
        close_template,
        structures_and_targets,
        commands,
        declarations,
        numbers_and_assignments,
        operators,
    ))
    .parse(input)
}

fn reject<T>(input: &str) -> IResult<&str, T> {
    Err(nom::Err::Error(nom::error::Error::new(input, ErrorKind::Verify)))
}

#[inline(always)]
fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || ('\u{c0}'..='\u{17e}').contains(&c)
}

#[inline(always)]
fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

#[inline(always)]
fn is_alias_char(c: char) -> bool {
    is_name_char(c) || c == '-'
}

fn is_url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-(@:%_+.~#?&/=".contains(c)
}

fn word_boundary(input: &str) -> IResult<&str, ()> {
    not(satisfy(|c: char| c.is_ascii_alphanumeric() || c == '_')).parse(input)
}

fn opening_bracket(input: &str) -> IResult<&str, bool> {
    map(preceded(multispace0, opt(char('('))), |b| b.is_some()).parse(input)
}

fn trailing_bracket(input: &str) -> IResult<&str, bool> {
    map(preceded(space0, opt(char('('))), |b| b.is_some()).parse(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_name_start), take_while(is_name_char))).parse(input)
}

fn digits(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_digit()),
        take_while(|c: char| c.is_ascii_digit() || c == '_'),
    ))
    .parse(input)
}

/// `\s*[prefix]?=` not followed by `=`, `>` or `/`.
fn assign_suffix<'a>(prefixes: &'static str) -> impl Parser<&'a str, Output = Assign, Error = nom::error::Error<&'a str>> {
    map(
        recognize((multispace0, opt(one_of(prefixes)), char('='), not(one_of("=>/")))),
        Assign::parse,
    )
}

/// A run of `allowed` characters where a backslash escapes any character.
fn escaped_run(input: &str, allowed: fn(char) -> bool) -> IResult<&str, &str> {
    let mut chars = input.char_indices();
    let mut end = 0;
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some((j, escaped)) if escaped != '\n' => end = j + escaped.len_utf8(),
                _ => break,
            }
        } else if allowed(c) {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }

    if end == 0 {
        reject(input)
    } else {
        Ok((&input[end..], &input[..end]))
    }
}

/// Byte offset and value of the first unescaped character of `stops`.
fn scan_unescaped(input: &str, stops: &[char]) -> Option<(usize, char)> {
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next()?;
        } else if stops.contains(&c) {
            return Some((i, c));
        }
    }
    None
}

// --- leading tokens: urls, inserts, keys, flow keywords ---

fn url_chars(input: &str) -> IResult<&str, &str> {
    escaped_run(input, is_url_char)
}

fn url(input: &str) -> IResult<&str, TokenKind> {
    map(
        recognize((
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            tag("://"),
            url_chars,
        )),
        |s: &str| TokenKind::Url(s.into()),
    )
    .parse(input)
}

define_token_parser!(separator, "=>", TokenKind::Separator);

fn insert(input: &str) -> IResult<&str, TokenKind> {
    map(
        preceded(char('?'), take_while(|c: char| c.is_ascii_digit())),
        |n: &str| TokenKind::Insert(n.parse().ok()),
    )
    .parse(input)
}

define_block_parser!(insert_command, "insert", bracket => TokenKind::InsertCommand { bracket });
define_block_parser!(compile_command, "compile", bracket => TokenKind::Compile { bracket });

fn key(input: &str) -> IResult<&str, TokenKind> {
    map(
        terminated(
            pair(opt(char('#')), take_while1(is_alias_char)),
            (multispace0, char(':'), not(char(':'))),
        ),
        |(slot, name): (Option<char>, &str)| TokenKind::Key {
            slot: slot.is_some(),
            name: name.into(),
        },
    )
    .parse(input)
}

define_keyword_parser!(exit, "exit", TokenKind::Command(BinaryCode::Exit));
define_keyword_parser!(get, "get", TokenKind::Command(BinaryCode::Get));
define_keyword_parser!(count, "count", TokenKind::Command(BinaryCode::Count));
define_keyword_parser!(about, "about", TokenKind::Command(BinaryCode::About));
define_keyword_parser!(return_command, "return", TokenKind::Command(BinaryCode::Return));
define_keyword_parser!(iterator, "iterator", TokenKind::Command(BinaryCode::Iterator));
define_keyword_parser!(skip, "skip", TokenKind::Skip);
define_keyword_parser!(leave, "leave", TokenKind::Leave);
define_keyword_parser!(iterate, "iterate", TokenKind::Iterate);
define_keyword_parser!(while_loop, "while", TokenKind::While);

fn else_if(input: &str) -> IResult<&str, TokenKind> {
    map(
        terminated(
            opt(terminated(tag("else"), word_boundary)),
            (multispace0, tag("if"), word_boundary),
        ),
        |e| TokenKind::If { has_else: e.is_some() },
    )
    .parse(input)
}

define_keyword_parser!(else_branch, "else", TokenKind::Else);
define_keyword_parser!(fun, "fun", TokenKind::Fun);
define_token_parser!(newline, "\n", TokenKind::Newline);

/// `## ... ##`: the closing run must not be followed by a space, a longer
/// closing run gives back one `#` to satisfy that.
fn doc_comment(input: &str) -> IResult<&str, TokenKind> {
    let bytes = input.as_bytes();
    let opening = bytes.iter().take_while(|b| **b == b'#').count();
    if opening < 2 {
        return reject(input);
    }

    for start in (2..=opening).rev() {
        let mut j = start;
        while j + 1 < bytes.len() {
            if bytes[j] == b'#' && bytes[j + 1] == b'#' {
                let run = bytes[j..].iter().take_while(|b| **b == b'#').count();
                match bytes.get(j + run) {
                    Some(b' ') if run >= 3 => return Ok((&input[j + run - 1..], TokenKind::DocComment)),
                    Some(b' ') => {}
                    _ => return Ok((&input[j + run..], TokenKind::DocComment)),
                }
            }
            j += 1;
        }
    }
    reject(input)
}

fn comment(input: &str) -> IResult<&str, TokenKind> {
    map(
        alt((
            recognize(pair(tag("# "), take_while(|c: char| c != '\n'))),
            recognize(pair(tag("//"), take_while(|c: char| c != '\n'))),
            block_comment,
        )),
        |_| TokenKind::Comment,
    )
    .parse(input)
}

fn block_comment(input: &str) -> IResult<&str, &str> {
    let Some(body) = input.strip_prefix("/*") else {
        return reject(input);
    };
    match body.find("*/") {
        Some(end) => Ok((&body[end + 2..], &input[..end + 4])),
        None => reject(input),
    }
}

fn leading_tokens(input: &str) -> IResult<&str, TokenKind> {
    alt((
        url,
        separator,
        insert,
        insert_command,
        compile_command,
        key,
        exit,
        get,
        count,
        about,
        return_command,
        iterator,
        skip,
        leave,
        iterate,
        while_loop,
        else_if,
        else_branch,
        fun,
        newline,
        doc_comment,
    ))
    .parse(input)
}

// --- comments, void, blocks and stream operators ---

define_keyword_parser!(void, "void", TokenKind::Void);

fn remote_call(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(pair(tag("::"), space0), opening_bracket), |bracket| {
        TokenKind::RemoteCall { bracket }
    })
    .parse(input)
}

define_block_parser!(always, "always", bracket => TokenKind::Block { kind: BlockKind::Always, bracket });

fn quasi_void(input: &str) -> IResult<&str, TokenKind> {
    value(TokenKind::QuasiVoid, (char('('), multispace0, char(')'))).parse(input)
}

define_token_parser!(subscope_start, "(", TokenKind::SubscopeStart);
define_token_parser!(sync_silent, "<==:", TokenKind::StreamOperator(BinaryCode::SyncSilent));
define_token_parser!(sync, "<==", TokenKind::StreamOperator(BinaryCode::Sync));
define_token_parser!(stop_sync, "</=", TokenKind::StreamOperator(BinaryCode::StopSync));
define_token_parser!(stream, "<<", TokenKind::StreamOperator(BinaryCode::Stream));
define_token_parser!(stop_stream, "</", TokenKind::StreamOperator(BinaryCode::StopStream));

fn comments_and_blocks(input: &str) -> IResult<&str, TokenKind> {
    alt((
        comment,
        void,
        remote_call,
        always,
        quasi_void,
        subscope_start,
        sync_silent,
        sync,
        stop_sync,
        stream,
        stop_stream,
    ))
    .parse(input)
}

// --- types ---

fn is_type_char(c: char) -> bool {
    is_name_char(c) || c == '+' || c == '-'
}

/// `<ns:name/variation>` or `<name(`. The last variation wins.
fn type_token(input: &str, function_arg_compat: bool) -> IResult<&str, TokenKind> {
    let (rest, (namespace, name, variations, close)) = preceded(
        char('<'),
        (
            opt(terminated(
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                char(':'),
            )),
            take_while1(is_type_char),
            many0(preceded(char('/'), take_while(is_type_char))),
            one_of(">("),
        ),
    )
    .parse(input)?;

    let (rest, assign) = if function_arg_compat {
        (rest, None)
    } else {
        opt(assign_suffix(TYPED_ASSIGN_PREFIXES)).parse(rest)?
    };

    Ok((
        rest,
        TokenKind::Type {
            namespace: namespace.map(SmolStr::from),
            name: name.into(),
            variation: variations.last().filter(|v| !v.is_empty()).map(|v| SmolStr::from(*v)),
            paren: close == '(',
            assign: assign.is_some(),
        },
    ))
}

// --- comparators, paths, jumps, imports ---

define_token_parser!(equal, "===", TokenKind::Comparator(BinaryCode::Equal));
define_token_parser!(not_equal, "!==", TokenKind::Comparator(BinaryCode::NotEqual));
define_token_parser!(equal_value, "==", TokenKind::Comparator(BinaryCode::EqualValue));
define_token_parser!(not_equal_value, "!=", TokenKind::Comparator(BinaryCode::NotEqualValue));
define_token_parser!(greater_equal, ">=", TokenKind::Comparator(BinaryCode::GreaterEqual));
define_token_parser!(less_equal, "<=", TokenKind::Comparator(BinaryCode::LessEqual));
define_token_parser!(greater, ">", TokenKind::Comparator(BinaryCode::Greater));
define_token_parser!(less, "<", TokenKind::Comparator(BinaryCode::Less));
define_keyword_parser!(yeet, "yeet", TokenKind::Command(BinaryCode::Yeet));
define_block_parser!(try_block, "try", bracket => TokenKind::Try { bracket });
define_keyword_parser!(accept, "accept", TokenKind::Accept);

fn relative_path(input: &str) -> IResult<&str, TokenKind> {
    map(
        recognize((char('.'), opt(char('.')), char('/'), url_chars)),
        |s: &str| TokenKind::RelativePath(s.into()),
    )
    .parse(input)
}

define_token_parser!(spread, "...", TokenKind::Spread);
define_token_parser!(range, "..", TokenKind::Range);

fn path_tail(input: &str) -> IResult<&str, PathTail> {
    alt((
        value(
            PathTail::Wildcard,
            terminated(char('*'), not(pair(opt(char('+')), satisfy(is_name_start)))),
        ),
        map(identifier, |name| PathTail::Property(name.into())),
        success(PathTail::None),
    ))
    .parse(input)
}

fn path_separator(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(char('.'), path_tail), TokenKind::PathSeparator).parse(input)
}

fn path_ref(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(tag("->"), path_tail), TokenKind::PathRef).parse(input)
}

fn jump_label(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn jump(input: &str) -> IResult<&str, TokenKind> {
    map(
        pair(
            terminated(alt((tag("jmp"), tag("jtr"), tag("jfa"))), many1(char(' '))),
            opt(jump_label),
        ),
        |(op, label)| TokenKind::Jump {
            code: match op {
                "jtr" => BinaryCode::Jtr,
                "jfa" => BinaryCode::Jfa,
                _ => BinaryCode::Jmp,
            },
            label: label.map(SmolStr::from),
        },
    )
    .parse(input)
}

fn label(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(pair(tag("lbl"), space0), opt(jump_label)), |label| {
        TokenKind::Label(label.map(SmolStr::from))
    })
    .parse(input)
}

fn import_name(input: &str) -> IResult<&str, &str> {
    verify(identifier, |name: &str| name != "from").parse(input)
}

fn use_props(input: &str) -> IResult<&str, TokenKind> {
    map(
        delimited(
            (tag("use"), space0, opt(char('('))),
            recognize(many1((
                import_name,
                opt((space1, tag("as"), space0, import_name)),
                space0,
                opt(char(',')),
                space0,
            ))),
            (opt(char(')')), space0, tag("from")),
        ),
        |list: &str| TokenKind::UseProps(list.into()),
    )
    .parse(input)
}

fn use_all(input: &str) -> IResult<&str, TokenKind> {
    map(
        delimited(
            (tag("use"), space1, char('*'), space1, tag("as"), space0),
            identifier,
            (space0, tag("from")),
        ),
        |name| TokenKind::UseAll(name.into()),
    )
    .parse(input)
}

define_keyword_parser!(use_module, "use", TokenKind::Use);

fn operators_and_paths(input: &str) -> IResult<&str, TokenKind> {
    alt((
        equal,
        not_equal,
        equal_value,
        not_equal_value,
        greater_equal,
        less_equal,
        greater,
        less,
        yeet,
        try_block,
        accept,
        relative_path,
        spread,
        range,
        path_separator,
        path_ref,
        jump,
        label,
        use_props,
        use_all,
        use_module,
    ))
    .parse(input)
}

// --- literals ---

fn boolean(input: &str) -> IResult<&str, TokenKind> {
    alt((
        value(TokenKind::Bool(true), terminated(tag("true"), word_boundary)),
        value(TokenKind::Bool(false), terminated(tag("false"), word_boundary)),
    ))
    .parse(input)
}

define_keyword_parser!(null, "null", TokenKind::Null);

fn empty_array(input: &str) -> IResult<&str, TokenKind> {
    value(TokenKind::EmptyArray, (char('['), multispace0, char(']'))).parse(input)
}

fn empty_object(input: &str) -> IResult<&str, TokenKind> {
    value(TokenKind::EmptyObject, (char('{'), multispace0, char('}'))).parse(input)
}

define_token_parser!(array_start, "[", TokenKind::ArrayStart);
define_token_parser!(array_end, "]", TokenKind::ArrayEnd);

fn empty_literals(input: &str) -> IResult<&str, TokenKind> {
    alt((boolean, null, empty_array, empty_object, array_start, array_end)).parse(input)
}

/// `'text (` opening a template string.
fn template_start(input: &str) -> IResult<&str, TokenKind> {
    let Some(body) = input.strip_prefix('\'') else {
        return reject(input);
    };
    match scan_unescaped(body, &['(', '\'']) {
        Some((end, '(')) => Ok((&body[end + 1..], TokenKind::TemplateStart(body[..end].into()))),
        _ => reject(input),
    }
}

/// `) text (` continuing or `) text'` closing a template string.
fn template_part(input: &str) -> IResult<&str, TokenKind> {
    let Some(body) = input.strip_prefix(')') else {
        return reject(input);
    };
    match scan_unescaped(body, &['(', '\'']) {
        Some((end, '(')) => Ok((&body[end + 1..], TokenKind::TemplateContinue(body[..end].into()))),
        Some((end, _)) => Ok((&body[end + 1..], TokenKind::TemplateEnd(body[..end].into()))),
        None => reject(input),
    }
}

// --- structures, endpoints, strings ---

define_token_parser!(object_start, "{", TokenKind::ObjectStart);
define_token_parser!(object_end, "}", TokenKind::ObjectEnd);
define_token_parser!(comma, ",", TokenKind::Comma);

fn buffer(input: &str) -> IResult<&str, TokenKind> {
    map(
        delimited(
            char('`'),
            take_while(|c: char| c.is_ascii_hexdigit() || c == '_'),
            char('`'),
        ),
        |hex: &str| TokenKind::Buffer(hex.into()),
    )
    .parse(input)
}

fn close_and_store(input: &str) -> IResult<&str, TokenKind> {
    value(TokenKind::CloseAndStore, many1(pair(char(';'), multispace0))).parse(input)
}

fn infinity(input: &str) -> IResult<&str, TokenKind> {
    map(
        terminated(opt(one_of("+-")), pair(tag("infinity"), word_boundary)),
        |sign| TokenKind::Infinity {
            negative: sign == Some('-'),
        },
    )
    .parse(input)
}

define_keyword_parser!(nan, "nan", TokenKind::Nan);

fn target_instance(input: &str) -> IResult<&str, Option<SmolStr>> {
    map(
        opt(preceded(
            char('/'),
            alt((tag("*"), take_while_m_n(1, 8, is_alias_char))),
        )),
        |instance| instance.map(SmolStr::from),
    )
    .parse(input)
}

fn target(input: &str) -> IResult<&str, TokenKind> {
    let (rest, (sigil, name)) = alt((
        map(
            preceded(char('@'), take_while_m_n(1, 32, is_alias_char)),
            |name| (TargetSigil::Person, name),
        ),
        map(
            preceded(tag("@+"), take_while_m_n(1, 32, is_alias_char)),
            |name| (TargetSigil::Institution, name),
        ),
        map(
            preceded(
                tag("@@"),
                take_while_m_n(2, 26, |c: char| c.is_ascii_hexdigit() || c == '_' || c == '-'),
            ),
            |id| (TargetSigil::Endpoint, id),
        ),
        map(
            preceded(
                tag("@*"),
                recognize(many0(preceded(
                    char('.'),
                    alt((tag("*"), take_while_m_n(1, 32, is_alias_char))),
                ))),
            ),
            |subspaces| (TargetSigil::Broadcast, subspaces),
        ),
    ))
    .parse(input)?;
    let (rest, instance) = target_instance(rest)?;

    Ok((
        rest,
        TokenKind::Target {
            sigil,
            name: name.into(),
            instance,
        },
    ))
}

/// Double or single quoted text, optionally followed by `:` to make it a key.
fn string(input: &str) -> IResult<&str, TokenKind> {
    let Some(quote) = input.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return reject(input);
    };
    let body = &input[1..];
    let Some((end, _)) = scan_unescaped(body, &[quote]) else {
        return reject(input);
    };
    let (rest, key) = opt((space0, char(':'), not(char(':')))).parse(&body[end + 1..])?;

    Ok((
        rest,
        TokenKind::String {
            content: body[..end].into(),
            key: key.is_some(),
        },
    ))
}

fn dynamic_key_end(input: &str) -> IResult<&str, TokenKind> {
    value(TokenKind::DynamicKeyEnd, (char(')'), space0, char(':'))).parse(input)
}

define_token_parser!(subscope_end, ")", TokenKind::SubscopeEnd);

fn structures_and_targets(input: &str) -> IResult<&str, TokenKind> {
    alt((
        object_start,
        object_end,
        comma,
        buffer,
        close_and_store,
        infinity,
        nan,
        target,
        string,
        dynamic_key_end,
        subscope_end,
    ))
    .parse(input)
}

// --- command keywords ---

define_keyword_parser!(freeze, "freeze", TokenKind::Command(BinaryCode::Freeze));
define_keyword_parser!(seal, "seal", TokenKind::Command(BinaryCode::Seal));
define_keyword_parser!(has, "has", TokenKind::Command(BinaryCode::Has));
define_keyword_parser!(keys, "keys", TokenKind::Command(BinaryCode::Keys));
define_keyword_parser!(delete, "delete", TokenKind::Command(BinaryCode::DeletePointer));
define_keyword_parser!(copy, "copy", TokenKind::Command(BinaryCode::Copy));
define_keyword_parser!(clone, "clone", TokenKind::Command(BinaryCode::Clone));
define_keyword_parser!(clone_collapse, "clone_collapse", TokenKind::Command(BinaryCode::CloneCollapse));
define_keyword_parser!(collapse, "collapse", TokenKind::Command(BinaryCode::Collapse));
define_keyword_parser!(get_type, "type", TokenKind::Command(BinaryCode::GetType));
define_keyword_parser!(origin, "origin", TokenKind::Command(BinaryCode::Origin));
define_keyword_parser!(subscribers, "subscribers", TokenKind::Command(BinaryCode::Subscribers));
define_keyword_parser!(next, "next", TokenKind::Command(BinaryCode::Next));
define_keyword_parser!(template, "template", TokenKind::Command(BinaryCode::Template));
define_keyword_parser!(extends, "extends", TokenKind::Command(BinaryCode::Extends));
define_keyword_parser!(implements, "implements", TokenKind::Command(BinaryCode::Implements));
define_keyword_parser!(matches, "matches", TokenKind::Command(BinaryCode::Matches));
define_block_parser!(default, "default", bracket => TokenKind::Default { bracket });
define_keyword_parser!(debugger, "debugger", TokenKind::Command(BinaryCode::Debugger));
define_keyword_parser!(new, "new", TokenKind::Command(BinaryCode::New));

fn commands(input: &str) -> IResult<&str, TokenKind> {
    alt((
        freeze,
        seal,
        has,
        keys,
        delete,
        copy,
        clone,
        clone_collapse,
        collapse,
        get_type,
        origin,
        subscribers,
        next,
        template,
        extends,
        implements,
        matches,
        default,
        debugger,
        new,
    ))
    .parse(input)
}

// --- blocks, declarations and variables ---

fn constructor_method(input: &str) -> IResult<&str, TokenKind> {
    value(
        TokenKind::ConstructorMethod,
        terminated(
            alt((tag("constructor"), tag("destructor"), tag("replicator"), tag("creator"))),
            word_boundary,
        ),
    )
    .parse(input)
}

define_block_parser!(scope, "scope", bracket => TokenKind::Block { kind: BlockKind::Scope, bracket });
define_keyword_parser!(observe, "observe", TokenKind::Command(BinaryCode::Observe));

fn function(input: &str) -> IResult<&str, TokenKind> {
    map(
        pair(
            opt(pair(tag("export"), multispace1)),
            delimited(pair(tag("function"), multispace1), opt(identifier), pair(multispace0, char('('))),
        ),
        |(export, name)| TokenKind::Function {
            export: export.is_some(),
            name: name.map(SmolStr::from),
        },
    )
    .parse(input)
}

/// One entry of a `function` parameter list, up to and including its
/// terminator (`:`, `=`, `,` or `)`).
pub fn function_param(input: &str) -> Option<(FunctionParam, usize)> {
    let modifier = terminated(
        alt((tag("export"), tag("named"), tag("ref"), tag("val"), tag("var"), tag("const"))),
        multispace1,
    );
    let parsed: IResult<&str, _> = (
        multispace0,
        many0(modifier),
        identifier,
        multispace0,
        opt(one_of(":=,)")),
    )
        .parse(input);

    let (rest, (_, modifiers, name, _, end)) = parsed.ok()?;
    let kind = modifiers
        .iter()
        .find_map(|m| match *m {
            "ref" => Some(DeclarationKind::Ref),
            "val" => Some(DeclarationKind::Val),
            "const" => Some(DeclarationKind::Const),
            _ => None,
        })
        .unwrap_or(DeclarationKind::Var);

    Some((
        FunctionParam {
            export: modifiers.contains(&"export"),
            named: modifiers.contains(&"named"),
            kind,
            name: name.into(),
            end,
        },
        input.len() - rest.len(),
    ))
}

fn plugin(input: &str) -> IResult<&str, TokenKind> {
    map(
        delimited(pair(tag("plugin"), multispace1), identifier, pair(multispace0, char('('))),
        |name| TokenKind::Plugin(name.into()),
    )
    .parse(input)
}

define_block_parser!(run, "run", bracket => TokenKind::Block { kind: BlockKind::Run, bracket });
define_block_parser!(do_block, "do", bracket => TokenKind::Block { kind: BlockKind::Do, bracket });
define_block_parser!(assert, "assert", bracket => TokenKind::Block { kind: BlockKind::Assert, bracket });
define_block_parser!(response, "response", bracket => TokenKind::Block { kind: BlockKind::Response, bracket });
define_block_parser!(defer, "defer", bracket => TokenKind::Block { kind: BlockKind::Defer, bracket });
define_keyword_parser!(await_command, "await", TokenKind::Command(BinaryCode::Await));
define_keyword_parser!(or_keyword, "or", TokenKind::Operator(BinaryCode::Or));
define_keyword_parser!(and_keyword, "and", TokenKind::Operator(BinaryCode::And));
define_keyword_parser!(not_keyword, "not", TokenKind::Operator(BinaryCode::Not));

/// `$hexid`: up to 26 bytes, each two hex digits or `x` plus one digit.
fn pointer(input: &str) -> IResult<&str, TokenKind> {
    let hex_pair = take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit());
    let short = recognize(pair(one_of("xX"), satisfy(|c: char| c.is_ascii_hexdigit())));
    map(
        (
            preceded(
                char('$'),
                terminated(
                    recognize(many_m_n(1, 26, alt((hex_pair, short)))),
                    not(satisfy(is_name_char)),
                ),
            ),
            opt(assign_suffix(TYPED_ASSIGN_PREFIXES)),
            trailing_bracket,
        ),
        |(id, assign, bracket)| TokenKind::Pointer {
            id: id.into(),
            assign,
            bracket,
        },
    )
    .parse(input)
}

fn declaration(input: &str) -> IResult<&str, TokenKind> {
    map(
        (
            opt(tag("export ")),
            space0,
            terminated(
                alt((
                    value(DeclarationKind::Var, tag("var")),
                    value(DeclarationKind::Ref, tag("ref")),
                    value(DeclarationKind::Val, tag("val")),
                    value(DeclarationKind::Const, tag("const")),
                )),
                word_boundary,
            ),
            delimited(multispace0, identifier, multispace0),
            terminated(opt(char(':')), pair(char('='), space0)),
            opt(char('(')),
        ),
        |(export, _, kind, name, init, bracket)| TokenKind::Declaration {
            export: export.is_some(),
            kind,
            name: name.into(),
            init: init.is_some(),
            bracket: bracket.is_some(),
        },
    )
    .parse(input)
}

fn direct_export(input: &str) -> IResult<&str, TokenKind> {
    map(preceded(pair(tag("export"), multispace1), identifier), |name| {
        TokenKind::DirectExport(name.into())
    })
    .parse(input)
}

fn internal_variable(input: &str) -> IResult<&str, TokenKind> {
    map(
        (
            preceded(char('#'), take_while1(is_name_char)),
            opt(assign_suffix(INTERNAL_ASSIGN_PREFIXES)),
            trailing_bracket,
        ),
        |(name, assign, bracket)| TokenKind::Variable {
            sigil: Sigil::Internal,
            name: name.into(),
            assign,
            bracket,
        },
    )
    .parse(input)
}

fn root_variable(input: &str) -> IResult<&str, TokenKind> {
    map(
        pair(identifier, opt(assign_suffix(ROOT_ASSIGN_PREFIXES))),
        |(name, assign)| TokenKind::Variable {
            sigil: Sigil::Root,
            name: name.into(),
            assign,
            bracket: false,
        },
    )
    .parse(input)
}

fn labeled_pointer(input: &str) -> IResult<&str, TokenKind> {
    map(
        (
            preceded(char('$'), take_while_m_n(1, 25, is_name_char)),
            opt(assign_suffix(TYPED_ASSIGN_PREFIXES)),
            trailing_bracket,
        ),
        |(name, assign, bracket)| TokenKind::Variable {
            sigil: Sigil::Label,
            name: name.into(),
            assign,
            bracket,
        },
    )
    .parse(input)
}

define_token_parser!(create_pointer, "$$", TokenKind::CreatePointer);

fn declarations(input: &str) -> IResult<&str, TokenKind> {
    alt((
        constructor_method,
        scope,
        observe,
        function,
        plugin,
        run,
        do_block,
        assert,
        response,
        defer,
        await_command,
        or_keyword,
        and_keyword,
        not_keyword,
        pointer,
        declaration,
        direct_export,
        internal_variable,
        root_variable,
        labeled_pointer,
        create_pointer,
    ))
    .parse(input)
}

// --- numbers and assignments ---

fn hex(input: &str) -> IResult<&str, TokenKind> {
    map(
        preceded(tag("0x"), take_while1(|c: char| c.is_ascii_hexdigit() || c == '_')),
        |digits: &str| TokenKind::Hex(digits.into()),
    )
    .parse(input)
}

fn bin(input: &str) -> IResult<&str, TokenKind> {
    map(
        preceded(tag("0b"), take_while1(|c: char| c == '0' || c == '1' || c == '_')),
        |digits: &str| TokenKind::Bin(digits.into()),
    )
    .parse(input)
}

fn oct(input: &str) -> IResult<&str, TokenKind> {
    map(
        preceded(tag("0o"), take_while1(|c: char| ('0'..='7').contains(&c) || c == '_')),
        |digits: &str| TokenKind::Oct(digits.into()),
    )
    .parse(input)
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize((one_of("eE"), opt(one_of("+-")), digits)).parse(input)
}

fn is_unit_char(c: char) -> bool {
    c.is_ascii_alphabetic() || "€¢$¥Ω£₽⁄".contains(c)
}

/// One unit symbol: an optional SI prefix and up to four letters.
fn unit_symbol<'a>(input: &'a str, extra: &'static str) -> IResult<&'a str, &'a str> {
    let mut end = 0;
    let mut count = 0;
    for (i, c) in input.char_indices() {
        if count == 5 || !(is_unit_char(c) || extra.contains(c)) {
            break;
        }
        end = i + c.len_utf8();
        count += 1;
    }
    if count == 5 && !input.starts_with(|c: char| QUANTITY_PREFIXES.contains(c)) {
        end = input.char_indices().nth(4).map(|(i, _)| i).unwrap_or(end);
    }

    if end == 0 {
        reject(input)
    } else {
        Ok((&input[end..], &input[..end]))
    }
}

fn base_unit(input: &str) -> IResult<&str, &str> {
    unit_symbol(input, "")
}

fn derived_unit(input: &str) -> IResult<&str, &str> {
    unit_symbol(input, "%")
}

fn unit_exponent(input: &str) -> IResult<&str, &str> {
    recognize((
        char('^'),
        opt(char('-')),
        take_while_m_n(1, 4, |c: char| c.is_ascii_digit()),
    ))
    .parse(input)
}

fn quantity(input: &str) -> IResult<&str, TokenKind> {
    map(
        terminated(
            pair(
                recognize((
                    opt(one_of("+-")),
                    opt(pair(digits0, char('.'))),
                    digits,
                    opt(exponent),
                )),
                recognize(pair(
                    pair(base_unit, opt(unit_exponent)),
                    many0((one_of("*/"), derived_unit, opt(unit_exponent))),
                )),
            ),
            not(satisfy(|c: char| c.is_ascii_digit() || c == '-')),
        ),
        |(value, unit): (&str, &str)| TokenKind::Quantity {
            value: value.into(),
            unit: unit.into(),
        },
    )
    .parse(input)
}

fn time(input: &str) -> IResult<&str, TokenKind> {
    map(
        delimited(
            char('~'),
            take_while1(|c: char| c.is_ascii_digit() || "-:.TZ ".contains(c)),
            char('~'),
        ),
        |t: &str| TokenKind::Time(t.into()),
    )
    .parse(input)
}

fn digits0(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c.is_ascii_digit() || c == '_').parse(input)
}

fn float(input: &str) -> IResult<&str, TokenKind> {
    map(
        recognize(pair(
            opt(one_of("+-")),
            alt((
                recognize((opt(pair(digits0, char('.'))), digits0, exponent)),
                recognize((digits, char('.'), digits)),
            )),
        )),
        |f: &str| TokenKind::Float(f.into()),
    )
    .parse(input)
}

fn int(input: &str) -> IResult<&str, TokenKind> {
    map(
        terminated(
            recognize(pair(opt(one_of("+-")), digits)),
            pair(word_boundary, not(pair(char('.'), satisfy(|c: char| c.is_ascii_digit())))),
        ),
        |i: &str| TokenKind::Int(i.into()),
    )
    .parse(input)
}

define_token_parser!(assign_set, "=", TokenKind::AssignSet);
define_token_parser!(assign_add, "+=", TokenKind::AssignUpdate(BinaryCode::Add));
define_token_parser!(assign_sub, "-=", TokenKind::AssignUpdate(BinaryCode::Subtract));
define_token_parser!(assign_multiply, "*=", TokenKind::AssignUpdate(BinaryCode::Multiply));
define_token_parser!(assign_divide, "/=", TokenKind::AssignUpdate(BinaryCode::Divide));
define_token_parser!(assign_power, "^=", TokenKind::AssignPower);
define_token_parser!(assign_and, "&=", TokenKind::AssignUpdate(BinaryCode::And));
define_token_parser!(assign_or, "|=", TokenKind::AssignUpdate(BinaryCode::Or));
define_token_parser!(assign_reference, "$=", TokenKind::AssignReference);

fn numbers_and_assignments(input: &str) -> IResult<&str, TokenKind> {
    alt((
        hex,
        bin,
        oct,
        quantity,
        time,
        float,
        int,
        assign_set,
        assign_add,
        assign_sub,
        assign_multiply,
        assign_divide,
        assign_power,
        assign_and,
        assign_or,
        assign_reference,
    ))
    .parse(input)
}

define_token_parser!(increment, "++", TokenKind::Operator(BinaryCode::Increment));
define_token_parser!(decrement, "--", TokenKind::Operator(BinaryCode::Decrement));
define_token_parser!(add, "+", TokenKind::Operator(BinaryCode::Add));
define_token_parser!(subtract, "-", TokenKind::Operator(BinaryCode::Subtract));
define_token_parser!(multiply, "*", TokenKind::Operator(BinaryCode::Multiply));
define_token_parser!(power, "^", TokenKind::Operator(BinaryCode::Power));
define_token_parser!(modulo, "%", TokenKind::Operator(BinaryCode::Modulo));
define_token_parser!(divide, "/", TokenKind::Operator(BinaryCode::Divide));
define_token_parser!(or, "|", TokenKind::Operator(BinaryCode::Or));
define_token_parser!(and, "&", TokenKind::Operator(BinaryCode::And));
define_token_parser!(not_operator, "!", TokenKind::Operator(BinaryCode::Not));

fn operators(input: &str) -> IResult<&str, TokenKind> {
    alt((
        increment,
        decrement,
        add,
        subtract,
        multiply,
        power,
        modulo,
        divide,
        or,
        and,
        not_operator,
    ))
    .parse(input)
}
