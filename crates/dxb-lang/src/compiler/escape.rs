//! Escape sequences inside quoted strings, template parts and paths.
use crate::error::SyntaxError;

/// Resolves the escapes of a string literal body.
///
/// `\b \f \n \r \t \v`, up to three octal digits, `\xNN` and `\uNNNN` are
/// translated; any other escaped character stands for itself.
pub(crate) fn unescape(s: &str) -> Result<String, SyntaxError> {
    if !s.contains('\\') {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            break;
        };
        match escaped {
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{b}'),
            'u' => out.push(code_point(&mut chars, 4).ok_or(SyntaxError::InvalidUnicodeEscape)?),
            'x' => out.push(code_point(&mut chars, 2).ok_or(SyntaxError::InvalidHexEscape)?),
            '0'..='7' => {
                let mut digits = String::from(escaped);
                while digits.len() < 3 {
                    match chars.peek() {
                        Some(d @ '0'..='7') => {
                            digits.push(*d);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                match u32::from_str_radix(&digits, 8).ok().filter(|code| *code < 256) {
                    Some(code) => out.push(char::from_u32(code).unwrap_or('\0')),
                    None => out.push_str(&digits),
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Removes backslashes in front of any character (urls and relative paths).
pub(crate) fn strip_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn code_point(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, width: usize) -> Option<char> {
    let digits: String = (0..width).filter_map(|_| chars.next()).collect();
    if digits.len() != width || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
}
