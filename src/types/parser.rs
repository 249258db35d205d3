//! Type-name and prototype text parsing
//!
//! Grammar, loosely:
//! - type: `const? word+ ('*' | '!' | const)*`
//! - prototype: `type conv? name '(' (param (',' param)* (',' '...')?)? ')' ';'?`
//! - param: `('_In_' | '_Out_' | '_Inout_')? type name?`

use super::Direction;
use crate::config::MAX_POINTER_DEPTH;
use crate::error::{FfiError, Result};
use crate::interop::abi::CallConvention;

/// Parsed type name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedType {
    /// Base name with whitespace collapsed
    pub base: String,
    /// Number of `*` levels
    pub indirection: usize,
    /// Bit `i` set when level `i` is marked disposable with `!`
    pub disposables: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub text: String,
    pub direction: Direction,
}

/// Parsed function declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPrototype {
    pub ret: String,
    pub name: String,
    pub params: Vec<ParsedParam>,
    pub variadic: bool,
    pub convention: Option<CallConvention>,
}

#[inline]
fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse `"const unsigned   int **!"` into base, indirection and disposable marks
pub fn parse_type_name(text: &str) -> Result<ParsedType> {
    let invalid = || FfiError::resolution(format!("Unknown or invalid type name '{}'", text));

    let mut words: Vec<&str> = Vec::new();
    let mut rest = text.trim();

    // Base words up to the first '*' or '!'
    loop {
        rest = rest.trim_start();
        let end = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        if end == 0 {
            break;
        }
        let word = &rest[..end];
        if word != "const" {
            words.push(word);
        }
        rest = &rest[end..];
    }

    if words.is_empty() {
        return Err(invalid());
    }

    let mut parsed = ParsedType {
        base: words.join(" "),
        indirection: 0,
        disposables: 0,
    };

    // Suffix: '*', '!' and interleaved const qualifiers
    while !rest.is_empty() {
        rest = rest.trim_start();
        if let Some(tail) = rest.strip_prefix('*') {
            if parsed.indirection == MAX_POINTER_DEPTH {
                return Err(FfiError::resolution(format!(
                    "Too many indirection levels in '{}' (max = {})",
                    text, MAX_POINTER_DEPTH
                )));
            }
            parsed.indirection += 1;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('!') {
            parsed.disposables |= 1 << parsed.indirection;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("const") {
            if tail.starts_with(is_ident_char) {
                return Err(invalid());
            }
            rest = tail;
        } else if !rest.is_empty() {
            return Err(invalid());
        }
    }

    Ok(parsed)
}

/// Parse a C-like declaration, e.g. `"int printf(const char *fmt, ...)"`
pub fn parse_prototype(text: &str) -> Result<ParsedPrototype> {
    let invalid = |detail: &str| FfiError::argument(format!("Invalid prototype '{}': {}", text, detail));

    let text_trimmed = text.trim().trim_end_matches(';').trim_end();
    let open = text_trimmed.find('(').ok_or_else(|| invalid("missing '('"))?;
    if !text_trimmed.ends_with(')') {
        return Err(invalid("missing ')'"));
    }

    let head = text_trimmed[..open].trim_end();
    let inner = &text_trimmed[open + 1..text_trimmed.len() - 1];

    let name_start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident_char(*c))
        .last()
        .map(|(i, _)| i)
        .ok_or_else(|| invalid("missing function name"))?;
    let name = &head[name_start..];
    let mut ret = head[..name_start].trim_end();

    let mut convention = None;
    for (keyword, conv) in CallConvention::KEYWORDS {
        if let Some(stripped) = ret.strip_suffix(keyword) {
            if stripped.is_empty() || !stripped.ends_with(is_ident_char) {
                convention = Some(*conv);
                ret = stripped.trim_end();
                break;
            }
        }
    }

    if ret.is_empty() {
        return Err(invalid("missing return type"));
    }

    let mut params = Vec::new();
    let mut variadic = false;
    let inner = inner.trim();

    if !inner.is_empty() && inner != "void" {
        let pieces: Vec<&str> = inner.split(',').map(str::trim).collect();
        for (i, piece) in pieces.iter().enumerate() {
            if *piece == "..." {
                if i + 1 != pieces.len() {
                    return Err(invalid("'...' must be the last parameter"));
                }
                variadic = true;
                continue;
            }
            if piece.is_empty() {
                return Err(invalid("empty parameter"));
            }
            params.push(parse_param(piece));
        }
    }

    Ok(ParsedPrototype {
        ret: ret.to_string(),
        name: name.to_string(),
        params,
        variadic,
        convention,
    })
}

fn parse_param(text: &str) -> ParsedParam {
    const MARKERS: [(&str, Direction); 3] = [
        ("_In_", Direction::In),
        ("_Out_", Direction::Out),
        ("_Inout_", Direction::InOut),
    ];

    for (marker, direction) in MARKERS {
        if let Some(rest) = text.strip_prefix(marker) {
            if rest.starts_with(char::is_whitespace) {
                return ParsedParam {
                    text: rest.trim().to_string(),
                    direction,
                };
            }
        }
    }

    ParsedParam {
        text: text.to_string(),
        direction: Direction::In,
    }
}

/// Drop a trailing parameter name: `"const char *fmt"` -> `"const char *"`
pub(crate) fn strip_param_name(text: &str) -> Option<&str> {
    let trimmed = text.trim_end();
    let start = trimmed
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident_char(*c))
        .last()
        .map(|(i, _)| i)?;

    let head = trimmed[..start].trim_end();
    if head.is_empty() {
        None
    } else {
        Some(head)
    }
}
