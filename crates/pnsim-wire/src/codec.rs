//! Token payload codec
//!
//! Format: `<typename>:<value>`, several tokens joined by `&`.
//! Tuples nest as `tuple:[<token>, <token>]`. Booleans are the literals
//! `True` and `False`. Inside string values the delimiters `% & , [ ]`
//! are percent-escaped so they cannot split the payload.

use pnsim_core::{SimError, SimResult, Token, TokenKind};

/// Separator between tokens of one message
pub const TOKEN_SEPARATOR: char = '&';

const ESCAPED: [(char, &str); 5] = [
    ('%', "%25"),
    ('&', "%26"),
    (',', "%2C"),
    ('[', "%5B"),
    (']', "%5D"),
];

/// Encode a single token
pub fn encode_token(token: &Token) -> String {
    let mut out = String::new();
    write_token(token, &mut out);
    out
}

fn write_token(token: &Token, out: &mut String) {
    out.push_str(token.kind().type_name());
    out.push(':');
    match token {
        Token::Bool(true) => out.push_str("True"),
        Token::Bool(false) => out.push_str("False"),
        Token::Int(i) => out.push_str(&i.to_string()),
        Token::Float(v) => out.push_str(&format!("{:?}", v)),
        Token::Str(s) => escape_into(s, out),
        Token::Tuple(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_token(item, out);
            }
            out.push(']');
        }
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match ESCAPED.iter().find(|(raw, _)| *raw == c) {
            Some((_, code)) => out.push_str(code),
            None => out.push(c),
        }
    }
}

fn unescape(s: &str) -> SimResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos..pos + 3)
            .ok_or_else(|| SimError::Decode(format!("truncated escape in {:?}", s)))?;
        let (raw, _) = ESCAPED
            .iter()
            .find(|(_, known)| known.eq_ignore_ascii_case(code))
            .ok_or_else(|| SimError::Decode(format!("unknown escape {} in {:?}", code, s)))?;
        out.push(*raw);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Decode a single token
pub fn decode_token(s: &str) -> SimResult<Token> {
    let (type_name, value) = s
        .split_once(':')
        .ok_or_else(|| SimError::Decode(format!("missing type in {:?}", s)))?;
    let kind = TokenKind::from_type_name(type_name)
        .ok_or_else(|| SimError::Decode(format!("unknown type {:?}", type_name)))?;
    match kind {
        TokenKind::Bool => match value {
            "True" => Ok(Token::Bool(true)),
            "False" => Ok(Token::Bool(false)),
            other => Err(SimError::Decode(format!("invalid bool {:?}", other))),
        },
        TokenKind::Int => value
            .parse()
            .map(Token::Int)
            .map_err(|e| SimError::Decode(format!("invalid int {:?}: {}", value, e))),
        TokenKind::Float => value
            .parse()
            .map(Token::Float)
            .map_err(|e| SimError::Decode(format!("invalid float {:?}: {}", value, e))),
        TokenKind::Str => unescape(value).map(Token::Str),
        TokenKind::Tuple => {
            let inner = value
                .strip_prefix('[')
                .and_then(|v| v.strip_suffix(']'))
                .ok_or_else(|| SimError::Decode(format!("invalid tuple {:?}", value)))?;
            split_elements(inner)?
                .into_iter()
                .map(decode_token)
                .collect::<SimResult<Vec<_>>>()
                .map(Token::Tuple)
        }
    }
}

/// Split tuple contents at top-level `, ` separators
fn split_elements(inner: &str) -> SimResult<Vec<&str>> {
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SimError::Decode(format!("unbalanced brackets in {:?}", inner)))?;
            }
            ',' if depth == 0 => {
                parts.push(&inner[start..i]);
                start = i + 1;
                if inner[start..].starts_with(' ') {
                    start += 1;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SimError::Decode(format!("unbalanced brackets in {:?}", inner)));
    }
    parts.push(&inner[start..]);
    Ok(parts)
}

/// Encode the body of a data message
pub fn encode_tokens<'a, I>(tokens: I) -> String
where
    I: IntoIterator<Item = &'a Token>,
{
    let mut out = String::new();
    for (i, token) in tokens.into_iter().enumerate() {
        if i > 0 {
            out.push(TOKEN_SEPARATOR);
        }
        write_token(token, &mut out);
    }
    out
}

/// Decode the body of a data message; an empty body carries no tokens
pub fn decode_tokens(payload: &str) -> SimResult<Vec<Token>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    payload.split(TOKEN_SEPARATOR).map(decode_token).collect()
}
