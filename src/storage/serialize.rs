//! Compacting Serializer
//!
//! JSON with two reversible size tweaks: object keys made only of word
//! characters lose their quotes, and runs of four or more identical
//! `0` / `"00:00:00"` array elements collapse to `token(count)`.
//!
//! Both directions work on a token stream that keeps string literals
//! opaque, so string contents are never rewritten.

use std::fmt::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// Scalars eligible for run collapsing.
const RUN_TOKENS: [&str; 2] = ["0", "\"00:00:00\""];

/// Shortest run that gets collapsed.
const MIN_RUN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Punct(char),
    /// String literal, quotes included
    Str(&'a str),
    /// Number, literal or unquoted key
    Bare(&'a str),
    /// `token(count)` marker
    Run(&'a str, usize),
}

impl<'a> Token<'a> {
    fn raw(&self) -> Option<&'a str> {
        match *self {
            Token::Str(raw) | Token::Bare(raw) => Some(raw),
            _ => None,
        }
    }
}

/// Encodes a value into its compacted text form.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let tokens = tokenize(&json, false)?;
    let mut out = String::with_capacity(json.len());

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        match token {
            Token::Punct(c) => out.push(c),
            Token::Str(raw) if is_key(&tokens, i) && is_word(unquote(raw)) => {
                out.push_str(unquote(raw));
            }
            Token::Str(raw) | Token::Bare(raw) if RUN_TOKENS.contains(&raw) => {
                let mut last = i;
                let mut count = 1;
                while tokens.get(last + 1) == Some(&Token::Punct(','))
                    && tokens.get(last + 2) == Some(&token)
                {
                    count += 1;
                    last += 2;
                }

                if count >= MIN_RUN {
                    let _ = write!(out, "{}({})", raw, count);
                    i = last + 1;
                    continue;
                }
                out.push_str(raw);
            }
            Token::Str(raw) | Token::Bare(raw) => out.push_str(raw),
            Token::Run(raw, count) => {
                let _ = write!(out, "{}({})", raw, count);
            }
        }
        i += 1;
    }

    Ok(out)
}

/// Decodes text produced by [`serialize`].
pub fn deserialize<T: DeserializeOwned>(text: &str) -> Result<T> {
    let tokens = tokenize(text, true)?;
    let mut json = String::with_capacity(text.len() * 2);

    for (i, token) in tokens.iter().enumerate() {
        match *token {
            Token::Punct(c) => json.push(c),
            Token::Bare(raw) if is_key(&tokens, i) => {
                json.push('"');
                json.push_str(raw);
                json.push('"');
            }
            Token::Str(raw) | Token::Bare(raw) => json.push_str(raw),
            Token::Run(raw, count) => {
                if !RUN_TOKENS.contains(&raw) || count == 0 {
                    return Err(CacheError::Malformed(format!(
                        "unexpected run marker {}({})",
                        raw, count
                    )));
                }
                for n in 0..count {
                    if n > 0 {
                        json.push(',');
                    }
                    json.push_str(raw);
                }
            }
        }
    }

    Ok(serde_json::from_str(&json)?)
}

fn tokenize(text: &str, with_runs: bool) -> Result<Vec<Token<'_>>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'}' | b'[' | b']' | b',' | b':' => {
                tokens.push(Token::Punct(bytes[i] as char));
                i += 1;
            }
            b'"' => {
                let start = i;
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(CacheError::Malformed(
                                "unterminated string literal".to_string(),
                            ))
                        }
                        Some(b'\\') => i += 2,
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                tokens.push(Token::Str(&text[start..i]));
            }
            b if b.is_ascii_whitespace() => i += 1,
            _ => {
                let start = i;
                while i < bytes.len() && !is_delimiter(bytes[i]) {
                    i += 1;
                }
                if start == i {
                    return Err(CacheError::Malformed(format!(
                        "unexpected character at offset {}",
                        i
                    )));
                }
                tokens.push(Token::Bare(&text[start..i]));
            }
        }

        if with_runs && bytes.get(i) == Some(&b'(') {
            let close = text[i..]
                .find(')')
                .map(|offset| i + offset)
                .ok_or_else(|| CacheError::Malformed("unterminated run marker".to_string()))?;
            let count: usize = text[i + 1..close]
                .parse()
                .map_err(|_| CacheError::Malformed("run count is not a number".to_string()))?;
            let raw = tokens
                .pop()
                .and_then(|token| token.raw())
                .ok_or_else(|| CacheError::Malformed("run marker without a token".to_string()))?;
            tokens.push(Token::Run(raw, count));
            i = close + 1;
        }
    }

    Ok(tokens)
}

fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b'{' | b'}' | b'[' | b']' | b',' | b':' | b'"' | b'('
    ) || byte.is_ascii_whitespace()
}

fn is_key(tokens: &[Token<'_>], index: usize) -> bool {
    tokens.get(index + 1) == Some(&Token::Punct(':'))
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn unquote(raw: &str) -> &str {
    &raw[1..raw.len() - 1]
}
