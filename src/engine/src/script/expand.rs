//! Word splitting, quote removal and variable expansion.
//!
//! Operands are kept raw (quotes included) by the parser and processed at
//! execution time, when the values of ENV and ARG variables are known.
//! Supported forms: `$V`, `${V}`, `${V:-word}`, `${V-word}`, `${V:+word}`,
//! `${V+word}`. Nothing is expanded inside single quotes; the escape
//! character makes the next character literal.

use kiln_core::error::{BuildError, Result};

/// Split `input` on unquoted whitespace, keeping quotes and escapes in the
/// returned words.
pub fn split_words(input: &str, escape: char) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == escape && q == '"' {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None if c == escape => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if let Some(q) = quote {
        return Err(BuildError::ScriptInvalid(format!(
            "unterminated {} quote in '{}'",
            q, input
        )));
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// Expand variables in `raw` and remove its quotes.
pub fn process_word(
    raw: &str,
    escape: char,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<String> {
    let chars: Vec<char> = raw.chars().collect();
    let mut pos = 0;
    let out = process(&chars, &mut pos, escape, lookup, None)?;
    Ok(out)
}

/// Expand variables in `raw` without removing quotes. Used for free text
/// such as shell-form commands handed to the shell verbatim.
pub fn expand_only(
    raw: &str,
    escape: char,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<String> {
    let mut out = String::new();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    let mut single = false;
    let mut double = false;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' && !double {
            single = !single;
            out.push(c);
            i += 1;
        } else if c == '"' && !single {
            double = !double;
            out.push(c);
            i += 1;
        } else if c == escape && !single && i + 1 < chars.len() {
            out.push(c);
            out.push(chars[i + 1]);
            i += 2;
        } else if c == '$' && !single {
            i += 1;
            out.push_str(&variable(&chars, &mut i, escape, lookup)?);
        } else {
            out.push(c);
            i += 1;
        }
    }
    Ok(out)
}

/// Names of the variables referenced by `raw`, in order of first use.
pub fn referenced_vars(raw: &str, escape: char) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut record = |name: &str| -> Option<String> {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        None
    };
    let _ = expand_only(raw, escape, &mut record);
    names
}

/// Collapse runs of unquoted whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in s.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

fn process(
    chars: &[char],
    pos: &mut usize,
    escape: char,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
    stop: Option<char>,
) -> Result<String> {
    let mut out = String::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        if Some(c) == stop {
            return Ok(out);
        }
        *pos += 1;
        if c == escape {
            if let Some(&next) = chars.get(*pos) {
                out.push(next);
                *pos += 1;
            }
        } else if c == '\'' {
            loop {
                match chars.get(*pos) {
                    Some('\'') => {
                        *pos += 1;
                        break;
                    }
                    Some(&ch) => {
                        out.push(ch);
                        *pos += 1;
                    }
                    None => return Err(unterminated(chars, '\'')),
                }
            }
        } else if c == '"' {
            loop {
                match chars.get(*pos) {
                    Some('"') => {
                        *pos += 1;
                        break;
                    }
                    Some(&ch) if ch == escape => {
                        *pos += 1;
                        match chars.get(*pos) {
                            Some(&n) if n == '"' || n == '$' || n == escape => {
                                out.push(n);
                                *pos += 1;
                            }
                            _ => out.push(ch),
                        }
                    }
                    Some('$') => {
                        *pos += 1;
                        out.push_str(&variable(chars, pos, escape, lookup)?);
                    }
                    Some(&ch) => {
                        out.push(ch);
                        *pos += 1;
                    }
                    None => return Err(unterminated(chars, '"')),
                }
            }
        } else if c == '$' {
            out.push_str(&variable(chars, pos, escape, lookup)?);
        } else {
            out.push(c);
        }
    }
    if let Some(stop) = stop {
        return Err(BuildError::ScriptInvalid(format!(
            "missing '{}' in '{}'",
            stop,
            chars.iter().collect::<String>()
        )));
    }
    Ok(out)
}

/// Parse the variable after a `$` at `pos` and return its expansion.
fn variable(
    chars: &[char],
    pos: &mut usize,
    escape: char,
    lookup: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<String> {
    match chars.get(*pos) {
        Some('{') => {
            *pos += 1;
            let name = name_at(chars, pos);
            if name.is_empty() {
                return Err(bad_substitution(chars));
            }
            match chars.get(*pos) {
                Some('}') => {
                    *pos += 1;
                    Ok(lookup(&name).unwrap_or_default())
                }
                Some(':') | Some('-') | Some('+') => {
                    let colon = chars[*pos] == ':';
                    if colon {
                        *pos += 1;
                    }
                    let op = match chars.get(*pos) {
                        Some(&op) if op == '-' || op == '+' => op,
                        _ => return Err(bad_substitution(chars)),
                    };
                    *pos += 1;
                    let value = lookup(&name);
                    let word = process(chars, pos, escape, lookup, Some('}'))?;
                    *pos += 1;
                    let set = match &value {
                        Some(v) => !colon || !v.is_empty(),
                        None => false,
                    };
                    Ok(match (op, set) {
                        ('-', true) => value.unwrap_or_default(),
                        ('-', false) => word,
                        (_, true) => word,
                        (_, false) => String::new(),
                    })
                }
                _ => Err(bad_substitution(chars)),
            }
        }
        Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
            let name = name_at(chars, pos);
            Ok(lookup(&name).unwrap_or_default())
        }
        _ => Ok("$".to_string()),
    }
}

fn name_at(chars: &[char], pos: &mut usize) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.get(*pos) {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            *pos += 1;
        } else {
            break;
        }
    }
    name
}

fn unterminated(chars: &[char], quote: char) -> BuildError {
    BuildError::ScriptInvalid(format!(
        "unterminated {} quote in '{}'",
        quote,
        chars.iter().collect::<String>()
    ))
}

fn bad_substitution(chars: &[char]) -> BuildError {
    BuildError::ScriptInvalid(format!(
        "bad substitution in '{}'",
        chars.iter().collect::<String>()
    ))
}
