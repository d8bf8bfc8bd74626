//! `$n` placeholder binding for parameterized view definitions.
//!
//! View DDL is a utility statement and cannot take protocol-level bind
//! parameters, so params are rendered as SQL literals. Placeholders inside
//! string literals, quoted identifiers, comments and dollar-quoted bodies are
//! left untouched.

use crate::definition::SqlParam;

/// Render `params` into the `$n` placeholders of `sql`
pub fn bind_params(sql: &str, params: Option<&[SqlParam]>) -> Result<String, String> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' | b'"' => {
                let backslash_escapes = c == b'\'' && is_escape_string(bytes, i);
                let end = quoted_end(bytes, i, c, backslash_escapes);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map_or(bytes.len(), |p| i + p);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 && !preceded_by_ident(bytes, i) {
                    let position: usize = sql[i + 1..i + 1 + digits]
                        .parse()
                        .map_err(|_| format!("placeholder '{}' is out of range", &sql[i..i + 1 + digits]))?;
                    let param = lookup(params, position)?;
                    out.push_str(&render_literal(param));
                    i += 1 + digits;
                } else if let Some(end) = dollar_quoted_end(sql, i) {
                    out.push_str(&sql[i..end]);
                    i = end;
                } else {
                    out.push('$');
                    i += 1;
                }
            }
            _ => {
                let ch_len = sql[i..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&sql[i..i + ch_len]);
                i += ch_len;
            }
        }
    }

    Ok(out)
}

fn lookup(params: Option<&[SqlParam]>, position: usize) -> Result<&SqlParam, String> {
    let params = params.ok_or_else(|| format!("placeholder ${position} used but no params were given"))?;
    if position == 0 || position > params.len() {
        return Err(format!(
            "placeholder ${position} has no matching param ({} given)",
            params.len()
        ));
    }
    Ok(&params[position - 1])
}

/// `$1` inside `col$1` is part of an identifier
fn preceded_by_ident(bytes: &[u8], i: usize) -> bool {
    i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_')
}

/// `E'...'` or `e'...'`, where `\` escapes the next byte
fn is_escape_string(bytes: &[u8], quote_at: usize) -> bool {
    quote_at > 0 && matches!(bytes[quote_at - 1], b'E' | b'e') && !preceded_by_ident(bytes, quote_at - 1)
}

/// Index just past the closing quote; doubled quotes are escapes
fn quoted_end(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if backslash_escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$tag$ ... $tag$` starting at `start`, if that is what's there
fn dollar_quoted_end(sql: &str, start: usize) -> Option<usize> {
    let rest = &sql[start + 1..];
    let tag_len = rest.find('$')?;
    let tag = &rest[..tag_len];
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') || tag.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let delimiter = &sql[start..start + tag_len + 2];
    let body_start = start + delimiter.len();
    let close = sql[body_start..].find(delimiter)?;
    Some(body_start + close + delimiter.len())
}

/// SQL literal for one param
///
/// Negative numbers are parenthesized so `10-$1` cannot become `10--5`.
pub fn render_literal(param: &SqlParam) -> String {
    match param {
        SqlParam::Null => "NULL".to_string(),
        SqlParam::Bool(true) => "TRUE".to_string(),
        SqlParam::Bool(false) => "FALSE".to_string(),
        SqlParam::Int(v) if *v < 0 => format!("({v})"),
        SqlParam::Int(v) => v.to_string(),
        SqlParam::Float(v) if v.is_finite() && v.is_sign_negative() => format!("({v:?})"),
        SqlParam::Float(v) if v.is_finite() => format!("{v:?}"),
        SqlParam::Float(v) => format!("'{v}'::float8"),
        SqlParam::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}
