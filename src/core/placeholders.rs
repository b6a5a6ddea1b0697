/// Placeholder rewriting between named `@name` markers and positional markers
///
/// Callers may write either `@name` markers or plain `?` markers. Drivers only
/// understand positional markers, so the statement is rewritten and the
/// parameters are reordered to match. Markers inside string literals, quoted
/// identifiers and comments are left alone, as are `@@SYSTEM` variables.

use super::QueryParam;
use crate::error::{PuenteError, PuenteResult};

/// Positional marker flavour understood by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (ODBC, MySQL, SQLite)
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

impl PlaceholderStyle {
    /// Pick the marker flavour for a sqlx connection URL
    pub fn for_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            PlaceholderStyle::Dollar
        } else {
            PlaceholderStyle::Question
        }
    }
}

/// A statement rewritten to positional markers with its ordered parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSql {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Rewrite `sql` to positional markers in `style`
pub fn bind_positional(
    sql: &str,
    params: &[QueryParam],
    style: PlaceholderStyle,
) -> PuenteResult<BoundSql> {
    if style == PlaceholderStyle::Question && !sql.contains('@') {
        return Ok(BoundSql {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut ordered: Vec<QueryParam> = Vec::with_capacity(params.len());
    let mut positional_cursor = 0usize;
    let mut markers = 0usize;
    let mut copied_from = 0usize;
    let mut i = 0usize;

    let emit = |out: &mut String, ordered: &mut Vec<QueryParam>, param: &QueryParam| {
        ordered.push(param.clone());
        match style {
            PlaceholderStyle::Question => out.push('?'),
            PlaceholderStyle::Dollar => out.push_str(&format!("${}", ordered.len())),
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b'@' if bytes.get(i + 1) == Some(&b'@') => {
                i += 2;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
            }
            b'@' if bytes.get(i + 1).map_or(false, |b| b.is_ascii_alphabetic() || *b == b'_') => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident_byte(bytes[end]) {
                    end += 1;
                }
                let name = &sql[start..end];
                let param = params
                    .iter()
                    .find(|p| p.bare_name().eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        PuenteError::validation(format!("no parameter supplied for @{}", name))
                    })?;

                out.push_str(&sql[copied_from..i]);
                emit(&mut out, &mut ordered, param);
                markers += 1;
                copied_from = end;
                i = end;
            }
            b'?' => {
                let param = params.get(positional_cursor).ok_or_else(|| {
                    PuenteError::validation(format!(
                        "statement has more positional markers than the {} parameters supplied",
                        params.len()
                    ))
                })?;
                positional_cursor += 1;

                out.push_str(&sql[copied_from..i]);
                emit(&mut out, &mut ordered, param);
                markers += 1;
                i += 1;
                copied_from = i;
            }
            _ => i += 1,
        }
    }

    if markers == 0 {
        return Ok(BoundSql {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    out.push_str(&sql[copied_from.min(sql.len())..]);
    Ok(BoundSql { sql: out, params: ordered })
}
