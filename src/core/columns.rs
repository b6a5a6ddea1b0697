/// Result column naming for legacy drivers
///
/// Legacy backends hand back upper-cased field names. The aliases declared in
/// the original select list are recovered here so callers get the casing they
/// wrote in their SQL.

use super::Row;
use std::collections::HashMap;

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'#'
}

fn keyword_at(bytes: &[u8], i: usize, keyword: &str) -> bool {
    let end = i + keyword.len();
    end <= bytes.len()
        && bytes[i..end].eq_ignore_ascii_case(keyword.as_bytes())
        && (i == 0 || !is_ident_byte(bytes[i - 1]))
        && (end == bytes.len() || !is_ident_byte(bytes[end]))
}

/// Byte offsets of `keyword` outside parentheses, quotes and brackets
fn top_level_keywords(s: &str, keyword: &str) -> Vec<usize> {
    let bytes = s.as_bytes();
    let mut found = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    for i in 0..bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'[' => quote = Some(b']'),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && keyword_at(bytes, i, keyword) => found.push(i),
            _ => {}
        }
    }
    found
}

/// Split on commas outside parentheses, quotes and brackets
fn split_top_level(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'[' => quote = Some(b']'),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn clean_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .or_else(|| trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        .or_else(|| trimmed.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .unwrap_or(trimmed);

    if unquoted.is_empty() || unquoted == "*" || !unquoted.bytes().all(is_ident_byte) {
        return None;
    }
    Some(unquoted.to_string())
}

fn strip_select_modifiers(item: &str) -> &str {
    let mut rest = item.trim_start();
    loop {
        let bytes = rest.as_bytes();
        if keyword_at(bytes, 0, "DISTINCT") {
            rest = rest["DISTINCT".len()..].trim_start();
        } else if keyword_at(bytes, 0, "ALL") {
            rest = rest["ALL".len()..].trim_start();
        } else if keyword_at(bytes, 0, "TOP") {
            rest = rest["TOP".len()..].trim_start();
            let skip = rest
                .find(|c: char| c.is_whitespace())
                .unwrap_or(rest.len());
            rest = rest[skip..].trim_start();
        } else {
            return rest;
        }
    }
}

fn alias_of(item: &str) -> Option<String> {
    let item = item.trim();

    if let Some(&pos) = top_level_keywords(item, "AS").last() {
        return clean_identifier(&item[pos + 2..]);
    }

    // `expr alias` without AS
    if let Some(split) = item.rfind(|c: char| c.is_whitespace()) {
        let (expr, alias) = item.split_at(split);
        let expr = expr.trim_end();
        let last_expr_byte = expr.as_bytes().last().copied().unwrap_or(b' ');
        let alias = alias.trim();
        let closes_expression = is_ident_byte(last_expr_byte)
            || matches!(last_expr_byte, b')' | b'\'' | b'"' | b']');
        if closes_expression && !alias.eq_ignore_ascii_case("END") {
            return clean_identifier(alias);
        }
        return None;
    }

    if item.contains('(') {
        return None;
    }
    clean_identifier(item.rsplit('.').next().unwrap_or(item))
}

/// Column aliases declared in the first select list of `sql`
pub fn declared_aliases(sql: &str) -> Vec<String> {
    let Some(&select) = top_level_keywords(sql, "SELECT").first() else {
        return Vec::new();
    };
    let list_start = select + "SELECT".len();
    let list_end = top_level_keywords(&sql[list_start..], "FROM")
        .first()
        .map(|offset| list_start + offset)
        .unwrap_or(sql.len());

    split_top_level(&sql[list_start..list_end])
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let item = if index == 0 {
                strip_select_modifiers(item)
            } else {
                item
            };
            alias_of(item)
        })
        .collect()
}

/// Re-key a row so that upper-cased driver columns carry their declared aliases
pub fn normalize_row(row: Row, aliases: &[String]) -> Row {
    if aliases.is_empty() {
        return row;
    }

    let by_upper: HashMap<String, &String> = aliases
        .iter()
        .map(|alias| (alias.to_ascii_uppercase(), alias))
        .collect();

    row.into_iter()
        .map(|(key, value)| {
            let key = by_upper
                .get(&key.to_ascii_uppercase())
                .map(|alias| (*alias).clone())
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}
