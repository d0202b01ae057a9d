//! Structural helpers over generated query strings.
//!
//! These only understand the shape this crate emits:
//! `SELECT <fields> FROM <Object> [WHERE ...] [ORDER BY ...] [LIMIT n]`.
//! Keyword matching skips quoted literals and parenthesized groups.

use crate::error::{MigrateError, Result};

/// A query split into its select list, object type and trailing clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParts {
    pub select_list: String,
    pub object_type: String,
    /// Everything after the object type (WHERE / ORDER BY / LIMIT), trimmed.
    pub rest: String,
}

/// Split a query into its parts.
pub fn split_query(query: &str) -> Result<QueryParts> {
    let trimmed = query.trim();
    if !starts_with_ci(trimmed, "SELECT ") {
        return Err(MigrateError::Config(format!(
            "Not a SELECT query: {:?}",
            query
        )));
    }
    let from = top_level_keyword_positions(trimmed, "FROM")
        .into_iter()
        .next()
        .ok_or_else(|| MigrateError::Config(format!("Query has no FROM clause: {:?}", query)))?;

    let select_list = trimmed[7..from].trim().to_string();
    let after_from = trimmed[from + 4..].trim_start();
    let (object_type, rest) = match after_from.find(char::is_whitespace) {
        Some(idx) => (&after_from[..idx], after_from[idx..].trim()),
        None => (after_from, ""),
    };
    if object_type.is_empty() || select_list.is_empty() {
        return Err(MigrateError::Config(format!("Malformed query: {:?}", query)));
    }

    Ok(QueryParts {
        select_list,
        object_type: object_type.to_string(),
        rest: rest.to_string(),
    })
}

/// Replace only the select list, keeping every other clause verbatim.
pub fn replace_select_list<S: AsRef<str>>(query: &str, fields: &[S]) -> Result<String> {
    let parts = split_query(query)?;
    let fields: Vec<&str> = fields.iter().map(|f| f.as_ref()).collect();
    Ok(compose(&fields.join(", "), &parts.object_type, &parts.rest))
}

/// Reassemble a query from a select list, object type and trailing clauses.
pub fn compose(select_list: &str, object_type: &str, rest: &str) -> String {
    if rest.is_empty() {
        format!("SELECT {} FROM {}", select_list, object_type)
    } else {
        format!("SELECT {} FROM {} {}", select_list, object_type, rest)
    }
}

/// The WHERE body of a query, without ORDER BY / LIMIT / OFFSET.
pub fn where_clause(query: &str) -> Result<Option<String>> {
    let parts = split_query(query)?;
    let rest = parts.rest.as_str();
    if !starts_with_ci(rest, "WHERE ") {
        return Ok(None);
    }
    let body = &rest[6..];
    let end = ["ORDER", "GROUP", "LIMIT", "OFFSET"]
        .iter()
        .filter_map(|kw| top_level_keyword_positions(body, kw).into_iter().next())
        .min()
        .unwrap_or(body.len());
    let body = body[..end].trim();
    Ok((!body.is_empty()).then(|| body.to_string()))
}

/// Split an expression on top-level `AND`.
pub fn split_conjuncts(expr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for pos in top_level_keyword_positions(expr, "AND") {
        out.push(expr[start..pos].trim().to_string());
        start = pos + 3;
    }
    out.push(expr[start..].trim().to_string());
    out.retain(|s| !s.is_empty());
    out
}

/// Parenthesize an expression that has a top-level `OR`.
pub fn group(expr: &str) -> String {
    let expr = expr.trim();
    if top_level_keyword_positions(expr, "OR").is_empty() {
        expr.to_string()
    } else {
        format!("({})", expr)
    }
}

/// Field name a simple condition starts with, e.g. `RuleId` for `RuleId IN (...)`.
pub fn leading_field(condition: &str) -> Option<&str> {
    let condition = condition.trim().trim_start_matches('(').trim_start();
    let end = condition
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(condition.len());
    let field = &condition[..end];
    (!field.is_empty()).then_some(field)
}

/// Byte offsets of `keyword` occurrences outside quotes and parentheses.
fn top_level_keyword_positions(s: &str, keyword: &str) -> Vec<usize> {
    let bytes = s.as_bytes();
    let kw = keyword.as_bytes();
    let mut positions = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            match b {
                b'\\' => i += 1,
                b'\'' => in_quote = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' => in_quote = true,
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0
                && i + kw.len() <= bytes.len()
                && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw) =>
            {
                let before_ok = i == 0 || is_boundary(bytes[i - 1]);
                let after_ok = i + kw.len() == bytes.len() || is_boundary(bytes[i + kw.len()]);
                if before_ok && after_ok {
                    positions.push(i);
                    i += kw.len();
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    positions
}

fn starts_with_ci(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

fn is_boundary(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'(' || b == b')'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_query() {
        let parts =
            split_query("SELECT Id, Name FROM Rule WHERE Active = true ORDER BY Name").unwrap();
        assert_eq!(parts.select_list, "Id, Name");
        assert_eq!(parts.object_type, "Rule");
        assert_eq!(parts.rest, "WHERE Active = true ORDER BY Name");
    }

    #[test]
    fn test_split_query_ignores_from_in_literal() {
        let parts = split_query("SELECT Id FROM Rule WHERE Name = 'FROM here'").unwrap();
        assert_eq!(parts.object_type, "Rule");
        assert_eq!(parts.rest, "WHERE Name = 'FROM here'");
    }

    #[test]
    fn test_replace_select_list_preserves_clauses() {
        let query = "SELECT Id, Name FROM Rule WHERE Id IN ('s1') ORDER BY Name LIMIT 10";
        let replaced = replace_select_list(query, &["Id", "Name", "Active", "CreatedDate"]).unwrap();
        assert_eq!(
            replaced,
            "SELECT Id, Name, Active, CreatedDate FROM Rule WHERE Id IN ('s1') ORDER BY Name LIMIT 10"
        );
    }

    #[test]
    fn test_where_clause() {
        assert_eq!(
            where_clause("SELECT Id FROM Rule WHERE A = 1 AND B = 'x' ORDER BY Name LIMIT 5")
                .unwrap()
                .as_deref(),
            Some("A = 1 AND B = 'x'")
        );
        assert_eq!(where_clause("SELECT Id FROM Rule").unwrap(), None);
        assert_eq!(
            where_clause("SELECT Id FROM Rule LIMIT 5").unwrap(),
            None
        );
    }

    #[test]
    fn test_split_conjuncts_respects_groups_and_quotes() {
        let parts = split_conjuncts("A = 1 AND (B = 2 AND C = 3) and D = 'x AND y'");
        assert_eq!(parts, vec!["A = 1", "(B = 2 AND C = 3)", "D = 'x AND y'"]);
    }

    #[test]
    fn test_split_conjuncts_word_boundaries() {
        let parts = split_conjuncts("Brand = 'x' AND Android__c = true");
        assert_eq!(parts, vec!["Brand = 'x'", "Android__c = true"]);
    }

    #[test]
    fn test_group() {
        assert_eq!(group("A = 1 OR B = 2"), "(A = 1 OR B = 2)");
        assert_eq!(group("A = 1"), "A = 1");
        assert_eq!(group("(A = 1 OR B = 2)"), "(A = 1 OR B = 2)");
    }

    #[test]
    fn test_leading_field() {
        assert_eq!(leading_field("RuleId IN ('s1')"), Some("RuleId"));
        assert_eq!(leading_field("(Rule.Name = 'x')"), Some("Rule.Name"));
        assert_eq!(leading_field("  "), None);
    }

    #[test]
    fn test_not_a_select() {
        assert!(split_query("DELETE FROM Rule").is_err());
        assert!(split_query("SELECT Id").is_err());
    }
}
