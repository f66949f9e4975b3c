use thiserror::Error;

// `REPLACE` stays allowed: as a statement it fails the leading-keyword check,
// inside a SELECT it is the string function.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX",
];

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QueryRejection {
    #[error("no query was produced")]
    Empty,
    #[error("only a single statement is allowed")]
    MultipleStatements,
    #[error("query must start with SELECT or WITH, found `{0}`")]
    NotARead(String),
    #[error("query uses forbidden keyword `{0}`")]
    ForbiddenKeyword(&'static str),
}

impl QueryRejection {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Empty => "empty_query",
            Self::MultipleStatements => "multiple_statements",
            Self::NotARead(_) => "not_a_read",
            Self::ForbiddenKeyword(_) => "forbidden_keyword",
        }
    }
}

/// Pulls the SQL out of a model reply: code fences, a leading `SQLQuery:` label,
/// and trailing semicolons are dropped.
pub fn extract_sql(reply: &str) -> String {
    let mut text = reply.trim();

    if let Some(start) = text.find("```") {
        let after_fence = &text[start + 3..];
        let body_start = after_fence.find('\n').map(|index| index + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        text = body.find("```").map(|end| &body[..end]).unwrap_or(body);
    }

    let text = text.trim();
    let text = text
        .strip_prefix("SQLQuery:")
        .or_else(|| text.strip_prefix("SQL:"))
        .unwrap_or(text)
        .trim();

    text.trim_end_matches(|ch: char| ch == ';' || ch.is_whitespace()).to_string()
}

/// Accepts a single read-only statement and returns it normalized by [`extract_sql`].
pub fn validate_read_only(reply: &str) -> Result<String, QueryRejection> {
    let sql = extract_sql(reply);
    let scrubbed = scrub_literals_and_comments(&sql);
    let scrubbed = scrubbed.trim().trim_end_matches(|ch: char| ch == ';' || ch.is_whitespace());

    if scrubbed.is_empty() {
        return Err(QueryRejection::Empty);
    }
    if scrubbed.contains(';') {
        return Err(QueryRejection::MultipleStatements);
    }

    let mut words = scrubbed
        .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase);

    let first = words.next().unwrap_or_default();
    if first != "SELECT" && first != "WITH" {
        return Err(QueryRejection::NotARead(first));
    }

    for word in words {
        if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|keyword| **keyword == word) {
            return Err(QueryRejection::ForbiddenKeyword(*keyword));
        }
    }

    Ok(sql)
}

/// Blanks out comments and quoted text so keyword checks only see SQL structure.
fn scrub_literals_and_comments(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        output.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                output.push(' ');
            }
            '\'' | '"' | '`' => {
                let quote = ch;
                loop {
                    match chars.next() {
                        Some(next) if next == quote => {
                            if chars.peek() == Some(&quote) {
                                chars.next();
                                continue;
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
                output.push_str(" x ");
            }
            other => output.push(other),
        }
    }

    output
}
