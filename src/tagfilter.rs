//! Tag-based content filtering.
//!
//! Messages and documents can carry markup such as `<content>...</content>`;
//! a tag expression selects which regions of a text survive into
//! vectorization. Expressions use the form `MAIN - EXCLUDE1,EXCLUDE2`: the
//! main tag selects blocks, each exclude removes sub-regions from them
//! (either a literal sub-tag or a `/pattern/flags` regex). Extraction is
//! best-effort: malformed expressions are recorded as diagnostics and
//! skipped, and a text that matches no expression passes through unchanged.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// A parsed `MAIN - EX1,EX2` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagExpression {
    pub main: String,
    pub excludes: Vec<String>,
}

/// A non-fatal problem encountered while applying one expression.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub expression: String,
    pub message: String,
}

/// Result of one extraction pass.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Splits an expression into its main tag and exclude tokens. Without a
/// ` - ` separator the whole (trimmed) input is the main tag.
pub fn parse_tag_expression(expr: &str) -> TagExpression {
    match expr.split_once(" - ") {
        Some((main, excludes)) => TagExpression {
            main: main.trim().to_string(),
            excludes: excludes
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        },
        None => TagExpression {
            main: expr.trim().to_string(),
            excludes: Vec::new(),
        },
    }
}

pub struct TagFilter {
    /// Lowercased blacklist keywords.
    blacklist: Vec<String>,
}

impl TagFilter {
    pub fn new(blacklist: &[String]) -> Self {
        Self {
            blacklist: blacklist
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Applies every expression to `text` and concatenates the surviving
    /// blocks.
    ///
    /// Fail-open: if no expression matches anything (or none are given) the
    /// original text is returned unchanged. If expressions matched but every
    /// block was blacklisted away, the result is empty.
    pub fn extract(&self, text: &str, expressions: &[String]) -> Extraction {
        let mut diagnostics = Vec::new();
        if expressions.is_empty() {
            return Extraction {
                text: text.to_string(),
                diagnostics,
            };
        }

        let mut matched_any = false;
        let mut blocks: Vec<String> = Vec::new();

        for expr in expressions {
            let parsed = parse_tag_expression(expr);
            if parsed.main.is_empty() {
                continue;
            }
            let (pattern, balance_name) = match build_main_pattern(&parsed.main) {
                Ok(built) => built,
                Err(message) => {
                    tracing::warn!("Skipping tag expression {:?}: {}", expr, message);
                    diagnostics.push(Diagnostic {
                        expression: expr.clone(),
                        message,
                    });
                    continue;
                }
            };
            if let Some(name) = &balance_name {
                check_tag_balance(text, name);
            }

            for captures in pattern.captures_iter(text) {
                let Some(inner) = captures.get(1) else {
                    continue;
                };
                matched_any = true;
                let mut block = inner.as_str().to_string();
                for exclude in &parsed.excludes {
                    match apply_exclude(&block, exclude) {
                        Ok(stripped) => block = stripped,
                        Err(message) => {
                            diagnostics.push(Diagnostic {
                                expression: expr.clone(),
                                message,
                            });
                        }
                    }
                }
                let block = normalize_whitespace(&block);
                if block.is_empty() {
                    continue;
                }
                if self.is_blacklisted(&block) {
                    tracing::debug!("Dropping blacklisted block ({} chars)", block.len());
                    continue;
                }
                blocks.push(block);
            }
        }

        if !matched_any {
            return Extraction {
                text: text.to_string(),
                diagnostics,
            };
        }

        Extraction {
            text: blocks.join("\n\n"),
            diagnostics,
        }
    }

    fn is_blacklisted(&self, block: &str) -> bool {
        if self.blacklist.is_empty() {
            return false;
        }
        let lower = block.to_lowercase();
        self.blacklist.iter().any(|k| lower.contains(k))
    }
}

/// Builds the capture regex for a main tag. Three shapes are recognized:
/// `START,ENDTAG` (everything between a literal start pattern and the end
/// tag's closing delimiter), `<name ...>` (html pair with attribute
/// tolerance), and a bare name (plain `<name>...</name>` pair).
fn build_main_pattern(main: &str) -> Result<(Regex, Option<String>), String> {
    if let Some((start, end)) = main.split_once(',') {
        let start = start.trim();
        let end = end.trim();
        if start.is_empty() || end.is_empty() {
            return Err("complex tag expression needs both a start pattern and an end tag".into());
        }
        let end_name = end
            .trim_start_matches("</")
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();
        if end_name.is_empty() {
            return Err(format!("unparseable end tag {:?}", end));
        }
        let pattern = format!(
            "(?is){}(.*?)</{}>",
            regex::escape(start),
            regex::escape(end_name)
        );
        let compiled = Regex::new(&pattern).map_err(|e| e.to_string())?;
        return Ok((compiled, None));
    }

    if main.starts_with('<') {
        let name_re = tag_name_pattern();
        let name = name_re
            .captures(main)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| format!("unparseable tag {:?}", main))?;
        let escaped = regex::escape(name);
        let pattern = format!("(?is)<{escaped}(?:\\s[^>]*)?>(.*?)</{escaped}\\s*>");
        let compiled = Regex::new(&pattern).map_err(|e| e.to_string())?;
        return Ok((compiled, Some(name.to_string())));
    }

    let escaped = regex::escape(main);
    let pattern = format!("(?is)<{escaped}>(.*?)</{escaped}>");
    let compiled = Regex::new(&pattern).map_err(|e| e.to_string())?;
    Ok((compiled, None))
}

/// Reports (but does not fail on) unbalanced open/close counts for an html
/// or simple tag in `text`.
pub fn check_tag_balance(text: &str, name: &str) {
    let escaped = regex::escape(name);
    let open = Regex::new(&format!("(?i)<{escaped}(?:\\s[^>]*)?>")).ok();
    let close = Regex::new(&format!("(?i)</{escaped}\\s*>")).ok();
    if let (Some(open), Some(close)) = (open, close) {
        let opens = open.find_iter(text).count();
        let closes = close.find_iter(text).count();
        if opens != closes {
            tracing::warn!(
                "Unbalanced <{}> tags: {} opening, {} closing",
                name,
                opens,
                closes
            );
        }
    }
}

/// Removes one exclude rule from a block. `/pattern/flags` rules substitute
/// the pattern away; literal rules remove matching sub-tag pairs.
fn apply_exclude(block: &str, exclude: &str) -> Result<String, String> {
    if let Some(regex) = parse_regex_rule(exclude) {
        let regex = regex?;
        return Ok(regex.replace_all(block, "").into_owned());
    }
    let name = exclude
        .trim_start_matches("</")
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if name.is_empty() {
        return Err(format!("empty exclude tag {:?}", exclude));
    }
    let escaped = regex::escape(name);
    let pattern = format!("(?is)<{escaped}(?:\\s[^>]*)?>.*?</{escaped}\\s*>");
    let regex = Regex::new(&pattern).map_err(|e| e.to_string())?;
    Ok(regex.replace_all(block, "").into_owned())
}

/// Detects and compiles a `/pattern/flags` exclude rule. Returns `None` for
/// literal rules.
fn parse_regex_rule(token: &str) -> Option<Result<Regex, String>> {
    let token = token.trim();
    if !token.starts_with('/') || token.len() < 2 {
        return None;
    }
    let closing = token.rfind('/')?;
    if closing == 0 {
        return None;
    }
    let pattern = &token[1..closing];
    let flags: String = token[closing + 1..]
        .chars()
        .filter(|c| matches!(c, 'i' | 's' | 'm' | 'x' | 'u' | 'U'))
        .collect();
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    Some(Regex::new(&full).map_err(|e| format!("invalid exclude regex {:?}: {}", token, e)))
}

fn tag_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<\s*([A-Za-z][\w.:-]*)").unwrap())
}

/// Collapses runs of 3+ newlines to 2, strips whitespace around newlines
/// and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    static AROUND_NEWLINE: OnceLock<Regex> = OnceLock::new();
    static MANY_NEWLINES: OnceLock<Regex> = OnceLock::new();
    let around = AROUND_NEWLINE.get_or_init(|| Regex::new(r"[ \t]*\n[ \t]*").unwrap());
    let many = MANY_NEWLINES.get_or_init(|| Regex::new(r"\n{3,}").unwrap());

    let collapsed = around.replace_all(text, "\n");
    let collapsed = many.replace_all(&collapsed, "\n\n");
    collapsed.trim().to_string()
}
