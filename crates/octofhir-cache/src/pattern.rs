//! Redis-style glob matching (`*`, `?`, `[abc]`, `[^a]`, `\x`) for keys held
//! in process.

use glob::Pattern;

/// Compiled KEYS pattern.
///
/// Redis syntax is rewritten for the glob parser: `[^a]` negates and `\x`
/// matches `x` literally. A class whose first member is a literal `!` still
/// reads as a negation here.
///
/// Patterns the glob parser rejects (e.g. an unclosed `[`) only match the
/// identical key, the same way Redis treats them as literals.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    compiled: Option<Pattern>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            compiled: Pattern::new(&to_glob_syntax(pattern)).ok(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.compiled {
            Some(pattern) => pattern.matches(key),
            None => self.raw == key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn to_glob_syntax(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            // glob has no escapes; a one-member class matches any char literally
            '\\' => match chars.next() {
                Some(escaped) if in_class => out.push(escaped),
                Some(escaped) => {
                    out.push('[');
                    out.push(escaped);
                    out.push(']');
                }
                None => out.push('\\'),
            },
            '[' if !in_class => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(']');
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        let p = KeyPattern::new("order:O1:*");
        assert!(p.matches("order:O1:items"));
        assert!(p.matches("order:O1:"));
        assert!(!p.matches("order:O2:items"));

        // `*` crosses separators, unlike path globs
        assert!(KeyPattern::new("patient:*").matches("patient:42/history/1"));
        assert!(KeyPattern::new("*").matches("anything"));
    }

    #[test]
    fn test_single_char_and_class() {
        assert!(KeyPattern::new("h?llo").matches("hello"));
        assert!(!KeyPattern::new("h?llo").matches("heello"));
        assert!(KeyPattern::new("h[ae]llo").matches("hallo"));
        assert!(!KeyPattern::new("h[ae]llo").matches("hillo"));
    }

    #[test]
    fn test_redis_negation_and_escapes() {
        let p = KeyPattern::new("h[^e]llo");
        assert!(p.matches("hallo"));
        assert!(!p.matches("hello"));

        let p = KeyPattern::new("report\\*");
        assert!(p.matches("report*"));
        assert!(!p.matches("report:2024"));

        assert!(KeyPattern::new("what\\?").matches("what?"));
        assert!(!KeyPattern::new("what\\?").matches("whats"));
        assert!(KeyPattern::new("h[\\]]llo").matches("h]llo"));
    }

    #[test]
    fn test_invalid_pattern_is_literal() {
        let p = KeyPattern::new("broken[");
        assert!(p.matches("broken["));
        assert!(!p.matches("broken"));
    }
}
