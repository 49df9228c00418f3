use regex::Regex;

pub const REDACTED: &str = "(redacted)";

/// Strips credentials from log messages before they are persisted.
#[derive(Debug)]
pub struct Redactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        // SAFETY: the patterns below are constant and known to compile.
        let compile = |p: &str| Regex::new(p).expect("built-in redaction pattern is valid");
        Self {
            patterns: vec![
                (
                    compile(r"(?i)(authorization:\s*basic)\s+[a-z0-9+/=]+"),
                    "${1} (redacted)",
                ),
                (
                    compile(r"(?i)\b(bearer)\s+[a-z0-9._~+/=-]+"),
                    "${1} (redacted)",
                ),
                (
                    compile(r"(?i)([a-z][a-z0-9+.-]*://[^:/\s@]+:)[^@\s]+@"),
                    "${1}(redacted)@",
                ),
                (
                    compile(
                        r#"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
                    ),
                    "${1}${2}(redacted)",
                ),
            ],
        }
    }

    /// Apply the built-in patterns, then scrub every literal in `secrets`.
    pub fn redact(&self, message: &str, secrets: &[String]) -> String {
        let mut out = message.to_string();
        for (re, replacement) in &self.patterns {
            out = re.replace_all(&out, *replacement).into_owned();
        }
        for secret in secrets.iter().filter(|s| !s.is_empty()) {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }
}
