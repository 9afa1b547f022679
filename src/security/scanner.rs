use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::config::settings::ScannerConfig;

/// One weighted detection pattern.
struct RiskPattern {
    name: &'static str,
    weight: u32,
    regex: Regex,
}

impl RiskPattern {
    fn new(name: &'static str, weight: u32, pattern: &str) -> Self {
        Self {
            name,
            weight,
            // Patterns are fixed at compile time; a typo is a programming
            // error, caught by the constructor test below.
            regex: Regex::new(pattern).expect("invalid risk pattern"),
        }
    }
}

/// Pattern-matching engine producing a numeric risk score for injection
/// and script content in structured payloads.
///
/// Scanning recursively walks strings, arrays, and objects (depth-bounded
/// to avoid cycles and decompression bombs) and sums weighted pattern
/// hits, a keyword blacklist, and a special-character density term.
pub struct RiskScanner {
    patterns: Vec<RiskPattern>,
    keywords: Vec<&'static str>,
    keyword_weight: u32,
    config: ScannerConfig,
}

impl RiskScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        let patterns = vec![
            RiskPattern::new("script_tag", 80, r"(?i)<\s*script[^>]*>"),
            RiskPattern::new("javascript_url", 35, r"(?i)javascript\s*:"),
            RiskPattern::new("event_handler", 30, r"(?i)\bon[a-z]+\s*="),
            RiskPattern::new("embed_tag", 35, r"(?i)<\s*(iframe|object|embed)\b"),
            RiskPattern::new("path_traversal", 25, r"\.\.[/\\]"),
            RiskPattern::new(
                "shell_command",
                25,
                r"(?i)\b(wget|curl|netcat|/bin/(?:ba)?sh|powershell)\b",
            ),
            RiskPattern::new("shell_metachars", 10, r"[;&|`]\s*[a-z/$]"),
            RiskPattern::new(
                "sql_cluster",
                45,
                r"(?i)\b(union\s+(all\s+)?select|select\s+[\w\*,\s]+\s+from|insert\s+into|drop\s+table|delete\s+from|update\s+\w+\s+set)\b",
            ),
            RiskPattern::new("sql_comment", 15, r"(--\s|/\*|\*/)"),
            RiskPattern::new("nosql_operator", 20, r"\$(where|ne|gt|lt|regex)\b"),
        ];

        let keywords = vec![
            "eval(",
            "exec(",
            "Function(",
            "setTimeout(",
            "setInterval(",
        ];

        Self {
            patterns,
            keywords,
            keyword_weight: 20,
            config: config.clone(),
        }
    }

    /// Whether `score` crosses the outright-rejection threshold.
    pub fn is_malicious(&self, score: u32) -> bool {
        score >= self.config.block_threshold
    }

    /// Score a structured payload by walking it recursively.
    pub fn score_value(&self, value: &Value) -> u32 {
        self.walk(value, 0)
    }

    /// Score a single string: weighted pattern hits, keyword blacklist,
    /// and a special-character density term.
    pub fn score_str(&self, text: &str) -> u32 {
        let mut score = 0;

        for pattern in &self.patterns {
            if pattern.regex.is_match(text) {
                debug!(pattern = pattern.name, "Risk pattern hit");
                score += pattern.weight;
            }
        }

        for keyword in &self.keywords {
            if text.contains(keyword) {
                score += self.keyword_weight;
            }
        }

        score += self.density_score(text);
        score
    }

    fn walk(&self, value: &Value, depth: u32) -> u32 {
        if depth > self.config.max_depth {
            return 0;
        }
        match value {
            Value::String(s) => self.score_str(s),
            Value::Array(items) => items.iter().map(|v| self.walk(v, depth + 1)).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| self.score_str(k) + self.walk(v, depth + 1))
                .sum(),
            _ => 0,
        }
    }

    /// Penalize strings that are mostly metacharacters; ordinary prose
    /// stays at zero.
    fn density_score(&self, text: &str) -> u32 {
        if text.len() < 16 {
            return 0;
        }
        let specials = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !matches!(c, '.' | ',' | '\'' | '-' | '?' | '!'))
            .count();
        let ratio = specials as f64 / text.chars().count() as f64;
        if ratio > 0.4 {
            20
        } else if ratio > 0.25 {
            10
        } else {
            0
        }
    }
}
