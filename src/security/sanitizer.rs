use regex::Regex;
use serde_json::Value;

/// Content-type sanitization profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Strip all markup, escape special characters.
    Text,
    /// Allow a fixed safe subset of inline/block tags.
    Html,
    /// The html subset plus structural tags (headings, code, quotes).
    Markdown,
}

impl Profile {
    pub fn from_name(name: &str) -> Self {
        match name {
            "html" => Profile::Html,
            "markdown" => Profile::Markdown,
            _ => Profile::Text,
        }
    }

    fn allowed_tags(&self) -> &'static [&'static str] {
        match self {
            Profile::Text => &[],
            Profile::Html => &["b", "i", "em", "strong", "p", "br", "ul", "ol", "li", "a"],
            Profile::Markdown => &[
                "b", "i", "em", "strong", "p", "br", "ul", "ol", "li", "a", "h1", "h2", "h3",
                "h4", "h5", "h6", "blockquote", "pre", "code", "hr",
            ],
        }
    }
}

/// Markup sanitizer applied to payloads on the way in and to markup
/// responses on the way out.
///
/// Sanitization is a fixed point: running it over its own output is a
/// no-op, so content sanitized at ingest can safely pass through again at
/// egress.
pub struct Sanitizer {
    tag_re: Regex,
    href_re: Regex,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self {
            tag_re: Regex::new(r"<[^>]*>").expect("invalid tag pattern"),
            href_re: Regex::new(r#"(?i)href\s*=\s*["']?([^"'\s>]+)"#).expect("invalid href pattern"),
        }
    }

    /// Sanitize a string according to `profile`.
    pub fn sanitize_str(&self, input: &str, profile: Profile) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for m in self.tag_re.find_iter(input) {
            escape_into(&mut out, &input[last..m.start()]);
            if let Some(tag) = self.normalize_tag(m.as_str(), profile) {
                out.push_str(&tag);
            }
            last = m.end();
        }
        escape_into(&mut out, &input[last..]);
        out
    }

    /// Recursively sanitize every string in a structured payload.
    pub fn sanitize_value(&self, value: &Value, profile: Profile) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_str(s, profile)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.sanitize_value(v, profile))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize_value(v, profile)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Reduce a raw tag to its normalized allowed form, or drop it.
    /// Everything except the tag name (and a safe `href` on anchors) is
    /// discarded, so event-handler attributes can never survive.
    fn normalize_tag(&self, raw: &str, profile: Profile) -> Option<String> {
        let inner = raw.trim_start_matches('<').trim_end_matches('>').trim();
        let (closing, inner) = match inner.strip_prefix('/') {
            Some(rest) => (true, rest.trim()),
            None => (false, inner),
        };

        let name: String = inner
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        if !profile.allowed_tags().contains(&name.as_str()) {
            return None;
        }

        if closing {
            return Some(format!("</{}>", name));
        }

        if name == "a" {
            if let Some(href) = self.safe_href(inner) {
                return Some(format!("<a href=\"{}\">", href));
            }
            return Some("<a>".to_string());
        }

        Some(format!("<{}>", name))
    }

    /// Extract an href whose scheme is safe to keep.
    fn safe_href(&self, tag_inner: &str) -> Option<String> {
        let captures = self.href_re.captures(tag_inner)?;
        let url = captures.get(1)?.as_str();
        let lower = url.to_lowercase();
        let safe = lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("mailto:")
            || lower.starts_with('/');
        if safe {
            Some(url.replace('"', "").replace('\'', ""))
        } else {
            None
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// HTML-escape `input` into `out`, leaving already-escaped entities
/// untouched so repeated escaping is a no-op.
fn escape_into(out: &mut String, input: &str) {
    let bytes = input.as_bytes();
    for (idx, ch) in input.char_indices() {
        match ch {
            '&' if starts_with_entity(&bytes[idx..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
}

fn starts_with_entity(bytes: &[u8]) -> bool {
    const ENTITIES: [&[u8]; 5] = [b"&amp;", b"&lt;", b"&gt;", b"&quot;", b"&#x27;"];
    ENTITIES.iter().any(|e| bytes.starts_with(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_profile_passes_prose_unmodified() {
        let s = Sanitizer::new();
        let prose = "A quiet afternoon at the gallery.";
        assert_eq!(s.sanitize_str(prose, Profile::Text), prose);
    }

    #[test]
    fn test_text_profile_strips_all_markup() {
        let s = Sanitizer::new();
        let out = s.sanitize_str("<b>bold</b> and <script>alert(1)</script>", Profile::Text);
        assert_eq!(out, "bold and alert(1)");
    }

    #[test]
    fn test_text_profile_escapes_specials() {
        let s = Sanitizer::new();
        assert_eq!(
            s.sanitize_str("a < b & \"c\"", Profile::Text),
            "a &lt; b &amp; &quot;c&quot;"
        );
    }

    #[test]
    fn test_html_profile_keeps_safe_subset() {
        let s = Sanitizer::new();
        let out = s.sanitize_str(
            "<p>Hello <strong>world</strong><script>alert(1)</script></p>",
            Profile::Html,
        );
        assert_eq!(out, "<p>Hello <strong>world</strong>alert(1)</p>");
    }

    #[test]
    fn test_event_handlers_are_stripped_from_kept_tags() {
        let s = Sanitizer::new();
        let out = s.sanitize_str("<p onclick=\"steal()\">hi</p>", Profile::Html);
        assert_eq!(out, "<p>hi</p>");
    }

    #[test]
    fn test_anchor_keeps_safe_href_only() {
        let s = Sanitizer::new();
        assert_eq!(
            s.sanitize_str("<a href=\"https://example.com\">x</a>", Profile::Html),
            "<a href=\"https://example.com\">x</a>"
        );
        assert_eq!(
            s.sanitize_str("<a href=\"javascript:alert(1)\">x</a>", Profile::Html),
            "<a>x</a>"
        );
    }

    #[test]
    fn test_markdown_profile_allows_structure() {
        let s = Sanitizer::new();
        let out = s.sanitize_str("<h2>Title</h2><iframe src=\"x\"></iframe>", Profile::Markdown);
        assert_eq!(out, "<h2>Title</h2>");
    }

    #[test]
    fn test_sanitizing_sanitized_content_is_noop() {
        let s = Sanitizer::new();
        for profile in [Profile::Text, Profile::Html, Profile::Markdown] {
            for input in [
                "plain prose, nothing special",
                "<p>Hello <a href=\"https://e.com\">link</a></p>",
                "a < b & \"c\" <script>alert('x')</script>",
                "<h1 class=\"big\">title</h1><iframe></iframe>",
            ] {
                let once = s.sanitize_str(input, profile);
                let twice = s.sanitize_str(&once, profile);
                assert_eq!(once, twice, "profile {:?} input {:?}", profile, input);
            }
        }
    }

    #[test]
    fn test_sanitize_value_walks_structure() {
        let s = Sanitizer::new();
        let v = json!({
            "title": "<b>x</b>",
            "tags": ["<i>a</i>", "plain"],
            "count": 3
        });
        let out = s.sanitize_value(&v, Profile::Text);
        assert_eq!(out["title"], "x");
        assert_eq!(out["tags"][0], "a");
        assert_eq!(out["tags"][1], "plain");
        assert_eq!(out["count"], 3);
    }
}
