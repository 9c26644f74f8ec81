//! Chat-safe HTML escaping for channel output.

/// Escape text for HTML-mode chat transports.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_html`] over its named entities.
pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        let samples = [
            "plain text",
            "<b>bold</b> & \"quoted\" 'single'",
            "a < b > c & d",
            "",
            "nested &amp; entity source",
        ];
        for sample in samples {
            assert_eq!(
                unescape_html(&escape_html(sample)),
                sample,
                "round trip failed for {sample:?}"
            );
        }
    }

    #[test]
    fn escaped_output_contains_no_raw_specials() {
        let escaped = escape_html("<script>alert(\"x & y\")</script>");
        assert!(!escaped.contains('<'));
        assert!(!escaped.contains('>'));
        assert!(!escaped.contains('"'));
        // Every remaining ampersand starts a named entity.
        for (i, _) in escaped.match_indices('&') {
            let rest = &escaped[i..];
            assert!(
                rest.starts_with("&amp;")
                    || rest.starts_with("&lt;")
                    || rest.starts_with("&gt;")
                    || rest.starts_with("&quot;")
                    || rest.starts_with("&#39;"),
                "stray ampersand in {escaped:?}"
            );
        }
    }

    #[test]
    fn ampersand_escapes_first() {
        // "&lt;" in the source must not collapse to "<" after a round trip.
        assert_eq!(escape_html("&lt;"), "&amp;lt;");
        assert_eq!(unescape_html("&amp;lt;"), "&lt;");
    }
}
