//! Cross-source signal correlation.
//!
//! Proactive-detection signals from different sources are correlated by
//! token overlap in their titles and summaries; a sufficient overlap emits
//! a cross-signal with a deterministic fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Minimum shared tokens before two signals correlate.
pub const DEFAULT_MIN_OVERLAP: usize = 3;

/// Cross-signal confidence ceiling.
const CONFIDENCE_CAP: f32 = 0.93;

/// Confidence at or above which a cross-signal is high severity.
const HIGH_SEVERITY_THRESHOLD: f32 = 0.8;

/// Tokens shorter than this are dropped.
const MIN_TOKEN_LEN: usize = 3;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "have", "has", "was", "were", "are",
    "not", "but", "all", "any", "can", "her", "his", "its", "our", "out", "they", "them", "will",
    "would", "should", "could", "been", "being", "into", "over", "under", "about", "after",
    "before", "between", "during", "while", "when", "where", "which", "who", "whom", "why", "how",
];

// ─── Types ───────────────────────────────────────────────────────────────────

/// A unit of proactive detection from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

/// A correlation between signals from distinct sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossSignal {
    /// `"<pair_tag>:<sorted-tokens-hash>"`; stable across runs.
    pub fingerprint: String,
    pub signal_ids: Vec<String>,
    pub shared_tokens: Vec<String>,
    pub confidence: f32,
    pub severity: Severity,
}

// ─── Tokenisation ────────────────────────────────────────────────────────────

/// Tokenise a signal's title + summary: lowercase, punctuation stripped,
/// short tokens and stopwords dropped, deduplicated.
pub fn tokenize(signal: &Signal) -> Vec<String> {
    let text = format!("{} {}", signal.title, signal.summary).to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.len() < MIN_TOKEN_LEN || STOPWORDS.contains(&raw) {
            continue;
        }
        if seen.insert(raw.to_string()) {
            tokens.push(raw.to_string());
        }
    }
    tokens
}

// ─── Correlation ─────────────────────────────────────────────────────────────

/// Correlate all pairs of signals from distinct sources.
pub fn correlate(signals: &[Signal], min_overlap: usize) -> Vec<CrossSignal> {
    let min_overlap = min_overlap.max(1);
    let token_sets: Vec<std::collections::HashSet<String>> = signals
        .iter()
        .map(|s| tokenize(s).into_iter().collect())
        .collect();

    let mut out = Vec::new();
    for i in 0..signals.len() {
        for j in (i + 1)..signals.len() {
            if signals[i].source == signals[j].source {
                continue;
            }
            let mut shared: Vec<String> = token_sets[i]
                .intersection(&token_sets[j])
                .cloned()
                .collect();
            if shared.len() < min_overlap {
                continue;
            }
            shared.sort();

            let confidence = confidence_for(shared.len());
            let severity = if confidence >= HIGH_SEVERITY_THRESHOLD {
                Severity::High
            } else {
                Severity::Medium
            };

            out.push(CrossSignal {
                fingerprint: fingerprint(&signals[i].source, &signals[j].source, &shared),
                signal_ids: vec![signals[i].id.clone(), signals[j].id.clone()],
                shared_tokens: shared,
                confidence,
                severity,
            });
        }
    }
    out
}

/// Overlap-driven confidence, capped at 0.93.
fn confidence_for(overlap: usize) -> f32 {
    (0.35 + 0.12 * overlap as f32).min(CONFIDENCE_CAP)
}

/// Deterministic fingerprint: sorted source pair + hash of sorted tokens.
fn fingerprint(source_a: &str, source_b: &str, sorted_tokens: &[String]) -> String {
    let mut sources = [source_a, source_b];
    sources.sort();
    let pair_tag = format!("{}+{}", sources[0], sources[1]);

    let mut hasher = Sha256::new();
    hasher.update(sorted_tokens.join("|").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{pair_tag}:{}", &digest[..16])
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: &str, source: &str, title: &str, summary: &str) -> Signal {
        Signal {
            id: id.to_string(),
            source: source.to_string(),
            title: title.to_string(),
            summary: summary.to_string(),
        }
    }

    #[test]
    fn tokenize_lowercases_strips_and_dedupes() {
        let s = signal("s1", "rss", "Kernel PANIC in io_uring!", "Panic traced to io_uring");
        let tokens = tokenize(&s);
        assert!(tokens.contains(&"kernel".to_string()));
        assert!(tokens.contains(&"panic".to_string()));
        assert!(tokens.contains(&"uring".to_string()));
        // Deduplicated: "panic" appears once.
        assert_eq!(tokens.iter().filter(|t| *t == "panic").count(), 1);
    }

    #[test]
    fn tokenize_drops_short_and_stopword_tokens() {
        let s = signal("s1", "rss", "the fix is in", "an io it of");
        let tokens = tokenize(&s);
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"is".to_string()));
        assert!(!tokens.contains(&"io".to_string()), "len 2 dropped");
        assert!(tokens.contains(&"fix".to_string()));
    }

    #[test]
    fn overlapping_signals_from_distinct_sources_correlate() {
        let signals = vec![
            signal("s1", "github", "database migration outage postmortem", ""),
            signal("s2", "pagerduty", "outage during database migration window", ""),
        ];
        let cross = correlate(&signals, 3);
        assert_eq!(cross.len(), 1);
        assert!(cross[0].shared_tokens.len() >= 3);
        assert_eq!(cross[0].signal_ids, vec!["s1", "s2"]);
    }

    #[test]
    fn same_source_pairs_never_correlate() {
        let signals = vec![
            signal("s1", "github", "database migration outage", ""),
            signal("s2", "github", "database migration outage", ""),
        ];
        assert!(correlate(&signals, 3).is_empty());
    }

    #[test]
    fn insufficient_overlap_is_ignored() {
        let signals = vec![
            signal("s1", "github", "database outage", ""),
            signal("s2", "pagerduty", "database maintenance", ""),
        ];
        assert!(correlate(&signals, 3).is_empty(), "only 1 shared token");
    }

    #[test]
    fn confidence_caps_and_severity_splits() {
        // 3 shared tokens → 0.71 → medium; 4 → 0.83 → high; 10 → capped.
        assert!((confidence_for(3) - 0.71).abs() < 1e-5);
        assert!((confidence_for(4) - 0.83).abs() < 1e-5);
        assert_eq!(confidence_for(10), CONFIDENCE_CAP);

        let signals = vec![
            signal("s1", "github", "alpha beta gamma delta", ""),
            signal("s2", "pagerduty", "alpha beta gamma delta", ""),
        ];
        let cross = correlate(&signals, 3);
        assert_eq!(cross[0].severity, Severity::High);

        let signals = vec![
            signal("s1", "github", "alpha beta gamma", ""),
            signal("s2", "pagerduty", "alpha beta gamma", ""),
        ];
        let cross = correlate(&signals, 3);
        assert_eq!(cross[0].severity, Severity::Medium);
    }

    #[test]
    fn fingerprint_is_deterministic_and_order_independent() {
        let a = signal("s1", "github", "alpha beta gamma", "");
        let b = signal("s2", "pagerduty", "alpha beta gamma", "");

        let forward = correlate(&[a.clone(), b.clone()], 3);
        let reverse = correlate(&[b, a], 3);
        assert_eq!(forward[0].fingerprint, reverse[0].fingerprint);
        assert!(forward[0].fingerprint.starts_with("github+pagerduty:"));
    }

    #[test]
    fn three_sources_emit_pairwise_cross_signals() {
        let signals = vec![
            signal("s1", "github", "alpha beta gamma", ""),
            signal("s2", "pagerduty", "alpha beta gamma", ""),
            signal("s3", "rss", "alpha beta gamma", ""),
        ];
        let cross = correlate(&signals, 3);
        assert_eq!(cross.len(), 3, "all distinct-source pairs");
    }
}
