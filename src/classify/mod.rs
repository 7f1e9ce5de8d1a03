//! Output classification: free-form check output to a verdict.
//!
//! Checks print a human-readable verdict, usually as a colored
//! `Final Status: Pass|Fail|Manual` line, but not always. Classification
//! normalizes the raw terminal bytes first (see [`ansi`]) and then applies
//! an ordered rule table to the plain text:
//!
//! ```text
//! 1. explicit "final status: pass|fail|manual"   → that verdict
//! 2. known-compliant phrase                       → PASS
//! 3. error / failure wording                      → FAIL
//! 4. "manual check required"                      → MANUAL
//! 5. nothing recognized                           → FAIL (fail-closed)
//! ```
//!
//! When a check prints several explicit markers, FAIL outranks MANUAL,
//! which outranks PASS.

pub mod ansi;

use std::sync::LazyLock;

use regex::Regex;

use crate::aggregate::Verdict;

pub use ansi::{ansi_to_html, html_to_text, plain_text};

/// A verdict together with the text that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    /// The matched marker, or `None` when the fail-closed default applied.
    pub matched_text: Option<String>,
}

/// Compiled classification rules.
pub struct VerdictRules {
    explicit: Regex,
    fallbacks: Vec<(Regex, Verdict)>,
}

impl VerdictRules {
    /// The rule set used for compliance-check output.
    pub fn standard() -> Self {
        Self {
            explicit: Regex::new(r"(?i)final status:\s*(pass|fail|manual)").unwrap(),
            fallbacks: vec![
                // Storage secure-transfer check reports compliance without a marker
                (
                    Regex::new(r"(?i)enabled \(secure transfer required\)").unwrap(),
                    Verdict::Pass,
                ),
                (Regex::new(r"(?i)error|failed").unwrap(), Verdict::Fail),
                (
                    Regex::new(r"(?i)manual check required").unwrap(),
                    Verdict::Manual,
                ),
            ],
        }
    }

    /// Classify already-normalized plain text.
    pub fn classify_text(&self, text: &str) -> Classification {
        let explicit = self
            .explicit
            .captures_iter(text)
            .filter_map(|caps| {
                let verdict = Verdict::parse(caps.get(1)?.as_str())?;
                Some((verdict, caps.get(0)?.as_str().to_string()))
            })
            .max_by_key(|(verdict, _)| explicit_rank(*verdict));

        if let Some((verdict, matched)) = explicit {
            return Classification {
                verdict,
                matched_text: Some(matched),
            };
        }

        for (regex, verdict) in &self.fallbacks {
            if let Some(m) = regex.find(text) {
                return Classification {
                    verdict: *verdict,
                    matched_text: Some(m.as_str().to_string()),
                };
            }
        }

        Classification {
            verdict: Verdict::Fail,
            matched_text: None,
        }
    }

    /// Classify raw terminal output (escape sequences included).
    pub fn classify(&self, raw: &str) -> Classification {
        self.classify_text(&plain_text(raw))
    }
}

// Precedence among explicit markers. The marker regex never yields SKIPPED.
fn explicit_rank(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Pass | Verdict::Skipped => 0,
        Verdict::Manual => 1,
        Verdict::Fail => 2,
    }
}

static STANDARD_RULES: LazyLock<VerdictRules> = LazyLock::new(VerdictRules::standard);

/// Classify raw check output with the standard rules.
pub fn classify(raw: &str) -> Verdict {
    STANDARD_RULES.classify(raw).verdict
}

/// Classify raw check output, keeping the matched marker.
pub fn classify_detailed(raw: &str) -> Classification {
    STANDARD_RULES.classify(raw)
}
