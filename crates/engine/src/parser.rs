// Response-recovery parser for adversarial provider output.
//
// The upstream generator frequently wraps JSON in prose, truncates it
// mid-array, or returns plain text. This parser is total: every input
// yields a displayable reply and, at most, a fully-decoded patch. A half
// decoded patch is never returned; on any doubt the document stays as-is.

use quizforge_common::document::TestPatch;
use serde::Deserialize;
use tracing::debug;

/// Reply used when the decoded payload carries an edit but no message.
pub const DEFAULT_REPLY: &str = "I've updated the test as requested.";

/// Reply used when the provider response looks cut off.
pub const TRUNCATED_REPLY: &str =
    "The response was incomplete. Please try again with a simpler request, \
     or edit one section at a time.";

/// Outcome of parsing one raw provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub reply_text: String,
    pub patch: Option<TestPatch>,
    pub truncated: bool,
}

/// The structured payload the provider is prompted to produce.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message: Option<String>,
    test_update: Option<TestPatch>,
}

/// Extracts structured edits from raw provider text. Never fails.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    /// Candidate length above which a failed decode is treated as truncation.
    truncation_threshold: usize,
}

impl ResponseParser {
    pub fn new(truncation_threshold: usize) -> Self {
        Self { truncation_threshold }
    }

    pub fn parse(&self, raw: &str) -> ParsedResponse {
        let candidate = match json_candidate(raw) {
            Some(candidate) => candidate,
            // Nothing resembling JSON: the text is the reply, verbatim.
            None => return plain_reply(raw),
        };

        match serde_json::from_str::<Envelope>(candidate) {
            Ok(envelope) => {
                let reply_text = match envelope.message {
                    Some(message) if !message.trim().is_empty() => message,
                    _ => DEFAULT_REPLY.to_string(),
                };
                ParsedResponse { reply_text, patch: envelope.test_update, truncated: false }
            }
            Err(error) => {
                if self.looks_truncated(candidate) {
                    debug!(candidate_len = candidate.len(), %error, "provider response looks truncated");
                    ParsedResponse {
                        reply_text: TRUNCATED_REPLY.to_string(),
                        patch: None,
                        truncated: true,
                    }
                } else {
                    debug!(%error, "undecodable provider response, returning raw text");
                    plain_reply(raw)
                }
            }
        }
    }

    fn looks_truncated(&self, candidate: &str) -> bool {
        if candidate.len() > self.truncation_threshold {
            return true;
        }

        // A cut-off payload usually ends mid-token.
        if let Some(last) = candidate.trim_end().chars().last() {
            if matches!(last, '{' | '[' | ',' | ':' | '"') {
                return true;
            }
        }

        // An opened-but-unclosed edit list is the telltale of a response
        // that ran out of output budget mid-sections.
        candidate.contains("\"sections\"") && !brackets_balanced(candidate)
    }
}

fn plain_reply(raw: &str) -> ParsedResponse {
    ParsedResponse { reply_text: raw.to_string(), patch: None, truncated: false }
}

/// Pick the JSON candidate out of the raw text: the whole string when it
/// starts with `{`, otherwise the greedy first-`{`-to-last-`}` span, or
/// first-`{`-to-end when no closing brace follows.
fn json_candidate(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }

    let start = raw.find('{')?;
    match raw.rfind('}') {
        Some(end) if end > start => Some(&raw[start..=end]),
        _ => Some(&raw[start..]),
    }
}

/// Brace/bracket balance check, string-literal aware.
fn brackets_balanced(text: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }

    depth == 0 && !in_string
}
