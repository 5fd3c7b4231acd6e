use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

use loam_core::FailureChannel;

/// Structural failure vocabulary preserved through normalization. Anything
/// else that survives literal-stripping is kept too, but these words are
/// what recurrence detection leans on.
const FAILURE_VOCAB: &[&str] = &[
    "syntax",
    "unknown",
    "missing",
    "expected",
    "not found",
    "stuck",
    "no_progress",
    "constraint_failed",
];

static RE_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]?\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?").unwrap()
});
static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
});
static RE_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(0x[0-9a-f]+|[0-9a-f]{8,})\b").unwrap());
static RE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(~|\.{1,2})?(/[\w.@%+-]+){2,}/?").unwrap());
static RE_LINE_COL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(line|column|col|row)\s*:?\s*\d+|:\d+(:\d+)?\b").unwrap());
static RE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'|`[^`]*`"#).unwrap());
static RE_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{2,}\b").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Everything the fingerprinter looks at for one failed step.
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    /// Raw failure text from the tool; may be empty for soft signals.
    pub error_text: &'a str,
    /// The attempted tool input.
    pub action_payload: Option<&'a Value>,
    /// `(before, after)` state signatures, used when `error_text` is empty.
    pub state_signature: Option<(&'a str, &'a str)>,
    /// Which failure channel fired.
    pub channel: FailureChannel,
}

/// Turns noisy, tool-specific failure output into a compact stable key and
/// a small advisory tag set. Never fails: malformed input degrades to
/// `<tool_family>:unspecified` with no tags.
pub struct Fingerprinter {
    tool_family: String,
}

impl Fingerprinter {
    pub fn new(tool_family: impl Into<String>) -> Self {
        Self {
            tool_family: tool_family.into(),
        }
    }

    /// Produce `(fingerprint, tags)` for one failure.
    ///
    /// Hard failures fingerprint as `<family>:<action_head>|<signature>`
    /// where the signature is the dominant tag when one is detected, else
    /// the normalized residual error text. Empty error text (no-progress
    /// and friends) derives
    /// `<family>:<before_hash>|<action_shape>|<after_hash>|<reason>`.
    pub fn fingerprint(&self, input: &FingerprintInput) -> (String, BTreeSet<String>) {
        if input.error_text.trim().is_empty() {
            return self.fingerprint_stateful(input);
        }

        let residual = normalize(input.error_text);
        let tags = extract_tags(&residual, input.channel);
        if residual.is_empty() && tags.is_empty() {
            return (format!("{}:unspecified", self.tool_family), tags);
        }

        let head = action_head(input.action_payload);
        let signature = tags
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| residual.clone());

        let fp = match head {
            Some(head) => format!("{}:{}|{}", self.tool_family, head, signature),
            None => format!("{}:{}", self.tool_family, signature),
        };
        (fp, tags)
    }

    /// Fingerprint for signals that carry no error text: state transition
    /// hashes plus the action's shape plus the channel reason.
    fn fingerprint_stateful(&self, input: &FingerprintInput) -> (String, BTreeSet<String>) {
        let (before, after) = match input.state_signature {
            Some(sig) => sig,
            None => {
                return (
                    format!("{}:unspecified", self.tool_family),
                    BTreeSet::new(),
                );
            }
        };
        let shape = action_shape(input.action_payload);
        let fp = format!(
            "{}:{:08x}|{}|{:08x}|{}",
            self.tool_family,
            fnv1a64(before.as_bytes()) as u32,
            shape,
            fnv1a64(after.as_bytes()) as u32,
            input.channel.as_str(),
        );
        let mut tags = BTreeSet::new();
        match input.channel {
            FailureChannel::NoProgress => {
                tags.insert("no_progress".to_string());
            }
            FailureChannel::ConstraintFailure => {
                tags.insert("constraint_failed".to_string());
            }
            _ => {}
        }
        (fp, tags)
    }

    pub fn tool_family(&self) -> &str {
        &self.tool_family
    }
}

/// Normalize failure text: lowercase, strip volatile literals, collapse
/// whitespace. The structural failure vocabulary survives untouched.
fn normalize(text: &str) -> String {
    let mut s = text.to_lowercase();
    s = RE_TIMESTAMP.replace_all(&s, " ").into_owned();
    s = RE_UUID.replace_all(&s, " ").into_owned();
    s = RE_QUOTED.replace_all(&s, " ").into_owned();
    s = RE_PATH.replace_all(&s, " ").into_owned();
    s = RE_LINE_COL.replace_all(&s, " ").into_owned();
    s = RE_HEX.replace_all(&s, " ").into_owned();
    s = RE_INT.replace_all(&s, " ").into_owned();
    s = s.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != ' ', " ");
    RE_WS.replace_all(s.trim(), " ").into_owned()
}

/// Extract generic tags from residual text + channel. Tags are hints;
/// retrieval tolerates empty sets.
fn extract_tags(residual: &str, channel: FailureChannel) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    if residual.contains("operator") {
        tags.insert("operator_mismatch".into());
    }
    if residual.contains("syntax") || residual.contains("parse") {
        tags.insert("syntax_structure".into());
    }
    if (residual.contains("unknown")
        || residual.contains("unrecognized")
        || residual.contains("undefined")
        || residual.contains("not found"))
        && !residual.contains("operator")
    {
        tags.insert("unknown_symbol".into());
    }
    if residual.contains("function")
        && (residual.contains("case")
            || residual.contains("uppercase")
            || residual.contains("lowercase"))
    {
        tags.insert("function_case".into());
    }
    if (residual.contains("path") || residual.contains("file"))
        && (residual.contains("quote") || residual.contains("space"))
    {
        tags.insert("path_quote".into());
    }
    if (residual.contains("sort") || residual.contains("order"))
        && (residual.contains("asc") || residual.contains("desc") || residual.contains("direction"))
    {
        tags.insert("sort_direction".into());
    }
    if residual.contains("missing") || residual.contains("required") {
        tags.insert("missing_field".into());
    }
    if residual.contains("type") && (residual.contains("mismatch") || residual.contains("expected"))
    {
        tags.insert("type_mismatch".into());
    }
    match channel {
        FailureChannel::NoProgress => {
            tags.insert("no_progress".into());
        }
        FailureChannel::ConstraintFailure => {
            tags.insert("constraint_failed".into());
        }
        _ => {}
    }
    tags
}

/// The leading command word of the payload's primary text field, or the
/// sorted key list when there is no obvious command.
fn action_head(payload: Option<&Value>) -> Option<String> {
    let payload = payload?;
    let obj = payload.as_object()?;
    for field in ["command", "query", "input", "action"] {
        if let Some(Value::String(s)) = obj.get(field) {
            let head = s.split_whitespace().next()?.to_lowercase();
            if !head.is_empty() {
                return Some(head);
            }
        }
    }
    if obj.is_empty() {
        return None;
    }
    Some(action_shape(Some(payload)))
}

/// Sorted top-level keys of the payload, joined with `+`.
fn action_shape(payload: Option<&Value>) -> String {
    match payload.and_then(|p| p.as_object()) {
        Some(obj) => {
            let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            keys.join("+")
        }
        None => "none".to_string(),
    }
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// True when the structural vocabulary appears in the residual — used by
/// tests to confirm normalization keeps what matters.
#[allow(dead_code)]
fn preserves_vocab(residual: &str) -> bool {
    FAILURE_VOCAB.iter().any(|w| residual.contains(w))
}
