//! Response parser: separates prose from a structured command in raw model
//! output, repairing malformed JSON along the way.
//!
//! Payload masking is the load-bearing trick: fenced payload blocks are
//! swapped for placeholders before any JSON extraction, so code content
//! full of braces can never confuse the brace scanner. Referenced payloads
//! are substituted back into the command's parameters at the end.
//!
//! `parse_agent_response` never fails. When no command can be decoded the
//! whole text comes back as prose, and the reasoning loop reports that to
//! the model for self-correction.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

use crate::models::{ParsedAgentResponse, RawCommand};

fn payload_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<<<PAYLOAD_(\d+)>>>").unwrap())
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap())
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[\d{2}[A-Z]{3}\d{4}_\d{6}[AP]M\]\s*").unwrap())
}

fn empty_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[a-zA-Z]*\s*```").unwrap())
}

/// Parse raw model text into prose plus an optional command.
pub fn parse_agent_response(response_text: &str) -> ParsedAgentResponse {
    let (masked, payloads) = mask_payloads(response_text);

    let (prose_region, command) = extract_command(&masked);
    let mut command = command;

    let referenced = command
        .as_mut()
        .map(|c| rehydrate_payloads(c, &payloads))
        .unwrap_or_default();

    let prose = clean_prose(&prose_region, &payloads, &referenced);
    ParsedAgentResponse { prose, command }
}

/// True when the remaining prose carries no information worth rendering:
/// whitespace, empty code fences, a leading timestamp tag, or a bare
/// greeting.
pub fn is_prose_effectively_empty(prose: &str) -> bool {
    let stripped = empty_fence_re().replace_all(prose, "");
    let stripped = timestamp_re().replace(stripped.trim(), "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return true;
    }
    let bare = trimmed
        .trim_end_matches(['.', '!', ','])
        .to_ascii_lowercase();
    matches!(
        bare.as_str(),
        "ok" | "okay" | "sure" | "done" | "understood" | "hello" | "hi" | "hey"
    )
}

/// Replace every `<<<PAYLOAD_n>>>...<<<END_PAYLOAD_n>>>` block with its bare
/// start marker and remember the contents.
fn mask_payloads(text: &str) -> (String, HashMap<String, String>) {
    let mut payloads = HashMap::new();
    let mut masked = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(m) = payload_start_re().find_at(text, cursor) {
        let caps = payload_start_re().captures(&text[m.start()..]).unwrap();
        let id = caps[1].to_string();
        let end_marker = format!("<<<END_PAYLOAD_{}>>>", id);
        let body_start = m.end();
        match text[body_start..].find(&end_marker) {
            Some(rel_end) => {
                let body = &text[body_start..body_start + rel_end];
                masked.push_str(&text[cursor..m.start()]);
                masked.push_str(&format!("<<<PAYLOAD_{}>>>", id));
                payloads.insert(id, trim_payload(body).to_string());
                cursor = body_start + rel_end + end_marker.len();
            }
            None => {
                // Unterminated block: leave the marker in place.
                masked.push_str(&text[cursor..m.end()]);
                cursor = m.end();
            }
        }
    }
    masked.push_str(&text[cursor..]);
    (masked, payloads)
}

/// Payload bodies are typically fenced; strip one optional surrounding
/// fence and the framing newlines, preserving inner content exactly.
fn trim_payload(body: &str) -> &str {
    let body = body.strip_prefix('\n').unwrap_or(body);
    let body = body.strip_suffix('\n').unwrap_or(body);
    if let Some(rest) = body.strip_prefix("```") {
        if let Some(lang_end) = rest.find('\n') {
            if let Some(inner) = rest[lang_end + 1..].strip_suffix("```") {
                return inner.strip_suffix('\n').unwrap_or(inner);
            }
        }
    }
    body
}

/// Find the command JSON in masked text. Returns the text with the JSON
/// region removed, plus the decoded command if any.
fn extract_command(masked: &str) -> (String, Option<RawCommand>) {
    // Preferred: the largest fenced ```json block.
    let mut best: Option<(std::ops::Range<usize>, String)> = None;
    for caps in fenced_json_re().captures_iter(masked) {
        let whole = caps.get(0).unwrap();
        let body = caps.get(1).unwrap().as_str();
        if best.as_ref().map_or(true, |(_, b)| body.len() > b.len()) {
            best = Some((whole.range(), body.to_string()));
        }
    }
    if let Some((range, body)) = best {
        if let Some(cmd) = parse_command_json(&body) {
            let mut prose = String::new();
            prose.push_str(&masked[..range.start]);
            prose.push_str(&masked[range.end..]);
            return (prose, Some(cmd));
        }
    }

    // Fallback: largest balanced brace span that decodes to an object with
    // a top-level "action" key.
    if let Some((range, cmd)) = extract_with_brace_counting(masked) {
        let mut prose = String::new();
        prose.push_str(&masked[..range.start]);
        prose.push_str(&masked[range.end..]);
        return (prose, Some(cmd));
    }

    (masked.to_string(), None)
}

fn parse_command_json(candidate: &str) -> Option<RawCommand> {
    let attempt = |s: &str| -> Option<RawCommand> {
        let value: Value = serde_json::from_str(s).ok()?;
        let obj = value.as_object()?;
        let action = obj.get("action")?.as_str()?.to_string();
        let parameters = obj.get("parameters").cloned().unwrap_or(Value::Null);
        Some(RawCommand { action, parameters })
    };
    attempt(candidate).or_else(|| {
        let repaired = repair_json(candidate);
        attempt(&repaired)
    })
}

fn extract_with_brace_counting(text: &str) -> Option<(std::ops::Range<usize>, RawCommand)> {
    let bytes = text.as_bytes();
    let mut best: Option<(std::ops::Range<usize>, RawCommand)> = None;

    for start in (0..bytes.len()).filter(|&i| bytes[i] == b'{') {
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let end = start + offset + 1;
                        let candidate = &text[start..end];
                        if candidate.contains("action") {
                            if let Some(cmd) = parse_command_json(candidate) {
                                let better = best
                                    .as_ref()
                                    .map_or(true, |(r, _)| candidate.len() > r.len());
                                if better {
                                    best = Some((start..end, cmd));
                                }
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    best
}

/// Best-effort, idempotent JSON repair.
///
/// Applied rules: comment stripping, unquoted-key quoting, single-quoted
/// string conversion, trailing-comma removal, raw control-character
/// escaping and stray-backslash removal inside strings.
pub fn repair_json(input: &str) -> String {
    let s = strip_comments(input);
    let s = quote_unquoted_keys(&s);
    let s = convert_single_quotes(&s);
    let s = remove_trailing_commas(&s);
    fix_string_contents(&s)
}

fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '/' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn quote_unquoted_keys(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap()
    });
    re.replace_all(input, "$1\"$2\":").into_owned()
}

fn convert_single_quotes(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Only unambiguous spans: after a structural character, no embedded
    // double quotes or backslashes.
    let re = RE.get_or_init(|| Regex::new(r#"([:,{\[]\s*)'([^'"\\]*)'"#).unwrap());
    re.replace_all(input, "$1\"$2\"").into_owned()
}

fn remove_trailing_commas(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());
    re.replace_all(input, "$1").into_owned()
}

/// String-aware pass: escape raw control characters and drop backslashes
/// that precede characters with no escape meaning.
fn fix_string_contents(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = false;
                out.push(c);
                i += 1;
            }
            '\\' => {
                let next = chars.get(i + 1).copied();
                match next {
                    Some(n) if "\"\\/bfnrtu".contains(n) => {
                        out.push('\\');
                        out.push(n);
                        i += 2;
                    }
                    Some(n) => {
                        // Stray backslash before a non-escape character.
                        out.push(n);
                        i += 2;
                    }
                    None => {
                        i += 1;
                    }
                }
            }
            '\n' => {
                out.push_str("\\n");
                i += 1;
            }
            '\r' => {
                out.push_str("\\r");
                i += 1;
            }
            '\t' => {
                out.push_str("\\t");
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Substitute payload contents into parameters that reference a placeholder.
/// Returns the ids that were consumed.
fn rehydrate_payloads(command: &mut RawCommand, payloads: &HashMap<String, String>) -> Vec<String> {
    let mut referenced = Vec::new();
    for key in ["content", "diff_content", "script"] {
        let placeholder_id = command.get_str(key).and_then(|v| {
            payload_start_re()
                .captures(v.trim())
                .map(|caps| caps[1].to_string())
        });
        if let Some(id) = placeholder_id {
            if let Some(body) = payloads.get(&id) {
                command.set_parameter(key, body.clone());
                referenced.push(id);
            }
        }
    }
    referenced
}

/// Rebuild prose: restore unreferenced payload blocks, drop consumed ones,
/// strip empty fences and whitespace.
fn clean_prose(
    region: &str,
    payloads: &HashMap<String, String>,
    referenced: &[String],
) -> String {
    let mut prose = region.to_string();
    for (id, body) in payloads {
        let marker = format!("<<<PAYLOAD_{}>>>", id);
        if referenced.contains(id) {
            prose = prose.replace(&marker, "");
        } else {
            prose = prose.replace(&marker, body);
        }
    }
    let prose = empty_fence_re().replace_all(&prose, "");
    let prose = prose.trim().to_string();
    if is_prose_effectively_empty(&prose) {
        debug!("Prose judged effectively empty after cleanup");
        return String::new();
    }
    prose
}
