//! MD5-derived 64-bit hash keys and chat-aware cache-key extraction.
//!
//! The router uses [`hash_key`] to place both replicas and requests on the hash
//! ring, and [`extract_cache_key`] to fingerprint a chat-style request so that
//! turns of the same conversation land on the same replica regardless of
//! sampling parameters (temperature, top_p, ...) that vary turn to turn.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use md5::{Digest, Md5};
use observability_deps::tracing::{debug, warn};
use serde_json::Value;
use std::fmt::Write as _;
use thiserror::Error;

/// A JSON-encoded request payload.
///
/// Modeled as a pre-decoded [`serde_json::Value`] rather than a bespoke sum
/// type: the protocol layer (out of scope here) already decodes the wire
/// request before handing it to the router, and `Value` is the idiomatic
/// choice for "arbitrary, caller-defined JSON shape" in this ecosystem.
pub type Payload = Value;

/// Reasons [`try_extract_cache_key`] can't produce a structured key.
///
/// None of these are fatal: [`extract_cache_key`] maps every variant to the
/// request-id fallback, matching the source's blanket `except Exception`.
/// The type exists so the fallible core is an ordinary `Result`-returning
/// function rather than something that swallows errors internally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheKeyError {
    /// The payload was empty/falsy.
    #[error("payload is empty")]
    EmptyPayload,
    /// Neither a system nor any user message could be extracted.
    #[error("no recognizable chat messages in payload")]
    NoRecognizableMessages,
}

/// MD5 the UTF-8 bytes of `s` and take the first 8 bytes of the lowercase hex
/// digest as a big-endian `u64`.
///
/// Must be byte-stable across implementations: this is the shared fingerprint
/// that a consistent-hash ring, a static-hash router, and (if ever compared
/// against a sibling deployment of the original Python service) that service
/// would all compute identically for the same string.
pub fn hash_key(s: &str) -> u64 {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        write!(hex, "{byte:02x}").expect("writing to a String never fails");
    }
    u64::from_str_radix(&hex, 16).expect("16 hex digits always fit in a u64")
}

/// Extract the cache key for `payload`, falling back to `request_id` on any
/// extraction failure (spec step 5: "any exception during extraction falls
/// back to the request-id").
pub fn extract_cache_key(payload: &Payload, request_id: &str, max_user_messages: usize) -> String {
    match try_extract_cache_key(payload, request_id, max_user_messages) {
        Ok(key) => key,
        Err(e) => {
            debug!(%e, request_id, "cache key extraction fell back to request id");
            request_id.to_string()
        }
    }
}

/// The fallible core of [`extract_cache_key`].
///
/// `Err` is only returned for [`CacheKeyError::EmptyPayload`] (step 1) and
/// [`CacheKeyError::NoRecognizableMessages`] (step 4's "neither captured");
/// the other branches of the source algorithm (non-dict first element,
/// no `messages` field) are *not* errors here — they deterministically
/// return `Ok(repr(payload))`, matching the source's `return str(payload)`
/// paths, which are not failures.
pub fn try_extract_cache_key(
    payload: &Payload,
    request_id: &str,
    max_user_messages: usize,
) -> Result<String, CacheKeyError> {
    if is_falsy(payload) {
        return Err(CacheKeyError::EmptyPayload);
    }

    let req = match payload {
        Value::Array(items) => match items.first() {
            Some(Value::Object(_)) => items[0].clone(),
            Some(_) | None => return Ok(py_repr(payload)),
        },
        Value::Object(_) => payload.clone(),
        _ => return Ok(py_repr(payload)),
    };

    let messages = match req.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => messages,
        _ => return Ok(py_repr(payload)),
    };

    let mut system: Option<String> = None;
    let mut users: Vec<String> = Vec::with_capacity(max_user_messages);

    for msg in messages {
        let Value::Object(msg) = msg else {
            continue;
        };
        let Some(role) = msg.get("role").and_then(Value::as_str) else {
            // Missing role disqualifies the entry.
            continue;
        };
        let content = msg
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match role {
            "system" => system = Some(content),
            "user" => {
                if users.len() < max_user_messages {
                    users.push(content);
                }
            }
            _ => {}
        }
    }

    if system.is_none() && users.is_empty() {
        warn!(request_id, "no recognizable chat messages in payload");
        return Ok(py_repr(payload));
    }

    let mut components = Vec::with_capacity(1 + users.len());
    if let Some(system) = system {
        components.push(format!("system:{system}"));
    }
    for (i, content) in users.iter().enumerate() {
        components.push(format!("user_{i}:{content}"));
    }

    Ok(components.join("|"))
}

fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// A deterministic, Python-`str()`-shaped rendering of a JSON value.
///
/// This is only used for the "no recognizable chat shape" fallback path,
/// where the exact text doesn't need to match the original Python process
/// byte-for-byte — only be deterministic for equal inputs (P1) and distinct
/// for payloads that differ in any field (P2 requires equality only when the
/// messages prefix matches; this path is never reached when it does).
fn py_repr(v: &Value) -> String {
    match v {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{s}'"),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(py_repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{k}': {}", py_repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_key_is_stable() {
        // Known MD5("hello") = 5d41402abc4b2a76b9719d911017c592; first 8 bytes as u64.
        assert_eq!(hash_key("hello"), 0x5d41402abc4b2a76);
    }

    #[test]
    fn hash_key_is_deterministic_for_equal_inputs() {
        assert_eq!(hash_key("same-key"), hash_key("same-key"));
        assert_ne!(hash_key("same-key"), hash_key("different-key"));
    }

    // S1
    #[test]
    fn cache_key_extraction_system_and_single_user() {
        let payload = json!({
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "What is Python?"},
            ]
        });
        assert_eq!(
            extract_cache_key(&payload, "req-1", 2),
            "system:You are a helpful assistant.|user_0:What is Python?"
        );
    }

    // S2
    #[test]
    fn cache_key_extraction_truncates_user_messages() {
        let payload = json!({
            "messages": [
                {"role": "system", "content": "S"},
                {"role": "user", "content": "u1"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": "u2"},
                {"role": "user", "content": "u3"},
            ]
        });
        assert_eq!(
            extract_cache_key(&payload, "req-2", 2),
            "system:S|user_0:u1|user_1:u2"
        );
    }

    // S3
    #[test]
    fn cache_key_extraction_falls_back_to_payload_repr() {
        let payload = json!({"model": "x", "temperature": 0.7});
        let key = extract_cache_key(&payload, "req-3", 2);
        assert_ne!(key, "req-3");
        assert!(key.contains("model"));
    }

    #[test]
    fn cache_key_extraction_empty_payload_falls_back_to_request_id() {
        assert_eq!(extract_cache_key(&Value::Null, "req-4", 2), "req-4");
        assert_eq!(extract_cache_key(&json!({}), "req-4", 2), "req-4");
        assert_eq!(extract_cache_key(&json!([]), "req-4", 2), "req-4");
    }

    #[test]
    fn cache_key_extraction_system_only_has_no_user_suffix() {
        let payload = json!({"messages": [{"role": "system", "content": "S"}]});
        assert_eq!(extract_cache_key(&payload, "req-5", 2), "system:S");
    }

    #[test]
    fn cache_key_extraction_missing_role_disqualifies_entry() {
        let payload = json!({"messages": [{"content": "no role here"}]});
        let key = extract_cache_key(&payload, "req-6", 2);
        // Falls back to payload repr, not the request id, since the payload is non-empty.
        assert_ne!(key, "req-6");
    }

    #[test]
    fn cache_key_extraction_is_independent_of_unrelated_fields() {
        // P2: differing temperature/top_p/model shouldn't change the key.
        let a = json!({
            "model": "a", "temperature": 0.1,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let b = json!({
            "model": "b", "temperature": 0.9, "top_p": 0.5,
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert_eq!(
            extract_cache_key(&a, "req-7", 2),
            extract_cache_key(&b, "req-7", 2)
        );
    }

    #[test]
    fn cache_key_extraction_singleton_list_payload() {
        let payload = json!([{"messages": [{"role": "user", "content": "hi"}]}]);
        assert_eq!(extract_cache_key(&payload, "req-8", 2), "user_0:hi");
    }
}
