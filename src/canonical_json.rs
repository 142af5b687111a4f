//! RFC 8785 (JCS) canonical JSON serialisation.
//!
//! Signatures must be reproducible across languages, so the signing message
//! is the canonical byte form of the manifest: object keys sorted by Unicode
//! code point, no whitespace, minimal number forms, and the fixed JCS string
//! escaping rules. The signing flow strips the `signature` member before
//! canonicalising (see `canonicalize_for_signing`).

use serde_json::Value;

/// Serialise a JSON value into its canonical byte sequence.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out);
    out
}

/// Canonicalise a manifest value with the top-level `signature` member
/// removed. This is the exact message signed by the publisher.
pub fn canonicalize_for_signing(manifest: &Value) -> Vec<u8> {
    match manifest {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove("signature");
            canonicalize(&Value::Object(stripped))
        }
        other => canonicalize(other),
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // UTF-8 byte order equals Unicode code point order, so a plain
            // byte sort of the keys satisfies the JCS sorting rule.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut Vec<u8>) {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
        return;
    }
    if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
        return;
    }
    // Finite doubles only; serde_json rejects NaN/Infinity at parse time.
    let f = n.as_f64().unwrap_or(0.0);
    if f == 0.0 {
        // Covers minus zero, which JCS serialises as plain "0".
        out.push(b'0');
    } else if f.fract() == 0.0 && f.abs() < 1e21 {
        out.extend_from_slice(format!("{:.0}", f).as_bytes());
    } else {
        // serde_json's ryu output is the shortest round-trip form.
        out.extend_from_slice(n.to_string().as_bytes());
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{000C}' => out.extend_from_slice(b"\\f"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            // Non-ASCII stays as raw UTF-8 per JCS.
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
