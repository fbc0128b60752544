//! Wire envelope types for the room relay.
//!
//! Every frame is a UTF-8 JSON object `{"t": "<TYPE>", "d": {...}}`.  The
//! payload `d` is opaque to the server except for the handful of fields the
//! relay needs: the ciphertext carrier fields of persisted types and the
//! replay watermark of `READY`.  The server never interprets ciphertext.
//!
//! Ingress base64 is deliberately promiscuous — standard, standard-no-pad,
//! URL-safe, and URL-safe-no-pad alphabets are all accepted so evolving
//! clients keep working — while egress is always URL-safe without padding.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope payload version emitted by the server.
pub const PROTOCOL_VERSION: u32 = 1;

/// A framed message: type tag plus opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "d", default)]
    pub payload: Value,
}

impl Envelope {
    /// Parse a text frame.  Returns `None` for anything that is not a JSON
    /// object with a string `t` — such frames are dropped silently.
    pub fn parse(text: &str) -> Option<Self> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        if envelope.kind.is_empty() {
            return None;
        }
        Some(envelope)
    }
}

/// Whether the payload of this envelope type is persisted for replay.
pub fn is_persisted(kind: &str) -> bool {
    matches!(kind, "MSG" | "IMG_META" | "IMG_CHUNK" | "IMG_END")
}

/// Whether this envelope type is relayed to peers verbatim, without the
/// server looking at its payload.
pub fn is_relayed_verbatim(kind: &str) -> bool {
    kind == "HELLO"
}

#[derive(Debug, PartialEq, Eq)]
pub enum PayloadError {
    MissingField(&'static str),
    BadEncoding(&'static str),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::MissingField(field) => write!(f, "missing {field}"),
            PayloadError::BadEncoding(field) => write!(f, "invalid {field} encoding"),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Decoded ciphertext carrier of a persisted envelope.
#[derive(Debug)]
pub struct CipherPayload {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Extract nonce and ciphertext bytes from a persisted payload, accepting
/// both the compact (`n`/`c`) and long (`nonce`/`ciphertext`) field names.
pub fn decode_cipher_payload(payload: &Value) -> Result<CipherPayload, PayloadError> {
    let nonce_b64 = string_field(payload, "nonce", "n")
        .ok_or(PayloadError::MissingField("nonce"))?;
    let ciphertext_b64 = string_field(payload, "ciphertext", "c")
        .ok_or(PayloadError::MissingField("ciphertext"))?;

    let nonce =
        decode_base64_lenient(nonce_b64).ok_or(PayloadError::BadEncoding("nonce"))?;
    let ciphertext =
        decode_base64_lenient(ciphertext_b64).ok_or(PayloadError::BadEncoding("ciphertext"))?;

    Ok(CipherPayload { nonce, ciphertext })
}

fn string_field<'a>(payload: &'a Value, long: &str, short: &str) -> Option<&'a str> {
    for key in [long, short] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Decode base64 in any of the four common alphabets.
pub fn decode_base64_lenient(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        return None;
    }
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .or_else(|_| URL_SAFE.decode(value))
        .or_else(|_| URL_SAFE_NO_PAD.decode(value))
        .ok()
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    message: &'a str,
}

/// Build an `ERROR` frame addressed to a single sender.
pub fn error_frame(code: &str, message: &str) -> String {
    frame("ERROR", &ErrorPayload { code, message })
}

#[derive(Serialize)]
struct HistoryPayload<'a> {
    v: u32,
    seq: i64,
    n: &'a str,
    c: &'a str,
}

/// Re-frame a stored message for history replay, under its original type.
pub fn history_frame(message_type: &str, seq: i64, nonce: &[u8], ciphertext: &[u8]) -> String {
    frame(
        message_type,
        &HistoryPayload {
            v: PROTOCOL_VERSION,
            seq,
            n: &URL_SAFE_NO_PAD.encode(nonce),
            c: &URL_SAFE_NO_PAD.encode(ciphertext),
        },
    )
}

fn frame<T: Serialize>(kind: &str, payload: &T) -> String {
    serde_json::to_string(&serde_json::json!({
        "t": kind,
        "d": payload,
    }))
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_requires_a_type_tag() {
        assert!(Envelope::parse(r#"{"t":"MSG","d":{"n":"AA"}}"#).is_some());
        assert!(Envelope::parse(r#"{"d":{"n":"AA"}}"#).is_none());
        assert!(Envelope::parse(r#"{"t":""}"#).is_none());
        assert!(Envelope::parse("not json").is_none());
        assert!(Envelope::parse(r#"{"t":42}"#).is_none());

        // Payload is optional; it defaults to null.
        let bare = Envelope::parse(r#"{"t":"HELLO"}"#).unwrap();
        assert_eq!(bare.kind, "HELLO");
        assert!(bare.payload.is_null());
    }

    #[test]
    fn type_classification() {
        for kind in ["MSG", "IMG_META", "IMG_CHUNK", "IMG_END"] {
            assert!(is_persisted(kind), "{kind}");
        }
        assert!(!is_persisted("HELLO"));
        assert!(!is_persisted("READY"));
        assert!(is_relayed_verbatim("HELLO"));
        assert!(!is_relayed_verbatim("TYPING"));
    }

    #[test]
    fn all_four_base64_alphabets_decode_to_the_same_bytes() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let encodings = [
            STANDARD.encode(&bytes),
            STANDARD_NO_PAD.encode(&bytes),
            URL_SAFE.encode(&bytes),
            URL_SAFE_NO_PAD.encode(&bytes),
        ];
        for encoded in &encodings {
            assert_eq!(decode_base64_lenient(encoded).as_deref(), Some(&bytes[..]));
        }
        assert!(decode_base64_lenient("").is_none());
        assert!(decode_base64_lenient("not base64 !!!").is_none());
    }

    #[test]
    fn cipher_payload_accepts_short_and_long_field_names() {
        let short = json!({"v": 1, "seq": 0, "n": "AAAA", "c": "ZW5jcnlwdGVk"});
        let decoded = decode_cipher_payload(&short).unwrap();
        assert_eq!(decoded.nonce, vec![0, 0, 0]);
        assert_eq!(decoded.ciphertext, b"encrypted");

        let long = json!({"nonce": "AAAA", "ciphertext": "ZW5jcnlwdGVk"});
        let decoded = decode_cipher_payload(&long).unwrap();
        assert_eq!(decoded.ciphertext, b"encrypted");

        // Long form wins when both are present but empty strings fall through.
        let mixed = json!({"nonce": "", "n": "AAAA", "c": "ZW5jcnlwdGVk"});
        assert_eq!(decode_cipher_payload(&mixed).unwrap().nonce, vec![0, 0, 0]);
    }

    #[test]
    fn cipher_payload_reports_missing_and_bad_fields() {
        let no_cipher = json!({"n": "AAAA"});
        assert_eq!(
            decode_cipher_payload(&no_cipher).unwrap_err(),
            PayloadError::MissingField("ciphertext")
        );

        let bad_nonce = json!({"n": "@@@", "c": "ZW5jcnlwdGVk"});
        assert_eq!(
            decode_cipher_payload(&bad_nonce).unwrap_err(),
            PayloadError::BadEncoding("nonce")
        );

        let empty = json!({});
        assert_eq!(
            decode_cipher_payload(&empty).unwrap_err(),
            PayloadError::MissingField("nonce")
        );
    }

    #[test]
    fn error_frame_shape() {
        let frame = error_frame("MSG_REJECTED", "missing nonce");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["t"], "ERROR");
        assert_eq!(value["d"]["code"], "MSG_REJECTED");
        assert_eq!(value["d"]["message"], "missing nonce");
    }

    #[test]
    fn history_frame_emits_url_safe_unpadded_base64() {
        let nonce = [0xfb, 0xff, 0xfe];
        let frame = history_frame("IMG_CHUNK", 7, &nonce, b"payload");
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["t"], "IMG_CHUNK");
        assert_eq!(value["d"]["v"], 1);
        assert_eq!(value["d"]["seq"], 7);
        // URL-safe alphabet, no padding.
        assert_eq!(value["d"]["n"], "-__-");
        let roundtrip = decode_base64_lenient(value["d"]["c"].as_str().unwrap()).unwrap();
        assert_eq!(roundtrip, b"payload");
    }
}
