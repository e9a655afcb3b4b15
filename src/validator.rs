//! Pre-queue validation of wire events

use crate::event::{HeaderMap, WireEvent};
use serde::Serialize;

/// Exclusive upper bound on the encoded size of a queued event, in bytes
pub const MAX_EVENT_BYTES: usize = 20 * 1024;

#[derive(Serialize)]
struct Envelope<'a> {
    id: &'a str,
    name: &'a str,
    headers: &'a HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooLarge(usize),
    UnpairedSurrogate,
}

/// Accept the event when it fits the size ceiling and is well-formed text.
pub fn validate(event: &WireEvent) -> bool {
    check(event).is_ok()
}

pub fn check(event: &WireEvent) -> Result<(), Rejection> {
    let envelope = Envelope {
        id: &event.id,
        name: &event.name,
        headers: &event.headers,
    };
    // serializing borrowed strings and string/number maps cannot fail
    let mut encoded = serde_json::to_string(&envelope).unwrap_or_default();
    encoded.push_str(&event.payload);

    if encoded.len() >= MAX_EVENT_BYTES {
        return Err(Rejection::TooLarge(encoded.len()));
    }

    if has_unpaired_surrogate(&encoded) {
        return Err(Rejection::UnpairedSurrogate);
    }

    Ok(())
}

/// Detect `\uXXXX` escapes that encode a lone UTF-16 surrogate half.
///
/// Native Rust strings cannot hold surrogates, so the only way one reaches us
/// is as an escape inside pre-serialized JSON text.
pub fn has_unpaired_surrogate(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut pending_high = false;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            if pending_high {
                return true;
            }
            i += 1;
            continue;
        }

        // an escaped backslash is not the start of a \u escape
        if bytes.get(i + 1) == Some(&b'\\') {
            if pending_high {
                return true;
            }
            i += 2;
            continue;
        }

        let unit = match bytes.get(i + 1) {
            Some(b'u') => parse_hex4(bytes.get(i + 2..i + 6)),
            _ => None,
        };

        match unit {
            Some(unit) if (0xD800..=0xDBFF).contains(&unit) => {
                if pending_high {
                    return true;
                }
                pending_high = true;
                i += 6;
            }
            Some(unit) if (0xDC00..=0xDFFF).contains(&unit) => {
                if !pending_high {
                    return true;
                }
                pending_high = false;
                i += 6;
            }
            Some(_) => {
                if pending_high {
                    return true;
                }
                i += 6;
            }
            None => {
                if pending_high {
                    return true;
                }
                i += 2;
            }
        }
    }

    pending_high
}

fn parse_hex4(digits: Option<&[u8]>) -> Option<u32> {
    let digits = std::str::from_utf8(digits?).ok()?;
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_payload(payload: &str) -> WireEvent {
        WireEvent::new(
            "6f1c8d9e-0000-4000-8000-000000000001".to_string(),
            "purchase".to_string(),
            HeaderMap::new(),
            payload.to_string(),
        )
    }

    fn envelope_len() -> usize {
        let event = event_with_payload("");
        serde_json::to_string(&Envelope {
            id: &event.id,
            name: &event.name,
            headers: &event.headers,
        })
        .unwrap()
        .len()
    }

    #[test]
    fn test_accepts_small_payload() {
        assert!(validate(&event_with_payload(r#"{"item":"sword","price":12}"#)));
    }

    #[test]
    fn test_size_ceiling_is_exclusive() {
        let room = MAX_EVENT_BYTES - envelope_len();

        let just_fits = event_with_payload(&"a".repeat(room - 1));
        assert!(validate(&just_fits));

        let at_limit = event_with_payload(&"a".repeat(room));
        assert_eq!(check(&at_limit), Err(Rejection::TooLarge(MAX_EVENT_BYTES)));
    }

    #[test]
    fn test_size_counts_utf8_bytes_not_chars() {
        // each 'é' is two bytes
        let room = MAX_EVENT_BYTES - envelope_len();
        let event = event_with_payload(&"é".repeat(room / 2 + 1));
        assert!(!validate(&event));
    }

    #[test]
    fn test_rejects_lone_high_surrogate() {
        assert!(!validate(&event_with_payload(r#"{"nick":"\ud800"}"#)));
        assert!(!validate(&event_with_payload(r#"{"nick":"\uD83Dx"}"#)));
    }

    #[test]
    fn test_rejects_lone_low_surrogate() {
        assert_eq!(
            check(&event_with_payload(r#"{"nick":"\udc00abc"}"#)),
            Err(Rejection::UnpairedSurrogate)
        );
    }

    #[test]
    fn test_accepts_surrogate_pair() {
        assert!(validate(&event_with_payload(r#"{"nick":"\ud83d\ude00"}"#)));
    }

    #[test]
    fn test_escaped_backslash_is_not_an_escape() {
        // the text is a literal backslash followed by "ud800"
        assert!(validate(&event_with_payload(r#"{"path":"C:\\ud800"}"#)));
    }

    #[test]
    fn test_accepts_native_emoji() {
        assert!(validate(&event_with_payload(r#"{"nick":"😀"}"#)));
    }
}
