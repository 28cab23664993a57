use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEX_LEN: usize = 64;

/// Checks `signature_header` against HMAC-SHA256 of `"{body}.{timestamp}"`.
///
/// The signature must be the lower-case hex digest. Decoded bytes are
/// compared through `Mac::verify_slice`, which is constant time. Any missing
/// or malformed input yields `false`.
pub fn verify(
    raw_body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    shared_secret: &str,
) -> bool {
    if shared_secret.is_empty() {
        return false;
    }
    let signature = signature_header.trim();
    if signature.len() != SIGNATURE_HEX_LEN
        || !signature
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return false;
    }
    let timestamp = timestamp_header.trim();
    if parse_timestamp(timestamp).is_none() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Inclusive on both sides: `|now - timestamp| <= window_secs`.
pub fn within_window(timestamp: i64, now: i64, window_secs: i64) -> bool {
    if window_secs < 0 {
        return false;
    }
    now.abs_diff(timestamp) <= window_secs as u64
}

pub fn parse_timestamp(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<i64>().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// Development mode without a configured secret.
    Skipped,
    Rejected(&'static str),
}

#[derive(Debug, Clone)]
pub struct WebhookAuth {
    secret: Option<String>,
    dev_mode: bool,
    window_secs: i64,
}

impl WebhookAuth {
    pub fn new(secret: Option<String>, dev_mode: bool, window_secs: i64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            dev_mode,
            window_secs,
        }
    }

    pub fn check(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
        now: i64,
    ) -> Verification {
        let Some(secret) = self.secret.as_deref() else {
            if self.dev_mode {
                return Verification::Skipped;
            }
            return Verification::Rejected("webhook secret not configured");
        };

        let Some(timestamp) = timestamp.and_then(|t| parse_timestamp(t).map(|ts| (t, ts))) else {
            return Verification::Rejected("missing or malformed timestamp");
        };
        if !verify(raw_body, signature.unwrap_or(""), timestamp.0, secret) {
            return Verification::Rejected("invalid signature");
        }
        if !within_window(timestamp.1, now, self.window_secs) {
            return Verification::Rejected("request outside replay window");
        }
        Verification::Verified
    }
}

#[cfg(test)]
pub(crate) fn sign(raw_body: &[u8], timestamp: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(raw_body);
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"event_name":"chat_started","chat_id":"c1"}"#;

    #[test]
    fn accepts_correct_signature() {
        let sig = sign(BODY, "1700000000", SECRET);
        assert!(verify(BODY, &sig, "1700000000", SECRET));
    }

    #[test]
    fn rejects_any_single_byte_flip() {
        let sig = sign(BODY, "1700000000", SECRET);
        for index in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[index] = if bytes[index] == b'0' { b'1' } else { b'0' };
            let flipped = String::from_utf8(bytes).unwrap();
            assert!(!verify(BODY, &flipped, "1700000000", SECRET), "index {index}");
        }
    }

    #[test]
    fn upper_case_digest_is_malformed() {
        let sig = sign(BODY, "1700000000", SECRET).to_ascii_uppercase();
        assert!(!verify(BODY, &sig, "1700000000", SECRET));
    }

    #[test]
    fn rejects_wrong_timestamp_or_body() {
        let sig = sign(BODY, "1700000000", SECRET);
        assert!(!verify(BODY, &sig, "1700000001", SECRET));
        assert!(!verify(b"{}", &sig, "1700000000", SECRET));
    }

    #[test]
    fn missing_inputs_are_false() {
        let sig = sign(BODY, "1700000000", SECRET);
        assert!(!verify(BODY, &sig, "1700000000", ""));
        assert!(!verify(BODY, "", "1700000000", SECRET));
        assert!(!verify(BODY, &sig, "", SECRET));
        assert!(!verify(BODY, &sig, "yesterday", SECRET));
        assert!(!verify(BODY, "not-hex", "1700000000", SECRET));
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let now = 1_700_000_000;
        assert!(within_window(now - 180, now, 180));
        assert!(!within_window(now - 181, now, 180));
        assert!(within_window(now + 180, now, 180));
        assert!(!within_window(now + 181, now, 180));
        assert!(within_window(now, now, 180));
    }

    #[test]
    fn auth_check_covers_replay_and_dev_mode() {
        let now = 1_700_000_000;
        let auth = WebhookAuth::new(Some(SECRET.to_string()), false, 180);

        let fresh = (now - 180).to_string();
        let sig = sign(BODY, &fresh, SECRET);
        assert_eq!(
            auth.check(BODY, Some(&sig), Some(&fresh), now),
            Verification::Verified
        );

        let stale = (now - 181).to_string();
        let sig = sign(BODY, &stale, SECRET);
        assert_eq!(
            auth.check(BODY, Some(&sig), Some(&stale), now),
            Verification::Rejected("request outside replay window")
        );
        assert_eq!(
            auth.check(BODY, Some(&sig), None, now),
            Verification::Rejected("missing or malformed timestamp")
        );

        let unconfigured = WebhookAuth::new(None, false, 180);
        assert!(matches!(
            unconfigured.check(BODY, None, None, now),
            Verification::Rejected(_)
        ));
        let dev = WebhookAuth::new(Some(String::new()), true, 180);
        assert_eq!(dev.check(BODY, None, None, now), Verification::Skipped);
    }
}
