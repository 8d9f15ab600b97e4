//! Webhook signature verification
//!
//! The processor signs each delivery with `HMAC-SHA256(secret, "<t>.<payload>")`
//! and sends `t=<unix-ts>,v1=<hex-hmac>` in the signature header. Several
//! `v1` entries may be present while a secret is being rotated.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `t=...,v1=...`. Returns `None` when either key is missing.
    pub fn parse(header: &str) -> Option<Self> {
        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "t" => timestamp = value.trim().parse().ok(),
                "v1" => signatures.push(value.trim().to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp?;
        if signatures.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verify a webhook payload against its signature header.
///
/// Never errors: any missing piece (secret, `t`, `v1`, bad hex) is a `false`.
pub fn verify(payload: &[u8], header: &str, secret: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured; rejecting delivery");
        return false;
    }

    let Some(parsed) = SignatureHeader::parse(header) else {
        tracing::debug!("Signature header missing t or v1");
        return false;
    };

    matches_any(payload, &parsed, secret)
}

fn matches_any(payload: &[u8], header: &SignatureHeader, secret: &str) -> bool {
    header.signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(header.timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice compares in constant time
        mac.verify_slice(&expected).is_ok()
    })
}

/// Compute the `v1` value for a payload. Used by tests and local tooling
/// that need to produce deliveries the verifier accepts.
pub fn sign(payload: &[u8], timestamp: i64, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Secret-holding verifier with an optional replay window.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret_configured", &self.secret.is_some())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        let secret = secret.filter(|s| !s.is_empty());
        if secret.is_none() {
            tracing::warn!("Webhook secret not configured - all webhook deliveries will be rejected");
        }
        Self {
            secret,
            tolerance_secs: tolerance_secs.max(0),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify the signature and, when a tolerance is set, that the signed
    /// timestamp lies within `tolerance_secs` of `now`.
    pub fn verify_at(&self, payload: &[u8], header: &str, now: OffsetDateTime) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            tracing::warn!("Webhook secret not configured; rejecting delivery");
            return false;
        };

        if !verify(payload, header, secret) {
            return false;
        }

        if self.tolerance_secs == 0 {
            return true;
        }

        // verify() already parsed it successfully
        let Some(parsed) = SignatureHeader::parse(header) else {
            return false;
        };
        let skew = (now.unix_timestamp() - parsed.timestamp).abs();
        if skew > self.tolerance_secs {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now.unix_timestamp(),
                skew,
                tolerance = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"type":"invoice.paid","data":{"object":{}}}"#;

    fn header_for(payload: &[u8], ts: i64, secret: &str) -> String {
        format!("t={},v1={}", ts, sign(payload, ts, secret))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let header = header_for(PAYLOAD, 1_700_000_000, SECRET);
        assert!(verify(PAYLOAD, &header, SECRET));
    }

    #[test]
    fn test_any_flipped_payload_byte_rejected() {
        let header = header_for(PAYLOAD, 1_700_000_000, SECRET);
        for i in 0..PAYLOAD.len() {
            let mut tampered = PAYLOAD.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify(&tampered, &header, SECRET), "byte {} flipped", i);
        }
    }

    #[test]
    fn test_any_flipped_signature_char_rejected() {
        let ts = 1_700_000_000;
        let sig = sign(PAYLOAD, ts, SECRET);
        for i in 0..sig.len() {
            let mut chars: Vec<char> = sig.chars().collect();
            chars[i] = if chars[i] == '0' { '1' } else { '0' };
            let tampered: String = chars.into_iter().collect();
            let header = format!("t={},v1={}", ts, tampered);
            assert!(!verify(PAYLOAD, &header, SECRET), "char {} flipped", i);
        }
    }

    #[test]
    fn test_missing_keys_rejected() {
        let ts = 1_700_000_000;
        let sig = sign(PAYLOAD, ts, SECRET);
        assert!(!verify(PAYLOAD, &format!("v1={}", sig), SECRET));
        assert!(!verify(PAYLOAD, &format!("t={}", ts), SECRET));
        assert!(!verify(PAYLOAD, "", SECRET));
        assert!(!verify(PAYLOAD, "garbage", SECRET));
    }

    #[test]
    fn test_wrong_timestamp_rejected() {
        let sig = sign(PAYLOAD, 1_700_000_000, SECRET);
        let header = format!("t={},v1={}", 1_700_000_001, sig);
        assert!(!verify(PAYLOAD, &header, SECRET));
    }

    #[test]
    fn test_empty_secret_always_fails() {
        let header = header_for(PAYLOAD, 1_700_000_000, "");
        assert!(!verify(PAYLOAD, &header, ""));
    }

    #[test]
    fn test_rotated_signatures_any_match() {
        let ts = 1_700_000_000;
        let stale = sign(PAYLOAD, ts, "whsec_old");
        let fresh = sign(PAYLOAD, ts, SECRET);
        let header = format!("t={},v1={},v1={},v0=deadbeef", ts, stale, fresh);
        assert!(verify(PAYLOAD, &header, SECRET));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let header = "t=1700000000,v1=not-hex-at-all";
        assert!(!verify(PAYLOAD, header, SECRET));
    }

    #[test]
    fn test_verifier_tolerance_window() {
        let ts = 1_700_000_000;
        let header = header_for(PAYLOAD, ts, SECRET);
        let verifier = SignatureVerifier::new(Some(SECRET.to_string()), 300);

        let at = |secs| OffsetDateTime::from_unix_timestamp(secs).unwrap();
        assert!(verifier.verify_at(PAYLOAD, &header, at(ts + 300)));
        assert!(!verifier.verify_at(PAYLOAD, &header, at(ts + 301)));
        assert!(!verifier.verify_at(PAYLOAD, &header, at(ts - 301)));
    }

    #[test]
    fn test_verifier_zero_tolerance_disables_window() {
        let ts = 1_700_000_000;
        let header = header_for(PAYLOAD, ts, SECRET);
        let verifier = SignatureVerifier::new(Some(SECRET.to_string()), 0);
        let much_later = OffsetDateTime::from_unix_timestamp(ts + 86_400).unwrap();
        assert!(verifier.verify_at(PAYLOAD, &header, much_later));
    }

    #[test]
    fn test_unconfigured_verifier_rejects() {
        let ts = 1_700_000_000;
        let header = header_for(PAYLOAD, ts, SECRET);
        let verifier = SignatureVerifier::new(None, 300);
        assert!(!verifier.is_configured());
        let now = OffsetDateTime::from_unix_timestamp(ts).unwrap();
        assert!(!verifier.verify_at(PAYLOAD, &header, now));
    }
}
