use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Issued timestamps may run ahead of the verifier's clock by at most this.
pub const CLOCK_SKEW_SECS: i64 = 60;

/// Expiry value of a permanent signature, invalidated only by secret rotation.
pub const PERMANENT: i64 = 0;

/// `sign=` and `ts=` query parameters for a signed proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedQuery {
    pub sign: String,
    pub ts: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignError {
    #[error("malformed signature")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
    #[error("signature expired")]
    Expired,
    #[error("signature timestamp is in the future")]
    FutureTimestamp,
}

fn compute(path: &str, secret: &[u8], ts: i64, expires_at: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(expires_at.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Sign a canonical path with the mount secret at time `now` (unix seconds).
///
/// `expires_at = None` produces a permanent signature; otherwise the absolute
/// expiry instant is folded into the signature so it cannot be stripped.
pub fn sign_path(path: &str, secret: &[u8], now: i64, expires_at: Option<i64>) -> SignedQuery {
    let expires_at = expires_at.unwrap_or(PERMANENT);
    let sig = compute(path, secret, now, expires_at);
    SignedQuery {
        sign: format!("{sig}.{expires_at}"),
        ts: now,
    }
}

/// Verify a `sign=`/`ts=` pair against a canonical path and secret.
///
/// Rejects timestamps more than [`CLOCK_SKEW_SECS`] in the future, expired
/// temporary signatures, and any signature not produced with `secret`.
/// Comparison of the HMAC is constant-time.
pub fn verify_path(
    path: &str,
    secret: &[u8],
    sign: &str,
    ts: i64,
    now: i64,
) -> Result<(), SignError> {
    let (sig, expires_at) = sign.rsplit_once('.').ok_or(SignError::Malformed)?;
    let expires_at: i64 = expires_at.parse().map_err(|_| SignError::Malformed)?;
    let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| SignError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(expires_at.to_string().as_bytes());
    mac.verify_slice(&sig).map_err(|_| SignError::Mismatch)?;

    if ts > now + CLOCK_SKEW_SECS {
        return Err(SignError::FutureTimestamp);
    }
    if expires_at != PERMANENT && now > expires_at {
        return Err(SignError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"mount-secret";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_permanent_round_trip() {
        let q = sign_path("/m/a/b.txt", SECRET, NOW, None);
        assert!(q.sign.ends_with(".0"));
        assert_eq!(verify_path("/m/a/b.txt", SECRET, &q.sign, q.ts, NOW), Ok(()));
        // A permanent signature remains valid arbitrarily far in the future.
        assert_eq!(
            verify_path("/m/a/b.txt", SECRET, &q.sign, q.ts, NOW + 365 * 86_400),
            Ok(())
        );
    }

    #[test]
    fn test_temporary_expiry() {
        let q = sign_path("/m/a", SECRET, NOW, Some(NOW + 300));
        assert_eq!(verify_path("/m/a", SECRET, &q.sign, q.ts, NOW + 299), Ok(()));
        assert_eq!(
            verify_path("/m/a", SECRET, &q.sign, q.ts, NOW + 301),
            Err(SignError::Expired)
        );
    }

    #[test]
    fn test_expiry_cannot_be_stripped() {
        let q = sign_path("/m/a", SECRET, NOW, Some(NOW + 300));
        let (sig, _) = q.sign.rsplit_once('.').unwrap();
        let forged = format!("{sig}.0");
        assert_eq!(
            verify_path("/m/a", SECRET, &forged, q.ts, NOW),
            Err(SignError::Mismatch)
        );
    }

    #[test]
    fn test_skew_and_rotation() {
        let q = sign_path("/m/a", SECRET, NOW + CLOCK_SKEW_SECS + 1, None);
        assert_eq!(
            verify_path("/m/a", SECRET, &q.sign, q.ts, NOW),
            Err(SignError::FutureTimestamp)
        );

        let q = sign_path("/m/a", SECRET, NOW, None);
        assert_eq!(
            verify_path("/m/a", b"rotated", &q.sign, q.ts, NOW),
            Err(SignError::Mismatch)
        );
        assert_eq!(
            verify_path("/m/other", SECRET, &q.sign, q.ts, NOW),
            Err(SignError::Mismatch)
        );
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            verify_path("/m/a", SECRET, "nodot", 1, NOW),
            Err(SignError::Malformed)
        );
        assert_eq!(
            verify_path("/m/a", SECRET, "sig.notanumber", 1, NOW),
            Err(SignError::Malformed)
        );
        assert_eq!(
            verify_path("/m/a", SECRET, "!!!.0", 1, NOW),
            Err(SignError::Malformed)
        );
    }
}
