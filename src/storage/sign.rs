//! HMAC signing for filesystem-store download URLs.
//!
//! The filesystem backend cannot mint provider presigned URLs, so it signs
//! `{key}\n{expires}` with a server secret and the storage proxy verifies the
//! signature before serving bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex signature over a key + expiry pair.
pub fn sign_download(secret: &[u8], key: &str, expires_unix: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(key.as_bytes());
    mac.update(b"\n");
    mac.update(expires_unix.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a download signature. Also rejects expired
/// links.
pub fn verify_download(secret: &[u8], key: &str, expires_unix: i64, sig_hex: &str) -> bool {
    if expires_unix < chrono::Utc::now().timestamp() {
        return false;
    }
    let Ok(sig) = hex::decode(sig_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(key.as_bytes());
    mac.update(b"\n");
    mac.update(expires_unix.to_string().as_bytes());
    mac.verify_slice(&sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let expires = chrono::Utc::now().timestamp() + 600;
        let sig = sign_download(b"secret", "ocr_jobs/a/result.zip", expires);
        assert!(verify_download(
            b"secret",
            "ocr_jobs/a/result.zip",
            expires,
            &sig
        ));
    }

    #[test]
    fn test_rejects_tampered_key() {
        let expires = chrono::Utc::now().timestamp() + 600;
        let sig = sign_download(b"secret", "ocr_jobs/a/result.zip", expires);
        assert!(!verify_download(
            b"secret",
            "ocr_jobs/b/result.zip",
            expires,
            &sig
        ));
    }

    #[test]
    fn test_rejects_expired() {
        let expires = chrono::Utc::now().timestamp() - 1;
        let sig = sign_download(b"secret", "k", expires);
        assert!(!verify_download(b"secret", "k", expires, &sig));
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let expires = chrono::Utc::now().timestamp() + 600;
        let sig = sign_download(b"secret", "k", expires);
        assert!(!verify_download(b"other", "k", expires, &sig));
    }
}
