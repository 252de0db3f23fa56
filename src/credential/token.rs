use chrono::{DateTime, TimeZone, Utc};
use data_encoding::BASE64URL_NOPAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub type HmacSha256 = Hmac<Sha256>;

/// A credential token: an identity and issuance time bound together by
/// a keyed hash over the identity's enrolment secret. Tokens are never
/// persisted; they are regenerated on demand and validated against the
/// secret plus a short validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialToken {
    identity: String,
    issued_at: DateTime<Utc>,
    signature: Vec<u8>,
}

impl CredentialToken {
    /// Sign `identity || issued_at` with the identity's bound secret.
    pub(crate) fn sign(identity: &str, issued_at: DateTime<Utc>, secret: &[u8]) -> Self {
        let signature = Self::mac(identity, issued_at, secret)
            .finalize()
            .into_bytes()
            .to_vec();
        Self {
            identity: identity.to_string(),
            issued_at,
            signature,
        }
    }

    fn mac(identity: &str, issued_at: DateTime<Utc>, secret: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
        mac.update(identity.as_bytes());
        mac.update(&issued_at.timestamp().to_be_bytes());
        mac
    }

    /// Recompute the expected signature from the claimed identity's
    /// secret and compare in constant time.
    pub(crate) fn verify_signature(&self, secret: &[u8]) -> bool {
        Self::mac(&self.identity, self.issued_at, secret)
            .verify_slice(&self.signature)
            .is_ok()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Encode for transport as an opaque string:
    /// `base64url(identity).issued_at_seconds.base64url(signature)`.
    pub fn encode(&self) -> String {
        format!(
            "{}.{}.{}",
            BASE64URL_NOPAD.encode(self.identity.as_bytes()),
            self.issued_at.timestamp(),
            BASE64URL_NOPAD.encode(&self.signature),
        )
    }

    pub fn decode(token: &str) -> Result<Self, TokenParseError> {
        let mut parts = token.split('.');
        let (identity, issued_at, signature) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(identity), Some(issued_at), Some(signature), None) => {
                    (identity, issued_at, signature)
                }
                _ => return Err(TokenParseError::Structure),
            };

        let identity = BASE64URL_NOPAD
            .decode(identity.as_bytes())
            .map_err(|_| TokenParseError::Encoding)
            .and_then(|bytes| String::from_utf8(bytes).map_err(|_| TokenParseError::Encoding))?;

        let issued_at = issued_at
            .parse::<i64>()
            .ok()
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
            .ok_or(TokenParseError::Timestamp)?;

        let signature = BASE64URL_NOPAD
            .decode(signature.as_bytes())
            .map_err(|_| TokenParseError::Encoding)?;

        Ok(Self {
            identity,
            issued_at,
            signature,
        })
    }
}

#[derive(Debug, Error)]
pub enum TokenParseError {
    #[error("token must contain exactly three dot-separated parts")]
    Structure,
    #[error("token part is not valid base64url")]
    Encoding,
    #[error("token timestamp is not a decimal unix timestamp")]
    Timestamp,
}
