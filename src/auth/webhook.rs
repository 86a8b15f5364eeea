use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::Sha256;

use super::AuthError;

pub const WEBHOOK_TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

/// Authenticates provider webhooks.
///
/// The provider signs `"{timestamp}.{body}"`, where body is the compact JSON
/// event, with HMAC-SHA256 under a base64-encoded shared secret and sends the
/// base64 digest alongside the timestamp.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        let secret = STANDARD.decode(secret.trim()).map_err(|_| AuthError::WebhookSecret)?;
        Ok(Self { secret })
    }

    fn mac(&self, timestamp: &str, body: &JsonValue) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::WebhookSecret)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(script_form(body).to_string().as_bytes());
        Ok(mac)
    }

    pub fn verify(&self, timestamp: &str, signature: &str, body: &JsonValue) -> Result<(), AuthError> {
        let signature = STANDARD.decode(signature.trim()).map_err(|_| AuthError::WebhookSignature)?;
        self.mac(timestamp, body)?
            .verify_slice(&signature)
            .map_err(|_| AuthError::WebhookSignature)
    }

    #[cfg(test)]
    pub(crate) fn sign(&self, timestamp: &str, body: &JsonValue) -> String {
        let mac = self.mac(timestamp, body).unwrap();
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

/// Largest integer a double holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// The body as the provider serialized it. Its JSON writer prints integral
/// floats without a fraction, so `1.0` is signed as `1`.
fn script_form(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => JsonValue::from(f as i64),
            _ => value.clone(),
        },
        JsonValue::Array(items) => items.iter().map(script_form).collect(),
        JsonValue::Object(fields) => fields.iter().map(|(k, v)| (k.clone(), script_form(v))).collect(),
        _ => value.clone(),
    }
}
