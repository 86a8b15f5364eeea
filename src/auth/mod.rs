use thiserror::Error;

mod token;
mod webhook;

pub use token::{AccessClaims, ClaimType, TokenVerifier};
pub use webhook::{WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER, WebhookVerifier};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("you must provide an authorisation jwt to show that you are permitted to access the room")]
    MissingToken,
    #[error("unable to verify supplied access token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("invalid access token public key: {0}")]
    PublicKey(jsonwebtoken::errors::Error),
    #[error("webhook secret is not valid base64")]
    WebhookSecret,
    #[error("webhook request is missing the {0} header")]
    MissingWebhookHeader(&'static str),
    #[error("webhook signature does not match")]
    WebhookSignature,
}
