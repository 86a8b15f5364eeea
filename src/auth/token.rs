use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

use super::AuthError;
use crate::ids::{CallType, ChatId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClaimType {
    StartVideoCall,
    JoinVideoCall,
}

/// What a verified access token allows its bearer to do.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessClaims {
    pub claim_type: ClaimType,
    pub user_id: UserId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub call_type: CallType,
}

impl AccessClaims {
    pub fn joining(&self) -> bool {
        self.claim_type == ClaimType::JoinVideoCall
    }
}

/// Checks ES256 access tokens minted by the messaging platform.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Accepts the key as PEM, with line breaks either real or escaped as `\n`
    /// the way they usually arrive through the environment.
    pub fn from_pem(public_key: &str) -> Result<Self, AuthError> {
        let pem = public_key.replace("\\n", "\n");
        let key = DecodingKey::from_ec_pem(pem.as_bytes()).map_err(AuthError::PublicKey)?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation).inspect_err(|err| {
            tracing::warn!(error = %err, "error verifying access token");
        })?;
        Ok(data.claims)
    }
}
