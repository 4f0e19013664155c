//! Signed relay credentials.
//!
//! The API service mints a token per user with its Ed25519 signing key; the
//! relay only holds the public half. A token is the string
//! `<valid_until_unix>.<hex signature>`, where the signature covers
//! `kultura-relay:<user_id>:<valid_until_unix>`.

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::constants::CREDENTIAL_CONTEXT;
use crate::error::CredentialError;
use crate::types::UserId;

fn signed_payload(user_id: UserId, valid_until: i64) -> Vec<u8> {
    format!("{CREDENTIAL_CONTEXT}:{user_id}:{valid_until}").into_bytes()
}

/// Mint a token for `user_id` that expires at `valid_until`.
pub fn create_credential_token(
    user_id: UserId,
    valid_until: DateTime<Utc>,
    signing_key: &SigningKey,
) -> String {
    let expiry = valid_until.timestamp();
    let signature = signing_key.sign(&signed_payload(user_id, expiry));
    format!("{}.{}", expiry, hex::encode(signature.to_bytes()))
}

/// Check a token presented by `user_id` against the issuer's public key.
pub fn check_credential_with_key(
    user_id: UserId,
    token: &str,
    issuer_pubkey: &[u8; 32],
) -> Result<DateTime<Utc>, CredentialError> {
    let (expiry, signature_hex) = token.split_once('.').ok_or(CredentialError::BadFormat)?;

    let expiry: i64 = expiry.parse().map_err(|_| CredentialError::BadExpiry)?;
    let valid_until = Utc
        .timestamp_opt(expiry, 0)
        .single()
        .ok_or(CredentialError::BadExpiry)?;
    if Utc::now() > valid_until {
        return Err(CredentialError::Expired);
    }

    let signature_bytes =
        hex::decode(signature_hex).map_err(|_| CredentialError::BadSignatureEncoding)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| CredentialError::BadSignature)?;

    let verifying_key =
        VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| CredentialError::InvalidKey)?;

    verifying_key
        .verify(&signed_payload(user_id, expiry), &signature)
        .map_err(|_| CredentialError::BadSignature)?;

    Ok(valid_until)
}
