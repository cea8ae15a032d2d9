//! Write predicates: who may overwrite a key.
//!
//! The store asks the predicate on every put; the predicate decides and
//! names the key's owner. The shipped [`Ed25519Predicate`] implements
//! first-signer-owns: an unsigned key is open, a signed put claims it,
//! and afterwards only the same signer verifies. The trust decision is a
//! trait so deployments can swap in their own scheme.

use std::sync::Arc;

use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KvError;

/// A signed claim over `(key, value)`. The signer is the bs58-encoded
/// ed25519 public key; the signature is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedProof {
    pub signer: String,
    pub signature: String,
}

/// Canonical bytes a proof signs: key length, key, canonical JSON value.
fn signing_bytes(key: &str, value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 32);
    buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(serde_json::to_string(value).unwrap_or_default().as_bytes());
    buf
}

/// Produce a proof for a put.
pub fn sign_put(signing_key: &SigningKey, key: &str, value: &Value) -> SignedProof {
    use ed25519_dalek::Signer;
    let signature = signing_key.sign(&signing_bytes(key, value));
    SignedProof {
        signer: bs58::encode(signing_key.verifying_key().as_bytes()).into_string(),
        signature: base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            signature.to_bytes(),
        ),
    }
}

/// Decides whether a put may land and who owns the key afterwards.
pub trait WritePredicate: Send + Sync {
    /// Returns the new owner id (or `None` to leave the key unowned).
    fn permit(
        &self,
        existing_owner: Option<&str>,
        proof: Option<&SignedProof>,
        key: &str,
        value: &Value,
    ) -> Result<Option<String>, KvError>;
}

/// No ownership, every put lands. For rings that do not use signatures.
pub struct AllowAll;

impl WritePredicate for AllowAll {
    fn permit(
        &self,
        _existing_owner: Option<&str>,
        _proof: Option<&SignedProof>,
        _key: &str,
        _value: &Value,
    ) -> Result<Option<String>, KvError> {
        Ok(None)
    }
}

/// First signed put owns the key; later puts must carry the same signer.
pub struct Ed25519Predicate;

impl Ed25519Predicate {
    fn verify(proof: &SignedProof, key: &str, value: &Value) -> Result<(), KvError> {
        let pk_bytes: [u8; 32] = bs58::decode(&proof.signer)
            .into_vec()
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(KvError::VerifyError)?;
        let verifying = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| KvError::VerifyError)?;
        let sig_bytes: [u8; 64] = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &proof.signature,
        )
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or(KvError::VerifyError)?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying
            .verify(&signing_bytes(key, value), &signature)
            .map_err(|_| KvError::VerifyError)
    }
}

impl WritePredicate for Ed25519Predicate {
    fn permit(
        &self,
        existing_owner: Option<&str>,
        proof: Option<&SignedProof>,
        key: &str,
        value: &Value,
    ) -> Result<Option<String>, KvError> {
        match (existing_owner, proof) {
            // Owned key, unsigned put: forbidden outright.
            (Some(_), None) => Err(KvError::OverwriteForbidden),
            // Owned key, signed put: must verify and match the owner.
            (Some(owner), Some(proof)) => {
                Self::verify(proof, key, value)?;
                if proof.signer != owner {
                    return Err(KvError::VerifyError);
                }
                Ok(Some(owner.to_string()))
            }
            // Open key, signed put: claim it.
            (None, Some(proof)) => {
                Self::verify(proof, key, value)?;
                Ok(Some(proof.signer.clone()))
            }
            // Open key, unsigned put: stays open.
            (None, None) => Ok(None),
        }
    }
}

/// Convenience: the default predicate stack.
pub fn default_predicate() -> Arc<dyn WritePredicate> {
    Arc::new(Ed25519Predicate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let mut rng = rand::thread_rng();
        let sk = SigningKey::generate(&mut rng);
        let value = Value::String("payload".into());
        let proof = sign_put(&sk, "k1", &value);
        assert!(Ed25519Predicate::verify(&proof, "k1", &value).is_ok());
        // Signature binds the key and the value.
        assert!(Ed25519Predicate::verify(&proof, "k2", &value).is_err());
        assert!(
            Ed25519Predicate::verify(&proof, "k1", &Value::String("other".into())).is_err()
        );
    }

    #[test]
    fn mismatched_signer_is_rejected_on_owned_key() {
        let mut rng = rand::thread_rng();
        let owner = SigningKey::generate(&mut rng);
        let other = SigningKey::generate(&mut rng);
        let value = Value::String("v".into());
        let owner_id = bs58::encode(owner.verifying_key().as_bytes()).into_string();

        let proof = sign_put(&other, "k", &value);
        let got = Ed25519Predicate.permit(Some(&owner_id), Some(&proof), "k", &value);
        assert!(matches!(got, Err(KvError::VerifyError)));
    }
}
