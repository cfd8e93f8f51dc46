//! ADV device-identity crypto for multidevice pairing.
//!
//! The server hands the client an account-signed device identity blob;
//! the client verifies its HMAC against the adv secret, countersigns it
//! with the identity key, and stores the result. The stored blob is what
//! later rides in `<device-identity>` on prekey-bearing stanzas.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, PairingError};
use crate::store::AuthenticationCreds;
use crate::Result;

/// HMAC-SHA256 tag length in bytes.
const HMAC_LEN: usize = 32;

/// Device identity payload after the adv-secret HMAC check.
#[derive(Clone, Debug)]
pub struct VerifiedDeviceIdentity {
    pub payload: Vec<u8>,
}

/// Verify a server device-identity blob: the last 32 bytes are an
/// HMAC-SHA256 of the rest under the adv secret from creds.
pub fn verify_device_identity(
    creds: &AuthenticationCreds,
    payload_with_tag: &[u8],
) -> Result<VerifiedDeviceIdentity> {
    let adv_secret = base64::engine::general_purpose::STANDARD
        .decode(&creds.adv_secret_key)
        .map_err(|e| Error::Pairing(PairingError::Protocol(format!("adv secret: {e}"))))?;
    if payload_with_tag.len() < HMAC_LEN {
        return Err(Error::Pairing(PairingError::InvalidDeviceIdentityHmac));
    }
    let split = payload_with_tag.len() - HMAC_LEN;
    let (payload, tag) = payload_with_tag.split_at(split);

    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&adv_secret)
        .map_err(|_| Error::Pairing(PairingError::Protocol("invalid HMAC key length".into())))?;
    mac.update(payload);
    mac.verify_slice(tag)
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceIdentityHmac))?;

    Ok(VerifiedDeviceIdentity {
        payload: payload.to_vec(),
    })
}

/// Countersign a verified device identity with our identity key for
/// storage: verifying_key (32) || signature (64) || payload.
pub fn sign_device_identity(creds: &AuthenticationCreds, payload: &[u8]) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from_bytes(&creds.signed_identity_key.private);
    let verifying_key = signing_key.verifying_key();
    let signature = signing_key.sign(payload);

    let mut out = Vec::with_capacity(32 + 64 + payload.len());
    out.extend_from_slice(verifying_key.as_bytes());
    out.extend_from_slice(&signature.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Verify a stored signed device identity blob and return the inner
/// payload.
pub fn verify_signed_identity(signed_blob: &[u8]) -> Result<Vec<u8>> {
    if signed_blob.len() < 32 + 64 {
        return Err(Error::Pairing(PairingError::InvalidDeviceSignature));
    }
    let key_bytes: [u8; 32] = signed_blob[..32]
        .try_into()
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceSignature))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceSignature))?;
    let sig_bytes: [u8; 64] = signed_blob[32..96]
        .try_into()
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceSignature))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    let payload = &signed_blob[96..];
    verifying_key
        .verify_strict(payload, &signature)
        .map_err(|_| Error::Pairing(PairingError::InvalidDeviceSignature))?;
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_auth_creds;

    fn tagged_payload(creds: &AuthenticationCreds, payload: &[u8]) -> Vec<u8> {
        let adv_secret = base64::engine::general_purpose::STANDARD
            .decode(&creds.adv_secret_key)
            .unwrap();
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&adv_secret).unwrap();
        mac.update(payload);
        let tag = mac.finalize().into_bytes();
        let mut out = payload.to_vec();
        out.extend_from_slice(&tag);
        out
    }

    #[test]
    fn hmac_verify_roundtrip() {
        let creds = init_auth_creds();
        let payload = b"device-identity-payload";
        let with_tag = tagged_payload(&creds, payload);
        let verified = verify_device_identity(&creds, &with_tag).unwrap();
        assert_eq!(verified.payload, payload);
    }

    #[test]
    fn hmac_reject_tampered() {
        let creds = init_auth_creds();
        let mut with_tag = tagged_payload(&creds, b"device-identity-payload");
        with_tag[0] ^= 1;
        assert!(verify_device_identity(&creds, &with_tag).is_err());
    }

    #[test]
    fn hmac_reject_wrong_secret() {
        let creds = init_auth_creds();
        let other = init_auth_creds();
        let with_tag = tagged_payload(&other, b"payload");
        assert!(verify_device_identity(&creds, &with_tag).is_err());
    }

    #[test]
    fn sign_verify_identity_roundtrip() {
        let creds = init_auth_creds();
        let payload = b"account-payload-to-store";
        let signed = sign_device_identity(&creds, payload).unwrap();
        let verified = verify_signed_identity(&signed).unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn reject_truncated_signed_blob() {
        assert!(verify_signed_identity(&[0u8; 40]).is_err());
    }
}
