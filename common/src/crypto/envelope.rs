//! Exchange message envelope.
//!
//! Every message sent through the exchange is signed end-to-end and sealed
//! for exactly one receiver:
//!
//! 1. SHA3-256 the inner payload and sign the digest with the sender's
//!    Ed25519 key.
//! 2. Bundle `{payload, signature, senderPubKey}` as JSON (the wrapped
//!    message).
//! 3. AES-256-GCM encrypt the wrapped message under a fresh symmetric key
//!    and nonce.
//! 4. JSON-encode `{key, nonce}` and seal them for the receiver's X25519
//!    public key (ephemeral ECDH, shared secret hashed into an AES key).
//! 5. Transmit `{encryptedWrapped, encryptedSym}` as JSON.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use super::error::CryptoError;
use super::hash::{canonical_json, sha3_256};
use super::keys::{AccountKeys, AccountPublic, Signature, PUBLIC_KEY_SIZE};

const SYM_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// The outer wire form: both parts hex-encoded ciphertext.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeEnvelope {
    pub encrypted_wrapped: String,
    pub encrypted_sym: SealedSymValues,
}

/// Symmetric key material sealed for the receiver with an ephemeral X25519
/// exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSymValues {
    pub ephemeral_key: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymmetricValues {
    key: String,
    nonce: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedMessage {
    payload: Value,
    signature: Signature,
    sender_pub_key: AccountPublic,
}

/// A verified, decrypted inbound message.
#[derive(Clone, Debug)]
pub struct OpenedMessage {
    pub payload: Value,
    pub sender: AccountPublic,
}

fn aes_encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)
}

fn aes_decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

fn decode_hex(hex_str: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(hex_str).map_err(|e| CryptoError::Hex(e.to_string()))
}

/// Sign `payload` as `sender` and seal it for `receiver`.
pub fn seal_message(
    payload: &Value,
    sender: &AccountKeys,
    receiver: &AccountPublic,
) -> Result<ExchangeEnvelope, CryptoError> {
    // Sign the canonical payload digest and bundle the wrapped message
    let digest = sha3_256(canonical_json(payload).as_bytes());
    let wrapped = WrappedMessage {
        payload: payload.clone(),
        signature: sender.sign_digest(&digest),
        sender_pub_key: sender.public(),
    };
    let wrapped_bytes = serde_json::to_vec(&wrapped)?;

    // Encrypt it under a fresh symmetric key
    let sym_key = Zeroizing::new(rand::random::<[u8; SYM_KEY_SIZE]>());
    let sym_nonce: [u8; NONCE_SIZE] = rand::random();
    let encrypted_wrapped = aes_encrypt(sym_key.as_ref(), &sym_nonce, &wrapped_bytes)?;

    // Seal the symmetric values for the receiver
    let sym_values = serde_json::to_vec(&SymmetricValues {
        key: hex::encode(sym_key.as_ref()),
        nonce: hex::encode(sym_nonce),
    })?;
    let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&receiver.exchange_public());
    let seal_key = sha3_256(shared.as_bytes());
    let seal_nonce: [u8; NONCE_SIZE] = rand::random();
    let encrypted_sym = aes_encrypt(seal_key.as_bytes(), &seal_nonce, &sym_values)?;

    Ok(ExchangeEnvelope {
        encrypted_wrapped: hex::encode(encrypted_wrapped),
        encrypted_sym: SealedSymValues {
            ephemeral_key: hex::encode(ephemeral_pub.to_bytes()),
            nonce: hex::encode(seal_nonce),
            ciphertext: hex::encode(encrypted_sym),
        },
    })
}

/// Unseal an envelope addressed to `receiver` and verify the inner
/// signature against the bundled sender key.
pub fn open_message(
    envelope: &ExchangeEnvelope,
    receiver: &AccountKeys,
) -> Result<OpenedMessage, CryptoError> {
    // Recover the symmetric values
    let ephemeral_bytes: [u8; PUBLIC_KEY_SIZE] =
        decode_hex(&envelope.encrypted_sym.ephemeral_key)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
    let shared = receiver
        .exchange_secret()
        .diffie_hellman(&X25519Public::from(ephemeral_bytes));
    let seal_key = sha3_256(shared.as_bytes());
    let seal_nonce = decode_hex(&envelope.encrypted_sym.nonce)?;
    let sym_ciphertext = decode_hex(&envelope.encrypted_sym.ciphertext)?;
    if seal_nonce.len() != NONCE_SIZE {
        return Err(CryptoError::Decryption);
    }
    let sym_bytes = aes_decrypt(seal_key.as_bytes(), &seal_nonce, &sym_ciphertext)?;
    let sym_values: SymmetricValues = serde_json::from_slice(&sym_bytes)?;

    // Decrypt the wrapped message
    let sym_key = Zeroizing::new(decode_hex(&sym_values.key)?);
    let sym_nonce = decode_hex(&sym_values.nonce)?;
    if sym_key.len() != SYM_KEY_SIZE || sym_nonce.len() != NONCE_SIZE {
        return Err(CryptoError::Decryption);
    }
    let wrapped_ciphertext = decode_hex(&envelope.encrypted_wrapped)?;
    let wrapped_bytes = aes_decrypt(&sym_key, &sym_nonce, &wrapped_ciphertext)?;
    let wrapped: WrappedMessage = serde_json::from_slice(&wrapped_bytes)?;

    // Verify the end-to-end signature
    let digest = sha3_256(canonical_json(&wrapped.payload).as_bytes());
    wrapped
        .sender_pub_key
        .verify_digest(&digest, &wrapped.signature)?;

    Ok(OpenedMessage {
        payload: wrapped.payload,
        sender: wrapped.sender_pub_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_open_roundtrip() {
        let sender = AccountKeys::generate();
        let receiver = AccountKeys::generate();
        let payload = json!({"type": "proposal", "agreementId": "aa".repeat(32)});

        let envelope =
            seal_message(&payload, &sender, &receiver.public()).expect("seal message");
        let opened = open_message(&envelope, &receiver).expect("open message");

        assert_eq!(opened.payload, payload);
        assert_eq!(opened.sender, sender.public());
    }

    #[test]
    fn test_open_rejects_wrong_receiver() {
        let sender = AccountKeys::generate();
        let receiver = AccountKeys::generate();
        let eavesdropper = AccountKeys::generate();
        let payload = json!({"type": "reply"});

        let envelope =
            seal_message(&payload, &sender, &receiver.public()).expect("seal message");
        assert!(open_message(&envelope, &eavesdropper).is_err());
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let sender = AccountKeys::generate();
        let receiver = AccountKeys::generate();
        let payload = json!({"type": "update", "address": "0xabc"});

        let mut envelope =
            seal_message(&payload, &sender, &receiver.public()).expect("seal message");
        let mut raw = hex::decode(&envelope.encrypted_wrapped).expect("hex");
        raw[0] ^= 0xff;
        envelope.encrypted_wrapped = hex::encode(raw);

        assert!(open_message(&envelope, &receiver).is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let sender = AccountKeys::generate();
        let receiver = AccountKeys::generate();
        let envelope = seal_message(&json!({"k": 1}), &sender, &receiver.public())
            .expect("seal message");

        let value = serde_json::to_value(&envelope).expect("serialize envelope");
        assert!(value["encryptedWrapped"].is_string());
        assert!(value["encryptedSym"]["ephemeralKey"].is_string());
        assert!(value["encryptedSym"]["nonce"].is_string());
        assert!(value["encryptedSym"]["ciphertext"].is_string());
    }
}
