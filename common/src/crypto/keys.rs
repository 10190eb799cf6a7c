//! Account key material for the bot's ledger identity.
//!
//! One account carries two key pairs: an Ed25519 pair used to sign proposal
//! digests and metering records, and an X25519 pair used to unseal exchange
//! message envelopes addressed to this account.

use std::fmt;

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use super::error::CryptoError;
use super::Hash;

/// Size of a public key in bytes (both curves).
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 signature over a SHA3-256 digest, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                got: slice.len(),
            });
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str).map_err(|e| CryptoError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Signature::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

/// Public half of an account, safe to put on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AccountPublic {
    verify: [u8; PUBLIC_KEY_SIZE],
    exchange: [u8; PUBLIC_KEY_SIZE],
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountPublicRepr {
    verify_key: String,
    exchange_key: String,
}

impl AccountPublic {
    pub fn from_parts(
        verify: [u8; PUBLIC_KEY_SIZE],
        exchange: [u8; PUBLIC_KEY_SIZE],
    ) -> Self {
        Self { verify, exchange }
    }

    /// Hex form of the verifying key, used as the account's ledger address.
    pub fn address(&self) -> String {
        hex::encode(self.verify)
    }

    pub fn verify_key_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.verify
    }

    pub(crate) fn exchange_public(&self) -> X25519Public {
        X25519Public::from(self.exchange)
    }

    /// Verify an Ed25519 signature over a SHA3-256 digest.
    pub fn verify_digest(&self, digest: &Hash, signature: &Signature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.verify)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = DalekSignature::from_bytes(signature.as_bytes());
        key.verify(digest.as_bytes(), &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl Serialize for AccountPublic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AccountPublicRepr {
            verify_key: hex::encode(self.verify),
            exchange_key: hex::encode(self.exchange),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AccountPublic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as SerdeError;

        let repr = AccountPublicRepr::deserialize(deserializer)?;
        let decode = |s: &str| -> Result<[u8; PUBLIC_KEY_SIZE], D::Error> {
            let bytes = hex::decode(s).map_err(SerdeError::custom)?;
            bytes
                .try_into()
                .map_err(|_| SerdeError::custom("invalid public key length"))
        };
        Ok(AccountPublic {
            verify: decode(&repr.verify_key)?,
            exchange: decode(&repr.exchange_key)?,
        })
    }
}

/// Full key material for one account. Secrets are zeroized on drop by the
/// underlying dalek types.
pub struct AccountKeys {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl AccountKeys {
    /// Generate a fresh account from the OS entropy source.
    pub fn generate() -> Self {
        let signing_seed: [u8; 32] = rand::random();
        let exchange_seed: [u8; 32] = rand::random();
        Self::from_seeds(signing_seed, exchange_seed)
    }

    pub fn from_seeds(signing: [u8; 32], exchange: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing),
            exchange: StaticSecret::from(exchange),
        }
    }

    /// Raw seeds, for persisting the account between runs.
    pub fn seeds(&self) -> ([u8; 32], [u8; 32]) {
        (self.signing.to_bytes(), self.exchange.to_bytes())
    }

    pub fn public(&self) -> AccountPublic {
        AccountPublic {
            verify: self.signing.verifying_key().to_bytes(),
            exchange: X25519Public::from(&self.exchange).to_bytes(),
        }
    }

    /// Hex form of the verifying key, used as the account's ledger address.
    pub fn address(&self) -> String {
        self.public().address()
    }

    /// Sign a SHA3-256 digest with the account's Ed25519 key.
    pub fn sign_digest(&self, digest: &Hash) -> Signature {
        let sig = self.signing.sign(digest.as_bytes());
        Signature::from_bytes(sig.to_bytes())
    }

    pub(crate) fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange
    }
}

impl fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeys")
            .field("address", &self.address())
            .field("secrets", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha3_256;

    #[test]
    fn test_sign_and_verify_digest() {
        let keys = AccountKeys::generate();
        let digest = sha3_256(b"proposal body");
        let signature = keys.sign_digest(&digest);

        keys.public()
            .verify_digest(&digest, &signature)
            .expect("valid signature verifies");

        let other = sha3_256(b"different body");
        assert!(keys.public().verify_digest(&other, &signature).is_err());
    }

    #[test]
    fn test_signature_hex_roundtrip() {
        let keys = AccountKeys::generate();
        let signature = keys.sign_digest(&sha3_256(b"x"));
        let parsed = Signature::from_hex(&signature.to_hex()).expect("parse hex signature");
        assert_eq!(signature, parsed);
    }

    #[test]
    fn test_account_public_serde_roundtrip() {
        let public = AccountKeys::generate().public();
        let value = serde_json::to_value(public).expect("serialize public");
        assert!(value["verifyKey"].is_string());
        let back: AccountPublic = serde_json::from_value(value).expect("deserialize public");
        assert_eq!(public, back);
    }

    #[test]
    fn test_seed_roundtrip_preserves_address() {
        let keys = AccountKeys::generate();
        let (signing, exchange) = keys.seeds();
        let restored = AccountKeys::from_seeds(signing, exchange);
        assert_eq!(keys.address(), restored.address());
    }
}
