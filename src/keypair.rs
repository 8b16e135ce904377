use crate::crypto::{hash, identity_from_public_key, Signer};
use crate::error::{Error, Result};
use crate::object::proof::Proof;
use base58::ToBase58;
use rand::RngCore;
use secp256k1::{Message, PublicKey, SecretKey, Signature, SECP256K1};
use std::fmt;
use std::path::Path;

/// An secp256k1 keypair for signing documents and messages
#[derive(Debug, PartialEq)]
pub struct Keypair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl Keypair {
    /// Create and return a keypair with a randomly generated private key.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Keypair {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // out-of-range scalars are rejected by from_slice, just draw again
            if let Ok(keypair) = Keypair::from_secret_slice(&bytes) {
                return keypair;
            }
        }
    }

    /// Create and return a keypair with the given u8 array as the private key
    pub fn from_secret_slice(slice: &[u8]) -> Result<Keypair> {
        let secret_key = SecretKey::from_slice(slice)?;
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);

        Ok(Keypair {
            secret_key,
            public_key,
        })
    }

    /// Create and return a keypair with the given hex string as the private key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Keypair> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret_hex.trim(), &mut bytes as &mut [u8])
            .map_err(|err| Error::Key(err.to_string()))?;
        Keypair::from_secret_slice(&bytes)
    }

    ///
    /// Reads a hex-encoded secret from `path`, or generates a fresh keypair
    /// and writes it there when the file does not exist yet.
    ///
    pub fn load_or_create(path: &Path) -> Result<Keypair> {
        if path.exists() {
            let secret_hex = std::fs::read_to_string(path)?;
            return Keypair::from_secret_hex(&secret_hex);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let keypair = Keypair::new();
        std::fs::write(path, keypair.secret_hex())?;
        Ok(keypair)
    }

    /// The `did:key` identity of this keypair
    pub fn identity(&self) -> String {
        identity_from_public_key(&self.public_key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the private key as a hex-encoded string
    pub fn secret_hex(&self) -> String {
        self.secret_key.to_string()
    }

    /// Hash and sign message bytes
    pub fn sign_message(&self, message_bytes: &[u8]) -> Result<Signature> {
        let msg = Message::from_slice(&hash(message_bytes))?;
        Ok(SECP256K1.sign(&msg, &self.secret_key))
    }
}

impl Signer for Keypair {
    fn identity(&self) -> String {
        Keypair::identity(self)
    }

    fn sign(&self, bytes: &[u8]) -> Result<Proof> {
        let signature = self.sign_message(bytes)?;
        Ok(Proof::new(
            self.identity(),
            signature.serialize_compact().to_base58(),
        ))
    }
}

impl fmt::Display for Keypair {
    /// formats a Keypair for println! without leaking the secret
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity:{}", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{verify, Secp256k1Verifier, Verifier};

    const MOCK_SECRET_KEY: &str =
        "da79fe6d86347e8f8dc71eb3dbab9ba5623eaaed6c5dd0bb257c0d631faaff16";

    #[test]
    fn keypair_signing_test() {
        let keypair = Keypair::from_secret_hex(MOCK_SECRET_KEY).unwrap();
        let signature = keypair.sign_message(b"hello world").unwrap();
        assert!(verify(
            &hash(b"hello world"),
            &signature.serialize_compact().to_base58(),
            keypair.public_key()
        ));

        let proof = Signer::sign(&keypair, b"hello world").unwrap();
        assert_eq!(proof.verification_method, keypair.identity());
        assert!(Secp256k1Verifier.verify(b"hello world", &proof, &keypair.identity()));
    }

    #[test]
    fn keypair_new_from_secret_key_test() {
        let keypair = Keypair::from_secret_hex(MOCK_SECRET_KEY).unwrap();
        assert_eq!(keypair.secret_hex(), MOCK_SECRET_KEY);
        assert_eq!(
            keypair.identity(),
            Keypair::from_secret_hex(MOCK_SECRET_KEY).unwrap().identity()
        );

        assert!(Keypair::from_secret_hex("randomtext").is_err());
        assert!(Keypair::from_secret_hex("").is_err());
    }

    #[test]
    fn keypair_new_test() {
        let keypair = Keypair::new();
        assert_eq!(keypair.secret_hex().len(), 64);
        assert_ne!(keypair.identity(), Keypair::new().identity());
    }

    #[test]
    fn keypair_load_or_create_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("keyfile");
        let created = Keypair::load_or_create(&path).unwrap();
        let loaded = Keypair::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }
}
