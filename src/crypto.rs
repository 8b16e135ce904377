use base58::{FromBase58, ToBase58};
use secp256k1::{Message, PublicKey, Signature, SECP256K1};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::object::proof::Proof;

pub type CidHash = [u8; 32];

/// Prefix of every content identifier.
pub const CID_PREFIX: &str = "urn:cid:";

/// Identities are `did:key` strings carrying a compressed secp256k1 public key.
pub const IDENTITY_PREFIX: &str = "did:key:z";

// multicodec varint for secp256k1-pub
const SECP256K1_MULTICODEC: [u8; 2] = [0xe7, 0x01];

pub fn hash(data: &[u8]) -> CidHash {
    *blake3::hash(data).as_bytes()
}

///
/// Canonical form of any serializable value: JSON with every object's keys
/// sorted and no insignificant whitespace. Both identifier derivation and
/// signatures run over these bytes.
///
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&sort_keys(value))?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// `urn:cid:<base58 digest>` of the canonical form of `value`.
pub fn digest_id<T: Serialize>(value: &T) -> Result<String> {
    let bytes = canonical_bytes(value)?;
    Ok(format!("{}{}", CID_PREFIX, hash(&bytes).to_base58()))
}

pub fn is_content_id(id: &str) -> bool {
    match id.strip_prefix(CID_PREFIX) {
        Some(digest) => digest
            .from_base58()
            .map(|bytes| bytes.len() == 32)
            .unwrap_or(false),
        None => false,
    }
}

pub fn identity_from_public_key(public_key: &PublicKey) -> String {
    let mut bytes = SECP256K1_MULTICODEC.to_vec();
    bytes.extend(public_key.serialize().iter());
    format!("{}{}", IDENTITY_PREFIX, bytes.to_base58())
}

pub fn public_key_from_identity(identity: &str) -> Result<PublicKey> {
    let encoded = identity
        .strip_prefix(IDENTITY_PREFIX)
        .ok_or_else(|| Error::InvalidIdentity(identity.to_string()))?;
    let bytes = encoded
        .from_base58()
        .map_err(|_| Error::InvalidIdentity(identity.to_string()))?;
    if bytes.len() != 35 || bytes[..2] != SECP256K1_MULTICODEC {
        return Err(Error::InvalidIdentity(identity.to_string()));
    }
    PublicKey::from_slice(&bytes[2..]).map_err(|_| Error::InvalidIdentity(identity.to_string()))
}

pub fn is_valid_identity(identity: &str) -> bool {
    public_key_from_identity(identity).is_ok()
}

/// Produces proofs over canonical bytes on behalf of one identity.
pub trait Signer: Send + Sync {
    fn identity(&self) -> String;
    fn sign(&self, bytes: &[u8]) -> Result<Proof>;
}

/// Checks a proof against the identity that supposedly produced it.
pub trait Verifier: Send + Sync {
    fn verify(&self, bytes: &[u8], proof: &Proof, identity: &str) -> bool;
}

/// ECDSA over the blake3 digest of the signed bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Verifier;

impl Verifier for Secp256k1Verifier {
    fn verify(&self, bytes: &[u8], proof: &Proof, identity: &str) -> bool {
        if proof.verification_method != identity {
            return false;
        }
        let public_key = match public_key_from_identity(identity) {
            Ok(public_key) => public_key,
            Err(_) => return false,
        };
        verify(&hash(bytes), &proof.proof_value, &public_key)
    }
}

pub fn verify(msg_hash: &CidHash, signature_base58: &str, public_key: &PublicKey) -> bool {
    let sig_bytes = match signature_base58.from_base58() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match Signature::from_compact(&sig_bytes) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    let message = match Message::from_slice(msg_hash) {
        Ok(message) => message,
        Err(_) => return false,
    };
    SECP256K1.verify(&message, &signature, public_key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sorts_keys_test() {
        let a = json!({"b": 1, "a": {"d": 2, "c": [ {"z": 0, "y": 1} ]}});
        let bytes = canonical_bytes(&a).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":[{"y":1,"z":0}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn digest_id_is_content_id_test() {
        let id = digest_id(&json!({"type": "Note", "content": "hi"})).unwrap();
        assert!(id.starts_with(CID_PREFIX));
        assert!(is_content_id(&id));
        assert!(!is_content_id("urn:cid:"));
        assert!(!is_content_id("urn:cid:0OIl"));
        assert!(!is_content_id("https://example.com/note/1"));
    }

    #[test]
    fn identity_roundtrip_test() {
        let keypair = Keypair::new();
        let identity = identity_from_public_key(keypair.public_key());
        assert!(identity.starts_with(IDENTITY_PREFIX));
        assert_eq!(&public_key_from_identity(&identity).unwrap(), keypair.public_key());
        assert!(!is_valid_identity("did:web:example.com"));
        assert!(!is_valid_identity("did:key:zzzz"));
    }

    #[test]
    fn verifier_rejects_foreign_identity_test() {
        let alice = Keypair::new();
        let bob = Keypair::new();
        let proof = alice.sign(b"hello world").unwrap();
        let verifier = Secp256k1Verifier;
        assert!(verifier.verify(b"hello world", &proof, &alice.identity()));
        assert!(!verifier.verify(b"hello world!", &proof, &alice.identity()));
        assert!(!verifier.verify(b"hello world", &proof, &bob.identity()));
    }
}
