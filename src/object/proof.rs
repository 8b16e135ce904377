use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::now;

pub const PROOF_TYPE: &str = "EcdsaSecp256k1Signature2019";
pub const PROOF_PURPOSE: &str = "assertionMethod";

/// A detached signature embedded in signed objects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: DateTime<Utc>,
    /// identity of the signer
    pub verification_method: String,
    pub proof_purpose: String,
    /// base58 compact signature
    pub proof_value: String,
}

impl Proof {
    pub fn new(verification_method: String, proof_value: String) -> Self {
        Proof {
            proof_type: String::from(PROOF_TYPE),
            created: now(),
            verification_method,
            proof_purpose: String::from(PROOF_PURPOSE),
            proof_value,
        }
    }
}
