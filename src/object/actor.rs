use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{actor_id_for, identity_for_actor, Decode, Id, Proof};
use crate::crypto::{canonical_bytes, Signer, Verifier};
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ActorType {
    Person,
    Service,
    Application,
    Group,
    Organization,
}

/// A participant's self-certified profile.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: Id,
    #[serde(rename = "type")]
    pub kind: ActorType,
    pub inbox: Id,
    pub outbox: Id,
    pub following: Id,
    pub followers: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub proof: Proof,
}

#[derive(Serialize)]
struct ActorBody<'a> {
    id: &'a Id,
    #[serde(rename = "type")]
    kind: ActorType,
    inbox: &'a Id,
    outbox: &'a Id,
    following: &'a Id,
    followers: &'a Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a String>,
}

fn collection(actor_id: &str, name: &str) -> Id {
    format!("{}/{}", actor_id, name)
}

impl Actor {
    pub fn new(signer: &dyn Signer, kind: ActorType, name: Option<String>) -> Result<Actor> {
        let id = actor_id_for(&signer.identity());
        let inbox = collection(&id, "inbox");
        let outbox = collection(&id, "outbox");
        let following = collection(&id, "following");
        let followers = collection(&id, "followers");
        let bytes = canonical_bytes(&ActorBody {
            id: &id,
            kind,
            inbox: &inbox,
            outbox: &outbox,
            following: &following,
            followers: &followers,
            name: name.as_ref(),
        })?;
        let proof = signer.sign(&bytes)?;

        Ok(Actor {
            id,
            kind,
            inbox,
            outbox,
            following,
            followers,
            name,
            proof,
        })
    }

    fn body(&self) -> ActorBody<'_> {
        ActorBody {
            id: &self.id,
            kind: self.kind,
            inbox: &self.inbox,
            outbox: &self.outbox,
            following: &self.following,
            followers: &self.followers,
            name: self.name.as_ref(),
        }
    }

    pub fn identity(&self) -> Result<String> {
        identity_for_actor(&self.id)
    }

    /// The collection urls must be exactly the ones derived from the id.
    pub fn check_structure(&self) -> Result<()> {
        identity_for_actor(&self.id)?;
        let derived = [
            (&self.inbox, "inbox"),
            (&self.outbox, "outbox"),
            (&self.following, "following"),
            (&self.followers, "followers"),
        ];
        for (value, name) in derived {
            if *value != collection(&self.id, name) {
                return Err(Error::malformed(
                    "actor",
                    format!("{} does not derive from {}", name, self.id),
                ));
            }
        }
        Ok(())
    }

    pub fn verify(&self, verifier: &dyn Verifier) -> bool {
        if self.check_structure().is_err() {
            return false;
        }
        let identity = match self.identity() {
            Ok(identity) => identity,
            Err(_) => return false,
        };
        match canonical_bytes(&self.body()) {
            Ok(bytes) => verifier.verify(&bytes, &self.proof, &identity),
            Err(_) => false,
        }
    }
}

impl Decode for Actor {
    fn decode(value: Value) -> Result<Self> {
        let actor: Actor = serde_json::from_value(value)?;
        actor.check_structure()?;
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Verifier;
    use crate::keypair::Keypair;

    fn make_actor() -> (Keypair, Actor) {
        let keypair = Keypair::new();
        let actor = Actor::new(&keypair, ActorType::Person, Some(String::from("alice"))).unwrap();
        (keypair, actor)
    }

    #[test]
    fn new_actor_verifies_test() {
        let (keypair, actor) = make_actor();
        assert_eq!(actor.id, format!("{}/actor", keypair.identity()));
        assert_eq!(actor.followers, format!("{}/actor/followers", keypair.identity()));
        assert!(actor.verify(&Secp256k1Verifier));
    }

    #[test]
    fn underived_collections_fail_test() {
        let (_keypair, actor) = make_actor();
        let mut tampered = actor.clone();
        tampered.inbox = String::from("https://evil.example/inbox");
        assert!(!tampered.verify(&Secp256k1Verifier));

        let mut tampered = actor.clone();
        tampered.outbox = format!("{}/outbox/", actor.id);
        assert!(!tampered.verify(&Secp256k1Verifier));

        let mut tampered = actor.clone();
        tampered.following = format!("{}/followers", actor.id);
        assert!(!tampered.verify(&Secp256k1Verifier));

        let mut tampered = actor.clone();
        tampered.followers = format!("{}/following", actor.id);
        assert!(!tampered.verify(&Secp256k1Verifier));
    }

    #[test]
    fn renamed_actor_fails_test() {
        let (_keypair, mut actor) = make_actor();
        actor.name = Some(String::from("mallory"));
        assert!(!actor.verify(&Secp256k1Verifier));
    }

    #[test]
    fn actor_signed_by_someone_else_fails_test() {
        let (_keypair, actor) = make_actor();
        let mallory = Keypair::new();
        let forged = Actor::new(&mallory, ActorType::Person, Some(String::from("alice"))).unwrap();
        let mut swapped = actor;
        swapped.proof = forged.proof;
        assert!(!swapped.verify(&Secp256k1Verifier));
    }

    #[test]
    fn decode_rejects_bad_collections_test() {
        let (_keypair, actor) = make_actor();
        let mut value = serde_json::to_value(&actor).unwrap();
        value["inbox"] = serde_json::json!("https://evil.example/inbox");
        assert!(Actor::decode(value).is_err());
    }
}
