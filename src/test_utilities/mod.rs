pub mod mocks;

use std::sync::Arc;

use crate::keypair::Keypair;
use crate::local_index::LocalIndex;
use crate::object::{actor_id_for, followers_of, Document, Message, MessageOptions, MessageType};
use crate::storage::MemoryStore;

pub async fn make_mock_local_index() -> Arc<LocalIndex> {
    Arc::new(LocalIndex::open(Arc::new(MemoryStore::new())).await.unwrap())
}

/// A note plus the Create message for it, addressed to `to`.
pub fn make_mock_note(keypair: &Keypair, text: &str, to: Vec<String>) -> (Message, Document) {
    let actor_id = actor_id_for(&keypair.identity());
    let note = Document::note(text, Some(actor_id)).unwrap();
    let message = Message::new(
        keypair,
        MessageType::Create,
        vec![note.id.clone()],
        None,
        MessageOptions {
            to: Some(to),
            ..MessageOptions::default()
        },
    )
    .unwrap();
    (message, note)
}

/// A note addressed to its author's followers.
pub fn make_mock_public_note(keypair: &Keypair, text: &str) -> (Message, Document) {
    let followers = followers_of(&actor_id_for(&keypair.identity()));
    make_mock_note(keypair, text, vec![followers])
}
