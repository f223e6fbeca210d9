//! Conversation directory
//!
//! Maps an unordered participant pair plus an optional item to exactly one
//! conversation, and gates every conversation-scoped operation on
//! membership.

use crate::db::{
    insert_conversation_if_absent, load_conversation, Conversation, Database, DbError, ItemRef,
    NewConversation, ParticipantId,
};
use crate::engine::{Clock, ItemRegistry};
use crate::error::{ChatError, ChatResult};
use std::sync::Arc;

/// Canonical key of a conversation: the participant pair in ascending order
/// and the optional item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub participant_a: ParticipantId,
    pub participant_b: ParticipantId,
    pub item_ref: Option<ItemRef>,
}

impl ConversationKey {
    pub fn new(
        first: &ParticipantId,
        second: &ParticipantId,
        item_ref: Option<&ItemRef>,
    ) -> ChatResult<Self> {
        if first == second {
            return Err(ChatError::InvalidMessage(
                "cannot open a conversation with yourself".to_string(),
            ));
        }
        let (participant_a, participant_b) = if first < second {
            (first.clone(), second.clone())
        } else {
            (second.clone(), first.clone())
        };
        Ok(Self {
            participant_a,
            participant_b,
            item_ref: item_ref.cloned(),
        })
    }

    /// Deterministic textual id
    pub fn id(&self) -> String {
        match &self.item_ref {
            Some(item) => format!(
                "conv_{}_{}_product_{}",
                self.participant_a, self.participant_b, item
            ),
            None => format!("conv_{}_{}_general", self.participant_a, self.participant_b),
        }
    }

    fn contains(&self, participant: &ParticipantId) -> bool {
        &self.participant_a == participant || &self.participant_b == participant
    }
}

/// Fail with `AccessDenied` unless `requester` is in the conversation
pub fn ensure_participant(
    conversation: &Conversation,
    requester: &ParticipantId,
) -> ChatResult<()> {
    if conversation.is_participant(requester) {
        Ok(())
    } else {
        Err(ChatError::access_denied(requester, &conversation.id))
    }
}

pub struct ConversationDirectory {
    db: Database,
    registry: Arc<dyn ItemRegistry>,
    clock: Arc<dyn Clock>,
}

impl ConversationDirectory {
    pub fn new(db: Database, registry: Arc<dyn ItemRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            registry,
            clock,
        }
    }

    /// Return the conversation for this pair and item, creating it on first
    /// contact. Concurrent first contacts all observe the same record.
    pub async fn get_or_create(
        &self,
        initiator: &ParticipantId,
        peer: &ParticipantId,
        item_ref: Option<&ItemRef>,
    ) -> ChatResult<Conversation> {
        let key = ConversationKey::new(initiator, peer, item_ref)?;
        let id = key.id();

        match self.db.get_conversation(&id) {
            Ok(existing) => return Ok(existing),
            Err(DbError::ConversationNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let holder_id = match &key.item_ref {
            Some(item) => self.resolve_holder(&key, item).await,
            None => None,
        };

        let new = NewConversation {
            id: id.clone(),
            participant_a: key.participant_a.clone(),
            participant_b: key.participant_b.clone(),
            item_ref: key.item_ref.clone(),
            holder_id,
            created_at: self.clock.now(),
        };

        let (conversation, created) = self.db.transaction(|conn| {
            let created = insert_conversation_if_absent(conn, &new)?;
            Ok::<_, DbError>((load_conversation(conn, &id)?, created))
        })?;

        if created {
            tracing::info!(
                conv_id = %id,
                initiator = %initiator,
                holder = ?conversation.holder_id,
                "Created conversation"
            );
        }
        Ok(conversation)
    }

    /// Holder is whichever participant the catalog says owns the item.
    /// Catalog failures leave roles unresolved rather than blocking creation.
    async fn resolve_holder(&self, key: &ConversationKey, item: &ItemRef) -> Option<ParticipantId> {
        match self.registry.owner_of(item).await {
            Ok(Some(owner)) if key.contains(&owner) => Some(owner),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    item = %item,
                    error = %e,
                    "Item registry unavailable, roles unresolved"
                );
                None
            }
        }
    }

    /// Load a conversation on behalf of `requester`
    pub fn access_control(
        &self,
        conversation_id: &str,
        requester: &ParticipantId,
    ) -> ChatResult<Conversation> {
        let conversation = self.db.get_conversation(conversation_id)?;
        ensure_participant(&conversation, requester)?;
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use crate::engine::testing::{MockCatalog, MockClock};
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::parse(s).unwrap()
    }

    fn item(s: &str) -> ItemRef {
        ItemRef::parse(s).unwrap()
    }

    fn directory(catalog: MockCatalog) -> (ConversationDirectory, Arc<MockCatalog>) {
        let catalog = Arc::new(catalog);
        let dir = ConversationDirectory::new(
            Database::open_in_memory().unwrap(),
            catalog.clone(),
            Arc::new(MockClock::at_epoch()),
        );
        (dir, catalog)
    }

    #[test]
    fn key_is_order_independent() {
        let ab = ConversationKey::new(&pid("bob"), &pid("alice"), Some(&item("lamp"))).unwrap();
        let ba = ConversationKey::new(&pid("alice"), &pid("bob"), Some(&item("lamp"))).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.id(), "conv_alice_bob_product_lamp");

        let general = ConversationKey::new(&pid("bob"), &pid("alice"), None).unwrap();
        assert_eq!(general.id(), "conv_alice_bob_general");
    }

    #[test]
    fn key_rejects_self_conversation() {
        let err = ConversationKey::new(&pid("alice"), &pid("alice"), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMessage);
    }

    proptest! {
        #[test]
        fn key_id_ignores_argument_order(
            a in "[a-z0-9-]{1,12}",
            b in "[a-z0-9-]{1,12}",
            item_ref in proptest::option::of("[a-z0-9-]{1,12}"),
        ) {
            prop_assume!(a != b);
            let item_ref = item_ref.map(|i| item(&i));
            let ab = ConversationKey::new(&pid(&a), &pid(&b), item_ref.as_ref()).unwrap();
            let ba = ConversationKey::new(&pid(&b), &pid(&a), item_ref.as_ref()).unwrap();
            prop_assert_eq!(ab.id(), ba.id());
            prop_assert!(ab.participant_a < ab.participant_b);
        }
    }

    #[tokio::test]
    async fn get_or_create_assigns_roles_from_catalog() {
        let (dir, _) = directory(MockCatalog::new().with_owner("lamp", "alice"));
        let conv = dir
            .get_or_create(&pid("bob"), &pid("alice"), Some(&item("lamp")))
            .await
            .unwrap();

        assert_eq!(conv.holder_id, Some(pid("alice")));
        assert_eq!(conv.role_of(&pid("alice")), Role::Holder);
        assert_eq!(conv.role_of(&pid("bob")), Role::Seeker);
    }

    #[tokio::test]
    async fn owner_outside_pair_or_catalog_down_leaves_roles_unresolved() {
        let (dir, catalog) = directory(MockCatalog::new().with_owner("lamp", "carol"));
        let conv = dir
            .get_or_create(&pid("bob"), &pid("alice"), Some(&item("lamp")))
            .await
            .unwrap();
        assert_eq!(conv.holder_id, None);

        catalog.set_unavailable(true);
        let conv = dir
            .get_or_create(&pid("bob"), &pid("alice"), Some(&item("chair")))
            .await
            .unwrap();
        assert_eq!(conv.role_of(&pid("bob")), Role::Unknown);
    }

    #[tokio::test]
    async fn concurrent_first_contact_yields_one_conversation() {
        let (dir, _) = directory(MockCatalog::new());
        let dir = Arc::new(dir);

        let mut handles = Vec::new();
        for i in 0..16 {
            let dir = dir.clone();
            handles.push(tokio::spawn(async move {
                let (me, peer) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                dir.get_or_create(&pid(me), &pid(peer), Some(&item("lamp")))
                    .await
                    .unwrap()
            }));
        }

        let mut created = Vec::new();
        for handle in handles {
            created.push(handle.await.unwrap());
        }
        assert!(created.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(created[0].id, "conv_alice_bob_product_lamp");
    }

    #[tokio::test]
    async fn access_control_denies_outsiders() {
        let (dir, _) = directory(MockCatalog::new());
        let conv = dir.get_or_create(&pid("alice"), &pid("bob"), None).await.unwrap();

        assert!(dir.access_control(&conv.id, &pid("bob")).is_ok());
        let err = dir.access_control(&conv.id, &pid("mallory")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = dir.access_control("conv_x_y_general", &pid("bob")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversationNotFound);
    }
}
