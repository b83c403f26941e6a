use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(PeerId);
string_newtype!(MessageId);

impl PeerId {
    /// Builds an identity normalized for stable comparison (lowercased,
    /// surrounding whitespace removed).
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn normalized(&self) -> Self {
        Self::new(&self.0)
    }
}

impl MessageId {
    /// Client-assigned identifier, minted once at send time and never
    /// reassigned. It is the idempotency key across every channel.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_usable(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

/// The two fixed parties of one conversation, established at engine
/// construction. Identity never derives from message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationKey {
    local: PeerId,
    remote: PeerId,
}

impl ConversationKey {
    pub fn new(local: PeerId, remote: PeerId) -> Self {
        Self {
            local: local.normalized(),
            remote: remote.normalized(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Exact pair match in either direction, after normalization. Events
    /// that fail this check never reach the message store.
    pub fn involves_pair(&self, a: &PeerId, b: &PeerId) -> bool {
        let a = a.normalized();
        let b = b.normalized();
        (a == self.local && b == self.remote) || (a == self.remote && b == self.local)
    }

    /// Room key both parties compute independently: identities sorted
    /// lexicographically, restricted to a safe identifier alphabet.
    pub fn room_key(&self) -> String {
        let mut pair = [self.local.as_str(), self.remote.as_str()];
        pair.sort_unstable();
        let raw = format!("room_{}_{}", pair[0], pair[1]);
        raw.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_normalizes_case_and_whitespace() {
        assert_eq!(PeerId::new("  Alice@Example.COM "), PeerId::new("alice@example.com"));
    }

    #[test]
    fn room_key_is_order_independent_and_sanitized() {
        let a = ConversationKey::new(PeerId::new("shoe@gmail.com"), PeerId::new("socks@gmail.com"));
        let b = ConversationKey::new(PeerId::new("socks@gmail.com"), PeerId::new("shoe@gmail.com"));
        assert_eq!(a.room_key(), b.room_key());
        assert_eq!(a.room_key(), "room_shoegmailcom_socksgmailcom");
    }

    #[test]
    fn involves_pair_matches_either_direction_only() {
        let key = ConversationKey::new(PeerId::new("a@x"), PeerId::new("b@x"));
        assert!(key.involves_pair(&PeerId::new("B@X"), &PeerId::new("a@x")));
        assert!(!key.involves_pair(&PeerId::new("a@x"), &PeerId::new("c@x")));
    }

    #[test]
    fn generated_message_ids_are_unique_and_usable() {
        let first = MessageId::generate();
        let second = MessageId::generate();
        assert_ne!(first, second);
        assert!(first.is_usable());
        assert!(!MessageId("   ".to_string()).is_usable());
    }
}
