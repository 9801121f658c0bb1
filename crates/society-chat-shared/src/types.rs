use serde::{Deserialize, Serialize};
use uuid::Uuid;

// User identity is issued by the auth collaborator and treated as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SocietyId(pub String);

impl SocietyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SocietyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned message id. Only the persistence layer mints these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation id linking an optimistic send to its ack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ClientRef(pub Uuid);

impl ClientRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeleteScope {
    #[serde(rename = "for me")]
    ForMe,
    #[serde(rename = "for all")]
    ForAll,
}

impl DeleteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForMe => "for me",
            Self::ForAll => "for all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "for me" => Some(Self::ForMe),
            "for all" => Some(Self::ForAll),
            _ => None,
        }
    }
}

/// Who receives presence transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceScope {
    /// Every connected user.
    #[default]
    Everyone,
    /// Only users with a stored conversation with the subject.
    Conversations,
}

impl PresenceScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "everyone" | "all" => Some(Self::Everyone),
            "conversations" | "contacts" => Some(Self::Conversations),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_short() {
        assert_eq!(UserId::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(UserId::from("u1").short(), "u1");
    }

    #[test]
    fn test_delete_scope_wire_names() {
        let json = serde_json::to_string(&DeleteScope::ForAll).unwrap();
        assert_eq!(json, "\"for all\"");
        assert_eq!(DeleteScope::parse("for me"), Some(DeleteScope::ForMe));
        assert_eq!(DeleteScope::parse("everyone"), None);
    }

    #[test]
    fn test_presence_scope_parse() {
        assert_eq!(PresenceScope::parse("Conversations"), Some(PresenceScope::Conversations));
        assert_eq!(PresenceScope::parse("everyone"), Some(PresenceScope::Everyone));
        assert_eq!(PresenceScope::parse("nobody"), None);
    }
}
