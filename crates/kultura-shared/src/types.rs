use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account identifier issued by the API service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of one live transport connection, unique for the process lifetime.
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

/// Persisted message id, assigned by the API service.
pub type MessageId = u64;

/// Client-generated id used by optimistic UI until the persisted id is known.
pub type TempId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_is_a_bare_number_on_the_wire() {
        let id = UserId(17);
        assert_eq!(serde_json::to_string(&id).unwrap(), "17");
        let parsed: UserId = serde_json::from_str("17").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }
}
