//! Identifiers shared across the engine and the gateway.

use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};

/// Opaque room identifier `R` of §3: globally unique within the server's
/// lifetime, minted by the external stream-record collaborator and simply
/// carried by this system.
#[derive(
    Clone,
    Debug,
    Display,
    Eq,
    PartialEq,
    Hash,
    AsRef,
    Deref,
    From,
    Deserialize,
    Serialize,
)]
#[as_ref(forward)]
pub struct RoomId(String);

impl RoomId {
    /// Borrows the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque user identifier associated with a gateway connection via
/// `register-user`.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, From, Deserialize, Serialize,
)]
pub struct UserId(String);

impl UserId {
    /// Borrows the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
