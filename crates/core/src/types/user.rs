//! Signed-in user identity.

use serde::{Deserialize, Serialize};

use crate::{Email, UserId};

/// The minimal identity record carried in session tokens and broadcast to
/// other tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: Email,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl UserProfile {
    /// Name to greet the user with: the display name, else the mailbox.
    #[must_use]
    pub fn greeting_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                self.email
                    .as_str()
                    .split_once('@')
                    .map_or(self.email.as_str(), |(mailbox, _)| mailbox)
            })
    }
}
