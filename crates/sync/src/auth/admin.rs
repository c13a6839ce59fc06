//! Admin privilege decision.

use std::collections::HashSet;
use std::fmt;

use super::provider::ProviderUser;

/// Decides whether a provider user gets the admin flag in their token.
pub trait AdminPredicate: Send + Sync + fmt::Debug {
    fn is_admin(&self, user: &ProviderUser) -> bool;
}

/// Grants admin to a fixed set of emails and to users whose provider role
/// matches `admin_role`.
#[derive(Debug, Clone)]
pub struct PrivilegedAdmins {
    emails: HashSet<String>,
    admin_role: String,
}

impl PrivilegedAdmins {
    #[must_use]
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            emails: emails
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            admin_role: "admin".to_string(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.admin_role = role.into();
        self
    }

    /// Nobody is admin by email; only the provider role counts.
    #[must_use]
    pub fn role_only() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl AdminPredicate for PrivilegedAdmins {
    fn is_admin(&self, user: &ProviderUser) -> bool {
        self.emails.contains(&user.email.normalized())
            || user
                .role
                .as_deref()
                .is_some_and(|role| role.eq_ignore_ascii_case(&self.admin_role))
    }
}
