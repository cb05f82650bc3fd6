//! Normalized identity produced by a successful credential verification
use serde::{Deserialize, Serialize};

/// Verified caller identity
///
/// Never persisted server-side; the only durable form is the token in the
/// caller's session cookie.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Group names in first-seen order, without duplicates
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email.filter(|e| !e.is_empty());
        self
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject.filter(|s| !s.is_empty());
        self
    }

    /// Replace the group set, dropping empty names and repeats
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.clear();
        for group in groups {
            let group = group.into();
            if !group.is_empty() && !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self
    }

    /// Comma-joined group list for forwarding headers
    pub fn groups_header(&self) -> String {
        self.groups.join(",")
    }
}
