//! Resolved caller identity.

use serde::{Deserialize, Serialize};

use super::wellknown;

/// A role the caller belongs to, directly or through another role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Caller identity with its role closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<RoleRef>,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            username: username.into(),
            roles: Vec::new(),
        }
    }

    /// The system identity. Bypasses every ACL check.
    pub fn root() -> Self {
        Self::new(wellknown::ROOT_ID, wellknown::ROOT_NAME, wellknown::ROOT_NAME)
    }

    pub fn guest() -> Self {
        Self::new(wellknown::GUEST_ID, wellknown::GUEST_NAME, wellknown::GUEST_NAME)
    }

    pub fn with_role(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.add_role(RoleRef {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn add_role(&mut self, role: RoleRef) {
        if !self.has_role(&role.id) {
            self.roles.push(role);
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == wellknown::ROOT_ID
    }

    pub fn is_guest(&self) -> bool {
        self.id == wellknown::GUEST_ID
    }

    pub fn has_role(&self, id: &str) -> bool {
        self.roles.iter().any(|r| r.id == id)
    }

    /// Every principal id an Ace may name to match this caller.
    pub fn principals(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.roles.iter().map(|r| r.id.as_str()))
    }

    pub fn principal_ids(&self) -> Vec<String> {
        self.principals().map(str::to_string).collect()
    }
}
