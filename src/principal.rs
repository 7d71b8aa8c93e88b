//! Tagged principal and object references.
//!
//! The authorization graph treats users, roles, logs, and tenants uniformly
//! as strings of the form `<type>:<id>`, optionally suffixed with
//! `#<relation>` to reference a userset (e.g. `role:engineer#assignee`).
//! The tag is validated at the boundary and then carried around as a plain
//! string — the decision cache and the tuple store both key on the textual
//! form, so lifting it into a structural sum type would only force
//! re-serialization at every seam.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Object types admitted by the fixed authorization schema.
pub const OBJECT_TYPES: &[&str] = &[
    "tenant",
    "organization",
    "user",
    "role",
    "log",
    "log_entry",
    "apikey",
    "system",
];

/// A validated `<type>:<id>` reference, possibly with a `#relation` userset
/// suffix on the user side of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedRef(String);

impl TypedRef {
    /// Parse and validate a tagged reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the string is not of the form
    /// `<type>:<id>` with a known type tag and a non-empty id.
    pub fn parse(raw: &str) -> Result<Self> {
        let (type_tag, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("missing type tag in '{raw}'")))?;

        if !OBJECT_TYPES.contains(&type_tag) {
            return Err(Error::Validation(format!("unknown object type '{type_tag}'")));
        }

        // A userset reference carries a relation after '#'
        let id = rest.split_once('#').map_or(rest, |(id, _)| id);
        if id.is_empty() {
            return Err(Error::Validation(format!("empty id in '{raw}'")));
        }

        Ok(Self(raw.to_string()))
    }

    /// The type tag (`user`, `tenant`, ...).
    #[must_use]
    pub fn type_tag(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// The id portion, without type tag or userset suffix.
    #[must_use]
    pub fn id(&self) -> &str {
        let rest = self.0.split_once(':').map_or("", |(_, r)| r);
        rest.split_once('#').map_or(rest, |(id, _)| id)
    }

    /// The userset relation suffix, if present.
    #[must_use]
    pub fn userset_relation(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, r)| r)
    }

    /// The full textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TypedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resolved caller of a request: who they are, which tenant the request
/// is scoped to, and the scopes their credential granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Tagged user reference (`user:<id>`).
    pub user_id: String,
    /// Tenant the credential was issued for.
    pub tenant_id: String,
    /// Granted scopes. Empty means "whatever the authorization graph allows".
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Principal {
    /// Construct a principal for `user_id` in `tenant_id` with no scope hints.
    #[must_use]
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            scopes: Vec::new(),
        }
    }

    /// Tagged form of the user id, prefixing `user:` if the caller passed a
    /// bare id.
    #[must_use]
    pub fn user_ref(&self) -> String {
        tag_user(&self.user_id)
    }
}

/// Prefix a bare user id with `user:`; leave already-tagged ids untouched.
#[must_use]
pub fn tag_user(id: &str) -> String {
    if id.contains(':') {
        id.to_string()
    } else {
        format!("user:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_reference() {
        let r = TypedRef::parse("user:alice").unwrap();
        assert_eq!(r.type_tag(), "user");
        assert_eq!(r.id(), "alice");
        assert_eq!(r.userset_relation(), None);
    }

    #[test]
    fn parses_userset_reference() {
        let r = TypedRef::parse("role:engineer#assignee").unwrap();
        assert_eq!(r.type_tag(), "role");
        assert_eq!(r.id(), "engineer");
        assert_eq!(r.userset_relation(), Some("assignee"));
    }

    #[test]
    fn rejects_untagged_and_unknown_types() {
        assert!(TypedRef::parse("alice").is_err());
        assert!(TypedRef::parse("widget:w1").is_err());
        assert!(TypedRef::parse("user:").is_err());
    }

    #[test]
    fn tag_user_leaves_tagged_ids_alone() {
        assert_eq!(tag_user("alice"), "user:alice");
        assert_eq!(tag_user("user:alice"), "user:alice");
        assert_eq!(tag_user("role:eng#assignee"), "role:eng#assignee");
    }
}
