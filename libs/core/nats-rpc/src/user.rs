//! Caller identity propagated in the `X-User-Info` header.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Authenticated caller. Absence of a `UserInfo` means the caller is anonymous.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_tenant(mut self, id: impl Into<String>, key: impl Into<String>) -> Self {
        self.tenant_id = Some(id.into());
        self.tenant_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// The `sub` attribute, when the identity provider supplied one.
    pub fn subject(&self) -> Option<&str> {
        self.attributes.get("sub").and_then(|v| v.as_str())
    }

    /// Role check. An empty role on either side never matches.
    pub fn has_role(&self, role: &str) -> bool {
        match self.role.as_deref() {
            Some(own) if !own.is_empty() && !role.is_empty() => own == role,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_camel_case_and_sparse() {
        let user = UserInfo::new("u-1").with_role("admin");
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value, json!({"userId": "u-1", "role": "admin"}));
    }

    #[test]
    fn test_subject_attribute() {
        let user = UserInfo::default().with_attribute("sub", json!("auth0|42"));
        assert_eq!(user.subject(), Some("auth0|42"));
        assert_eq!(UserInfo::default().subject(), None);
    }

    #[test]
    fn test_has_role() {
        let admin = UserInfo::new("a").with_role("admin");
        assert!(admin.has_role("admin"));
        assert!(!admin.has_role("user"));
        assert!(!admin.has_role(""));
        assert!(!UserInfo::new("b").has_role("admin"));
        assert!(!UserInfo::new("c").with_role("").has_role(""));
    }
}
