//! Capability grants for shared-session members.
//!
//! A [`PermissionGrant`] is a fixed set of boolean capabilities across four
//! resource domains. Anything the model does not recognise, and anything that
//! is not a JSON boolean, is treated as denied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AccessError;

/// Server capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    pub view: bool,
    pub control: bool,
    pub edit: bool,
    pub delete: bool,
}

/// Backup capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupCapabilities {
    pub view: bool,
    pub create: bool,
    pub restore: bool,
    pub delete: bool,
}

/// Node capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCapabilities {
    pub view: bool,
    pub control: bool,
}

/// AI assistant capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AiCapabilities {
    pub analyze: bool,
}

/// A single domain/action pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ServersView,
    ServersControl,
    ServersEdit,
    ServersDelete,
    BackupsView,
    BackupsCreate,
    BackupsRestore,
    BackupsDelete,
    NodesView,
    NodesControl,
    AiAnalyze,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::ServersView,
        Capability::ServersControl,
        Capability::ServersEdit,
        Capability::ServersDelete,
        Capability::BackupsView,
        Capability::BackupsCreate,
        Capability::BackupsRestore,
        Capability::BackupsDelete,
        Capability::NodesView,
        Capability::NodesControl,
        Capability::AiAnalyze,
    ];

    /// `(domain, action)` names as they appear in the JSON shape.
    pub fn path(self) -> (&'static str, &'static str) {
        match self {
            Capability::ServersView => ("servers", "view"),
            Capability::ServersControl => ("servers", "control"),
            Capability::ServersEdit => ("servers", "edit"),
            Capability::ServersDelete => ("servers", "delete"),
            Capability::BackupsView => ("backups", "view"),
            Capability::BackupsCreate => ("backups", "create"),
            Capability::BackupsRestore => ("backups", "restore"),
            Capability::BackupsDelete => ("backups", "delete"),
            Capability::NodesView => ("nodes", "view"),
            Capability::NodesControl => ("nodes", "control"),
            Capability::AiAnalyze => ("ai", "analyze"),
        }
    }

    /// Look up a capability by its domain and action names.
    pub fn lookup(domain: &str, action: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.path() == (domain, action))
    }

    fn is_read_only(self) -> bool {
        matches!(
            self,
            Capability::ServersView | Capability::BackupsView | Capability::NodesView
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (domain, action) = self.path();
        write!(f, "{domain}.{action}")
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, action) = s
            .split_once('.')
            .ok_or_else(|| format!("capability must look like domain.action: {s}"))?;
        Self::lookup(domain, action).ok_or_else(|| format!("unknown capability: {s}"))
    }
}

/// Capability grant held by a session membership.
///
/// Deserialisation never fails on shape: it goes through
/// [`PermissionGrant::normalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct PermissionGrant {
    pub servers: ServerCapabilities,
    pub backups: BackupCapabilities,
    pub nodes: NodeCapabilities,
    pub ai: AiCapabilities,
}

impl PermissionGrant {
    /// Every capability denied.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Full grant carried by session owners.
    pub fn owner_default() -> Self {
        let mut grant = Self::default();
        for cap in Capability::ALL {
            grant.set(cap, true);
        }
        grant
    }

    /// View-only grant applied when an owner accepts a request without
    /// specifying permissions.
    pub fn member_default() -> Self {
        let mut grant = Self::default();
        for cap in Capability::ALL.into_iter().filter(|c| c.is_read_only()) {
            grant.set(cap, true);
        }
        grant
    }

    /// Coerce an arbitrary JSON value into the fixed grant shape.
    pub fn normalize(raw: &Value) -> Self {
        let mut grant = Self::default();
        for cap in Capability::ALL {
            let (domain, action) = cap.path();
            let allowed = raw
                .get(domain)
                .and_then(|d| d.get(action))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            grant.set(cap, allowed);
        }
        grant
    }

    /// Decode a grant persisted as JSON text. Malformed text denies everything.
    pub fn from_stored(text: &str) -> Self {
        serde_json::from_str::<Value>(text)
            .map(|value| Self::normalize(&value))
            .unwrap_or_default()
    }

    /// Parse caller-supplied JSON text.
    ///
    /// Known domains must be objects and known actions must be booleans.
    /// Unknown keys are ignored and missing actions are denied.
    pub fn parse(text: &str) -> Result<Self, AccessError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| AccessError::validation(format!("grant is not valid JSON: {e}")))?;
        if !value.is_object() {
            return Err(AccessError::validation("grant must be a JSON object"));
        }
        for cap in Capability::ALL {
            let (domain, action) = cap.path();
            let Some(actions) = value.get(domain) else {
                continue;
            };
            if !actions.is_object() {
                return Err(AccessError::validation(format!("{domain} must be an object")));
            }
            if actions.get(action).is_some_and(|leaf| !leaf.is_boolean()) {
                return Err(AccessError::validation(format!("{cap} must be true or false")));
            }
        }
        Ok(Self::normalize(&value))
    }

    /// Serialise for storage.
    pub fn to_stored(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn allows(&self, cap: Capability) -> bool {
        match cap {
            Capability::ServersView => self.servers.view,
            Capability::ServersControl => self.servers.control,
            Capability::ServersEdit => self.servers.edit,
            Capability::ServersDelete => self.servers.delete,
            Capability::BackupsView => self.backups.view,
            Capability::BackupsCreate => self.backups.create,
            Capability::BackupsRestore => self.backups.restore,
            Capability::BackupsDelete => self.backups.delete,
            Capability::NodesView => self.nodes.view,
            Capability::NodesControl => self.nodes.control,
            Capability::AiAnalyze => self.ai.analyze,
        }
    }

    /// String-keyed lookup; unknown domains or actions are denied.
    pub fn has_capability(&self, domain: &str, action: &str) -> bool {
        Capability::lookup(domain, action).is_some_and(|cap| self.allows(cap))
    }

    pub fn set(&mut self, cap: Capability, allowed: bool) {
        let slot = match cap {
            Capability::ServersView => &mut self.servers.view,
            Capability::ServersControl => &mut self.servers.control,
            Capability::ServersEdit => &mut self.servers.edit,
            Capability::ServersDelete => &mut self.servers.delete,
            Capability::BackupsView => &mut self.backups.view,
            Capability::BackupsCreate => &mut self.backups.create,
            Capability::BackupsRestore => &mut self.backups.restore,
            Capability::BackupsDelete => &mut self.backups.delete,
            Capability::NodesView => &mut self.nodes.view,
            Capability::NodesControl => &mut self.nodes.control,
            Capability::AiAnalyze => &mut self.ai.analyze,
        };
        *slot = allowed;
    }

    /// Capabilities currently allowed, in declaration order.
    pub fn granted(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|cap| self.allows(*cap))
            .collect()
    }
}

impl From<Value> for PermissionGrant {
    fn from(value: Value) -> Self {
        Self::normalize(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_empty_denies_everything() {
        let grant = PermissionGrant::normalize(&json!({}));
        for cap in Capability::ALL {
            assert!(!grant.allows(cap), "{cap} should be denied");
        }
        assert_eq!(grant, PermissionGrant::deny_all());
    }

    #[test]
    fn test_owner_default_allows_everything() {
        let grant = PermissionGrant::owner_default();
        assert_eq!(grant.granted().len(), Capability::ALL.len());
    }

    #[test]
    fn test_member_default_is_view_only() {
        let grant = PermissionGrant::member_default();
        assert_eq!(
            grant.granted(),
            vec![
                Capability::ServersView,
                Capability::BackupsView,
                Capability::NodesView
            ]
        );
        assert!(!grant.has_capability("ai", "analyze"));
        assert!(!grant.has_capability("servers", "control"));
    }

    #[test]
    fn test_normalize_ignores_malformed_leaves() {
        let raw = json!({
            "servers": {"view": true, "control": "yes", "edit": 1, "bogus": true},
            "backups": "everything",
            "nodes": {"control": true},
            "extra": {"view": true}
        });
        let grant = PermissionGrant::normalize(&raw);
        assert_eq!(
            grant.granted(),
            vec![Capability::ServersView, Capability::NodesControl]
        );
    }

    #[test]
    fn test_normalize_non_object_denies() {
        assert_eq!(PermissionGrant::normalize(&json!(null)), PermissionGrant::deny_all());
        assert_eq!(PermissionGrant::normalize(&json!([true])), PermissionGrant::deny_all());
    }

    #[test]
    fn test_has_capability_unknown_is_denied() {
        let grant = PermissionGrant::owner_default();
        assert!(grant.has_capability("servers", "delete"));
        assert!(!grant.has_capability("servers", "launch"));
        assert!(!grant.has_capability("billing", "view"));
    }

    #[test]
    fn test_deserialize_is_lenient() {
        let grant: PermissionGrant =
            serde_json::from_str(r#"{"ai":{"analyze":true},"servers":{"view":"no"}}"#).unwrap();
        assert_eq!(grant.granted(), vec![Capability::AiAnalyze]);
    }

    #[test]
    fn test_from_stored_garbage_denies() {
        assert_eq!(PermissionGrant::from_stored("not json"), PermissionGrant::deny_all());
        let stored = PermissionGrant::member_default().to_stored();
        assert_eq!(
            PermissionGrant::from_stored(&stored),
            PermissionGrant::member_default()
        );
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(PermissionGrant::parse("[1,2]").is_err());
        assert!(PermissionGrant::parse("{oops").is_err());
        let grant = PermissionGrant::parse(r#"{"backups":{"restore":true}}"#).unwrap();
        assert!(grant.has_capability("backups", "restore"));
    }

    #[test]
    fn test_parse_rejects_non_boolean_leaves() {
        for text in [
            r#"{"servers":{"view":"yes"}}"#,
            r#"{"servers":{"control":1}}"#,
            r#"{"ai":{"analyze":null}}"#,
            r#"{"nodes":true}"#,
        ] {
            let err = PermissionGrant::parse(text).unwrap_err();
            assert!(matches!(err, AccessError::Validation(_)), "{text}");
        }
        let err = PermissionGrant::parse(r#"{"servers":{"view":"yes"}}"#).unwrap_err();
        assert!(err.to_string().contains("servers.view"));

        // Unknown domains and actions are still ignored.
        let grant =
            PermissionGrant::parse(r#"{"servers":{"view":true,"reboot":"x"},"pets":1}"#).unwrap();
        assert_eq!(grant.granted(), vec![Capability::ServersView]);
    }

    #[test]
    fn test_capability_from_str() {
        assert_eq!("nodes.control".parse::<Capability>(), Ok(Capability::NodesControl));
        assert!("nodes".parse::<Capability>().is_err());
        assert!("nodes.reboot".parse::<Capability>().is_err());
        assert_eq!(Capability::BackupsRestore.to_string(), "backups.restore");
    }
}
