//! Agent identity and routing headers.

use serde::{Deserialize, Serialize};

use crate::ids::ClientInstanceId;

/// Header carrying the agent name.
pub const AGENT_NAME_HEADER: &str = "X-Agent-Name";
/// Header carrying the per-process client instance id.
pub const CLIENT_INSTANCE_HEADER: &str = "X-Client-Instance";

/// Who this session acts as. Immutable for the life of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Agent handle as known to the server.
    pub agent_name: String,
    /// Generated once per process start.
    pub client_instance_id: ClientInstanceId,
}

impl AgentIdentity {
    /// Identity with a freshly generated client instance id.
    #[must_use]
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            client_instance_id: ClientInstanceId::new(),
        }
    }
}

/// Supplies the routing headers attached to every outbound call.
#[derive(Clone, Debug)]
pub struct IdentityManager {
    identity: AgentIdentity,
}

impl IdentityManager {
    /// Wrap an identity.
    #[must_use]
    pub fn new(identity: AgentIdentity) -> Self {
        Self { identity }
    }

    /// The managed identity.
    #[must_use]
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Agent name.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.identity.agent_name
    }

    /// Header name/value pairs, agent name first.
    #[must_use]
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            (AGENT_NAME_HEADER, self.identity.agent_name.clone()),
            (
                CLIENT_INSTANCE_HEADER,
                self.identity.client_instance_id.to_string(),
            ),
        ]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_name_and_instance() {
        let identity = AgentIdentity::new("scout");
        let instance = identity.client_instance_id.clone();
        let mgr = IdentityManager::new(identity);
        let headers = mgr.headers();
        assert_eq!(headers[0], ("X-Agent-Name", "scout".to_string()));
        assert_eq!(headers[1].0, "X-Client-Instance");
        assert_eq!(headers[1].1, instance.as_str());
    }

    #[test]
    fn headers_are_stable_across_calls() {
        let mgr = IdentityManager::new(AgentIdentity::new("scout"));
        assert_eq!(mgr.headers(), mgr.headers());
    }

    #[test]
    fn each_identity_gets_own_instance() {
        let a = AgentIdentity::new("a");
        let b = AgentIdentity::new("a");
        assert_ne!(a.client_instance_id, b.client_instance_id);
    }
}
