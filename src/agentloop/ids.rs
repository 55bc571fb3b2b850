//! Agent naming and the default primary system prompt.
//!
//! Primary agents are named `agent<N>` with N assigned monotonically by the
//! launcher. Sub-agents are named `<primary_id>_<uuid4>` and carry their
//! parent's ID as a prefix so event observers can group them.

use uuid::Uuid;

pub const PRIMARY_AGENT_PREFIX: &str = "agent";

/// Name under which the sub-agent spawning tool is registered.
pub const SUB_AGENT_TOOL_NAME: &str = "create_sub_agent";

/// System prompt installed for primary agents when the caller does not
/// provide one. Steers the model toward parallel delegation.
pub const DEFAULT_PRIMARY_SYSTEM_PROMPT: &str = "\
Your primary role is to delegate work by creating sub-agents whenever a task \
needs multiple steps or tools; handle single-step tasks directly yourself. \
You may launch up to 3 sub-agents at once and should run them in parallel \
whenever possible. Sub-agents cannot see your task or conversation history, \
so always give each one complete context and instructions. Sub-agents are \
deleted after returning their result, so no back-and-forth is possible. \
Briefly state your delegation plan before creating sub-agents, then organize \
the returned results into a clear answer.";

/// Build a primary agent ID from its launcher-assigned index.
pub fn primary_agent_id(index: usize) -> String {
    format!("{PRIMARY_AGENT_PREFIX}{index}")
}

/// Build a fresh sub-agent ID under the given primary agent.
pub fn sub_agent_id(primary_id: &str) -> String {
    format!("{}_{}", primary_id, Uuid::new_v4())
}

/// Whether `agent_id` names a primary agent: the `agent` prefix followed by
/// a bare non-negative integer.
pub fn is_primary_agent(agent_id: &str) -> bool {
    match agent_id.strip_prefix(PRIMARY_AGENT_PREFIX) {
        Some(suffix) => !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Extract the primary agent ID from a sub-agent ID, if the prefix before
/// the last `_` is itself a valid primary ID.
pub fn primary_id_of_sub(sub_agent_id: &str) -> Option<&str> {
    let (prefix, _) = sub_agent_id.rsplit_once('_')?;
    is_primary_agent(prefix).then_some(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_id_round_trip() {
        assert_eq!(primary_agent_id(0), "agent0");
        assert_eq!(primary_agent_id(17), "agent17");
        assert!(is_primary_agent("agent0"));
        assert!(is_primary_agent("agent42"));
    }

    #[test]
    fn test_non_primary_ids_rejected() {
        assert!(!is_primary_agent("agent"));
        assert!(!is_primary_agent("agent-1"));
        assert!(!is_primary_agent("agentx"));
        assert!(!is_primary_agent("subagent0"));
        assert!(!is_primary_agent("agent0_f00"));
    }

    #[test]
    fn test_sub_agent_ids_carry_parent() {
        let sub = sub_agent_id("agent3");
        assert!(sub.starts_with("agent3_"));
        assert!(!is_primary_agent(&sub));
        assert_eq!(primary_id_of_sub(&sub), Some("agent3"));
    }

    #[test]
    fn test_primary_of_malformed_sub() {
        assert_eq!(primary_id_of_sub("agent3"), None);
        assert_eq!(primary_id_of_sub("notanagent_abc"), None);
    }
}
