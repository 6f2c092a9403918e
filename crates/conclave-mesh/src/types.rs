//! Core type definitions for mesh communication

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved receiver address delivered to every broadcast handler
pub const BROADCAST: &str = "broadcast";

/// Error type for ID validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValidationError {
    /// The ID string is empty
    Empty,
    /// The ID is the reserved broadcast address
    Reserved,
}

impl fmt::Display for IdValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "ID cannot be empty"),
            Self::Reserved => write!(f, "ID '{}' is reserved", BROADCAST),
        }
    }
}

impl std::error::Error for IdValidationError {}

/// Identifier of an agent registered with a hub
///
/// Any non-empty string except the reserved `broadcast` address is a valid
/// id. Queue logs encode the name they are given, so ids never have to be
/// path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Parse and validate an agent ID from a string
    ///
    /// # Examples
    ///
    /// ```
    /// use conclave_mesh::AgentId;
    ///
    /// assert!(AgentId::parse("research_agent_1").is_ok());
    /// assert!(AgentId::parse("agent:1").is_ok());
    /// assert!(AgentId::parse("research agent").is_ok());
    ///
    /// assert!(AgentId::parse("").is_err());
    /// assert!(AgentId::parse("broadcast").is_err());
    /// ```
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdValidationError> {
        let s = id.as_ref();

        if s.is_empty() {
            return Err(IdValidationError::Empty);
        }

        if s == BROADCAST {
            return Err(IdValidationError::Reserved);
        }

        Ok(Self(s.to_string()))
    }

    /// Get the agent ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = IdValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_creation() {
        let id = AgentId::parse("agent-1").unwrap();
        assert_eq!(id.as_str(), "agent-1");
        assert_eq!(id.to_string(), "agent-1");
    }

    #[test]
    fn test_agent_id_parse_valid() {
        assert!(AgentId::parse("agent-1").is_ok());
        assert!(AgentId::parse("my_agent").is_ok());
        assert!(AgentId::parse("agent.123").is_ok());
        assert!(AgentId::parse("AGENT-2").is_ok());
        assert!(AgentId::parse("a").is_ok());
        assert!(AgentId::parse("123").is_ok());
    }

    #[test]
    fn test_agent_id_parse_empty() {
        assert_eq!(AgentId::parse(""), Err(IdValidationError::Empty));
    }

    #[test]
    fn test_agent_id_accepts_any_characters() {
        for id in ["agent:1", "research agent", "../agent", " padded ", "équipe/1"] {
            assert_eq!(AgentId::parse(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn test_agent_id_rejects_broadcast() {
        assert_eq!(AgentId::parse(BROADCAST), Err(IdValidationError::Reserved));
    }

    #[test]
    fn test_agent_id_serde_validates() {
        let id: AgentId = serde_json::from_str("\"researcher\"").unwrap();
        assert_eq!(id.as_str(), "researcher");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"researcher\"");
        assert!(serde_json::from_str::<AgentId>("\"broadcast\"").is_err());
    }
}
