//! Player identity and roles

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Transport name of the coordinator
pub const COORDINATOR_PEER: &str = "coordinator";

/// Role an agent plays in a round
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Thinker,
    Guesser,
    /// Observer that translates broadcasts
    Translator,
}

impl Role {
    /// Prefix used in transport names, e.g. `guesser-Bob`
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Thinker => "thinker",
            Role::Guesser => "guesser",
            Role::Translator => "translator",
        }
    }

    /// Transport name for an agent with this role
    pub fn peer_name(&self, display_name: &str) -> String {
        match self {
            Role::Coordinator => COORDINATOR_PEER.to_string(),
            _ => format!("{}-{}", self.prefix(), display_name),
        }
    }

    fn from_segment(segment: &str) -> Option<(Role, &str)> {
        [Role::Thinker, Role::Guesser, Role::Translator]
            .into_iter()
            .find_map(|role| {
                segment
                    .strip_prefix(role.prefix())
                    .and_then(|rest| rest.strip_prefix('-'))
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (role, rest))
            })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Canonical player identifier.
///
/// The same player shows up as `Bob`, `guesser-Bob`, `classroom/guesser-Bob`
/// or a transport id such as `6bc9/1e73/426a (classroom/guesser-Bob/426a)`.
/// `PlayerId::parse` reduces all of them to the short name `Bob`; the
/// canonical form is computed once and is the only thing compared or hashed.
/// Deserialization goes through `parse`, so identifiers read off the wire are
/// already canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(String);

impl PlayerId {
    /// Normalize any known identifier form to its canonical short name
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();

        // Transport ids carry the routable path in parentheses
        let scope = match (raw.find('('), raw.rfind(')')) {
            (Some(open), Some(close)) if open < close => &raw[open + 1..close],
            _ => raw,
        };

        let segments: Vec<&str> = scope
            .split(|c: char| c == '/' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();

        if let Some((_, name)) = segments.iter().find_map(|s| Role::from_segment(s)) {
            return Self(name.to_string());
        }

        match segments.last() {
            Some(last) => Self((*last).to_string()),
            None => Self(raw.to_string()),
        }
    }

    /// Canonical short name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Role hint embedded in a raw identifier, if any
    pub fn role_hint(raw: &str) -> Option<Role> {
        raw.split(|c: char| c == '/' || c.is_whitespace() || c == '(' || c == ')')
            .find_map(|s| Role::from_segment(s).map(|(role, _)| role))
            .or_else(|| raw.contains(COORDINATOR_PEER).then_some(Role::Coordinator))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl Serialize for PlayerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PlayerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PlayerId::parse(&raw))
    }
}
