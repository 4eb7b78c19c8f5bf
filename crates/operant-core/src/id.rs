//! Identity types for the task-execution engine
//!
//! Chambers and states are small integers so they stay cheap on the wire.
//! Components and sources are named, because their names come straight from
//! address files and driver registrations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Chamber identity - one physical enclosure, one live task
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChamberId(pub u32);

impl ChamberId {
    #[inline]
    pub fn new(id: u32) -> Self {
        ChamberId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        ChamberId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for ChamberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chamber({})", self.0)
    }
}

impl fmt::Display for ChamberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State identity - declared by each task type in its state table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl StateId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        StateId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        StateId(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self.0)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Component identity - unique across the whole task process
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        ComponentId(id.into())
    }

    /// Identity of one slot of a named component in a chamber.
    /// Format: `name-chamber-slot`
    pub fn for_slot(chamber: ChamberId, name: &str, slot: u16) -> Self {
        ComponentId(format!("{}-{}-{}", name, chamber.0, slot))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source identity - the name of one hardware interface
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        SourceId::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chamber_id_roundtrip() {
        let id = ChamberId::new(0xDEAD_BEEF);
        assert_eq!(ChamberId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn test_component_slot_ids_are_distinct() {
        let a = ComponentId::for_slot(ChamberId::new(1), "nose_poke", 0);
        let b = ComponentId::for_slot(ChamberId::new(1), "nose_poke", 1);
        let c = ComponentId::for_slot(ChamberId::new(2), "nose_poke", 0);

        assert_eq!(a.as_str(), "nose_poke-1-0");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
