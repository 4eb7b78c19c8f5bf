//! Component capabilities, bindings, and cached state
//!
//! A component is one logical I/O endpoint. The core never interprets its
//! address; only the hosting source does.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ComponentId, Metadata, OperantError, SourceId, Value};

/// Component capability set (1 byte on the wire)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentKind(pub u8);

impl ComponentKind {
    pub const NONE: ComponentKind = ComponentKind(0);

    // Capability bits
    pub const DIGITAL: u8 = 0b0000_0001;
    pub const ANALOG: u8 = 0b0000_0010;
    pub const INPUT: u8 = 0b0000_0100;
    pub const OUTPUT: u8 = 0b0000_1000;

    pub const DIGITAL_INPUT: ComponentKind = ComponentKind(Self::DIGITAL | Self::INPUT);
    pub const DIGITAL_OUTPUT: ComponentKind = ComponentKind(Self::DIGITAL | Self::OUTPUT);
    pub const DIGITAL_IO: ComponentKind = ComponentKind(Self::DIGITAL | Self::INPUT | Self::OUTPUT);
    pub const ANALOG_INPUT: ComponentKind = ComponentKind(Self::ANALOG | Self::INPUT);
    pub const ANALOG_OUTPUT: ComponentKind = ComponentKind(Self::ANALOG | Self::OUTPUT);
    pub const ANALOG_IO: ComponentKind = ComponentKind(Self::ANALOG | Self::INPUT | Self::OUTPUT);
    /// Any input, digital or analog
    pub const INPUT_ANY: ComponentKind = ComponentKind(Self::INPUT);
    /// Any output, digital or analog
    pub const OUTPUT_ANY: ComponentKind = ComponentKind(Self::OUTPUT);

    const ALL: u8 = Self::DIGITAL | Self::ANALOG | Self::INPUT | Self::OUTPUT;

    #[inline]
    pub fn new(bits: u8) -> Self {
        ComponentKind(bits)
    }

    #[inline]
    pub fn is_digital(self) -> bool {
        self.0 & Self::DIGITAL != 0
    }

    #[inline]
    pub fn is_analog(self) -> bool {
        self.0 & Self::ANALOG != 0
    }

    #[inline]
    pub fn is_input(self) -> bool {
        self.0 & Self::INPUT != 0
    }

    #[inline]
    pub fn is_output(self) -> bool {
        self.0 & Self::OUTPUT != 0
    }

    /// Does this component provide every capability `required` asks for?
    #[inline]
    pub fn satisfies(self, required: ComponentKind) -> bool {
        self.0 & required.0 == required.0
    }

    /// Parse from wire byte, rejecting unknown bits
    pub fn from_byte(b: u8) -> Option<Self> {
        if b & !Self::ALL == 0 {
            Some(ComponentKind(b))
        } else {
            None
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    fn name(self) -> String {
        let signal = match (self.is_digital(), self.is_analog()) {
            (true, false) => "digital",
            (false, true) => "analog",
            (true, true) => "mixed",
            (false, false) => "any",
        };
        let direction = match (self.is_input(), self.is_output()) {
            (true, false) => "input",
            (false, true) => "output",
            (true, true) => "io",
            (false, false) => "none",
        };
        format!("{}_{}", signal, direction)
    }
}

impl FromStr for ComponentKind {
    type Err = OperantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "digital_input" => Self::DIGITAL_INPUT,
            "digital_output" => Self::DIGITAL_OUTPUT,
            "digital_io" => Self::DIGITAL_IO,
            "analog_input" => Self::ANALOG_INPUT,
            "analog_output" => Self::ANALOG_OUTPUT,
            "analog_io" => Self::ANALOG_IO,
            "any_input" => Self::INPUT_ANY,
            "any_output" => Self::OUTPUT_ANY,
            "any_io" => ComponentKind(Self::INPUT | Self::OUTPUT),
            other => {
                return Err(OperantError::MalformedAddressFile(format!(
                    "unknown component type '{}'",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

impl TryFrom<String> for ComponentKind {
    type Error = OperantError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComponentKind> for String {
    fn from(value: ComponentKind) -> Self {
        value.name()
    }
}

impl fmt::Debug for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.name())
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One slot of a named component bound to a source address.
/// Produced by the address-file loader and carried by `AddTask`.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentBinding {
    pub name: String,
    pub slot: u16,
    pub kind: ComponentKind,
    pub source: SourceId,
    pub address: String,
    pub metadata: Metadata,
}

impl ComponentBinding {
    pub fn new(
        name: impl Into<String>,
        slot: u16,
        kind: ComponentKind,
        source: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        ComponentBinding {
            name: name.into(),
            slot,
            kind,
            source: SourceId::new(source),
            address: address.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A component owned by exactly one task
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub slot: u16,
    pub kind: ComponentKind,
    pub source: SourceId,
    /// Opaque to everything but the hosting source
    pub address: String,
    pub metadata: Metadata,
    /// Last known value
    pub state: Value,
    /// False once the hosting source has been lost
    pub available: bool,
}

impl Component {
    pub fn from_binding(id: ComponentId, binding: &ComponentBinding) -> Self {
        Component {
            id,
            name: binding.name.clone(),
            slot: binding.slot,
            kind: binding.kind,
            source: binding.source.clone(),
            address: binding.address.clone(),
            metadata: binding.metadata.clone(),
            state: Value::Null,
            available: true,
        }
    }

    /// Store a new value; returns true if it differs from the cached one
    pub fn update(&mut self, value: Value) -> bool {
        if self.state == value {
            return false;
        }
        self.state = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_satisfies() {
        assert!(ComponentKind::DIGITAL_IO.satisfies(ComponentKind::DIGITAL_INPUT));
        assert!(ComponentKind::ANALOG_INPUT.satisfies(ComponentKind::INPUT_ANY));
        assert!(!ComponentKind::DIGITAL_INPUT.satisfies(ComponentKind::DIGITAL_OUTPUT));
        assert!(!ComponentKind::ANALOG_OUTPUT.satisfies(ComponentKind::DIGITAL_OUTPUT));
    }

    #[test]
    fn test_kind_names_parse_back() {
        for kind in [
            ComponentKind::DIGITAL_INPUT,
            ComponentKind::DIGITAL_OUTPUT,
            ComponentKind::ANALOG_IO,
            ComponentKind::OUTPUT_ANY,
        ] {
            let name: String = kind.into();
            assert_eq!(name.parse::<ComponentKind>().unwrap(), kind);
        }
        assert!("laser".parse::<ComponentKind>().is_err());
    }

    #[test]
    fn test_kind_rejects_unknown_bits() {
        assert!(ComponentKind::from_byte(0b0001_0000).is_none());
        assert_eq!(
            ComponentKind::from_byte(0b0000_0101),
            Some(ComponentKind::DIGITAL_INPUT)
        );
    }

    #[test]
    fn test_update_reports_change() {
        let binding = ComponentBinding::new("lever", 0, ComponentKind::DIGITAL_INPUT, "ni", "p0.1");
        let mut component = Component::from_binding(ComponentId::new("lever-1-0"), &binding);

        assert!(component.update(Value::Bool(true)));
        assert!(!component.update(Value::Bool(true)));
        assert!(component.update(Value::Bool(false)));
    }
}
