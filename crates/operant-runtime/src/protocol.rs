//! Address and protocol files
//!
//! An address file maps each component name to the hardware that serves
//! it, either one entry or a list of entries (one per slot):
//!
//! ```json
//! {
//!   "lever": { "type": "digital_input", "source": "ni", "address": "port0/line1" },
//!   "light": [
//!     { "type": "digital_output", "source": "ni", "address": "port1/line0" },
//!     { "type": "digital_output", "source": "ni", "address": "port1/line1" }
//!   ]
//! }
//! ```
//!
//! A protocol file overrides task constants: `{ "constants": { "iti": 5.0 } }`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use operant_core::{
    ChamberId, ComponentBinding, ComponentKind, Event, EventKind, Metadata, OperantError,
    OperantResult, SourceId, Value,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddressEntry {
    #[serde(rename = "type")]
    kind: ComponentKind,
    source: String,
    address: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AddressSlots {
    One(AddressEntry),
    Many(Vec<AddressEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProtocolFile {
    #[serde(default)]
    constants: Metadata,
}

/// Parse an address map into bindings, slots numbered in list order
pub fn parse_address_map(json: &str) -> OperantResult<Vec<ComponentBinding>> {
    let map: BTreeMap<String, AddressSlots> =
        serde_json::from_str(json).map_err(|e| OperantError::MalformedAddressFile(e.to_string()))?;

    let mut bindings = Vec::new();
    for (name, slots) in map {
        let entries = match slots {
            AddressSlots::One(entry) => vec![entry],
            AddressSlots::Many(entries) => entries,
        };
        if entries.is_empty() {
            return Err(OperantError::MalformedAddressFile(format!(
                "component '{}' has no entries",
                name
            )));
        }
        if entries.len() > u16::MAX as usize {
            return Err(OperantError::MalformedAddressFile(format!(
                "component '{}' has too many slots",
                name
            )));
        }

        for (slot, entry) in entries.into_iter().enumerate() {
            if entry.source.is_empty() {
                return Err(OperantError::MalformedAddressFile(format!(
                    "component '{}' slot {}: empty source",
                    name, slot
                )));
            }
            bindings.push(
                ComponentBinding::new(&name, slot as u16, entry.kind, entry.source, entry.address)
                    .with_metadata(entry.metadata),
            );
        }
    }
    Ok(bindings)
}

pub fn load_address_file(path: impl AsRef<Path>) -> OperantResult<Vec<ComponentBinding>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| OperantError::MalformedAddressFile(format!("{}: {}", path.display(), e)))?;
    parse_address_map(&json)
}

/// Parse a protocol file into constant overrides
pub fn parse_protocol(json: &str) -> OperantResult<Metadata> {
    let protocol: ProtocolFile =
        serde_json::from_str(json).map_err(|e| OperantError::MalformedProtocol(e.to_string()))?;
    Ok(protocol.constants)
}

pub fn load_protocol_file(path: impl AsRef<Path>) -> OperantResult<Metadata> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| OperantError::MalformedProtocol(format!("{}: {}", path.display(), e)))?;
    parse_protocol(&json)
}

/// Sources named by a set of bindings, each once
pub fn sources_of(bindings: &[ComponentBinding]) -> Vec<SourceId> {
    let mut sources: Vec<SourceId> = bindings.iter().map(|b| b.source.clone()).collect();
    sources.sort();
    sources.dedup();
    sources
}

/// Build the `AddTask` event for a chamber.
///
/// `loggers` names logger types from the registry to attach to the chamber.
pub fn add_task(
    chamber: ChamberId,
    task_type: impl Into<String>,
    bindings: Vec<ComponentBinding>,
    constants: Metadata,
    loggers: &[&str],
) -> Event {
    let event = Event::new(
        chamber,
        EventKind::AddTask {
            task_type: task_type.into(),
            bindings,
            constants,
        },
    );
    if loggers.is_empty() {
        return event;
    }
    event.with_meta(
        "loggers",
        Value::List(loggers.iter().map(|l| Value::Text(l.to_string())).collect()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESSES: &str = r#"{
        "lever": { "type": "digital_input", "source": "ni", "address": "port0/line1" },
        "light": [
            { "type": "digital_output", "source": "ni", "address": "port1/line0" },
            { "type": "digital_output", "source": "arduino", "address": "13",
              "metadata": { "inverted": true } }
        ]
    }"#;

    #[test]
    fn test_address_map() {
        let bindings = parse_address_map(ADDRESSES).unwrap();
        assert_eq!(bindings.len(), 3);

        let lever = &bindings[0];
        assert_eq!(lever.name, "lever");
        assert_eq!(lever.slot, 0);
        assert_eq!(lever.kind, ComponentKind::DIGITAL_INPUT);
        assert_eq!(lever.source, SourceId::new("ni"));

        let light = &bindings[2];
        assert_eq!(light.name, "light");
        assert_eq!(light.slot, 1);
        assert_eq!(light.address, "13");
        assert_eq!(light.metadata.get("inverted"), Some(&Value::Bool(true)));

        assert_eq!(
            sources_of(&bindings),
            vec![SourceId::new("arduino"), SourceId::new("ni")]
        );
    }

    #[test]
    fn test_address_map_errors() {
        let cases = [
            "not json",
            r#"{ "lever": { "type": "digital_input", "source": "ni" } }"#,
            r#"{ "lever": { "type": "lever", "source": "ni", "address": "a" } }"#,
            r#"{ "lever": { "type": "digital_input", "source": "ni", "address": "a", "pin": 3 } }"#,
            r#"{ "lever": [] }"#,
            r#"{ "lever": { "type": "digital_input", "source": "", "address": "a" } }"#,
        ];
        for case in cases {
            let err = parse_address_map(case).unwrap_err();
            assert!(
                matches!(err, OperantError::MalformedAddressFile(_)),
                "{}: {:?}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_protocol() {
        let constants = parse_protocol(r#"{ "constants": { "iti": 5.0, "trials": 20 } }"#).unwrap();
        assert_eq!(constants.get("iti"), Some(&Value::Float(5.0)));
        assert_eq!(constants.get("trials"), Some(&Value::Int(20)));

        assert!(parse_protocol("{}").unwrap().is_empty());
        assert!(matches!(
            parse_protocol(r#"{ "constant": {} }"#),
            Err(OperantError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_missing_files() {
        assert!(matches!(
            load_address_file("/nonexistent/addresses.json"),
            Err(OperantError::MalformedAddressFile(_))
        ));
        assert!(matches!(
            load_protocol_file("/nonexistent/protocol.json"),
            Err(OperantError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_add_task_event() {
        let bindings = parse_address_map(ADDRESSES).unwrap();
        let event = add_task(ChamberId::new(2), "press", bindings.clone(), Metadata::new(), &["memory"]);
        assert_eq!(event.chamber, Some(ChamberId::new(2)));
        assert_eq!(
            event.metadata.get("loggers"),
            Some(&Value::List(vec![Value::Text("memory".into())]))
        );
        match event.kind {
            EventKind::AddTask { task_type, bindings: carried, .. } => {
                assert_eq!(task_type, "press");
                assert_eq!(carried, bindings);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
