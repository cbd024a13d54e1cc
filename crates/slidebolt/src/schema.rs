//! Domain schema catalog
//!
//! Built-in descriptions of the entity domains the gateway knows about: which
//! command types a domain accepts and which event names it emits.

use slidebolt_types::DomainDescriptor;

use crate::{GatewayError, Result};

/// (domain, commands, events), kept sorted by domain
const DOMAINS: &[(&str, &[&str], &[&str])] = &[
    (
        "automation",
        &["run", "enable", "disable"],
        &["triggered", "script_error"],
    ),
    ("binary_sensor", &[], &["state"]),
    ("camera", &["snapshot", "stream_start", "stream_stop"], &["state", "motion"]),
    ("cover", &["open", "close", "stop", "set_position"], &["state"]),
    (
        "light",
        &["turn_on", "turn_off", "toggle", "set_brightness", "set_color"],
        &["state"],
    ),
    ("lock", &["lock", "unlock"], &["state", "jammed"]),
    ("sensor", &[], &["state"]),
    ("switch", &["turn_on", "turn_off", "toggle"], &["state"]),
];

fn descriptor(entry: &(&str, &[&str], &[&str])) -> DomainDescriptor {
    let (domain, commands, events) = entry;
    DomainDescriptor {
        domain: domain.to_string(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        events: events.iter().map(|e| e.to_string()).collect(),
    }
}

/// Every known domain, sorted by name
pub fn list() -> Vec<DomainDescriptor> {
    DOMAINS.iter().map(descriptor).collect()
}

pub fn get(domain: &str) -> Result<DomainDescriptor> {
    DOMAINS
        .iter()
        .find(|(name, _, _)| *name == domain)
        .map(descriptor)
        .ok_or_else(|| GatewayError::UnknownDomain(domain.to_string()))
}

/// Whether a command type is declared for a domain
pub fn accepts(domain: &str, command_type: &str) -> bool {
    get(domain).is_ok_and(|d| d.commands.iter().any(|c| c == command_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_is_sorted_and_complete() {
        let domains: Vec<String> = list().into_iter().map(|d| d.domain).collect();
        let mut sorted = domains.clone();
        sorted.sort();
        assert_eq!(domains, sorted);
        for expected in ["switch", "light", "sensor", "binary_sensor", "cover", "lock", "camera", "automation"] {
            assert!(domains.iter().any(|d| d == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_get_known_and_unknown() {
        let switch = get("switch").unwrap();
        assert_eq!(switch.domain, "switch");
        assert!(switch.commands.contains(&"turn_on".to_string()));

        let err = get("not-a-real-domain").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_accepts() {
        assert!(accepts("light", "set_brightness"));
        assert!(!accepts("sensor", "turn_on"));
        assert!(!accepts("nope", "turn_on"));
    }
}
