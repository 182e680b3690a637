//! Parameter addressing for automation.
//!
//! Automation lanes name their target symbolically (`"filter_cutoff"`). A
//! [`ParameterResolver`] turns that name into a [`ParameterKind`], which is
//! either a plain control change or an NRPN (non-registered parameter number)
//! addressed by a category/parameter pair. The compiler treats the result as
//! opaque and only the dispatcher expands it into wire messages.

use crate::error::{check_u7, Error, Result};
use crate::message::MidiMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NRPN parameter number MSB controller.
pub const CC_NRPN_MSB: u8 = 99;
/// NRPN parameter number LSB controller.
pub const CC_NRPN_LSB: u8 = 98;
/// Data entry MSB controller.
pub const CC_DATA_ENTRY_MSB: u8 = 6;
/// Data entry LSB controller.
pub const CC_DATA_ENTRY_LSB: u8 = 38;

/// How a parameter is addressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// A single control change
    Cc(u8),
    /// A four-message NRPN write
    Nrpn { msb: u8, lsb: u8 },
}

/// A resolved parameter on a specific channel (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterAddress {
    pub channel: u8,
    pub kind: ParameterKind,
}

impl ParameterAddress {
    /// Expand a value write into the wire messages that carry it.
    pub fn messages(&self, value: u8) -> Vec<MidiMessage> {
        let channel = self.channel;
        let cc = |controller, value| MidiMessage::ControlChange { channel, controller, value };
        match self.kind {
            ParameterKind::Cc(controller) => vec![cc(controller, value)],
            ParameterKind::Nrpn { msb, lsb } => vec![
                cc(CC_NRPN_MSB, msb),
                cc(CC_NRPN_LSB, lsb),
                cc(CC_DATA_ENTRY_MSB, value),
                cc(CC_DATA_ENTRY_LSB, 0),
            ],
        }
    }
}

/// Maps symbolic parameter names to wire addresses.
pub trait ParameterResolver: Send + Sync {
    /// Resolve a parameter name, or `None` if it is unknown.
    fn resolve(&self, name: &str) -> Option<ParameterKind>;
}

/// Parse an inline address such as `cc:74` or `nrpn:1:21`.
///
/// Inline addresses work without any table, so requests can target
/// parameters the configuration does not name.
pub fn parse_inline(name: &str) -> Option<ParameterKind> {
    let mut parts = name.split(':');
    match (parts.next()?, parts.next(), parts.next(), parts.next()) {
        ("cc", Some(cc), None, None) => cc.parse::<u8>().ok().filter(|c| *c <= 127).map(ParameterKind::Cc),
        ("nrpn", Some(msb), Some(lsb), None) => {
            let msb = msb.parse::<u8>().ok().filter(|v| *v <= 127)?;
            let lsb = lsb.parse::<u8>().ok().filter(|v| *v <= 127)?;
            Some(ParameterKind::Nrpn { msb, lsb })
        }
        _ => None,
    }
}

/// One named entry of a [`ParameterTable`], as written in TOML.
///
/// ```toml
/// filter_cutoff = { cc = 74 }
/// filter_resonance = { nrpn = [1, 21] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrpn: Option<[u8; 2]>,
}

impl ParameterEntry {
    fn kind(&self) -> Option<ParameterKind> {
        match (self.cc, self.nrpn) {
            (Some(cc), None) => Some(ParameterKind::Cc(cc)),
            (None, Some([msb, lsb])) => Some(ParameterKind::Nrpn { msb, lsb }),
            _ => None,
        }
    }
}

/// Configuration-driven parameter catalog.
///
/// Names that are not in the table still resolve when written inline
/// (`cc:N`, `nrpn:MSB:LSB`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterTable {
    entries: BTreeMap<String, ParameterEntry>,
}

impl ParameterTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a control-change parameter.
    pub fn with_cc(mut self, name: impl Into<String>, controller: u8) -> Self {
        self.entries.insert(name.into(), ParameterEntry { cc: Some(controller), nrpn: None });
        self
    }

    /// Add an NRPN parameter.
    pub fn with_nrpn(mut self, name: impl Into<String>, msb: u8, lsb: u8) -> Self {
        self.entries.insert(name.into(), ParameterEntry { cc: None, nrpn: Some([msb, lsb]) });
        self
    }

    /// Check every entry names exactly one valid address.
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.entries {
            let kind = entry.kind().ok_or_else(|| {
                Error::Config(format!("parameter '{name}' must set exactly one of `cc` or `nrpn`"))
            })?;
            match kind {
                ParameterKind::Cc(cc) => {
                    check_u7("controller", cc as i64, 0, 127)?;
                }
                ParameterKind::Nrpn { msb, lsb } => {
                    check_u7("nrpn msb", msb as i64, 0, 127)?;
                    check_u7("nrpn lsb", lsb as i64, 0, 127)?;
                }
            }
        }
        Ok(())
    }

    /// All parameter names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ParameterResolver for ParameterTable {
    fn resolve(&self, name: &str) -> Option<ParameterKind> {
        self.entries
            .get(name)
            .and_then(ParameterEntry::kind)
            .or_else(|| parse_inline(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nrpn_expands_to_four_cc_messages() {
        let address = ParameterAddress {
            channel: 0,
            kind: ParameterKind::Nrpn { msb: 1, lsb: 21 },
        };
        let msgs = address.messages(90);
        let bytes: Vec<Vec<u8>> = msgs.iter().map(MidiMessage::to_bytes).collect();
        assert_eq!(
            bytes,
            vec![vec![0xB0, 99, 1], vec![0xB0, 98, 21], vec![0xB0, 6, 90], vec![0xB0, 38, 0]]
        );
    }

    #[test]
    fn test_cc_expands_to_single_message() {
        let address = ParameterAddress { channel: 3, kind: ParameterKind::Cc(74) };
        assert_eq!(
            address.messages(127),
            vec![MidiMessage::ControlChange { channel: 3, controller: 74, value: 127 }]
        );
    }

    #[test]
    fn test_inline_addresses() {
        assert_eq!(parse_inline("cc:74"), Some(ParameterKind::Cc(74)));
        assert_eq!(parse_inline("nrpn:2:8"), Some(ParameterKind::Nrpn { msb: 2, lsb: 8 }));
        assert_eq!(parse_inline("cc:200"), None);
        assert_eq!(parse_inline("nrpn:1"), None);
        assert_eq!(parse_inline("filter_cutoff"), None);
    }

    #[test]
    fn test_table_resolution() {
        let table = ParameterTable::new()
            .with_cc("filter_cutoff", 74)
            .with_nrpn("filter_resonance", 1, 21);
        assert_eq!(table.resolve("filter_cutoff"), Some(ParameterKind::Cc(74)));
        assert_eq!(
            table.resolve("filter_resonance"),
            Some(ParameterKind::Nrpn { msb: 1, lsb: 21 })
        );
        assert_eq!(table.resolve("cc:10"), Some(ParameterKind::Cc(10)));
        assert_eq!(table.resolve("missing"), None);
        assert!(table.validate().is_ok());
    }

    #[test]
    fn test_table_from_toml() {
        let table: ParameterTable = toml::from_str(
            r#"
            filter_cutoff = { cc = 74 }
            delay_time = { nrpn = [2, 0] }
            "#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("delay_time"), Some(ParameterKind::Nrpn { msb: 2, lsb: 0 }));

        let broken: ParameterTable = toml::from_str("both = { cc = 1, nrpn = [1, 2] }").unwrap();
        assert!(matches!(broken.validate(), Err(Error::Config(_))));
    }
}
