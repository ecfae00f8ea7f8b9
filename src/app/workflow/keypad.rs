use std::collections::BTreeMap;

use tracing::warn;

use crate::app::config::KeypadSettings;

/// Immutable digit-to-coordinate table for the broker app's fixed PIN
/// keypad. Targeting a different UI revision is a config change, not a
/// code change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeypadLayout {
    keys: BTreeMap<char, (i32, i32)>,
    fallback: (i32, i32),
}

impl KeypadLayout {
    pub fn from_settings(settings: &KeypadSettings) -> Self {
        let mut keys = BTreeMap::new();
        for (label, coordinate) in &settings.keys {
            let mut chars = label.chars();
            if let (Some(key), None) = (chars.next(), chars.next()) {
                keys.insert(key, (coordinate[0], coordinate[1]));
            }
        }
        Self {
            keys,
            fallback: (settings.fallback[0], settings.fallback[1]),
        }
    }

    /// Pure lookup: the same character always maps to the same pair.
    /// Characters outside the table resolve to the fallback coordinate
    /// (the '0' key by default) — almost certainly a data error in the
    /// stored PIN, hence the warning.
    pub fn coordinate_for(&self, key: char, trace_id: &str) -> (i32, i32) {
        match self.keys.get(&key) {
            Some(coordinate) => *coordinate,
            None => {
                warn!(
                    trace_id = %trace_id,
                    "PIN contains a character with no keypad mapping; using fallback key"
                );
                self.fallback
            }
        }
    }
}

impl Default for KeypadLayout {
    fn default() -> Self {
        Self::from_settings(&KeypadSettings::default())
    }
}
