use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Semantic signal groups. Declaration order is priority order: `Red` wins
/// over everything, `Off` loses to everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Group {
    Red,
    Yellow,
    Green,
    Warn,
    Countdown,
    Off,
}

pub const GROUP_PRIORITY: [Group; 6] = [
    Group::Red,
    Group::Yellow,
    Group::Green,
    Group::Warn,
    Group::Countdown,
    Group::Off,
];

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Group::Red => "RED",
            Group::Yellow => "YELLOW",
            Group::Green => "GREEN",
            Group::Warn => "WARN",
            Group::Countdown => "COUNTDOWN",
            Group::Off => "OFF",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_uppercase().as_str() {
            "RED" => Ok(Group::Red),
            "YELLOW" => Ok(Group::Yellow),
            "GREEN" => Ok(Group::Green),
            "WARN" => Ok(Group::Warn),
            "COUNTDOWN" => Ok(Group::Countdown),
            "OFF" => Ok(Group::Off),
            other => Err(anyhow!("config: unknown signal group '{}'", other)),
        }
    }

    /// Position in the priority list (0 = highest).
    pub fn priority(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single group considered present for a frame, or `NONE`.
///
/// Serializes as the group name or the string `"NONE"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameState(pub Option<Group>);

impl FrameState {
    pub const NONE: FrameState = FrameState(None);

    pub fn group(self) -> Option<Group> {
        self.0
    }

    pub fn as_str(self) -> &'static str {
        self.0.map(Group::as_str).unwrap_or("NONE")
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().eq_ignore_ascii_case("NONE") {
            return Ok(FrameState::NONE);
        }
        Group::parse(raw).map(|group| FrameState(Some(group)))
    }
}

impl Serialize for FrameState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FrameState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FrameState::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub id: u32,
    pub name: String,
    /// Classes without a group never influence frame state or captions.
    #[serde(default)]
    pub group: Option<Group>,
}

/// Static class-id -> (name, group) table. Built once, read-only afterwards.
#[derive(Clone, Debug)]
pub struct ClassTable {
    entries: BTreeMap<u32, ClassEntry>,
}

const DEFAULT_CLASSES: [(u32, &str, Option<Group>); 14] = [
    (0, "green_straight", Some(Group::Green)),
    (1, "green_left", Some(Group::Green)),
    (2, "red", Some(Group::Red)),
    (3, "red_left", Some(Group::Red)),
    (4, "green_arrow", Some(Group::Green)),
    (5, "yellow", Some(Group::Yellow)),
    (6, "yellow_left", Some(Group::Yellow)),
    (7, "countdown_display", Some(Group::Countdown)),
    (8, "off_signal", Some(Group::Off)),
    (9, "red_pedestrian", Some(Group::Red)),
    (10, "green_pedestrian", Some(Group::Green)),
    (11, "blue_straight", Some(Group::Green)),
    (12, "red_alt", Some(Group::Red)),
    (13, "pedestrian_warning", Some(Group::Warn)),
];

impl ClassTable {
    pub fn new(entries: Vec<ClassEntry>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            if entry.name.trim().is_empty() {
                return Err(anyhow!("config: class {} has an empty name", entry.id));
            }
            let id = entry.id;
            if map.insert(id, entry).is_some() {
                return Err(anyhow!("config: duplicate class id {}", id));
            }
        }
        Ok(Self { entries: map })
    }

    pub fn group_of(&self, class_id: u32) -> Option<Group> {
        self.entries.get(&class_id).and_then(|entry| entry.group)
    }

    pub fn name_of(&self, class_id: u32) -> String {
        self.entries
            .get(&class_id)
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClassEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        let entries = DEFAULT_CLASSES
            .iter()
            .map(|(id, name, group)| {
                (
                    *id,
                    ClassEntry {
                        id: *id,
                        name: name.to_string(),
                        group: *group,
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_total_and_red_first() {
        for pair in GROUP_PRIORITY.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].priority() < pair[1].priority());
        }
        assert_eq!(GROUP_PRIORITY[0], Group::Red);
    }

    #[test]
    fn default_table_maps_every_class() {
        let table = ClassTable::default();
        assert_eq!(table.len(), 14);
        for id in [2, 3, 9, 12] {
            assert_eq!(table.group_of(id), Some(Group::Red));
        }
        for id in [0, 1, 4, 10, 11] {
            assert_eq!(table.group_of(id), Some(Group::Green));
        }
        assert_eq!(table.group_of(13), Some(Group::Warn));
        assert_eq!(table.group_of(7), Some(Group::Countdown));
        assert_eq!(table.group_of(8), Some(Group::Off));
    }

    #[test]
    fn frame_state_serializes_as_group_name_or_none() -> Result<()> {
        assert_eq!(serde_json::to_string(&FrameState::NONE)?, "\"NONE\"");
        assert_eq!(serde_json::to_string(&FrameState(Some(Group::Red)))?, "\"RED\"");
        let parsed: FrameState = serde_json::from_str("\"COUNTDOWN\"")?;
        assert_eq!(parsed, FrameState(Some(Group::Countdown)));
        assert!(serde_json::from_str::<FrameState>("null").is_err());
        Ok(())
    }

    #[test]
    fn unknown_class_has_no_group() {
        let table = ClassTable::default();
        assert_eq!(table.group_of(42), None);
        assert_eq!(table.name_of(42), "class_42");
    }

    #[test]
    fn rejects_duplicate_ids() {
        let entry = ClassEntry {
            id: 1,
            name: "a".to_string(),
            group: None,
        };
        assert!(ClassTable::new(vec![entry.clone(), entry]).is_err());
    }

    #[test]
    fn group_serializes_uppercase() -> Result<()> {
        assert_eq!(serde_json::to_string(&Group::Countdown)?, "\"COUNTDOWN\"");
        assert_eq!(serde_json::to_string(&FrameState::NONE)?, "null");
        assert_eq!(FrameState::NONE.as_str(), "NONE");
        assert_eq!(Group::parse("yellow")?, Group::Yellow);
        Ok(())
    }
}
