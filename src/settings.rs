//! Persistent settings.
//!
//! Stored as JSON under the user config directory
//! (`~/.config/tapd/settings.json` by default). Assignments are stored in
//! the same compact textual form the command line uses, so a settings file
//! reads like an invocation: `{"assignments": {"58": "@2"}}`.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::actions::{self, Assignments};
use crate::backend::{EmitterKind, LayouterKind, ListenerKind};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listener: ListenerKind,
    pub layouter: LayouterKind,
    pub emitter: EmitterKind,
    /// None means "not set"; the orchestrator defaults an unset bell to off.
    pub bell: Option<bool>,
    #[serde(with = "assignments_text")]
    pub assignments: Assignments,
}

impl Settings {
    /// Default settings file location, if a config directory exists at all.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tapd").join("settings.json"))
    }

    /// Loads the settings file; a missing file yields the defaults.
    pub fn load() -> Result<Settings> {
        let Some(path) = Self::path() else {
            log::debug!("no config directory, using default settings");
            return Ok(Settings::default());
        };
        if !path.is_file() {
            log::debug!("no settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("can't read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("can't parse {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path().context("no config directory to save settings into")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("can't create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("can't serialize settings")?;
        fs::write(&path, text).with_context(|| format!("can't write {}", path.display()))?;
        log::info!("settings saved to {}", path.display());
        Ok(())
    }

    /// Applies `over` on top of `self`: explicitly chosen backend kinds and
    /// bell win over the stored ones, assignments merge key by key (an empty
    /// action sequence unassigns).
    pub fn merge(&mut self, over: &Settings) {
        if over.listener != ListenerKind::Auto {
            self.listener = over.listener;
        }
        if over.layouter != LayouterKind::Auto {
            self.layouter = over.layouter;
        }
        if over.emitter != EmitterKind::Auto {
            self.emitter = over.emitter;
        }
        if over.bell.is_some() {
            self.bell = over.bell;
        }
        actions::merge(&mut self.assignments, &over.assignments);
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listener: {}, layouter: {}, emitter: {}, bell: {}, assignments: {{",
            self.listener,
            self.layouter,
            self.emitter,
            match self.bell {
                None => "unset",
                Some(true) => "enabled",
                Some(false) => "disabled",
            },
        )?;
        let mut sep = " ";
        for (key, acts) in &self.assignments {
            write!(f, "{sep}{key}: {}", actions::render_actions(acts))?;
            sep = ", ";
        }
        write!(f, " }}")
    }
}

/// (De)serializes the assignment table through its textual form.
mod assignments_text {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::actions::{self, Assignments};
    use crate::keys;

    pub fn serialize<S: Serializer>(table: &Assignments, ser: S) -> Result<S::Ok, S::Error> {
        let text: BTreeMap<String, String> = table
            .iter()
            .map(|(key, acts)| (key.to_string(), actions::render_actions(acts)))
            .collect();
        serde::Serialize::serialize(&text, ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Assignments, D::Error> {
        let text = BTreeMap::<String, String>::deserialize(de)?;
        let mut table = Assignments::new();
        for (key, acts) in text {
            table.insert(
                keys::parse_key(&key).map_err(D::Error::custom)?,
                actions::parse_actions(&acts).map_err(D::Error::custom)?,
            );
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, Layout};
    use crate::keys::KeyCode;

    fn sample() -> Settings {
        Settings {
            listener: ListenerKind::Evdev,
            layouter: LayouterKind::Dummy,
            emitter: EmitterKind::Uinput,
            bell: Some(true),
            assignments: [
                (KeyCode(58), vec![Action::ActivateLayout(Layout(1))]),
                (
                    KeyCode(29),
                    vec![
                        Action::EmitKeyTap(KeyCode(30)),
                        Action::ActivateLayout(Layout(2)),
                    ],
                ),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn json_round_trip() {
        let settings = sample();
        let text = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn assignments_serialize_textually() {
        let text = serde_json::to_string(&sample()).unwrap();
        assert!(text.contains(r#""29":"30, @2""#));
        assert!(text.contains(r#""58":"@1""#));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Settings>(r#"{"listner":"evdev"}"#).is_err());
    }

    #[test]
    fn bad_assignment_text_is_rejected() {
        assert!(
            serde_json::from_str::<Settings>(r#"{"assignments":{"58":"@0"}}"#).is_err()
        );
        assert!(
            serde_json::from_str::<Settings>(r#"{"assignments":{"999":"@1"}}"#).is_err()
        );
    }

    #[test]
    fn merge_precedence() {
        let mut base = sample();
        let over = Settings {
            listener: ListenerKind::Auto,
            layouter: LayouterKind::Auto,
            emitter: EmitterKind::Dummy,
            bell: None,
            assignments: [
                (KeyCode(58), Vec::new()),
                (KeyCode(59), vec![Action::ActivateLayout(Layout(3))]),
            ]
            .into_iter()
            .collect(),
        };
        base.merge(&over);
        // Auto/unset fields keep the stored values, explicit ones win.
        assert_eq!(base.listener, ListenerKind::Evdev);
        assert_eq!(base.emitter, EmitterKind::Dummy);
        assert_eq!(base.bell, Some(true));
        // 58 unassigned, 29 untouched, 59 added.
        assert!(!base.assignments.contains_key(&KeyCode(58)));
        assert!(base.assignments.contains_key(&KeyCode(29)));
        assert_eq!(
            base.assignments[&KeyCode(59)],
            vec![Action::ActivateLayout(Layout(3))]
        );
    }
}
