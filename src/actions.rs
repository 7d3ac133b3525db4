//! Actions and key assignments.
//!
//! An assignment binds a key to a sequence of actions executed when that key
//! is tapped. Action sequences have a compact textual form used by both the
//! command line and the settings file: `@N` activates keyboard layout `N`, a
//! bare key token emits a tap of that key, and sequence items are separated
//! by commas. Rendering and parsing are exact inverses for any sequence that
//! does not contain [`Action::None`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::keys::{self, KeyCode, KeySet};

/// 1-based keyboard layout index. 0 means "unset".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Layout(pub u32);

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Layout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let index: u32 = s
            .trim()
            .parse()
            .map_err(|_| anyhow!("bad layout index {s:?}"))?;
        if index == 0 {
            return Err(anyhow!("layout index must be 1 or greater"));
        }
        Ok(Layout(index))
    }
}

/// What to do when an assigned key is tapped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Action {
    /// Placeholder; executing it does nothing. Has no textual form.
    #[default]
    None,
    ActivateLayout(Layout),
    EmitKeyTap(KeyCode),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "(*noop*)"),
            Action::ActivateLayout(layout) => write!(f, "@{layout}"),
            Action::EmitKeyTap(key) => write!(f, "{key}"),
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('@') {
            Ok(Action::ActivateLayout(rest.parse()?))
        } else {
            Ok(Action::EmitKeyTap(keys::parse_key(s)?))
        }
    }
}

/// Ordered action sequence.
pub type Actions = Vec<Action>;

/// Key assignment table. A key mapped to an empty sequence is treated as
/// unassigned; [`merge`] uses that to represent explicit unassignment.
pub type Assignments = BTreeMap<KeyCode, Actions>;

/// Renders an action sequence to its textual form.
pub fn render_actions(actions: &[Action]) -> String {
    actions
        .iter()
        .map(Action::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parses the textual form back into a sequence. Empty items are skipped, so
/// `""` parses to the empty sequence.
pub fn parse_actions(text: &str) -> Result<Actions> {
    let mut actions = Actions::new();
    for item in text.split(',') {
        let item = item.trim();
        if !item.is_empty() {
            actions.push(
                item.parse()
                    .with_context(|| format!("bad actions {text:?}"))?,
            );
        }
    }
    Ok(actions)
}

/// Merges `over` into `base`. For every key in `over`: an empty sequence
/// removes the key from `base`, a non-empty sequence replaces whatever `base`
/// had. Keys absent from `over` are untouched.
pub fn merge(base: &mut Assignments, over: &Assignments) {
    for (key, actions) in over {
        if actions.is_empty() {
            base.remove(key);
        } else {
            base.insert(*key, actions.clone());
        }
    }
}

pub fn actions_activate_layouts(actions: &[Action]) -> bool {
    actions
        .iter()
        .any(|a| matches!(a, Action::ActivateLayout(_)))
}

pub fn actions_emit_keys(actions: &[Action]) -> bool {
    actions.iter().any(|a| matches!(a, Action::EmitKeyTap(_)))
}

pub fn has_layout_activations(assignments: &Assignments) -> bool {
    assignments.values().any(|a| actions_activate_layouts(a))
}

pub fn has_key_emits(assignments: &Assignments) -> bool {
    assignments.values().any(|a| actions_emit_keys(a))
}

/// The set of keys appearing as [`Action::EmitKeyTap`] targets. Emitter
/// backends may need to register every key they could ever emit.
pub fn emitted_keys(assignments: &Assignments) -> KeySet {
    let mut keys = KeySet::new();
    for actions in assignments.values() {
        for action in actions {
            if let Action::EmitKeyTap(key) = action {
                keys.insert(*key);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignments(entries: &[(u16, &[Action])]) -> Assignments {
        entries
            .iter()
            .map(|(code, actions)| (KeyCode(*code), actions.to_vec()))
            .collect()
    }

    #[test]
    fn render_forms() {
        assert_eq!(render_actions(&[]), "");
        assert_eq!(render_actions(&[Action::ActivateLayout(Layout(1))]), "@1");
        assert_eq!(
            render_actions(&[
                Action::EmitKeyTap(KeyCode(1)),
                Action::ActivateLayout(Layout(2)),
            ]),
            "1, @2"
        );
    }

    #[test]
    fn render_parse_round_trip() {
        let sequences: &[&[Action]] = &[
            &[],
            &[Action::ActivateLayout(Layout(1))],
            &[Action::EmitKeyTap(KeyCode(58))],
            &[
                Action::EmitKeyTap(KeyCode(1)),
                Action::ActivateLayout(Layout(2)),
                Action::EmitKeyTap(KeyCode(0x2ff)),
            ],
        ];
        for seq in sequences {
            assert_eq!(&parse_actions(&render_actions(seq)).unwrap(), seq);
        }
    }

    #[test]
    fn parse_names_and_spacing() {
        assert_eq!(
            parse_actions(" capslock , @3 ").unwrap(),
            vec![
                Action::EmitKeyTap(KeyCode(58)),
                Action::ActivateLayout(Layout(3)),
            ]
        );
    }

    #[test]
    fn parse_rejections() {
        assert!(parse_actions("@0").is_err());
        assert!(parse_actions("@x").is_err());
        assert!(parse_actions("@").is_err());
        assert!(parse_actions("99999").is_err());
        assert!(parse_actions("no_such_key").is_err());
    }

    #[test]
    fn merge_replaces() {
        let mut base = assignments(&[(1, &[Action::ActivateLayout(Layout(1))])]);
        let over = assignments(&[(1, &[Action::ActivateLayout(Layout(2))])]);
        merge(&mut base, &over);
        assert_eq!(base[&KeyCode(1)], vec![Action::ActivateLayout(Layout(2))]);
    }

    #[test]
    fn merge_empty_sequence_removes() {
        let mut base = assignments(&[
            (1, &[Action::ActivateLayout(Layout(1))]),
            (2, &[Action::ActivateLayout(Layout(2))]),
        ]);
        let over = assignments(&[(1, &[])]);
        merge(&mut base, &over);
        assert!(!base.contains_key(&KeyCode(1)));
        assert!(base.contains_key(&KeyCode(2)));
    }

    #[test]
    fn merge_with_empty_table_is_identity() {
        let mut base = assignments(&[(1, &[Action::EmitKeyTap(KeyCode(2))])]);
        let expect = base.clone();
        merge(&mut base, &Assignments::new());
        assert_eq!(base, expect);
    }

    #[test]
    fn emitted_keys_collects_targets() {
        let table = assignments(&[
            (
                1,
                &[
                    Action::ActivateLayout(Layout(1)),
                    Action::EmitKeyTap(KeyCode(30)),
                ],
            ),
            (2, &[Action::EmitKeyTap(KeyCode(31))]),
            (3, &[Action::EmitKeyTap(KeyCode(30))]),
        ]);
        let keys: Vec<u16> = emitted_keys(&table).iter().map(|k| k.0).collect();
        assert_eq!(keys, vec![30, 31]);
        assert!(has_key_emits(&table));
        assert!(has_layout_activations(&table));
    }
}
