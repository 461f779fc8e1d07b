//! Key-name synonyms.
//!
//! Clients send loose names (`enter`, `esc`, `arrow_up`); the input driver
//! wants X keysyms. Names are matched case-insensitively; anything not in the
//! table passes through lower-cased, so `ctrl+c` or `f5` still reach xdotool.

use std::fmt;

const SYNONYMS: &[(&str, &str)] = &[
    ("arrow_up", "Up"),
    ("arrow_down", "Down"),
    ("arrow_left", "Left"),
    ("arrow_right", "Right"),
    ("page_up", "Page_Up"),
    ("page_down", "Page_Down"),
    ("return", "Return"),
    ("enter", "Return"),
    ("esc", "Escape"),
    ("escape", "Escape"),
    ("backspace", "BackSpace"),
    ("delete", "Delete"),
    ("tab", "Tab"),
    ("space", "space"),
    ("home", "Home"),
    ("end", "End"),
];

/// A resolved logical key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    pub fn resolve(name: &str) -> Self {
        let lowered = name.trim().to_lowercase();
        let resolved = SYNONYMS
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map_or(lowered.clone(), |(_, keysym)| (*keysym).to_string());
        Self(resolved)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synonyms_share_a_keysym() {
        assert_eq!(Key::resolve("enter"), Key::resolve("return"));
        assert_eq!(Key::resolve("esc"), Key::resolve("escape"));
        assert_eq!(Key::resolve("enter").as_str(), "Return");
        assert_eq!(Key::resolve("Escape").as_str(), "Escape");
    }

    #[test]
    fn full_table_resolves() {
        let expected = [
            ("arrow_up", "Up"),
            ("arrow_down", "Down"),
            ("arrow_left", "Left"),
            ("arrow_right", "Right"),
            ("page_up", "Page_Up"),
            ("page_down", "Page_Down"),
            ("backspace", "BackSpace"),
            ("delete", "Delete"),
            ("tab", "Tab"),
            ("space", "space"),
            ("home", "Home"),
            ("end", "End"),
        ];
        for (name, keysym) in expected {
            assert_eq!(Key::resolve(name).as_str(), keysym, "{name}");
        }
    }

    #[test]
    fn unmapped_names_pass_through_lowercased() {
        assert_eq!(Key::resolve("F5").as_str(), "f5");
        assert_eq!(Key::resolve("Ctrl+C").as_str(), "ctrl+c");
    }
}
