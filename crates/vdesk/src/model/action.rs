//! Wire types for the action agent.
//!
//! One request per line, one result per request:
//!
//! ```text
//! {"action":"click","x":100,"y":50}
//!   -> {"success":true,"action":"click"}
//! {"action":"bogus"}
//!   -> {"success":false,"action":"bogus","error":"Unknown action: bogus"}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound for a `wait` action, in seconds.
pub const MAX_WAIT_SECS: f64 = 10.0;

/// Error text for a frame that is not a JSON object.
pub const INVALID_JSON: &str = "Invalid JSON";

/// A decoded action request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    /// Left click at absolute screen coordinates.
    Click { x: i32, y: i32 },
    /// Type literal text.
    Type { text: String },
    /// Press a named key; the name goes through the synonym table.
    Key { key: String },
    /// Sleep; clamped to `[0, MAX_WAIT_SECS]`.
    Wait {
        #[serde(default = "default_wait_secs")]
        duration: f64,
    },
    /// Capture the full screen.
    Screenshot,
}

fn default_wait_secs() -> f64 {
    1.0
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::Type { .. } => ActionKind::Type,
            Self::Key { .. } => ActionKind::Key,
            Self::Wait { .. } => ActionKind::Wait,
            Self::Screenshot => ActionKind::Screenshot,
        }
    }
}

/// The closed set of action names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    Type,
    Key,
    Wait,
    Screenshot,
}

impl ActionKind {
    pub const ALL: [Self; 5] = [
        Self::Click,
        Self::Type,
        Self::Key,
        Self::Wait,
        Self::Screenshot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Key => "key",
            Self::Wait => "wait",
            Self::Screenshot => "screenshot",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Hard ceiling for one execution of this action.
    pub fn ceiling(self) -> Duration {
        match self {
            Self::Click | Self::Key => Duration::from_secs(2),
            Self::Type => Duration::from_secs(5),
            Self::Wait => Duration::from_secs_f64(MAX_WAIT_SECS),
            Self::Screenshot => Duration::from_secs(3),
        }
    }

    /// Actions that may leave a button or key logically held if cut short.
    pub fn holds_input(self) -> bool {
        matches!(self, Self::Click | Self::Key)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp a requested wait to `[0, MAX_WAIT_SECS]`; non-finite input waits zero.
pub fn clamp_wait(duration: f64) -> Duration {
    if !duration.is_finite() || duration <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(duration.min(MAX_WAIT_SECS))
}

/// Exactly one of these is written per request, in request order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Screenshot location, set only for a successful capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ActionResult {
    pub fn ok(kind: ActionKind) -> Self {
        Self {
            success: true,
            action: kind.as_str().to_string(),
            error: None,
            path: None,
        }
    }

    pub fn captured(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::ok(ActionKind::Screenshot)
        }
    }

    pub fn failure(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action: action.into(),
            error: Some(error.into()),
            path: None,
        }
    }

    pub fn invalid_json() -> Self {
        Self::failure("", INVALID_JSON)
    }

    pub fn unknown_action(tag: &str) -> Self {
        Self::failure(tag, format!("Unknown action: {tag}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_every_wire_shape() {
        let cases = [
            (r#"{"action":"click","x":100,"y":50}"#, ActionRequest::Click { x: 100, y: 50 }),
            (r#"{"action":"type","text":"hi"}"#, ActionRequest::Type { text: "hi".into() }),
            (r#"{"action":"key","key":"enter"}"#, ActionRequest::Key { key: "enter".into() }),
            (r#"{"action":"wait","duration":2.5}"#, ActionRequest::Wait { duration: 2.5 }),
            (r#"{"action":"wait"}"#, ActionRequest::Wait { duration: 1.0 }),
            (r#"{"action":"screenshot"}"#, ActionRequest::Screenshot),
        ];
        for (raw, expected) in cases {
            let decoded: ActionRequest = serde_json::from_str(raw).unwrap();
            assert_eq!(decoded, expected, "{raw}");
        }
    }

    #[test]
    fn wait_is_clamped() {
        assert_eq!(clamp_wait(15.0), Duration::from_secs(10));
        assert_eq!(clamp_wait(-3.0), Duration::ZERO);
        assert_eq!(clamp_wait(f64::NAN), Duration::ZERO);
        assert_eq!(clamp_wait(0.25), Duration::from_millis(250));
    }

    #[test]
    fn results_omit_absent_fields() {
        let json = serde_json::to_string(&ActionResult::ok(ActionKind::Click)).unwrap();
        assert_eq!(json, r#"{"success":true,"action":"click"}"#);
        let json = serde_json::to_string(&ActionResult::unknown_action("fly")).unwrap();
        assert_eq!(json, r#"{"success":false,"action":"fly","error":"Unknown action: fly"}"#);
    }

    #[test]
    fn ceilings_match_action_budget() {
        assert_eq!(ActionKind::Click.ceiling(), Duration::from_secs(2));
        assert_eq!(ActionKind::Type.ceiling(), Duration::from_secs(5));
        assert_eq!(ActionKind::Key.ceiling(), Duration::from_secs(2));
        assert_eq!(ActionKind::Wait.ceiling(), Duration::from_secs(10));
        assert_eq!(ActionKind::Screenshot.ceiling(), Duration::from_secs(3));
    }
}
