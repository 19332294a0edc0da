//! Verdicts returned by scanning plugins and the dispositions they resolve to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification of a message by a single plugin or by the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Verdict {
    /// No decision made, continue with the next plugin
    #[default]
    Pass,
    Accept,
    Reject,
    Defer,
    Delete,
}

impl Verdict {
    /// Numeric action code as used on the plugin wire boundary.
    pub fn code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Accept => 1,
            Verdict::Delete => 2,
            Verdict::Reject => 3,
            Verdict::Defer => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Verdict::Pass),
            1 => Some(Verdict::Accept),
            2 => Some(Verdict::Delete),
            3 => Some(Verdict::Reject),
            4 => Some(Verdict::Defer),
            _ => None,
        }
    }

    /// Whether this verdict ends the plugin stage.
    pub fn is_decisive(self) -> bool {
        !matches!(self, Verdict::Pass)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "DUNNO",
            Verdict::Accept => "ACCEPT",
            Verdict::Reject => "REJECT",
            Verdict::Defer => "DEFER",
            Verdict::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown verdict name: {0}")]
pub struct UnknownVerdict(pub String);

impl FromStr for Verdict {
    type Err = UnknownVerdict;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DUNNO" | "PASS" => Ok(Verdict::Pass),
            "ACCEPT" | "OK" => Ok(Verdict::Accept),
            "DELETE" | "DISCARD" => Ok(Verdict::Delete),
            "REJECT" => Ok(Verdict::Reject),
            "DEFER" => Ok(Verdict::Defer),
            _ => Err(UnknownVerdict(s.to_string())),
        }
    }
}

/// Normalized plugin answer: a verdict plus an optional human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginAnswer {
    pub verdict: Verdict,
    pub message: Option<String>,
}

impl PluginAnswer {
    pub fn new(verdict: Verdict, message: Option<String>) -> Self {
        Self { verdict, message }
    }

    pub fn pass() -> Self {
        Self::default()
    }

    /// Build an answer from a raw action code. Codes outside the known set
    /// are a protocol violation by the plugin and degrade to PASS.
    pub fn from_code(code: i32, message: Option<String>) -> Self {
        match Verdict::from_code(code) {
            Some(verdict) => Self { verdict, message },
            None => {
                log::error!("Invalid Message action Code: {code}. Using DUNNO");
                Self::pass()
            }
        }
    }
}

impl From<Verdict> for PluginAnswer {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            message: None,
        }
    }
}

impl From<(Verdict, String)> for PluginAnswer {
    fn from((verdict, message): (Verdict, String)) -> Self {
        Self {
            verdict,
            message: Some(message),
        }
    }
}

impl From<(Verdict, &str)> for PluginAnswer {
    fn from((verdict, message): (Verdict, &str)) -> Self {
        Self {
            verdict,
            message: Some(message.to_string()),
        }
    }
}

impl From<Option<Verdict>> for PluginAnswer {
    fn from(verdict: Option<Verdict>) -> Self {
        verdict.map(PluginAnswer::from).unwrap_or_default()
    }
}

/// Protocol level action the session finalizes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Commit,
    Discard,
    Reject,
    Defer,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Commit => "commit",
            Disposition::Discard => "discard",
            Disposition::Reject => "reject",
            Disposition::Defer => "defer",
        };
        f.write_str(name)
    }
}

/// Final result of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub disposition: Disposition,
    pub message: Option<String>,
    /// Set whenever the sender was asked to retry; appenders are skipped.
    pub deferred: bool,
}

impl SessionOutcome {
    pub fn new(disposition: Disposition, message: Option<String>) -> Self {
        Self {
            deferred: disposition == Disposition::Defer,
            disposition,
            message,
        }
    }
}
