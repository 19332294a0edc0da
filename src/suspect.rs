//! Per-message state carried through one scan session.

use crate::address::AddressChecker;
use crate::error::SessionError;
use crate::verdict::Verdict;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref TEMPLATE_VAR: Regex = Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").unwrap();
}

pub const TAG_INCOMING_PORT: &str = "incomingport";
pub const TAG_SCANTIME: &str = "scantime";
pub const TAG_NOAPPENDERS: &str = "noappenders";
pub const TAG_DEBUG: &str = "debug";
pub const TAG_SPAM: &str = "spam";
pub const TAG_VIRUS: &str = "virus";
pub const TAG_BLOCKED: &str = "blocked";

/// Temporary file holding the raw message bytes.
///
/// Removal happens at most once. A store that is dropped while still holding
/// its file was not finished cleanly; whether the file is then deleted or
/// kept for inspection depends on `remove_on_drop`.
#[derive(Debug)]
pub struct TempStore {
    path: Option<PathBuf>,
    remove_on_drop: bool,
}

impl TempStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            remove_on_drop: true,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.path.is_none()
    }

    pub fn set_remove_on_drop(&mut self, remove: bool) {
        self.remove_on_drop = remove;
    }

    /// Delete the backing file. Later calls are no-ops; a file that is
    /// already gone only produces a warning.
    pub fn release(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed tempfile {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("Tempfile {} already removed", path.display())
            }
            Err(e) => log::warn!("Could not remove tempfile {}: {e}", path.display()),
        }
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        if self.remove_on_drop {
            self.release();
        } else if let Some(path) = &self.path {
            log::warn!("Keep tempfile {} for failed message", path.display());
        }
    }
}

#[derive(Debug)]
pub struct Suspect {
    pub id: String,
    pub from_address: String,
    pub recipients: Vec<String>,
    store: TempStore,
    pub tags: HashMap<String, Value>,
    /// Headers to insert before the message is committed, in order
    pub added_headers: Vec<(String, String)>,
    /// Elapsed seconds per plugin section
    pub scantimes: Vec<(String, f64)>,
    pub decisions: Vec<(String, Verdict)>,
    debug_log: Vec<String>,
}

impl Suspect {
    /// Build a suspect, validating the envelope with the given checker.
    /// An empty sender (null reverse path) is allowed.
    pub fn new(
        from_address: &str,
        recipients: Vec<String>,
        tempfile: impl Into<PathBuf>,
        checker: &dyn AddressChecker,
    ) -> Result<Self, SessionError> {
        let from_address = strip_brackets(from_address);
        if !from_address.is_empty() && !checker.is_legitimate(&from_address) {
            return Err(SessionError::InvalidAddress(format!(
                "invalid sender address: {from_address}"
            )));
        }
        let recipients: Vec<String> = recipients.iter().map(|r| strip_brackets(r)).collect();
        if recipients.is_empty() {
            return Err(SessionError::InvalidAddress("no recipients".to_string()));
        }
        if let Some(bad) = recipients.iter().find(|r| !checker.is_legitimate(r)) {
            return Err(SessionError::InvalidAddress(format!(
                "invalid recipient address: {bad}"
            )));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from_address,
            recipients,
            store: TempStore::new(tempfile),
            tags: HashMap::new(),
            added_headers: Vec::new(),
            scantimes: Vec::new(),
            decisions: Vec::new(),
            debug_log: Vec::new(),
        })
    }

    /// The recipient single-recipient plugins see.
    pub fn to_address(&self) -> &str {
        self.recipients.first().map(String::as_str).unwrap_or("")
    }

    pub fn tempfile(&self) -> Option<&Path> {
        self.store.path()
    }

    pub fn store_mut(&mut self) -> &mut TempStore {
        &mut self.store
    }

    pub fn release_tempfile(&mut self) {
        self.store.release();
    }

    pub fn size(&self) -> u64 {
        self.tempfile()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Raw message bytes.
    pub fn source(&self) -> Result<Vec<u8>, SessionError> {
        let path = self
            .tempfile()
            .ok_or_else(|| SessionError::Internal(format!("suspect {} already released", self.id)))?;
        std::fs::read(path).map_err(|source| SessionError::TempFile {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn set_tag(&mut self, key: &str, value: impl Into<Value>) {
        self.tags.insert(key.to_string(), value.into());
    }

    pub fn get_tag(&self, key: &str) -> Option<&Value> {
        self.tags.get(key)
    }

    pub fn tag_is_true(&self, key: &str) -> bool {
        matches!(self.tags.get(key), Some(Value::Bool(true)))
    }

    /// Mark a flag map tag (`spam`, `virus`, `blocked`) for one plugin.
    pub fn set_flag(&mut self, tag: &str, plugin: &str, value: bool) {
        let entry = self
            .tags
            .entry(tag.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        if let Value::Object(map) = entry {
            map.insert(plugin.to_string(), Value::Bool(value));
        }
    }

    fn any_flag(&self, tag: &str) -> bool {
        match self.tags.get(tag) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Object(map)) => map.values().any(|v| v.as_bool() == Some(true)),
            _ => false,
        }
    }

    pub fn is_spam(&self) -> bool {
        self.any_flag(TAG_SPAM)
    }

    pub fn is_virus(&self) -> bool {
        self.any_flag(TAG_VIRUS)
    }

    pub fn is_blocked(&self) -> bool {
        self.any_flag(TAG_BLOCKED)
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.added_headers.push((name.into(), value.into()));
    }

    /// Append to the per-message trace when the `debug` tag is set.
    pub fn debug(&mut self, message: impl fmt::Display) {
        if self.tag_is_true(TAG_DEBUG) {
            self.debug_log.push(message.to_string());
        }
    }

    pub fn debug_log(&self) -> &[String] {
        &self.debug_log
    }

    /// Fill `${name}` placeholders from suspect fields and scalar tags.
    pub fn log_format(&self, template: &str) -> String {
        TEMPLATE_VAR
            .replace_all(template, |caps: &Captures| self.template_value(&caps[1]))
            .into_owned()
    }

    fn template_value(&self, name: &str) -> String {
        match name {
            "id" => self.id.clone(),
            "from_address" => self.from_address.clone(),
            "to_address" => self.to_address().to_string(),
            "recipients" => self.recipients.join(","),
            "size" => self.size().to_string(),
            "spam" => yes_no(self.is_spam()),
            "virus" => yes_no(self.is_virus()),
            "blocked" => yes_no(self.is_blocked()),
            "decisions" => self
                .decisions
                .iter()
                .map(|(plugin, verdict)| format!("{plugin}:{verdict}"))
                .collect::<Vec<_>>()
                .join(","),
            other => match self.tags.get(other) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => String::new(),
            },
        }
    }
}

impl fmt::Display for Suspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Suspect {}: from={} to={} size={} spam={} virus={} blocked={} tags={}",
            self.id,
            self.from_address,
            self.to_address(),
            self.size(),
            yes_no(self.is_spam()),
            yes_no(self.is_virus()),
            yes_no(self.is_blocked()),
            serde_json::to_string(&self.tags).unwrap_or_default(),
        )
    }
}

fn yes_no(value: bool) -> String {
    let word = if value { "yes" } else { "no" };
    word.to_string()
}

fn strip_brackets(address: &str) -> String {
    address.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}
