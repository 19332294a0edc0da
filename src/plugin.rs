//! Plugin capabilities the session drives.
//!
//! Plugins are shared between sessions and never mutated by the session;
//! any internal configuration they hold is their own business. A plugin is
//! identified by its `section` name in logs, timing and decision records.

use crate::suspect::Suspect;
use crate::verdict::{PluginAnswer, Verdict};
use std::sync::Arc;

/// Scans a message and returns a verdict.
pub trait ScannerPlugin: Send + Sync {
    fn section(&self) -> &str;

    fn examine(&self, suspect: &mut Suspect) -> anyhow::Result<PluginAnswer>;
}

/// Adjusts the scanner worklist for one message before scanning starts.
pub trait PrependerPlugin: Send + Sync {
    fn section(&self) -> &str;

    /// Return `None` to leave the worklist unchanged.
    fn plugin_list(
        &self,
        suspect: &mut Suspect,
        plugins: &[Arc<dyn ScannerPlugin>],
    ) -> anyhow::Result<Option<Vec<Arc<dyn ScannerPlugin>>>>;
}

/// Runs after the final decision, for side effects only.
pub trait AppenderPlugin: Send + Sync {
    fn section(&self) -> &str;

    fn process(&self, suspect: &mut Suspect, decision: Verdict) -> anyhow::Result<()>;
}

/// The configured plugins, in configured order.
#[derive(Clone, Default)]
pub struct PluginSet {
    pub prependers: Vec<Arc<dyn PrependerPlugin>>,
    pub plugins: Vec<Arc<dyn ScannerPlugin>>,
    pub appenders: Vec<Arc<dyn AppenderPlugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prepender(mut self, prepender: Arc<dyn PrependerPlugin>) -> Self {
        self.prependers.push(prepender);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn ScannerPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_appender(mut self, appender: Arc<dyn AppenderPlugin>) -> Self {
        self.appenders.push(appender);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prependers.is_empty() && self.plugins.is_empty() && self.appenders.is_empty()
    }
}

pub(crate) fn section_names(plugins: &[Arc<dyn ScannerPlugin>]) -> Vec<String> {
    plugins.iter().map(|p| p.section().to_string()).collect()
}
