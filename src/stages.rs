//! Prepender, scanner and appender stage execution.
//!
//! Every plugin call is contained: an error or a panic is reported to the
//! [`CrashStore`], logged, and the stage moves on to the next plugin.

use crate::crash_store::CrashStore;
use crate::plugin::{section_names, AppenderPlugin, PrependerPlugin, ScannerPlugin};
use crate::suspect::{Suspect, TAG_NOAPPENDERS};
use crate::trash::TrashArchiver;
use crate::verdict::Verdict;
use crate::worker::WorkerState;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Outcome of the scanner stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanDecision {
    pub verdict: Verdict,
    pub message: Option<String>,
    /// Section of the plugin that made the decision
    pub decided_by: Option<String>,
}

/// Run `f`, turning a panic into an error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn report_failure(kind: &str, section: &str, error: &anyhow::Error) {
    CrashStore::store(&format!("{kind} {section}"), &format!("{error:#}"));
    log::error!("{kind} {section} failed: {error:?}");
}

fn set_state(worker: Option<&WorkerState>, status: impl FnOnce() -> String) {
    if let Some(worker) = worker {
        worker.set(status());
    }
}

/// Build the worklist for this message by letting each prepender adjust it.
pub fn run_prependers(
    prependers: &[Arc<dyn PrependerPlugin>],
    plugins: &[Arc<dyn ScannerPlugin>],
    suspect: &mut Suspect,
    worker: Option<&WorkerState>,
) -> Vec<Arc<dyn ScannerPlugin>> {
    let mut worklist = plugins.to_vec();

    for prepender in prependers {
        let section = prepender.section().to_string();
        log::debug!("Running prepender {section}");
        set_state(worker, || format!("{} : Running prepender {section}", suspect.id));

        let start = Instant::now();
        let result = guarded(|| prepender.plugin_list(suspect, &worklist));
        suspect
            .scantimes
            .push((section.clone(), start.elapsed().as_secs_f64()));

        match result {
            Ok(Some(adjusted)) => {
                log_worklist_diff(&section, &worklist, &adjusted);
                worklist = adjusted;
            }
            Ok(None) => {}
            Err(e) => report_failure("Prepender", &section, &e),
        }
    }

    worklist
}

fn log_worklist_diff(
    section: &str,
    before: &[Arc<dyn ScannerPlugin>],
    after: &[Arc<dyn ScannerPlugin>],
) {
    let before: HashSet<String> = section_names(before).into_iter().collect();
    let after: HashSet<String> = section_names(after).into_iter().collect();

    let removed: Vec<&String> = before.difference(&after).collect();
    if !removed.is_empty() {
        log::debug!("Prepender {section} removed plugins: {removed:?}");
    }
    let added: Vec<&String> = after.difference(&before).collect();
    if !added.is_empty() {
        log::debug!("Prepender {section} added plugins: {added:?}");
    }
}

/// Scan with each plugin in order until one makes a decision.
pub fn run_plugins(
    worklist: &[Arc<dyn ScannerPlugin>],
    suspect: &mut Suspect,
    trash: &TrashArchiver,
    worker: Option<&WorkerState>,
) -> ScanDecision {
    suspect.debug(format!("Will run plugins: {:?}", section_names(worklist)));

    for plugin in worklist {
        let section = plugin.section().to_string();
        log::debug!("Running plugin {section}");
        set_state(worker, || format!("{} : Running plugin {section}", suspect.id));
        suspect.debug(format!("Running plugin {section}"));

        let start = Instant::now();
        let result = guarded(|| plugin.examine(suspect));
        suspect
            .scantimes
            .push((section.clone(), start.elapsed().as_secs_f64()));

        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                report_failure("Plugin", &section, &e);
                suspect.debug(format!(
                    "Plugin failed : {e} . Please check the log for more details"
                ));
                continue;
            }
        };

        suspect.decisions.push((section.clone(), answer.verdict));

        if !answer.verdict.is_decisive() {
            suspect.debug("Plugin makes no final decision");
            continue;
        }

        log::debug!(
            "Plugin {section} says: {}. Skipping all other tests",
            answer.verdict
        );
        suspect.debug(format!(
            "Plugin {section} decides {} - no further tests",
            answer.verdict
        ));

        if answer.verdict == Verdict::Delete {
            trash.archive(suspect, &section);
        }

        return ScanDecision {
            verdict: answer.verdict,
            message: answer.message,
            decided_by: Some(section),
        };
    }

    ScanDecision::default()
}

/// Post decision processing. Skipped entirely when the suspect carries the
/// `noappenders` tag.
pub fn run_appenders(
    appenders: &[Arc<dyn AppenderPlugin>],
    suspect: &mut Suspect,
    decision: Verdict,
    worker: Option<&WorkerState>,
) {
    if suspect.tag_is_true(TAG_NOAPPENDERS) {
        log::debug!("Appenders disabled for {}", suspect.id);
        return;
    }

    for appender in appenders {
        let section = appender.section().to_string();
        log::debug!("Running appender {section}");
        suspect.debug(format!("Running appender {section}"));
        set_state(worker, || format!("{} : Running appender {section}", suspect.id));

        let start = Instant::now();
        let result = guarded(|| appender.process(suspect, decision));
        suspect
            .scantimes
            .push((section.clone(), start.elapsed().as_secs_f64()));

        if let Err(e) = result {
            report_failure("Appender", &section, &e);
        }
    }
}
