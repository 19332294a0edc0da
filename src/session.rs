//! One scan cycle per protocol session.
//!
//! The handler obtains the message, runs prependers, scanners and appenders,
//! and finalizes the protocol session exactly once. Internal failures end in
//! a DEFER so that a message is never lost; the spool file is released on
//! every exit path.

use crate::address;
use crate::config::{ComplianceFailAction, Config};
use crate::error::SessionError;
use crate::plugin::PluginSet;
use crate::protocol::ProtocolHandler;
use crate::stages::{self, guarded, panic_message, ScanDecision};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::suspect::{Suspect, TAG_INCOMING_PORT, TAG_SCANTIME};
use crate::trash::TrashArchiver;
use crate::verdict::{Disposition, SessionOutcome, Verdict};
use crate::worker::WorkerState;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_REJECT_MESSAGE: &str = "Rejected by content scanner";
pub const DEFAULT_DEFER_MESSAGE: &str = "internal problem - message deferred";
pub const DEFAULT_REJECT_FALLBACK: &str = "internal problem - reject";
pub const DEFAULT_DISCARD_FALLBACK: &str = "internal problem - discard";

/// Protocol calls that end a session without committing.
#[derive(Debug, Clone, Copy)]
enum Finish {
    Discard,
    Reject,
    Defer,
}

impl Finish {
    fn disposition(self) -> Disposition {
        match self {
            Finish::Discard => Disposition::Discard,
            Finish::Reject => Disposition::Reject,
            Finish::Defer => Disposition::Defer,
        }
    }
}

pub struct SessionHandler<P: ProtocolHandler> {
    protocol: P,
    config: Arc<Config>,
    plugins: PluginSet,
    trash: TrashArchiver,
    stats: &'static StatisticsCollector,
    worker: Option<Arc<WorkerState>>,
    outcome: Option<SessionOutcome>,
}

impl<P: ProtocolHandler> SessionHandler<P> {
    pub fn new(protocol: P, config: Arc<Config>, plugins: PluginSet) -> Self {
        let trash = TrashArchiver::from_config(&config);
        Self {
            protocol,
            config,
            plugins,
            trash,
            stats: StatisticsCollector::global(),
            worker: None,
            outcome: None,
        }
    }

    pub fn with_worker(mut self, worker: Arc<WorkerState>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_statistics(mut self, stats: &'static StatisticsCollector) -> Self {
        self.stats = stats;
        self
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn into_protocol(self) -> P {
        self.protocol
    }

    /// Run one full scan cycle.
    ///
    /// Returns `None` when the protocol side produced no message. Otherwise
    /// the session has been finalized exactly once by the time this returns.
    pub fn handle_session(&mut self) -> Option<SessionOutcome> {
        self.outcome = None;
        address::configure_checker(&self.config.address_compliance_checker);

        let mut suspect_seen = false;
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(&mut suspect_seen)));

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(SessionError::InvalidAddress(reason))) => {
                log::warn!("Address compliance check failed: {reason}");
                Some(self.compliance_fail())
            }
            Ok(Err(e)) => {
                log::error!("Session failed: {e}");
                Some(self.finish_quietly(Finish::Defer, None))
            }
            Err(payload) => {
                log::error!("Session panicked: {}", panic_message(&*payload));
                Some(self.finish_quietly(Finish::Defer, None))
            }
        };

        if !suspect_seen {
            self.cleanup_unprocessed_temp();
        }

        log::debug!("Session finished");
        outcome
    }

    fn process(&mut self, suspect_seen: &mut bool) -> Result<Option<SessionOutcome>, SessionError> {
        self.set_state("receiving message".to_string());
        let Some(mut suspect) = self.protocol.get_suspect()? else {
            log::error!("No Suspect retrieved, ending session");
            return Ok(None);
        };
        *suspect_seen = true;
        suspect
            .store_mut()
            .set_remove_on_drop(self.config.remove_tmpfiles_on_error);

        self.stats.record_event(StatEvent::MessageIn);

        if suspect.recipients.len() != 1 {
            log::warn!(
                "Notice: Message from {} has {} recipients. Plugins supporting only one recipient will see: {}",
                suspect.from_address,
                suspect.recipients.len(),
                suspect.to_address()
            );
        }
        log::debug!(
            "Message from {} to {}: {} bytes stored to {}",
            suspect.from_address,
            suspect.to_address(),
            suspect.size(),
            suspect
                .tempfile()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        self.set_state(format!("Handling message {}", suspect.id));

        self.tag_incoming_port(&mut suspect);

        let worker = self.worker.clone();
        let worklist = stages::run_prependers(
            &self.plugins.prependers,
            &self.plugins.plugins,
            &mut suspect,
            worker.as_deref(),
        );

        let start = Instant::now();
        let decision = stages::run_plugins(&worklist, &mut suspect, &self.trash, worker.as_deref());
        let scantime = start.elapsed();
        log::debug!(
            "{}: decision {} (code {}) by {}",
            suspect.id,
            decision.verdict,
            decision.verdict.code(),
            decision.decided_by.as_deref().unwrap_or("default")
        );

        self.augment_headers(&mut suspect, scantime);

        let template = self.config.logtemplate.trim();
        if !template.is_empty() {
            log::info!("{}", suspect.log_format(template));
        }
        suspect.debug(format!("{suspect}"));

        self.set_state(format!("Finishing message {}", suspect.id));
        let outcome = self.resolve(&suspect, &decision);

        if outcome.deferred {
            log::warn!("DEFERRED {}", suspect.id);
        } else {
            self.stats.record_event(StatEvent::Decision {
                verdict: decision.verdict,
                spam: suspect.is_spam(),
                virus: suspect.is_virus(),
                blocked: suspect.is_blocked(),
            });
            stages::run_appenders(
                &self.plugins.appenders,
                &mut suspect,
                decision.verdict,
                worker.as_deref(),
            );
        }

        suspect.release_tempfile();
        Ok(Some(outcome))
    }

    fn tag_incoming_port(&mut self, suspect: &mut Suspect) {
        let protocol = &self.protocol;
        match guarded(|| protocol.incoming_port()) {
            Ok(Some(port)) => suspect.set_tag(TAG_INCOMING_PORT, port),
            Ok(None) => {}
            Err(e) => log::warn!("Could not get incoming port: {e}"),
        }
    }

    /// Optional informational headers. They never influence the verdict.
    fn augment_headers(&self, suspect: &mut Suspect, scantime: Duration) {
        let prefix = &self.config.prependaddedheaders;

        if self.config.spamstatusheader {
            let status = if suspect.is_spam() { "YES" } else { "NO" };
            suspect.add_header(format!("{prefix}Spamstatus"), status);
        }

        suspect.set_tag(TAG_SCANTIME, format!("{:.4}", scantime.as_secs_f64()));

        if self.config.debuginfoheader {
            let debuginfo = suspect.to_string();
            suspect.add_header(format!("{prefix}Debuginfo"), debuginfo);
        }

        if self.config.suspectidheader {
            let id = suspect.id.clone();
            suspect.add_header(format!("{prefix}Suspect"), id);
        }
    }

    /// Map the scanner decision to a protocol action.
    fn resolve(&mut self, suspect: &Suspect, decision: &ScanDecision) -> SessionOutcome {
        match decision.verdict {
            Verdict::Accept | Verdict::Pass => {
                let protocol = &mut self.protocol;
                match guarded(|| protocol.commit(suspect)) {
                    Ok(()) => {
                        self.stats.record_event(StatEvent::MessageOut);
                        let outcome = SessionOutcome::new(Disposition::Commit, None);
                        self.outcome = Some(outcome.clone());
                        outcome
                    }
                    Err(e) => {
                        log::error!("Could not commit message. Error: {e:?}");
                        self.finish_quietly(Finish::Defer, None)
                    }
                }
            }
            Verdict::Delete => {
                log::info!("MESSAGE DELETED: {}", suspect.id);
                let message = decision
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("OK: ({})", suspect.id));
                self.finish_quietly(Finish::Discard, Some(message))
            }
            Verdict::Reject => {
                let message = decision
                    .message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string());
                self.finish_quietly(Finish::Reject, Some(message))
            }
            Verdict::Defer => self.finish_quietly(Finish::Defer, decision.message.clone()),
        }
    }

    /// Finalize for an envelope that failed address validation.
    fn compliance_fail(&mut self) -> SessionOutcome {
        let message = Some(self.config.address_compliance_fail_message.clone());
        match self.config.address_compliance_fail_action {
            ComplianceFailAction::Defer => self.finish_quietly(Finish::Defer, message),
            ComplianceFailAction::Reject => self.finish_quietly(Finish::Reject, message),
            ComplianceFailAction::Discard => self.finish_quietly(Finish::Discard, message),
        }
    }

    /// End the session without committing. Adapter failures are swallowed,
    /// the connection may already be broken. A session that is already
    /// finalized keeps its first outcome.
    fn finish_quietly(&mut self, finish: Finish, message: Option<String>) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            log::warn!(
                "Session already finalized with {}, ignoring {:?}",
                outcome.disposition,
                finish
            );
            return outcome.clone();
        }

        let text = message.unwrap_or_else(|| {
            match finish {
                Finish::Discard => DEFAULT_DISCARD_FALLBACK,
                Finish::Reject => DEFAULT_REJECT_FALLBACK,
                Finish::Defer => DEFAULT_DEFER_MESSAGE,
            }
            .to_string()
        });

        let protocol = &mut self.protocol;
        let result = guarded(|| match finish {
            Finish::Discard => protocol.discard(&text),
            Finish::Reject => protocol.reject(&text),
            Finish::Defer => protocol.defer(&text),
        });
        if let Err(e) = result {
            log::warn!("Could not {} message: {e}", finish.disposition());
        }

        let outcome = SessionOutcome::new(finish.disposition(), Some(text));
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// The message never became a suspect; its spool file is still owned by
    /// the protocol side.
    fn cleanup_unprocessed_temp(&mut self) {
        let Some(path) = self.protocol.temp_path() else {
            return;
        };
        if self.config.remove_tmpfiles_on_error {
            log::debug!("Remove tmpfile: {} for failed message", path.display());
            let protocol = &mut self.protocol;
            if let Err(e) = guarded(|| protocol.remove_temp()) {
                log::warn!("Could not remove tmpfile {}: {e}", path.display());
            }
        } else {
            log::warn!("Keep tmpfile: {} for failed message", path.display());
        }
    }

    fn set_state(&self, status: String) {
        if let Some(worker) = &self.worker {
            worker.set(status);
        }
    }
}
