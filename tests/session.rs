use scan_milter::address::DefaultChecker;
use scan_milter::session::DEFAULT_DEFER_MESSAGE;
use scan_milter::suspect::{TAG_INCOMING_PORT, TAG_NOAPPENDERS, TAG_SPAM};
use scan_milter::worker::WorkerState;
use scan_milter::{
    AppenderPlugin, ComplianceFailAction, Config, CrashStore, Disposition, PluginAnswer,
    PluginSet, PrependerPlugin, ProtocolHandler, ScannerPlugin, SessionError, SessionHandler,
    StatisticsCollector, Suspect, Verdict,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MESSAGE: &[u8] = b"From: a@example.com\r\nSubject: offer\r\n\r\nbuy now\r\n";

/// Protocol side that records every finalization call.
#[derive(Default)]
struct Recorder {
    envelope: Option<(String, Vec<String>, PathBuf)>,
    get_error: Option<SessionError>,
    port: Option<u16>,
    fail_commit: bool,
    temp: Option<PathBuf>,
    calls: Vec<(String, String)>,
    committed_headers: Vec<(String, String)>,
}

impl Recorder {
    fn with_message(from: &str, to: &str, path: &Path) -> Self {
        Self {
            envelope: Some((from.to_string(), vec![to.to_string()], path.to_path_buf())),
            ..Default::default()
        }
    }

    fn finalizers(&self) -> Vec<&str> {
        self.calls.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl ProtocolHandler for Recorder {
    fn get_suspect(&mut self) -> Result<Option<Suspect>, SessionError> {
        if let Some(e) = self.get_error.take() {
            return Err(e);
        }
        let Some((from, recipients, path)) = self.envelope.take() else {
            return Ok(None);
        };
        match Suspect::new(&from, recipients, &path, &DefaultChecker) {
            Ok(suspect) => Ok(Some(suspect)),
            Err(e) => {
                self.temp = Some(path);
                Err(e)
            }
        }
    }

    fn commit(&mut self, suspect: &Suspect) -> anyhow::Result<()> {
        self.calls.push(("commit".to_string(), String::new()));
        if self.fail_commit {
            anyhow::bail!("connection lost");
        }
        self.committed_headers = suspect.added_headers.clone();
        Ok(())
    }

    fn discard(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(("discard".to_string(), message.to_string()));
        Ok(())
    }

    fn reject(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(("reject".to_string(), message.to_string()));
        Ok(())
    }

    fn defer(&mut self, message: &str) -> anyhow::Result<()> {
        self.calls.push(("defer".to_string(), message.to_string()));
        Ok(())
    }

    fn incoming_port(&self) -> anyhow::Result<Option<u16>> {
        Ok(self.port)
    }

    fn temp_path(&self) -> Option<PathBuf> {
        self.temp.clone()
    }

    fn remove_temp(&mut self) -> anyhow::Result<()> {
        if let Some(path) = self.temp.take() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

struct Fixed {
    name: &'static str,
    answer: PluginAnswer,
    calls: AtomicUsize,
}

impl Fixed {
    fn new(name: &'static str, answer: impl Into<PluginAnswer>) -> Arc<Self> {
        Arc::new(Self {
            name,
            answer: answer.into(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScannerPlugin for Fixed {
    fn section(&self) -> &str {
        self.name
    }

    fn examine(&self, _suspect: &mut Suspect) -> anyhow::Result<PluginAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

/// Scanner that samples the worker status while it runs.
struct StatusWatcher {
    worker: Arc<WorkerState>,
    seen: Mutex<Option<String>>,
}

impl ScannerPlugin for StatusWatcher {
    fn section(&self) -> &str {
        "StatusWatcher"
    }

    fn examine(&self, _suspect: &mut Suspect) -> anyhow::Result<PluginAnswer> {
        *self.seen.lock().unwrap() = Some(self.worker.get());
        Ok(PluginAnswer::pass())
    }
}

struct SpamTagger;

impl ScannerPlugin for SpamTagger {
    fn section(&self) -> &str {
        "SpamTagger"
    }

    fn examine(&self, suspect: &mut Suspect) -> anyhow::Result<PluginAnswer> {
        suspect.set_flag(TAG_SPAM, self.section(), true);
        Ok(PluginAnswer::pass())
    }
}

struct Panicking;

impl ScannerPlugin for Panicking {
    fn section(&self) -> &str {
        "SessionPanicking"
    }

    fn examine(&self, _suspect: &mut Suspect) -> anyhow::Result<PluginAnswer> {
        panic!("scanner crashed mid-message");
    }
}

struct Failing;

impl ScannerPlugin for Failing {
    fn section(&self) -> &str {
        "SessionFailing"
    }

    fn examine(&self, _suspect: &mut Suspect) -> anyhow::Result<PluginAnswer> {
        anyhow::bail!("backend unreachable")
    }
}

/// Prepender that turns off appenders for every message.
struct NoAppenders;

impl PrependerPlugin for NoAppenders {
    fn section(&self) -> &str {
        "NoAppenders"
    }

    fn plugin_list(
        &self,
        suspect: &mut Suspect,
        _plugins: &[Arc<dyn ScannerPlugin>],
    ) -> anyhow::Result<Option<Vec<Arc<dyn ScannerPlugin>>>> {
        suspect.set_tag(TAG_NOAPPENDERS, true);
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct Seen {
    verdict: Verdict,
    decisions: Vec<String>,
    port: Option<serde_json::Value>,
}

#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<Seen>>,
}

impl Recording {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl AppenderPlugin for Recording {
    fn section(&self) -> &str {
        "Recording"
    }

    fn process(&self, suspect: &mut Suspect, decision: Verdict) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen {
            verdict: decision,
            decisions: suspect.decisions.iter().map(|(name, _)| name.clone()).collect(),
            port: suspect.get_tag(TAG_INCOMING_PORT).cloned(),
        });
        Ok(())
    }
}

struct ThrowingAppender;

impl AppenderPlugin for ThrowingAppender {
    fn section(&self) -> &str {
        "ThrowingAppender"
    }

    fn process(&self, _suspect: &mut Suspect, _decision: Verdict) -> anyhow::Result<()> {
        anyhow::bail!("archive database offline")
    }
}

fn spool(dir: &Path) -> PathBuf {
    let path = dir.join("incoming.eml");
    std::fs::write(&path, MESSAGE).unwrap();
    path
}

fn stats() -> &'static StatisticsCollector {
    Box::leak(Box::new(StatisticsCollector::new()))
}

fn handler(
    protocol: Recorder,
    config: Config,
    plugins: PluginSet,
) -> SessionHandler<Recorder> {
    SessionHandler::new(protocol, Arc::new(config), plugins).with_statistics(stats())
}

#[test]
fn test_short_circuit_reject_still_runs_appenders() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let p3 = Fixed::new("P3", Verdict::Accept);
    let appender = Arc::new(Recording::default());
    let plugins = PluginSet::new()
        .with_plugin(Fixed::new("P1", Verdict::Pass))
        .with_plugin(Fixed::new("P2", (Verdict::Reject, "spam")))
        .with_plugin(p3.clone())
        .with_appender(appender.clone());

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        plugins,
    );
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Reject);
    assert_eq!(outcome.message.as_deref(), Some("spam"));
    assert!(!outcome.deferred);
    assert_eq!(
        session.protocol().calls,
        vec![("reject".to_string(), "spam".to_string())]
    );
    assert_eq!(p3.calls(), 0);

    let seen = appender.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].verdict, Verdict::Reject);
    assert_eq!(seen[0].decisions, vec!["P1".to_string(), "P2".to_string()]);
    assert!(!path.exists());
}

#[test]
fn test_defer_skips_appenders() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let appender = Arc::new(Recording::default());
    let plugins = PluginSet::new()
        .with_plugin(Fixed::new("Greylist", (Verdict::Defer, "try again later")))
        .with_appender(appender.clone());

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        plugins,
    );
    let outcome = session.handle_session().unwrap();

    assert!(outcome.deferred);
    assert_eq!(
        session.protocol().calls,
        vec![("defer".to_string(), "try again later".to_string())]
    );
    assert!(appender.seen().is_empty());
    assert!(!path.exists());
}

#[test]
fn test_delete_archives_one_identical_copy() {
    let dir = tempfile::tempdir().unwrap();
    let trash = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let appender = Arc::new(Recording::default());
    let plugins = PluginSet::new()
        .with_plugin(Fixed::new("Killer", Verdict::Delete))
        .with_appender(appender.clone());
    let config = Config {
        trashdir: trash.path().join("deleted").display().to_string(),
        ..Config::default()
    };

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        config,
        plugins,
    );
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Discard);
    assert!(outcome.message.as_deref().unwrap().starts_with("OK: ("));
    assert_eq!(session.protocol().finalizers(), vec!["discard"]);
    assert_eq!(appender.seen()[0].verdict, Verdict::Delete);

    let archived: Vec<PathBuf> = std::fs::read_dir(trash.path().join("deleted"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(archived.len(), 1);
    assert_eq!(std::fs::read(&archived[0]).unwrap(), MESSAGE.to_vec());
    assert!(!path.exists());
}

#[test]
fn test_delete_without_trashdir_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let plugins = PluginSet::new().with_plugin(Fixed::new("Killer", (Verdict::Delete, "gone")));

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        plugins,
    );
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.message.as_deref(), Some("gone"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_crashing_plugins_end_in_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let plugins = PluginSet::new()
        .with_plugin(Arc::new(Panicking))
        .with_plugin(Arc::new(Failing));

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        plugins,
    );
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Commit);
    assert_eq!(session.protocol().finalizers(), vec!["commit"]);

    let reports = CrashStore::reports();
    assert!(reports.iter().any(|r| r.origin == "Plugin SessionPanicking"));
    assert!(reports
        .iter()
        .any(|r| r.origin == "Plugin SessionFailing" && r.message.contains("backend unreachable")));
}

#[test]
fn test_failed_commit_falls_back_to_defer() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let appender = Arc::new(Recording::default());
    let mut protocol = Recorder::with_message("a@example.com", "b@example.com", &path);
    protocol.fail_commit = true;

    let mut session = handler(
        protocol,
        Config::default(),
        PluginSet::new().with_appender(appender.clone()),
    );
    let outcome = session.handle_session().unwrap();

    assert!(outcome.deferred);
    assert_eq!(
        session.protocol().calls,
        vec![
            ("commit".to_string(), String::new()),
            ("defer".to_string(), DEFAULT_DEFER_MESSAGE.to_string()),
        ]
    );
    assert!(appender.seen().is_empty());
    assert!(!path.exists());
}

#[test]
fn test_invalid_recipient_rejected_by_policy() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let scanner = Fixed::new("Scanner", Verdict::Accept);
    let config = Config {
        address_compliance_fail_action: ComplianceFailAction::Reject,
        address_compliance_fail_message: "bad envelope".to_string(),
        ..Config::default()
    };

    let mut session = handler(
        Recorder::with_message("a@example.com", "not a recipient", &path),
        config,
        PluginSet::new().with_plugin(scanner.clone()),
    );
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Reject);
    assert_eq!(
        session.protocol().calls,
        vec![("reject".to_string(), "bad envelope".to_string())]
    );
    assert_eq!(scanner.calls(), 0);
    assert!(!path.exists());
}

#[test]
fn test_unprocessed_spool_kept_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let config = Config {
        remove_tmpfiles_on_error: false,
        ..Config::default()
    };
    let message = config.address_compliance_fail_message.clone();

    let mut session = handler(
        Recorder::with_message("a@example.com", "broken", &path),
        config,
        PluginSet::new(),
    );
    let outcome = session.handle_session().unwrap();

    assert!(outcome.deferred);
    assert_eq!(session.protocol().calls, vec![("defer".to_string(), message)]);
    assert!(path.exists());
}

#[test]
fn test_no_message_is_not_finalized() {
    let mut session = handler(Recorder::default(), Config::default(), PluginSet::new());
    assert!(session.handle_session().is_none());
    assert!(session.protocol().calls.is_empty());
}

#[test]
fn test_protocol_error_defers() {
    let protocol = Recorder {
        get_error: Some(SessionError::Protocol("unexpected EOF".to_string())),
        ..Default::default()
    };
    let mut session = handler(protocol, Config::default(), PluginSet::new());
    let outcome = session.handle_session().unwrap();

    assert!(outcome.deferred);
    assert_eq!(
        session.protocol().calls,
        vec![("defer".to_string(), DEFAULT_DEFER_MESSAGE.to_string())]
    );
}

#[test]
fn test_shared_spool_path_released_once_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());

    for _ in 0..2 {
        let mut session = handler(
            Recorder::with_message("a@example.com", "b@example.com", &path),
            Config::default(),
            PluginSet::new(),
        );
        let outcome = session.handle_session().unwrap();
        assert_eq!(outcome.disposition, Disposition::Commit);
        assert_eq!(session.protocol().finalizers(), vec!["commit"]);
    }
    assert!(!path.exists());
}

#[test]
fn test_throwing_appender_does_not_stop_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let appender = Arc::new(Recording::default());
    let plugins = PluginSet::new()
        .with_appender(Arc::new(ThrowingAppender))
        .with_appender(appender.clone());

    let mut protocol = Recorder::with_message("a@example.com", "b@example.com", &path);
    protocol.port = Some(10025);
    let mut session = handler(protocol, Config::default(), plugins);
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Commit);
    let seen = appender.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].verdict, Verdict::Pass);
    assert_eq!(seen[0].port, Some(serde_json::json!(10025)));
    assert!(CrashStore::reports()
        .iter()
        .any(|r| r.origin == "Appender ThrowingAppender"));
}

#[test]
fn test_noappenders_tag_skips_appenders() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let appender = Arc::new(Recording::default());
    let plugins = PluginSet::new()
        .with_prepender(Arc::new(NoAppenders))
        .with_appender(appender.clone());

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        plugins,
    );
    session.handle_session().unwrap();

    assert!(appender.seen().is_empty());
}

#[test]
fn test_added_headers_follow_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        PluginSet::new(),
    );
    session.handle_session().unwrap();
    let names: Vec<&str> = session
        .protocol()
        .committed_headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec!["X-Scan-Spamstatus", "X-Scan-Suspect"]);
    assert_eq!(session.protocol().committed_headers[0].1, "NO");

    let path = spool(dir.path());
    let config = Config {
        prependaddedheaders: "X-Test-".to_string(),
        debuginfoheader: true,
        suspectidheader: false,
        ..Config::default()
    };
    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        config,
        PluginSet::new().with_plugin(Arc::new(SpamTagger)),
    );
    session.handle_session().unwrap();
    let headers = &session.protocol().committed_headers;
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0], ("X-Test-Spamstatus".to_string(), "YES".to_string()));
    assert_eq!(headers[1].0, "X-Test-Debuginfo");
    assert!(headers[1].1.contains("spam=yes"));
}

#[test]
fn test_reused_handler_finalizes_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.eml");
    let second = dir.path().join("second.eml");
    std::fs::write(&first, MESSAGE).unwrap();
    std::fs::write(&second, MESSAGE).unwrap();
    let scanner = Fixed::new("Rejecter", (Verdict::Reject, "spam"));

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &first),
        Config::default(),
        PluginSet::new().with_plugin(scanner.clone()),
    );
    let outcome = session.handle_session().unwrap();
    assert_eq!(outcome.disposition, Disposition::Reject);

    session.protocol_mut().envelope = Some((
        "c@example.com".to_string(),
        vec!["d@example.com".to_string()],
        second.clone(),
    ));
    let outcome = session.handle_session().unwrap();

    assert_eq!(outcome.disposition, Disposition::Reject);
    assert_eq!(outcome.message.as_deref(), Some("spam"));
    assert_eq!(
        session.protocol().calls,
        vec![
            ("reject".to_string(), "spam".to_string()),
            ("reject".to_string(), "spam".to_string()),
        ]
    );
    assert_eq!(scanner.calls(), 2);
    assert!(!first.exists());
    assert!(!second.exists());
}

#[test]
fn test_worker_state_tracks_session_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = spool(dir.path());
    let worker = Arc::new(WorkerState::new());
    let watcher = Arc::new(StatusWatcher {
        worker: worker.clone(),
        seen: Mutex::new(None),
    });

    let mut session = handler(
        Recorder::with_message("a@example.com", "b@example.com", &path),
        Config::default(),
        PluginSet::new().with_plugin(watcher.clone()),
    )
    .with_worker(worker.clone());
    session.handle_session().unwrap();

    let during = watcher.seen.lock().unwrap().clone().unwrap();
    assert!(during.ends_with(" : Running plugin StatusWatcher"));
    let id = during.trim_end_matches(" : Running plugin StatusWatcher");
    assert_eq!(id.len(), 32);
    assert_eq!(worker.get(), format!("Finishing message {id}"));
}
