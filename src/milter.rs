use crate::address;
use crate::config::Config;
use crate::error::SessionError;
use crate::plugin::PluginSet;
use crate::protocol::ProtocolHandler;
use crate::session::SessionHandler;
use crate::suspect::Suspect;
use crate::worker::WorkerState;
use indymilter::{
    run, Actions, Callbacks, Config as IndyConfig, ContextActions, SetErrorReply, Status,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;

/// Envelope and content collected for one SMTP transaction.
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    pub sender: String,
    pub recipients: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Transaction {
    /// Reassemble the message as header lines, a blank line and the body.
    pub fn raw_message(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.body.len() + 64 * self.headers.len());
        for (name, value) in &self.headers {
            raw.extend_from_slice(name.as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        raw
    }
}

/// How the session asked the MTA to finish the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Commit { headers: Vec<(String, String)> },
    Discard(String),
    Reject(String),
    Defer(String),
}

impl Finalization {
    pub fn status(&self) -> Status {
        match self {
            Finalization::Commit { .. } => Status::Accept,
            Finalization::Discard(_) => Status::Discard,
            Finalization::Reject(_) => Status::Reject,
            Finalization::Defer(_) => Status::Tempfail,
        }
    }

    /// SMTP reply code, enhanced status code and single line text sent
    /// along with a reject or tempfail. Commit and discard send no text.
    pub fn smtp_reply(&self) -> Option<(&'static str, &'static str, String)> {
        let (rcode, xcode, message) = match self {
            Finalization::Reject(message) => ("550", "5.7.1", message),
            Finalization::Defer(message) => ("451", "4.7.1", message),
            Finalization::Commit { .. } | Finalization::Discard(_) => return None,
        };
        let mut text: String = message
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        while text.len() > MAX_REPLY_TEXT {
            text.pop();
        }
        Some((rcode, xcode, text))
    }
}

/// milter protocol limit for one reply line, in bytes
const MAX_REPLY_TEXT: usize = 980;

/// [`ProtocolHandler`] backed by a finished milter transaction. Finalization
/// is recorded and replayed to the MTA once the session returns.
pub struct MilterProtocol {
    transaction: Option<Transaction>,
    spool_dir: PathBuf,
    temp_path: Option<PathBuf>,
    incoming_port: Option<u16>,
    finalization: Option<Finalization>,
}

impl MilterProtocol {
    pub fn new(transaction: Option<Transaction>, spool_dir: PathBuf, incoming_port: Option<u16>) -> Self {
        Self {
            transaction,
            spool_dir,
            temp_path: None,
            incoming_port,
            finalization: None,
        }
    }

    pub fn finalization(&self) -> Option<&Finalization> {
        self.finalization.as_ref()
    }

    pub fn into_finalization(self) -> Option<Finalization> {
        self.finalization
    }

    fn spool(&mut self, raw: &[u8]) -> Result<PathBuf, SessionError> {
        let io_err = |source| SessionError::TempFile {
            path: self.spool_dir.clone(),
            source,
        };
        let mut file = tempfile::Builder::new()
            .prefix("scan-")
            .suffix(".eml")
            .tempfile_in(&self.spool_dir)
            .map_err(io_err)?;
        file.write_all(raw).map_err(io_err)?;
        let (_, path) = file.keep().map_err(|e| io_err(e.error))?;
        Ok(path)
    }

    fn finalize(&mut self, finalization: Finalization) -> anyhow::Result<()> {
        if let Some(previous) = &self.finalization {
            anyhow::bail!("session already finalized as {previous:?}");
        }
        self.finalization = Some(finalization);
        Ok(())
    }
}

impl ProtocolHandler for MilterProtocol {
    fn get_suspect(&mut self) -> Result<Option<Suspect>, SessionError> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(None);
        };
        let path = self.spool(&transaction.raw_message())?;
        self.temp_path = Some(path.clone());

        let checker = address::active_checker();
        let suspect = Suspect::new(
            &transaction.sender,
            transaction.recipients,
            path,
            checker.as_ref(),
        )?;
        // the suspect owns the spool file from here on
        self.temp_path = None;
        Ok(Some(suspect))
    }

    fn commit(&mut self, suspect: &Suspect) -> anyhow::Result<()> {
        self.finalize(Finalization::Commit {
            headers: suspect.added_headers.clone(),
        })
    }

    fn discard(&mut self, message: &str) -> anyhow::Result<()> {
        self.finalize(Finalization::Discard(message.to_string()))
    }

    fn reject(&mut self, message: &str) -> anyhow::Result<()> {
        self.finalize(Finalization::Reject(message.to_string()))
    }

    fn defer(&mut self, message: &str) -> anyhow::Result<()> {
        self.finalize(Finalization::Defer(message.to_string()))
    }

    fn incoming_port(&self) -> anyhow::Result<Option<u16>> {
        Ok(self.incoming_port)
    }

    fn temp_path(&self) -> Option<PathBuf> {
        self.temp_path.clone()
    }

    fn remove_temp(&mut self) -> anyhow::Result<()> {
        if let Some(path) = self.temp_path.take() {
            std::fs::remove_file(&path)?;
            log::debug!("Removed tmpfile {}", path.display());
        }
        Ok(())
    }
}

pub struct Milter {
    config: Arc<Config>,
    plugins: PluginSet,
    worker: Arc<WorkerState>,
}

impl Milter {
    pub fn new(config: Config, plugins: PluginSet) -> Self {
        Milter {
            config: Arc::new(config),
            plugins,
            worker: Arc::new(WorkerState::new()),
        }
    }

    /// Activity of the most recently updated session.
    pub fn worker_state(&self) -> Arc<WorkerState> {
        self.worker.clone()
    }

    fn spool_dir(&self) -> PathBuf {
        self.config
            .tempdir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub async fn run(&self, socket_path: &str) -> anyhow::Result<()> {
        log::info!("Starting milter on: {}", socket_path);
        // Remove existing socket if it exists
        if std::path::Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }

        let spool_dir = self.spool_dir();
        std::fs::create_dir_all(&spool_dir)?;
        let listener = UnixListener::bind(socket_path)?;

        let callbacks: Callbacks<Transaction> = Callbacks {
            mail: Some(Box::new(move |ctx: &mut indymilter::Context<Transaction>, sender| {
                Box::pin(async move {
                    let sender_str = sender
                        .first()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    log::debug!("Mail from: {}", sender_str);
                    ctx.data = Some(Transaction {
                        sender: sender_str,
                        ..Default::default()
                    });
                    Status::Continue
                })
            })),

            rcpt: Some(Box::new(move |ctx: &mut indymilter::Context<Transaction>, recipient| {
                Box::pin(async move {
                    let recipient_str = recipient
                        .first()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    log::debug!("Rcpt to: {}", recipient_str);
                    if let Some(transaction) = ctx.data.as_mut() {
                        transaction.recipients.push(recipient_str);
                    }
                    Status::Continue
                })
            })),

            header: Some(Box::new(
                move |ctx: &mut indymilter::Context<Transaction>, name, value| {
                    Box::pin(async move {
                        if let Some(transaction) = ctx.data.as_mut() {
                            transaction.headers.push((
                                name.to_string_lossy().to_string(),
                                value.to_string_lossy().to_string(),
                            ));
                        }
                        Status::Continue
                    })
                },
            )),

            body: Some(Box::new(move |ctx: &mut indymilter::Context<Transaction>, body_chunk| {
                Box::pin(async move {
                    if let Some(transaction) = ctx.data.as_mut() {
                        transaction.body.extend_from_slice(&body_chunk);
                    }
                    Status::Continue
                })
            })),

            eom: Some(Box::new({
                let config = self.config.clone();
                let plugins = self.plugins.clone();
                let worker = self.worker.clone();
                move |ctx: &mut indymilter::EomContext<Transaction>| {
                    let config = config.clone();
                    let plugins = plugins.clone();
                    let worker = worker.clone();
                    let spool_dir = spool_dir.clone();
                    Box::pin(async move {
                        log::info!("End of message - scanning");

                        let transaction = ctx.data.take();
                        let incoming_port = ctx
                            .macros
                            .get(c"{daemon_port}")
                            .and_then(|port| port.to_str().ok())
                            .and_then(|port| port.parse::<u16>().ok());

                        let protocol = MilterProtocol::new(transaction, spool_dir, incoming_port);
                        let result = tokio::task::spawn_blocking(move || {
                            let mut handler =
                                SessionHandler::new(protocol, config, plugins).with_worker(worker);
                            handler.handle_session();
                            handler.into_protocol().into_finalization()
                        })
                        .await;

                        let finalization = match result {
                            Ok(Some(finalization)) => finalization,
                            Ok(None) => {
                                log::error!("Session ended without a decision, deferring");
                                return Status::Tempfail;
                            }
                            Err(e) => {
                                log::error!("Scan session aborted: {e}");
                                return Status::Tempfail;
                            }
                        };

                        match &finalization {
                            Finalization::Commit { headers } => {
                                for (name, value) in headers {
                                    if let Err(e) =
                                        ctx.actions.add_header(name.clone(), value.clone()).await
                                    {
                                        log::error!("Failed to add header {name}: {e}");
                                    }
                                }
                                log::info!("Accepting message");
                            }
                            Finalization::Discard(message) => {
                                log::info!("Discarding message: {message}");
                            }
                            Finalization::Reject(message) => {
                                log::info!("Rejecting message: {message}");
                            }
                            Finalization::Defer(message) => {
                                log::info!("Deferring message: {message}");
                            }
                        }
                        if let Some((rcode, xcode, text)) = finalization.smtp_reply() {
                            if let Err(e) = ctx.reply.set_error_reply(rcode, Some(xcode), [text]) {
                                log::warn!("Could not set SMTP reply: {e}");
                            }
                        }
                        finalization.status()
                    })
                }
            })),

            abort: Some(Box::new(move |ctx: &mut indymilter::Context<Transaction>| {
                Box::pin(async move {
                    ctx.data = None;
                    Status::Continue
                })
            })),

            ..Default::default()
        };

        let config = IndyConfig {
            actions: Actions::ADD_HEADER,
            ..Default::default()
        };

        run(listener, callbacks, config, tokio::signal::ctrl_c()).await?;
        Ok(())
    }
}
