use crate::config::Config;
use crate::suspect::Suspect;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TRASH_LOG_NAME: &str = "00-scantrash.log";

/// Keeps copies of deleted messages. Every failure is logged and swallowed;
/// archiving never changes what happens to the message.
#[derive(Debug, Clone)]
pub struct TrashArchiver {
    dir: Option<PathBuf>,
    log_enabled: bool,
}

impl TrashArchiver {
    pub fn new(dir: Option<PathBuf>, log_enabled: bool) -> Self {
        Self { dir, log_enabled }
    }

    pub fn from_config(config: &Config) -> Self {
        let dir = config
            .trash_enabled()
            .then(|| PathBuf::from(config.trashdir.trim()));
        Self::new(dir, config.trashlog)
    }

    /// Copy the suspect's raw message into the trash directory.
    /// Returns the archive path when a copy was written.
    pub fn archive(&self, suspect: &Suspect, killer_plugin: &str) -> Option<PathBuf> {
        let dir = self.dir.as_deref()?;

        if !dir.is_dir() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::error!(
                    "Trashdir {} does not exist and could not be created: {e}",
                    dir.display()
                );
                return None;
            }
            log::info!("Created trashdir {}", dir.display());
        }

        let archived = match Self::write_copy(dir, suspect) {
            Ok(path) => {
                log::debug!("Message stored to trash: {}", path.display());
                Some(path)
            }
            Err(e) => {
                log::error!("Could not store {} to trash: {e:#}", suspect.id);
                None
            }
        };

        if self.log_enabled {
            let filename = archived
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            if let Err(e) = Self::append_log(dir, suspect, killer_plugin, &filename) {
                log::error!("Could not update trash log: {e}");
            }
        }

        archived
    }

    fn write_copy(dir: &Path, suspect: &Suspect) -> anyhow::Result<PathBuf> {
        let content = suspect.source()?;
        let mut file = tempfile::Builder::new()
            .prefix(&suspect.id)
            .tempfile_in(dir)?;
        file.write_all(&content)?;
        file.flush()?;
        let (_, path) = file.keep()?;
        Ok(path)
    }

    fn append_log(
        dir: &Path,
        suspect: &Suspect,
        killer_plugin: &str,
        filename: &str,
    ) -> std::io::Result<()> {
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRASH_LOG_NAME))?;
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(
            handle,
            "{now} {} {} {killer_plugin} {filename}",
            suspect.from_address,
            suspect.to_address()
        )
    }
}
