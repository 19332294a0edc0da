pub mod address;
pub mod config;
pub mod crash_store;
pub mod error;
pub mod milter;
pub mod plugin;
pub mod protocol;
pub mod session;
pub mod stages;
pub mod statistics;
pub mod suspect;
pub mod trash;
pub mod verdict;
pub mod worker;

pub use config::{ComplianceFailAction, Config};
pub use crash_store::CrashStore;
pub use error::SessionError;
pub use milter::Milter;
pub use plugin::{AppenderPlugin, PluginSet, PrependerPlugin, ScannerPlugin};
pub use protocol::ProtocolHandler;
pub use session::SessionHandler;
pub use statistics::{StatEvent, StatisticsCollector};
pub use suspect::Suspect;
pub use verdict::{Disposition, PluginAnswer, SessionOutcome, Verdict};
