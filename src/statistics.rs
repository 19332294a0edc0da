use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::fmt;
use std::sync::Mutex;

lazy_static! {
    static ref GLOBAL: StatisticsCollector = StatisticsCollector::new();
}

#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub total_accepts: u64,
    pub total_rejects: u64,
    pub total_defers: u64,
    pub total_deletes: u64,
    pub no_decision: u64,
    pub spam: u64,
    pub virus: u64,
    pub blocked: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            messages_in: 0,
            messages_out: 0,
            total_accepts: 0,
            total_rejects: 0,
            total_defers: 0,
            total_deletes: 0,
            no_decision: 0,
            spam: 0,
            virus: 0,
            blocked: 0,
            start_time: now,
            last_updated: now,
        }
    }
}

impl fmt::Display for GlobalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in={} out={} accept={} reject={} defer={} delete={} dunno={} spam={} virus={} blocked={} since {}",
            self.messages_in,
            self.messages_out,
            self.total_accepts,
            self.total_rejects,
            self.total_defers,
            self.total_deletes,
            self.no_decision,
            self.spam,
            self.virus,
            self.blocked,
            self.start_time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    MessageIn,
    MessageOut,
    Decision {
        verdict: Verdict,
        spam: bool,
        virus: bool,
        blocked: bool,
    },
}

/// In-memory counters shared by all sessions of the process.
pub struct StatisticsCollector {
    stats: Mutex<GlobalStats>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(GlobalStats::default()),
        }
    }

    pub fn global() -> &'static StatisticsCollector {
        &GLOBAL
    }

    pub fn record_event(&self, event: StatEvent) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.last_updated = Utc::now();

        match event {
            StatEvent::MessageIn => stats.messages_in += 1,
            StatEvent::MessageOut => stats.messages_out += 1,
            StatEvent::Decision {
                verdict,
                spam,
                virus,
                blocked,
            } => {
                match verdict {
                    Verdict::Pass => stats.no_decision += 1,
                    Verdict::Accept => stats.total_accepts += 1,
                    Verdict::Reject => stats.total_rejects += 1,
                    Verdict::Defer => stats.total_defers += 1,
                    Verdict::Delete => stats.total_deletes += 1,
                }
                stats.spam += u64::from(spam);
                stats.virus += u64::from(virus);
                stats.blocked += u64::from(blocked);
            }
        }
    }

    pub fn get_stats(&self) -> GlobalStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = GlobalStats::default();
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
