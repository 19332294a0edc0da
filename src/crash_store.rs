//! Process wide sink for plugin failures, kept for later diagnostics.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_REPORTS: usize = 50;

lazy_static! {
    static ref REPORTS: Mutex<VecDeque<CrashReport>> = Mutex::new(VecDeque::new());
}

#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Stage and plugin that failed, e.g. `plugin Bayes`
    pub origin: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

pub struct CrashStore;

impl CrashStore {
    pub fn store(origin: &str, message: &str) {
        let report = CrashReport {
            origin: origin.to_string(),
            message: message.to_string(),
            time: Utc::now(),
        };
        let mut reports = REPORTS.lock().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut reports, report, MAX_REPORTS);
    }

    /// Most recent reports, oldest first.
    pub fn reports() -> Vec<CrashReport> {
        REPORTS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

fn push_bounded(reports: &mut VecDeque<CrashReport>, report: CrashReport, capacity: usize) {
    while reports.len() >= capacity {
        reports.pop_front();
    }
    reports.push_back(report);
}
