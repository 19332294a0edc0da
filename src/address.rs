//! Envelope address legitimacy checks.
//!
//! The active checker is process wide and can be swapped between sessions.
//! A session reads the current checker once; a concurrent swap only changes
//! how strict the next session is.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref LOCAL_PART: Regex = Regex::new(r#"^[^\s@<>()\[\],;:"]+$"#).unwrap();
    static ref QUOTED_LOCAL_PART: Regex = Regex::new(r#"^"([^"\\\r\n]|\\.)*"$"#).unwrap();
    static ref DOMAIN: Regex =
        Regex::new(r"^([A-Za-z0-9_-]+\.)*[A-Za-z0-9_-]+$|^\[[^\[\]\s]+\]$").unwrap();
    static ref ACTIVE_CHECKER: RwLock<Arc<dyn AddressChecker>> =
        RwLock::new(Arc::new(DefaultChecker));
}

pub trait AddressChecker: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_legitimate(&self, address: &str) -> bool;
}

/// Plain `local@domain` with an unquoted local part.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChecker;

/// Like [`DefaultChecker`] but also accepts a quoted local part, which may
/// itself contain `@` or blanks (`"john doe"@example.com`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LazyQuotedLocalPart;

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty() && DOMAIN.is_match(domain)
}

impl AddressChecker for DefaultChecker {
    fn name(&self) -> &'static str {
        "Default"
    }

    fn is_legitimate(&self, address: &str) -> bool {
        match address.split_once('@') {
            Some((local, domain)) => LOCAL_PART.is_match(local) && valid_domain(domain),
            None => false,
        }
    }
}

impl AddressChecker for LazyQuotedLocalPart {
    fn name(&self) -> &'static str {
        "LazyQuotedLocalPart"
    }

    fn is_legitimate(&self, address: &str) -> bool {
        if address.starts_with('"') {
            return match address.rsplit_once('@') {
                Some((local, domain)) => QUOTED_LOCAL_PART.is_match(local) && valid_domain(domain),
                None => false,
            };
        }
        DefaultChecker.is_legitimate(address)
    }
}

/// Checker selected by the `address_compliance_checker` config value.
/// Unrecognized names fall back to the default checker.
pub fn checker_for_name(name: &str) -> Arc<dyn AddressChecker> {
    match name.trim() {
        "Default" => Arc::new(DefaultChecker),
        "LazyQuotedLocalPart" => Arc::new(LazyQuotedLocalPart),
        other => {
            log::error!("Address Compliance Checker '{other}' not recognized -> use Default");
            Arc::new(DefaultChecker)
        }
    }
}

/// Make the named checker the active one unless it already is.
pub fn configure_checker(name: &str) -> Arc<dyn AddressChecker> {
    let current = active_checker();
    if current.name() == name.trim() {
        return current;
    }
    let checker = checker_for_name(name);
    let mut guard = ACTIVE_CHECKER.write().unwrap_or_else(|e| e.into_inner());
    *guard = checker.clone();
    log::debug!("Address compliance checker set to {}", checker.name());
    checker
}

pub fn active_checker() -> Arc<dyn AddressChecker> {
    ACTIVE_CHECKER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}
