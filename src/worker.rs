use std::sync::Mutex;

/// What a worker is currently doing, for operator introspection.
#[derive(Debug, Default)]
pub struct WorkerState {
    status: Mutex<String>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: impl Into<String>) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.into();
    }

    pub fn get(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
