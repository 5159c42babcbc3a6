//! Diagnostic sink that records everything it receives.

use std::sync::Mutex;

use crate::diag::{DiagnosticSink, MissRecord};
use crate::hash::DataHashResult;

#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    misses: Mutex<Vec<MissRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn misses(&self) -> Vec<MissRecord> {
        self.misses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Reasons of every recorded miss, in order.
    pub fn miss_reasons(&self) -> Vec<DataHashResult> {
        self.misses().into_iter().map(|m| m.reason).collect()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.misses.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl DiagnosticSink for RecordingSink {
    fn emit(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }

    fn miss(&self, record: &MissRecord) {
        self.misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}
