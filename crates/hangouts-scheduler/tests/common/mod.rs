//! Fakes shared by the pipeline tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{ConversationalEngine, Notifier};
use hangouts_core::types::{Intent, UserContext};

/// Plays back scripted replies, then repeats `fallback`.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<String>>>,
    fallback: String,
    calls: Mutex<u32>,
}

impl ScriptedEngine {
    pub fn replying(text: &str) -> Arc<Self> {
        Self::scripted(Vec::new(), text)
    }

    pub fn scripted(script: Vec<Result<String>>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: fallback.to_string(),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ConversationalEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _context: &UserContext, _intent: Intent) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => Ok(self.fallback.clone()),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    received_at: Mutex<Vec<DateTime<Utc>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Wall-clock time each notification arrived, in order.
    pub fn received_at(&self) -> Vec<DateTime<Utc>> {
        self.received_at.lock().unwrap().clone()
    }

    /// Poll until at least `n` notifications arrived or `timeout` passed.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<(String, String)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= n || tokio::time::Instant::now() >= deadline {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<()> {
        if owner_id.is_empty() {
            return Err(HangoutsError::Delivery("no owner".into()));
        }
        self.sent.lock().unwrap().push((owner_id.to_string(), text.to_string()));
        self.received_at.lock().unwrap().push(Utc::now());
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` passed; returns the last result.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
