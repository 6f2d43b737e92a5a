//! Import outcome notifications.
//!
//! A run reports two kinds of outcome: a success notification after each group's table has been
//! finalized, and a failure notification when the run stops with an error. Delivery goes through
//! the [`ImportNotifier`] trait so the CLI can fan out to the log, a chat webhook and a local
//! audit file at once.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{IngestionError, IngestionResult};

/// Severity classification of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionSeverity {
    /// Informational event (successful import).
    Info,
    /// Warning-level event (non-fatal).
    Warning,
    /// Error-level event (the run failed).
    Error,
    /// Critical error (I/O or other infrastructure failures).
    Critical,
}

impl IngestionSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestionSeverity::Info => "info",
            IngestionSeverity::Warning => "warning",
            IngestionSeverity::Error => "error",
            IngestionSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for IngestionSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a run failure.
pub fn severity_for_error(e: &IngestionError) -> IngestionSeverity {
    match e.root() {
        IngestionError::Io(_) => IngestionSeverity::Critical,
        IngestionError::Csv(err) => match err.kind() {
            ::csv::ErrorKind::Io(_) => IngestionSeverity::Critical,
            _ => IngestionSeverity::Error,
        },
        IngestionError::Database(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => {
            IngestionSeverity::Critical
        }
        _ => IngestionSeverity::Error,
    }
}

/// A message plus a structured summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: IngestionSeverity,
    pub message: String,
    /// Free-form JSON object describing the import (file, table, row counts, ...).
    pub summary: serde_json::Value,
}

impl Notification {
    pub fn new(severity: IngestionSeverity, message: impl Into<String>, summary: serde_json::Value) -> Self {
        Self {
            severity,
            message: message.into(),
            summary,
        }
    }

    /// Failure notification for `err` while importing `input_file`.
    pub fn failure(input_file: &str, err: &IngestionError) -> Self {
        Self::new(
            severity_for_error(err),
            format!("Error importing data: {err}"),
            serde_json::json!({
                "error": err.to_string(),
                "inputFile": input_file,
            }),
        )
    }
}

/// Delivers notifications.
#[async_trait]
pub trait ImportNotifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> IngestionResult<()>;
}

#[async_trait]
impl<N: ImportNotifier + ?Sized> ImportNotifier for Arc<N> {
    async fn notify(&self, notification: &Notification) -> IngestionResult<()> {
        (**self).notify(notification).await
    }
}

/// Send `notification` and log, rather than return, a delivery failure.
pub async fn notify_best_effort<N: ImportNotifier + ?Sized>(notifier: &N, notification: &Notification) {
    if let Err(e) = notifier.notify(notification).await {
        warn!(error = %e, "failed to send notification");
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ImportNotifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> IngestionResult<()> {
        match n.severity {
            IngestionSeverity::Info => info!(summary = %n.summary, "{}", n.message),
            IngestionSeverity::Warning => warn!(summary = %n.summary, "{}", n.message),
            IngestionSeverity::Error | IngestionSeverity::Critical => {
                error!(severity = %n.severity, summary = %n.summary, "{}", n.message)
            }
        }
        Ok(())
    }
}

/// Posts notifications to an incoming-webhook URL (Slack compatible).
///
/// The body is `{"text": <message>, "summary": <summary>}`. Without a URL every call is a no-op.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl ImportNotifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> IngestionResult<()> {
        let Some(url) = self.url.as_deref() else {
            return Ok(());
        };
        let body = serde_json::json!({
            "text": n.message,
            "summary": n.summary,
        });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Appends notifications to a local file, one JSON object per line.
#[derive(Debug)]
pub struct FileNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNotifier {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_line(&self, line: &str) -> IngestionResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[async_trait]
impl ImportNotifier for FileNotifier {
    async fn notify(&self, n: &Notification) -> IngestionResult<()> {
        let line = serde_json::to_string(&serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "severity": n.severity,
            "message": n.message,
            "summary": n.summary,
        }))?;
        self.append_line(&line)
    }
}

/// Fans a notification out to every inner notifier.
///
/// Every notifier is tried; the first delivery error, if any, is returned afterwards.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn ImportNotifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn ImportNotifier>>) -> Self {
        Self { notifiers }
    }

    pub fn push(&mut self, notifier: Arc<dyn ImportNotifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl fmt::Debug for CompositeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeNotifier")
            .field("notifiers_len", &self.notifiers.len())
            .finish()
    }
}

#[async_trait]
impl ImportNotifier for CompositeNotifier {
    async fn notify(&self, n: &Notification) -> IngestionResult<()> {
        let mut first_err = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(n).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
