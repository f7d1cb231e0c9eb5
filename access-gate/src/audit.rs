//! Audit trail for access decisions, permission fetches and flag changes
//!
//! Audit failures never influence a decision. The engine logs a failed
//! `record` and drops the event.

use access_gate_api::{AccessDecision, AccessRequest, DecisionReason};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// RFC 3339 timestamp
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    chrono::Utc::now().to_rfc3339()
}

/// Audit event for one access-relevant action
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: Timestamp,
    pub event_type: AuditEventType,
    /// Identity the event concerns, if any (flag changes are global)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: AuditDetails) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            identity: None,
            details,
        }
    }

    /// Attach the identity the event concerns
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AccessGranted,
    AccessDenied,
    PermissionsFetched,
    PermissionFetchFailed,
    FlagChanged,
    FlagsReset,
    FlagsLoaded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    /// Final decision for a request
    Decision {
        request: AccessRequest,
        reason: DecisionReason,
        legacy_allowed: bool,
        permission_allowed: bool,
    },
    /// Permission fetch outcome
    Fetch {
        #[serde(skip_serializing_if = "Option::is_none")]
        modules: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Single flag mutation
    Flag { name: String, value: bool },
    /// Whole flag set written or loaded
    Flags {
        count: usize,
        /// Persisted blob was rejected and defaults used
        recovered: bool,
    },
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// Some sinks of a [`CompositeAuditSink`] failed; the rest still recorded
    #[error("{failed} of {total} audit sinks failed, first error: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: String,
    },
}

/// Destination for audit events
///
/// Sinks are called synchronously on the evaluation path, so `record`
/// should be cheap (buffer, don't block on the network).
///
/// ```rust
/// use access_gate::audit::{AuditError, AuditEvent, AuditSink};
///
/// struct Stderr;
///
/// impl AuditSink for Stderr {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{:?} {:?}", event.event_type, event.identity);
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Record an event, logging instead of failing
pub(crate) fn record_quietly(sink: Option<&dyn AuditSink>, event: AuditEvent) {
    let Some(sink) = sink else {
        return;
    };
    if let Err(e) = sink.record(event) {
        tracing::warn!(error = %e, "Dropping audit event");
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Appends one JSON object per line
///
/// Lines are buffered; call [`AuditSink::flush`] before reading the file.
pub struct FileAuditSink {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    /// Open `path` for appending, creating it and its directory if needed
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn out(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_vec(&event)?;
        let mut out = self.out();
        out.write_all(&line)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.out().flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.exists()
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileAuditSink").field(&self.path).finish()
    }
}

/// Ring buffer of the most recent events
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Keep at most `capacity` events; zero keeps nothing
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.buffer().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.buffer().len()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.matching(|e| e.event_type == event_type)
    }

    pub fn find_by_identity(&self, identity: &str) -> Vec<AuditEvent> {
        self.matching(|e| e.identity.as_deref() == Some(identity))
    }

    fn matching(&self, pred: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.buffer().iter().filter(|e| pred(e)).cloned().collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut events = self.buffer();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("len", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Sends each event to every inner sink
///
/// A failing sink does not stop delivery to the others; the failure is
/// reported as [`AuditError::Partial`].
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(self, sink: impl AuditSink + 'static) -> Self {
        self.with_shared(Arc::new(sink))
    }

    /// Add a sink the caller also keeps, e.g. a memory sink to inspect
    pub fn with_shared(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(
        &self,
        mut op: impl FnMut(&dyn AuditSink) -> Result<(), AuditError>,
    ) -> Result<(), AuditError> {
        let errors: Vec<AuditError> = self
            .sinks
            .iter()
            .filter_map(|sink| op(sink.as_ref()).err())
            .collect();
        match errors.first() {
            None => Ok(()),
            Some(first) => Err(AuditError::Partial {
                failed: errors.len(),
                total: self.sinks.len(),
                first: first.to_string(),
            }),
        }
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.each(|sink| sink.record(event.clone()))
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.each(|sink| sink.flush())
    }

    fn is_healthy(&self) -> bool {
        self.sinks.iter().all(|sink| sink.is_healthy())
    }
}

impl fmt::Debug for CompositeAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAuditSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

// ============================================================================
// Event constructors
// ============================================================================

/// `AccessGranted` or `AccessDenied` for a finished evaluation
pub fn access_decided(identity: &str, request: &AccessRequest, decision: &AccessDecision) -> AuditEvent {
    let event_type = if decision.allowed {
        AuditEventType::AccessGranted
    } else {
        AuditEventType::AccessDenied
    };
    let details = AuditDetails::Decision {
        request: request.clone(),
        reason: decision.reason,
        legacy_allowed: decision.legacy_allowed,
        permission_allowed: decision.permission_allowed,
    };
    AuditEvent::new(event_type, details).with_identity(identity)
}

pub fn permissions_fetched(identity: &str, modules: usize) -> AuditEvent {
    let details = AuditDetails::Fetch {
        modules: Some(modules),
        error: None,
    };
    AuditEvent::new(AuditEventType::PermissionsFetched, details).with_identity(identity)
}

pub fn permission_fetch_failed(identity: &str, error: &str) -> AuditEvent {
    let details = AuditDetails::Fetch {
        modules: None,
        error: Some(error.to_owned()),
    };
    AuditEvent::new(AuditEventType::PermissionFetchFailed, details).with_identity(identity)
}

pub fn flag_changed(name: &str, value: bool) -> AuditEvent {
    let details = AuditDetails::Flag {
        name: name.to_owned(),
        value,
    };
    AuditEvent::new(AuditEventType::FlagChanged, details)
}

pub fn flags_reset(count: usize) -> AuditEvent {
    let details = AuditDetails::Flags {
        count,
        recovered: false,
    };
    AuditEvent::new(AuditEventType::FlagsReset, details)
}

pub fn flags_loaded(count: usize, recovered: bool) -> AuditEvent {
    AuditEvent::new(AuditEventType::FlagsLoaded, AuditDetails::Flags { count, recovered })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Io(std::io::Error::other("disk full")))
        }

        fn is_healthy(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_decision_event_type_follows_outcome() {
        let sink = MemoryAuditSink::new();
        let granted = AccessDecision::merge(false, true, false);
        let denied = AccessDecision::merge(false, false, false);

        sink.record(access_decided("u-1", &AccessRequest::new().module("reports"), &granted))
            .unwrap();
        sink.record(access_decided("u-2", &AccessRequest::new().admin(), &denied))
            .unwrap();

        let granted = sink.find_by_type(AuditEventType::AccessGranted);
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].identity.as_deref(), Some("u-1"));
        assert_eq!(sink.find_by_identity("u-2").len(), 1);
    }

    #[test]
    fn test_memory_sink_keeps_most_recent() {
        let sink = MemoryAuditSink::with_capacity(2);
        for n in 1..=3 {
            sink.record(permissions_fetched(&format!("u-{n}"), n)).unwrap();
        }

        let identities: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| e.identity)
            .collect();
        assert_eq!(identities, vec!["u-2", "u-3"]);

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let sink = MemoryAuditSink::with_capacity(0);
        sink.record(flags_reset(6)).unwrap();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_composite_delivers_past_failures() {
        let memory = Arc::new(MemoryAuditSink::new());
        let sink = CompositeAuditSink::new()
            .with_sink(BrokenSink)
            .with_shared(memory.clone())
            .with_sink(NullAuditSink);

        let err = sink.record(flag_changed("beta_features", true)).unwrap_err();
        assert!(matches!(err, AuditError::Partial { failed: 1, total: 3, .. }));
        assert_eq!(memory.count(), 1);
        assert!(!sink.is_healthy());
        assert!(sink.flush().is_ok());
    }

    #[test]
    fn test_decision_event_json_shape() {
        let decision = AccessDecision::merge(false, false, true);
        let event = access_decided("u-7", &AccessRequest::new().admin(), &decision);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "access_denied");
        assert_eq!(value["identity"], "u-7");
        assert_eq!(value["details"]["type"], "decision");
        assert_eq!(value["details"]["reason"], "permission_fetch_error");
        assert_eq!(value["details"]["request"]["require_admin"], true);
    }

    #[test]
    fn test_flag_events_have_no_identity() {
        let value = serde_json::to_value(flag_changed("export_reports", false)).unwrap();
        assert!(value.get("identity").is_none());
        assert_eq!(value["details"]["name"], "export_reports");
    }

    #[test]
    fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let sink = FileAuditSink::new(&path).unwrap();
        sink.record(permission_fetch_failed("u-1", "backend down")).unwrap();
        sink.record(flags_loaded(6, true)).unwrap();
        sink.flush().unwrap();
        assert!(sink.is_healthy());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "permission_fetch_failed");
        assert_eq!(lines[0]["details"]["error"], "backend down");
        assert_eq!(lines[1]["details"]["recovered"], true);
    }
}
