//! Background audit shipper.
//!
//! Producers serialize records and push them onto an unbounded channel; a
//! single worker task owns the store and writes records one at a time in
//! channel order. Write failures are logged and the record is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use audit_trail_core::{
    audit_id, format_timestamp, is_reserved_field, request_metadata, response_metadata,
    CapturedRequest, CapturedResponse, AUDIT_RECORD_CONTENT_TYPE,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AuditOptions;
use crate::error::AuditError;
use crate::store::{ObjectStore, PutObjectRequest, S3ObjectStore};

const EVENT_TIMESTAMP_FIELD: &str = "eventTimestamp";
const IDENTIFIER_FIELD: &str = "identifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// A serialized record waiting for the worker
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    pub key: String,
    pub audit_id: String,
    pub content: Bytes,
}

struct Worker {
    receiver: UnboundedReceiver<QueuedRecord>,
    store: Box<dyn ObjectStore>,
    bucket: String,
    region: String,
    cancel: CancellationToken,
}

pub struct AuditLogger {
    options: AuditOptions,
    sender: Mutex<Option<UnboundedSender<QueuedRecord>>>,
    pending: Mutex<Option<Worker>>,
    worker: Mutex<Option<JoinHandle<usize>>>,
    state: Mutex<LoggerState>,
    /// Flips to `true` once the state reaches `Stopped`
    stopped: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

impl AuditLogger {
    /// Create a logger writing to `store`. Records may be queued right away;
    /// nothing is written until [`AuditLogger::start`].
    pub fn new(options: AuditOptions, store: Box<dyn ObjectStore>) -> Result<Self, AuditError> {
        options.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = Worker {
            receiver,
            store,
            bucket: options.bucket.clone(),
            region: options.region.clone(),
            cancel: cancel.clone(),
        };

        Ok(Self {
            options,
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(Some(worker)),
            worker: Mutex::new(None),
            state: Mutex::new(LoggerState::Created),
            stopped: watch::Sender::new(false),
            cancel,
        })
    }

    /// Create a logger backed by S3, using the default AWS credential chain
    pub async fn from_options(options: AuditOptions) -> Result<Self, AuditError> {
        options.validate()?;
        let store = S3ObjectStore::new(&options.region, options.endpoint.as_deref()).await;
        Self::new(options, Box::new(store))
    }

    pub async fn from_env() -> Result<Self, AuditError> {
        Self::from_options(AuditOptions::from_env()).await
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    pub fn state(&self) -> LoggerState {
        *lock(&self.state)
    }

    /// Spawn the worker task. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), AuditError> {
        let mut state = lock(&self.state);
        if *state != LoggerState::Created {
            return Err(AuditError::InvalidState {
                action: "start",
                state: *state,
            });
        }

        let worker = lock(&self.pending).take().ok_or(AuditError::InvalidState {
            action: "start",
            state: *state,
        })?;

        *lock(&self.worker) = Some(tokio::spawn(worker.run()));
        *state = LoggerState::Running;

        info!(
            "Audit logger started for s3://{}/{}",
            self.options.bucket,
            self.options.key_prefix()
        );
        Ok(())
    }

    /// Queue the record for an inbound request. Returns its audit id.
    pub fn log_request(
        &self,
        request: &CapturedRequest,
        context_fields: &Map<String, Value>,
    ) -> Result<String, AuditError> {
        let audit_id = audit_id(request, false);
        let mut fields = request_metadata(request);
        merge_context_fields(&mut fields, context_fields);
        self.queue_record(&audit_id, fields)?;
        Ok(audit_id)
    }

    /// Queue the record for a response. Returns its audit id.
    pub fn log_response(
        &self,
        request: &CapturedRequest,
        response: &CapturedResponse,
        include_request_in_response: bool,
        request_timestamp: Option<&str>,
        context_fields: &Map<String, Value>,
    ) -> Result<String, AuditError> {
        let audit_id = audit_id(request, true);
        let mut fields = response_metadata(
            request,
            response,
            include_request_in_response,
            request_timestamp,
        );
        merge_context_fields(&mut fields, context_fields);
        self.queue_record(&audit_id, fields)?;
        Ok(audit_id)
    }

    /// Stamp, serialize and enqueue an arbitrary record.
    ///
    /// `eventTimestamp` and `identifier` always reflect this call, replacing
    /// any caller-supplied values.
    pub fn queue_record(
        &self,
        audit_id: &str,
        mut fields: Map<String, Value>,
    ) -> Result<(), AuditError> {
        let now = Utc::now();

        fields.shift_remove(EVENT_TIMESTAMP_FIELD);
        fields.shift_remove(IDENTIFIER_FIELD);
        fields.insert(
            EVENT_TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(&now)),
        );
        fields.insert(IDENTIFIER_FIELD.to_string(), Value::String(audit_id.to_string()));

        let key = format!(
            "{}/{}{}",
            self.options.key_prefix(),
            now.format("%Y/%m/%d/%H/"),
            audit_id
        );
        let content = Bytes::from(serde_json::to_vec(&Value::Object(fields))?);

        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or(AuditError::QueueClosed)?;
        sender
            .send(QueuedRecord {
                key,
                audit_id: audit_id.to_string(),
                content,
            })
            .map_err(|_| AuditError::QueueClosed)?;

        debug!("Queued audit record {}", audit_id);
        Ok(())
    }

    /// Close the queue and wait until every queued record has been written.
    ///
    /// Concurrent callers all return once the logger is `Stopped`; only the
    /// first one drives the drain and reports a dropped count.
    pub async fn stop(&self) {
        self.shutdown(None).await;
    }

    /// Like [`AuditLogger::stop`], but give up on the backlog after `timeout`.
    /// The write in progress completes; the remaining records are dropped and
    /// their count returned.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> usize {
        self.shutdown(Some(timeout)).await
    }

    async fn shutdown(&self, timeout: Option<Duration>) -> usize {
        let claimed = {
            let mut state = lock(&self.state);
            match *state {
                LoggerState::Stopped => return 0,
                // Subscribed under the state lock so the final flip is not missed
                LoggerState::Stopping => Err(self.stopped.subscribe()),
                LoggerState::Created => {
                    *state = LoggerState::Stopped;
                    self.stopped.send_replace(true);
                    lock(&self.sender).take();
                    let dropped = lock(&self.pending)
                        .take()
                        .map(Worker::discard)
                        .unwrap_or_default();
                    info!("Audit logger stopped before it was started");
                    return dropped;
                }
                LoggerState::Running => {
                    *state = LoggerState::Stopping;
                    // Dropping the only sender lets the worker drain and exit
                    lock(&self.sender).take();
                    Ok(lock(&self.worker).take())
                }
            }
        };

        let handle = match claimed {
            Ok(handle) => handle,
            Err(mut stopped) => {
                debug!("Audit logger already stopping, waiting for the drain");
                if stopped.wait_for(|done| *done).await.is_err() {
                    warn!("Audit logger dropped while waiting for it to stop");
                }
                return 0;
            }
        };

        info!("Stopping audit logger");

        let dropped = match handle {
            Some(handle) => self.join_worker(handle, timeout).await,
            None => 0,
        };

        *lock(&self.state) = LoggerState::Stopped;
        self.stopped.send_replace(true);
        info!("Audit logger stopped");
        dropped
    }

    async fn join_worker(&self, mut handle: JoinHandle<usize>, timeout: Option<Duration>) -> usize {
        if let Some(timeout) = timeout {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(result) => return joined(result),
                Err(_) => {
                    warn!(
                        "Audit log drain did not finish within {:?}, discarding backlog",
                        timeout
                    );
                    self.cancel.cancel();
                }
            }
        }
        joined(handle.await)
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Worker {
    async fn run(mut self) -> usize {
        debug!("Audit log worker started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                record = self.receiver.recv() => match record {
                    Some(record) => self.write(record).await,
                    None => {
                        debug!("Audit log queue drained");
                        return 0;
                    }
                },
            }
        }

        self.discard()
    }

    fn discard(mut self) -> usize {
        self.receiver.close();
        let mut dropped = 0;
        while let Ok(record) = self.receiver.try_recv() {
            debug!("Discarding audit record {}", record.audit_id);
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Discarded {} queued audit records", dropped);
        }
        dropped
    }

    async fn write(&self, record: QueuedRecord) {
        let location = format!("s3://{}/{}", self.bucket, record.key);
        debug!("Writing audit record {}", record.audit_id);

        let request = PutObjectRequest {
            bucket: self.bucket.clone(),
            key: record.key,
            content_length: record.content.len() as u64,
            body: record.content,
            content_type: AUDIT_RECORD_CONTENT_TYPE.to_string(),
            server_side_encryption: true,
            metadata: HashMap::new(),
        };

        match self.store.put_object(request).await {
            Ok(response) if response.is_success() => {
                info!(region = %self.region, location = %location, "Wrote audit log");
            }
            Ok(response) => {
                error!(
                    location = %location,
                    "Error writing audit log: store responded with status {}",
                    response.status_code
                );
            }
            Err(e) => {
                error!(location = %location, "Error writing audit log: {}", e);
            }
        }
    }
}

/// Context fields never override record metadata
fn merge_context_fields(fields: &mut Map<String, Value>, context_fields: &Map<String, Value>) {
    for (key, value) in context_fields {
        if is_reserved_field(key) || fields.contains_key(key) {
            warn!("Ignoring context field '{}' that collides with audit metadata", key);
            continue;
        }
        fields.insert(key.clone(), value.clone());
    }
}

fn joined(result: Result<usize, tokio::task::JoinError>) -> usize {
    result.unwrap_or_else(|e| {
        error!("Audit log worker failed: {}", e);
        0
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
