/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! The event envelope exchanged between producer and consumer, and the entities the
//! consumer builds from it.
//!
//! On the wire every event is a JSON object `{"type": <kind>, "data": <payload>}`. Decoding
//! goes through [`Event::decode`], which maps kinds this build does not know about onto
//! [`Event::Unknown`] instead of failing, so an older consumer keeps draining a newer producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::stats::EndpointStats;

pub const REQUEST_KIND: &str = "request";
pub const LOG_KIND: &str = "log";
pub const EXCEPTION_KIND: &str = "exception";
pub const RUNTIME_LOG_UPDATE_KIND: &str = "runtime_log_update";
pub const STARTUP_ROUTES_KIND: &str = "startup_routes";
pub const CUSTOM_KIND: &str = "custom";
pub const STATS_UPDATE_KIND: &str = "stats_update";

const KNOWN_KINDS: [&str; 7] = [
    REQUEST_KIND,
    LOG_KIND,
    EXCEPTION_KIND,
    RUNTIME_LOG_UPDATE_KIND,
    STARTUP_ROUTES_KIND,
    CUSTOM_KIND,
    STATS_UPDATE_KIND,
];

/// Log line tag for subprocess output read straight off its stdout/stderr pipes.
pub const RAW_LOG_KIND: &str = "RAW";
/// Log line tag for structured tracing output bridged from the producer.
pub const SERVER_LOG_KIND: &str = "SERVER";

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to encode or decode event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event of kind \"{0}\" cannot be encoded")]
    Unencodable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Pending or completed request lifecycle message.
    Request(RequestEvent),
    /// A server log line, either structured or raw subprocess output.
    Log(LogLine),
    /// An exception captured in the producer, correlated to a request when one was active.
    Exception(ExceptionInfo),
    /// Full set of runtime logs accumulated so far by one request.
    RuntimeLogUpdate(RuntimeLogUpdate),
    /// The producer's routing table, announced once at startup.
    StartupRoutes(Vec<RouteInfo>),
    /// A user-defined event attached to an endpoint.
    Custom(CustomEvent),
    /// Precomputed statistics for one endpoint.
    StatsUpdate(EndpointStats),
    /// Any kind this build does not understand.
    #[serde(skip)]
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct EnvelopeKind {
    #[serde(rename = "type")]
    kind: String,
}

impl Event {
    pub fn kind(&self) -> &str {
        match self {
            Event::Request(_) => REQUEST_KIND,
            Event::Log(_) => LOG_KIND,
            Event::Exception(_) => EXCEPTION_KIND,
            Event::RuntimeLogUpdate(_) => RUNTIME_LOG_UPDATE_KIND,
            Event::StartupRoutes(_) => STARTUP_ROUTES_KIND,
            Event::Custom(_) => CUSTOM_KIND,
            Event::StatsUpdate(_) => STATS_UPDATE_KIND,
            Event::Unknown { kind } => kind,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        if let Event::Unknown { kind } = self {
            return Err(EventError::Unencodable(kind.clone()));
        }
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Event, EventError> {
        let envelope: EnvelopeKind = serde_json::from_slice(bytes)?;
        if !KNOWN_KINDS.contains(&envelope.kind.as_str()) {
            return Ok(Event::Unknown { kind: envelope.kind });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload of a `request` event. The same id is sent twice: once pending, when the request
/// arrives, and once completed, when the response leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
    #[serde(default = "unknown_client")]
    pub client: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_params: Option<Value>,
    #[serde(default)]
    pub request_body: Option<Value>,
    #[serde(default)]
    pub request_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub response_body: Option<Value>,
    #[serde(default)]
    pub runtime_logs: Vec<Value>,
    #[serde(default)]
    pub exceptions: Vec<ExceptionInfo>,
    #[serde(default = "default_true")]
    pub pending: bool,
    #[serde(default)]
    pub completed: bool,
}

fn unknown_client() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}

impl RequestEvent {
    /// Whether this message closes the request lifecycle.
    pub fn is_completion(&self) -> bool {
        self.completed || !self.pending
    }
}

/// One observed request/response lifecycle, as held by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "unknown_client")]
    pub client: String,
    #[serde(default)]
    pub request_params: Option<Value>,
    #[serde(default)]
    pub request_body: Option<Value>,
    #[serde(default)]
    pub request_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub response_body: Option<Value>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub runtime_logs: Vec<Value>,
    #[serde(default)]
    pub exceptions: Vec<ExceptionInfo>,
    pub pending: bool,
}

impl Hit {
    pub fn from_request(event: &RequestEvent) -> Self {
        Hit {
            id: event.id.clone(),
            endpoint: event.endpoint.clone(),
            method: event.method.clone(),
            timestamp: event.timestamp,
            client: event.client.clone(),
            request_params: event.request_params.clone(),
            request_body: event.request_body.clone(),
            request_headers: event.request_headers.clone(),
            response_body: event.response_body.clone(),
            status_code: event.status_code,
            duration_ms: event.duration_ms,
            runtime_logs: event.runtime_logs.clone(),
            exceptions: event.exceptions.clone(),
            pending: !event.is_completion(),
        }
    }

    /// Overwrites every field a completion owns. Applying the same completion twice leaves
    /// the hit unchanged.
    pub fn apply_completion(&mut self, event: &RequestEvent) {
        self.status_code = event.status_code;
        self.duration_ms = event.duration_ms;
        self.response_body = event.response_body.clone();
        self.runtime_logs = event.runtime_logs.clone();
        self.exceptions = event.exceptions.clone();
        self.pending = false;
    }

    pub fn is_error(&self) -> bool {
        self.status_code.is_some_and(|code| code >= 400)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub function: String,
    pub lineno: u32,
    /// Redacted, length-bounded representations of the bindings captured for this frame.
    #[serde(default)]
    pub locals_preview: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub id: String,
    pub exception_type: String,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
    /// Innermost frame first.
    #[serde(default)]
    pub frames: Vec<StackFrame>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ExceptionInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        ExceptionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            exception_type: exception_type.into(),
            message: message.into(),
            traceback: String::new(),
            frames: Vec::new(),
            request_id: None,
            endpoint: None,
            method: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl LogLine {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        LogLine {
            level: level.into(),
            message: message.into(),
            timestamp: Utc::now(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Display tag of the line. Untagged lines are tagged by their level.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.level)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLogUpdate {
    pub request_id: String,
    /// The entry that triggered this update.
    pub log: Value,
    /// Every entry the request has accumulated so far, including `log`.
    pub all_logs: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

impl RouteInfo {
    /// The method shown for the route: the first one that is not `HEAD` or `OPTIONS`.
    pub fn primary_method(&self) -> &str {
        self.methods
            .iter()
            .map(String::as_str)
            .find(|m| !matches!(*m, "HEAD" | "OPTIONS"))
            .unwrap_or("GET")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub id: String,
    pub endpoint: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default = "default_custom_level")]
    pub level: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_custom_level() -> String {
    "info".to_string()
}

impl CustomEvent {
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        CustomEvent {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            message: message.into(),
            data: None,
            level: default_custom_level(),
            timestamp: Utc::now(),
        }
    }
}
