//! Wire protocol for the HTTP API.
//!
//! Requests are validated into dispatcher inputs here so handlers never see
//! unchecked hosts, names or payloads.

use std::collections::{BTreeMap, HashSet};

use fleet_core::{Credential, HostDefaults, HostResult, HostStatus, Job, JobId, Target};
use fleet_jobs::{Operation, RelocationSpec, relocation::validate_file_name};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Characters of stdout/stderr returned when polling a job.
pub const OUTPUT_DISPLAY_LIMIT: usize = 2000;

/// Every problem found in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.join("; "))]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    fn into_result<T>(self, value: impl FnOnce() -> T) -> Result<T, Self> {
        if self.0.is_empty() { Ok(value()) } else { Err(self) }
    }
}

/// Whether `s` is a dotted-quad IPv4 address.
#[must_use]
pub fn is_valid_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|p| {
            (1..=3).contains(&p.len())
                && p.bytes().all(|b| b.is_ascii_digit())
                && p.parse::<u16>().is_ok_and(|n| n <= 255)
        })
}

/// Trim, validate and de-duplicate hosts, keeping first occurrences in order.
fn collect_hosts(raw: &[String], errors: &mut ValidationErrors) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for host in raw.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
        if !is_valid_ipv4(host) {
            errors.push(format!("Invalid IP address: {host}"));
        } else if seen.insert(host.to_string()) {
            hosts.push(host.to_string());
        }
    }
    if hosts.is_empty() && errors.0.is_empty() {
        errors.push("At least one host is required");
    }
    hosts
}

/// Hosts from a form field: a JSON array, or a list separated by newlines,
/// commas or whitespace.
#[must_use]
pub fn parse_host_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|h| !h.is_empty())
            .collect();
    }
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build a placement spec, recording problems instead of returning early.
fn placement_spec(
    dest_dir: Option<&str>,
    owner: Option<&str>,
    group: Option<&str>,
    mode: Option<&str>,
    defaults: &HostDefaults,
    errors: &mut ValidationErrors,
) -> Option<RelocationSpec> {
    let user = defaults.username.as_str();
    let home = format!("/home/{user}");
    let dest_dir = dest_dir.filter(|d| !d.trim().is_empty()).unwrap_or(&home);
    let owner = owner.filter(|o| !o.is_empty()).unwrap_or(user);
    let group = group.filter(|g| !g.is_empty()).unwrap_or(user);

    let spec = RelocationSpec::new(dest_dir.trim(), owner, group).and_then(|spec| match mode {
        Some(mode) if !mode.is_empty() => spec.with_mode(mode),
        _ => Ok(spec),
    });
    match spec {
        Ok(spec) => Some(spec),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    }
}

/// Execution mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Wait for every host.
    Sync,
    /// Return a job id immediately.
    #[default]
    Async,
}

impl Mode {
    /// Mode of an execute request.
    ///
    /// An empty or false `mode` falls back to the `sync` field. Only `true`,
    /// `"sync"`, `"SYNC"` and `"immediate"` block; anything else, including
    /// no value, runs in the background.
    #[must_use]
    pub fn from_fields(mode: Option<&Value>, sync: Option<&Value>) -> Self {
        let chosen = mode.filter(|v| is_truthy(v)).or(sync);
        match chosen {
            Some(Value::Bool(true)) => Self::Sync,
            Some(Value::String(s)) if matches!(s.trim(), "sync" | "SYNC" | "immediate") => Self::Sync,
            _ => Self::Async,
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Whether a form flag such as `async` is switched on.
fn form_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// `POST /api/execute` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default, alias = "ips")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub command: String,
    /// `"sync"`, `"immediate"` or `true` to wait; anything else runs async.
    #[serde(default)]
    pub mode: Option<Value>,
    /// Consulted when `mode` is absent or empty.
    #[serde(default)]
    pub sync: Option<Value>,
    #[serde(default)]
    pub postcheck_pattern: Option<String>,
}

/// Validated execute request.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub hosts: Vec<String>,
    pub operation: Operation,
    pub mode: Mode,
}

impl ExecuteRequest {
    /// Check hosts and command, and resolve the mode.
    ///
    /// # Errors
    /// Returns every validation problem found.
    pub fn validate(self) -> Result<ExecuteJob, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let hosts = collect_hosts(&self.hosts, &mut errors);

        let command = self.command.trim();
        if command.is_empty() {
            errors.push("Command is required");
        }
        let mode = Mode::from_fields(self.mode.as_ref(), self.sync.as_ref());
        let operation = match self.postcheck_pattern.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => {
                Operation::command_with_postcheck(command, pattern)
            }
            _ => Operation::command(command),
        };

        errors.into_result(|| ExecuteJob {
            hosts,
            operation,
            mode,
        })
    }
}

/// Text fields of a `POST /api/upload-copy` multipart form.
///
/// The `file` part itself is streamed to disk by the handler.
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    /// `ips` or `hosts`: JSON array or delimited list.
    pub hosts: Option<String>,
    /// Remote name; defaults to the uploaded file's own name.
    pub file_name: Option<String>,
    pub dest_dir: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
    /// `async` flag; uploads block unless it is set.
    pub background: Option<String>,
}

/// Name used when neither the form nor the file part names the file.
pub const DEFAULT_UPLOAD_NAME: &str = "uploaded_file";

impl UploadForm {
    /// Record a text field. Unknown fields are ignored.
    pub fn set(&mut self, name: &str, value: String) {
        let slot = match name {
            "ips" | "hosts" => &mut self.hosts,
            "fileName" => &mut self.file_name,
            "destDir" => &mut self.dest_dir,
            "owner" => &mut self.owner,
            "group" => &mut self.group,
            "mode" => &mut self.mode,
            "async" => &mut self.background,
            _ => return,
        };
        *slot = Some(value);
    }

    /// Check hosts, file name and placement.
    ///
    /// `uploaded_name` is the file part's own name, used when no `fileName`
    /// field was sent. Client-side directories are stripped from it.
    ///
    /// # Errors
    /// Returns every validation problem found.
    pub fn validate(
        self,
        uploaded_name: Option<&str>,
        defaults: &HostDefaults,
    ) -> Result<UploadJob, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let raw_hosts = self.hosts.as_deref().map(parse_host_list).unwrap_or_default();
        let hosts = collect_hosts(&raw_hosts, &mut errors);

        let file_name = self
            .file_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| {
                uploaded_name
                    .and_then(|n| n.rsplit(['/', '\\']).next())
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
            })
            .unwrap_or(DEFAULT_UPLOAD_NAME)
            .to_string();
        if let Err(e) = validate_file_name(&file_name) {
            errors.push(e.to_string());
        }
        let spec = placement_spec(
            self.dest_dir.as_deref(),
            self.owner.as_deref(),
            self.group.as_deref(),
            self.mode.as_deref(),
            defaults,
            &mut errors,
        );

        match spec {
            Some(spec) if errors.0.is_empty() => Ok(UploadJob {
                hosts,
                file_name,
                spec,
                mode: if form_flag(self.background.as_deref()) { Mode::Async } else { Mode::Sync },
            }),
            _ => Err(errors),
        }
    }
}

/// Validated upload form.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub hosts: Vec<String>,
    pub file_name: String,
    pub spec: RelocationSpec,
    pub mode: Mode,
}

/// Source of a host-to-host copy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopySource {
    #[serde(default)]
    pub ip: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub path: String,
}

/// `POST /api/copy-between-hosts` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRequest {
    #[serde(default, alias = "ips")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub source: CopySource,
    pub dest_dir: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

/// Validated copy request.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub source: Target,
    pub path: String,
    pub hosts: Vec<String>,
    pub spec: RelocationSpec,
}

impl CopyRequest {
    /// Check the source, the targets and the placement.
    ///
    /// Source login fields fall back to `defaults`.
    ///
    /// # Errors
    /// Returns every validation problem found.
    pub fn validate(self, defaults: &HostDefaults) -> Result<CopyJob, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let hosts = collect_hosts(&self.hosts, &mut errors);

        let source = self.source;
        let ip = source.ip.trim();
        if !is_valid_ipv4(ip) {
            errors.push(format!("Invalid source IP address: {ip}"));
        }
        let path = source.path.trim().to_string();
        if !path.starts_with('/') {
            errors.push("Source path must be absolute");
        } else if let Err(e) = validate_file_name(path.rsplit('/').next().unwrap_or_default()) {
            errors.push(e.to_string());
        }
        let spec = placement_spec(
            self.dest_dir.as_deref(),
            self.owner.as_deref(),
            self.group.as_deref(),
            self.mode.as_deref(),
            defaults,
            &mut errors,
        );

        let credential = source
            .password
            .filter(|p| !p.is_empty())
            .map_or_else(|| defaults.credential.clone(), Credential::Password);
        let target = Target::new(
            ip,
            source.port.unwrap_or(defaults.port),
            source
                .username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| defaults.username.clone()),
            credential,
        );

        match spec {
            Some(spec) if errors.0.is_empty() => Ok(CopyJob {
                source: target,
                path,
                hosts,
                spec,
            }),
            _ => Err(errors),
        }
    }
}

/// `400` body listing validation problems.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationBody {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl From<ValidationErrors> for ValidationBody {
    fn from(errors: ValidationErrors) -> Self {
        Self {
            ok: false,
            errors: errors.0,
        }
    }
}

/// Body for a single failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

/// Response to a blocking dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub ok: bool,
    pub completed: bool,
    pub results: BTreeMap<String, HostResult>,
    pub statuses: BTreeMap<String, HostStatus>,
    /// Remote name of an uploaded file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Response to a background dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub ok: bool,
    pub job_id: JobId,
}

/// Response to a job poll.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub ok: bool,
    pub job: Job,
}

impl JobResponse {
    /// Presentation copy of `job` with outputs cut to [`OUTPUT_DISPLAY_LIMIT`].
    #[must_use]
    pub fn truncated(mut job: Job) -> Self {
        for result in job.results.values_mut() {
            *result = result.truncated(OUTPUT_DISPLAY_LIMIT);
        }
        Self { ok: true, job }
    }
}
