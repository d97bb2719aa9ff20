//! Jail records and host jail control
//!
//! [`Jail`] is the persisted configuration of one jail. [`JailController`]
//! starts and stops jails through `jail(8)` and reads the live table with
//! `jls(8)`. Whether a jail is running is never stored; it is asked of the
//! host every time.

use std::net::Ipv4Addr;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::executor::{BoxedExecutor, ExecutionError};
use crate::store::StoreError;
use crate::zfs::ZfsError;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_START: &str = "/bin/sh /etc/rc";
pub const DEFAULT_STOP: &str = "/bin/sh /etc/rc.shutdown";

pub fn default_console_log(name: &str) -> String {
    format!("/var/log/jail_{}_console.log", name)
}

/// Jail names double as dataset components and jail(8) names
pub fn validate_name(name: &str) -> Result<(), JailError> {
    if name.is_empty() {
        return Err(JailError::Validation("No jail name supplied.".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(JailError::Validation(format!(
            "Invalid jail name '{}': only alphanumeric, underscore, and hyphen characters allowed",
            name
        )));
    }
    Ok(())
}

pub fn validate_ipv4(addr: &str) -> Result<(), JailError> {
    addr.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| JailError::Validation(format!("Invalid IP address: {}", addr)))
}

/// Persisted configuration of a jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jail {
    pub name: String,
    pub hostname: String,
    pub ipv4_addr: String,
    pub path: String,
    pub template: String,
    pub allow_raw_sockets: bool,
    pub allow_mount: bool,
    pub allow_set_hostname: bool,
    pub allow_sysvipc: bool,
    pub clean: bool,
    pub console_log: String,
    pub jail_user: String,
    pub system_user: String,
    pub start: String,
    pub stop: String,
    pub use_defaults: bool,
    /// Clone backing this jail
    pub dataset: String,
    pub created_at: i64,
}

/// Request body for creating a jail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateJailRequest {
    pub name: Option<String>,
    pub template: Option<String>,
    pub hostname: Option<String>,
    pub ipv4_addr: Option<String>,
    pub allow_raw_sockets: Option<bool>,
    pub allow_mount: Option<bool>,
    pub allow_set_hostname: Option<bool>,
    pub allow_sysvipc: Option<bool>,
    pub clean: Option<bool>,
    pub console_log: Option<String>,
    pub jail_user: Option<String>,
    pub system_user: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    /// Ignore every non-identity field and use the defaults
    pub use_defaults: bool,
}

/// Identity fields of a request once presence has been checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailIdentity {
    pub name: String,
    pub template: String,
    pub hostname: String,
    pub ipv4_addr: String,
}

fn required(value: &Option<String>, message: &str) -> Result<String, JailError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(JailError::Validation(message.to_string())),
    }
}

impl CreateJailRequest {
    /// Check that the identity fields are present and well formed
    pub fn identity(&self) -> Result<JailIdentity, JailError> {
        let identity = JailIdentity {
            name: required(&self.name, "No jail name supplied.")?,
            template: required(&self.template, "No template supplied.")?,
            hostname: required(&self.hostname, "No hostname supplied.")?,
            ipv4_addr: required(&self.ipv4_addr, "No IP address supplied.")?,
        };
        validate_name(&identity.name)?;
        validate_ipv4(&identity.ipv4_addr)?;
        Ok(identity)
    }
}

impl Jail {
    /// Build the record for a new jail under the managed root.
    ///
    /// With `use_defaults` every non-identity field is a default. Otherwise
    /// supplied fields win and missing ones fall back to their default.
    pub fn configure(identity: JailIdentity, request: &CreateJailRequest, host: &HostConfig) -> Self {
        let overrides = if request.use_defaults {
            CreateJailRequest::default()
        } else {
            request.clone()
        };
        let path = format!("{}/{}", host.jest_dir.trim_end_matches('/'), identity.name);
        let dataset = format!("{}/{}", host.jest_dataset, identity.name);

        Self {
            console_log: overrides
                .console_log
                .unwrap_or_else(|| default_console_log(&identity.name)),
            allow_raw_sockets: overrides.allow_raw_sockets.unwrap_or(false),
            allow_mount: overrides.allow_mount.unwrap_or(false),
            allow_set_hostname: overrides.allow_set_hostname.unwrap_or(false),
            allow_sysvipc: overrides.allow_sysvipc.unwrap_or(false),
            clean: overrides.clean.unwrap_or(true),
            jail_user: overrides.jail_user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            system_user: overrides.system_user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            start: overrides.start.unwrap_or_else(|| DEFAULT_START.to_string()),
            stop: overrides.stop.unwrap_or_else(|| DEFAULT_STOP.to_string()),
            use_defaults: request.use_defaults,
            name: identity.name,
            hostname: identity.hostname,
            ipv4_addr: identity.ipv4_addr,
            template: identity.template,
            path,
            dataset,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// `key=value` parameters for `jail -c`, in the order jail(8) is given them
    pub fn start_params(&self) -> Vec<String> {
        let flag = |b: bool| if b { "1" } else { "0" };
        vec![
            format!("name={}", self.name),
            format!("allow.raw_sockets={}", flag(self.allow_raw_sockets)),
            format!("allow.mount={}", flag(self.allow_mount)),
            format!("allow.set_hostname={}", flag(self.allow_set_hostname)),
            format!("allow.sysvipc={}", flag(self.allow_sysvipc)),
            format!("exec.clean={}", flag(self.clean)),
            format!("exec.consolelog={}", self.console_log),
            format!("host.hostname={}", self.hostname),
            format!("ip4.addr={}", self.ipv4_addr),
            format!("exec.jail_user={}", self.jail_user),
            format!("path={}", self.path),
            format!("exec.system_user={}", self.system_user),
            format!("exec.start={}", self.start),
            format!("exec.stop={}", self.stop),
        ]
    }

    /// The start invocation as a shell would show it
    pub fn command_line(&self) -> String {
        let mut words = vec!["jail".to_string(), "-c".to_string()];
        words.extend(self.start_params());
        shell_words::join(words)
    }
}

/// Live state of a jail, derived from `jls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailState {
    pub name: String,
    pub running: bool,
    pub jid: Option<String>,
}

/// Drives jail(8) and jls(8)
#[derive(Clone)]
pub struct JailController {
    executor: BoxedExecutor,
}

impl std::fmt::Debug for JailController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JailController").finish_non_exhaustive()
    }
}

impl JailController {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    pub fn start(&self, jail: &Jail) -> Result<(), JailError> {
        debug!("{}", jail.command_line());
        self.executor
            .execute(Command::new("jail").arg("-c").args(jail.start_params()))?;
        info!("Started jail {}", jail.name);
        Ok(())
    }

    pub fn stop(&self, jid: &str) -> Result<(), JailError> {
        self.executor.execute(Command::new("jail").args(["-r", jid]))?;
        info!("Removed jail {}", jid);
        Ok(())
    }

    /// Find the jid of the jail named exactly `name`
    pub fn lookup_jid(&self, name: &str) -> Result<Option<String>, JailError> {
        let output = self.executor.execute(Command::new("jls").args(["-h", "jid", "name"]))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // First line is the header
        Ok(stdout.lines().skip(1).find_map(|line| {
            let mut cols = line.split_whitespace();
            let jid = cols.next()?;
            (cols.next()? == name).then(|| jid.to_string())
        }))
    }

    pub fn state(&self, name: &str) -> Result<JailState, JailError> {
        let jid = self.lookup_jid(name)?;
        Ok(JailState {
            name: name.to_string(),
            running: jid.is_some(),
            jid,
        })
    }
}

/// Jail operation errors
#[derive(Debug)]
pub enum JailError {
    Validation(String),
    NotFound(String),
    InvalidState(String),
    NotInitialised,
    Storage(ZfsError),
    Store(StoreError),
    HostControl(ExecutionError),
}

impl std::fmt::Display for JailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JailError::Validation(msg) => write!(f, "{}", msg),
            JailError::NotFound(name) => write!(f, "Jail not found: {}", name),
            JailError::InvalidState(msg) => write!(f, "Invalid jail state: {}", msg),
            JailError::NotInitialised => write!(f, "Jest is not initialised; bootstrap a template first"),
            JailError::Storage(e) => write!(f, "Storage error: {}", e),
            JailError::Store(e) => write!(f, "Store error: {}", e),
            JailError::HostControl(e) => write!(f, "Host control error: {}", e),
        }
    }
}

impl std::error::Error for JailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JailError::Storage(e) => Some(e),
            JailError::Store(e) => Some(e),
            JailError::HostControl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ZfsError> for JailError {
    fn from(e: ZfsError) -> Self {
        JailError::Storage(e)
    }
}

impl From<StoreError> for JailError {
    fn from(e: StoreError) -> Self {
        JailError::Store(e)
    }
}

impl From<ExecutionError> for JailError {
    fn from(e: ExecutionError) -> Self {
        JailError::HostControl(e)
    }
}
