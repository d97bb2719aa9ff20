//! ZFS wrapper for the datasets backing templates and jails
//!
//! This module drives the `zfs` command-line utility through an
//! [`Executor`](crate::executor::Executor). It creates filesystems, snapshots
//! and clones, reads and writes (user) properties singly or in parallel
//! batches, and discovers datasets by their `jest:*` tags.
//!
//! Nothing is cached here: every call reflects the current state of the host.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::string::FromUtf8Error;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::executor::{BoxedExecutor, ExecutionError};

pub type Result<T> = std::result::Result<T, ZfsError>;

const ZFS: &str = "zfs";
const LIST_COLUMNS: &str = "name,type,mountpoint,origin";

/// User property keys placed on managed datasets
pub mod tags {
    /// Managed-root discovery tag, valued with the managed-root directory
    pub const DIR: &str = "jest:dir";
    /// One of [`Role`](super::Role)
    pub const ROLE: &str = "jest:role";
    /// Distribution version of a base image
    pub const VERSION: &str = "jest:version";
    /// Owning template name
    pub const TEMPLATE: &str = "jest:template";
}

/// Label of the snapshot that makes a template cloneable
pub const READY_SNAPSHOT: &str = "Ready";

/// Value ZFS reports for an unset property
pub const UNSET: &str = "-";

/// Errors that can occur during ZFS operations
#[derive(Debug, Error)]
pub enum ZfsError {
    #[error("ZFS command failed: {0}")]
    CommandFailed(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Dataset already exists: {0}")]
    DatasetExists(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Mountpoint {mountpoint} already used by {dataset}")]
    MountpointInUse { mountpoint: String, dataset: String },

    #[error("Property '{property}' not set on {dataset}")]
    PropertyNotFound { dataset: String, property: String },

    #[error("Invalid dataset path: {0}")]
    InvalidPath(String),

    #[error("Invalid snapshot name: {0}")]
    InvalidSnapshot(String),

    #[error("Unexpected zfs output: {0}")]
    InvalidOutput(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(#[from] FromUtf8Error),
}

/// Purpose of a managed dataset, stored under [`tags::ROLE`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Root,
    BaseImage,
    JailInstance,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::BaseImage => "base-image",
            Role::JailInstance => "jail-instance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "root" => Some(Role::Root),
            "base-image" => Some(Role::BaseImage),
            "jail-instance" => Some(Role::JailInstance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
    Clone,
}

/// A node in the ZFS tree as reported by `zfs list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
    pub mountpoint: Option<PathBuf>,
    /// Origin snapshot; only set for clones
    pub origin: Option<String>,
}

impl Dataset {
    /// Parse one tab-separated line of `zfs list -H -o name,type,mountpoint,origin`
    fn parse(line: &str) -> Result<Self> {
        let cols: Vec<&str> = line.split('\t').collect();
        let [name, kind, mountpoint, origin, ..] = cols.as_slice() else {
            return Err(ZfsError::InvalidOutput(line.to_string()));
        };

        let origin = (*origin != UNSET && !origin.is_empty()).then(|| origin.to_string());
        let kind = match (*kind, &origin) {
            ("snapshot", _) => DatasetKind::Snapshot,
            (_, Some(_)) => DatasetKind::Clone,
            _ => DatasetKind::Filesystem,
        };
        let mountpoint = match *mountpoint {
            UNSET | "none" | "legacy" | "" => None,
            path => Some(PathBuf::from(path)),
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            mountpoint,
            origin,
        })
    }

    /// Split `pool/fs@label` into `("pool/fs", "label")`
    pub fn split_snapshot(name: &str) -> Option<(&str, &str)> {
        name.split_once('@')
    }
}

/// Outcome of [`Zfs::batch_set_properties`].
///
/// Failed keys do not roll back applied ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSetReport {
    pub applied: Vec<String>,
    /// Key and error message of every property that could not be set
    pub failed: Vec<(String, String)>,
}

impl BatchSetReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Size of the property worker pool: twice the available parallelism
fn worker_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

fn validate_name(name: &str) -> Result<()> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c.chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':'))
    };
    if name.is_empty() || !name.split('/').all(valid_component) {
        return Err(ZfsError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// ZFS dataset manager
///
/// # Example
///
/// ```no_run
/// use std::collections::BTreeMap;
/// use jest_backend::executor::HostExecutor;
/// use jest_backend::zfs::Zfs;
///
/// let zfs = Zfs::new(HostExecutor::new().as_executor());
///
/// let mut props = BTreeMap::new();
/// props.insert("mountpoint".to_string(), "/jest".to_string());
/// zfs.create_filesystem("zroot/jest", &props).unwrap();
///
/// let snap = zfs.snapshot("zroot/jest", "Ready").unwrap();
/// zfs.clone_snapshot(&snap.name, "zroot/jest/web1", &BTreeMap::new()).unwrap();
/// ```
#[derive(Clone)]
pub struct Zfs {
    executor: BoxedExecutor,
}

impl std::fmt::Debug for Zfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zfs").finish_non_exhaustive()
    }
}

impl Zfs {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    /// Run `zfs` with `args`, classifying failures against `subject`
    fn run(&self, args: &[&str], subject: &str) -> Result<String> {
        let mut cmd = Command::new(ZFS);
        cmd.args(args);
        debug!("zfs {}", args.join(" "));

        let output = self.executor.execute(&mut cmd).map_err(|e| match &e {
            ExecutionError::CommandFailure { stderr, .. } if stderr.contains("does not exist") => {
                ZfsError::DatasetNotFound(subject.to_string())
            }
            ExecutionError::CommandFailure { stderr, .. } if stderr.contains("already exists") => {
                ZfsError::DatasetExists(subject.to_string())
            }
            _ => ZfsError::CommandFailed(e.to_string()),
        })?;

        Ok(String::from_utf8(output.stdout)?)
    }

    /// Look up a single dataset, snapshot or clone by its full name
    pub fn get_dataset(&self, name: &str) -> Result<Dataset> {
        let stdout = self.run(&["list", "-H", "-p", "-t", "all", "-o", LIST_COLUMNS, name], name)?;
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| ZfsError::DatasetNotFound(name.to_string()))?;
        Dataset::parse(line)
    }

    /// Check if a dataset exists
    pub fn dataset_exists(&self, name: &str) -> Result<bool> {
        match self.get_dataset(name) {
            Ok(_) => Ok(true),
            Err(ZfsError::DatasetNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every dataset, snapshot and clone in every imported pool
    pub fn list_all(&self) -> Result<Vec<Dataset>> {
        let stdout = self.run(&["list", "-H", "-p", "-t", "all", "-o", LIST_COLUMNS], "")?;
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Dataset::parse)
            .collect()
    }

    /// Create a new filesystem dataset
    ///
    /// # Arguments
    ///
    /// * `name` - The full dataset path (e.g., "zroot/jest")
    /// * `props` - Properties passed as `-o key=value`, including `mountpoint`
    ///
    /// Fails with [`ZfsError::DatasetExists`] if the name is taken and with
    /// [`ZfsError::MountpointInUse`] if another dataset is mounted at the
    /// requested mountpoint.
    pub fn create_filesystem(&self, name: &str, props: &BTreeMap<String, String>) -> Result<Dataset> {
        validate_name(name)?;
        if self.dataset_exists(name)? {
            return Err(ZfsError::DatasetExists(name.to_string()));
        }

        if let Some(mountpoint) = props.get("mountpoint") {
            let wanted = PathBuf::from(mountpoint);
            if let Some(owner) = self
                .list_all()?
                .into_iter()
                .find(|d| d.mountpoint.as_ref() == Some(&wanted))
            {
                return Err(ZfsError::MountpointInUse {
                    mountpoint: mountpoint.clone(),
                    dataset: owner.name,
                });
            }
        }

        let opts: Vec<String> = props.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args = vec!["create"];
        for opt in &opts {
            args.push("-o");
            args.push(opt);
        }
        args.push(name);
        self.run(&args, name)?;

        debug!("Created dataset {}", name);
        self.get_dataset(name)
    }

    /// Set a single property on a dataset
    pub fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", key, value);
        self.run(&["set", &assignment, dataset], dataset)?;
        Ok(())
    }

    /// Read a single property
    ///
    /// Returns [`ZfsError::PropertyNotFound`] when ZFS reports the property as
    /// unset (`-`).
    pub fn get_property(&self, dataset: &str, key: &str) -> Result<String> {
        let stdout = self.run(&["get", "-H", "-p", "-o", "value", key, dataset], dataset)?;
        let value = stdout.trim();
        if value.is_empty() || value == UNSET {
            return Err(ZfsError::PropertyNotFound {
                dataset: dataset.to_string(),
                property: key.to_string(),
            });
        }
        Ok(value.to_string())
    }

    /// Set many properties in parallel.
    ///
    /// Each key is applied by its own blocking task; a failing key does not
    /// stop or undo the others. The returned report lists both outcomes.
    pub async fn batch_set_properties(
        &self,
        dataset: &str,
        properties: BTreeMap<String, String>,
    ) -> BatchSetReport {
        let work = properties.into_iter().collect();
        let results = self
            .fan_out(dataset, work, |zfs, dataset, key, value: String| {
                zfs.set_property(dataset, key, &value)
            })
            .await;

        let mut report = BatchSetReport::default();
        for (key, result) in results {
            match result {
                Ok(()) => report.applied.push(key),
                Err(e) => {
                    warn!("Failed to set {} on {}: {}", key, dataset, e);
                    report.failed.push((key, e.to_string()));
                }
            }
        }
        report.applied.sort();
        report.failed.sort();
        report
    }

    /// Read many properties in parallel.
    ///
    /// Keys whose lookup failed are left out of the result.
    pub async fn batch_get_properties(&self, dataset: &str, keys: &[&str]) -> BTreeMap<String, String> {
        let work = keys.iter().map(|k| (k.to_string(), ())).collect();
        let results = self
            .fan_out(dataset, work, |zfs, dataset, key, ()| zfs.get_property(dataset, key))
            .await;

        results
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(value) => Some((key, value)),
                Err(e) => {
                    warn!("Failed to get {} on {}: {}", key, dataset, e);
                    None
                }
            })
            .collect()
    }

    async fn fan_out<W, T, F>(&self, dataset: &str, work: Vec<(String, W)>, op: F) -> Vec<(String, Result<T>)>
    where
        W: Send + 'static,
        T: Send + 'static,
        F: Fn(&Zfs, &str, &str, W) -> Result<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let permits = Arc::new(Semaphore::new(worker_limit()));
        let mut set = JoinSet::new();

        for (key, item) in work {
            let zfs = self.clone();
            let dataset = dataset.to_string();
            let op = Arc::clone(&op);
            let permits = Arc::clone(&permits);

            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (key, Err(ZfsError::CommandFailed("property worker pool closed".to_string())));
                };
                let task_key = key.clone();
                let result = tokio::task::spawn_blocking(move || op(&zfs, &dataset, &task_key, item))
                    .await
                    .unwrap_or_else(|e| Err(ZfsError::CommandFailed(format!("property worker failed: {}", e))));
                (key, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Property task aborted: {}", e),
            }
        }
        results
    }

    /// Create `dataset@label`
    ///
    /// Idempotent: if the snapshot already exists and nothing has been
    /// written to the dataset since, the existing snapshot is returned. If
    /// the dataset changed afterwards, [`ZfsError::DatasetExists`] is
    /// returned instead of silently reusing a stale snapshot.
    ///
    /// # Arguments
    ///
    /// * `dataset` - The dataset to snapshot (e.g., "zroot/jest/.base")
    /// * `label` - The snapshot label (e.g., "Ready")
    pub fn snapshot(&self, dataset: &str, label: &str) -> Result<Dataset> {
        if label.is_empty() || label.contains(['@', '/']) {
            return Err(ZfsError::InvalidSnapshot(label.to_string()));
        }
        let full = format!("{}@{}", dataset, label);

        match self.get_dataset(&full) {
            Ok(existing) => {
                let written: u64 = self
                    .get_property(dataset, "written")?
                    .parse()
                    .map_err(|_| ZfsError::InvalidOutput(format!("written on {}", dataset)))?;
                if written == 0 {
                    debug!("Snapshot {} already exists and is current", full);
                    return Ok(existing);
                }
                return Err(ZfsError::DatasetExists(full));
            }
            Err(ZfsError::DatasetNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.run(&["snapshot", &full], dataset)?;
        debug!("Created snapshot {}", full);
        self.get_dataset(&full)
    }

    /// Clone a snapshot into a new writable dataset
    ///
    /// # Arguments
    ///
    /// * `snapshot` - The full snapshot path (e.g., "zroot/jest/.base@Ready")
    /// * `destination` - The new dataset (e.g., "zroot/jest/web1")
    /// * `props` - Properties for the clone, passed as `-o key=value`
    pub fn clone_snapshot(
        &self,
        snapshot: &str,
        destination: &str,
        props: &BTreeMap<String, String>,
    ) -> Result<Dataset> {
        self.find_snapshot(snapshot)?;
        validate_name(destination)?;
        if self.dataset_exists(destination)? {
            return Err(ZfsError::DatasetExists(destination.to_string()));
        }

        let opts: Vec<String> = props.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args = vec!["clone"];
        for opt in &opts {
            args.push("-o");
            args.push(opt);
        }
        args.push(snapshot);
        args.push(destination);
        self.run(&args, destination)?;

        debug!("Cloned {} to {}", snapshot, destination);
        self.get_dataset(destination)
    }

    /// Datasets carrying `tag` with a value other than the unset sentinel,
    /// paired with that value
    pub fn list_tagged(&self, tag: &str) -> Result<Vec<(Dataset, String)>> {
        let columns = format!("{},{}", LIST_COLUMNS, tag);
        let stdout = self.run(&["list", "-H", "-p", "-t", "all", "-o", &columns], "")?;

        let mut found = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let value = line.rsplit('\t').next().unwrap_or(UNSET).trim();
            if value.is_empty() || value == UNSET {
                continue;
            }
            found.push((Dataset::parse(line)?, value.to_string()));
        }
        Ok(found)
    }

    /// Scan all pools for datasets where `tag` is set
    pub fn find_by_tag(&self, tag: &str) -> Result<Vec<Dataset>> {
        Ok(self.list_tagged(tag)?.into_iter().map(|(d, _)| d).collect())
    }

    /// Exact lookup of `dataset@label`
    pub fn find_snapshot(&self, name: &str) -> Result<Dataset> {
        let Some((dataset, label)) = Dataset::split_snapshot(name) else {
            return Err(ZfsError::InvalidSnapshot(name.to_string()));
        };
        if dataset.is_empty() || label.is_empty() {
            return Err(ZfsError::InvalidSnapshot(name.to_string()));
        }

        match self.get_dataset(name) {
            Ok(d) if d.kind == DatasetKind::Snapshot => Ok(d),
            Ok(_) | Err(ZfsError::DatasetNotFound(_)) => Err(ZfsError::SnapshotNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Destroy a dataset or snapshot. Not recursive.
    pub fn destroy(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name], name)?;
        debug!("Destroyed {}", name);
        Ok(())
    }
}
