//! Template pipeline
//!
//! Turns a release version into a template: allocate the datasets, fetch
//! and verify the distribution archives, extract them, customize the tree,
//! then freeze it in a `Ready` snapshot. Nothing is rolled back on failure;
//! the datasets created so far are logged so an operator can clean up, and a
//! retry with the same request reuses them. A `Ready` snapshot without a
//! template record is discarded by the retry and taken again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chroot::ChrootError;
use crate::config::{HostConfig, JestConfig};
use crate::customize::{CustomizeError, CustomizeOptions, Customizer, append_missing_lines};
use crate::executor::ExecutionError;
use crate::mirror::{self, DIST_FILES, MANIFEST, Mirror, MirrorError};
use crate::store::{Collection, MetadataStore, StoreError};
use crate::template::Template;
use crate::zfs::{READY_SNAPSHOT, Role, Zfs, ZfsError, tags};

/// Line ensured in the host rc.conf once a template exists
pub const HOST_RC_LINES: &[&str] = &["jail_enable=\"YES\""];

fn default_architecture() -> String {
    "amd64".to_string()
}

/// Request to build a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// Template name; defaults to the version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Release version, e.g. `11.2-RELEASE`
    pub version: String,

    /// Managed-root dataset, e.g. `zroot/jest`
    pub dataset: String,

    /// Managed-root directory, e.g. `/jest`
    pub mountpoint: String,

    #[serde(default)]
    pub compression: bool,

    /// Run `freebsd-update` inside the new tree
    #[serde(default)]
    pub apply_updates: bool,

    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Mirror URL overriding the configured one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
}

impl BootstrapRequest {
    pub fn template_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.version)
    }

    pub fn base_dataset(&self) -> String {
        format!("{}/.{}", self.dataset, self.template_name())
    }

    pub fn base_mountpoint(&self) -> PathBuf {
        Path::new(&self.mountpoint).join(format!(".{}", self.template_name()))
    }

    pub fn validate(&self) -> Result<(), BootstrapError> {
        if !is_valid_version(&self.version) {
            return Err(BootstrapError::InvalidRequest(format!(
                "Invalid version: {}",
                self.version
            )));
        }

        let name = self.template_name();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(BootstrapError::InvalidRequest(format!("Invalid template name: {}", name)));
        }

        if self.dataset.is_empty() || self.dataset.starts_with('/') || self.dataset.ends_with('/') {
            return Err(BootstrapError::InvalidRequest(format!("Invalid dataset: {}", self.dataset)));
        }
        if !self.mountpoint.starts_with('/') {
            return Err(BootstrapError::InvalidRequest(format!(
                "Mountpoint must be absolute: {}",
                self.mountpoint
            )));
        }
        if self.architecture.is_empty() {
            return Err(BootstrapError::InvalidRequest("No architecture supplied.".to_string()));
        }

        Ok(())
    }
}

/// Versions look like `11.2-RELEASE`: digits, a dot, digits, a dash and an
/// upper-case alphanumeric tag. Any part may be empty.
pub fn is_valid_version(version: &str) -> bool {
    let Some((numbers, tag)) = version.split_once('-') else {
        return false;
    };
    let Some((major, minor)) = numbers.split_once('.') else {
        return false;
    };
    major.chars().all(|c| c.is_ascii_digit())
        && minor.chars().all(|c| c.is_ascii_digit())
        && tag.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Pipeline progress updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapProgress {
    pub status: BootstrapStatus,

    /// Progress percentage (0-100)
    pub progress: u8,

    /// Human-readable description of current step
    pub current_step: String,

    pub template: String,

    pub version: String,
}

/// Pipeline state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStatus {
    /// Creating and tagging datasets
    Allocating,
    /// Downloading distribution archives
    Fetching,
    /// Checking archives against the MANIFEST
    Verifying,
    /// Unpacking archives into the base tree
    Extracting,
    /// Preparing the tree for jails
    Customizing,
    /// Taking the Ready snapshot
    Snapshotting,
    /// Template persisted
    Ready,
    Failed(String),
}

impl BootstrapStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapStatus::Ready | BootstrapStatus::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Template already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(#[from] ZfsError),

    #[error("Failed to tag {dataset}: {}", describe_failures(.failed))]
    Tags {
        dataset: String,
        failed: Vec<(String, String)>,
    },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] MirrorError),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error(transparent)]
    Chroot(#[from] ChrootError),

    #[error("Host command failed: {0}")]
    HostCommand(#[from] ExecutionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Background task failed: {0}")]
    Task(String),
}

fn describe_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(key, e)| format!("{}: {}", key, e))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<CustomizeError> for BootstrapError {
    fn from(e: CustomizeError) -> Self {
        match e {
            CustomizeError::Io(e) => BootstrapError::Io(e),
            CustomizeError::Command(e) => BootstrapError::HostCommand(e),
            CustomizeError::Chroot(e) => BootstrapError::Chroot(e),
        }
    }
}

/// What a successful pipeline produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapOutcome {
    pub template: Template,
    pub root_dataset: String,
    pub base_dataset: String,
    pub snapshot: String,
    /// Root password of the base tree. Returned once and never stored.
    pub password: String,
}

/// Service-level settings the pipeline reads
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mirror_url: String,
    pub mirror_user: String,
    pub mirror_password: String,
    pub verify_checksums: bool,
    pub host_rc_conf: PathBuf,
    pub host_resolv_conf: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &JestConfig) -> Self {
        Self {
            mirror_url: config.mirror.url.clone(),
            mirror_user: config.mirror.user.clone(),
            mirror_password: config.mirror.password.clone(),
            verify_checksums: config.mirror.verify_checksums,
            host_rc_conf: PathBuf::from(&config.host.rc_conf),
            host_resolv_conf: PathBuf::from(&config.host.resolv_conf),
        }
    }
}

/// Run a blocking storage step off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, BootstrapError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BootstrapError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BootstrapError::Task(e.to_string()))?
}

fn extract_archive(archive: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(archive)?;
    let decompressor = xz2::read::XzDecoder::new(file);
    let mut tar = tar::Archive::new(decompressor);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
}

/// Wait for `expected` extraction reports and return at the first failure.
///
/// Reports still outstanding after a failure are drained and logged by a
/// detached task.
async fn await_extraction(
    mut rx: mpsc::Receiver<(&'static str, Result<(), String>)>,
    expected: usize,
) -> Result<(), BootstrapError> {
    let mut received = 0;
    while let Some((file, result)) = rx.recv().await {
        received += 1;
        if let Err(e) = result {
            warn!("Extraction of {} failed: {}", file, e);
            tokio::spawn(async move {
                while let Some((file, result)) = rx.recv().await {
                    match result {
                        Ok(()) => debug!("Extracted {} after an earlier failure", file),
                        Err(e) => warn!("Extraction of {} failed: {}", file, e),
                    }
                }
            });
            return Err(BootstrapError::Extraction(e));
        }
        debug!("Extracted {}", file);
    }

    if received != expected {
        return Err(BootstrapError::Extraction(format!(
            "{} of {} extraction tasks did not report",
            expected - received,
            expected
        )));
    }
    Ok(())
}

/// One template build. Consumed by [`TemplatePipeline::run`].
pub struct TemplatePipeline<M: Mirror> {
    zfs: Zfs,
    store: MetadataStore,
    mirror: M,
    customizer: Arc<dyn Customizer>,
    settings: PipelineSettings,
    progress_tx: Option<mpsc::Sender<BootstrapProgress>>,
    request: BootstrapRequest,
    created: Vec<String>,
}

impl<M: Mirror> TemplatePipeline<M> {
    pub fn new(
        zfs: Zfs,
        store: MetadataStore,
        mirror: M,
        customizer: Arc<dyn Customizer>,
        settings: PipelineSettings,
        request: BootstrapRequest,
    ) -> Self {
        Self {
            zfs,
            store,
            mirror,
            customizer,
            settings,
            progress_tx: None,
            request,
            created: Vec::new(),
        }
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<BootstrapProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    /// Run every stage in order
    pub async fn run(mut self) -> Result<BootstrapOutcome, BootstrapError> {
        match self.run_stages().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.report_progress(BootstrapStatus::Failed(e.to_string()), 100, "Bootstrap failed");
                if !self.created.is_empty() {
                    warn!(
                        "Template {} failed; datasets left in place: {}",
                        self.request.template_name(),
                        self.created.join(", ")
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self) -> Result<BootstrapOutcome, BootstrapError> {
        self.request.validate()?;
        self.ensure_template_absent()?;

        self.report_progress(BootstrapStatus::Allocating, 0, "Allocating datasets...");
        self.allocate_root().await?;
        self.allocate_base().await?;
        self.discard_unrecorded_snapshot().await?;
        let base_mountpoint = self.request.base_mountpoint();
        tokio::fs::create_dir_all(&base_mountpoint).await?;

        let archives = self.fetch(&base_mountpoint).await?;
        if self.settings.verify_checksums {
            self.verify(&archives).await?;
        }
        self.extract(&archives, &base_mountpoint).await?;
        for (_, path) in &archives {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        let password = self.customize(&base_mountpoint).await?;

        self.report_progress(BootstrapStatus::Snapshotting, 90, "Taking Ready snapshot...");
        let zfs = self.zfs.clone();
        let base = self.request.base_dataset();
        let snapshot = blocking(move || Ok(zfs.snapshot(&base, READY_SNAPSHOT)?)).await?;

        let template = self.persist().await?;

        self.report_progress(BootstrapStatus::Ready, 100, "Template ready");
        Ok(BootstrapOutcome {
            template,
            root_dataset: self.request.dataset.clone(),
            base_dataset: self.request.base_dataset(),
            snapshot: snapshot.name,
            password,
        })
    }

    fn ensure_template_absent(&self) -> Result<(), BootstrapError> {
        let name = self.request.template_name().to_string();
        let exists = self
            .store
            .with_read_tx(|tx| tx.get::<Template>(Collection::Templates, &name))?
            .is_some();
        if exists {
            return Err(BootstrapError::AlreadyExists(name));
        }
        Ok(())
    }

    /// Create the managed root, or reuse one already tagged as ours
    async fn allocate_root(&mut self) -> Result<(), BootstrapError> {
        let zfs = self.zfs.clone();
        let dataset = self.request.dataset.clone();
        let mountpoint = self.request.mountpoint.clone();
        let compression = self.request.compression;

        let created = blocking(move || {
            if zfs.dataset_exists(&dataset)? {
                let role = zfs.get_property(&dataset, tags::ROLE).ok();
                let existing = zfs.get_dataset(&dataset)?;
                if role.as_deref() != Some(Role::Root.as_str())
                    || existing.mountpoint.as_deref() != Some(Path::new(&mountpoint))
                {
                    return Err(BootstrapError::InvalidRequest(format!(
                        "Dataset {} already exists and is not a jest root at {}",
                        dataset, mountpoint
                    )));
                }
                debug!("Reusing root dataset {}", dataset);
                return Ok(false);
            }

            let mut props = BTreeMap::new();
            props.insert("mountpoint".to_string(), mountpoint);
            if compression {
                props.insert("compression".to_string(), "on".to_string());
            }
            zfs.create_filesystem(&dataset, &props)?;
            Ok(true)
        })
        .await?;

        let dataset = self.request.dataset.clone();
        if created {
            info!("Created root dataset {}", dataset);
            self.created.push(dataset.clone());
        }
        std::fs::create_dir_all(&self.request.mountpoint)?;

        let mut tag_set = BTreeMap::new();
        tag_set.insert(tags::ROLE.to_string(), Role::Root.as_str().to_string());
        tag_set.insert(tags::DIR.to_string(), self.request.mountpoint.clone());
        self.tag(&dataset, tag_set).await
    }

    /// Create the base dataset, or reuse one left by an earlier failed run
    async fn allocate_base(&mut self) -> Result<(), BootstrapError> {
        let zfs = self.zfs.clone();
        let base = self.request.base_dataset();
        let mountpoint = self.request.base_mountpoint().to_string_lossy().into_owned();
        let name = self.request.template_name().to_string();
        let compression = self.request.compression;

        let created = blocking(move || {
            if zfs.dataset_exists(&base)? {
                let role = zfs.get_property(&base, tags::ROLE).ok();
                let owner = zfs.get_property(&base, tags::TEMPLATE).ok();
                if role.as_deref() != Some(Role::BaseImage.as_str()) || owner.as_deref() != Some(name.as_str()) {
                    return Err(BootstrapError::Storage(ZfsError::DatasetExists(base)));
                }
                debug!("Reusing base dataset {}", base);
                return Ok(false);
            }

            let mut props = BTreeMap::new();
            props.insert("mountpoint".to_string(), mountpoint);
            if compression {
                props.insert("compression".to_string(), "on".to_string());
            }
            zfs.create_filesystem(&base, &props)?;
            Ok(true)
        })
        .await?;

        let base = self.request.base_dataset();
        if created {
            info!("Created base dataset {}", base);
            self.created.push(base.clone());
        }

        let mut tag_set = BTreeMap::new();
        tag_set.insert(tags::ROLE.to_string(), Role::BaseImage.as_str().to_string());
        tag_set.insert(tags::VERSION.to_string(), self.request.version.clone());
        tag_set.insert(tags::TEMPLATE.to_string(), self.request.template_name().to_string());
        self.tag(&base, tag_set).await
    }

    /// Destroy a `Ready` snapshot left by a run that failed after taking it.
    ///
    /// The template has no record (checked on entry), so nothing was cloned
    /// from the snapshot. The tree is rebuilt and snapshotted again, so the
    /// snapshot always holds the password this run returns.
    async fn discard_unrecorded_snapshot(&self) -> Result<(), BootstrapError> {
        let zfs = self.zfs.clone();
        let snapshot = format!("{}@{}", self.request.base_dataset(), READY_SNAPSHOT);
        blocking(move || match zfs.find_snapshot(&snapshot) {
            Ok(_) => {
                warn!("Destroying {} left by an unfinished bootstrap", snapshot);
                zfs.destroy(&snapshot)?;
                Ok(())
            }
            Err(ZfsError::SnapshotNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn tag(&self, dataset: &str, tag_set: BTreeMap<String, String>) -> Result<(), BootstrapError> {
        let report = self.zfs.batch_set_properties(dataset, tag_set).await;
        if !report.is_complete() {
            return Err(BootstrapError::Tags {
                dataset: dataset.to_string(),
                failed: report.failed,
            });
        }
        Ok(())
    }

    /// Download every archive into `dest`, in order
    async fn fetch(&mut self, dest: &Path) -> Result<Vec<(&'static str, PathBuf)>, BootstrapError> {
        let site = self
            .request
            .mirror
            .clone()
            .unwrap_or_else(|| self.settings.mirror_url.clone());
        self.report_progress(BootstrapStatus::Fetching, 5, &format!("Connecting to {}...", site));

        self.mirror.connect(&site).await?;
        self.mirror
            .login(&self.settings.mirror_user, &self.settings.mirror_password)
            .await?;

        let mut archives = Vec::with_capacity(DIST_FILES.len());
        for (i, file) in DIST_FILES.iter().enumerate() {
            let progress = 10 + (i * 30 / DIST_FILES.len()) as u8;
            self.report_progress(BootstrapStatus::Fetching, progress, &format!("Downloading {}...", file));

            let remote = mirror::release_path(&self.request.architecture, &self.request.version, file);
            let path = dest.join(file);
            mirror::fetch_to_file(&self.mirror, &remote, &path).await?;
            archives.push((*file, path));
        }
        Ok(archives)
    }

    async fn verify(&self, archives: &[(&'static str, PathBuf)]) -> Result<(), BootstrapError> {
        self.report_progress(BootstrapStatus::Verifying, 40, "Verifying checksums...");

        let remote = mirror::release_path(&self.request.architecture, &self.request.version, MANIFEST);
        let manifest = mirror::parse_manifest(&mirror::fetch_to_string(&self.mirror, &remote).await?);
        for (file, path) in archives {
            mirror::verify_checksum(&manifest, file, path).await?;
        }

        info!("Verified {} archives", archives.len());
        Ok(())
    }

    /// Unpack all archives in parallel, failing on the first bad archive
    async fn extract(&self, archives: &[(&'static str, PathBuf)], dest: &Path) -> Result<(), BootstrapError> {
        self.report_progress(BootstrapStatus::Extracting, 50, "Extracting distribution archives...");

        let (tx, rx) = mpsc::channel(archives.len().max(1));
        for (file, path) in archives {
            let tx = tx.clone();
            let file = *file;
            let path = path.clone();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let result = extract_archive(&path, &dest).map_err(|e| format!("{}: {}", file, e));
                // A gone receiver means an earlier archive already failed
                let _ = tx.blocking_send((file, result));
            });
        }
        drop(tx);

        await_extraction(rx, archives.len()).await?;
        self.report_progress(BootstrapStatus::Extracting, 70, "Extraction complete");
        Ok(())
    }

    async fn customize(&self, base_mountpoint: &Path) -> Result<String, BootstrapError> {
        self.report_progress(BootstrapStatus::Customizing, 75, "Customizing base tree...");

        let options = CustomizeOptions {
            resolv_conf: tokio::fs::read(&self.settings.host_resolv_conf).await?,
            apply_updates: self.request.apply_updates,
        };
        let customizer = Arc::clone(&self.customizer);
        let mountpoint = base_mountpoint.to_path_buf();
        blocking(move || Ok(customizer.customize(&mountpoint, &options)?)).await
    }

    /// Record the template and the managed root once the snapshot exists
    async fn persist(&self) -> Result<Template, BootstrapError> {
        let rc_conf = self.settings.host_rc_conf.clone();
        let appended = blocking(move || Ok(append_missing_lines(&rc_conf, HOST_RC_LINES)?)).await?;
        if appended > 0 {
            info!("Enabled jails in {}", self.settings.host_rc_conf.display());
        }

        let template = Template {
            name: self.request.template_name().to_string(),
            version: self.request.version.clone(),
            path: self.request.base_mountpoint().to_string_lossy().into_owned(),
            dataset: self.request.dataset.clone(),
            base_dataset: self.request.base_dataset(),
            compression: self.request.compression,
            disabled: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        let host = HostConfig {
            jest_dir: self.request.mountpoint.clone(),
            jest_dataset: self.request.dataset.clone(),
            disabled: false,
        };

        let store = self.store.clone();
        let record = template.clone();
        blocking(move || {
            store.with_write_tx(|tx| {
                if tx.get::<Template>(Collection::Templates, &record.name)?.is_some() {
                    return Err(BootstrapError::AlreadyExists(record.name.clone()));
                }
                tx.put(Collection::Templates, &record.name, &record)?;
                if HostConfig::load_authoritative(tx)?.as_ref() != Some(&host) {
                    host.append(tx)?;
                }
                Ok(())
            })
        })
        .await?;

        info!("Template {} ready at {}", template.name, template.snapshot_name());
        Ok(template)
    }

    fn report_progress(&self, status: BootstrapStatus, progress: u8, step: &str) {
        info!("[{:?}] {}% - {}", status, progress, step);

        if let Some(tx) = &self.progress_tx {
            // A slow or gone receiver only loses updates
            let _ = tx.try_send(BootstrapProgress {
                status,
                progress,
                current_step: step.to_string(),
                template: self.request.template_name().to_string(),
                version: self.request.version.clone(),
            });
        }
    }
}
