//! Jest backend - ZFS-backed FreeBSD jail provisioning service
//!
//! Builds templates (base distribution trees frozen in a ZFS snapshot) and
//! provisions jails as clones of them. Clients talk to the service through
//! a unix socket; see [`server`].

pub mod api;
pub mod bootstrap;
pub mod chroot;
pub mod config;
pub mod customize;
pub mod executor;
pub mod fakes;
pub mod handler;
pub mod jail;
pub mod lifecycle;
pub mod mirror;
pub mod server;
pub mod store;
pub mod template;
pub mod zfs;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};

use crate::bootstrap::{
    BootstrapError, BootstrapOutcome, BootstrapProgress, BootstrapRequest, BootstrapStatus, PipelineSettings, TemplatePipeline,
};
use crate::config::{HostConfig, JestConfig};
use crate::customize::{ChrootCustomizer, Customizer};
use crate::executor::{BoxedExecutor, HostExecutor};
use crate::jail::JailController;
use crate::lifecycle::JailManager;
use crate::mirror::{HttpMirror, Mirror};
use crate::store::{Collection, MetadataStore, StoreError};
use crate::template::TemplateRegistry;
use crate::zfs::{Dataset, Zfs, ZfsError, tags};

/// Errors raised while assembling the service
#[derive(Debug, thiserror::Error)]
pub enum JestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a managed root has been found on this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitStatus {
    pub initialised: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jest_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jest_dataset: Option<String>,
}

/// A dataset carrying one or more `jest:*` tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedDataset {
    pub dataset: Dataset,
    pub tags: BTreeMap<String, String>,
}

impl InitStatus {
    fn from_host(host: Option<HostConfig>) -> Self {
        match host {
            Some(host) => Self {
                initialised: true,
                jest_dir: Some(host.jest_dir),
                jest_dataset: Some(host.jest_dataset),
            },
            None => Self::default(),
        }
    }
}

/// Managed roots found by their `jest:dir` tag
fn discover(zfs: &Zfs) -> Result<Vec<HostConfig>, ZfsError> {
    Ok(zfs
        .list_tagged(tags::DIR)?
        .into_iter()
        .map(|(dataset, dir)| HostConfig {
            jest_dir: dir,
            jest_dataset: dataset.name,
            disabled: false,
        })
        .collect())
}

/// Make a discovered root the authoritative host config.
///
/// The current record is kept when it names one of the roots; otherwise the
/// first root is appended.
fn adopt_root(store: &MetadataStore, roots: &[HostConfig]) -> Result<(), StoreError> {
    if roots.len() > 1 {
        warn!("Several datasets carry {}", tags::DIR);
    }
    store.with_write_tx(|tx| {
        let current = HostConfig::load_authoritative(tx)?;
        if let Some(current) = current.filter(|c| roots.contains(c)) {
            info!("Managed root found at {}", current.jest_dir);
            return Ok(());
        }
        if let Some(root) = roots.first() {
            info!("Managed root found at {}; recording it", root.jest_dir);
            root.append(tx)?;
        }
        Ok(())
    })
}

/// Service context shared by every request
pub struct Jest {
    config: JestConfig,
    zfs: Zfs,
    store: MetadataStore,
    jails: JailManager,
    templates: TemplateRegistry,
    customizer: Arc<dyn Customizer>,
    bootstrap_progress: Arc<RwLock<HashMap<String, BootstrapProgress>>>,
    // Customization switches the process root, so bootstraps run one at a time
    bootstrap_lock: Mutex<()>,
}

impl Jest {
    /// Assemble the service on top of `executor`.
    ///
    /// Opens (creating if needed) the metadata store and looks for a tagged
    /// managed root, which becomes the authoritative host config. A failed
    /// lookup leaves the stored config as it is.
    pub fn new(config: JestConfig, executor: BoxedExecutor, customizer: Arc<dyn Customizer>) -> Result<Self, JestError> {
        let db_path = Path::new(&config.storage.database_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = MetadataStore::new(db_path)?;
        let zfs = Zfs::new(executor.clone());

        match discover(&zfs) {
            Ok(roots) if roots.is_empty() => info!("No managed root found; bootstrap a template to initialise"),
            Ok(roots) => adopt_root(&store, &roots)?,
            Err(e) => warn!("Managed root discovery failed: {}", e),
        }

        Ok(Self {
            jails: JailManager::new(zfs.clone(), store.clone(), JailController::new(executor)),
            templates: TemplateRegistry::new(store.clone()),
            config,
            zfs,
            store,
            customizer,
            bootstrap_progress: Arc::new(RwLock::new(HashMap::new())),
            bootstrap_lock: Mutex::new(()),
        })
    }

    /// Assemble the service against the real host
    pub fn for_host(config: JestConfig) -> Result<Self, JestError> {
        let executor = HostExecutor::new().as_executor();
        let customizer = Arc::new(ChrootCustomizer::new(executor.clone()));
        Self::new(config, executor, customizer)
    }

    pub fn config(&self) -> &JestConfig {
        &self.config
    }

    pub fn jails(&self) -> &JailManager {
        &self.jails
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Initialised means an authoritative host config exists; jail creation
    /// is gated on the same record
    pub fn init_status(&self) -> Result<InitStatus, StoreError> {
        self.store
            .with_read_tx(|tx| HostConfig::load_authoritative(tx))
            .map(InitStatus::from_host)
    }

    /// Every dataset carrying a `jest:*` tag, with its tag values
    pub fn tagged_datasets(&self) -> Result<Vec<TaggedDataset>, ZfsError> {
        let mut found: BTreeMap<String, TaggedDataset> = BTreeMap::new();
        for tag in [tags::DIR, tags::ROLE, tags::VERSION, tags::TEMPLATE] {
            for (dataset, value) in self.zfs.list_tagged(tag)? {
                found
                    .entry(dataset.name.clone())
                    .or_insert_with(|| TaggedDataset {
                        dataset,
                        tags: BTreeMap::new(),
                    })
                    .tags
                    .insert(tag.to_string(), value);
            }
        }
        Ok(found.into_values().collect())
    }

    /// Host config records in write order
    pub fn host_configs(&self) -> Result<Vec<(String, HostConfig)>, StoreError> {
        self.store.with_read_tx(|tx| tx.scan::<HostConfig>(Collection::Config))
    }

    pub async fn bootstrap_progress(&self, name: &str) -> Option<BootstrapProgress> {
        self.bootstrap_progress.read().await.get(name).cloned()
    }

    /// Build a template, fetching from `mirror`
    pub async fn bootstrap<M: Mirror + 'static>(
        &self,
        mirror: M,
        request: BootstrapRequest,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let name = request.template_name().to_string();
        {
            let mut progress = self.bootstrap_progress.write().await;
            if progress.get(&name).is_some_and(|p| !p.status.is_terminal()) {
                return Err(BootstrapError::AlreadyExists(format!("{} (bootstrap in progress)", name)));
            }
            // Claim the name before the pipeline reports anything
            progress.insert(
                name.clone(),
                BootstrapProgress {
                    status: BootstrapStatus::Allocating,
                    progress: 0,
                    current_step: "Queued".to_string(),
                    template: name.clone(),
                    version: request.version.clone(),
                },
            );
        }

        let _running = self.bootstrap_lock.lock().await;

        let (progress_tx, mut progress_rx) = mpsc::channel::<BootstrapProgress>(32);
        let progress_map = Arc::clone(&self.bootstrap_progress);
        let collector = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                progress_map
                    .write()
                    .await
                    .insert(progress.template.clone(), progress);
            }
        });

        let pipeline = TemplatePipeline::new(
            self.zfs.clone(),
            self.store.clone(),
            mirror,
            Arc::clone(&self.customizer),
            PipelineSettings::from_config(&self.config),
            request,
        )
        .with_progress(progress_tx);
        let result = pipeline.run().await;

        // The pipeline held the only sender; the collector drains and stops
        if let Err(e) = collector.await {
            warn!("Progress collector for {} failed: {}", name, e);
        }

        result
    }

    /// Build a template from the configured (or requested) HTTP mirror
    pub async fn bootstrap_from_mirror(&self, request: BootstrapRequest) -> Result<BootstrapOutcome, BootstrapError> {
        let mirror = HttpMirror::new(Duration::from_secs(self.config.mirror.timeout))?;
        self.bootstrap(mirror, request).await
    }
}
