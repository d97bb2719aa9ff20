//! Template records
//!
//! A template is a base distribution tree frozen in a `Ready` snapshot. The
//! record is written once the snapshot exists and afterwards only the
//! `disabled` flag changes.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{Collection, MetadataStore, StoreError, StoreTx};
use crate::zfs::READY_SNAPSHOT;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    /// Distribution version, e.g. `11.2-RELEASE`
    pub version: String,
    /// Mountpoint of the base tree
    pub path: String,
    /// Managed-root dataset the template lives under
    pub dataset: String,
    /// Dataset holding the base tree; its `Ready` snapshot is the clone origin
    pub base_dataset: String,
    pub compression: bool,
    #[serde(default)]
    pub disabled: bool,
    pub created_at: i64,
}

impl Template {
    pub fn snapshot_name(&self) -> String {
        format!("{}@{}", self.base_dataset, READY_SNAPSHOT)
    }

    /// Look up an enabled template by name inside an open transaction
    pub fn find_enabled(tx: &StoreTx<'_>, name: &str) -> Result<Option<Template>, StoreError> {
        Ok(tx
            .get::<Template>(Collection::Templates, name)?
            .filter(|template| !template.disabled))
    }
}

/// Read and toggle access to template records
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    store: MetadataStore,
}

impl TemplateRegistry {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// All templates in the order they were written
    pub fn list(&self) -> Result<Vec<Template>, TemplateError> {
        self.store.with_read_tx(|tx| {
            Ok(tx
                .scan::<Template>(Collection::Templates)?
                .into_iter()
                .map(|(_, template)| template)
                .collect())
        })
    }

    pub fn get(&self, name: &str) -> Result<Template, TemplateError> {
        self.store
            .with_read_tx(|tx| tx.get::<Template>(Collection::Templates, name))?
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    /// Flip the disabled flag. Jails already cloned from the template are
    /// unaffected; new jails cannot use a disabled template.
    pub fn set_disabled(&self, name: &str, disabled: bool) -> Result<Template, TemplateError> {
        let template = self.store.with_write_tx(|tx| {
            let mut template = tx
                .get::<Template>(Collection::Templates, name)?
                .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
            template.disabled = disabled;
            tx.put(Collection::Templates, name, &template)?;
            Ok::<_, TemplateError>(template)
        })?;

        info!("Template {} {}", name, if disabled { "disabled" } else { "enabled" });
        Ok(template)
    }
}
