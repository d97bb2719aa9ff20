//! Jail lifecycle
//!
//! Create validates a request against every stored jail, clones the
//! template's `Ready` snapshot and persists the configuration. Start, stop
//! and status talk to the host through [`JailController`]. Delete only
//! forgets the configuration; the clone is destroyed by a separate, explicit
//! call once the jail is gone and stopped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::jail::{CreateJailRequest, Jail, JailController, JailError, JailIdentity, JailState};
use crate::store::{Collection, MetadataStore, StoreTx};
use crate::template::Template;
use crate::zfs::{Role, Zfs, ZfsError, tags};

/// A stored jail with its live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailView {
    /// Durable identity of the record
    pub key: String,
    pub config: Jail,
    pub state: JailState,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped(JailState),
    NotRunning(JailState),
}

/// Reject `identity` if any stored jail shares its hostname, name or address.
///
/// Records are checked in write order; within a record the hostname is
/// checked first, then the name, then the address.
fn check_unique(tx: &StoreTx<'_>, identity: &JailIdentity) -> Result<(), JailError> {
    for (_, jail) in tx.scan::<Jail>(Collection::Jails)? {
        if jail.hostname == identity.hostname {
            return Err(JailError::Validation(format!(
                "Hostname already in use: {}.",
                identity.hostname
            )));
        }
        if jail.name == identity.name {
            return Err(JailError::Validation(format!("Jail name already in use: {}.", identity.name)));
        }
        if jail.ipv4_addr == identity.ipv4_addr {
            return Err(JailError::Validation(format!(
                "IP address already in use: {}.",
                identity.ipv4_addr
            )));
        }
    }
    Ok(())
}

fn find_by_name(tx: &StoreTx<'_>, name: &str) -> Result<Option<(String, Jail)>, JailError> {
    Ok(tx
        .scan::<Jail>(Collection::Jails)?
        .into_iter()
        .find(|(_, jail)| jail.name == name))
}

/// Jail operations over the dataset manager, the store and the host
#[derive(Debug, Clone)]
pub struct JailManager {
    zfs: Zfs,
    store: MetadataStore,
    controller: JailController,
}

impl JailManager {
    pub fn new(zfs: Zfs, store: MetadataStore, controller: JailController) -> Self {
        Self {
            zfs,
            store,
            controller,
        }
    }

    /// Validate, clone and persist a new jail
    pub fn create(&self, request: &CreateJailRequest) -> Result<JailView, JailError> {
        let identity = request.identity()?;

        let (host, template) = self.store.with_read_tx(|tx| {
            let host = HostConfig::load_authoritative(tx)?.ok_or(JailError::NotInitialised)?;
            check_unique(tx, &identity)?;
            let template = Template::find_enabled(tx, &identity.template)?
                .ok_or_else(|| JailError::Validation(format!("Invalid template: {}", identity.template)))?;
            Ok::<_, JailError>((host, template))
        })?;

        let snapshot = self.zfs.find_snapshot(&template.snapshot_name())?;
        let jail = Jail::configure(identity.clone(), request, &host);

        let mut props = BTreeMap::new();
        props.insert("mountpoint".to_string(), jail.path.clone());
        props.insert(tags::ROLE.to_string(), Role::JailInstance.as_str().to_string());
        props.insert(tags::TEMPLATE.to_string(), template.name.clone());
        match self.zfs.get_property(&template.base_dataset, "compression") {
            Ok(value) if value != "off" => {
                props.insert("compression".to_string(), value);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read compression of {}: {}", template.base_dataset, e),
        }

        self.zfs.clone_snapshot(&snapshot.name, &jail.dataset, &props)?;
        info!("Cloned {} to {}", snapshot.name, jail.dataset);

        let key = Uuid::new_v4().to_string();
        let persisted = self.store.with_write_tx(|tx| {
            // Another create may have committed since the first check
            check_unique(tx, &identity)?;
            tx.put(Collection::Jails, &key, &jail)?;
            Ok::<_, JailError>(())
        });
        if let Err(e) = persisted {
            warn!("Jail {} not recorded; clone {} left in place: {}", jail.name, jail.dataset, e);
            return Err(e);
        }

        info!("Created jail {} ({})", jail.name, key);
        // The record is committed; a failed state query must not undo that
        let state = self.controller.state(&jail.name).unwrap_or_else(|e| {
            warn!("Could not read state of new jail {}: {}", jail.name, e);
            JailState {
                name: jail.name.clone(),
                running: false,
                jid: None,
            }
        });
        Ok(JailView {
            key,
            config: jail,
            state,
        })
    }

    /// Every stored jail with its live state, in creation order
    pub fn list(&self) -> Result<Vec<JailView>, JailError> {
        let records = self.store.with_read_tx(|tx| Ok::<_, JailError>(tx.scan::<Jail>(Collection::Jails)?))?;
        records
            .into_iter()
            .map(|(key, config)| {
                let state = self.controller.state(&config.name)?;
                Ok(JailView { key, config, state })
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<JailView, JailError> {
        let (key, config) = self
            .store
            .with_read_tx(|tx| find_by_name(tx, name))?
            .ok_or_else(|| JailError::NotFound(name.to_string()))?;
        let state = self.controller.state(name)?;
        Ok(JailView { key, config, state })
    }

    pub fn status(&self, name: &str) -> Result<JailState, JailError> {
        Ok(self.get(name)?.state)
    }

    pub fn start(&self, name: &str) -> Result<JailView, JailError> {
        let view = self.get(name)?;
        if view.state.running {
            return Err(JailError::InvalidState(format!("Jail {} is already running", name)));
        }

        self.controller.start(&view.config)?;
        let state = self.controller.state(name)?;
        Ok(JailView { state, ..view })
    }

    /// Stop a jail. A jail that is not running is reported, not an error.
    pub fn stop(&self, name: &str) -> Result<StopOutcome, JailError> {
        self.store
            .with_read_tx(|tx| find_by_name(tx, name))?
            .ok_or_else(|| JailError::NotFound(name.to_string()))?;

        let Some(jid) = self.controller.lookup_jid(name)? else {
            info!("Jail {} is not running", name);
            return Ok(StopOutcome::NotRunning(JailState {
                name: name.to_string(),
                running: false,
                jid: None,
            }));
        };

        self.controller.stop(&jid)?;
        Ok(StopOutcome::Stopped(self.controller.state(name)?))
    }

    /// Forget a jail's configuration. The clone stays.
    pub fn delete(&self, name: &str) -> Result<Jail, JailError> {
        let jail = self.store.with_write_tx(|tx| {
            let (key, jail) = find_by_name(tx, name)?.ok_or_else(|| JailError::NotFound(name.to_string()))?;
            tx.delete(Collection::Jails, &key)?;
            Ok::<_, JailError>(jail)
        })?;

        info!("Deleted jail record {}; dataset {} kept", name, jail.dataset);
        Ok(jail)
    }

    /// Destroy the clone left behind by a deleted jail
    pub fn destroy_dataset(&self, name: &str) -> Result<String, JailError> {
        crate::jail::validate_name(name)?;

        let host = self.store.with_read_tx(|tx| {
            if find_by_name(tx, name)?.is_some() {
                return Err(JailError::InvalidState(format!(
                    "Jail {} still has a record; delete it first",
                    name
                )));
            }
            HostConfig::load_authoritative(tx)?.ok_or(JailError::NotInitialised)
        })?;

        if self.controller.state(name)?.running {
            return Err(JailError::InvalidState(format!("Jail {} is running", name)));
        }

        let dataset = format!("{}/{}", host.jest_dataset, name);
        let role = match self.zfs.get_property(&dataset, tags::ROLE) {
            Ok(role) => Some(role),
            Err(ZfsError::PropertyNotFound { .. }) => None,
            Err(ZfsError::DatasetNotFound(_)) => return Err(JailError::NotFound(dataset)),
            Err(e) => return Err(e.into()),
        };
        if role.as_deref() != Some(Role::JailInstance.as_str()) {
            return Err(JailError::InvalidState(format!("{} is not a jail instance dataset", dataset)));
        }

        self.zfs.destroy(&dataset)?;
        info!("Destroyed jail dataset {}", dataset);
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;
    use crate::store::StoreError;
    use crate::zfs::READY_SNAPSHOT;

    struct Fixture {
        _dir: tempfile::TempDir,
        fake: FakeHost,
        manager: JailManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHost::new();
        let zfs = Zfs::new(fake.executor());
        let store = MetadataStore::new(dir.path().join("jest.db")).unwrap();

        let mut props = BTreeMap::new();
        props.insert("mountpoint".to_string(), "/jest".to_string());
        zfs.create_filesystem("zroot/jest", &props).unwrap();
        zfs.create_filesystem("zroot/jest/.base", &BTreeMap::new()).unwrap();
        zfs.snapshot("zroot/jest/.base", READY_SNAPSHOT).unwrap();

        store
            .with_write_tx(|tx| {
                tx.put(
                    Collection::Templates,
                    "base",
                    &Template {
                        name: "base".to_string(),
                        version: "11.2-RELEASE".to_string(),
                        path: "/jest/.base".to_string(),
                        dataset: "zroot/jest".to_string(),
                        base_dataset: "zroot/jest/.base".to_string(),
                        compression: false,
                        disabled: false,
                        created_at: 0,
                    },
                )?;
                HostConfig {
                    jest_dir: "/jest".to_string(),
                    jest_dataset: "zroot/jest".to_string(),
                    disabled: false,
                }
                .append(tx)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let manager = JailManager::new(zfs, store, JailController::new(fake.executor()));
        Fixture { _dir: dir, fake, manager }
    }

    fn request(name: &str, hostname: &str, ip: &str) -> CreateJailRequest {
        CreateJailRequest {
            name: Some(name.to_string()),
            template: Some("base".to_string()),
            hostname: Some(hostname.to_string()),
            ipv4_addr: Some(ip.to_string()),
            use_defaults: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_clones_and_tags() {
        let f = fixture();
        let view = f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap();

        assert_eq!(view.config.dataset, "zroot/jest/web1");
        assert!(!view.state.running);
        assert_eq!(f.fake.property("zroot/jest/web1", "origin").as_deref(), Some("zroot/jest/.base@Ready"));
        assert_eq!(f.fake.property("zroot/jest/web1", "mountpoint").as_deref(), Some("/jest/web1"));
        assert_eq!(f.fake.property("zroot/jest/web1", tags::ROLE).as_deref(), Some("jail-instance"));
        assert_eq!(f.fake.property("zroot/jest/web1", tags::TEMPLATE).as_deref(), Some("base"));
    }

    #[test]
    fn test_collision_order_within_record() {
        let f = fixture();
        f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap();

        // Everything collides: the hostname is reported first
        let err = f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap_err();
        assert_eq!(err.to_string(), "Hostname already in use: web1.example.");

        let err = f.manager.create(&request("web1", "other.example", "10.0.0.5")).unwrap_err();
        assert_eq!(err.to_string(), "Jail name already in use: web1.");

        let err = f.manager.create(&request("web2", "other.example", "10.0.0.5")).unwrap_err();
        assert_eq!(err.to_string(), "IP address already in use: 10.0.0.5.");

        assert!(!f.fake.dataset_names().contains(&"zroot/jest/web2".to_string()));
    }

    #[test]
    fn test_create_succeeds_when_state_query_fails() {
        let f = fixture();
        f.fake.fail_program("jls");

        let view = f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap();
        assert_eq!(view.config.name, "web1");
        assert!(!view.state.running);
        assert_eq!(view.state.jid, None);

        // The jail is recorded, so the same request now collides
        let err = f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap_err();
        assert_eq!(err.to_string(), "Hostname already in use: web1.example.");
    }

    #[test]
    fn test_unknown_or_disabled_template() {
        let f = fixture();
        let mut req = request("web1", "web1.example", "10.0.0.5");
        req.template = Some("missing".to_string());
        let err = f.manager.create(&req).unwrap_err();
        assert_eq!(err.to_string(), "Invalid template: missing");

        crate::template::TemplateRegistry::new(f.manager.store.clone())
            .set_disabled("base", true)
            .unwrap();
        let err = f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid template: base");
    }

    #[test]
    fn test_not_initialised_without_host_config() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHost::new();
        let store = MetadataStore::new(dir.path().join("jest.db")).unwrap();
        let manager = JailManager::new(Zfs::new(fake.executor()), store, JailController::new(fake.executor()));

        let err = manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap_err();
        assert!(matches!(err, JailError::NotInitialised));
    }

    #[test]
    fn test_start_stop_cycle() {
        let f = fixture();
        f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap();

        let outcome = f.manager.stop("web1").unwrap();
        assert!(matches!(outcome, StopOutcome::NotRunning(ref s) if !s.running));

        let started = f.manager.start("web1").unwrap();
        assert!(started.state.running);
        assert!(matches!(f.manager.start("web1"), Err(JailError::InvalidState(_))));

        let outcome = f.manager.stop("web1").unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped(ref s) if !s.running));
        assert!(matches!(f.manager.stop("nope"), Err(JailError::NotFound(_))));
    }

    #[test]
    fn test_delete_then_destroy_dataset() {
        let f = fixture();
        f.manager.create(&request("web1", "web1.example", "10.0.0.5")).unwrap();

        assert!(matches!(f.manager.destroy_dataset("web1"), Err(JailError::InvalidState(_))));

        f.manager.delete("web1").unwrap();
        assert!(matches!(f.manager.delete("web1"), Err(JailError::NotFound(_))));
        assert!(f.fake.dataset_names().contains(&"zroot/jest/web1".to_string()));

        assert_eq!(f.manager.destroy_dataset("web1").unwrap(), "zroot/jest/web1");
        assert!(!f.fake.dataset_names().contains(&"zroot/jest/web1".to_string()));
        assert!(matches!(f.manager.destroy_dataset("web1"), Err(JailError::NotFound(_))));
    }

    #[test]
    fn test_destroy_dataset_refuses_non_instances() {
        let f = fixture();
        // The base dataset is not a jail instance
        let err = f.manager.destroy_dataset(".base").unwrap_err();
        assert!(matches!(err, JailError::Validation(_)));

        // An empty name would address the managed root itself
        let err = f.manager.destroy_dataset("").unwrap_err();
        assert!(matches!(err, JailError::Validation(_)));
        assert!(f.fake.dataset_names().contains(&"zroot/jest".to_string()));

        f.manager.zfs.create_filesystem("zroot/jest/scratch", &BTreeMap::new()).unwrap();
        let err = f.manager.destroy_dataset("scratch").unwrap_err();
        assert!(matches!(err, JailError::InvalidState(_)));
    }
}
