//! Template pipeline against a fake host and an in-memory mirror

mod common;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{FakeMirror, RESOLV_CONF, TestEnv, VERSION, release_archives};
use jest_backend::bootstrap::{BootstrapError, BootstrapStatus};
use jest_backend::customize::{CustomizeError, CustomizeOptions, Customizer, DirectCustomizer};
use jest_backend::mirror::MirrorError;
use jest_backend::zfs::tags;

fn count_lines(path: &std::path::Path, line: &str) -> usize {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| l.trim() == line)
        .count()
}

#[tokio::test]
async fn test_bootstrap_builds_ready_template() {
    let env = TestEnv::new();
    let outcome = env.bootstrap("base").await;

    assert_eq!(outcome.root_dataset, "zroot/jest");
    assert_eq!(outcome.base_dataset, "zroot/jest/.base");
    assert_eq!(outcome.snapshot, "zroot/jest/.base@Ready");
    assert_eq!(outcome.password.len(), 128);
    assert!(outcome.password.chars().all(|c| c.is_ascii_alphanumeric()));

    let names = env.fake.dataset_names();
    assert!(names.contains(&"zroot/jest".to_string()));
    assert!(names.contains(&"zroot/jest/.base".to_string()));
    assert!(names.contains(&"zroot/jest/.base@Ready".to_string()));

    assert_eq!(env.fake.property("zroot/jest", tags::ROLE).as_deref(), Some("root"));
    assert_eq!(
        env.fake.property("zroot/jest", tags::DIR),
        Some(env.jest_dir().to_string_lossy().into_owned())
    );
    assert_eq!(env.fake.property("zroot/jest/.base", tags::ROLE).as_deref(), Some("base-image"));
    assert_eq!(env.fake.property("zroot/jest/.base", tags::VERSION).as_deref(), Some(VERSION));
    assert_eq!(env.fake.property("zroot/jest/.base", tags::TEMPLATE).as_deref(), Some("base"));

    let template = env.jest.templates().get("base").unwrap();
    assert_eq!(template.version, VERSION);
    assert_eq!(template.snapshot_name(), "zroot/jest/.base@Ready");
    assert!(!template.disabled);

    let configs = env.jest.host_configs().unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].1.jest_dataset, "zroot/jest");

    let status = env.jest.init_status().unwrap();
    assert!(status.initialised);
    assert_eq!(status.jest_dataset.as_deref(), Some("zroot/jest"));
}

#[tokio::test]
async fn test_bootstrap_customizes_extracted_tree() {
    let env = TestEnv::new();
    let outcome = env.bootstrap("base").await;

    let tree = env.jest_dir().join(".base");
    assert!(tree.join("bin/sh").exists());
    assert!(tree.join("usr/lib32/libc.so.7").exists());
    assert!(tree.join("usr/src/README").exists());
    assert_eq!(std::fs::read_to_string(tree.join("etc/resolv.conf")).unwrap(), RESOLV_CONF);
    assert!(tree.join("usr/ports").is_dir());
    assert!(std::fs::symlink_metadata(tree.join("home")).unwrap().file_type().is_symlink());

    // Shipped rc.conf content is kept, new lines are appended
    let rc = std::fs::read_to_string(tree.join("etc/rc.conf")).unwrap();
    assert!(rc.starts_with("hostname=\"template\"\n"));

    // Downloaded archives are removed after extraction
    for file in ["base.txz", "lib32.txz", "src.txz"] {
        assert!(!tree.join(file).exists(), "{} left behind", file);
    }

    let pw = env
        .fake
        .invocations()
        .into_iter()
        .find(|i| i.program == "pw")
        .expect("pw was run");
    assert_eq!(pw.input.as_deref(), Some(outcome.password.as_bytes()));
}

#[tokio::test]
async fn test_second_template_reuses_root() {
    let env = TestEnv::new();
    env.bootstrap("base").await;
    env.bootstrap("other").await;

    let names: Vec<String> = env.jest.templates().list().unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"base".to_string()));
    assert!(names.contains(&"other".to_string()));
    assert!(env.fake.dataset_names().contains(&"zroot/jest/.other@Ready".to_string()));

    // Same managed root, so no second config record and no duplicate rc.conf line
    assert_eq!(env.jest.host_configs().unwrap().len(), 1);
    assert_eq!(count_lines(&env.host_rc_conf(), "jail_enable=\"YES\""), 1);
}

#[tokio::test]
async fn test_bootstrap_same_name_twice_conflicts() {
    let env = TestEnv::new();
    env.bootstrap("base").await;

    let err = env
        .jest
        .bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::AlreadyExists(ref name) if name == "base"));
}

#[tokio::test]
async fn test_invalid_version_touches_nothing() {
    let env = TestEnv::new();
    let mut request = env.bootstrap_request("base");
    request.version = "11.2".to_string();

    let err = env.jest.bootstrap(FakeMirror::healthy("11.2"), request).await.unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidRequest(_)));
    assert_eq!(err.to_string(), "Invalid version: 11.2");
    assert_eq!(env.fake.dataset_names(), vec!["zroot".to_string()]);
    assert!(!env.jest_dir().exists());
}

#[tokio::test]
async fn test_snapshot_failure_persists_nothing() {
    let env = TestEnv::new();
    env.fake.fail_program("zfs snapshot");

    let err = env
        .jest
        .bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Storage(_)));

    assert!(env.jest.templates().list().unwrap().is_empty());
    assert!(env.jest.host_configs().unwrap().is_empty());
    assert!(!env.jest.init_status().unwrap().initialised);

    // No rollback: the datasets stay for the operator
    let names = env.fake.dataset_names();
    assert!(names.contains(&"zroot/jest/.base".to_string()));
    assert!(!names.contains(&"zroot/jest/.base@Ready".to_string()));

    let progress = env.jest.bootstrap_progress("base").await.unwrap();
    assert!(matches!(progress.status, BootstrapStatus::Failed(_)));
}

#[tokio::test]
async fn test_checksum_mismatch_aborts_before_extraction() {
    let env = TestEnv::new();
    let forged = common::txz(&[("bin/sh", b"forged".as_slice())]);
    let mirror = FakeMirror::healthy(VERSION).tamper(VERSION, "base.txz", forged);

    let err = env.jest.bootstrap(mirror, env.bootstrap_request("base")).await.unwrap_err();
    match err {
        BootstrapError::Transfer(MirrorError::ChecksumMismatch { file, .. }) => assert_eq!(file, "base.txz"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!env.jest_dir().join(".base/bin/sh").exists());
    assert!(env.jest.templates().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_archive_is_a_transfer_fault() {
    let env = TestEnv::new();
    let mut archives = release_archives();
    archives.remove("src.txz");

    let err = env
        .jest
        .bootstrap(FakeMirror::release(VERSION, archives), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Transfer(MirrorError::Status { status: 404, .. })));
}

#[tokio::test]
async fn test_corrupt_archive_is_an_extraction_fault() {
    let env = TestEnv::new();
    let mut archives = release_archives();
    archives.insert("lib32.txz".to_string(), b"not an xz stream".to_vec());

    let err = env
        .jest
        .bootstrap(FakeMirror::release(VERSION, archives), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    match err {
        BootstrapError::Extraction(message) => assert!(message.starts_with("lib32.txz"), "{}", message),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!env.fake.dataset_names().contains(&"zroot/jest/.base@Ready".to_string()));
}

#[tokio::test]
async fn test_tag_failure_names_dataset_and_tag() {
    let env = TestEnv::new();
    env.fake.fail_property(tags::VERSION);

    let err = env
        .jest
        .bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    match &err {
        BootstrapError::Tags { dataset, failed } => {
            assert_eq!(dataset, "zroot/jest/.base");
            assert_eq!(failed.len(), 1);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains(tags::VERSION));

    // The other tags of the batch were applied
    assert_eq!(env.fake.property("zroot/jest/.base", tags::TEMPLATE).as_deref(), Some("base"));
}

#[tokio::test]
async fn test_progress_ends_ready() {
    let env = TestEnv::new();
    assert!(env.jest.bootstrap_progress("base").await.is_none());

    env.bootstrap("base").await;
    let progress = env.jest.bootstrap_progress("base").await.unwrap();
    assert_eq!(progress.status, BootstrapStatus::Ready);
    assert_eq!(progress.progress, 100);
    assert_eq!(progress.version, VERSION);
}

#[tokio::test]
async fn test_restart_rediscovers_root() {
    let mut env = TestEnv::new();
    env.bootstrap("base").await;

    env.restart();
    let status = env.jest.init_status().unwrap();
    assert!(status.initialised);
    assert_eq!(status.jest_dir, Some(env.jest_dir().to_string_lossy().into_owned()));
    assert_eq!(env.jest.templates().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_after_failed_persist_rebuilds_snapshot() {
    let env = TestEnv::new();
    // The host rc.conf cannot be written while it is a directory
    std::fs::create_dir(env.host_rc_conf()).unwrap();

    let err = env
        .jest
        .bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("base"))
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Io(_)), "{}", err);
    assert!(env.fake.dataset_names().contains(&"zroot/jest/.base@Ready".to_string()));
    assert!(env.jest.templates().list().unwrap().is_empty());

    std::fs::remove_dir(env.host_rc_conf()).unwrap();
    // Customizing again writes to the base
    env.fake.touch("zroot/jest/.base");

    let outcome = env.bootstrap("base").await;
    assert_eq!(outcome.snapshot, "zroot/jest/.base@Ready");
    assert_eq!(env.jest.templates().get("base").unwrap().name, "base");
    assert_eq!(count_lines(&env.host_rc_conf(), "jail_enable=\"YES\""), 1);

    // The snapshot holds the password of the run that returned it
    let pw = env
        .fake
        .invocations()
        .into_iter()
        .filter(|i| i.program == "pw")
        .last()
        .unwrap();
    assert_eq!(pw.input.as_deref(), Some(outcome.password.as_bytes()));
}

/// Files under the managed root outside `mountpoint`
fn files_beside(mountpoint: &Path) -> BTreeSet<String> {
    fn walk(dir: &Path, skip: &Path, found: &mut BTreeSet<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path == skip {
                continue;
            }
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                walk(&path, skip, found);
            } else {
                found.insert(path.to_string_lossy().into_owned());
            }
        }
    }

    let mut found = BTreeSet::new();
    if let Some(root) = mountpoint.parent() {
        walk(root, mountpoint, &mut found);
    }
    found
}

/// Customizes directly, recording files that appear beside the tree while
/// it is being customized
struct WatchingCustomizer {
    inner: DirectCustomizer,
    intrusions: Mutex<Vec<String>>,
}

impl Customizer for WatchingCustomizer {
    fn customize(&self, mountpoint: &Path, options: &CustomizeOptions) -> Result<String, CustomizeError> {
        let before = files_beside(mountpoint);
        std::thread::sleep(Duration::from_millis(200));
        let after = files_beside(mountpoint);
        self.intrusions
            .lock()
            .unwrap()
            .extend(after.difference(&before).cloned());
        self.inner.customize(mountpoint, options)
    }
}

#[tokio::test]
async fn test_concurrent_bootstraps_do_not_overlap() {
    let watcher = Arc::new(Mutex::new(None::<Arc<WatchingCustomizer>>));
    let slot = Arc::clone(&watcher);
    let env = TestEnv::with_customizer(move |fake| {
        let customizer = Arc::new(WatchingCustomizer {
            inner: DirectCustomizer::new(fake.executor()),
            intrusions: Mutex::new(Vec::new()),
        });
        *slot.lock().unwrap() = Some(Arc::clone(&customizer));
        customizer as Arc<dyn Customizer>
    });

    let (first, second) = tokio::join!(
        env.jest.bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("base")),
        env.jest.bootstrap(FakeMirror::healthy(VERSION), env.bootstrap_request("other")),
    );
    first.unwrap();
    second.unwrap();

    let watcher = watcher.lock().unwrap().clone().unwrap();
    let intrusions = watcher.intrusions.lock().unwrap();
    assert!(intrusions.is_empty(), "written during customization: {:?}", intrusions);

    assert!(env.jest_dir().join(".other/bin/sh").exists());
    assert!(!env.jest_dir().join(".base/base.txz").exists());
    assert_eq!(env.jest.templates().list().unwrap().len(), 2);
}
