//! Jail provisioning on top of a bootstrapped template

mod common;

use common::{TestEnv, jail_request};
use jest_backend::jail::{CreateJailRequest, DEFAULT_START, DEFAULT_USER, JailError};
use jest_backend::lifecycle::StopOutcome;
use jest_backend::zfs::tags;

async fn ready_env() -> TestEnv {
    let env = TestEnv::new();
    env.bootstrap("base").await;
    env
}

fn web1() -> CreateJailRequest {
    CreateJailRequest {
        use_defaults: true,
        ..jail_request("web1", "web1.local", "10.0.0.5", "base")
    }
}

#[tokio::test]
async fn test_create_clones_template_with_defaults() {
    let env = ready_env().await;
    let view = env.jest.jails().create(&web1()).unwrap();

    let expected_path = env.jest_dir().join("web1").to_string_lossy().into_owned();
    assert_eq!(view.config.path, expected_path);
    assert_eq!(view.config.dataset, "zroot/jest/web1");
    assert!(!view.config.allow_raw_sockets);
    assert!(!view.config.allow_mount);
    assert!(view.config.clean);
    assert_eq!(view.config.jail_user, DEFAULT_USER);
    assert_eq!(view.config.start, DEFAULT_START);
    assert!(!view.state.running);

    assert_eq!(env.fake.property("zroot/jest/web1", "origin").as_deref(), Some("zroot/jest/.base@Ready"));
    assert_eq!(env.fake.property("zroot/jest/web1", "mountpoint"), Some(expected_path));
    assert_eq!(env.fake.property("zroot/jest/web1", tags::ROLE).as_deref(), Some("jail-instance"));

    let stored = env.jest.jails().get("web1").unwrap();
    assert_eq!(stored.key, view.key);
    assert_eq!(stored.config, view.config);
}

#[tokio::test]
async fn test_reused_address_is_rejected_without_cloning() {
    let env = ready_env().await;
    env.jest.jails().create(&web1()).unwrap();

    let err = env
        .jest
        .jails()
        .create(&jail_request("web2", "web2.local", "10.0.0.5", "base"))
        .unwrap_err();
    assert!(matches!(err, JailError::Validation(_)));
    assert_eq!(err.to_string(), "IP address already in use: 10.0.0.5.");
    assert!(!env.fake.dataset_names().contains(&"zroot/jest/web2".to_string()));
    assert_eq!(env.jest.jails().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_then_status_reports_live_jid() {
    let env = ready_env().await;
    env.jest.jails().create(&web1()).unwrap();

    env.jest.jails().start("web1").unwrap();
    let state = env.jest.jails().status("web1").unwrap();
    assert!(state.running);

    let jid = state.jid.expect("running jail has a jid");
    assert!(!jid.is_empty());
    assert!(env.fake.running_jails().contains(&(jid, "web1".to_string())));

    let start = env
        .fake
        .invocations()
        .into_iter()
        .find(|i| i.program == "jail")
        .unwrap();
    assert_eq!(start.args[0], "-c");
    assert_eq!(start.args[1], "name=web1");
    assert!(start.args.contains(&"ip4.addr=10.0.0.5".to_string()));
}

#[tokio::test]
async fn test_stop_twice_reports_not_running() {
    let env = ready_env().await;
    env.jest.jails().create(&web1()).unwrap();
    env.jest.jails().start("web1").unwrap();

    assert!(matches!(env.jest.jails().stop("web1").unwrap(), StopOutcome::Stopped(ref s) if !s.running));
    assert!(matches!(env.jest.jails().stop("web1").unwrap(), StopOutcome::NotRunning(_)));
    assert!(env.fake.running_jails().is_empty());
}

#[tokio::test]
async fn test_clones_share_origin_and_stay_independent() {
    let env = ready_env().await;
    for i in 1..=4 {
        let name = format!("node{}", i);
        env.jest
            .jails()
            .create(&jail_request(&name, &format!("{}.local", name), &format!("10.0.1.{}", i), "base"))
            .unwrap();
    }

    for i in 1..=4 {
        let dataset = format!("zroot/jest/node{}", i);
        assert_eq!(env.fake.property(&dataset, "origin").as_deref(), Some("zroot/jest/.base@Ready"));
    }

    // Removing one clone leaves the others and the origin alone
    env.jest.jails().delete("node2").unwrap();
    env.jest.jails().destroy_dataset("node2").unwrap();

    let names = env.fake.dataset_names();
    assert!(!names.contains(&"zroot/jest/node2".to_string()));
    for survivor in ["node1", "node3", "node4"] {
        assert!(names.contains(&format!("zroot/jest/{}", survivor)));
    }
    assert!(names.contains(&"zroot/jest/.base@Ready".to_string()));
    assert_eq!(env.jest.jails().list().unwrap().len(), 3);
}

#[tokio::test]
async fn test_destroy_refuses_running_or_foreign_datasets() {
    let env = ready_env().await;
    env.jest.jails().create(&web1()).unwrap();
    env.jest.jails().start("web1").unwrap();
    env.jest.jails().delete("web1").unwrap();

    let err = env.jest.jails().destroy_dataset("web1").unwrap_err();
    assert!(matches!(err, JailError::InvalidState(_)));

    // The base image is never a jail instance
    let err = env.jest.jails().destroy_dataset(".base").unwrap_err();
    assert!(matches!(err, JailError::Validation(_) | JailError::InvalidState(_)));
    assert!(env.fake.dataset_names().contains(&"zroot/jest/.base".to_string()));
}

#[tokio::test]
async fn test_disabled_template_cannot_be_used() {
    let env = ready_env().await;
    env.jest.templates().set_disabled("base", true).unwrap();

    let err = env.jest.jails().create(&web1()).unwrap_err();
    assert_eq!(err.to_string(), "Invalid template: base");

    env.jest.templates().set_disabled("base", false).unwrap();
    assert!(env.jest.jails().create(&web1()).is_ok());
}

#[tokio::test]
async fn test_jails_survive_restart() {
    let mut env = ready_env().await;
    env.jest.jails().create(&web1()).unwrap();
    env.jest.jails().start("web1").unwrap();

    env.restart();
    let view = env.jest.jails().get("web1").unwrap();
    assert!(view.state.running);
    assert_eq!(view.config.ipv4_addr, "10.0.0.5");
}
