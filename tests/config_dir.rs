//! Config directory round trips through the public API.

use sshdock::config::{export_openssh_config, parse_openssh_config, AppSettings, ConnectionStore};
use sshdock::storage::FileStore;
use sshdock::tunnel::{ForwardDescriptor, ForwardStore};
use sshdock::AppState;

const SSH_CONFIG: &str = "\
Host *
    ServerAliveInterval 30

Host web
    HostName 10.0.0.5
    User deploy
    Port 2222
    Ciphers aes256-ctr,aes128-ctr

Host bastion
    User ops
";

#[test]
fn test_import_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ConnectionStore::load(dir.path()).unwrap();

    let count = store.merge(parse_openssh_config(SSH_CONFIG)).unwrap();
    assert_eq!(count, 2);

    let reloaded = ConnectionStore::load(dir.path()).unwrap();
    let web = reloaded.find("web").unwrap();
    assert_eq!(web.connection_id(), "deploy@10.0.0.5:2222");
    assert_eq!(web.ciphers(), ["aes256-ctr", "aes128-ctr"]);
    assert_eq!(reloaded.find("bastion").unwrap().host, "bastion");

    let exported = export_openssh_config(&reloaded.list());
    assert!(exported.contains("HostName 10.0.0.5"));
    assert!(exported.contains("Port 2222"));
    assert!(!exported.contains("Host *"));
}

#[test]
fn test_state_loads_from_empty_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = AppSettings::default();
    settings.storage.root = Some(dir.path().join("storage"));
    settings.save(dir.path()).unwrap();

    let state = AppState::new(dir.path()).unwrap();
    assert!(state.connections.read().list().is_empty());
    assert!(state.pool.is_empty());
    assert_eq!(state.store.root(), dir.path().join("storage"));
    state.shutdown();
}

#[test]
fn test_forwards_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let mut forwards = ForwardStore::load(dir.path()).unwrap();
    let forward = ForwardDescriptor::new("10.0.0.5", 22, "pg", "127.0.0.1", 15432, "db.internal", 5432);
    forwards.add("10.0.0.5_22", forward.clone()).unwrap();

    let reloaded = ForwardStore::load(dir.path()).unwrap();
    assert_eq!(reloaded.list("10.0.0.5_22"), vec![forward]);
    assert!(reloaded.list("10.0.0.6_22").is_empty());
}

#[test]
fn test_mirror_paths_stay_under_storage() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let path = store.mirror_path("web_deploy_10.0.0.5_2222", "/var/log/nginx").unwrap();
    assert!(path.starts_with(dir.path().join("temp")));
    assert!(store.mirror_path("web", "/var/../../etc").is_err());
}
