//! Shared fixtures for the integration tests
//!
//! A [`TestEnv`] is a fake host plus a temporary directory holding the
//! metadata database, the host rc.conf/resolv.conf and the managed root.
//! [`FakeMirror`] serves small generated distribution archives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use jest_backend::Jest;
use jest_backend::bootstrap::{BootstrapOutcome, BootstrapRequest};
use jest_backend::config::JestConfig;
use jest_backend::customize::{Customizer, DirectCustomizer};
use jest_backend::fakes::FakeHost;
use jest_backend::jail::CreateJailRequest;
use jest_backend::mirror::{ByteStream, DIST_FILES, MANIFEST, Mirror, MirrorError, release_path};

pub const VERSION: &str = "11.2-RELEASE";
pub const RESOLV_CONF: &str = "nameserver 192.0.2.53\n";

/// Build an xz-compressed tarball holding `files` (path, contents)
pub fn txz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Archives of a minimal release, keyed by file name
pub fn release_archives() -> HashMap<String, Vec<u8>> {
    let mut archives = HashMap::new();
    archives.insert(
        "base.txz".to_string(),
        txz(&[
            ("bin/sh", b"#!/bin/sh\n".as_slice()),
            ("etc/rc.conf", b"hostname=\"template\"\n".as_slice()),
            ("etc/mail/aliases", b"root: postmaster\n".as_slice()),
        ]),
    );
    archives.insert(
        "lib32.txz".to_string(),
        txz(&[("usr/lib32/libc.so.7", b"lib32".as_slice())]),
    );
    archives.insert(
        "src.txz".to_string(),
        txz(&[("usr/src/README", b"FreeBSD source".as_slice())]),
    );
    archives
}

/// MANIFEST listing the checksum of every archive
pub fn manifest_for(archives: &HashMap<String, Vec<u8>>) -> String {
    DIST_FILES
        .iter()
        .filter_map(|file| {
            let data = archives.get(*file)?;
            Some(format!("{}\t{}\t1\t{}\t\"{}\"\ton\n", file, sha256_hex(data), file.trim_end_matches(".txz"), file))
        })
        .collect()
}

/// In-memory mirror serving files by remote path
#[derive(Debug, Clone, Default)]
pub struct FakeMirror {
    files: HashMap<String, Vec<u8>>,
    connected: Option<String>,
    pub logins: Vec<(String, String)>,
}

impl FakeMirror {
    /// A mirror publishing `archives` and their MANIFEST for `version`
    pub fn release(version: &str, archives: HashMap<String, Vec<u8>>) -> Self {
        let manifest = manifest_for(&archives);
        let mut files: HashMap<String, Vec<u8>> = archives
            .into_iter()
            .map(|(file, data)| (release_path("amd64", version, &file), data))
            .collect();
        files.insert(release_path("amd64", version, MANIFEST), manifest.into_bytes());
        Self {
            files,
            ..Default::default()
        }
    }

    pub fn healthy(version: &str) -> Self {
        Self::release(version, release_archives())
    }

    /// Replace one published file after the MANIFEST was computed
    pub fn tamper(mut self, version: &str, file: &str, data: Vec<u8>) -> Self {
        self.files.insert(release_path("amd64", version, file), data);
        self
    }
}

impl Mirror for FakeMirror {
    async fn connect(&mut self, site: &str) -> Result<(), MirrorError> {
        if site.is_empty() {
            return Err(MirrorError::InvalidSite(site.to_string()));
        }
        self.connected = Some(site.to_string());
        Ok(())
    }

    async fn login(&mut self, user: &str, password: &str) -> Result<(), MirrorError> {
        self.logins.push((user.to_string(), password.to_string()));
        Ok(())
    }

    async fn fetch(&self, remote_path: &str) -> Result<ByteStream, MirrorError> {
        let Some(site) = &self.connected else {
            return Err(MirrorError::NotConnected);
        };
        let Some(data) = self.files.get(remote_path) else {
            return Err(MirrorError::Status {
                url: format!("{}/{}", site, remote_path),
                status: 404,
            });
        };

        // Two chunks so consumers see a real stream
        let (head, tail) = data.split_at(data.len() / 2);
        let chunks: Vec<Result<Bytes, MirrorError>> =
            vec![Ok(Bytes::copy_from_slice(head)), Ok(Bytes::copy_from_slice(tail))];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Fake host, temporary directory and a service assembled on top of them
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub fake: FakeHost,
    pub jest: Arc<Jest>,
    customizer: Arc<dyn Customizer>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_customizer(|fake| Arc::new(DirectCustomizer::new(fake.executor())) as Arc<dyn Customizer>)
    }

    pub fn with_customizer(make: impl FnOnce(&FakeHost) -> Arc<dyn Customizer>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHost::new();
        let customizer = make(&fake);
        let jest = Self::assemble(dir.path(), &fake, Arc::clone(&customizer));
        Self {
            dir,
            fake,
            jest,
            customizer,
        }
    }

    /// Reopen the service over the same host and database, as after a restart
    pub fn restart(&mut self) {
        self.jest = Self::assemble(self.dir.path(), &self.fake, Arc::clone(&self.customizer));
    }

    fn assemble(root: &Path, fake: &FakeHost, customizer: Arc<dyn Customizer>) -> Arc<Jest> {
        let resolv = root.join("resolv.conf");
        if !resolv.exists() {
            std::fs::write(&resolv, RESOLV_CONF).unwrap();
        }

        let mut config = JestConfig::default();
        config.storage.database_path = root.join("db/jest.db").to_string_lossy().into_owned();
        config.storage.socket_path = root.join("jest.sock").to_string_lossy().into_owned();
        config.host.rc_conf = root.join("rc.conf").to_string_lossy().into_owned();
        config.host.resolv_conf = resolv.to_string_lossy().into_owned();
        config.api.timeout = 10;

        Arc::new(Jest::new(config, fake.executor(), customizer).unwrap())
    }

    /// Directory used as the managed root mountpoint
    pub fn jest_dir(&self) -> PathBuf {
        self.dir.path().join("jest")
    }

    pub fn host_rc_conf(&self) -> PathBuf {
        self.dir.path().join("rc.conf")
    }

    pub fn bootstrap_request(&self, name: &str) -> BootstrapRequest {
        BootstrapRequest {
            name: Some(name.to_string()),
            version: VERSION.to_string(),
            dataset: "zroot/jest".to_string(),
            mountpoint: self.jest_dir().to_string_lossy().into_owned(),
            compression: false,
            apply_updates: false,
            architecture: "amd64".to_string(),
            mirror: None,
        }
    }

    /// Bootstrap template `name` from a healthy mirror
    pub async fn bootstrap(&self, name: &str) -> BootstrapOutcome {
        self.jest
            .bootstrap(FakeMirror::healthy(VERSION), self.bootstrap_request(name))
            .await
            .unwrap()
    }
}

pub fn jail_request(name: &str, hostname: &str, ip: &str, template: &str) -> CreateJailRequest {
    CreateJailRequest {
        name: Some(name.to_string()),
        template: Some(template.to_string()),
        hostname: Some(hostname.to_string()),
        ipv4_addr: Some(ip.to_string()),
        ..Default::default()
    }
}
