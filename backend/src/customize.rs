//! Base tree customization
//!
//! After extraction a base tree is turned into something jails can boot
//! from. Each step on [`BaseTree`] is idempotent, so running the whole set
//! twice on the same tree changes nothing the second time. The
//! [`ChrootCustomizer`] runs the steps inside a chroot session on the base
//! mountpoint; [`DirectCustomizer`] runs them against the tree's path from
//! outside.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, symlink};
use std::path::{Path, PathBuf};
use std::process::Command;

use rand::distr::{Alphanumeric, SampleString};
use tracing::{debug, info, warn};

use crate::chroot::{ChrootError, ChrootSession};
use crate::executor::{BoxedExecutor, ExecutionError};

/// Lines ensured in the tree's `/etc/rc.conf`
pub const RC_CONF_LINES: &[&str] = &[
    "#Added by Jest:",
    "sendmail_enable=\"NONE\"",
    "syslogd_flags=\"-ss\"",
    "rpcbind_enable=\"NO\"",
];

/// Lines ensured in the tree's `/etc/make.conf`
pub const MAKE_CONF_LINES: &[&str] = &[
    "#Added by Jest:",
    "WITH_PKGNG=yes",
    "WRKDIRPREFIX=/var/ports",
    "DISTDIR=/var/ports/distfiles",
    "PACKAGES=/var/ports/packages",
    "INDEXDIR=/usr/ports",
];

/// Directories created in the tree, mode 0755
pub const SUPPORT_DIRS: &[&str] = &["usr/ports", "usr/home"];

/// Length of the generated root password
pub const ROOT_SECRET_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum CustomizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Command(#[from] ExecutionError),

    #[error(transparent)]
    Chroot(#[from] ChrootError),
}

/// Inputs to a customization run
#[derive(Debug, Clone, Default)]
pub struct CustomizeOptions {
    /// Host resolver configuration copied into the tree
    pub resolv_conf: Vec<u8>,
    /// Run `freebsd-update fetch install`
    pub apply_updates: bool,
}

/// Append every line of `lines` that `path` does not already contain.
///
/// Returns how many lines were appended. A missing file is created.
pub fn append_missing_lines(path: &Path, lines: &[&str]) -> std::io::Result<usize> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let missing: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| !existing.lines().any(|l| l.trim() == *line))
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    for line in &missing {
        writeln!(file, "{}", line)?;
    }

    debug!("Appended {} lines to {}", missing.len(), path.display());
    Ok(missing.len())
}

/// A base distribution tree rooted at `root`
pub struct BaseTree {
    root: PathBuf,
    executor: BoxedExecutor,
}

impl BaseTree {
    pub fn new(root: impl Into<PathBuf>, executor: BoxedExecutor) -> Self {
        Self {
            root: root.into(),
            executor,
        }
    }

    /// Absolute path of `relative` inside the tree
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    pub fn write_resolv_conf(&self, contents: &[u8]) -> std::io::Result<()> {
        let etc = self.path("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("resolv.conf"), contents)
    }

    /// Mount devfs on `/dev` unless device nodes are already there.
    ///
    /// Returns whether a mount was made.
    pub fn ensure_devfs(&self) -> Result<bool, CustomizeError> {
        let dev = self.path("dev");
        if dev.join("null").exists() {
            debug!("devfs already present at {}", dev.display());
            return Ok(false);
        }
        fs::create_dir_all(&dev)?;
        self.executor
            .execute(Command::new("mount").args(["-t", "devfs", "devfs"]).arg(&dev))?;
        Ok(true)
    }

    pub fn ensure_support_dirs(&self) -> std::io::Result<()> {
        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(0o755);
        for dir in SUPPORT_DIRS {
            builder.create(self.path(dir))?;
        }
        Ok(())
    }

    /// Link `/home` to `usr/home` unless something already sits at `/home`.
    ///
    /// Returns whether the link was created.
    pub fn ensure_home_symlink(&self) -> std::io::Result<bool> {
        let home = self.path("home");
        if fs::symlink_metadata(&home).is_ok() {
            return Ok(false);
        }
        symlink("usr/home", &home)?;
        Ok(true)
    }

    pub fn ensure_config_lines(&self) -> std::io::Result<usize> {
        fs::create_dir_all(self.path("etc"))?;
        Ok(append_missing_lines(&self.path("etc/rc.conf"), RC_CONF_LINES)?
            + append_missing_lines(&self.path("etc/make.conf"), MAKE_CONF_LINES)?)
    }

    pub fn make_aliases(&self) -> Result<(), ExecutionError> {
        self.executor
            .execute(Command::new("make").arg("-C").arg(self.path("etc/mail")).arg("aliases"))?;
        Ok(())
    }

    /// Set a fresh random root password and return it
    pub fn reset_root_password(&self) -> Result<String, ExecutionError> {
        let secret = Alphanumeric.sample_string(&mut rand::rng(), ROOT_SECRET_LEN);
        let mut cmd = Command::new("pw");
        cmd.args(["usermod", "root", "-h", "0"]);
        if self.root != Path::new("/") {
            cmd.arg("-R").arg(&self.root);
        }
        self.executor.execute_with_input(&mut cmd, Some(secret.as_bytes()))?;
        Ok(secret)
    }

    /// `freebsd-update fetch install`; failures are logged and ignored
    pub fn apply_updates(&self) {
        let mut cmd = Command::new("freebsd-update");
        if self.root != Path::new("/") {
            cmd.arg("-b").arg(&self.root);
        }
        cmd.args(["--not-running-from-cron", "fetch", "install"]);
        if let Err(e) = self.executor.execute(&mut cmd) {
            warn!("freebsd-update reported an error (ignored): {}", e);
        }
    }

    /// `pkg bootstrap`; the first run always complains, so failures are ignored
    pub fn bootstrap_pkg(&self) {
        let mut cmd = Command::new("pkg");
        if self.root != Path::new("/") {
            cmd.arg("-r").arg(&self.root);
        }
        cmd.args(["bootstrap", "-y"]);
        if let Err(e) = self.executor.execute(&mut cmd) {
            warn!("pkg bootstrap reported an error (ignored): {}", e);
        }
    }

    /// Run every step in order and return the new root password
    pub fn run_all(&self, options: &CustomizeOptions) -> Result<String, CustomizeError> {
        self.write_resolv_conf(&options.resolv_conf)?;
        self.ensure_devfs()?;
        self.ensure_support_dirs()?;
        self.ensure_home_symlink()?;
        self.ensure_config_lines()?;
        self.make_aliases()?;
        let password = self.reset_root_password()?;
        if options.apply_updates {
            self.apply_updates();
        }
        self.bootstrap_pkg();

        info!("Customized base tree at {}", self.root.display());
        Ok(password)
    }
}

/// Applies [`BaseTree`] customization to an extracted base mountpoint
pub trait Customizer: Send + Sync {
    /// Customize the tree at `mountpoint`, returning the new root password
    fn customize(&self, mountpoint: &Path, options: &CustomizeOptions) -> Result<String, CustomizeError>;
}

/// Customizes from inside a chroot session on the mountpoint
pub struct ChrootCustomizer {
    executor: BoxedExecutor,
}

impl ChrootCustomizer {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    fn allow_open_directories(&self, level: u8) -> Result<(), ExecutionError> {
        self.executor.execute(
            Command::new("sysctl").arg(format!("kern.chroot_allow_open_directories={}", level)),
        )?;
        Ok(())
    }
}

impl Customizer for ChrootCustomizer {
    fn customize(&self, mountpoint: &Path, options: &CustomizeOptions) -> Result<String, CustomizeError> {
        self.allow_open_directories(2)?;

        let session = match ChrootSession::enter(mountpoint) {
            Ok(session) => session,
            Err(e) => {
                if let Err(reset) = self.allow_open_directories(1) {
                    warn!("Failed to reset kern.chroot_allow_open_directories: {}", reset);
                }
                return Err(e.into());
            }
        };

        let result = BaseTree::new("/", self.executor.clone()).run_all(options);
        // Restoring the root comes first and its failure wins over any step error
        session.exit()?;

        self.allow_open_directories(1)?;
        result
    }
}

/// Customizes through the mountpoint path, without switching root
pub struct DirectCustomizer {
    executor: BoxedExecutor,
}

impl DirectCustomizer {
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }
}

impl Customizer for DirectCustomizer {
    fn customize(&self, mountpoint: &Path, options: &CustomizeOptions) -> Result<String, CustomizeError> {
        BaseTree::new(mountpoint, self.executor.clone()).run_all(options)
    }
}
