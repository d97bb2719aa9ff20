//! Scoped filesystem root switch
//!
//! `chroot(2)` changes the root of the whole process. Code that resolves
//! absolute host paths or runs host programs holds a [`HostRoot`] guard
//! while it does so; a [`ChrootSession`] takes the same lock exclusively, so
//! it waits for those guards and blocks new ones until it ends. Only one
//! session exists at a time.
//!
//! A session ends through [`ChrootSession::exit`], which reports whether the
//! original root came back. If a session is dropped without `exit` (early
//! return, panic), the drop path restores the root and aborts the process
//! when it cannot.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::cell::Cell;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, error, info, warn};

static ROOT_LOCK: RwLock<()> = RwLock::new(());

thread_local! {
    // Guards and sessions held by the current thread
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// Keeps the process root in place while held. See the module docs.
///
/// Guards nest: only the outermost guard on a thread takes the lock, and a
/// guard taken inside a session on the same thread takes nothing, so code
/// run by the session resolves paths inside the new root.
#[derive(Debug)]
pub struct HostRoot {
    _guard: Option<RwLockReadGuard<'static, ()>>,
}

impl HostRoot {
    pub fn hold() -> Self {
        let guard = HELD.with(|held| {
            let guard = (held.get() == 0).then(|| ROOT_LOCK.read().unwrap_or_else(|e| e.into_inner()));
            held.set(held.get() + 1);
            guard
        });
        Self { _guard: guard }
    }
}

impl Drop for HostRoot {
    fn drop(&mut self) {
        HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

#[derive(Debug, Error)]
pub enum ChrootError {
    #[error("Cannot enter chroot at {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The original root could not be restored. Every path the process
    /// resolves from here on is wrong; callers must stop.
    #[error("Failed to restore the original root after chroot at {path}: {source}")]
    Restore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An active root switch. See the module docs.
#[derive(Debug)]
pub struct ChrootSession {
    path: PathBuf,
    saved_root: Option<File>,
    saved_cwd: Option<PathBuf>,
    _guard: RwLockWriteGuard<'static, ()>,
}

fn chroot(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    if unsafe { libc::chroot(c_path.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn restore(root: &File, cwd: Option<&Path>) -> std::io::Result<()> {
    // SAFETY: the descriptor belongs to `root`, which outlives the call
    if unsafe { libc::fchdir(root.as_raw_fd()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    chroot(Path::new("."))?;
    std::env::set_current_dir(cwd.unwrap_or(Path::new("/")))
}

impl ChrootSession {
    /// Switch the process root to `path`, blocking while another session is active
    pub fn enter(path: impl AsRef<Path>) -> Result<Self, ChrootError> {
        let path = path.as_ref().to_path_buf();
        let enter_error = |source| ChrootError::Enter {
            path: path.clone(),
            source,
        };

        // Taking the lock exclusively under our own guard would never return
        if HELD.with(Cell::get) > 0 {
            return Err(enter_error(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "the host root is held by this thread",
            )));
        }
        let guard = ROOT_LOCK.write().unwrap_or_else(|e| e.into_inner());

        let saved_root = File::open("/").map_err(enter_error)?;
        let saved_cwd = std::env::current_dir().ok();

        chroot(&path).map_err(enter_error)?;

        if let Err(e) = std::env::set_current_dir("/") {
            // Inside the new root but unusable; go back before reporting
            restore(&saved_root, saved_cwd.as_deref()).map_err(|source| ChrootError::Restore {
                path: path.clone(),
                source,
            })?;
            return Err(enter_error(e));
        }

        info!("Entered chroot at {}", path.display());
        HELD.with(|held| held.set(held.get() + 1));
        Ok(Self {
            path,
            saved_root: Some(saved_root),
            saved_cwd,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the session and restore the original root.
    ///
    /// An error here is unrecoverable for the process.
    pub fn exit(mut self) -> Result<(), ChrootError> {
        let Some(root) = self.saved_root.take() else {
            return Ok(());
        };
        restore(&root, self.saved_cwd.as_deref()).map_err(|source| ChrootError::Restore {
            path: self.path.clone(),
            source,
        })?;
        debug!("Left chroot at {}", self.path.display());
        Ok(())
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        HELD.with(|held| held.set(held.get().saturating_sub(1)));
        let Some(root) = self.saved_root.take() else {
            return;
        };
        if let Err(e) = restore(&root, self.saved_cwd.as_deref()) {
            error!(
                "Could not restore root after chroot at {}: {}; aborting",
                self.path.display(),
                e
            );
            std::process::abort();
        }
        warn!("Chroot session at {} dropped without exit; root restored", self.path.display());
    }
}
