//! Fork-based background save and its bookkeeping.
//!
//! A background save forks the process; the child inherits a
//! copy-on-write image of the keyspace, runs the ordinary save
//! pipeline against it, and exits with a status code. No iterator
//! coordination is needed: parent writes after the fork land in pages
//! the child never sees. The parent records the child and, once the
//! periodic cron reaps it, settles the dirty counter and the
//! last-save status.
//!
//! While a child is alive the process-wide dictionary resize switch
//! is turned off: bucket migration in the parent would touch pages
//! the child shares and inflate the copy-on-write footprint.

use std::path::Path;
use std::time::SystemTime;

use fredis_core::Database;
use fredis_error::{FredisError, Result};
use tracing::{info, warn};

use crate::save::{save_to_file, temp_file_path, SaveInfo, SaveOptions};

/// How a reaped background save ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Child exited 0; the snapshot was renamed into place.
    Saved,
    /// Child exited non-zero; it removed its own temp file.
    Failed,
    /// Child was killed by a signal; its temp file was cleaned up
    /// here.
    Killed,
}

struct SaveChild {
    pid: i32,
    started: SystemTime,
}

/// Snapshot-persistence state of one server process.
pub struct Persistence {
    /// Writes since the last successful save.
    dirty: u64,
    /// Value of `dirty` when the running background save started;
    /// subtracted on success so writes made during the save survive
    /// into the next cycle.
    dirty_before_bgsave: u64,
    last_save: SystemTime,
    last_save_ok: bool,
    child: Option<SaveChild>,
}

impl Default for Persistence {
    fn default() -> Self {
        Self::new()
    }
}

impl Persistence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dirty: 0,
            dirty_before_bgsave: 0,
            last_save: SystemTime::now(),
            last_save_ok: true,
            child: None,
        }
    }

    /// Record keyspace writes for the save-interval policy.
    pub fn mark_dirty(&mut self, writes: u64) {
        self.dirty += writes;
    }

    #[must_use]
    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    #[must_use]
    pub fn last_save(&self) -> SystemTime {
        self.last_save
    }

    #[must_use]
    pub fn last_save_ok(&self) -> bool {
        self.last_save_ok
    }

    #[must_use]
    pub fn background_save_in_progress(&self) -> bool {
        self.child.is_some()
    }

    /// When the running background save started.
    #[must_use]
    pub fn background_save_started(&self) -> Option<SystemTime> {
        self.child.as_ref().map(|child| child.started)
    }

    /// Foreground save: blocks the caller for the whole write.
    pub fn save(
        &mut self,
        dest: &Path,
        dbs: &[Database],
        save_info: Option<&SaveInfo>,
        opts: &SaveOptions,
    ) -> Result<()> {
        save_to_file(dest, dbs, save_info, opts)?;
        self.dirty = 0;
        self.last_save = SystemTime::now();
        self.last_save_ok = true;
        Ok(())
    }

    /// Fork and save in the child. Returns as soon as the child is
    /// running; completion is observed via
    /// [`Persistence::reap_background_save`].
    #[cfg(unix)]
    pub fn save_background(
        &mut self,
        dest: &Path,
        dbs: &[Database],
        save_info: Option<&SaveInfo>,
        opts: &SaveOptions,
    ) -> Result<()> {
        use nix::unistd::ForkResult;

        if self.child.is_some() {
            return Err(FredisError::SaveInProgress);
        }
        self.dirty_before_bgsave = self.dirty;

        // The child only calls the save pipeline and _exit; the parent
        // side owns all bookkeeping.
        let fork_result = unsafe { nix::unistd::fork() }
            .map_err(|err| FredisError::Io(std::io::Error::from(err)))?;
        match fork_result {
            ForkResult::Child => {
                let status = match save_to_file(dest, dbs, save_info, opts) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                std::process::exit(status);
            }
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), "background saving started");
                self.child = Some(SaveChild {
                    pid: child.as_raw(),
                    started: SystemTime::now(),
                });
                fredis_dict::disable_resize();
                Ok(())
            }
        }
    }

    /// Non-blocking check for a finished background save; call
    /// periodically. Returns `None` while the child is still running
    /// (or none exists), the outcome once it has been reaped.
    #[cfg(unix)]
    pub fn reap_background_save(&mut self, dest: &Path) -> Option<SaveOutcome> {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        let child = self.child.as_ref()?;
        let pid = Pid::from_raw(child.pid);

        let outcome = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(WaitStatus::Exited(_, 0)) => {
                // Writes made while the child ran stay dirty for the
                // next cycle.
                self.dirty = self.dirty.saturating_sub(self.dirty_before_bgsave);
                self.last_save = SystemTime::now();
                self.last_save_ok = true;
                info!("background saving terminated with success");
                SaveOutcome::Saved
            }
            Ok(WaitStatus::Exited(_, code)) => {
                self.last_save_ok = false;
                warn!(code, "background saving error");
                SaveOutcome::Failed
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                self.last_save_ok = false;
                warn!(signal = %signal, "background saving terminated by signal");
                remove_temp_file(dest, child.pid as u32);
                SaveOutcome::Killed
            }
            Ok(_) => return None,
            Err(err) => {
                self.last_save_ok = false;
                warn!(error = %err, "cannot wait for background save child");
                SaveOutcome::Failed
            }
        };

        self.child = None;
        fredis_dict::enable_resize();
        Some(outcome)
    }
}

/// Remove the temp file a background child of the given pid was
/// writing next to `dest`. Used when the child was signalled before
/// it could rename or clean up.
pub fn remove_temp_file(dest: &Path, child_pid: u32) {
    let path = temp_file_path(dest, child_pid);
    if std::fs::remove_file(&path).is_ok() {
        info!(path = %path.display(), "removed stale background-save temp file");
    }
}
