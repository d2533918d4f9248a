use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use fs2::FileExt;
use tempfile::{Builder, TempDir};
use tracing::{debug, warn};

use crate::error::SoundscanError;

/// Temporary-storage root for downloaded and normalized recordings.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
    isolate_runs: bool,
}

impl Workspace {
    pub fn new(root: Utf8PathBuf, isolate_runs: bool) -> Self {
        Self { root, isolate_runs }
    }

    pub fn default_root() -> Result<Utf8PathBuf, SoundscanError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.cache_dir().join("inat-soundscan").join("scratch"),
                )
                .ok()
            })
            .ok_or_else(|| {
                SoundscanError::Filesystem("unable to resolve scratch directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn isolates_runs(&self) -> bool {
        self.isolate_runs
    }

    pub fn ensure_root(&self) -> Result<(), SoundscanError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SoundscanError::Filesystem(err.to_string()))
    }

    /// Hands out the storage a single run owns exclusively until it is released.
    ///
    /// With run isolation every run gets a fresh `run-*` sub-directory of the root,
    /// so concurrent runs never touch each other's files. Without it the root itself
    /// is the run's storage and only one run may be in flight.
    pub fn acquire(&self) -> Result<RunScratch, SoundscanError> {
        self.ensure_root()?;
        if !self.isolate_runs {
            return Ok(RunScratch {
                dir: self.root.as_std_path().to_path_buf(),
                owned: None,
                root_lock: None,
                released: false,
            });
        }
        let root_lock = self.root_lock_path()?;
        let _guard = lock_root(&root_lock)?;
        let swept = sweep_root(self.root.as_std_path())?;
        if swept > 0 {
            debug!(root = %self.root, swept, "removed stale scratch entries");
        }
        let temp_dir = Builder::new()
            .prefix(RUN_DIR_PREFIX)
            .tempdir_in(self.root.as_std_path())
            .map_err(|err| SoundscanError::Filesystem(err.to_string()))?;
        let lock = open_lock_file(&temp_dir.path().join(RUN_LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|err| SoundscanError::Filesystem(format!("lock run directory: {err}")))?;
        Ok(RunScratch {
            dir: temp_dir.path().to_path_buf(),
            owned: Some(OwnedRun {
                temp_dir,
                lock,
                root: self.root.as_std_path().to_path_buf(),
            }),
            root_lock: Some(root_lock),
            released: false,
        })
    }

    /// Lock file guarding sweeps of the root. It sits next to the root, never inside it.
    fn root_lock_path(&self) -> Result<PathBuf, SoundscanError> {
        match (self.root.parent(), self.root.file_name()) {
            (Some(parent), Some(name)) => {
                Ok(parent.join(format!("{name}.lock")).into_std_path_buf())
            }
            _ => Err(SoundscanError::Filesystem(format!(
                "scratch root has no parent directory: {}",
                self.root
            ))),
        }
    }
}

const RUN_DIR_PREFIX: &str = "run-";
const RUN_LOCK_FILE: &str = "run.lock";

#[derive(Debug)]
struct OwnedRun {
    temp_dir: TempDir,
    lock: File,
    root: PathBuf,
}

/// Run-scoped scratch directory. Emptied on release, and on drop if never released.
#[derive(Debug)]
pub struct RunScratch {
    dir: PathBuf,
    owned: Option<OwnedRun>,
    root_lock: Option<PathBuf>,
    released: bool,
}

impl RunScratch {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Removes everything currently in the directory, including debris of earlier runs.
    pub fn clear(&self) -> Result<usize, SoundscanError> {
        clear_dir(&self.dir)
    }

    /// Best-effort cleanup; failures are logged and never returned.
    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Some(owned) = self.owned.take() else {
            match self.clear() {
                Ok(removed) => debug!(dir = %self.dir.display(), removed, "scratch cleared"),
                Err(err) => warn!(dir = %self.dir.display(), "scratch cleanup failed: {err}"),
            }
            return;
        };

        let guard = self.root_lock.as_deref().map(lock_root).transpose();
        let guard = match guard {
            Ok(guard) => guard,
            Err(err) => {
                warn!(dir = %self.dir.display(), "scratch root lock failed: {err}");
                None
            }
        };
        let OwnedRun {
            temp_dir,
            lock,
            root,
        } = owned;
        drop(lock);
        if let Err(err) = temp_dir.close() {
            warn!(dir = %self.dir.display(), "scratch removal failed: {err}");
        }
        if guard.is_some() {
            match sweep_root(&root) {
                Ok(swept) => debug!(root = %root.display(), swept, "scratch cleared"),
                Err(err) => warn!(root = %root.display(), "scratch sweep failed: {err}"),
            }
        }
    }
}

impl Drop for RunScratch {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn open_lock_file(path: &Path) -> Result<File, SoundscanError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| SoundscanError::Filesystem(format!("open {}: {err}", path.display())))
}

/// Blocks until this process holds the root lock; released when the file is dropped.
fn lock_root(path: &Path) -> Result<File, SoundscanError> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()
        .map_err(|err| SoundscanError::Filesystem(format!("lock {}: {err}", path.display())))?;
    Ok(file)
}

/// Whether another live run still holds the lock inside `dir`.
fn run_is_live(dir: &Path) -> bool {
    match File::open(dir.join(RUN_LOCK_FILE)) {
        Ok(file) => file.try_lock_exclusive().is_err(),
        Err(_) => false,
    }
}

/// Removes every root entry that no live run owns. Caller must hold the root lock.
fn sweep_root(root: &Path) -> Result<usize, SoundscanError> {
    let entries = fs::read_dir(root).map_err(|err| SoundscanError::Filesystem(err.to_string()))?;
    let mut removed = 0usize;
    let mut first_error = None;
    for entry in entries {
        let entry = entry.map_err(|err| SoundscanError::Filesystem(err.to_string()))?;
        let path = entry.path();
        let is_run_dir = path.is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(RUN_DIR_PREFIX));
        if is_run_dir && run_is_live(&path) {
            continue;
        }
        match remove_entry(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                first_error.get_or_insert_with(|| format!("remove {}: {err}", path.display()));
            }
        }
    }
    match first_error {
        Some(message) => Err(SoundscanError::Filesystem(message)),
        None => Ok(removed),
    }
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn clear_dir(dir: &Path) -> Result<usize, SoundscanError> {
    if !dir.exists() {
        return Ok(0);
    }
    let entries = fs::read_dir(dir).map_err(|err| SoundscanError::Filesystem(err.to_string()))?;
    let mut removed = 0usize;
    let mut first_error = None;
    for entry in entries {
        let entry = entry.map_err(|err| SoundscanError::Filesystem(err.to_string()))?;
        let path = entry.path();
        match remove_entry(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                first_error.get_or_insert_with(|| format!("remove {}: {err}", path.display()));
            }
        }
    }
    match first_error {
        Some(message) => Err(SoundscanError::Filesystem(message)),
        None => Ok(removed),
    }
}
