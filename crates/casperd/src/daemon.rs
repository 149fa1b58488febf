//! Process bootstrap: detaching from the terminal and PID file handling.
//!
//! [`detach`] must run before the tokio runtime is built; forking a process
//! that already owns runtime threads leaves the child with a broken reactor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every setup step returns `SetupError`; a partially detached process
//!   never reaches the event loop

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process;

use daemonize::Daemonize;
use thiserror::Error;

/// Mode for files the daemon creates (rw-r--r--).
const FILE_MODE: u32 = 0o644;

/// Inputs to [`detach`].
#[derive(Debug)]
pub struct DetachOptions {
    /// Directory to change into; `None` keeps the current directory
    pub work_dir: Option<PathBuf>,

    pub pid_file: PathBuf,

    /// Destination for stdout/stderr (and stdin); `None` means `/dev/null`
    pub log: Option<File>,
}

/// Detaches the calling process from its controlling terminal.
///
/// Forks, starts a new session and forks again so the daemon can never
/// reacquire a terminal. SIGHUP is ignored from the start; SIGCHLD only once
/// the daemon is running, since the launcher has to reap its child. Standard
/// output and error go to `log` (or `/dev/null`), standard input is pointed
/// at the same destination, and the final PID is written to the pid file as
/// decimal text.
///
/// The original process exits inside this call. Only the daemon returns.
pub fn detach(options: DetachOptions) -> Result<(), SetupError> {
    ignore_signal(libc::SIGHUP)?;

    if let Some(parent) = options.pid_file.parent() {
        fs::create_dir_all(parent).map_err(|source| SetupError::PidFile {
            path: options.pid_file.clone(),
            source,
        })?;
    }

    let work_dir = match options.work_dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(|source| SetupError::WorkDir {
            path: PathBuf::from("."),
            source,
        })?,
    };
    check_work_dir(&work_dir)?;

    let mut daemonize = Daemonize::new()
        .pid_file(&options.pid_file)
        .chown_pid_file(false)
        .working_directory(&work_dir)
        .umask(0o022_u32);

    if let Some(log) = options.log {
        let stderr = log.try_clone().map_err(SetupError::Redirect)?;
        daemonize = daemonize.stdout(log).stderr(stderr);
    }

    daemonize
        .start()
        .map_err(|e| SetupError::Detach(e.to_string()))?;

    ignore_signal(libc::SIGCHLD)?;

    // stdin follows stdout, whichever destination that is
    // SAFETY: both descriptors are open for the life of the process.
    if unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDIN_FILENO) } == -1 {
        return Err(SetupError::Redirect(io::Error::last_os_error()));
    }

    Ok(())
}

/// Fails before forking when `dir` cannot become the working directory.
fn check_work_dir(dir: &Path) -> Result<(), SetupError> {
    let metadata = fs::metadata(dir).map_err(|source| SetupError::WorkDir {
        path: dir.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(SetupError::WorkDir {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    Ok(())
}

fn ignore_signal(signal: libc::c_int) -> Result<(), SetupError> {
    // SAFETY: installing SIG_IGN has no handler code to run.
    let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(SetupError::Signal {
            signal,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Opens (creating if needed) the daemon log for appending.
pub fn open_log(path: &Path) -> Result<File, SetupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SetupError::LogFile {
            path: path.to_path_buf(),
            source,
        })?;
    }

    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|source| SetupError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes the current PID to `path` without detaching (foreground mode).
pub fn write_pid_file(path: &Path) -> Result<(), SetupError> {
    let pid_error = |source| SetupError::PidFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(pid_error)?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(pid_error)?;
    write!(file, "{}", process::id()).map_err(pid_error)?;
    Ok(())
}

/// Reads a decimal PID back from `path`.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Checks if a process with the given PID is running.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Returns the PID of a live daemon recorded in `path`.
///
/// A stale PID file (process gone) is removed.
pub fn running_pid(path: &Path) -> Option<u32> {
    let pid = read_pid_file(path)?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file(path);
    None
}

/// Errors that abort daemon startup.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Failed to ignore signal {signal}: {source}")]
    Signal {
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resolve working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to detach from terminal: {0}")]
    Detach(String),

    #[error("Failed to redirect standard streams: {0}")]
    Redirect(#[source] io::Error),

    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
