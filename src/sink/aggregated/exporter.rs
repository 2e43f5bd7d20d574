use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::info;

use crate::config::OutputConfig;

/// Primary destination of interval output.
///
/// Uses enum dispatch for the built-in targets; `Writer` accepts any other
/// byte sink.
pub enum Exporter {
    Stdout(io::Stdout),
    Pipe { path: PathBuf, file: File },
    Writer(Box<dyn Write + Send>),
}

impl Exporter {
    /// Open the target described by the output configuration: the named
    /// pipe if one is configured, stdout otherwise.
    pub fn open(cfg: &OutputConfig) -> Result<Self> {
        match &cfg.pipe {
            Some(path) => {
                let file = open_named_pipe(path, cfg.pipe_buffer_size)?;
                info!(path = %path.display(), "writing intervals to named pipe");
                Ok(Self::Pipe {
                    path: path.clone(),
                    file,
                })
            }
            None => Ok(Self::Stdout(io::stdout())),
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Pipe { .. } => "pipe",
            Self::Writer(_) => "writer",
        }
    }

    /// Write one interval's worth of output and flush it.
    pub fn write_interval(&mut self, data: &[u8]) -> Result<()> {
        let name = self.name();
        let result = match self {
            Self::Stdout(out) => {
                let mut lock = out.lock();
                lock.write_all(data).and_then(|()| lock.flush())
            }
            Self::Pipe { file, .. } => file.write_all(data),
            Self::Writer(w) => w.write_all(data).and_then(|()| w.flush()),
        };
        result.with_context(|| format!("writing interval to {name}"))
    }
}

/// Open (creating if needed) a named pipe for appending.
///
/// The pipe is opened read-write so the open never blocks waiting for a
/// reader. Freshly created pipes get their buffer grown to `buffer_size`.
#[cfg(unix)]
pub fn open_named_pipe(path: &Path, buffer_size: usize) -> Result<File> {
    use std::os::unix::fs::FileTypeExt;

    let created = match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_fifo() {
                anyhow::bail!("{} exists and is not a named pipe", path.display());
            }
            false
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            mkfifo(path)?;
            true
        }
        Err(e) => {
            return Err(e).with_context(|| format!("inspecting {}", path.display()));
        }
    };

    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening named pipe {}", path.display()))?;

    if created {
        resize_pipe(&file, buffer_size);
    }

    Ok(file)
}

#[cfg(unix)]
fn mkfifo(path: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path =
        CString::new(path.as_os_str().as_bytes()).context("pipe path contains a NUL byte")?;

    // Safety: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("creating named pipe {}", path.display()));
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn resize_pipe(file: &File, buffer_size: usize) {
    use std::os::unix::io::AsRawFd;

    let Ok(requested) = libc::c_int::try_from(buffer_size) else {
        tracing::warn!(requested = buffer_size, "pipe buffer size out of range");
        return;
    };

    // Safety: the descriptor is owned by `file`, which is alive for the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, requested) };
    if rc < 0 {
        tracing::warn!(
            requested,
            error = %io::Error::last_os_error(),
            "could not resize pipe buffer",
        );
    } else {
        info!(requested, size = rc, "pipe buffer resized");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn resize_pipe(_file: &File, _buffer_size: usize) {}

/// Per-interval copies of the output, one file per interval timestamp.
#[derive(Debug, Clone)]
pub struct IntervalArchive {
    dir: PathBuf,
}

impl IntervalArchive {
    /// Use `dir` for archive files, creating it if missing.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output folder {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// `traffic_<local time>.csv` inside the archive folder.
    pub fn path_for(&self, timestamp: SystemTime) -> PathBuf {
        let local: DateTime<Local> = timestamp.into();
        self.dir
            .join(format!("traffic_{}.csv", local.format("%Y-%m-%dT%H_%M_%S")))
    }

    /// Append `data` to the file for `timestamp`.
    pub fn write(&self, timestamp: SystemTime, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(timestamp);

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }

        let mut file = options
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(data)
            .with_context(|| format!("writing {}", path.display()))?;

        Ok(path)
    }
}
