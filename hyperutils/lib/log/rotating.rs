//! A line-oriented log file that rotates when it grows past a size limit.
//!
//! Rotation renames the current file to `<name>.old`, replacing any earlier rotated file, and
//! continues writing into a fresh file under the original name.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default size at which a log file is rotated.
pub const DEFAULT_LOG_MAX_SIZE: u64 = 1024 * 1024;

/// The extension appended to a rotated log file.
pub const ROTATED_LOG_SUFFIX: &str = "old";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A rotating log file.
///
/// ```no_run
/// use hyperutils::log::RotatingLog;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let mut log = RotatingLog::new("/var/run/hyper/vm-1/console.log").await?;
///     log.write_line("hyperstart started").await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct RotatingLog {
    file: File,
    path: PathBuf,
    max_size: u64,
    current_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RotatingLog {
    /// Opens a rotating log with the default maximum size.
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_max_size(path, DEFAULT_LOG_MAX_SIZE).await
    }

    /// Opens a rotating log, appending to the file if it already exists.
    pub async fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path).await?;
        let current_size = file.metadata().await?.len();

        Ok(Self {
            file,
            path,
            max_size,
            current_size,
        })
    }

    /// Returns the path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path a rotated file is moved to.
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(ROTATED_LOG_SUFFIX);
        PathBuf::from(name)
    }

    /// Appends a line, rotating first if the line would push the file past its limit.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.current_size > 0 && self.current_size + len > self.max_size {
            self.rotate().await?;
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        self.current_size += len;

        Ok(())
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        fs::rename(&self.path, self.rotated_path()).await?;
        self.file = open_append(&self.path).await?;
        self.current_size = 0;
        tracing::trace!(path = %self.path.display(), "rotated log file");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
