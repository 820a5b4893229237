//! Per-message spool management.
//!
//! Each message transaction gets an isolated work directory under the
//! configured base, holding a single `email.txt` file with the normalized
//! headers and verbatim body. The analysis engine reads the file by path, so
//! the file is group-readable and the directory group-searchable. The whole
//! area is torn down unconditionally at the end of the transaction.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Name of the message file inside the work directory.
pub const SPOOL_FILE_NAME: &str = "email.txt";

/// Prefix of every work directory name.
const DIR_PREFIX: &str = "af";

// Owner rwx, group rx. The engine runs as a group member and needs to
// descend into the directory and read the message file.
const DIR_MODE: u32 = 0o750;
const FILE_MODE: u32 = 0o640;

/// Staging area for one message: a work directory, the spool file inside it,
/// and the open handle while content is being written.
///
/// `dispose` (also run on drop) releases everything and is safe to call any
/// number of times, so every exit path from the owning transaction tears the
/// area down exactly once.
pub struct Spool {
    work_dir: Option<PathBuf>,
    mail_file: Option<PathBuf>,
    file: Option<File>,
}

impl Spool {
    /// Creates the work directory and opens the spool file inside it.
    ///
    /// The directory name is derived from the queue identifier when one is
    /// available (`af<queue_id>`), giving operators a predictable path to
    /// correlate with MTA logs. If that name cannot be created (collision,
    /// I/O error, or no queue id), a unique `af<token>` name is generated
    /// instead. Failure of the fallback is a hard error.
    pub fn create(base_dir: &Path, queue_id: Option<&str>) -> Result<Self> {
        let work_dir = Self::create_work_dir(base_dir, queue_id)?;
        let mail_file = work_dir.join(SPOOL_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&mail_file)
            .with_context(|| {
                format!("could not create message file {}", mail_file.display())
            })?;
        // Set the mode explicitly so the process umask cannot widen or
        // narrow it.
        file.set_permissions(Permissions::from_mode(FILE_MODE))
            .with_context(|| {
                format!("could not change mode of file {}", mail_file.display())
            })?;
        debug!("create message file {}", mail_file.display());

        Ok(Spool {
            work_dir: Some(work_dir),
            mail_file: Some(mail_file),
            file: Some(file),
        })
    }

    fn create_work_dir(base_dir: &Path, queue_id: Option<&str>) -> Result<PathBuf> {
        // Deterministic name first.
        if let Some(qid) = queue_id {
            let dir = base_dir.join(format!("{DIR_PREFIX}{qid}"));
            if fs::create_dir(&dir).is_ok() {
                fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE))
                    .with_context(|| {
                        format!("could not change mode of directory {}", dir.display())
                    })?;
                debug!("create work directory {}", dir.display());
                return Ok(dir);
            }
        }

        // Unique fallback.
        let dir = base_dir.join(format!(
            "{DIR_PREFIX}{}",
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir(&dir).with_context(|| {
            format!("could not create work directory {}", dir.display())
        })?;
        fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE)).with_context(|| {
            format!("could not change mode of directory {}", dir.display())
        })?;
        debug!("create work directory {}", dir.display());
        Ok(dir)
    }

    /// Appends one header line as `field: value` with a single `\n`
    /// terminator. Any trailing CR/LF on the value is stripped first; the
    /// engine's content parser requires normalized line endings rather than
    /// SMTP's CRLF.
    pub fn write_header(&mut self, field: &str, value: &str) -> Result<()> {
        let value = value.trim_end_matches(['\r', '\n']);
        let (file, path) = self.open_file()?;
        file.write_all(format!("{field}: {value}\n").as_bytes())
            .with_context(|| format!("could not write to message file {}", path.display()))
    }

    /// Appends the blank line separating headers from body.
    pub fn end_headers(&mut self) -> Result<()> {
        let (file, path) = self.open_file()?;
        file.write_all(b"\n")
            .with_context(|| format!("could not write to message file {}", path.display()))
    }

    /// Appends a raw body chunk verbatim, no reinterpretation.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let (file, path) = self.open_file()?;
        file.write_all(chunk)
            .with_context(|| format!("could not write to message file {}", path.display()))
    }

    /// Closes the spool file, surfacing any pending write-back error.
    /// Closing an already-closed spool is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let path = self.mail_file.as_deref().unwrap_or(Path::new(SPOOL_FILE_NAME));
            file.sync_all().with_context(|| {
                format!("could not close message file {}", path.display())
            })?;
            debug!("close message file {}", path.display());
        }
        Ok(())
    }

    /// Path of the work directory, while the spool is live.
    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    /// Path of the message file, while the spool is live.
    pub fn mail_file(&self) -> Option<&Path> {
        self.mail_file.as_deref()
    }

    /// Releases the whole work area: closes the file if open, unlinks the
    /// message file and removes the directory. A path that is already gone
    /// counts as removed; any other removal failure (including a non-empty
    /// directory) is logged and otherwise ignored. Calling this on a
    /// disposed or never-initialized spool is a no-op.
    pub fn dispose(&mut self) {
        self.file.take();

        if let Some(mail_file) = self.mail_file.take() {
            match fs::remove_file(&mail_file) {
                Ok(()) => debug!("unlink message file {}", mail_file.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("message file {} already removed", mail_file.display())
                }
                Err(e) => warn!(
                    "could not unlink message file {}: {}",
                    mail_file.display(),
                    e
                ),
            }
        }

        if let Some(work_dir) = self.work_dir.take() {
            match fs::remove_dir(&work_dir) {
                Ok(()) => debug!("remove work directory {}", work_dir.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("work directory {} already removed", work_dir.display())
                }
                Err(e) => warn!(
                    "could not remove work directory {}: {}",
                    work_dir.display(),
                    e
                ),
            }
        }
    }

    fn open_file(&mut self) -> Result<(&mut File, &Path)> {
        match (self.file.as_mut(), self.mail_file.as_deref()) {
            (Some(file), Some(path)) => Ok((file, path)),
            _ => bail!("spool file is not open"),
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.dispose();
    }
}
