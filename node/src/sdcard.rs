use beecam_common::config::StorageConfig;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum SdError {
    #[error("SD card not mounted")]
    NotMounted,
    #[error("SD mount failed earlier and is not retried: {0}")]
    PreviouslyFailed(String),
    #[allow(dead_code)]
    #[error("failed to enable SD power: {0}")]
    Power(String),
    #[allow(dead_code)]
    #[error("failed to initialize SPI bus: {0}")]
    SpiBus(String),
    #[allow(dead_code)]
    #[error("failed to configure SD slot: {0}")]
    Slot(String),
    #[error("failed to mount FAT filesystem: {0}")]
    Mount(String),
    #[error("path {0} is outside the mount point")]
    OutsideMount(PathBuf),
    #[error("path exists but is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("mkdir failed for {0}: {1}")]
    Mkdir(PathBuf, std::io::Error),
    #[error("failed to read directory {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("failed to open file {0}: {1}")]
    FileOpen(PathBuf, std::io::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("short write to {path}: {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiBusConfig {
    pub max_freq_khz: u32,
    pub max_transfer_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    pub format_if_mount_failed: bool,
    pub max_files: u32,
    pub allocation_unit_size: u32,
}

/// Hardware steps needed to bring up an SPI-attached SD card.
///
/// Called in order by [`SdCard::init`]: power, bus, slot, filesystem.
pub trait SdHost: Send {
    fn enable_power(&mut self) -> Result<(), SdError>;
    fn init_spi_bus(&mut self, bus: &SpiBusConfig) -> Result<(), SdError>;
    /// Chip-select and card-detect lines.
    fn configure_slot(&mut self) -> Result<(), SdError>;
    /// Mount the FAT volume; returns the root of the mounted filesystem.
    fn mount_fat(&mut self, mount_point: &Path, options: &MountOptions) -> Result<PathBuf, SdError>;

    /// Create a file on the mounted volume, failing if it already exists.
    fn create_file(&self, path: &Path) -> std::io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(file))
    }
}

/// SD host backed by a plain directory.
///
/// "Formatting" a card that fails to mount creates the directory.
#[derive(Debug, Default)]
pub struct DirectoryHost;

impl SdHost for DirectoryHost {
    fn enable_power(&mut self) -> Result<(), SdError> {
        debug!("SD enable line driven low");
        Ok(())
    }

    fn init_spi_bus(&mut self, bus: &SpiBusConfig) -> Result<(), SdError> {
        debug!(
            max_freq_khz = bus.max_freq_khz,
            max_transfer_size = bus.max_transfer_size,
            "SPI bus initialized"
        );
        Ok(())
    }

    fn configure_slot(&mut self) -> Result<(), SdError> {
        debug!("SD slot configured");
        Ok(())
    }

    fn mount_fat(&mut self, mount_point: &Path, options: &MountOptions) -> Result<PathBuf, SdError> {
        match std::fs::metadata(mount_point) {
            Ok(meta) if meta.is_dir() => Ok(mount_point.to_path_buf()),
            Ok(_) => Err(SdError::Mount(format!(
                "{} is not a directory",
                mount_point.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && options.format_if_mount_failed => {
                info!(path = %mount_point.display(), "no filesystem found, formatting");
                std::fs::create_dir_all(mount_point)
                    .map_err(|e| SdError::Mount(format!("format failed: {e}")))?;
                Ok(mount_point.to_path_buf())
            }
            Err(e) => Err(SdError::Mount(format!("{}: {e}", mount_point.display()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted(PathBuf),
    Failed(String),
}

/// SD card session: mount state plus the file operations that need it.
pub struct SdCard {
    host: Box<dyn SdHost>,
    mount_point: PathBuf,
    bus: SpiBusConfig,
    options: MountOptions,
    state: MountState,
}

impl SdCard {
    pub fn new(host: Box<dyn SdHost>, config: &StorageConfig) -> Self {
        Self {
            host,
            mount_point: config.mount_point.clone(),
            bus: SpiBusConfig {
                max_freq_khz: config.spi_max_freq_khz,
                max_transfer_size: config.spi_max_transfer_size,
            },
            options: MountOptions {
                format_if_mount_failed: config.format_if_mount_failed,
                max_files: config.max_files,
                allocation_unit_size: config.allocation_unit_size,
            },
            state: MountState::Unmounted,
        }
    }

    /// Mount the card once. Repeated calls after success are no-ops; a
    /// failed mount stays failed.
    pub fn init(&mut self) -> Result<(), SdError> {
        match &self.state {
            MountState::Mounted(_) => return Ok(()),
            MountState::Failed(reason) => return Err(SdError::PreviouslyFailed(reason.clone())),
            MountState::Unmounted => {}
        }

        info!(mount_point = %self.mount_point.display(), "initializing SD card over SPI");
        match self.mount_sequence() {
            Ok(root) => {
                info!(root = %root.display(), "SD card mounted successfully");
                self.state = MountState::Mounted(root);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "SD card mount failed");
                self.state = MountState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn mount_sequence(&mut self) -> Result<PathBuf, SdError> {
        self.host.enable_power()?;
        self.host.init_spi_bus(&self.bus)?;
        self.host.configure_slot()?;
        self.host.mount_fat(&self.mount_point, &self.options)
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &MountState {
        &self.state
    }

    #[allow(dead_code)]
    pub fn is_mounted(&self) -> bool {
        matches!(self.state, MountState::Mounted(_))
    }

    fn root(&self) -> Result<&Path, SdError> {
        match &self.state {
            MountState::Mounted(root) => Ok(root),
            _ => Err(SdError::NotMounted),
        }
    }

    /// Resolve a path relative to the card root. Absolute paths must lie
    /// under the mount point.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, SdError> {
        let root = self.root()?;
        if path.is_absolute() {
            let rel = path
                .strip_prefix(&self.mount_point)
                .map_err(|_| SdError::OutsideMount(path.to_path_buf()))?;
            return Ok(root.join(rel));
        }
        Ok(root.join(path))
    }

    /// Succeeds if the directory exists or was created; fails if the path
    /// is taken by something else.
    pub fn create_dir(&self, path: &Path) -> Result<PathBuf, SdError> {
        let full = self.resolve(path)?;
        match std::fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => {
                info!(path = %full.display(), "dir already exists");
                Ok(full)
            }
            Ok(_) => {
                error!(path = %full.display(), "path exists but is not a directory");
                Err(SdError::NotADirectory(full))
            }
            Err(_) => match std::fs::create_dir(&full) {
                Ok(()) => {
                    info!(path = %full.display(), "created dir");
                    Ok(full)
                }
                Err(e) => {
                    error!(path = %full.display(), error = %e, "mkdir failed");
                    Err(SdError::Mkdir(full, e))
                }
            },
        }
    }

    /// Number of regular files directly inside `path`.
    pub fn count_files(&self, path: &Path) -> Result<usize, SdError> {
        let full = self.resolve(path)?;
        let entries = std::fs::read_dir(&full).map_err(|e| SdError::ReadDir(full.clone(), e))?;
        let count = entries
            .flatten()
            .filter(|entry| entry.metadata().map(|m| m.is_file()).unwrap_or(false))
            .count();
        Ok(count)
    }

    pub fn exists(&self, dir: &Path, name: &str) -> Result<bool, SdError> {
        Ok(self.resolve(dir)?.join(name).exists())
    }

    /// Create `dir/name` (never overwriting) and write all of `data`.
    pub fn write_file(&self, dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf, SdError> {
        let path = self.resolve(dir)?.join(name);
        let mut file = self
            .host
            .create_file(&path)
            .map_err(|e| SdError::FileOpen(path.clone(), e))?;
        let written = write_fully(&mut *file, data).map_err(|source| SdError::Write {
            path: path.clone(),
            source,
        })?;
        if written != data.len() {
            return Err(SdError::ShortWrite {
                path,
                written,
                expected: data.len(),
            });
        }
        debug!(path = %path.display(), bytes = written, "file written");
        Ok(path)
    }
}

// Stops at the first zero-length write instead of erroring, so callers see
// how much made it to the card.
fn write_fully<W: Write + ?Sized>(file: &mut W, data: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    file.flush()?;
    Ok(written)
}
