use chrono::{NaiveDateTime, Timelike};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const PHOTO_PREFIX: &str = "photo";
const DETECT_PREFIX: &str = "detect";
const EXTENSION: &str = ".jpg";

/// How persisted JPEG files are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingScheme {
    /// `photo007.jpg`, `detect003_n0.jpg`
    #[default]
    Counter,
    /// `2025-06-01_14-03-59-042.jpg`, or `no_time_12-345.jpg` before the clock is set.
    Timestamp,
}

/// Point in time a filename is derived from.
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    /// Local wall-clock time, `None` while the clock is not synchronized.
    pub wall: Option<NaiveDateTime>,
    /// Time since boot.
    pub uptime: Duration,
}

/// Generates unique artifact filenames for one photo directory.
///
/// Owned by the application context; there are no process-wide counters.
#[derive(Debug)]
pub struct FileNamer {
    scheme: NamingScheme,
    next_photo: u32,
    next_detect: u32,
    last_stem: Option<String>,
    repeats: u32,
}

impl FileNamer {
    pub fn new(scheme: NamingScheme) -> Self {
        Self {
            scheme,
            next_photo: 0,
            next_detect: 0,
            last_stem: None,
            repeats: 0,
        }
    }

    pub fn scheme(&self) -> NamingScheme {
        self.scheme
    }

    /// Resume counters after the highest index already present in `dir`.
    /// A missing directory leaves the counters at zero.
    pub fn seed_from_dir(&mut self, dir: &Path) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(idx) = counter_index(name, PHOTO_PREFIX) {
                self.next_photo = self.next_photo.max(idx.saturating_add(1));
            } else if let Some(idx) = counter_index(name, DETECT_PREFIX) {
                self.next_detect = self.next_detect.max(idx.saturating_add(1));
            }
        }
        debug!(
            dir = %dir.display(),
            next_photo = self.next_photo,
            next_detect = self.next_detect,
            "filename counters seeded"
        );
        Ok(())
    }

    /// Name for a plain snapshot.
    pub fn next_photo(&mut self, stamp: Stamp) -> String {
        match self.scheme {
            NamingScheme::Counter => {
                let n = self.next_photo;
                self.next_photo = self.next_photo.wrapping_add(1);
                format!("{PHOTO_PREFIX}{n:03}{EXTENSION}")
            }
            NamingScheme::Timestamp => {
                let stem = timestamp_stem(stamp);
                self.unique(stem)
            }
        }
    }

    /// Name for a snapshot annotated with a detection count.
    pub fn next_detection(&mut self, stamp: Stamp, count: usize) -> String {
        match self.scheme {
            NamingScheme::Counter => {
                let n = self.next_detect;
                self.next_detect = self.next_detect.wrapping_add(1);
                format!("{DETECT_PREFIX}{n:03}_n{count}{EXTENSION}")
            }
            NamingScheme::Timestamp => {
                let stem = format!("{}_n{count}", timestamp_stem(stamp));
                self.unique(stem)
            }
        }
    }

    // Two requests inside the same millisecond get `_1`, `_2`, ... appended.
    fn unique(&mut self, stem: String) -> String {
        if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.repeats += 1;
            format!("{stem}_{}{EXTENSION}", self.repeats)
        } else {
            self.repeats = 0;
            let name = format!("{stem}{EXTENSION}");
            self.last_stem = Some(stem);
            name
        }
    }
}

fn timestamp_stem(stamp: Stamp) -> String {
    match stamp.wall {
        Some(wall) => format!(
            "{}-{:03}",
            wall.format("%Y-%m-%d_%H-%M-%S"),
            wall.nanosecond() / 1_000_000 % 1000
        ),
        None => format!(
            "no_time_{}-{:03}",
            stamp.uptime.as_secs(),
            stamp.uptime.subsec_millis()
        ),
    }
}

fn counter_index(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_suffix(EXTENSION)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// True for names this crate writes: any `.jpg` file.
pub fn is_artifact_name(name: &str) -> bool {
    name.len() > EXTENSION.len() && name.to_ascii_lowercase().ends_with(EXTENSION)
}
