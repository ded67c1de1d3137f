// Configuration backups

//! Point-in-time backups of one configuration
//!
//! A backup is a pair of files in the backup directory:
//! `<name>_<YYYYMMDDHHMMSS>.conf` holds the configuration file as it was,
//! and the sibling `.sql` holds the store dump of the configuration's
//! tables, one INSERT statement per line. Restoring is driven by
//! [`crate::configuration::Configuration::restore_backup`]; this module only
//! deals with the files.

use crate::error::{Error, Missing, Result};
use chrono::{Duration, Local, NaiveDateTime};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const STAMP_LEN: usize = 14;

/// A freshly written backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub filename: String,
    pub backup_date: NaiveDateTime,
}

/// One listed backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub filename: String,
    pub backup_date: NaiveDateTime,
    /// Configuration file content at backup time
    pub content: String,
    /// Whether the store dump is present
    pub has_dump: bool,
}

/// Contents of a backup pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFiles {
    pub conf: String,
    /// `None` when the `.sql` sibling is missing
    pub dump: Option<String>,
}

/// Backup directory of one configuration
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

fn dump_name(filename: &str) -> String {
    match filename.strip_suffix(".conf") {
        Some(stem) => format!("{}.sql", stem),
        None => format!("{}.sql", filename),
    }
}

/// Timestamp of a backup file belonging to `name`, if it is one
fn backup_stamp(name: &str, filename: &str) -> Option<NaiveDateTime> {
    let stamp = filename
        .strip_prefix(name)?
        .strip_prefix('_')?
        .strip_suffix(".conf")?;
    if stamp.len() != STAMP_LEN || !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

impl BackupManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the file content and store dump as a new backup pair
    ///
    /// Names have second precision; a second backup within the same second
    /// takes the next free stamp instead of overwriting the first.
    pub fn backup(&self, name: &str, conf: &str, dump: &[String]) -> Result<BackupRecord> {
        fs::create_dir_all(&self.dir)?;
        let now = Local::now().naive_local();
        let mut backup_date = NaiveDateTime::parse_from_str(
            &now.format(STAMP_FORMAT).to_string(),
            STAMP_FORMAT,
        )
        .unwrap_or(now);
        let mut filename = format!("{}_{}.conf", name, backup_date.format(STAMP_FORMAT));
        while self.dir.join(&filename).exists() || self.dir.join(dump_name(&filename)).exists() {
            backup_date += Duration::seconds(1);
            filename = format!("{}_{}.conf", name, backup_date.format(STAMP_FORMAT));
        }

        fs::write(self.dir.join(&filename), conf)?;
        let mut sql = dump.join("\n");
        if !sql.is_empty() {
            sql.push('\n');
        }
        fs::write(self.dir.join(dump_name(&filename)), sql)?;

        log::info!(target: "activity", "Backup {} created for {}", filename, name);
        Ok(BackupRecord {
            filename,
            backup_date,
        })
    }

    /// Backups of `name`, newest first
    pub fn list(&self, name: &str) -> Result<Vec<BackupEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(backup_date) = backup_stamp(name, &filename) else {
                continue;
            };
            let content = fs::read_to_string(entry.path())?;
            let has_dump = self.dir.join(dump_name(&filename)).is_file();
            backups.push(BackupEntry {
                filename,
                backup_date,
                content,
                has_dump,
            });
        }
        backups.sort_by(|a, b| b.backup_date.cmp(&a.backup_date));
        Ok(backups)
    }

    /// Reject filenames that are not a listed backup of `name`
    fn ensure_listed(&self, name: &str, filename: &str) -> Result<PathBuf> {
        let path = self.dir.join(filename);
        if backup_stamp(name, filename).is_none() || !path.is_file() {
            return Err(Error::not_found(Missing::Backup, filename));
        }
        Ok(path)
    }

    /// Read a backup pair
    pub fn read(&self, name: &str, filename: &str) -> Result<BackupFiles> {
        let path = self.ensure_listed(name, filename)?;
        let conf = fs::read_to_string(path)?;
        let dump = match fs::read_to_string(self.dir.join(dump_name(filename))) {
            Ok(dump) => Some(dump),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(BackupFiles { conf, dump })
    }

    /// Remove a backup pair
    pub fn delete(&self, name: &str, filename: &str) -> Result<()> {
        let path = self.ensure_listed(name, filename)?;
        fs::remove_file(path)?;
        let dump = self.dir.join(dump_name(filename));
        if dump.is_file() {
            fs::remove_file(dump)?;
        }
        log::info!(target: "activity", "Backup {} of {} deleted", filename, name);
        Ok(())
    }

    /// Bundle a backup pair into a zip archive under `download_dir`
    ///
    /// Returns the archive path.
    pub fn download(&self, name: &str, filename: &str, download_dir: &Path) -> Result<PathBuf> {
        let files = self.read(name, filename)?;
        fs::create_dir_all(download_dir)?;
        let archive = download_dir.join(format!("{}.zip", uuid::Uuid::new_v4()));

        let file = fs::File::create(&archive)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        zip.start_file(filename, options)?;
        zip.write_all(files.conf.as_bytes())?;
        if let Some(dump) = &files.dump {
            zip.start_file(dump_name(filename), options)?;
            zip.write_all(dump.as_bytes())?;
        }
        zip.finish()?;

        Ok(archive)
    }
}
