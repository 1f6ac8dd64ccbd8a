//! SFTP data types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::path_utils::join_remote_path;
use crate::remote::{RemoteAttrs, RemoteDirEntry};

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Listed directory joined with the name
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time
    pub modified: DateTime<Utc>,
    /// Last three octal digits of the mode, e.g. "755"
    pub permissions: String,
    /// Owner uid
    pub owner: u32,
    /// Group gid
    pub group: u32,
}

impl FileInfo {
    /// Build an entry for `name` inside the directory `dir`
    pub fn from_attrs(dir: &str, name: String, attrs: &RemoteAttrs) -> Self {
        Self {
            path: join_remote_path(dir, &name),
            name,
            file_type: attrs.file_type,
            size: attrs.size,
            modified: Utc
                .timestamp_opt(attrs.mtime, 0)
                .single()
                .unwrap_or_default(),
            permissions: format_permissions(attrs.permissions),
            owner: attrs.uid,
            group: attrs.gid,
        }
    }

    pub fn from_entry(dir: &str, entry: RemoteDirEntry) -> Self {
        Self::from_attrs(dir, entry.name, &entry.attrs)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    /// Classify from the `S_IFMT` bits of a mode; anything unusual is a file
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            _ => FileType::File,
        }
    }
}

fn format_permissions(mode: Option<u32>) -> String {
    mode.map(|p| format!("{:03o}", p & 0o777))
        .unwrap_or_else(|| "000".to_string())
}

/// Directories first, then by name
pub fn sort_entries(entries: &mut [FileInfo]) {
    entries.sort_by(|a, b| {
        let a_is_dir = a.is_dir();
        let b_is_dir = b.is_dir();

        if a_is_dir != b_is_dir {
            return b_is_dir.cmp(&a_is_dir);
        }
        a.name.cmp(&b.name)
    });
}

/// Convert a raw listing into sorted `FileInfo`s
pub fn build_listing(dir: &str, entries: Vec<RemoteDirEntry>) -> Vec<FileInfo> {
    let mut files: Vec<FileInfo> = entries
        .into_iter()
        .map(|entry| FileInfo::from_entry(dir, entry))
        .collect();
    sort_entries(&mut files);
    files
}
