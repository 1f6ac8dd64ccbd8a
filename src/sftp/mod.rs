//! SFTP file management module
//!
//! Remote file browsing, editing, upload and download for browser sessions.

pub mod error;
pub mod path_utils;
pub mod proxy;
pub mod session;
pub mod types;

pub use error::SftpError;
pub use proxy::{DownloadedFile, FileSession, FileTarget, FileTransferProxy, QuickSession};
pub use session::SftpFileSystem;
pub use types::{FileInfo, FileType};
