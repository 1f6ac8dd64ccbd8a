//! Remote path helpers
//!
//! Remote paths always use `/`, whatever the local or remote OS.

/// Join a listed directory and an entry name.
///
/// The default directory `.` (and the empty string) yields the bare name.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() || base == "." {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Last path component, used to name downloads
pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
}
