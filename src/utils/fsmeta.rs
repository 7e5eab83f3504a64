use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Modification time as seconds since the epoch, 0 when unreadable.
pub fn mtime_secs(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// File size; directories report 0.
pub fn size_bytes(meta: &Metadata) -> u64 {
    if meta.is_dir() {
        0
    } else {
        meta.len()
    }
}

/// Lowercased extension of a path string, if any.
pub fn extension_lower(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Filesystem types that do not deliver inotify events.
const NETWORK_FS: &[&str] = &["nfs", "nfs4", "cifs", "smb", "smbfs", "fuse.sshfs"];

/// Check whether a path sits on a network mount by consulting /proc/mounts.
///
/// Used as a backstop: a bookmark mis-flagged as local still must not get an
/// inotify watcher if the kernel will never deliver events for it.
pub fn is_network_mount(path: &Path) -> bool {
    let mounts = match std::fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(_) => return false,
    };
    is_network_mount_in(path, &mounts)
}

fn is_network_mount_in(path: &Path, mounts: &str) -> bool {
    let path_str = path.to_string_lossy();

    // Longest matching mount point decides
    let mut best: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(_dev), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if crate::index::types::path_under(mount_point, &path_str) {
            match best {
                Some((prev, _)) if prev.len() >= mount_point.len() => {}
                _ => best = Some((mount_point, fs_type)),
            }
        }
    }

    best.is_some_and(|(_, fs_type)| NETWORK_FS.contains(&fs_type))
}
