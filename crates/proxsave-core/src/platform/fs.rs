use std::path::Path;

/// Apply a permission mode. No-op outside Unix.
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Apply ownership without following symlinks. Callers treat failure as
/// best-effort: restoring as an unprivileged user keeps the caller's ids.
pub fn apply_owner(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null")
        })?;
        if unsafe { libc::lchown(c_path.as_ptr(), uid, gid) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
        Ok(())
    }
}

pub fn create_symlink(link_target: &Path, target: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
    }

    #[cfg(not(unix))]
    {
        let _ = (link_target, target);
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlink creation is not supported on this platform",
        ))
    }
}

/// Restore atime/mtime. A missing atime reuses the mtime, which matches
/// what tar archives without atime records imply.
pub fn set_file_times(path: &Path, atime_ns: Option<i64>, mtime_ns: i64) -> std::io::Result<()> {
    let mtime = filetime_from_ns(mtime_ns);
    let atime = atime_ns.map(filetime_from_ns).unwrap_or(mtime);
    filetime::set_file_times(path, atime, mtime)
}

fn filetime_from_ns(total_nanos: i64) -> filetime::FileTime {
    let secs = total_nanos.div_euclid(1_000_000_000);
    let nanos = total_nanos.rem_euclid(1_000_000_000) as u32;
    filetime::FileTime::from_unix_time(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_file_times_roundtrips_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamped.txt");
        std::fs::write(&path, b"data").unwrap();

        let target_ns: i64 = 1_700_000_000 * 1_000_000_000;
        set_file_times(&path, None, target_ns).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1_700_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn apply_mode_sets_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.cfg");
        std::fs::write(&path, b"secret").unwrap();

        apply_mode(&path, 0o600).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn apply_owner_keeps_current_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.txt");
        std::fs::write(&path, b"x").unwrap();

        // Re-applying our own uid/gid must always succeed.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        apply_owner(&path, uid, gid).unwrap();
    }
}
