//! Locating backend binaries and classifying why they cannot start.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Why a backend process cannot be launched.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("binary {binary:?} not found on PATH")]
    BinaryNotFound { binary: String },

    #[error("permission denied executing {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("{} is on a filesystem mounted noexec", .path.display())]
    NoExecMount { path: PathBuf },

    #[error("failed to spawn {binary:?}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("pseudo-terminal setup failed: {0}")]
    Pty(String),

    #[error("failed to prepare run directory: {0}")]
    RunDir(#[source] io::Error),
}

/// Resolve `binary` against `$PATH` (or use it directly when it contains
/// a slash) and check that it can actually be executed.
pub fn resolve_binary(binary: &str) -> Result<PathBuf, LaunchError> {
    resolve_binary_in(binary, std::env::var_os("PATH").as_deref())
}

/// [`resolve_binary`] with an explicit search path.
pub fn resolve_binary_in(binary: &str, path_var: Option<&OsStr>) -> Result<PathBuf, LaunchError> {
    let candidate = if binary.contains('/') {
        let p = PathBuf::from(binary);
        p.is_file().then_some(p)
    } else {
        path_var.and_then(|paths| {
            std::env::split_paths(paths)
                .map(|dir| dir.join(binary))
                .find(|p| p.is_file())
        })
    };

    let Some(path) = candidate else {
        return Err(LaunchError::BinaryNotFound {
            binary: binary.to_string(),
        });
    };
    check_executable(&path)?;
    debug!(binary, path = %path.display(), "resolved backend binary");
    Ok(path)
}

#[cfg(unix)]
fn check_executable(path: &Path) -> Result<(), LaunchError> {
    use std::os::unix::fs::PermissionsExt;

    if on_noexec_mount(path) {
        return Err(LaunchError::NoExecMount {
            path: path.to_path_buf(),
        });
    }
    let mode = std::fs::metadata(path)
        .map(|m| m.permissions().mode())
        .unwrap_or(0);
    if mode & 0o111 == 0 || !access_executable(path) {
        return Err(LaunchError::PermissionDenied {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_executable(_path: &Path) -> Result<(), LaunchError> {
    Ok(())
}

#[cfg(unix)]
fn c_path(path: &Path) -> Option<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes()).ok()
}

#[cfg(unix)]
fn access_executable(path: &Path) -> bool {
    let Some(c) = c_path(path) else {
        return false;
    };
    // SAFETY: `c` is a valid NUL-terminated path for the duration of the call.
    unsafe { libc::access(c.as_ptr(), libc::X_OK) == 0 }
}

/// Whether `path` lives on a filesystem mounted `noexec`.
#[cfg(target_os = "linux")]
pub fn on_noexec_mount(path: &Path) -> bool {
    let Some(c) = c_path(path) else {
        return false;
    };
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: statvfs writes into `st` and we only read it on success.
    let rc = unsafe { libc::statvfs(c.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        return false;
    }
    // SAFETY: rc == 0 means the struct was fully initialised.
    let st = unsafe { st.assume_init() };
    st.f_flag & libc::ST_NOEXEC != 0
}

#[cfg(not(target_os = "linux"))]
pub fn on_noexec_mount(_path: &Path) -> bool {
    false
}

/// Turn a spawn-time I/O error into the same classes preflight uses.
pub fn classify_spawn_error(binary: &str, err: io::Error) -> LaunchError {
    match err.kind() {
        io::ErrorKind::NotFound => LaunchError::BinaryNotFound {
            binary: binary.to_string(),
        },
        io::ErrorKind::PermissionDenied => {
            let path = PathBuf::from(binary);
            if on_noexec_mount(&path) {
                LaunchError::NoExecMount { path }
            } else {
                LaunchError::PermissionDenied { path }
            }
        }
        _ => LaunchError::Spawn {
            binary: binary.to_string(),
            source: err,
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn finds_executable_on_search_path() {
        let tmp = tempfile::tempdir().unwrap();
        let expected = write_file(tmp.path(), "fake-cli", 0o755);
        let found = resolve_binary_in("fake-cli", Some(tmp.path().as_os_str())).unwrap();
        assert_eq!(found, expected);
    }

    #[test]
    fn missing_binary_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_binary_in("definitely-not-here", Some(tmp.path().as_os_str())).unwrap_err();
        assert!(matches!(err, LaunchError::BinaryNotFound { .. }));

        let err = resolve_binary_in("anything", None).unwrap_err();
        assert!(matches!(err, LaunchError::BinaryNotFound { .. }));
    }

    #[test]
    fn non_executable_file_is_permission_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "plain", 0o644);
        let err = resolve_binary_in(path.to_str().unwrap(), None).unwrap_err();
        assert!(matches!(err, LaunchError::PermissionDenied { .. }), "{err:?}");
    }

    #[test]
    fn explicit_path_bypasses_search() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "direct", 0o755);
        assert_eq!(resolve_binary_in(path.to_str().unwrap(), None).unwrap(), path);
    }

    #[test]
    fn spawn_errors_are_classified() {
        let err = classify_spawn_error("claude", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, LaunchError::BinaryNotFound { .. }));
        let err = classify_spawn_error("claude", io::Error::other("boom"));
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
