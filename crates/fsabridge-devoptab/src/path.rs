//! Rewriting `device:/path` into the form the filesystem service expects.

use fsabridge_shim::MAX_PATH_LEN;

use crate::error::{Errno, PosixResult};

/// Split `"name:rest"` into the device name and the remainder.
///
/// Paths without a `:` have no device name.
pub fn split_device(path: &str) -> (Option<&str>, &str) {
    match path.split_once(':') {
        Some((device, rest)) => (Some(device), rest),
        None => (None, path),
    }
}

/// Rebase `path` onto `mount_path`.
///
/// Everything through the first `:` is dropped. An absolute remainder is
/// prefixed with `mount_path`; a relative one is passed through unchanged,
/// since the session's working directory already sits on the mount.
pub fn fix_path(path: &str, mount_path: &str) -> PosixResult<String> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    let (_, rest) = split_device(path);
    if rest.is_empty() {
        return Err(Errno::ENOENT);
    }
    if rest.len() > MAX_PATH_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if !rest.starts_with('/') {
        return Ok(rest.to_string());
    }
    let fixed = format!("{mount_path}{rest}");
    if fixed.len() > MAX_PATH_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(fixed)
}
