//! `hyperutils::path` contains guest path helpers used when validating mount points.

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{HyperutilsError, HyperutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Lexically cleans a guest mount path.
///
/// Redundant separators and `.` components are dropped and `..` is resolved against the
/// preceding component. A relative path is treated as relative to the guest root, so the
/// result always starts with `/`. Traversing above the root is an error.
pub fn clean_mount_path(path: &str) -> HyperutilsResult<String> {
    if path.is_empty() {
        return Err(HyperutilsError::PathValidation(
            "mount path cannot be empty".to_string(),
        ));
    }

    let parsed = Utf8UnixPathBuf::from(path);
    let mut parts: Vec<&str> = Vec::new();

    for component in parsed.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => {}
            Utf8UnixComponent::ParentDir => {
                if parts.pop().is_none() {
                    return Err(HyperutilsError::PathValidation(format!(
                        "mount path {path} escapes the guest root"
                    )));
                }
            }
            Utf8UnixComponent::Normal(c) => {
                if !c.is_empty() {
                    parts.push(c);
                }
            }
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Returns `true` if the mount path refers to the guest root directory.
///
/// Paths that cannot be cleaned are reported as root so callers reject them.
pub fn is_root_mount(path: &str) -> bool {
    clean_mount_path(path).map_or(true, |p| p == "/")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
