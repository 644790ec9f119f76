use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use crate::{engine::Workspace, types::NO_FILE_SCRIPT_PATH};

pub fn normalise_path(path: &Path) -> Cow<'_, Path> {
    // Try to expand tilde prefix to home directory
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return Cow::Owned(home.join(stripped));
        }
        // If home directory cannot be determined, log and return path as-is
        tracing::warn!("cannot determine home directory, using path as-is");
    }
    Cow::Borrowed(path)
}

/// Path to show the client for a script the engine reports.
///
/// Returns the local path and, for remote sessions, the original remote path.
pub(crate) fn client_script_path(
    workspace: &dyn Workspace,
    engine_path: Option<&Path>,
    remote: bool,
) -> (PathBuf, Option<PathBuf>) {
    match engine_path {
        None => (PathBuf::from(NO_FILE_SCRIPT_PATH), None),
        Some(path) if !remote => (path.to_path_buf(), None),
        Some(remote_path) => {
            let local = workspace
                .resolve_local_shadow_path(remote_path)
                .unwrap_or_else(|| {
                    tracing::warn!(
                        remote_path = %remote_path.display(),
                        "no local copy of remote script, reporting remote path"
                    );
                    remote_path.to_path_buf()
                });
            (local, Some(remote_path.to_path_buf()))
        }
    }
}
