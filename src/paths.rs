// Finding the ComfyUI installation.
// We don't know where we're run from, so we look upwards from the start directory
// until we hit something with the right name.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{info, warn};

pub const COMFYUI_DIR: &str = "ComfyUI";
pub const EXTRA_MODEL_PATHS: &str = "extra_model_paths.yaml";

/// What we found of the host installation. Either part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Installation {
    pub comfyui_dir: Option<PathBuf>,
    pub extra_model_paths: Option<PathBuf>,
}

/// Searches `start` (default: the working directory) and then each of its ancestors
/// for an entry called exactly `name`. The closest match wins.
///
/// Returns `Ok(None)` if nothing up to and including the root matches.
/// Errors only come from listing directories.
pub fn find_path(name: &str, start: Option<&Path>) -> io::Result<Option<PathBuf>> {
    let mut current = match start {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => std::env::current_dir()?.join(path),
        None => std::env::current_dir()?,
    };
    // One step per component, plus one for the root.
    let max_depth = current.components().count() + 1;
    for _ in 0..max_depth {
        if dir_contains(&current, name)? {
            let found = current.join(name);
            info!("{} found: {}", name, found.display());
            return Ok(Some(found));
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            // Root reached.
            _ => break,
        }
    }
    Ok(None)
}

// Uses the listing rather than exists(), so dangling symlinks still count.
fn dir_contains(dir: &Path, name: &str) -> io::Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        if entry?.file_name() == name {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Locates the ComfyUI directory and the optional extra model paths file.
pub fn locate_installation(start: Option<&Path>) -> Result<Installation> {
    let comfyui_dir = find_path(COMFYUI_DIR, start)
        .with_context(|| format!("failed to search for {}", COMFYUI_DIR))?
        .filter(|p| p.is_dir());
    match &comfyui_dir {
        Some(dir) => info!("'{}' registered as the ComfyUI installation", dir.display()),
        None => warn!(
            "Could not find a {} directory; the server must already be running",
            COMFYUI_DIR
        ),
    }

    let extra_model_paths = find_path(EXTRA_MODEL_PATHS, start)
        .with_context(|| format!("failed to search for {}", EXTRA_MODEL_PATHS))?;
    if extra_model_paths.is_none() {
        info!("Could not find the extra_model_paths config file.");
    }

    Ok(Installation {
        comfyui_dir,
        extra_model_paths,
    })
}
