//! Packing of WASM build outputs into a flat distribution tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Build targets copied into the distribution, by directory name.
pub const BUILD_TARGETS: &[&str] = &[
    "Tutorial01_HelloTriangle",
    "Tutorial02_Cube",
    "Tutorial03_Texturing",
    "Tutorial04_Instancing",
    "Tutorial05_TextureArray",
    "Tutorial06_Multithreading",
    "Tutorial09_Quads",
    "Tutorial10_DataStreaming",
    "Tutorial11_ResourceUpdates",
    "Tutorial12_RenderTarget",
    "Tutorial13_ShadowMap",
    "Tutorial14_ComputeShader",
    "Tutorial16_BindlessResources",
    "Tutorial17_MSAA",
    "Tutorial18_Queries",
    "Tutorial19_RenderPasses",
    "Tutorial26_StateCache",
    "Tutorial27_PostProcessing",
    "Atmosphere",
    "ImguiDemo",
    "Shadows",
    "GLTFViewer",
];

/// Top-level entries of a target directory that are never copied.
pub const EXCLUDED_ENTRIES: &[&str] = &["CMakeFiles", "cmake_install.cmake"];

/// Directories of the build tree searched for each target, in order.
const SEARCH_DIRS: &[&str] = &["Tutorials", "Samples"];

#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A target that was found and copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTarget {
    pub name: String,
    pub source: PathBuf,
    pub files: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackReport {
    pub packed: Vec<PackedTarget>,
    /// Targets found in neither `Tutorials/` nor `Samples/`.
    pub missing: Vec<String>,
}

/// Copies every entry of [`BUILD_TARGETS`] from `source_dir` into `destination_dir`.
pub fn pack_artifacts(source_dir: &Path, destination_dir: &Path) -> Result<PackReport, PackError> {
    pack_targets(source_dir, destination_dir, BUILD_TARGETS)
}

/// Copies the named targets, merging into any existing destination directories.
pub fn pack_targets(
    source_dir: &Path,
    destination_dir: &Path,
    targets: &[&str],
) -> Result<PackReport, PackError> {
    create_dir(destination_dir)?;

    let mut report = PackReport::default();
    for &name in targets {
        let found = SEARCH_DIRS
            .iter()
            .map(|dir| source_dir.join(dir).join(name))
            .find(|candidate| candidate.exists());

        let Some(source) = found else {
            warn!("target '{}' not found", name);
            report.missing.push(name.to_string());
            continue;
        };

        let files = copy_filtered(&source, &destination_dir.join(name))?;
        info!("packed {} ({} files)", name, files);
        report.packed.push(PackedTarget {
            name: name.to_string(),
            source,
            files,
        });
    }

    Ok(report)
}

/// Copies `source` into `destination`, skipping [`EXCLUDED_ENTRIES`] at the top level only.
fn copy_filtered(source: &Path, destination: &Path) -> Result<usize, PackError> {
    create_dir(destination)?;

    let mut files = 0;
    for entry in read_dir(source)? {
        let name = entry.file_name();
        if EXCLUDED_ENTRIES.iter().any(|excluded| name == *excluded) {
            debug!("skipping {}", entry.path().display());
            continue;
        }
        files += copy_entry(&entry.path(), &destination.join(&name))?;
    }
    Ok(files)
}

fn copy_tree(source: &Path, destination: &Path) -> Result<usize, PackError> {
    create_dir(destination)?;

    let mut files = 0;
    for entry in read_dir(source)? {
        files += copy_entry(&entry.path(), &destination.join(entry.file_name()))?;
    }
    Ok(files)
}

fn copy_entry(from: &Path, to: &Path) -> Result<usize, PackError> {
    if from.is_dir() {
        copy_tree(from, to)
    } else {
        fs::copy(from, to).map_err(|source| PackError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })?;
        Ok(1)
    }
}

fn create_dir(path: &Path) -> Result<(), PackError> {
    fs::create_dir_all(path).map_err(|source| PackError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn read_dir(path: &Path) -> Result<Vec<fs::DirEntry>, PackError> {
    let read_error = |source| PackError::ReadDir {
        path: path.to_path_buf(),
        source,
    };
    fs::read_dir(path)
        .map_err(read_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)
}
