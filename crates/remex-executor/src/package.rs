use crate::error::{BackendError, Result};
use crate::scratch::{Scratch, ScratchKey};
use async_trait::async_trait;
use remex_core::config::CodePackageSpec;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use wildmatch::WildMatch;

/// Reference to a packaged code archive, passed to remote jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRef {
    pub location: String,
    pub digest: String,
}

#[async_trait]
pub trait CodePackager: Send + Sync {
    async fn package(&self, spec: &CodePackageSpec, scratch: &dyn Scratch) -> Result<CodeRef>;
}

/// Tars the files selected by the include/exclude globs and uploads the
/// archive under its content digest.
#[derive(Debug, Default, Clone)]
pub struct TarPackager;

impl TarPackager {
    pub fn new() -> Self {
        Self
    }
}

fn matches_any(patterns: &[WildMatch], rel: &str) -> bool {
    patterns.iter().any(|p| p.matches(rel))
}

pub fn collect_files(spec: &CodePackageSpec) -> Result<Vec<(PathBuf, String)>> {
    let include: Vec<WildMatch> = spec.include.iter().map(|g| WildMatch::new(g)).collect();
    let exclude: Vec<WildMatch> = spec.exclude.iter().map(|g| WildMatch::new(g)).collect();

    let mut files = Vec::new();
    for entry in WalkDir::new(&spec.root).sort_by_file_name() {
        let entry = entry.map_err(|e| BackendError::Package(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&spec.root) else {
            continue;
        };
        let rel = relative.to_string_lossy().replace('\\', "/");
        if matches_any(&include, &rel) && !matches_any(&exclude, &rel) {
            files.push((entry.path().to_path_buf(), rel));
        }
    }
    Ok(files)
}

fn build_archive(files: &[(PathBuf, String)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    for (path, rel) in files {
        builder.append_path_with_name(path, Path::new(rel))?;
    }
    Ok(builder.into_inner()?)
}

#[async_trait]
impl CodePackager for TarPackager {
    async fn package(&self, spec: &CodePackageSpec, scratch: &dyn Scratch) -> Result<CodeRef> {
        let spec = spec.clone();
        let (archive, count) = tokio::task::spawn_blocking(move || {
            let files = collect_files(&spec)?;
            build_archive(&files).map(|archive| (archive, files.len()))
        })
        .await
        .map_err(|e| BackendError::Package(e.to_string()))??;

        let digest = format!("{:x}", Sha256::digest(&archive));
        let key = ScratchKey::Code {
            digest: digest.clone(),
        };
        if !scratch.exists(&key).await? {
            scratch.write(&key, &archive).await?;
        }
        let location = scratch.location(&key);
        tracing::info!(
            "Packaged {} files ({} bytes) to {}",
            count,
            archive.len(),
            location
        );
        Ok(CodeRef { location, digest })
    }
}
