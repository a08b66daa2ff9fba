// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Source patching with mandatory backup and rollback
//!
//! A patch replaces the single occurrence of [`PatchLocation::find`] in a
//! file under the patch root. The original is copied to `<file>.bak`
//! first. The patched text is written to a staging file next to the
//! original and validated there; only a valid patch is renamed over the
//! live file. A missing or ambiguous location writes nothing.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

use migration_types::PatchLocation;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Patch location not found in {0}")]
    NotFound(PathBuf),

    #[error("Patch location occurs {count} times in {path}")]
    Ambiguous { path: PathBuf, count: usize },

    #[error("Patched file failed validation: {0}")]
    Invalid(String),

    #[error("Validator could not be run: {0}")]
    Validator(String),

    #[error("Path {0} is outside the patch root")]
    OutsideRoot(PathBuf),

    #[error("No patch root configured")]
    NoRoot,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
    move |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A successfully applied patch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedPatch {
    pub file: PathBuf,
    pub backup: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SourcePatcher {
    root: Option<PathBuf>,
    validator: Option<String>,
}

impl SourcePatcher {
    pub fn new(root: Option<PathBuf>, validator: Option<String>) -> Self {
        Self { root, validator }
    }

    pub fn set_validator(&mut self, validator: Option<String>) {
        self.validator = validator;
    }

    /// Resolve `file` under the root, rejecting absolute paths that leave
    /// it and any `..` component.
    fn resolve(&self, file: &Path) -> Result<PathBuf, PatchError> {
        let root = self.root.as_ref().ok_or(PatchError::NoRoot)?;
        let relative = if file.is_absolute() {
            file.strip_prefix(root)
                .map_err(|_| PatchError::OutsideRoot(file.to_path_buf()))?
        } else {
            file
        };
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PatchError::OutsideRoot(file.to_path_buf()));
        }
        Ok(root.join(relative))
    }

    pub async fn apply(
        &self,
        location: &PatchLocation,
        content: &str,
    ) -> Result<AppliedPatch, PatchError> {
        let path = self.resolve(&location.file)?;
        let original = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_err(&path))?;

        if location.find.is_empty() {
            return Err(PatchError::NotFound(path));
        }
        match original.matches(location.find.as_str()).count() {
            0 => return Err(PatchError::NotFound(path)),
            1 => {}
            count => return Err(PatchError::Ambiguous { path, count }),
        }

        let mut backup = path.as_os_str().to_os_string();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        tokio::fs::copy(&path, &backup)
            .await
            .map_err(io_err(&backup))?;

        let patched = original.replacen(location.find.as_str(), content, 1);
        let staged = staging_path(&path);
        let result = match tokio::fs::write(&staged, &patched).await {
            Ok(()) => self.validate(&staged).await,
            Err(e) => Err(PatchError::Io {
                path: staged.clone(),
                source: e,
            }),
        };
        if let Err(e) = result {
            tracing::warn!(file = %path.display(), error = %e, "Patch rejected");
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(io_err(&path))?;

        tracing::info!(
            file = %path.display(),
            backup = %backup.display(),
            "Patch applied"
        );
        Ok(AppliedPatch { file: path, backup })
    }

    async fn validate(&self, path: &Path) -> Result<(), PatchError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(io_err(path))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<serde_json::Value>(&text)
                .map(|_| ())
                .map_err(|e| PatchError::Invalid(e.to_string())),
            Some("toml") => toml::from_str::<toml::Value>(&text)
                .map(|_| ())
                .map_err(|e| PatchError::Invalid(e.to_string())),
            _ => match &self.validator {
                Some(cmd) => run_validator(cmd, path).await,
                None => Ok(()),
            },
        }
    }
}

async fn run_validator(cmd: &str, path: &Path) -> Result<(), PatchError> {
    let cmd = cmd.replace("{file}", &path.display().to_string());
    let output = Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .output()
        .await
        .map_err(|e| PatchError::Validator(e.to_string()))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(PatchError::Invalid(format!(
            "`{}` exited with {}: {}",
            cmd,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// `<stem>.patch-tmp.<ext>` beside `path`, keeping the extension so the
/// staged file validates as the same kind of file.
fn staging_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    let mut name = stem;
    name.push(".patch-tmp");
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn location(file: &str, find: &str) -> PatchLocation {
        PatchLocation {
            file: PathBuf::from(file),
            find: find.to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_replaces_single_occurrence() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("worker.toml"), "parallel = 8\nbatch = 500\n").unwrap();
        let patcher = SourcePatcher::new(Some(dir.path().to_path_buf()), None);

        let applied = patcher
            .apply(&location("worker.toml", "parallel = 8"), "parallel = 2")
            .await
            .unwrap();

        let text = std::fs::read_to_string(&applied.file).unwrap();
        assert_eq!(text, "parallel = 2\nbatch = 500\n");
        let backup = std::fs::read_to_string(&applied.backup).unwrap();
        assert_eq!(backup, "parallel = 8\nbatch = 500\n");
    }

    #[tokio::test]
    async fn test_invalid_json_is_rolled_back() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"retries": 3}"#).unwrap();
        let patcher = SourcePatcher::new(Some(dir.path().to_path_buf()), None);

        let err = patcher
            .apply(&location("settings.json", "3}"), "3,,}")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Invalid(_)));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), r#"{"retries": 3}"#);
    }

    #[tokio::test]
    async fn test_missing_and_ambiguous_locations() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("main.py");
        std::fs::write(&file, "sleep(1)\nsleep(1)\n").unwrap();
        let patcher = SourcePatcher::new(Some(dir.path().to_path_buf()), None);

        let err = patcher
            .apply(&location("main.py", "sleep(1)"), "sleep(2)")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Ambiguous { count: 2, .. }));

        let err = patcher
            .apply(&location("main.py", "sleep(9)"), "sleep(2)")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::NotFound(_)));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "sleep(1)\nsleep(1)\n");
    }

    #[tokio::test]
    async fn test_validator_failure_keeps_original() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("run.sh");
        std::fs::write(&file, "echo one\n").unwrap();
        let patcher = SourcePatcher::new(
            Some(dir.path().to_path_buf()),
            Some("grep -q never {file}".to_string()),
        );

        let err = patcher
            .apply(&location("run.sh", "one"), "two")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Invalid(_)));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "echo one\n");
    }

    #[tokio::test]
    async fn test_live_file_untouched_while_validating() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("run.sh");
        std::fs::write(&file, "echo one\n").unwrap();
        // Fails if the live file differs from the backup during validation.
        let validator = format!(
            "cmp -s {live} {live}.bak && grep -q two {{file}}",
            live = file.display()
        );
        let patcher = SourcePatcher::new(Some(dir.path().to_path_buf()), Some(validator));

        let applied = patcher
            .apply(&location("run.sh", "one"), "two")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&applied.file).unwrap(), "echo two\n");
        assert!(!dir.path().join("run.patch-tmp.sh").exists());
    }

    #[tokio::test]
    async fn test_rejected_patch_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"retries": 3}"#).unwrap();
        let patcher = SourcePatcher::new(Some(dir.path().to_path_buf()), None);

        patcher
            .apply(&location("settings.json", "3}"), "3,,}")
            .await
            .unwrap_err();
        assert!(!dir.path().join("settings.patch-tmp.json").exists());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), r#"{"retries": 3}"#);
    }

    #[test]
    fn test_staging_path_keeps_extension() {
        assert_eq!(
            staging_path(Path::new("/app/conf/worker.toml")),
            PathBuf::from("/app/conf/worker.patch-tmp.toml")
        );
        assert_eq!(
            staging_path(Path::new("/app/Makefile")),
            PathBuf::from("/app/Makefile.patch-tmp")
        );
    }

    #[tokio::test]
    async fn test_paths_are_confined() {
        let dir = tempdir().unwrap();
        let patcher = SourcePatcher::new(Some(dir.path().join("app")), None);
        let err = patcher
            .apply(&location("../escape.txt", "a"), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::OutsideRoot(_)));

        let err = SourcePatcher::new(None, None)
            .apply(&location("x", "a"), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::NoRoot));
    }
}
