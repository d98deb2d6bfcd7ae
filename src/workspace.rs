//! Preview directories on disk
//!
//! A preview directory starts as a copy of the template project, receives the
//! client's files, and has dependencies installed once. Directories outlive
//! their backends: an idle or crashed preview is restarted from its directory.

use crate::config::PreviewDefaults;
use crate::error::{PreviewError, PreviewResult};
use crate::logs::{LogBuffer, OutputLines};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Longest accepted preview id
pub const MAX_ID_LEN: usize = 64;

/// A file supplied by the client, relative to the preview root
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Ids become directory names and URL segments: `[A-Za-z0-9_-]{1,64}`
pub fn validate_id(id: &str) -> PreviewResult<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(PreviewError::InvalidRequest(format!(
            "preview id must be 1 to {} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PreviewError::InvalidRequest(format!(
            "preview id '{}' may only contain letters, digits, '-' and '_'",
            id
        )));
    }
    Ok(())
}

/// Reject absolute paths and anything that could escape the preview root
pub fn validate_relative_path(path: &str) -> PreviewResult<PathBuf> {
    let invalid = |reason: &str| {
        PreviewError::InvalidRequest(format!("file path '{}' {}", path, reason))
    };

    if path.is_empty() {
        return Err(invalid("is empty"));
    }
    if path.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("must be relative"))
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(invalid("does not name a file"));
    }
    Ok(clean)
}

/// Template copy, file writes and dependency install for preview directories
#[derive(Debug, Clone)]
pub struct Workspace {
    root_dir: PathBuf,
    template_dir: PathBuf,
    template_skip: Vec<String>,
    install_command: String,
    install_timeout: Duration,
    installed_marker: PathBuf,
}

impl Workspace {
    pub fn new(defaults: &PreviewDefaults) -> Self {
        Self {
            root_dir: defaults.root_dir.clone(),
            template_dir: defaults.template_dir.clone(),
            template_skip: defaults.template_skip.clone(),
            install_command: defaults.install_command.clone(),
            install_timeout: defaults.install_timeout(),
            installed_marker: PathBuf::from(&defaults.installed_marker),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Create `directory` as a copy of the template.
    ///
    /// The copy is staged next to the target and renamed into place, so a
    /// failed copy never leaves a half-populated preview directory behind.
    pub async fn materialize(&self, id: &str, directory: &Path) -> PreviewResult<()> {
        if !self.template_dir.is_dir() {
            return Err(PreviewError::Provisioning(format!(
                "template directory {} does not exist",
                self.template_dir.display()
            )));
        }

        let parent = directory.parent().unwrap_or(&self.root_dir).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let staging = parent.join(format!(".{}.staging-{}", id, uuid::Uuid::new_v4()));
        let template = self.template_dir.clone();
        let skip = self.template_skip.clone();
        let staging_copy = staging.clone();

        let copied = tokio::task::spawn_blocking(move || copy_tree(&template, &staging_copy, &skip))
            .await
            .map_err(|e| PreviewError::Provisioning(format!("template copy task failed: {}", e)))?;

        match copied {
            Ok(files) => {
                if let Err(e) = tokio::fs::rename(&staging, directory).await {
                    let _ = tokio::fs::remove_dir_all(&staging).await;
                    return Err(PreviewError::Provisioning(format!(
                        "failed to move preview directory into place: {}",
                        e
                    )));
                }
                info!(id, files, directory = %directory.display(), "Copied template");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                Err(PreviewError::Provisioning(format!("failed to copy template: {}", e)))
            }
        }
    }

    /// Write client files into `directory`, creating parent directories.
    ///
    /// Every path is validated before anything is written.
    pub async fn write_files(&self, directory: &Path, files: &[FileEntry]) -> PreviewResult<usize> {
        let mut resolved = Vec::with_capacity(files.len());
        for file in files {
            resolved.push((validate_relative_path(&file.path)?, file));
        }

        for (relative, file) in &resolved {
            let target = directory.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, file.content.as_bytes()).await?;
            debug!(path = %relative.display(), bytes = file.content.len(), "Wrote preview file");
        }

        Ok(resolved.len())
    }

    pub fn is_installed(&self, directory: &Path) -> bool {
        directory.join(&self.installed_marker).exists()
    }

    /// Run the install command unless the installed marker already exists.
    ///
    /// Returns whether an install ran. Output goes to the preview's log buffer.
    pub async fn ensure_installed(
        &self,
        id: &str,
        directory: &Path,
        logs: &Arc<LogBuffer>,
    ) -> PreviewResult<bool> {
        if self.is_installed(directory) {
            debug!(id, "Dependencies already installed");
            return Ok(false);
        }

        let parts = shell_words::split(&self.install_command)
            .map_err(|e| PreviewError::Provisioning(format!("invalid install command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(PreviewError::Provisioning("install command is empty".to_string()));
        };

        info!(id, command = %self.install_command, "Installing dependencies");
        logs.push(format!("[previewgate] running {}", self.install_command));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(directory)
            .env("PREVIEW_ID", id)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Dropping the future on timeout kills the install through kill_on_drop
        let status = match tokio::time::timeout(self.install_timeout, run_captured(cmd, id, logs)).await {
            Ok(Ok((status, _))) => status,
            Ok(Err(e)) => {
                return Err(PreviewError::Provisioning(format!(
                    "failed to run install command: {}",
                    e
                )));
            }
            Err(_) => {
                let message = format!(
                    "install command timed out after {}s",
                    self.install_timeout.as_secs()
                );
                error!(id, timeout_secs = self.install_timeout.as_secs(), "Dependency install timed out");
                logs.push(format!("[previewgate] {}", message));
                return Err(PreviewError::Provisioning(message));
            }
        };

        if !status.success() {
            let message = format!(
                "install command exited with code {}",
                status.code().unwrap_or(-1)
            );
            error!(id, error = %message, "Dependency install failed");
            logs.push(format!("[previewgate] {}", message));
            return Err(PreviewError::Provisioning(message));
        }

        if !self.is_installed(directory) {
            let message = format!(
                "install finished but {} is missing",
                self.installed_marker.display()
            );
            warn!(id, error = %message, "Dependency install incomplete");
            return Err(PreviewError::Provisioning(message));
        }

        info!(id, "Dependencies installed");
        Ok(true)
    }

    /// Delete a preview directory. A missing directory is not an error.
    pub async fn remove(&self, directory: &Path) -> PreviewResult<bool> {
        match tokio::fs::remove_dir_all(directory).await {
            Ok(()) => {
                info!(directory = %directory.display(), "Removed preview directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of preview directories already on disk
    pub async fn discover(&self) -> PreviewResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Recursively copy `from` into a new directory `to`, skipping entries whose
/// name is in `skip`. Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path, skip: &[String]) -> std::io::Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name.to_str() == Some(s.as_str())) {
            continue;
        }

        let source = entry.path();
        let target = to.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_tree(&source, &target, skip)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(&source)?, &target)?;
            #[cfg(not(unix))]
            {
                std::fs::copy(&source, &target)?;
            }
            copied += 1;
        } else {
            std::fs::copy(&source, &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Run a command to completion, streaming both output pipes into `logs`.
///
/// Returns the exit status and the captured lines in arrival order.
pub(crate) async fn run_captured(
    mut cmd: Command,
    id: &str,
    logs: &Arc<LogBuffer>,
) -> std::io::Result<(ExitStatus, Vec<String>)> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("Running: {:?}", cmd);
    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

    let mut stdout_reader = OutputLines::new(stdout);
    let mut stderr_reader = OutputLines::new(stderr);
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut lines = Vec::new();

    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_reader.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => {
                        info!(target: "preview", id, "{}", line);
                        logs.push(line.clone());
                        lines.push(line);
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(id, "Error reading stdout: {}", e);
                        stdout_open = false;
                    }
                }
            }
            line = stderr_reader.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => {
                        warn!(target: "preview", id, "{}", line);
                        logs.push(format!("[stderr] {}", line));
                        lines.push(line);
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(id, "Error reading stderr: {}", e);
                        stderr_open = false;
                    }
                }
            }
        }
    }

    let status = child.wait().await?;
    Ok((status, lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(root: &Path, template: &Path) -> Workspace {
        let defaults = PreviewDefaults {
            root_dir: root.to_path_buf(),
            template_dir: template.to_path_buf(),
            install_command: "sh -c 'echo installing; mkdir -p node_modules/.bin && touch node_modules/.bin/dev'".to_string(),
            installed_marker: "node_modules/.bin/dev".to_string(),
            ..PreviewDefaults::default()
        };
        Workspace::new(&defaults)
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("demo").is_ok());
        assert!(validate_id("my_site-2").is_ok());
        assert!(validate_id(&"a".repeat(64)).is_ok());

        assert!(validate_id("").is_err());
        assert!(validate_id(&"a".repeat(65)).is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a.b").is_err());
        assert!(validate_id("with space").is_err());
    }

    #[test]
    fn test_validate_relative_path() {
        assert_eq!(validate_relative_path("src/App.tsx").unwrap(), PathBuf::from("src/App.tsx"));
        assert_eq!(validate_relative_path("./index.html").unwrap(), PathBuf::from("index.html"));

        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path(".").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../secret").is_err());
        assert!(validate_relative_path("src/../../secret").is_err());
    }

    #[tokio::test]
    async fn test_materialize_copies_template_and_skips() {
        let root = tempfile::tempdir().unwrap();
        let template = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(template.path().join("src")).unwrap();
        std::fs::write(template.path().join("package.json"), "{}").unwrap();
        std::fs::write(template.path().join("src/main.ts"), "console.log(1)").unwrap();
        std::fs::create_dir_all(template.path().join("node_modules/pkg")).unwrap();
        std::fs::write(template.path().join("node_modules/pkg/index.js"), "").unwrap();

        let ws = workspace(root.path(), template.path());
        let dir = root.path().join("demo");
        ws.materialize("demo", &dir).await.unwrap();

        assert!(dir.join("package.json").exists());
        assert_eq!(std::fs::read_to_string(dir.join("src/main.ts")).unwrap(), "console.log(1)");
        assert!(!dir.join("node_modules").exists());

        // Staging directories are not left behind
        let leftovers: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_materialize_missing_template() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path(), &root.path().join("no-template"));
        let err = ws.materialize("demo", &root.path().join("demo")).await.unwrap_err();
        assert!(matches!(err, PreviewError::Provisioning(_)));
    }

    #[tokio::test]
    async fn test_write_files_rejects_before_writing() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path(), root.path());
        let files = vec![
            FileEntry { path: "ok.txt".into(), content: "fine".into() },
            FileEntry { path: "../escape.txt".into(), content: "bad".into() },
        ];

        let err = ws.write_files(root.path(), &files).await.unwrap_err();
        assert!(matches!(err, PreviewError::InvalidRequest(_)));
        assert!(!root.path().join("ok.txt").exists());
    }

    #[tokio::test]
    async fn test_write_files_creates_parents() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path(), root.path());
        let files = vec![FileEntry {
            path: "src/components/Button.tsx".into(),
            content: "export {}".into(),
        }];

        assert_eq!(ws.write_files(root.path(), &files).await.unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(root.path().join("src/components/Button.tsx")).unwrap(),
            "export {}"
        );
    }

    #[tokio::test]
    async fn test_install_runs_once() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path(), root.path());
        let logs = Arc::new(LogBuffer::new(100));

        assert!(!ws.is_installed(root.path()));
        assert!(ws.ensure_installed("demo", root.path(), &logs).await.unwrap());
        assert!(ws.is_installed(root.path()));
        assert!(logs.contents().contains("installing"));

        assert!(!ws.ensure_installed("demo", root.path(), &logs).await.unwrap());
    }

    #[tokio::test]
    async fn test_install_failure() {
        let root = tempfile::tempdir().unwrap();
        let defaults = PreviewDefaults {
            root_dir: root.path().to_path_buf(),
            install_command: "sh -c 'echo missing registry >&2; exit 2'".to_string(),
            ..PreviewDefaults::default()
        };
        let ws = Workspace::new(&defaults);
        let logs = Arc::new(LogBuffer::new(100));

        let err = ws.ensure_installed("demo", root.path(), &logs).await.unwrap_err();
        assert!(matches!(err, PreviewError::Provisioning(ref m) if m.contains("code 2")));
        assert!(logs.contents().contains("[stderr] missing registry"));
    }

    #[tokio::test]
    async fn test_install_timeout_kills_hung_install() {
        let root = tempfile::tempdir().unwrap();
        let defaults = PreviewDefaults {
            root_dir: root.path().to_path_buf(),
            install_command: "sleep 30".to_string(),
            install_timeout_secs: 1,
            ..PreviewDefaults::default()
        };
        let ws = Workspace::new(&defaults);
        let logs = Arc::new(LogBuffer::new(100));

        let started = std::time::Instant::now();
        let err = ws.ensure_installed("demo", root.path(), &logs).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, PreviewError::Provisioning(ref m) if m.contains("timed out after 1s")));
        assert!(logs.contents().contains("timed out"));
    }

    #[tokio::test]
    async fn test_install_output_with_invalid_utf8() {
        let root = tempfile::tempdir().unwrap();
        let defaults = PreviewDefaults {
            root_dir: root.path().to_path_buf(),
            install_command: r#"sh -c 'printf "\377\376\n"; printf "\377\n" >&2; echo done; mkdir -p node_modules/.bin && touch node_modules/.bin/dev'"#.to_string(),
            installed_marker: "node_modules/.bin/dev".to_string(),
            ..PreviewDefaults::default()
        };
        let ws = Workspace::new(&defaults);
        let logs = Arc::new(LogBuffer::new(100));

        assert!(ws.ensure_installed("demo", root.path(), &logs).await.unwrap());
        let contents = logs.contents();
        assert!(contents.contains("\u{FFFD}\u{FFFD}"));
        assert!(contents.contains("[stderr] \u{FFFD}"));
        assert!(contents.contains("done"));
    }

    #[tokio::test]
    async fn test_materialize_cleans_staging_when_rename_fails() {
        let root = tempfile::tempdir().unwrap();
        let template = tempfile::tempdir().unwrap();
        std::fs::write(template.path().join("package.json"), "{}").unwrap();

        // A non-empty directory at the target makes the rename fail
        let dir = root.path().join("demo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("existing.txt"), "keep").unwrap();

        let ws = workspace(root.path(), template.path());
        let err = ws.materialize("demo", &dir).await.unwrap_err();
        assert!(matches!(err, PreviewError::Provisioning(ref m) if m.contains("move preview directory")));

        let names: Vec<String> = std::fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["demo"]);
        assert_eq!(std::fs::read_to_string(dir.join("existing.txt")).unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ws = workspace(root.path(), root.path());
        let dir = root.path().join("demo");
        std::fs::create_dir_all(dir.join("src")).unwrap();

        assert!(ws.remove(&dir).await.unwrap());
        assert!(!dir.exists());
        assert!(!ws.remove(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_discover() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("beta")).unwrap();
        std::fs::create_dir_all(root.path().join("alpha")).unwrap();
        std::fs::create_dir_all(root.path().join(".alpha.staging-x")).unwrap();
        std::fs::write(root.path().join("notes.txt"), "").unwrap();

        let ws = workspace(root.path(), root.path());
        assert_eq!(ws.discover().await.unwrap(), vec!["alpha", "beta"]);

        let missing = workspace(&root.path().join("nope"), root.path());
        assert!(missing.discover().await.unwrap().is_empty());
    }
}
