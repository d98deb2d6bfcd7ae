//! Publishing previews to external hosts
//!
//! A deploy target is a command run inside the preview directory (for example
//! a hosting provider's CLI). The last `https://` URL it prints becomes the
//! preview's deployment URL, and the gateway redirects there from then on.

use crate::config::DeployTarget;
use crate::error::{PreviewError, PreviewResult};
use crate::logs::LogBuffer;
use crate::workspace::run_captured;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct Deployer {
    targets: HashMap<String, DeployTarget>,
}

impl Deployer {
    pub fn new(targets: HashMap<String, DeployTarget>) -> Self {
        Self { targets }
    }

    /// Configured platform names, sorted
    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_platform(&self, platform: &str) -> bool {
        self.targets.contains_key(platform)
    }

    /// Run the deploy command for `platform` and return the deployment URL
    pub async fn deploy(
        &self,
        platform: &str,
        id: &str,
        directory: &Path,
        logs: &Arc<LogBuffer>,
    ) -> PreviewResult<String> {
        let target = self.targets.get(platform).ok_or_else(|| {
            PreviewError::InvalidRequest(format!("unknown deploy platform '{}'", platform))
        })?;

        let parts = shell_words::split(&target.command)
            .map_err(|e| PreviewError::DeployFailed(format!("invalid deploy command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(PreviewError::DeployFailed("deploy command is empty".to_string()));
        };

        info!(id, platform, "Deploying preview");
        logs.push(format!("[previewgate] deploying to {}", platform));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &target.env {
            cmd.env(key, value);
        }
        cmd.env("PREVIEW_ID", id);
        cmd.env("DEPLOY_PLATFORM", platform);

        let (status, lines) =
            match tokio::time::timeout(target.timeout(), run_captured(cmd, id, logs)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    return Err(PreviewError::DeployFailed(format!(
                        "failed to run deploy command: {}",
                        e
                    )))
                }
                Err(_) => {
                    error!(id, platform, timeout_secs = target.timeout_secs, "Deploy timed out");
                    return Err(PreviewError::DeployFailed(format!(
                        "deploy to {} timed out after {}s",
                        platform, target.timeout_secs
                    )));
                }
            };

        if !status.success() {
            let message = format!(
                "deploy command exited with code {}",
                status.code().unwrap_or(-1)
            );
            error!(id, platform, error = %message, "Deploy failed");
            logs.push(format!("[previewgate] {}", message));
            return Err(PreviewError::DeployFailed(message));
        }

        let url = extract_deployment_url(&lines.join("\n")).ok_or_else(|| {
            PreviewError::DeployFailed("deploy command did not print an https URL".to_string())
        })?;

        info!(id, platform, url = %url, "Preview deployed");
        logs.push(format!("[previewgate] deployed to {}", url));
        Ok(url)
    }
}

/// The last `https://` token in `output`, with trailing punctuation removed
pub fn extract_deployment_url(output: &str) -> Option<String> {
    output
        .split(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '<' || c == '>')
        .filter_map(|token| token.find("https://").map(|start| &token[start..]))
        .map(|url| url.trim_end_matches(['.', ',', ';', ')', ']']))
        .filter(|url| url.len() > "https://".len())
        .last()
        .map(str::to_string)
}
