use core::fmt;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::config::DispatchSettings;
use crate::test::TestResult;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// The configured token file isn't there. Without a token there's nothing to
// authenticate with, so no request is attempted.
#[derive(Debug)]
pub struct NoToken(pub PathBuf);

impl Display for NoToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch token file {:?} not found", self.0)
    }
}

impl std::error::Error for NoToken {}

// The script was required to produce a result file and didn't. This fails
// the notification, never the run.
#[derive(Debug)]
pub struct MissingResultFile(pub PathBuf);

impl Display for MissingResultFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "required result file {:?} was not produced", self.0)
    }
}

impl std::error::Error for MissingResultFile {}

#[derive(Serialize, Debug)]
struct Artifact {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    content: String,
}

async fn artifact(kind: &'static str, path: &Path) -> anyhow::Result<Artifact> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading artifact {:?}", path))?;
    Ok(Artifact {
        kind,
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        content: BASE64.encode(bytes),
    })
}

// Fire-and-acknowledge notification to a repository-dispatch endpoint.
// One POST per run; the caller records the outcome on the TestResult and
// moves on either way.
pub struct Dispatcher {
    settings: DispatchSettings,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(settings: DispatchSettings) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .context("building HTTP client")?,
        })
    }

    // result_file is where the script was told to write its report
    // ($HOME_CI_RESULT_FILE); it's attached when present.
    pub async fn notify(
        &self,
        result: &TestResult,
        log_path: &Path,
        result_file: &Path,
    ) -> anyhow::Result<()> {
        let token = match tokio::fs::read_to_string(&self.settings.token_path).await {
            Ok(token) => token.trim().to_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(NoToken(self.settings.token_path.clone()).into());
            }
            Err(e) => {
                return Err(e).context(format!(
                    "reading dispatch token {:?}",
                    self.settings.token_path
                ));
            }
        };

        let event_type = match &self.settings.event_type {
            Some(event_type) => event_type.clone(),
            None => if result.success {
                "test-success"
            } else {
                "test-failure"
            }
            .to_owned(),
        };

        let mut artifacts = vec![
            artifact("log", log_path).await?,
            Artifact {
                kind: "result",
                name: "result.json".to_owned(),
                content: BASE64.encode(serde_json::to_vec(result).context("serializing result")?),
            },
        ];
        if result_file.exists() {
            artifacts.push(artifact("e2e-report", result_file).await?);
        } else if self.settings.requires_result_file {
            return Err(MissingResultFile(result_file.to_owned()).into());
        }

        let url = format!(
            "{}/repos/{}/{}/dispatches",
            self.settings.api_base, self.settings.owner, self.settings.name
        );
        let body = json!({
            "event_type": event_type,
            "client_payload": {
                "branch": result.branch,
                "commit": result.commit,
                "success": result.success,
                "timed_out": result.timed_out,
                "artifacts": artifacts,
            },
        });

        debug!(
            "dispatching {:?} for {}@{} to {}",
            event_type, result.branch, result.commit, url
        );
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", token))
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("sending dispatch request")?;

        if response.status() != reqwest::StatusCode::NO_CONTENT {
            bail!(
                "dispatch endpoint answered {} (want 204 No Content)",
                response.status()
            );
        }
        Ok(())
    }
}
