use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::{io::AsyncWriteExt, sync::mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::SessionEvent;
use crate::progress::ProgressEvent;
use crate::session::{ProcessSession, SessionStatus};

/// Where the tool stands during a startup check or an install
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningState {
    /// Platform file name, e.g. `yt-dlp.exe`
    pub executable_name: String,
    /// `None` while the tool is absent
    pub resolved: Option<PathBuf>,
    /// Fetch progress, 0.0..=1.0
    pub fraction: f32,
}

impl ProvisioningState {
    pub fn check(config: &OrchestratorConfig) -> Self {
        let resolved = config.resolver().resolve(&config.tool_name);
        Self {
            executable_name: config.os.executable_name(&config.tool_name),
            fraction: if resolved.is_some() { 1.0 } else { 0.0 },
            resolved,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Which rung of the update chain produced the final status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRoute {
    SelfUpdate,
    PackageManager,
    FreshInstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub route: UpdateRoute,
    pub status: SessionStatus,
}

pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

/// Resolves the tool, fetching the platform release into the local
/// directory when it is absent.
pub async fn ensure_executable(
    config: &OrchestratorConfig,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(&ProvisioningState),
) -> Result<PathBuf> {
    let mut state = ProvisioningState::check(config);
    if let Some(path) = &state.resolved {
        return Ok(path.clone());
    }

    let target = config.resolver().local_target(&config.tool_name);
    let url = config.release_url();
    tracing::info!(%url, target = %target.display(), "provisioning executable");

    let client = http_client()?;
    let fetched = fetch_release(&client, url, &target, cancel, |fraction| {
        state.fraction = fraction;
        on_progress(&state);
    })
    .await;
    match fetched {
        Ok(()) => {}
        Err(OrchestratorError::Cancelled) => {
            tracing::info!(%url, "provisioning cancelled");
            return Err(OrchestratorError::Cancelled);
        }
        Err(err) => {
            tracing::warn!(%url, "provisioning failed: {err}");
            return Err(err);
        }
    }

    state.resolved = Some(target.clone());
    state.fraction = 1.0;
    on_progress(&state);
    Ok(target)
}

/// `ensure_executable` for a running operation: progress goes out as
/// `SessionEvent::Provisioning` and cancellation abandons the fetch.
pub async fn install_release(
    config: &OrchestratorConfig,
    cancel: &CancellationToken,
    events: &UnboundedSender<SessionEvent>,
) -> Result<PathBuf> {
    ensure_executable(config, cancel, |state| {
        let _ = events.send(SessionEvent::Provisioning(state.fraction));
    })
    .await
}

/// Streams `url` to `target`, reporting received/total after every chunk
/// when the server declares a length. The file only appears at `target`
/// once complete and executable; on error or cancellation the partial
/// download is removed.
pub async fn fetch_release(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(f32),
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = target.with_extension("part");

    let result = match stream_to_file(client, url, &partial, cancel, &mut on_progress).await {
        Ok(()) => mark_executable(&partial).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }

    tokio::fs::rename(&partial, target).await?;
    on_progress(1.0);
    Ok(())
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    partial: &Path,
    cancel: &CancellationToken,
    on_progress: &mut impl FnMut(f32),
) -> Result<()> {
    let fetch_error = |reason: String| OrchestratorError::Provisioning {
        url: url.to_string(),
        reason,
    };

    let mut response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        response = client.get(url).send() => response.map_err(|e| fetch_error(e.to_string()))?,
    };
    if !response.status().is_success() {
        return Err(fetch_error(format!("HTTP {}", response.status())));
    }

    let total = response.content_length().filter(|len| *len > 0);
    let mut file = tokio::fs::File::create(partial).await?;
    let mut received: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|e| fetch_error(e.to_string()))?,
        };
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(total) = total {
            on_progress((received as f64 / total as f64).min(1.0) as f32);
        }
    }
    file.flush().await?;

    if received == 0 {
        return Err(fetch_error("empty response body".to_string()));
    }
    Ok(())
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Self-update first; if the tool refuses because a package manager owns
/// the install, run the package-manager update once. Any other failure is
/// final. An absent tool is simply fetched fresh.
pub async fn update_executable(
    config: &OrchestratorConfig,
    cancel: &CancellationToken,
    events: &UnboundedSender<SessionEvent>,
) -> Result<UpdateReport> {
    let Some(program) = config.resolver().resolve(&config.tool_name) else {
        install_release(config, cancel, events).await?;
        return Ok(UpdateReport {
            route: UpdateRoute::FreshInstall,
            status: SessionStatus::Succeeded,
        });
    };

    let mut transcript = Vec::new();
    let status = run_step(
        config,
        &program,
        &config.self_update_args,
        cancel,
        events,
        Some(&mut transcript),
    )
    .await?;

    let SessionStatus::Failed(code) = status else {
        return Ok(UpdateReport {
            route: UpdateRoute::SelfUpdate,
            status,
        });
    };
    if !config.package_manager_signal.matches(code, &transcript) {
        return Ok(UpdateReport {
            route: UpdateRoute::SelfUpdate,
            status,
        });
    }

    let Some((manager, manager_args)) = config.package_manager_update.split_first() else {
        return Err(OrchestratorError::Config(
            "package_manager_update needs at least a program".to_string(),
        ));
    };
    tracing::info!(code, %manager, "self-update refused, updating through the package manager");
    let _ = events.send(SessionEvent::Progress(ProgressEvent::RawLine(format!(
        "Self-update is not available for this install, running: {}",
        config.package_manager_update.join(" ")
    ))));

    let status = run_step(config, Path::new(manager), manager_args, cancel, events, None).await?;
    Ok(UpdateReport {
        route: UpdateRoute::PackageManager,
        status,
    })
}

async fn run_step(
    config: &OrchestratorConfig,
    program: &Path,
    args: &[String],
    cancel: &CancellationToken,
    events: &UnboundedSender<SessionEvent>,
    transcript: Option<&mut Vec<String>>,
) -> Result<SessionStatus> {
    if cancel.is_cancelled() {
        return Ok(SessionStatus::Cancelled);
    }
    let session = ProcessSession::start(
        program,
        args,
        &config.local_dir,
        config.grace_period(),
        cancel.child_token(),
    )?;
    session.run_to_completion(events, transcript).await
}
