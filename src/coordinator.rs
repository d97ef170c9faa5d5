use std::sync::{Arc, Mutex, MutexGuard};

use tokio::{
    runtime::Handle,
    sync::{mpsc::UnboundedSender, watch},
};
use tokio_util::sync::CancellationToken;

use crate::command;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{DownloadRequest, Operation, Outcome, SessionEvent, Terminal};
use crate::progress::ProgressEvent;
use crate::provision::{self, UpdateReport, UpdateRoute};
use crate::session::{ProcessSession, SessionStatus};

/// Work the UI can ask for
#[derive(Debug, Clone)]
pub enum OperationRequest {
    Download(DownloadRequest),
    Update,
}

impl OperationRequest {
    pub fn operation(&self) -> Operation {
        match self {
            OperationRequest::Download(_) => Operation::Download,
            OperationRequest::Update => Operation::Update,
        }
    }
}

/// The two singleton slots. At most one of them is ever occupied.
#[derive(Default)]
struct Slots {
    download: Option<CancellationToken>,
    update: Option<CancellationToken>,
}

impl Slots {
    fn get(&self, operation: Operation) -> Option<&CancellationToken> {
        match operation {
            Operation::Download => self.download.as_ref(),
            Operation::Update => self.update.as_ref(),
        }
    }

    fn set(&mut self, operation: Operation, token: Option<CancellationToken>) {
        match operation {
            Operation::Download => self.download = token,
            Operation::Update => self.update = token,
        }
    }

    fn active(&self) -> Option<Operation> {
        if self.download.is_some() {
            Some(Operation::Download)
        } else if self.update.is_some() {
            Some(Operation::Update)
        } else {
            None
        }
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frees its slot when dropped, whatever path the operation took.
struct SlotGuard {
    slots: Arc<Mutex<Slots>>,
    operation: Operation,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.slots).set(self.operation, None);
    }
}

/// The UI's grip on a running operation
#[derive(Debug, Clone)]
pub struct SessionHandle {
    operation: Operation,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<Outcome>>,
}

impl SessionHandle {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn finished(&mut self) -> Outcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(unreported),
            Err(_) => unreported(),
        }
    }
}

fn unreported() -> Outcome {
    Outcome::Aborted("operation ended without reporting an outcome".to_string())
}

/// Enforces that downloads and updates never overlap and runs each one on
/// the runtime, reporting through the caller's event channel.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<OrchestratorConfig>,
    slots: Arc<Mutex<Slots>>,
    runtime: Handle,
}

impl Coordinator {
    pub fn new(config: OrchestratorConfig, runtime: Handle) -> Self {
        Self {
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(Slots::default())),
            runtime,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Which operation currently holds its slot, if any
    pub fn active(&self) -> Option<Operation> {
        lock(&self.slots).active()
    }

    pub fn is_idle(&self) -> bool {
        self.active().is_none()
    }

    /// Validates, claims the slot, and starts the work in the background.
    /// Every accepted submission ends with exactly one
    /// `SessionEvent::Terminal`, sent after the slot has been released.
    pub fn submit(
        &self,
        request: OperationRequest,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<SessionHandle> {
        if let OperationRequest::Download(download) = &request {
            download.validate()?;
        }

        let operation = request.operation();
        let cancel = CancellationToken::new();
        let guard = self.acquire(operation, cancel.clone())?;
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let config = Arc::clone(&self.config);
        let token = cancel.clone();
        self.runtime.spawn(async move {
            let terminal = match request {
                OperationRequest::Download(download) => {
                    let result = run_download(&config, &download, &token, &events).await;
                    download_terminal(result)
                }
                OperationRequest::Update => {
                    let result = provision::update_executable(&config, &token, &events).await;
                    update_terminal(result)
                }
            };
            drop(guard);
            tracing::info!(?operation, outcome = ?terminal.outcome, "{}", terminal.message);
            let _ = outcome_tx.send(Some(terminal.outcome.clone()));
            let _ = events.send(SessionEvent::Terminal(terminal));
        });

        Ok(SessionHandle {
            operation,
            cancel,
            outcome: outcome_rx,
        })
    }

    /// Cancels whatever occupies `operation`'s slot. Returns whether there
    /// was anything to cancel.
    pub fn cancel(&self, operation: Operation) -> bool {
        match lock(&self.slots).get(operation) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn acquire(&self, requested: Operation, token: CancellationToken) -> Result<SlotGuard> {
        let mut slots = lock(&self.slots);
        if let Some(active) = slots.active() {
            tracing::info!(?requested, ?active, "operation refused, slot busy");
            return Err(OrchestratorError::Busy { requested, active });
        }
        slots.set(requested, Some(token));
        Ok(SlotGuard {
            slots: Arc::clone(&self.slots),
            operation: requested,
        })
    }
}

async fn run_download(
    config: &OrchestratorConfig,
    request: &DownloadRequest,
    cancel: &CancellationToken,
    events: &UnboundedSender<SessionEvent>,
) -> Result<SessionStatus> {
    let program = match config.resolver().resolve(&config.tool_name) {
        Some(program) => program,
        None => {
            let _ = events.send(SessionEvent::Progress(ProgressEvent::RawLine(format!(
                "{} not found, downloading the latest release",
                config.tool_name
            ))));
            provision::install_release(config, cancel, events).await?
        }
    };

    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }
    let args = command::download_args(request);
    tracing::info!(url = %request.url.trim(), "starting download");
    let session = ProcessSession::start(
        &program,
        &args,
        &config.local_dir,
        config.grace_period(),
        cancel.child_token(),
    )?;
    session.run_to_completion(events, None).await
}

fn status_outcome(status: SessionStatus) -> Outcome {
    match status {
        SessionStatus::Succeeded => Outcome::Succeeded,
        SessionStatus::Failed(code) => Outcome::Failed(code),
        SessionStatus::Cancelled => Outcome::Cancelled,
    }
}

fn error_terminal(operation: Operation, err: OrchestratorError) -> Terminal {
    match err {
        OrchestratorError::Cancelled => Terminal::new(operation, Outcome::Cancelled),
        err => Terminal::new(operation, Outcome::Aborted(err.to_string())),
    }
}

fn download_terminal(result: Result<SessionStatus>) -> Terminal {
    match result {
        Ok(status) => Terminal::new(Operation::Download, status_outcome(status)),
        Err(err) => error_terminal(Operation::Download, err),
    }
}

fn update_terminal(result: Result<UpdateReport>) -> Terminal {
    let report = match result {
        Ok(report) => report,
        Err(err) => return error_terminal(Operation::Update, err),
    };
    let terminal = Terminal::new(Operation::Update, status_outcome(report.status));
    match (report.route, report.status) {
        (UpdateRoute::PackageManager, SessionStatus::Succeeded) => {
            terminal.with_message("yt-dlp updated through the package manager.")
        }
        (UpdateRoute::PackageManager, SessionStatus::Failed(code)) => {
            terminal.with_message(format!("Package-manager update failed with return code: {code}"))
        }
        (UpdateRoute::FreshInstall, SessionStatus::Succeeded) => {
            terminal.with_message("yt-dlp installed from the latest release.")
        }
        _ => terminal,
    }
}
