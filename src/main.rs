//! Desktop front end for the yt-dlp orchestrator

use std::path::PathBuf;

// eframe/egui for GUI application framework
use eframe::{egui, App, Frame};
use egui::Visuals;
// OnceCell for single-time runtime initialization
use once_cell::sync::OnceCell;
// FileDialog for folder selection dialogs
use rfd::FileDialog;
use tokio::{
    runtime::Runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ytdlp_gui::{
    provision, Coordinator, DownloadRequest, Operation, OperationRequest, OrchestratorConfig,
    Outcome, ProgressEvent, Quality, SessionEvent, SessionHandle,
};

// Global Tokio runtime stored in a OnceCell for lazy init
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Audio codecs offered for extraction
const AUDIO_FORMATS: [&str; 5] = ["mp3", "wav", "aac", "flac", "m4a"];

/// Program entry point: initializes logging and runtime, then launches GUI
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ytdlp_gui=info")),
        )
        .init();

    let config_path = std::env::var_os("YTDLP_GUI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ytdlp-gui.json"));
    let config = match OrchestratorConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), "using default settings: {err}");
            OrchestratorConfig::default()
        }
    };

    let runtime = RUNTIME.get_or_try_init(Runtime::new)?;
    let coordinator = Coordinator::new(config, runtime.handle().clone());

    // Configure default native options for egui window
    let options = eframe::NativeOptions::default();
    eframe::run_native(
        "yt-dlp Downloader",
        options,
        Box::new(move |cc| {
            cc.egui_ctx.set_visuals(Visuals::dark());
            Box::new(MyApp::new(coordinator, cc.egui_ctx.clone()))
        }),
    )?;
    Ok(())
}

/// Result of the background startup check
enum Startup {
    Progress(f32),
    Ready(PathBuf),
    Failed(String),
}

/// Application state for the GUI
struct MyApp {
    coordinator: Coordinator,
    /// Input field for the media URL
    url_input: String,
    /// Destination folder for downloads
    output_dir: String,
    selected_quality: Quality,
    audio_format: String,
    extract_audio: bool,
    subtitles: bool,
    auto_subtitles: bool,
    thumbnail: bool,
    description: bool,
    playlist: bool,
    playlist_start: u32,
    playlist_end: u32,
    /// KiB/s, 0 = unlimited
    rate_limit_kbps: u32,
    /// Everything shown in the log panel
    log: Vec<String>,
    /// Progress bar fill, hidden when `None`
    progress: Option<f32>,
    download: Option<SessionHandle>,
    update: Option<SessionHandle>,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    startup_rx: UnboundedReceiver<Startup>,
    /// Download stays disabled until the executable is known to exist
    tool_ready: bool,
    /// The startup fetch runs outside the coordinator, so Update waits for it
    startup_pending: bool,
}

impl MyApp {
    fn new(coordinator: Coordinator, ctx: egui::Context) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let (startup_tx, startup_rx) = unbounded_channel();

        // Resolve or fetch the executable without blocking the first frame
        let config = coordinator.config().clone();
        if let Some(runtime) = RUNTIME.get() {
            runtime.spawn(async move {
                let progress_tx = startup_tx.clone();
                let result =
                    provision::ensure_executable(&config, &CancellationToken::new(), |state| {
                        let _ = progress_tx.send(Startup::Progress(state.fraction));
                    })
                    .await;
                let _ = startup_tx.send(match result {
                    Ok(path) => Startup::Ready(path),
                    Err(err) => Startup::Failed(err.to_string()),
                });
                ctx.request_repaint();
            });
        } else {
            let _ = startup_tx.send(Startup::Failed("async runtime is not running".to_string()));
        }

        let output_dir = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();

        Self {
            coordinator,
            url_input: String::new(),
            output_dir,
            selected_quality: Quality::Best,
            audio_format: AUDIO_FORMATS[0].to_string(),
            extract_audio: false,
            subtitles: false,
            auto_subtitles: false,
            thumbnail: false,
            description: false,
            playlist: false,
            playlist_start: 0,
            playlist_end: 0,
            rate_limit_kbps: 0,
            log: vec!["🔍 Checking for yt-dlp...".to_string()],
            progress: None,
            download: None,
            update: None,
            events_tx,
            events_rx,
            startup_rx,
            tool_ready: false,
            startup_pending: true,
        }
    }

    fn poll_startup(&mut self) {
        while let Ok(update) = self.startup_rx.try_recv() {
            self.apply_startup(update);
        }
    }

    fn apply_startup(&mut self, update: Startup) {
        match update {
            Startup::Progress(fraction) if fraction < 1.0 => self.progress = Some(fraction),
            Startup::Progress(_) => {}
            Startup::Ready(path) => {
                self.startup_pending = false;
                self.tool_ready = true;
                self.progress = None;
                self.log.push(format!("✅ Using {}", path.display()));
            }
            Startup::Failed(reason) => {
                self.startup_pending = false;
                self.progress = None;
                self.log.push(format!("⚠️ yt-dlp is unavailable: {reason}"));
                self.log
                    .push("⚠️ Use \"Update yt-dlp\" to retry the download.".to_string());
            }
        }
    }

    fn can_download(&self) -> bool {
        self.tool_ready && self.download.is_none() && self.update.is_none()
    }

    fn can_update(&self) -> bool {
        !self.startup_pending && self.download.is_none() && self.update.is_none()
    }

    fn poll_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SessionEvent::Progress(ProgressEvent::RawLine(line)) => {
                    if !line.trim().is_empty() {
                        self.log.push(line);
                    }
                }
                SessionEvent::Progress(ProgressEvent::PercentUpdate(pct)) => {
                    self.progress = Some(f32::from(pct) / 100.0);
                }
                SessionEvent::Provisioning(fraction) => self.progress = Some(fraction),
                SessionEvent::Terminal(terminal) => {
                    let icon = match terminal.outcome {
                        Outcome::Succeeded => "✅",
                        Outcome::Cancelled => "⏹",
                        Outcome::Failed(_) | Outcome::Aborted(_) => "❌",
                    };
                    self.log.push(format!("{icon} {}", terminal.message));
                    if terminal.is_success() {
                        self.tool_ready = true;
                    }
                    match terminal.operation {
                        Operation::Download => self.download = None,
                        Operation::Update => self.update = None,
                    }
                    self.progress = None;
                }
            }
        }
    }

    fn build_request(&self) -> DownloadRequest {
        let mut request = DownloadRequest::new(self.url_input.trim());
        request.quality = self.selected_quality;
        request.extract_audio = self.extract_audio;
        request.audio_format = self.audio_format.clone();
        request.subtitles = self.subtitles;
        request.auto_subtitles = self.auto_subtitles;
        request.thumbnail = self.thumbnail;
        request.description = self.description;
        request.playlist = self.playlist;
        request.playlist_start = Some(self.playlist_start).filter(|n| *n > 0);
        request.playlist_end = Some(self.playlist_end).filter(|n| *n > 0);
        request.rate_limit_kbps = self.rate_limit_kbps;
        request.output_dir = self.output_dir.trim().to_string();
        request
    }

    fn start_download(&mut self) {
        let request = self.build_request();
        let url = request.url.clone();
        let output_dir = request.output_dir.clone();
        match self.coordinator.submit(
            OperationRequest::Download(request),
            self.events_tx.clone(),
        ) {
            Ok(handle) => {
                self.log.push(format!("🚀 Starting download from: {url}"));
                if !output_dir.is_empty() {
                    self.log.push(format!("📁 Output directory: {output_dir}"));
                }
                self.download = Some(handle);
                self.progress = Some(0.0);
            }
            Err(err) => self.log.push(format!("❌ {err}")),
        }
    }

    fn start_update(&mut self) {
        match self
            .coordinator
            .submit(OperationRequest::Update, self.events_tx.clone())
        {
            Ok(handle) => {
                self.log.push("🔄 Checking for yt-dlp updates...".to_string());
                self.update = Some(handle);
            }
            Err(err) => self.log.push(format!("❌ {err}")),
        }
    }

    fn options_ui(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            egui::ComboBox::from_label("Video Quality")
                .selected_text(self.selected_quality.to_string())
                .show_ui(ui, |ui| {
                    for quality in Quality::PRESETS {
                        ui.selectable_value(&mut self.selected_quality, quality, quality.to_string());
                    }
                });
            egui::ComboBox::from_label("Audio Format")
                .selected_text(self.audio_format.as_str())
                .show_ui(ui, |ui| {
                    for format in AUDIO_FORMATS {
                        ui.selectable_value(&mut self.audio_format, format.to_string(), format);
                    }
                });
        });

        ui.horizontal(|ui| {
            ui.checkbox(&mut self.extract_audio, "Extract Audio Only");
            ui.checkbox(&mut self.subtitles, "Download Subtitles");
            ui.add_enabled(
                self.subtitles,
                egui::Checkbox::new(&mut self.auto_subtitles, "Auto-generated Subtitles"),
            );
        });
        ui.horizontal(|ui| {
            ui.checkbox(&mut self.thumbnail, "Download Thumbnail");
            ui.checkbox(&mut self.description, "Save Description");
        });

        ui.horizontal(|ui| {
            ui.checkbox(&mut self.playlist, "Whole Playlist");
            ui.add_enabled_ui(self.playlist, |ui| {
                ui.label("From");
                ui.add(egui::DragValue::new(&mut self.playlist_start));
                ui.label("To");
                ui.add(egui::DragValue::new(&mut self.playlist_end));
                ui.label("(0 = open)");
            });
        });

        ui.horizontal(|ui| {
            ui.label("Speed limit:");
            ui.add(egui::DragValue::new(&mut self.rate_limit_kbps).suffix(" KiB/s"));
            ui.label("(0 = unlimited)");
        });
    }
}

/// GUI update loop: called each frame to redraw and handle interactions
impl App for MyApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        // 1️⃣ Drain background results before drawing
        self.poll_startup();
        self.poll_events();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("🎬 yt-dlp Downloader");

            // 2️⃣ URL input field
            ui.label("Video URL:");
            ui.text_edit_singleline(&mut self.url_input);

            // 3️⃣ Download options
            ui.separator();
            self.options_ui(ui);

            // 4️⃣ Folder selection
            ui.horizontal(|ui| {
                ui.label("Output directory:");
                ui.text_edit_singleline(&mut self.output_dir);
                if ui.button("Browse…").clicked() {
                    if let Some(folder) = FileDialog::new().set_directory(&self.output_dir).pick_folder() {
                        self.output_dir = folder.display().to_string();
                    }
                }
            });

            // 5️⃣ Control buttons; a running operation turns its button into Cancel
            ui.separator();
            ui.horizontal(|ui| {
                if let Some(handle) = &self.download {
                    if ui.button("Cancel Download").clicked() {
                        handle.cancel();
                    }
                } else if ui
                    .add_enabled(self.can_download(), egui::Button::new("Download"))
                    .clicked()
                {
                    self.start_download();
                }

                if let Some(handle) = &self.update {
                    if ui.button("Cancel Update").clicked() {
                        handle.cancel();
                    }
                } else if ui
                    .add_enabled(self.can_update(), egui::Button::new("Update yt-dlp"))
                    .clicked()
                {
                    self.start_update();
                }

                if ui.button("Clear Log").clicked() {
                    self.log.clear();
                }
            });

            if let Some(progress) = self.progress {
                ui.add(egui::ProgressBar::new(progress).show_percentage());
            }

            // 6️⃣ Log output
            ui.separator();
            egui::ScrollArea::vertical()
                .auto_shrink([false; 2])
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for line in &self.log {
                        ui.monospace(line);
                    }
                });
        });

        // Request periodic repaint for progress updates
        ctx.request_repaint_after(std::time::Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Handle;

    fn app() -> MyApp {
        let coordinator = Coordinator::new(OrchestratorConfig::default(), Handle::current());
        MyApp::new(coordinator, egui::Context::default())
    }

    #[tokio::test]
    async fn update_waits_for_startup_fetch() {
        let mut app = app();
        assert!(!app.can_update());
        assert!(!app.can_download());

        app.apply_startup(Startup::Progress(0.4));
        assert!(!app.can_update());

        app.apply_startup(Startup::Ready(PathBuf::from("/opt/yt-dlp")));
        assert!(app.can_update());
        assert!(app.can_download());
    }

    #[tokio::test]
    async fn failed_startup_leaves_only_update_available() {
        let mut app = app();
        app.apply_startup(Startup::Failed("offline".to_string()));
        assert!(app.can_update());
        assert!(!app.can_download());
    }
}
