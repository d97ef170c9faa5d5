use std::fmt;
use std::str::FromStr;

use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressEvent;

/// Which of the two operation slots a piece of work occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Media download through the tool
    Download,
    /// Tool self-update (or reinstall)
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Download => f.write_str("a download"),
            Operation::Update => f.write_str("a yt-dlp update"),
        }
    }
}

/// Requested video quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Let the tool pick and merge the best streams
    #[default]
    Best,
    /// Audio track only
    AudioOnly,
    /// Best video at or below this height
    MaxHeight(u32),
}

impl Quality {
    /// Presets offered by the UI, in display order
    pub const PRESETS: [Quality; 7] = [
        Quality::Best,
        Quality::MaxHeight(1080),
        Quality::MaxHeight(720),
        Quality::MaxHeight(480),
        Quality::MaxHeight(360),
        Quality::MaxHeight(240),
        Quality::AudioOnly,
    ];
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Best => f.write_str("Best Quality"),
            Quality::AudioOnly => f.write_str("Audio Only"),
            Quality::MaxHeight(height) => write!(f, "{height}p"),
        }
    }
}

impl FromStr for Quality {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "best" | "best quality" => return Ok(Quality::Best),
            "audio" | "audio only" => return Ok(Quality::AudioOnly),
            _ => {}
        }
        let digits = normalized.strip_suffix('p').unwrap_or(&normalized);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Quality::MaxHeight(height)),
            _ => Err(OrchestratorError::Validation(format!(
                "unrecognised quality '{}'",
                s.trim()
            ))),
        }
    }
}

/// Everything the user asked for in one download.
///
/// Treated as immutable once handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    /// Extract audio after download (forced on by `Quality::AudioOnly`)
    pub extract_audio: bool,
    /// Codec used when extracting audio
    pub audio_format: String,
    /// Target container when not extracting audio; empty keeps the source container
    pub container: String,
    pub subtitles: bool,
    /// Only honoured together with `subtitles`
    pub auto_subtitles: bool,
    pub thumbnail: bool,
    pub description: bool,
    pub playlist: bool,
    pub playlist_start: Option<u32>,
    pub playlist_end: Option<u32>,
    /// KiB/s, 0 = unlimited
    pub rate_limit_kbps: u32,
    /// Empty leaves the tool's default location
    pub output_dir: String,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            quality: Quality::Best,
            extract_audio: false,
            audio_format: "mp3".to_string(),
            container: String::new(),
            subtitles: false,
            auto_subtitles: false,
            thumbnail: false,
            description: false,
            playlist: false,
            playlist_start: None,
            playlist_end: None,
            rate_limit_kbps: 0,
            output_dir: String::new(),
        }
    }

    pub fn extracts_audio(&self) -> bool {
        self.extract_audio || self.quality == Quality::AudioOnly
    }

    /// Rejects requests that must never reach a subprocess.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(OrchestratorError::Validation("URL is empty".to_string()));
        }
        let parsed = url::Url::parse(url)
            .map_err(|e| OrchestratorError::Validation(format!("invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OrchestratorError::Validation(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }
        if self.extracts_audio() && self.audio_format.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "audio extraction needs an audio format".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.playlist_start, self.playlist_end) {
            if self.playlist && start > 0 && end > 0 && start > end {
                return Err(OrchestratorError::Validation(format!(
                    "playlist start {start} is after playlist end {end}"
                )));
            }
        }
        Ok(())
    }
}

/// How an operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Process exited with code 0
    Succeeded,
    /// Process exited non-zero
    Failed(i32),
    /// User cancelled; never reported as a failure
    Cancelled,
    /// No exit status to report: launch or provisioning failed
    Aborted(String),
}

/// Final report for one operation, with a message fit for the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub operation: Operation,
    pub outcome: Outcome,
    pub message: String,
}

impl Terminal {
    pub fn new(operation: Operation, outcome: Outcome) -> Self {
        let message = match (operation, &outcome) {
            (Operation::Download, Outcome::Succeeded) => "Download completed successfully!".to_string(),
            (Operation::Download, Outcome::Failed(code)) => {
                format!("Download failed with return code: {code}")
            }
            (Operation::Download, Outcome::Cancelled) => "Download cancelled.".to_string(),
            (Operation::Update, Outcome::Succeeded) => "yt-dlp update completed.".to_string(),
            (Operation::Update, Outcome::Failed(code)) => {
                format!("Update failed with return code: {code}")
            }
            (Operation::Update, Outcome::Cancelled) => "Update cancelled.".to_string(),
            (_, Outcome::Aborted(reason)) => format!("Error: {reason}"),
        };
        Self {
            operation,
            outcome,
            message,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

/// Everything a session reports to the UI, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(ProgressEvent),
    /// Fraction of an executable fetch completed, 0.0..=1.0
    Provisioning(f32),
    Terminal(Terminal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parses_ui_labels() {
        assert_eq!("Best Quality".parse::<Quality>().unwrap(), Quality::Best);
        assert_eq!("Audio Only".parse::<Quality>().unwrap(), Quality::AudioOnly);
        assert_eq!("720p".parse::<Quality>().unwrap(), Quality::MaxHeight(720));
        assert_eq!(" 1080 ".parse::<Quality>().unwrap(), Quality::MaxHeight(1080));
    }

    #[test]
    fn quality_rejects_garbage_and_zero() {
        assert!("0p".parse::<Quality>().is_err());
        assert!("hd".parse::<Quality>().is_err());
        assert!("".parse::<Quality>().is_err());
    }

    #[test]
    fn quality_presets_round_trip_through_display() {
        for preset in Quality::PRESETS {
            assert_eq!(preset.to_string().parse::<Quality>().unwrap(), preset);
        }
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = DownloadRequest::new("   ").validate().unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn non_http_url_is_rejected() {
        assert!(DownloadRequest::new("ftp://example.com/v").validate().is_err());
        assert!(DownloadRequest::new("not a url").validate().is_err());
    }

    #[test]
    fn https_url_is_accepted() {
        DownloadRequest::new("https://example.com/v").validate().unwrap();
        DownloadRequest::new("http://example.com/v").validate().unwrap();
    }

    #[test]
    fn inverted_playlist_range_is_rejected() {
        let mut request = DownloadRequest::new("https://example.com/list");
        request.playlist = true;
        request.playlist_start = Some(5);
        request.playlist_end = Some(2);
        assert!(request.validate().is_err());

        request.playlist_end = Some(9);
        request.validate().unwrap();
    }

    #[test]
    fn audio_only_quality_implies_extraction() {
        let mut request = DownloadRequest::new("https://example.com/v");
        assert!(!request.extracts_audio());
        request.quality = Quality::AudioOnly;
        assert!(request.extracts_audio());
    }

    #[test]
    fn terminal_messages_include_exit_code() {
        let terminal = Terminal::new(Operation::Download, Outcome::Failed(2));
        assert_eq!(terminal.message, "Download failed with return code: 2");
        let terminal = Terminal::new(Operation::Update, Outcome::Failed(1));
        assert_eq!(terminal.message, "Update failed with return code: 1");
        assert!(Terminal::new(Operation::Update, Outcome::Succeeded).is_success());
    }

    #[test]
    fn aborted_terminal_shows_its_reason() {
        let outcome = Outcome::Aborted("failed to launch yt-dlp".to_string());
        let terminal = Terminal::new(Operation::Download, outcome);
        assert_eq!(terminal.message, "Error: failed to launch yt-dlp");
        assert!(!terminal.is_success());
    }

    #[test]
    fn busy_error_names_the_active_operation() {
        let err = OrchestratorError::Busy {
            requested: Operation::Download,
            active: Operation::Update,
        };
        assert_eq!(
            err.to_string(),
            "cannot start a download: a yt-dlp update is already in progress"
        );
    }
}
