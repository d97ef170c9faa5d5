use crate::model::{DownloadRequest, Quality};

impl Quality {
    /// The `-f` selector, or `None` to let the tool choose.
    ///
    /// A height cap asks for split video+audio first and falls back to a
    /// single combined stream, since many sources have no combined stream at
    /// the exact height.
    pub fn format_selector(&self) -> Option<String> {
        match self {
            Quality::Best => None,
            Quality::AudioOnly => Some("bestaudio/best".to_string()),
            Quality::MaxHeight(height) => Some(format!(
                "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
            )),
        }
    }
}

/// Argument vector for a download. Pure: touches neither disk nor network.
pub fn download_args(request: &DownloadRequest) -> Vec<String> {
    // Line-per-update, uncoloured output keeps progress parsing reliable.
    let mut args = vec!["--newline".to_owned(), "--no-colors".to_owned()];

    if let Some(selector) = request.quality.format_selector() {
        args.push("-f".to_owned());
        args.push(selector);
    }

    if request.extracts_audio() {
        args.push("-x".to_owned());
        args.push("--audio-format".to_owned());
        args.push(request.audio_format.trim().to_owned());
    } else if !request.container.trim().is_empty() {
        args.push("--recode-video".to_owned());
        args.push(request.container.trim().to_owned());
    }

    if request.subtitles {
        args.push("--write-subs".to_owned());
        if request.auto_subtitles {
            args.push("--write-auto-subs".to_owned());
        }
    }
    if request.thumbnail {
        args.push("--write-thumbnail".to_owned());
    }
    if request.description {
        args.push("--write-description".to_owned());
    }

    if request.playlist {
        if let Some(start) = request.playlist_start.filter(|n| *n > 0) {
            args.push("--playlist-start".to_owned());
            args.push(start.to_string());
        }
        if let Some(end) = request.playlist_end.filter(|n| *n > 0) {
            args.push("--playlist-end".to_owned());
            args.push(end.to_string());
        }
    } else {
        args.push("--no-playlist".to_owned());
    }

    if request.rate_limit_kbps > 0 {
        args.push("--limit-rate".to_owned());
        args.push(format!("{}K", request.rate_limit_kbps));
    }

    let output_dir = request.output_dir.trim();
    if !output_dir.is_empty() {
        args.push("-o".to_owned());
        args.push(format!(
            "{}/%(title)s.%(ext)s",
            output_dir.trim_end_matches(['/', '\\'])
        ));
    }

    args.push(request.url.trim().to_owned());
    args
}
