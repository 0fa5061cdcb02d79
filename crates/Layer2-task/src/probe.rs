//! Capability probe - locates the encoder binary and its hardware acceleration
//!
//! Runs once at startup. Callers use the result when building commands; the
//! queue never looks at command content. A failed probe degrades to
//! [`Capabilities::unavailable`] instead of failing startup.

use mediaforge_foundation::QueueConfig;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Upper bound for each probe invocation
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Locations checked after `PATH`
const FALLBACK_PATHS: &[&str] = &["/opt/homebrew/bin/ffmpeg", "/usr/local/bin/ffmpeg"];

/// Hardware acceleration backends, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    VideoToolbox,
    Cuda,
    Qsv,
    Vaapi,
}

impl HwAccel {
    pub const PRIORITY: [HwAccel; 4] = [
        HwAccel::VideoToolbox,
        HwAccel::Cuda,
        HwAccel::Qsv,
        HwAccel::Vaapi,
    ];

    /// Value passed to `-hwaccel`
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccel::VideoToolbox => "videotoolbox",
            HwAccel::Cuda => "cuda",
            HwAccel::Qsv => "qsv",
            HwAccel::Vaapi => "vaapi",
        }
    }

    fn matches_encoder(&self, encoder: &str) -> bool {
        match self {
            HwAccel::VideoToolbox => {
                encoder == "h264_videotoolbox" || encoder == "hevc_videotoolbox"
            }
            HwAccel::Cuda => encoder.ends_with("_nvenc"),
            HwAccel::Qsv => encoder.ends_with("_qsv"),
            HwAccel::Vaapi => encoder.ends_with("_vaapi"),
        }
    }

    /// Best backend the encoder list supports
    pub fn select(encoders: &BTreeSet<String>) -> Option<HwAccel> {
        Self::PRIORITY
            .into_iter()
            .find(|accel| encoders.iter().any(|e| accel.matches_encoder(e)))
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the host encoder can do
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Capabilities {
    pub ffmpeg_path: Option<PathBuf>,
    /// First line of `-version`
    pub version: Option<String>,
    pub encoders: BTreeSet<String>,
    pub hwaccel: Option<HwAccel>,
}

impl Capabilities {
    /// No encoder found; commands are used unchanged
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub async fn detect(config: &QueueConfig) -> Self {
        for candidate in candidates(config) {
            let Some(version) = verify(&candidate).await else {
                debug!(path = %candidate.display(), "Encoder candidate rejected");
                continue;
            };

            let encoders = run_probe(&candidate, &["-hide_banner", "-encoders"])
                .await
                .map(|out| parse_encoders(&out))
                .unwrap_or_default();
            let hwaccel = HwAccel::select(&encoders);

            info!(
                path = %candidate.display(),
                encoders = encoders.len(),
                hwaccel = hwaccel.map(|h| h.as_str()).unwrap_or("none"),
                "Encoder detected"
            );

            return Self {
                ffmpeg_path: Some(candidate),
                version: Some(version),
                encoders,
                hwaccel,
            };
        }

        info!("No usable encoder binary found");
        Self::unavailable()
    }

    pub fn is_available(&self) -> bool {
        self.ffmpeg_path.is_some()
    }

    pub fn gpu_enabled(&self) -> bool {
        self.hwaccel.is_some()
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }

    /// `["-hwaccel", <backend>]`, or nothing without acceleration
    pub fn hwaccel_args(&self) -> Vec<String> {
        match self.hwaccel {
            Some(accel) => vec!["-hwaccel".to_string(), accel.as_str().to_string()],
            None => Vec::new(),
        }
    }

    /// Insert the acceleration flags right after the program name
    ///
    /// Commands that already choose a `-hwaccel` are left alone.
    pub fn apply(&self, mut command: Vec<String>) -> Vec<String> {
        let args = self.hwaccel_args();
        if args.is_empty() || command.is_empty() || command.iter().any(|a| a == "-hwaccel") {
            return command;
        }
        command.splice(1..1, args);
        command
    }
}

fn candidates(config: &QueueConfig) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !out.contains(&path) {
            out.push(path);
        }
    };

    if let Some(path) = &config.ffmpeg_path {
        push(path.clone());
    }
    if let Ok(path) = which::which("ffmpeg") {
        push(path);
    }
    for path in FALLBACK_PATHS {
        push(PathBuf::from(path));
    }
    out
}

async fn verify(path: &Path) -> Option<String> {
    let out = run_probe(path, &["-version"]).await?;
    Some(out.lines().next().unwrap_or_default().trim().to_string())
}

/// Stdout of a successful run within [`PROBE_TIMEOUT`]
async fn run_probe(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output).await.ok()?.ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Encoder names from `-encoders` output
///
/// Data rows are a six-character capability column followed by the name;
/// the legend above the `------` separator uses `=` in the name position.
pub fn parse_encoders(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            let is_flags = flags.len() == 6
                && flags
                    .chars()
                    .all(|c| matches!(c, 'V' | 'A' | 'S' | 'F' | 'X' | 'B' | 'D' | '.'));
            (is_flags && name != "=").then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn with_accel(accel: HwAccel) -> Capabilities {
        Capabilities {
            ffmpeg_path: Some("/usr/bin/ffmpeg".into()),
            hwaccel: Some(accel),
            ..Capabilities::default()
        }
    }

    #[test]
    fn test_parse_encoders_skips_legend() {
        let encoders = parse_encoders(ENCODERS);
        assert_eq!(encoders.len(), 4);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_hwaccel_priority() {
        let encoders = parse_encoders(ENCODERS);
        assert_eq!(HwAccel::select(&encoders), Some(HwAccel::Cuda));

        let mut mac = encoders.clone();
        mac.insert("hevc_videotoolbox".to_string());
        assert_eq!(HwAccel::select(&mac), Some(HwAccel::VideoToolbox));

        let software: BTreeSet<String> = ["libx264".to_string()].into_iter().collect();
        assert_eq!(HwAccel::select(&software), None);
    }

    #[test]
    fn test_apply_inserts_after_program() {
        let caps = with_accel(HwAccel::VideoToolbox);
        let command = caps.apply(argv(&["ffmpeg", "-i", "in.mp4", "out.mp4"]));
        assert_eq!(
            command,
            argv(&["ffmpeg", "-hwaccel", "videotoolbox", "-i", "in.mp4", "out.mp4"])
        );
    }

    #[test]
    fn test_apply_respects_existing_choice() {
        let caps = with_accel(HwAccel::Cuda);
        let original = argv(&["ffmpeg", "-hwaccel", "qsv", "-i", "in.mp4", "out.mp4"]);
        assert_eq!(caps.apply(original.clone()), original);

        let plain = argv(&["ffmpeg", "-i", "in.mp4", "out.mp4"]);
        assert_eq!(Capabilities::unavailable().apply(plain.clone()), plain);
        assert!(Capabilities::unavailable().hwaccel_args().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_rejected() {
        assert!(verify(Path::new("/nonexistent/ffmpeg")).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_with_configured_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             case \"$*\" in\n\
               *-encoders*) printf ' V..... = Video\\n ------\\n V....D libx264  x264\\n V....D h264_qsv  QSV\\n' ;;\n\
               *-version*) echo 'ffmpeg version 6.1-test' ;;\n\
               *) exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = QueueConfig {
            ffmpeg_path: Some(script.clone()),
            ..QueueConfig::default()
        };
        let caps = Capabilities::detect(&config).await;

        assert_eq!(caps.ffmpeg_path, Some(script));
        assert_eq!(caps.version.as_deref(), Some("ffmpeg version 6.1-test"));
        assert!(caps.has_encoder("libx264"));
        assert_eq!(caps.hwaccel, Some(HwAccel::Qsv));
        assert_eq!(caps.hwaccel_args(), argv(&["-hwaccel", "qsv"]));
    }
}
