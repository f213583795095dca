use std::fmt;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rendercfg::{SettingKey, SettingValue};

#[derive(Parser, Debug)]
#[command(
    name = "graphrun",
    author,
    version,
    about = "Headless frame graph runner",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Engine configuration TOML (display size and rendering settings).
    #[arg(long, value_name = "FILE", env = "GRAPHRUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the display resolution (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Number of frames to render.
    #[arg(
        long,
        value_name = "COUNT",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub frames: u64,

    /// Render-target backend: `software` (default) or `gpu`.
    #[arg(
        long,
        value_name = "BACKEND",
        value_parser = parse_backend,
        default_value_t = BackendKind::Software
    )]
    pub backend: BackendKind,

    /// PNG or JPEG used as the scene colour; a test pattern is used otherwise.
    #[arg(long, value_name = "IMAGE")]
    pub input: Option<PathBuf>,

    /// Change a setting before a frame: `KEY=VALUE` or `KEY=VALUE@FRAME` (repeatable).
    #[arg(long = "set", value_name = "KEY=VALUE[@FRAME]", value_parser = parse_setting_change)]
    pub settings: Vec<SettingChangeArg>,

    /// Resize the display before a frame: `WIDTHxHEIGHT@FRAME` (repeatable).
    #[arg(long = "resize", value_name = "WIDTHxHEIGHT@FRAME", value_parser = parse_resize)]
    pub resizes: Vec<ResizeArg>,

    /// Write every pooled buffer as PNG into this directory after the last frame.
    #[arg(long, value_name = "DIR")]
    pub export: Option<PathBuf>,

    /// Print per-pass timings for every frame.
    #[arg(long)]
    pub report: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the node wiring and buffer sizes without rendering.
    Describe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Gpu,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Software => f.write_str("software"),
            BackendKind::Gpu => f.write_str("gpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingChangeArg {
    pub key: SettingKey,
    pub value: SettingValue,
    pub frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeArg {
    pub width: u32,
    pub height: u32,
    pub frame: u64,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_backend(value: &str) -> Result<BackendKind, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("backend must not be empty".to_string());
    }

    let normalized = trimmed.to_ascii_lowercase();
    match normalized.as_str() {
        "software" | "cpu" => Ok(BackendKind::Software),
        "gpu" | "wgpu" => {
            if cfg!(feature = "gpu") {
                Ok(BackendKind::Gpu)
            } else {
                Err("gpu backend is not enabled in this build".to_string())
            }
        }
        _ => Err(format!(
            "unknown backend '{trimmed}' (available: {})",
            renderer::available_backends().join(", ")
        )),
    }
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WxH format, e.g. 1920x1080".to_string())?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in size '{trimmed}'"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in size '{trimmed}'"))?;

    if width == 0 || height == 0 {
        return Err("display dimensions must be greater than zero".to_string());
    }

    Ok((width, height))
}

fn split_frame(value: &str) -> Result<(&str, Option<u64>), String> {
    match value.rsplit_once('@') {
        Some((head, frame)) => {
            let frame = frame
                .trim()
                .parse()
                .map_err(|_| format!("invalid frame number '{}'", frame.trim()))?;
            Ok((head, Some(frame)))
        }
        None => Ok((value, None)),
    }
}

pub fn parse_setting_change(value: &str) -> Result<SettingChangeArg, String> {
    let (assignment, frame) = split_frame(value.trim())?;
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "expected KEY=VALUE, e.g. bloom=off".to_string())?;
    let key: SettingKey = key.parse().map_err(|err| format!("{err}"))?;
    let value = key.parse_value(raw).map_err(|err| format!("{err}"))?;
    Ok(SettingChangeArg {
        key,
        value,
        frame: frame.unwrap_or(0),
    })
}

pub fn parse_resize(value: &str) -> Result<ResizeArg, String> {
    let (size, frame) = split_frame(value.trim())?;
    let frame = frame.ok_or_else(|| "expected WIDTHxHEIGHT@FRAME, e.g. 1280x720@2".to_string())?;
    let (width, height) = parse_size(size)?;
    Ok(ResizeArg {
        width,
        height,
        frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("1280x720"), Ok((1280, 720)));
        assert_eq!(parse_size(" 64 X 32 "), Ok((64, 32)));
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("wide").is_err());
    }

    #[test]
    fn parses_setting_changes_with_and_without_frame() {
        assert_eq!(
            parse_setting_change("bloom=off@3"),
            Ok(SettingChangeArg {
                key: SettingKey::Bloom,
                value: SettingValue::Bool(false),
                frame: 3,
            })
        );
        assert_eq!(
            parse_setting_change("bloom-high-pass-threshold=0.5"),
            Ok(SettingChangeArg {
                key: SettingKey::BloomHighPassThreshold,
                value: SettingValue::Float(0.5),
                frame: 0,
            })
        );
        assert!(parse_setting_change("lens_flare=on").is_err());
        assert!(parse_setting_change("hdr=off").is_err());
        assert!(parse_setting_change("bloom").is_err());
        assert!(parse_setting_change("bloom=maybe").is_err());
        assert!(parse_setting_change("bloom=on@soon").is_err());
    }

    #[test]
    fn resize_requires_a_frame() {
        assert_eq!(
            parse_resize("640x480@2"),
            Ok(ResizeArg {
                width: 640,
                height: 480,
                frame: 2,
            })
        );
        assert!(parse_resize("640x480").is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!(parse_backend("software"), Ok(BackendKind::Software));
        assert_eq!(parse_backend("CPU"), Ok(BackendKind::Software));
        assert!(parse_backend("metal").is_err());
        assert_eq!(parse_backend("gpu").is_ok(), cfg!(feature = "gpu"));
    }
}
