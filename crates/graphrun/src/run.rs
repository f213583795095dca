use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rendercfg::{EngineConfig, Settings};
use renderer::bloom::{bloom_pipeline, intermediate_format};
use renderer::{
    BufferPool, DisplayResolution, FrameGraph, FrameReport, GpuBackend, PixelImage,
    SoftwareBackend,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{BackendKind, RunArgs};

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    check_schedule(&args)?;
    let mut graph = build_graph(&args)?;
    let remote = graph.settings().remote();

    for frame in 0..args.frames {
        for resize in args.resizes.iter().filter(|resize| resize.frame == frame) {
            let resolution = DisplayResolution::new(resize.width, resize.height);
            graph
                .resize(resolution)
                .with_context(|| format!("failed to resize buffers to {resolution}"))?;
            tracing::info!(frame, %resolution, "display resized");
        }

        for change in args.settings.iter().filter(|change| change.frame == frame) {
            tracing::info!(frame, key = %change.key, value = %change.value, "queueing setting change");
            remote.set(change.key, change.value);
        }

        let report = graph
            .render_frame()
            .with_context(|| format!("frame {frame} failed"))?;
        print_report(&report, args.report);
    }

    if let Some(dir) = args.export.as_deref() {
        export_buffers(&mut graph, dir)?;
    }

    let pool = graph.shutdown();
    tracing::debug!(remaining = pool.len(), "pool released");
    Ok(())
}

pub fn describe(args: RunArgs) -> Result<()> {
    let graph = build_graph(&args)?;
    let pool = graph.pool();
    println!("backend: {}", pool.backend().name());
    println!("resolution: {}", pool.resolution());
    println!("nodes:");
    for node in graph.diagnostics() {
        println!("  {node}");
    }
    println!("buffers:");
    for key in pool.keys() {
        if let Some(handle) = pool.handle(key) {
            let config = handle.config();
            println!(
                "  {key:<40} {}x{} {} {} users={}",
                handle.width(),
                handle.height(),
                config.format,
                config.scale,
                pool.users(key)
            );
        }
    }
    Ok(())
}

/// Rejects `--set`/`--resize` entries scheduled for a frame that never renders.
fn check_schedule(args: &RunArgs) -> Result<()> {
    for change in &args.settings {
        anyhow::ensure!(
            change.frame < args.frames,
            "--set {}={}@{} is scheduled after the last frame ({} frames requested)",
            change.key,
            change.value,
            change.frame,
            args.frames
        );
    }
    for resize in &args.resizes {
        anyhow::ensure!(
            resize.frame < args.frames,
            "--resize {}x{}@{} is scheduled after the last frame ({} frames requested)",
            resize.width,
            resize.height,
            resize.frame,
            args.frames
        );
    }
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<EngineConfig> {
    let Some(path) = args.config.as_deref() else {
        return Ok(EngineConfig::default());
    };
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    EngineConfig::from_toml_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))
}

fn build_graph(args: &RunArgs) -> Result<FrameGraph> {
    let config = load_config(args)?;
    let (width, height) = args
        .size
        .unwrap_or((config.display.width, config.display.height));
    let resolution = DisplayResolution::new(width, height);

    let scene = match args.input.as_deref() {
        Some(path) => PixelImage::load(path).context("failed to load scene image")?,
        None => PixelImage::test_pattern(width, height),
    };

    let backend = create_backend(args.backend)?;
    tracing::debug!(backend = backend.name(), %resolution, hdr = config.rendering.hdr, "building frame graph");

    let settings = Settings::new(config.rendering.clone());
    let pool = BufferPool::new(backend, resolution);
    let mut builder = FrameGraph::builder();
    builder.extend(bloom_pipeline(scene, intermediate_format(config.rendering.hdr)))?;
    let graph = builder
        .build(pool, settings)
        .context("failed to build frame graph")?;
    Ok(graph)
}

fn create_backend(kind: BackendKind) -> Result<Box<dyn GpuBackend>> {
    match kind {
        BackendKind::Software => Ok(Box::new(SoftwareBackend::new())),
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => {
            let backend = renderer::WgpuBackend::new().context("failed to initialise GPU backend")?;
            tracing::info!(adapter = backend.adapter_name(), "using GPU backend");
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "gpu"))]
        BackendKind::Gpu => anyhow::bail!("gpu backend is not enabled in this build"),
    }
}

fn print_report(report: &FrameReport, detailed: bool) {
    println!(
        "frame {}: executed {} skipped {} ({:.3} ms)",
        report.frame,
        report.executed.len(),
        report.skipped.len(),
        report.total_duration().as_secs_f64() * 1000.0
    );
    if detailed {
        for timing in &report.timings {
            println!(
                "  {:<40} {:.3} ms",
                timing.label,
                timing.duration.as_secs_f64() * 1000.0
            );
        }
    }
}

fn export_buffers(graph: &mut FrameGraph, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export directory {}", dir.display()))?;
    let keys: Vec<_> = graph.pool().keys().cloned().collect();
    for key in keys {
        let image = graph.read_buffer(&key)?;
        let path = dir.join(format!("{}.png", export_file_stem(key.as_str())));
        image.save_png(&path)?;
        tracing::info!(buffer = %key, path = %path.display(), "exported buffer");
    }
    Ok(())
}

fn export_file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn run_args(argv: &[&str]) -> RunArgs {
        Cli::try_parse_from(std::iter::once("graphrun").chain(argv.iter().copied()))
            .unwrap()
            .run
    }

    #[test]
    fn schedule_must_fit_within_the_frame_count() {
        assert!(check_schedule(&run_args(&["--frames", "3", "--set", "bloom=off@2"])).is_ok());
        assert!(check_schedule(&run_args(&["--frames", "3", "--resize", "64x64@0"])).is_ok());

        let err = check_schedule(&run_args(&["--frames", "2", "--set", "bloom=off@2"]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("after the last frame"), "{err}");
        assert!(check_schedule(&run_args(&["--resize", "64x64@1"])).is_err());
    }

    #[test]
    fn export_names_are_filesystem_safe() {
        assert_eq!(
            export_file_stem("engine:fbo.halfScaleBlurredBloom"),
            "engine_fbo.halfScaleBlurredBloom"
        );
        assert_eq!(export_file_stem("a/b c"), "a_b_c");
    }
}
