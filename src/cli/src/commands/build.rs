//! `kiln build` command - Build an image from one or more build scripts.
//!
//! The positional argument is the context directory, a build script whose
//! directory becomes the context, or `-` to read a context tar from stdin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use kiln_core::config::{CompressionKind, ManifestFormatKind};
use kiln_core::error::{BuildError, Result};
use kiln_engine::{
    BuildRequest, Compression, ContextSource, LogSink, ManifestFormat, NetworkMode, PullPolicy,
    Script, TransientMount,
};
use tracing::debug;

/// Script names looked up in the context, in order.
const DEFAULT_SCRIPTS: &[&str] = &["Containerfile", "Dockerfile"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkArg {
    /// No network access for RUN
    None,
    /// Share the host network
    Host,
}

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory, a build script, or "-" for a tar on stdin
    #[arg(default_value = ".")]
    pub path: String,

    /// Build script (default: Containerfile or Dockerfile in the context);
    /// repeat to add scripts whose stages the first one can use
    #[arg(short = 'f', long = "file")]
    pub file: Vec<String>,

    /// Name for the image; repeat for additional tags
    #[arg(short = 't', long = "tag")]
    pub tag: Vec<String>,

    /// Set build-time variables (KEY=VALUE, or KEY to take it from the
    /// environment), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Stage to build
    #[arg(long)]
    pub target: Option<String>,

    /// When to pull base images: always, missing or never
    #[arg(long, default_value = "missing")]
    pub pull: PullPolicy,

    /// Do not use the layer cache
    #[arg(long)]
    pub no_cache: bool,

    /// Layer compression: none, gzip or zstd
    #[arg(long)]
    pub compression: Option<CompressionKind>,

    /// Manifest format: oci or docker
    #[arg(long)]
    pub format: Option<ManifestFormatKind>,

    /// Bind mount for RUN commands (HOST:CONTAINER[:OPTIONS]), can be
    /// repeated
    #[arg(short = 'v', long = "volume", value_parser = TransientMount::parse)]
    pub volume: Vec<TransientMount>,

    /// Network for RUN commands
    #[arg(long, value_enum)]
    pub network: Option<NetworkArg>,

    /// Pin created times to this Unix timestamp
    #[arg(long)]
    pub timestamp: Option<i64>,

    /// Only print the image id
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let config = &services.config;

    let (context, default_dir) = resolve_context(&args.path)?;
    let script_paths = script_paths(&args.file, default_dir.as_deref(), &args.path)?;
    let mut scripts = Vec::with_capacity(script_paths.len());
    for path in &script_paths {
        scripts.push(read_script(path)?);
    }

    let compression: Compression = args.compression.unwrap_or(config.default_compression).into();
    let manifest_format: ManifestFormat =
        args.format.unwrap_or(config.default_manifest_format).into();
    if compression == Compression::Zstd && manifest_format == ManifestFormat::DockerV2S2 {
        return Err(BuildError::Usage(
            "zstd compression requires the oci format".to_string(),
        ));
    }

    let mut request = BuildRequest::new(scripts, context);
    request.build_args = parse_build_args(&args.build_arg)?;
    request.target = args.target;
    let mut tags = args.tag.into_iter();
    request.output_name = tags.next();
    request.additional_tags = tags.collect();
    request.pull_policy = args.pull;
    request.cache_enabled = !args.no_cache;
    request.compression = compression;
    request.manifest_format = manifest_format;
    request.transient_mounts = args.volume;
    request.network = match args.network {
        Some(NetworkArg::None) => NetworkMode::Disabled,
        Some(NetworkArg::Host) | None => NetworkMode::Enabled,
    };
    request.timestamp = args.timestamp.map(parse_timestamp).transpose()?;
    if !args.quiet {
        request.log_sink = Some(LogSink::stdout());
    }

    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = kiln_engine::build(&services, request).await;
    services.shutdown()?;
    let result = result?;
    debug!(
        image = %result.image_id,
        runs = result.runs_executed,
        cache_hits = result.cache_hits,
        "Build finished"
    );

    if args.quiet {
        println!("{}", result.image_id);
    }
    Ok(())
}

/// The build context, and the directory default scripts are looked up in.
fn resolve_context(path: &str) -> Result<(ContextSource, Option<PathBuf>)> {
    if path == "-" {
        return Ok((ContextSource::Tar(Box::new(std::io::stdin())), None));
    }
    let path = PathBuf::from(path).canonicalize().map_err(|e| {
        BuildError::ContextError(format!("Invalid build context path '{}': {}", path, e))
    })?;
    let dir = if path.is_dir() {
        path
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BuildError::ContextError(format!("{} has no parent", path.display())))?
    };
    Ok((ContextSource::Dir(dir.clone()), Some(dir)))
}

/// Scripts to parse: `-f` values (relative ones resolved in the context),
/// else the positional script, else a default name in the context.
fn script_paths(files: &[String], context_dir: Option<&Path>, positional: &str) -> Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files
            .iter()
            .map(|f| {
                let p = PathBuf::from(f);
                match context_dir {
                    Some(dir) if p.is_relative() && !p.exists() => dir.join(p),
                    _ => p,
                }
            })
            .collect());
    }
    let Some(dir) = context_dir else {
        return Err(BuildError::Usage(
            "a tar context on stdin needs -f to name the build script".to_string(),
        ));
    };
    let positional = PathBuf::from(positional);
    if positional.is_file() {
        return Ok(vec![positional]);
    }
    DEFAULT_SCRIPTS
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
        .map(|p| vec![p])
        .ok_or_else(|| {
            BuildError::ContextError(format!(
                "no Containerfile or Dockerfile in {}",
                dir.display()
            ))
        })
}

fn read_script(path: &Path) -> Result<Script> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        BuildError::ContextError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Script::parse(&text)
}

/// Parse `KEY=VALUE` pairs. A bare `KEY` takes its value from the
/// environment.
fn parse_build_args(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for arg in args {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => {
                let value = std::env::var(arg).map_err(|_| {
                    BuildError::Usage(format!(
                        "build arg {arg} has no value and is not set in the environment"
                    ))
                })?;
                (arg.clone(), value)
            }
        };
        if key.is_empty() {
            return Err(BuildError::Usage(format!("Invalid build arg: {arg}")));
        }
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| BuildError::Usage(format!("timestamp {secs} is out of range")))
}
