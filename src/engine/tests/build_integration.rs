//! End-to-end builds against a scripted runtime.
//!
//! `ScriptedRuntime` interprets the few shell commands these scripts use
//! directly on the root filesystem, so the tests need neither privileges
//! nor a container runtime.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::config::EngineConfig;
use kiln_core::error::{BuildError, ErrorKind, Result};
use kiln_engine::store::LayerId;
use kiln_engine::{
    build, BuildRequest, BuildResult, ContextSource, ExecResult, ExecRuntime, ExecSpec, ImageStore,
    LayerStore, Script, Services,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ScriptedRuntime {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRuntime {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn host_path(root: &Path, spec: &ExecSpec, path: &str) -> PathBuf {
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", spec.working_dir.trim_end_matches('/'), path)
        };
        root.join(absolute.trim_start_matches('/'))
    }

    async fn command(
        &self,
        root: &Path,
        spec: &ExecSpec,
        words: &[&str],
        stdout: &mut Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let Some((name, args)) = words.split_first() else {
            return Ok(0);
        };
        match *name {
            "true" => Ok(0),
            "false" => Ok(1),
            "exit" => Ok(args.first().and_then(|a| a.parse().ok()).unwrap_or(0)),
            "touch" => {
                for arg in args {
                    let path = Self::host_path(root, spec, arg);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                }
                Ok(0)
            }
            "mkdir" => {
                for arg in args.iter().filter(|a| !a.starts_with('-')) {
                    std::fs::create_dir_all(Self::host_path(root, spec, arg))?;
                }
                Ok(0)
            }
            "echo" => match args.iter().position(|a| *a == ">") {
                Some(pos) => {
                    let path = Self::host_path(root, spec, args[pos + 1]);
                    std::fs::write(path, format!("{}\n", args[..pos].join(" ")))?;
                    Ok(0)
                }
                None => {
                    stdout.extend_from_slice(format!("{}\n", args.join(" ")).as_bytes());
                    Ok(0)
                }
            },
            "env" => {
                let path = Self::host_path(root, spec, args[1]);
                std::fs::write(path, spec.env.join("\n"))?;
                Ok(0)
            }
            "sleep" => {
                let secs: f64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0.0);
                tokio::select! {
                    _ = cancel.cancelled() => Err(BuildError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => Ok(0),
                }
            }
            _ => Ok(127),
        }
    }
}

#[async_trait]
impl ExecRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        root: &Path,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let text = spec.argv.last().cloned().unwrap_or_default();
        let mut stdout = Vec::new();
        let mut exit_status = 0;
        let mut outcome = Ok(());
        for segment in text.split("&&").flat_map(|s| s.split(';')) {
            let words: Vec<&str> = segment.split_whitespace().collect();
            match self.command(root, spec, &words, &mut stdout, cancel).await {
                Ok(0) => {}
                Ok(code) => {
                    exit_status = code;
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        let stderr = if exit_status == 0 {
            Vec::new()
        } else {
            format!("command failed: {}\n", text).into_bytes()
        };
        Ok(ExecResult {
            exit_status,
            stdout,
            stderr,
        })
    }
}

struct Fixture {
    state: TempDir,
    context: TempDir,
    runtime: Arc<ScriptedRuntime>,
    services: Arc<Services>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let state = TempDir::new().unwrap();
        let context = TempDir::new().unwrap();
        let mut config = EngineConfig::with_root(state.path());
        adjust(&mut config);
        let runtime = Arc::new(ScriptedRuntime::default());
        let services = Arc::new(Services::with_runtime(config, runtime.clone()).unwrap());
        Self {
            state,
            context,
            runtime,
            services,
        }
    }

    fn write(&self, name: &str, data: &[u8]) {
        let path = self.context.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    fn request(&self, script: &str) -> BuildRequest {
        let script = Script::parse(script).unwrap();
        BuildRequest::new(vec![script], ContextSource::Dir(self.context.path().to_path_buf()))
    }

    async fn build(&self, script: &str) -> Result<BuildResult> {
        build(&self.services, self.request(script)).await
    }

    /// Entry paths of the image's top layer diff, without `./` or a
    /// trailing slash.
    fn top_diff(&self, result: &BuildResult) -> BTreeSet<String> {
        let record = self.services.images.get(&result.image_id).unwrap().unwrap();
        let top = record.top_layer.expect("image has layers");
        self.diff_entries(&top).into_iter().map(|(path, _)| path).collect()
    }

    fn diff_entries(&self, layer: &LayerId) -> Vec<(String, tar::EntryType)> {
        let file = self.services.layers.open_diff(layer).unwrap();
        let mut archive = tar::Archive::new(file);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let path = path.trim_start_matches("./").trim_end_matches('/').to_string();
                (path, entry.header().entry_type())
            })
            .filter(|(path, _)| !path.is_empty() && path != ".")
            .collect()
    }

    /// Content of a regular file in a layer diff.
    fn diff_file(&self, layer: &LayerId, wanted: &str) -> Option<Vec<u8>> {
        let file = self.services.layers.open_diff(layer).unwrap();
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            if path.trim_start_matches("./") == wanted {
                let mut data = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
                return Some(data);
            }
        }
        None
    }

    fn mounts_left(&self) -> usize {
        std::fs::read_dir(self.state.path().join("mounts"))
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn test_scratch_single_file() {
    let fx = Fixture::new();
    fx.write("hello", b"hi\n");

    let result = fx.build("FROM scratch\nCOPY hello /\n").await.unwrap();
    assert_eq!(result.layer_count, 1);
    assert_eq!(result.runs_executed, 0);

    let record = fx.services.images.get(&result.image_id).unwrap().unwrap();
    let top = record.top_layer.unwrap();
    let files: Vec<String> = fx
        .diff_entries(&top)
        .into_iter()
        .filter(|(_, kind)| kind.is_file())
        .map(|(path, _)| path)
        .collect();
    assert_eq!(files, vec!["hello"]);

    let layer = fx.services.layers.get(&top).unwrap().unwrap();
    assert!(layer.parent.is_none());

    let config = fx.services.images.config(&result.image_id).unwrap();
    assert_eq!(config.history.len(), 2);
    assert!(config.history[0].empty_layer);
    assert!(!config.history[1].empty_layer);
    assert_eq!(config.history[1].created_by.as_deref(), Some("COPY hello /"));
    assert!(config.config.env.is_none());
    assert!(config.config.cmd.is_none());
    assert_eq!(config.rootfs.diff_ids, vec![layer.diff_digest]);
    assert_eq!(fx.mounts_left(), 0);
}

#[tokio::test]
async fn test_metadata_only_chain() {
    let fx = Fixture::new();
    let result = fx
        .build("FROM scratch\nENV A=1\nENV B=2\nCMD [\"/x\"]\n")
        .await
        .unwrap();
    assert_eq!(result.layer_count, 0);

    let config = fx.services.images.config(&result.image_id).unwrap();
    assert_eq!(config.history.len(), 4);
    assert!(config.history.iter().all(|h| h.empty_layer));
    assert_eq!(config.config.env, Some(vec!["A=1".to_string(), "B=2".to_string()]));
    assert_eq!(config.config.cmd, Some(vec!["/x".to_string()]));
    assert!(fx.services.images.manifest(&result.image_id).unwrap().layers.is_empty());
}

#[tokio::test]
async fn test_scratch_only() {
    let fx = Fixture::new();
    let result = fx.build("FROM scratch\n").await.unwrap();
    assert_eq!(result.layer_count, 0);
    let config = fx.services.images.config(&result.image_id).unwrap();
    assert_eq!(config.config, Default::default());
    assert!(config.rootfs.diff_ids.is_empty());
}

#[tokio::test]
async fn test_rebuild_hits_cache() {
    let fx = Fixture::new();
    fx.write("a", b"x");
    let script = "FROM scratch\nCOPY a /\nRUN /bin/true\n";

    let first = fx.build(script).await.unwrap();
    assert_eq!(fx.runtime.calls(), 1);
    assert_eq!(first.runs_executed, 1);

    let second = fx.build(script).await.unwrap();
    assert_eq!(fx.runtime.calls(), 1, "second build must not run anything");
    assert_eq!(second.runs_executed, 0);
    assert_eq!(second.cache_hits, 2);
    assert_eq!(second.manifest_digest, first.manifest_digest);
    assert_eq!(second.image_id, first.image_id);
}

#[tokio::test]
async fn test_changed_input_misses_cache() {
    let fx = Fixture::new();
    fx.write("a", b"x");
    let script = "FROM scratch\nCOPY a /\nRUN /bin/true\n";

    let first = fx.build(script).await.unwrap();
    fx.write("a", b"y");
    let second = fx.build(script).await.unwrap();

    assert_eq!(fx.runtime.calls(), 2);
    assert_eq!(second.runs_executed, 1);
    assert_eq!(second.cache_hits, 0);
    assert_ne!(second.manifest_digest, first.manifest_digest);
}

#[tokio::test]
async fn test_no_cache_reruns() {
    let fx = Fixture::new();
    let script = "FROM scratch\nRUN touch /a\n";
    fx.build(script).await.unwrap();

    let mut request = fx.request(script);
    request.cache_enabled = false;
    let result = build(&fx.services, request).await.unwrap();
    assert_eq!(result.runs_executed, 1);
    assert_eq!(fx.runtime.calls(), 2);
}

#[tokio::test]
async fn test_arg_invalidates_only_referencing_steps() {
    let fx = Fixture::new();
    let script = "FROM scratch\nARG V=1\nRUN touch /plain\nRUN touch /$V\n";

    let mut request = fx.request(script);
    request.build_args.insert("V".into(), "a".into());
    build(&fx.services, request).await.unwrap();
    assert_eq!(fx.runtime.calls(), 2);

    let mut request = fx.request(script);
    request.build_args.insert("V".into(), "b".into());
    let result = build(&fx.services, request).await.unwrap();
    // The first RUN does not mention V and is reused.
    assert_eq!(result.cache_hits, 1);
    assert_eq!(result.runs_executed, 1);
    assert_eq!(fx.runtime.calls(), 3);
}

#[tokio::test]
async fn test_args_reach_run_environment() {
    let fx = Fixture::new();
    let mut request = fx.request("FROM scratch\nARG MODE=debug\nENV NAME=kiln\nRUN env > /env.txt\n");
    request.build_args.insert("MODE".into(), "release".into());
    request.build_args.insert("UNUSED".into(), "1".into());
    let result = build(&fx.services, request).await.unwrap();

    let record = fx.services.images.get(&result.image_id).unwrap().unwrap();
    let top = record.top_layer.unwrap();
    let file = fx.services.layers.open_diff(&top).unwrap();
    let mut archive = tar::Archive::new(file);
    let mut env = String::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy().ends_with("env.txt") {
            std::io::Read::read_to_string(&mut entry, &mut env).unwrap();
        }
    }
    let lines: Vec<&str> = env.lines().collect();
    assert!(lines.contains(&"NAME=kiln"), "{}", env);
    assert!(lines.contains(&"MODE=release"), "{}", env);
    assert!(lines.iter().any(|l| l.starts_with("PATH=")), "{}", env);
    assert!(!lines.iter().any(|l| l.starts_with("UNUSED=")), "{}", env);
}

#[tokio::test]
async fn test_volume_contents_not_committed() {
    let fx = Fixture::new();
    let result = fx
        .build("FROM scratch\nVOLUME /data\nRUN touch /data/x && touch /outside\n")
        .await
        .unwrap();

    let paths = fx.top_diff(&result);
    assert!(paths.contains("outside"), "{:?}", paths);
    assert!(!paths.iter().any(|p| p.starts_with("data/")), "{:?}", paths);

    let config = fx.services.images.config(&result.image_id).unwrap();
    assert!(config.config.volumes.unwrap().contains_key("/data"));
}

#[tokio::test]
async fn test_run_writing_only_volume_is_empty() {
    let fx = Fixture::new();
    let result = fx
        .build("FROM scratch\nVOLUME /data\nRUN touch /data/only\n")
        .await
        .unwrap();
    let config = fx.services.images.config(&result.image_id).unwrap();
    let last = config.history.last().unwrap();
    assert_eq!(last.created_by.as_deref(), Some("RUN touch /data/only"));
    assert!(last.empty_layer);
}

#[tokio::test]
async fn test_workdir_inside_volume_survives_run() {
    let fx = Fixture::new();
    let result = fx
        .build("FROM scratch\nVOLUME /data\nRUN true\nWORKDIR /data/sub\nRUN true\n")
        .await
        .unwrap();

    let config = fx.services.images.config(&result.image_id).unwrap();
    assert_eq!(config.config.working_dir.as_deref(), Some("/data/sub"));
    let last = config.history.last().unwrap();
    assert!(last.empty_layer, "{:?}", config.history);

    // The top layer is the WORKDIR one; the RUN after it deleted nothing.
    let record = fx.services.images.get(&result.image_id).unwrap().unwrap();
    let entries = fx.diff_entries(&record.top_layer.unwrap());
    assert!(entries.iter().any(|(p, _)| p == "data/sub"), "{:?}", entries);
    assert!(!entries.iter().any(|(p, _)| p.contains(".wh.")), "{:?}", entries);
}

#[tokio::test]
async fn test_volume_declared_after_run_is_snapshotted_fresh() {
    let fx = Fixture::new();
    let result = fx
        .build("FROM scratch\nVOLUME /data\nRUN true\nVOLUME /data/late\nRUN touch /data/late/x && touch /y\n")
        .await
        .unwrap();
    let paths = fx.top_diff(&result);
    assert!(paths.contains("y"), "{:?}", paths);
    assert!(!paths.iter().any(|p| p.starts_with("data")), "{:?}", paths);
}

#[tokio::test]
async fn test_copy_over_file_with_same_size_and_mtime() {
    let fx = Fixture::new();
    fx.write("a", b"AA");
    fx.write("b", b"BB");
    for name in ["a", "b"] {
        kiln_engine::fsutil::set_mtime(&fx.context.path().join(name), 1_000, 0).unwrap();
    }

    let result = fx.build("FROM scratch\nCOPY a /f\nCOPY b /f\n").await.unwrap();
    let config = fx.services.images.config(&result.image_id).unwrap();
    assert!(!config.history.last().unwrap().empty_layer);

    let record = fx.services.images.get(&result.image_id).unwrap().unwrap();
    let top = record.top_layer.unwrap();
    assert_eq!(fx.diff_file(&top, "f").as_deref(), Some(&b"BB"[..]));
}

#[tokio::test]
async fn test_run_failure_is_located() {
    let fx = Fixture::new();
    let err = fx
        .build("FROM scratch\nRUN touch /kept\nRUN false\n")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RunFailed);
    assert_eq!(err.stage_location(), Some((0, 2)));
    match err.root_cause() {
        BuildError::RunFailed {
            exit_status,
            stderr_tail,
            ..
        } => {
            assert_eq!(*exit_status, 1);
            assert!(stderr_tail.contains("false"));
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }

    // The layer of the first RUN survives for the next attempt.
    let layers = fx.services.layers.list().unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(fx.mounts_left(), 0);
    assert!(fx.services.images.list().unwrap().is_empty());

    let result = fx.build("FROM scratch\nRUN touch /kept\n").await.unwrap();
    assert_eq!(result.cache_hits, 1);
}

#[tokio::test]
async fn test_missing_copy_source() {
    let fx = Fixture::new();
    let err = fx.build("FROM scratch\nCOPY nothing /\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CopySourceMissing);
    assert_eq!(err.stage_location(), Some((0, 1)));
}

#[tokio::test]
async fn test_ignored_file_is_not_copied() {
    let fx = Fixture::new();
    fx.write(".dockerignore", b"secret\n");
    fx.write("app/main", b"run");
    fx.write("app/secret", b"no");
    fx.write("secret", b"no");

    let result = fx.build("FROM scratch\nCOPY app /app/\n").await.unwrap();
    let paths = fx.top_diff(&result);
    assert!(paths.contains("app/main"), "{:?}", paths);

    let err = fx.build("FROM scratch\nCOPY secret /\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CopySourceMissing);
}

#[tokio::test]
async fn test_copy_context_with_large_ignored_tree() {
    let fx = Fixture::new();
    fx.write(".dockerignore", b"node_modules\n!README.md\n");
    fx.write("README.md", b"readme");
    fx.write("index.js", b"");
    for i in 0..8000 {
        std::fs::create_dir_all(fx.context.path().join(format!("node_modules/pkg{i}"))).unwrap();
    }

    let result = fx.build("FROM scratch\nCOPY . /app/\n").await.unwrap();
    let paths = fx.top_diff(&result);
    assert!(paths.contains("app/README.md"), "{:?}", paths);
    assert!(paths.contains("app/index.js"), "{:?}", paths);
    assert!(!paths.iter().any(|p| p.contains("node_modules")), "{:?}", paths);
}

#[tokio::test]
async fn test_unknown_instruction_policy() {
    let fx = Fixture::new();
    let err = fx.build("FROM scratch\nFROBNICATE x\n").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptInvalid);

    let fx = Fixture::with_config(|c| c.permissive_instructions = true);
    let result = fx.build("FROM scratch\nFROBNICATE x\n").await.unwrap();
    let config = fx.services.images.config(&result.image_id).unwrap();
    let last = config.history.last().unwrap();
    assert!(last.empty_layer);
    assert!(last.comment.as_deref().unwrap_or_default().contains("FROBNICATE"));
}

#[tokio::test]
async fn test_multi_stage_copy_from() {
    let fx = Fixture::new();
    let script = "\
FROM scratch AS builder
RUN mkdir -p /out && echo built > /out/app && touch /out/junk
FROM scratch
COPY --from=builder /out/app /app
";
    let result = fx.build(script).await.unwrap();
    assert_eq!(result.layer_count, 1);
    let paths = fx.top_diff(&result);
    assert!(paths.contains("app"), "{:?}", paths);
    assert!(!paths.contains("out/junk"), "{:?}", paths);
    assert_eq!(fx.mounts_left(), 0);

    let again = fx.build(script).await.unwrap();
    assert_eq!(again.image_id, result.image_id);
    assert_eq!(again.runs_executed, 0);
}

#[tokio::test]
async fn test_stage_base_continues_chain() {
    let fx = Fixture::new();
    let script = "\
FROM scratch AS base
RUN touch /one
FROM base
RUN touch /two
";
    let result = fx.build(script).await.unwrap();
    assert_eq!(result.layer_count, 2);

    let record = fx.services.images.get(&result.image_id).unwrap().unwrap();
    let chain = fx.services.layers.chain(&record.top_layer.unwrap()).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].parent.as_ref(), Some(&chain[0].id));

    let config = fx.services.images.config(&result.image_id).unwrap();
    let committed = config.history.iter().filter(|h| !h.empty_layer).count();
    assert_eq!(committed, chain.len());
}

#[tokio::test]
async fn test_target_stops_early() {
    let fx = Fixture::new();
    let mut request = fx.request(
        "FROM scratch AS first\nRUN touch /first\nFROM scratch AS second\nRUN touch /second\n",
    );
    request.target = Some("first".into());
    let result = build(&fx.services, request).await.unwrap();
    assert_eq!(fx.runtime.calls(), 1);
    assert!(fx.top_diff(&result).contains("first"));
}

#[tokio::test]
async fn test_onbuild_triggers_run_in_child() {
    let fx = Fixture::new();
    let mut request = fx.request("FROM scratch\nONBUILD RUN touch /triggered\n");
    request.output_name = Some("base:1".into());
    let base = build(&fx.services, request).await.unwrap();
    assert_eq!(base.layer_count, 0);
    assert_eq!(fx.runtime.calls(), 0);
    let config = fx.services.images.config(&base.image_id).unwrap();
    assert_eq!(config.config.on_build, Some(vec!["RUN touch /triggered".to_string()]));

    let child = fx.build("FROM base:1\nRUN touch /own\n").await.unwrap();
    assert_eq!(fx.runtime.calls(), 2);
    assert_eq!(child.layer_count, 2);
    let config = fx.services.images.config(&child.image_id).unwrap();
    assert!(config.config.on_build.is_none());
}

#[tokio::test]
async fn test_missing_base_with_pull_disabled() {
    let fx = Fixture::new();
    let mut request = fx.request("FROM missing:latest\n");
    request.pull_policy = kiln_engine::PullPolicy::Never;
    let err = build(&fx.services, request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BaseUnresolved);
}

#[tokio::test]
async fn test_output_is_tagged() {
    let fx = Fixture::new();
    let mut request = fx.request("FROM scratch\nLABEL app=demo\n");
    request.output_name = Some("demo:1".into());
    request.additional_tags = vec!["demo:latest".into()];
    let result = build(&fx.services, request).await.unwrap();

    assert_eq!(result.reference, "demo:1");
    let images = &fx.services.images;
    assert_eq!(images.resolve("demo:1").unwrap(), Some(result.image_id.clone()));
    assert_eq!(images.resolve("demo:latest").unwrap(), Some(result.image_id));
}

#[tokio::test]
async fn test_independent_stages_run_concurrently() {
    let script = "\
FROM scratch AS a
RUN sleep 0.3 && touch /a
FROM scratch AS b
RUN sleep 0.3 && touch /b
FROM scratch
COPY --from=a /a /a
COPY --from=b /b /b
";
    let fx = Fixture::new();
    fx.build(script).await.unwrap();
    assert_eq!(fx.runtime.peak(), 2);

    let fx = Fixture::with_config(|c| c.max_parallel_stages = 1);
    let result = fx.build(script).await.unwrap();
    assert_eq!(fx.runtime.peak(), 1);
    assert_eq!(result.layer_count, 2);
}

#[tokio::test]
async fn test_cancel_releases_mounts() {
    let fx = Fixture::new();
    let request = fx.request("FROM scratch\nRUN touch /before\nRUN sleep 30\n");
    let cancel = request.cancel.clone();
    let services = fx.services.clone();
    let handle = tokio::spawn(async move { build(&services, request).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let err = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("build stops after cancellation")
        .unwrap()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(fx.mounts_left(), 0);
    assert!(fx.services.images.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_first_failure_cancels_siblings() {
    let fx = Fixture::new();
    let script = "\
FROM scratch AS slow
RUN sleep 30
FROM scratch AS broken
RUN exit 3
FROM scratch
COPY --from=slow / /
COPY --from=broken / /
";
    let err = tokio::time::timeout(Duration::from_secs(10), fx.build(script))
        .await
        .expect("failure stops the slow stage")
        .unwrap_err();

    match err.root_cause() {
        BuildError::RunFailed { exit_status, .. } => assert_eq!(*exit_status, 3),
        other => panic!("expected RunFailed, got {:?}", other),
    }
    assert_eq!(err.stage_location(), Some((1, 1)));
    assert_eq!(fx.mounts_left(), 0);
}

#[tokio::test]
async fn test_prune_keeps_image_layers() {
    let fx = Fixture::new();
    let mut request = fx.request("FROM scratch\nRUN touch /kept\n");
    request.output_name = Some("kept:1".into());
    build(&fx.services, request).await.unwrap();
    let dropped = fx.build("FROM scratch\nRUN touch /dropped\n").await.unwrap();
    fx.services.images.remove(&dropped.image_id.to_string()).unwrap();

    let report = fx.services.prune(true).unwrap();
    assert_eq!(report.cache_entries, 2);
    assert_eq!(report.layers, 1);
    let image = fx.services.images.resolve("kept:1").unwrap().unwrap();
    let record = fx.services.images.get(&image).unwrap().unwrap();
    assert!(fx.services.layers.exists(&record.top_layer.unwrap()));
}
