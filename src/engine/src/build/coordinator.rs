//! Build coordination: stage scheduling and the final image commit.
//!
//! Stages whose dependencies are built run concurrently, bounded by
//! `max_parallel_stages`. The first stage failure cancels the others; the
//! coordinator waits for them to release their mounts before reporting it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::graph::BuildGraph;
use super::progress::LogSink;
use super::request::{BuildRequest, BuildResult, ContextSource};
use super::services::Services;
use super::stage::{StageExecutor, StageOutput};
use crate::cache::LayerCache;
use crate::context::ContextView;
use crate::sandbox::{NetworkMode, TransientMount};
use crate::store::image::{ImageStore, PullPolicy};

/// Request options the stages read.
#[derive(Debug)]
pub(crate) struct BuildOptions {
    pub build_args: BTreeMap<String, String>,
    pub pull_policy: PullPolicy,
    pub timestamp: Option<DateTime<Utc>>,
    pub transient_mounts: Vec<TransientMount>,
    pub network: NetworkMode,
    pub log_sink: Option<LogSink>,
}

/// State shared by the stages of one build.
pub(crate) struct BuildShared {
    pub services: Arc<Services>,
    pub context: Arc<ContextView>,
    pub graph: BuildGraph,
    pub outputs: Mutex<HashMap<usize, StageOutput>>,
    pub options: BuildOptions,
    /// Build argument names some ARG declared
    pub consumed_args: Mutex<BTreeSet<String>>,
    pub cache: LayerCache,
    pub runs_executed: AtomicUsize,
    pub cache_hits: AtomicUsize,
}

/// Runs build requests against a set of [`Services`].
pub struct BuildCoordinator {
    services: Arc<Services>,
}

impl BuildCoordinator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Build and commit the image `request` describes. Errors carry the
    /// output name, and the stage and instruction where they happened.
    pub async fn build(&self, request: BuildRequest) -> Result<BuildResult> {
        let image = request
            .output_name
            .clone()
            .unwrap_or_else(|| "<untagged>".to_string());
        self.build_inner(request)
            .await
            .map_err(|e| BuildError::Image {
                image,
                source: Box::new(e),
            })
    }

    async fn build_inner(&self, request: BuildRequest) -> Result<BuildResult> {
        let names = request.names();
        let BuildRequest {
            scripts,
            context,
            build_args,
            target,
            output_name,
            pull_policy,
            cache_enabled,
            compression,
            manifest_format,
            transient_mounts,
            network,
            log_sink,
            cancel,
            timestamp,
            ..
        } = request;

        let graph = BuildGraph::new(&scripts, &build_args, target.as_deref())?;
        let context = match context {
            ContextSource::Dir(path) => ContextView::open_dir(&path)?,
            ContextSource::Tar(reader) => ContextView::from_tar(reader)?,
        };
        debug!(root = %context.root().display(), ignore_file = ?context.ignore_file(), "Opened build context");

        let cache = if cache_enabled {
            self.services.cache.clone()
        } else {
            self.services.cache.disabled()
        };
        let consumed: BTreeSet<String> = graph.meta_args().iter().map(|a| a.name.clone()).collect();
        let target = graph.target();
        info!(
            stages = graph.order().len(),
            target = %graph.stage(target).label(),
            "Starting build"
        );

        let shared = Arc::new(BuildShared {
            services: self.services.clone(),
            context: Arc::new(context),
            graph,
            outputs: Mutex::new(HashMap::new()),
            options: BuildOptions {
                build_args,
                pull_policy,
                timestamp,
                transient_mounts,
                network,
                log_sink: log_sink.clone(),
            },
            consumed_args: Mutex::new(consumed),
            cache,
            runs_executed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        });

        self.run_stages(&shared, &cancel).await?;

        let output = shared
            .outputs
            .lock()
            .remove(&target)
            .ok_or_else(|| BuildError::storage("target stage produced no output"))?;

        let unused: Vec<String> = {
            let consumed = shared.consumed_args.lock();
            shared
                .options
                .build_args
                .keys()
                .filter(|k| !consumed.contains(*k))
                .cloned()
                .collect()
        };
        if !unused.is_empty() {
            warn!(args = ?unused, "Build arguments were not consumed");
            if let Some(sink) = &log_sink {
                sink.line(&format!(
                    "[Warning] one or more build args were not consumed: [{}]",
                    unused.join(" ")
                ));
            }
        }

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let images = &self.services.images;
        let committed = images.commit(output.top.as_ref(), &output.config, manifest_format, compression)?;
        if !names.is_empty() {
            images.tag(&committed.id, &names)?;
        }
        let size = images.get(&committed.id)?.map(|r| r.size).unwrap_or_default();

        if let Some(sink) = &log_sink {
            sink.line(&format!("COMMIT {}", output_name.as_deref().unwrap_or_default()));
            sink.line(&format!("--> {}", committed.id.short()));
            for name in &names {
                sink.line(&format!("Successfully tagged {}", name));
            }
            sink.line(committed.id.hex());
        }

        let runs_executed = shared.runs_executed.load(Ordering::Relaxed);
        let cache_hits = shared.cache_hits.load(Ordering::Relaxed);
        info!(
            image = %committed.id.short(),
            layers = committed.manifest.layers.len(),
            runs = runs_executed,
            cache_hits,
            "Build complete"
        );
        Ok(BuildResult {
            reference: output_name.unwrap_or_else(|| committed.id.to_string()),
            image_id: committed.id,
            manifest_digest: committed.manifest_digest,
            tags: names,
            layer_count: committed.manifest.layers.len(),
            size,
            runs_executed,
            cache_hits,
        })
    }

    /// Run the stages in dependency order.
    async fn run_stages(&self, shared: &Arc<BuildShared>, cancel: &CancellationToken) -> Result<()> {
        let cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.services.config.max_parallel_stages.max(1)));
        let mut pending: Vec<usize> = shared.graph.order().to_vec();
        let mut done: HashSet<usize> = HashSet::new();
        let mut running: JoinSet<(usize, Result<StageOutput>)> = JoinSet::new();

        loop {
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|i| shared.graph.dependencies(*i).iter().all(|d| done.contains(d)))
                .collect();
            pending.retain(|i| !ready.contains(i));
            for index in ready {
                let shared = shared.clone();
                let semaphore = semaphore.clone();
                let token = cancel.clone();
                running.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => return (index, Err(BuildError::Cancelled)),
                        permit = semaphore.acquire_owned() => permit,
                    };
                    let _permit = match permit {
                        Ok(permit) => permit,
                        Err(_) => return (index, Err(BuildError::Cancelled)),
                    };
                    let result = StageExecutor::new(shared, index, token).run().await;
                    (index, result)
                });
            }

            let failure = match running.join_next().await {
                None => break,
                Some(Ok((index, Ok(output)))) => {
                    debug!(stage = index, "Stage finished");
                    shared.outputs.lock().insert(index, output);
                    done.insert(index);
                    continue;
                }
                Some(Ok((_, Err(e)))) => e,
                Some(Err(e)) => BuildError::Io(io::Error::other(format!("stage task failed: {}", e))),
            };

            cancel.cancel();
            while running.join_next().await.is_some() {}
            return Err(failure);
        }

        if !pending.is_empty() {
            return Err(BuildError::StageCycle(format!(
                "stages {:?} never became ready",
                pending
            )));
        }
        Ok(())
    }
}
