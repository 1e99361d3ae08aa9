//! Execution of one stage.
//!
//! A stage mounts its base, then walks its instructions. Every instruction
//! except ARG is a step: its fingerprint is probed in the layer cache, and
//! on a miss the side effect runs, the working tree is committed and the
//! result recorded. Metadata-only steps commit no layer but still get a
//! history entry and a cache record, so that a later hit restores the
//! config they produced.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result, STDERR_TAIL_LIMIT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::copy::{self, CopyOptions, Destination, Download};
use super::coordinator::BuildShared;
use super::graph::BaseRef;
use super::progress::Progress;
use super::scope::ArgScope;
use crate::cache::{CacheEntry, CacheLookup};
use crate::digest::Digest;
use crate::fingerprint::Fingerprinter;
use crate::fsutil;
use crate::oci::config::{HealthConfig, HistoryEntry, ImageConfigFile};
use crate::sandbox::{user, ExecSpec, NetworkMode};
use crate::script::expand::process_word;
use crate::script::{
    parse_instruction, ArgDecl, Command, CopyArgs, Healthcheck, Instruction, KeyValue, RunNetwork,
    Step,
};
use crate::store::image::ImageStore;
use crate::store::layer::{CommitOutcome, LayerId, MountGuard};
use crate::volume::VolumeTracker;

const DEFAULT_SHELL: &[&str] = &["/bin/sh", "-c"];
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What a finished stage leaves for later stages and the final commit.
#[derive(Debug, Clone)]
pub(crate) struct StageOutput {
    pub top: Option<LayerId>,
    pub config: ImageConfigFile,
    /// Digest of the config blob
    pub state: Digest,
}

/// The stage's mounted working tree and its volumes.
struct Tree {
    mount: MountGuard,
    volumes: VolumeTracker,
}

impl Tree {
    fn new(mount: MountGuard, config: &ImageConfigFile) -> Result<Self> {
        let mut volumes = VolumeTracker::new(mount.root())?;
        for path in config.config.volumes.iter().flat_map(|v| v.keys()) {
            volumes.declare(path);
        }
        Ok(Self { mount, volumes })
    }
}

/// Inputs of a COPY or ADD gathered before the cache probe.
#[derive(Default)]
struct Prepared {
    inputs: Vec<(String, Digest)>,
    context: Vec<String>,
    tree: Option<TreeSources>,
    downloads: Vec<Download>,
}

impl Prepared {
    fn source_count(&self) -> usize {
        self.context.len()
            + self.downloads.len()
            + self.tree.as_ref().map(|t| t.entries.len()).unwrap_or(0)
    }
}

/// Sources taken from another stage or an image.
struct TreeSources {
    _mount: MountGuard,
    entries: Vec<(String, PathBuf)>,
}

pub(crate) struct StageExecutor {
    shared: Arc<BuildShared>,
    index: usize,
    cancel: CancellationToken,
    progress: Progress,
    escape: char,
    tree: Option<Tree>,
    top: Option<LayerId>,
    config: ImageConfigFile,
    state: Digest,
    scope: ArgScope,
    /// CMD set by this stage; ENTRYPOINT only clears an inherited one
    cmd_set: bool,
    copy_mounts: usize,
}

impl StageExecutor {
    pub fn new(shared: Arc<BuildShared>, index: usize, cancel: CancellationToken) -> Self {
        let stage = shared.graph.stage(index);
        let label = (shared.graph.order().len() > 1).then(|| stage.label());
        let progress = Progress::new(shared.options.log_sink.clone(), label);
        let escape = stage.escape;
        let scope = ArgScope::new(shared.graph.meta_args().to_vec());
        Self {
            shared,
            index,
            cancel,
            progress,
            escape,
            tree: None,
            top: None,
            config: ImageConfigFile::scratch(),
            state: Digest::of_bytes(b""),
            scope,
            cmd_set: false,
            copy_mounts: 0,
        }
    }

    /// Run every instruction and return the stage's final state.
    pub async fn run(mut self) -> Result<StageOutput> {
        let stage = self.shared.graph.stage(self.index).clone();
        let total = stage.steps.len();
        info!(stage = %stage.label(), steps = total, "Building stage");

        for (i, step) in stage.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(self.locate(i, step, BuildError::Cancelled));
            }
            self.progress.step(i + 1, total, &step.original);
            let result = if i == 0 {
                self.from(step).await
            } else {
                self.execute(step).await
            };
            if let Err(e) = result {
                return Err(self.locate(i, step, e));
            }
        }

        Ok(StageOutput {
            top: self.top,
            config: self.config,
            state: self.state,
        })
    }

    fn locate(&self, instruction: usize, step: &Step, source: BuildError) -> BuildError {
        let stage = self.shared.graph.stage(self.index);
        BuildError::Stage {
            stage: self.index,
            stage_name: stage.name.clone(),
            instruction,
            created_by: step.original.clone(),
            source: Box::new(source),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.options.timestamp.unwrap_or_else(Utc::now)
    }

    fn tree(&mut self) -> Result<&mut Tree> {
        self.tree
            .as_mut()
            .ok_or_else(|| BuildError::storage("stage has no mounted working tree"))
    }

    fn rootfs(&self) -> Result<PathBuf> {
        self.tree
            .as_ref()
            .map(|t| t.mount.root().to_path_buf())
            .ok_or_else(|| BuildError::storage("stage has no mounted working tree"))
    }

    /// Expand a word against the environment, then the stage's arguments.
    fn expand(&self, raw: &str) -> Result<String> {
        let env = &self.config.config;
        let scope = &self.scope;
        let mut lookup = |name: &str| {
            env.env_get(name)
                .map(str::to_string)
                .or_else(|| scope.get(name))
        };
        process_word(raw, self.escape, &mut lookup)
    }

    fn expand_meta(&self, raw: &str) -> Result<String> {
        let scope = &self.scope;
        let mut lookup = |name: &str| scope.meta_get(name);
        process_word(raw, self.escape, &mut lookup)
    }

    async fn from(&mut self, step: &Step) -> Result<()> {
        if let Instruction::From {
            platform: Some(platform),
            ..
        } = &step.instruction
        {
            warn!(platform = %platform, "--platform is ignored; building for the host platform");
        }

        let services = self.shared.services.clone();
        let (top, mut config, mut state) = match self.shared.graph.base(self.index).clone() {
            BaseRef::Scratch => {
                // Undated unless the build pins a timestamp, so the state
                // stays stable across builds.
                let mut config = ImageConfigFile::scratch();
                config.history.push(HistoryEntry {
                    created: self.shared.options.timestamp,
                    created_by: Some("FROM scratch".to_string()),
                    empty_layer: true,
                    ..Default::default()
                });
                let state = services.content.put_bytes(&config.to_vec()?)?;
                (None, config, state)
            }
            BaseRef::Stage(dep) => {
                let output = self.shared.outputs.lock().get(&dep).cloned().ok_or_else(|| {
                    BuildError::StageCycle(format!("stage {} has not been built", dep))
                })?;
                (output.top, output.config, output.state)
            }
            BaseRef::Image(reference) => {
                let id = self.pull(&reference).await.map_err(|e| match e {
                    BuildError::Cancelled => e,
                    other => BuildError::BaseUnresolved {
                        reference: reference.clone(),
                        message: other.to_string(),
                    },
                })?;
                let record = services
                    .images
                    .get(&id)?
                    .ok_or_else(|| BuildError::ImageNotFound(reference.clone()))?;
                (record.top_layer, services.images.config(&id)?, id)
            }
        };

        // Triggers run in this build only; they are not inherited further.
        let triggers = config.config.on_build.take().unwrap_or_default();
        if !triggers.is_empty() {
            state = services.content.put_bytes(&config.to_vec()?)?;
        }

        let label = format!("stage-{}", self.shared.graph.stage(self.index).label());
        let handle = services.layers.mount(top.as_ref(), &label)?;
        let mount = MountGuard::new(services.layers.clone(), handle);
        self.tree = Some(Tree::new(mount, &config)?);
        self.top = top;
        self.config = config;
        self.state = state;

        for text in triggers {
            let trigger = parse_instruction(&text, self.escape)?;
            if matches!(
                trigger.instruction,
                Instruction::From { .. } | Instruction::OnBuild(_) | Instruction::Maintainer(_)
            ) {
                return Err(BuildError::ScriptInvalid(format!(
                    "{} is not allowed as an ONBUILD trigger",
                    trigger.instruction.keyword()
                )));
            }
            self.progress.note(&format!("--> Running ONBUILD trigger: {}", trigger.original));
            self.execute(&trigger).await?;
        }
        Ok(())
    }

    async fn pull(&self, reference: &str) -> Result<crate::store::image::ImageId> {
        let images = self.shared.services.images.clone();
        let policy = self.shared.options.pull_policy;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
            result = images.pull(reference, policy) => result,
        }
    }

    async fn execute(&mut self, step: &Step) -> Result<()> {
        let instruction = &step.instruction;
        match instruction {
            Instruction::Arg(decls) => return self.declare_args(decls),
            Instruction::From { .. } => {
                return Err(BuildError::ScriptInvalid(
                    "FROM may only start a stage".to_string(),
                ))
            }
            Instruction::Unknown { keyword, .. }
                if !self.shared.services.config.permissive_instructions =>
            {
                return Err(BuildError::ScriptInvalid(format!(
                    "unknown instruction {}",
                    keyword
                )))
            }
            Instruction::Cmd(_) => self.cmd_set = true,
            _ => {}
        }

        let prepared = match instruction {
            Instruction::Copy(args) => self.prepare_copy(args, false).await?,
            Instruction::Add(args) => self.prepare_copy(args, true).await?,
            _ => Prepared::default(),
        };

        let mut fingerprinter = Fingerprinter::new(self.top.as_ref(), &self.state, instruction)
            .args(self.scope.declared(), &instruction.referenced_vars(self.escape));
        for (path, digest) in &prepared.inputs {
            fingerprinter.input(path.clone(), digest.clone());
        }
        let fingerprint = fingerprinter.finish();

        if self.try_cache(&fingerprint)? {
            self.shared.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let touches_tree = self.apply(step, prepared).await?;
        let comment = match instruction {
            Instruction::Unknown { keyword, .. } => {
                warn!(instruction = %keyword, "Skipping unknown instruction");
                Some(format!("unknown instruction {} skipped", keyword))
            }
            _ => None,
        };
        self.commit_step(step, fingerprint, touches_tree, comment)
    }

    fn declare_args(&mut self, decls: &[ArgDecl]) -> Result<()> {
        for decl in decls {
            let default = decl.default.as_deref().map(|d| self.expand(d)).transpose()?;
            self.scope
                .declare(&decl.name, default, &self.shared.options.build_args);
            self.shared.consumed_args.lock().insert(decl.name.clone());
        }
        Ok(())
    }

    /// Apply a cached result if one exists. A cache entry whose layer or
    /// config vanished is dropped and treated as a miss.
    fn try_cache(&mut self, fingerprint: &Digest) -> Result<bool> {
        let services = self.shared.services.clone();
        let cache = &self.shared.cache;
        let entry = match cache.lookup(fingerprint)? {
            CacheLookup::Hit(entry) => entry,
            CacheLookup::Miss => return Ok(false),
        };
        if !services.content.exists(&entry.state) {
            debug!(fingerprint = %fingerprint.short(), "Cached config is gone");
            cache.invalidate(fingerprint)?;
            return Ok(false);
        }

        if entry.layer != self.top {
            let Some(layer_id) = &entry.layer else {
                return Err(BuildError::CacheInconsistent(format!(
                    "fingerprint {} has no layer but the stage is at {}",
                    fingerprint.short(),
                    self.top.as_ref().map(|l| l.short()).unwrap_or_default()
                )));
            };
            let Some(layer) = services.layers.get(layer_id)? else {
                debug!(fingerprint = %fingerprint.short(), layer = %layer_id.short(), "Cached layer is gone");
                cache.invalidate(fingerprint)?;
                return Ok(false);
            };
            if layer.parent != self.top {
                return Err(BuildError::CacheInconsistent(format!(
                    "cached layer {} does not sit on the current top layer",
                    layer_id.short()
                )));
            }
            let tree = self.tree()?;
            services.layers.apply(tree.mount.handle(), layer_id)?;
        }

        let config = ImageConfigFile::from_slice(&services.content.read(&entry.state)?)?;
        let tree = self.tree()?;
        for path in config.config.volumes.iter().flat_map(|v| v.keys()) {
            tree.volumes.declare(path);
        }
        tree.volumes.invalidate_all();
        self.config = config;
        self.top = entry.layer;
        self.state = entry.state;
        self.progress.cache_hit(self.state.short());
        Ok(true)
    }

    /// Perform a step's side effect. Returns whether the working tree may
    /// have changed.
    async fn apply(&mut self, step: &Step, prepared: Prepared) -> Result<bool> {
        match &step.instruction {
            Instruction::Run { command, network } => {
                self.run_command(step, command, *network).await?;
                Ok(true)
            }
            Instruction::Copy(args) => {
                self.copy_files(args, false, prepared)?;
                Ok(true)
            }
            Instruction::Add(args) => {
                self.copy_files(args, true, prepared)?;
                Ok(true)
            }
            Instruction::Env(pairs) => {
                for (key, value) in self.expand_pairs(pairs)? {
                    self.config.config.env_set(&key, &value);
                }
                Ok(false)
            }
            Instruction::Label(pairs) => {
                for (key, value) in self.expand_pairs(pairs)? {
                    self.config.config.set_label(&key, &value);
                }
                Ok(false)
            }
            Instruction::Workdir(raw) => {
                let dir = self.expand(raw)?;
                let current = self.config.config.working_dir.as_deref().unwrap_or("/");
                let dir = if dir.starts_with('/') {
                    fsutil::clean_path(&dir)
                } else {
                    fsutil::clean_path(&format!("{}/{}", current, dir))
                };
                let host = fsutil::resolve_in_root(&self.rootfs()?, &dir)?;
                std::fs::create_dir_all(&host)?;
                self.tree()?.volumes.invalidate(&dir);
                self.config.config.working_dir = Some(dir);
                Ok(true)
            }
            Instruction::User(raw) => {
                self.config.config.user = Some(self.expand(raw)?);
                Ok(false)
            }
            Instruction::Cmd(command) => {
                self.config.config.cmd = Some(self.command_vec(command));
                Ok(false)
            }
            Instruction::Entrypoint(command) => {
                self.config.config.entrypoint = Some(self.command_vec(command));
                if !self.cmd_set {
                    self.config.config.cmd = None;
                }
                Ok(false)
            }
            Instruction::Expose(words) => {
                for word in words {
                    let port = self.expand(word)?;
                    if port.contains('/') {
                        self.config.config.add_exposed_port(&port.to_ascii_lowercase());
                    } else {
                        self.config.config.add_exposed_port(&format!("{}/tcp", port));
                    }
                }
                Ok(false)
            }
            Instruction::Volume(words) => {
                let rootfs = self.rootfs()?;
                for word in words {
                    let path = self.expand(word)?;
                    if path.is_empty() {
                        return Err(BuildError::ScriptInvalid("VOLUME path is empty".to_string()));
                    }
                    let path = fsutil::clean_path(&path);
                    std::fs::create_dir_all(fsutil::resolve_in_root(&rootfs, &path)?)?;
                    self.config.config.add_volume(&path);
                    let volumes = &mut self.tree()?.volumes;
                    volumes.invalidate(&path);
                    volumes.declare(&path);
                }
                Ok(true)
            }
            Instruction::StopSignal(raw) => {
                self.config.config.stop_signal = Some(self.expand(raw)?);
                Ok(false)
            }
            Instruction::Healthcheck(check) => {
                self.config.config.healthcheck = Some(health_config(check));
                Ok(false)
            }
            Instruction::Shell(args) => {
                self.config.config.shell = Some(args.clone());
                Ok(false)
            }
            Instruction::OnBuild(inner) => {
                self.config
                    .config
                    .on_build
                    .get_or_insert_with(Vec::new)
                    .push(inner.original.clone());
                Ok(false)
            }
            Instruction::Maintainer(raw) => {
                self.config.author = Some(raw.trim().to_string());
                Ok(false)
            }
            Instruction::Unknown { .. } => Ok(false),
            Instruction::From { .. } | Instruction::Arg(_) => Ok(false),
        }
    }

    /// All pairs are expanded against the state before the instruction.
    fn expand_pairs(&self, pairs: &[KeyValue]) -> Result<Vec<(String, String)>> {
        pairs
            .iter()
            .map(|kv| Ok((self.expand(&kv.key)?, self.expand(&kv.value)?)))
            .collect()
    }

    fn shell(&self) -> Vec<String> {
        self.config
            .config
            .shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.iter().map(|s| s.to_string()).collect())
    }

    fn command_vec(&self, command: &Command) -> Vec<String> {
        match command {
            Command::Exec(args) => args.clone(),
            Command::Shell(text) => {
                let mut argv = self.shell();
                argv.push(text.clone());
                argv
            }
        }
    }

    /// Commit the working tree (when the step may have changed it), append
    /// history and record the cache entry.
    fn commit_step(
        &mut self,
        step: &Step,
        fingerprint: Digest,
        touches_tree: bool,
        comment: Option<String>,
    ) -> Result<()> {
        let services = self.shared.services.clone();
        let created = self.now();

        let new_top = if touches_tree {
            let parent = self.top.clone();
            let tree = self.tree()?;
            match services.layers.commit(parent.as_ref(), tree.mount.handle())? {
                CommitOutcome::Empty => None,
                CommitOutcome::Layer { layer, .. } => Some(layer.id),
            }
        } else {
            None
        };
        let empty_layer = new_top.is_none();
        let top = new_top.or_else(|| self.top.clone());

        self.config.created = Some(created);
        self.config.history.push(HistoryEntry {
            created: Some(created),
            author: self.config.author.clone(),
            created_by: Some(step.original.clone()),
            comment,
            empty_layer,
        });
        let state = services.content.put_bytes(&self.config.to_vec()?)?;

        let entry = CacheEntry {
            fingerprint,
            layer: top.clone(),
            empty_layer,
            state,
            created_at: Utc::now(),
        };
        let winner = self.shared.cache.record_or_adopt(&entry)?;
        self.top = top;
        self.state = entry.state.clone();

        if self.shared.cache.is_enabled() && winner != entry {
            self.adopt(winner)?;
        }
        self.progress.committed(self.state.short());
        Ok(())
    }

    /// Another stage recorded the same fingerprint first: continue from its
    /// result so both produce the same image. Our own layer is left for
    /// `cache prune`.
    fn adopt(&mut self, winner: CacheEntry) -> Result<()> {
        let services = self.shared.services.clone();
        debug!(fingerprint = %winner.fingerprint.short(), "Adopting concurrent cache entry");
        let config = ImageConfigFile::from_slice(&services.content.read(&winner.state)?)?;
        if winner.layer != self.top {
            let label = format!("stage-{}", self.shared.graph.stage(self.index).label());
            let handle = services.layers.mount(winner.layer.as_ref(), &label)?;
            let mount = MountGuard::new(services.layers.clone(), handle);
            self.tree = Some(Tree::new(mount, &config)?);
        }
        self.config = config;
        self.top = winner.layer;
        self.state = winner.state;
        Ok(())
    }

    async fn run_command(
        &mut self,
        step: &Step,
        command: &Command,
        network: Option<RunNetwork>,
    ) -> Result<()> {
        let rootfs = self.rootfs()?;
        let engine = &self.shared.services.config;
        let mut spec = ExecSpec::new(self.command_vec(command));
        spec.user = user::resolve(&rootfs, self.config.config.user.as_deref().unwrap_or(""))?;
        spec.env = self.run_env(spec.user.home.as_deref());
        spec.working_dir = self
            .config
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| "/".to_string());
        spec.mounts = self.shared.options.transient_mounts.clone();
        spec.network = match network {
            Some(RunNetwork::None) => NetworkMode::Disabled,
            Some(RunNetwork::Host) => NetworkMode::Enabled,
            _ => self.shared.options.network,
        };
        spec.timeout = engine.run_timeout_secs.map(Duration::from_secs);
        spec.kill_grace = Duration::from_secs(engine.kill_grace_secs);

        let services = self.shared.services.clone();
        let cancel = self.cancel.clone();
        self.tree()?.volumes.snapshot_all()?;
        let result = services.sandbox.run(&rootfs, &spec, &cancel).await;
        let restored = self.tree()?.volumes.restore_all();
        let result = result?;
        let restored = restored?;
        if !restored.is_empty() {
            let tree = self.tree()?;
            services.layers.refresh_baseline(tree.mount.handle(), &restored)?;
        }

        self.shared.runs_executed.fetch_add(1, Ordering::Relaxed);
        self.progress.output(&result.stdout);
        self.progress.output(&result.stderr);
        if result.exit_status != 0 {
            let start = result.stderr.len().saturating_sub(STDERR_TAIL_LIMIT);
            return Err(BuildError::RunFailed {
                exit_status: result.exit_status,
                instruction: step.original.clone(),
                stderr_tail: String::from_utf8_lossy(&result.stderr[start..]).into_owned(),
            });
        }
        Ok(())
    }

    /// Environment of a RUN: the config env, then build arguments it does
    /// not shadow, then a default PATH and HOME.
    fn run_env(&self, home: Option<&str>) -> Vec<String> {
        let mut pairs = self.config.config.env_pairs();
        for (name, value) in self.scope.env() {
            if !pairs.iter().any(|(k, _)| *k == name) {
                pairs.push((name, value));
            }
        }
        if !pairs.iter().any(|(k, _)| k == "PATH") {
            pairs.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
        }
        if let Some(home) = home {
            if !pairs.iter().any(|(k, _)| k == "HOME") {
                pairs.push(("HOME".to_string(), home.to_string()));
            }
        }
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Resolve COPY/ADD sources and compute their digests.
    async fn prepare_copy(&mut self, args: &CopyArgs, add: bool) -> Result<Prepared> {
        let mut sources = Vec::with_capacity(args.sources.len());
        for raw in &args.sources {
            sources.push(self.expand(raw)?);
        }
        let mut prepared = Prepared::default();

        if let Some(from) = &args.from {
            let from = self.expand_meta(from)?;
            let services = self.shared.services.clone();
            let (top, marker) = match self.shared.graph.find(&from) {
                Some(dep) => {
                    let output = self.shared.outputs.lock().get(&dep).cloned().ok_or_else(|| {
                        BuildError::StageCycle(format!("stage '{}' has not been built", from))
                    })?;
                    let marker = output
                        .top
                        .as_ref()
                        .map(|l| l.digest().clone())
                        .unwrap_or(output.state);
                    (output.top, marker)
                }
                None => {
                    let id = self.pull(&from).await.map_err(|e| match e {
                        BuildError::Cancelled => e,
                        other => BuildError::BaseUnresolved {
                            reference: from.clone(),
                            message: other.to_string(),
                        },
                    })?;
                    let record = services
                        .images
                        .get(&id)?
                        .ok_or_else(|| BuildError::ImageNotFound(from.clone()))?;
                    (record.top_layer, id)
                }
            };
            self.copy_mounts += 1;
            let label = format!(
                "copy-{}-{}",
                self.shared.graph.stage(self.index).label(),
                self.copy_mounts
            );
            let handle = services.layers.mount(top.as_ref(), &label)?;
            let mount = MountGuard::new(services.layers.clone(), handle);
            let entries = copy::tree_sources(mount.root(), &sources)?;
            prepared.inputs.push((format!("from:{}", from), marker));
            prepared.tree = Some(TreeSources {
                _mount: mount,
                entries,
            });
            return Ok(prepared);
        }

        let mut local = Vec::new();
        for source in sources {
            if copy::is_url(&source) {
                if !add {
                    return Err(BuildError::ScriptInvalid(format!(
                        "COPY does not accept URLs ({}); use ADD",
                        source
                    )));
                }
                let download = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
                    result = copy::download(&source) => result?,
                };
                prepared.inputs.push((source, download.digest.clone()));
                prepared.downloads.push(download);
            } else {
                local.push(source);
            }
        }
        if !local.is_empty() {
            let context = &self.shared.context;
            prepared.context = copy::context_sources(context, &local)?;
            for rel in &prepared.context {
                prepared.inputs.push((rel.clone(), context.digest(rel)?));
            }
        }
        Ok(prepared)
    }

    fn copy_files(&mut self, args: &CopyArgs, add: bool, prepared: Prepared) -> Result<()> {
        let rootfs = self.rootfs()?;
        let chown = args.chown.as_deref().map(|c| self.expand(c)).transpose()?;
        let options = CopyOptions::resolve(&rootfs, chown.as_deref(), args.chmod.as_deref())?;
        let workdir = self
            .config
            .config
            .working_dir
            .clone()
            .unwrap_or_else(|| "/".to_string());
        let dest = Destination::new(&workdir, &self.expand(&args.dest)?, prepared.source_count());

        let context = self.shared.context.clone();
        for rel in &prepared.context {
            if add && copy::extract_archive(&context.host_path(rel)?, &rootfs, &dest)? {
                continue;
            }
            copy::copy_context_source(&context, rel, &rootfs, &dest, options)?;
        }
        if let Some(tree) = &prepared.tree {
            for (name, host) in &tree.entries {
                copy::copy_tree_source(name, host, &rootfs, &dest, options)?;
            }
        }
        let fallback = self.now();
        for download in &prepared.downloads {
            download.install(&rootfs, &dest, options, fallback)?;
        }
        self.tree()?.volumes.invalidate(&dest.path);
        Ok(())
    }
}

fn health_config(check: &Healthcheck) -> HealthConfig {
    let nanos = |d: &Option<Duration>| d.map(|d| d.as_nanos() as i64);
    match check {
        Healthcheck::Disable => HealthConfig {
            test: vec!["NONE".to_string()],
            ..Default::default()
        },
        Healthcheck::Check {
            test,
            interval,
            timeout,
            start_period,
            retries,
        } => {
            let test = match test {
                Command::Exec(args) => {
                    let mut t = vec!["CMD".to_string()];
                    t.extend(args.iter().cloned());
                    t
                }
                Command::Shell(text) => vec!["CMD-SHELL".to_string(), text.clone()],
            };
            HealthConfig {
                test,
                interval: nanos(interval),
                timeout: nanos(timeout),
                start_period: nanos(start_period),
                retries: *retries,
            }
        }
    }
}
