//! Stage graph: merging scripts, resolving stage references, ordering.

use std::collections::{BTreeMap, BTreeSet};

use kiln_core::error::{BuildError, Result};

use super::scope::resolve_meta_args;
use crate::fingerprint::ArgValue;
use crate::script::expand::process_word;
use crate::script::{Instruction, Script, Stage, SCRATCH};

/// What a stage's FROM names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    Scratch,
    /// Another stage of this build
    Stage(usize),
    /// An image reference, arguments expanded
    Image(String),
}

/// Stages of a build, their dependencies and the execution order for one
/// target.
#[derive(Debug)]
pub struct BuildGraph {
    stages: Vec<Stage>,
    meta_args: Vec<ArgValue>,
    bases: Vec<BaseRef>,
    deps: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
    target: usize,
}

impl BuildGraph {
    /// Merge `scripts`, resolve references and order the stages `target`
    /// needs. Stages of later scripts are numbered after those of earlier
    /// ones; global ARGs are resolved per script and a name keeps its first
    /// value.
    pub fn new(
        scripts: &[Script],
        build_args: &BTreeMap<String, String>,
        target: Option<&str>,
    ) -> Result<Self> {
        let Some(primary) = scripts.first() else {
            return Err(BuildError::Usage("no build script given".to_string()));
        };

        let mut stages: Vec<Stage> = Vec::new();
        let mut meta_args: Vec<ArgValue> = Vec::new();
        for script in scripts {
            for arg in resolve_meta_args(&script.meta_args, build_args, script.escape)? {
                if !meta_args.iter().any(|a| a.name == arg.name) {
                    meta_args.push(arg);
                }
            }
            for stage in &script.stages {
                if let Some(name) = &stage.name {
                    if stages.iter().any(|s| s.name.as_ref() == Some(name)) {
                        return Err(BuildError::ScriptInvalid(format!(
                            "duplicate stage name '{}'",
                            name
                        )));
                    }
                }
                let mut stage = stage.clone();
                stage.index = stages.len();
                stages.push(stage);
            }
        }

        let target = match target {
            Some(t) => find_stage(&stages, t, None).ok_or_else(|| {
                BuildError::Usage(format!("target stage '{}' not found", t))
            })?,
            None => primary.stages.len() - 1,
        };

        let mut bases = Vec::with_capacity(stages.len());
        let mut deps = Vec::with_capacity(stages.len());
        for stage in &stages {
            let base = resolve_base(&stages, stage, &meta_args)?;
            let mut stage_deps = BTreeSet::new();
            if let BaseRef::Stage(dep) = base {
                stage_deps.insert(dep);
            }
            for dep in copy_from_deps(&stages, stage, &meta_args)? {
                stage_deps.insert(dep);
            }
            bases.push(base);
            deps.push(stage_deps);
        }

        let order = order_for(&stages, &deps, target)?;
        Ok(Self {
            stages,
            meta_args,
            bases,
            deps,
            order,
            target,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> &Stage {
        &self.stages[index]
    }

    pub fn meta_args(&self) -> &[ArgValue] {
        &self.meta_args
    }

    pub fn base(&self, index: usize) -> &BaseRef {
        &self.bases[index]
    }

    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.deps[index]
    }

    /// Stages to run, dependencies first.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Stage named by a `--from` value, if it names one.
    pub fn find(&self, name: &str) -> Option<usize> {
        find_stage(&self.stages, name, None)
    }
}

/// Stage by alias (case-insensitive) or index, skipping `exclude`.
fn find_stage(stages: &[Stage], name: &str, exclude: Option<usize>) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    if let Some(stage) = stages
        .iter()
        .find(|s| s.name.as_deref() == Some(lower.as_str()) && Some(s.index) != exclude)
    {
        return Some(stage.index);
    }
    match name.parse::<usize>() {
        Ok(i) if i < stages.len() && Some(i) != exclude => Some(i),
        _ => None,
    }
}

fn meta_lookup(meta: &[ArgValue]) -> impl FnMut(&str) -> Option<String> + '_ {
    move |name: &str| {
        meta.iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.clone())
    }
}

/// A stage name used as a base refers to another stage; a stage whose base
/// carries its own alias (`FROM node AS node`) names an image.
fn resolve_base(stages: &[Stage], stage: &Stage, meta: &[ArgValue]) -> Result<BaseRef> {
    let mut lookup = meta_lookup(meta);
    let base = process_word(&stage.base, stage.escape, &mut lookup)?;
    if base.is_empty() {
        return Err(BuildError::ScriptInvalid(format!(
            "stage {}: base '{}' expands to an empty name",
            stage.label(),
            stage.base
        )));
    }
    let lower = base.to_ascii_lowercase();
    if let Some(other) = stages
        .iter()
        .find(|s| s.index != stage.index && s.name.as_deref() == Some(lower.as_str()))
    {
        return Ok(BaseRef::Stage(other.index));
    }
    if lower == SCRATCH {
        return Ok(BaseRef::Scratch);
    }
    Ok(BaseRef::Image(base))
}

/// Stages read by `COPY --from` / `ADD --from`. Values that do not name a
/// stage are images and add no dependency.
fn copy_from_deps(stages: &[Stage], stage: &Stage, meta: &[ArgValue]) -> Result<Vec<usize>> {
    let mut deps = Vec::new();
    for step in &stage.steps {
        let from = match &step.instruction {
            Instruction::Copy(args) | Instruction::Add(args) => args.from.as_deref(),
            _ => None,
        };
        let Some(from) = from else { continue };
        let mut lookup = meta_lookup(meta);
        let name = process_word(from, stage.escape, &mut lookup)?;
        if stage.name.as_deref() == Some(name.to_ascii_lowercase().as_str())
            || name.parse::<usize>().ok() == Some(stage.index)
        {
            return Err(BuildError::StageCycle(format!(
                "stage {} copies from itself",
                stage.label()
            )));
        }
        if let Some(dep) = find_stage(stages, &name, Some(stage.index)) {
            deps.push(dep);
        }
    }
    Ok(deps)
}

/// Topological order of the stages reachable from `target`, lowest index
/// first among ready stages.
fn order_for(stages: &[Stage], deps: &[BTreeSet<usize>], target: usize) -> Result<Vec<usize>> {
    let mut needed = BTreeSet::new();
    let mut stack = vec![target];
    while let Some(i) = stack.pop() {
        if needed.insert(i) {
            stack.extend(deps[i].iter().copied());
        }
    }

    let mut order = Vec::with_capacity(needed.len());
    let mut done = BTreeSet::new();
    while done.len() < needed.len() {
        let ready = needed
            .iter()
            .copied()
            .find(|i| !done.contains(i) && deps[*i].iter().all(|d| done.contains(d)));
        match ready {
            Some(i) => {
                done.insert(i);
                order.push(i);
            }
            None => {
                let remaining: BTreeSet<usize> = needed.difference(&done).copied().collect();
                return Err(BuildError::StageCycle(describe_cycle(stages, deps, &remaining)));
            }
        }
    }
    Ok(order)
}

/// `a -> b -> a` for one cycle among `remaining`.
fn describe_cycle(stages: &[Stage], deps: &[BTreeSet<usize>], remaining: &BTreeSet<usize>) -> String {
    let Some(&start) = remaining.iter().next() else {
        return String::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = deps[current].iter().find(|d| remaining.contains(d)) else {
            break;
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|i| stages[*i].label()).collect();
            cycle.push(stages[next].label());
            return cycle.join(" -> ");
        }
        path.push(next);
        current = next;
    }
    path.iter()
        .map(|i| stages[*i].label())
        .collect::<Vec<_>>()
        .join(" -> ")
}
