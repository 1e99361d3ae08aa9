//! Build scripts: parsing into stages of instructions.

pub mod expand;
pub mod instruction;
mod parser;

use std::path::Path;

use kiln_core::error::{BuildError, Result};

pub use instruction::{
    ArgDecl, Command, CopyArgs, Healthcheck, Instruction, KeyValue, RunNetwork, Step,
};

/// Base named by a stage's FROM, before argument expansion.
pub const SCRATCH: &str = "scratch";

/// One `FROM`-delimited section of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Position among all stages of the build
    pub index: usize,
    /// Lowercased `AS` alias
    pub name: Option<String>,
    /// Raw base expression of the FROM
    pub base: String,
    /// Instructions, FROM first
    pub steps: Vec<Step>,
    /// Escape character of the script the stage came from
    pub escape: char,
}

impl Stage {
    /// Stage name if any, else its index.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.index.to_string())
    }
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// ARGs declared before the first FROM, usable in FROM lines
    pub meta_args: Vec<ArgDecl>,
    pub stages: Vec<Stage>,
    pub escape: char,
}

impl Script {
    pub fn parse(content: &str) -> Result<Self> {
        let lines = parser::logical_lines(content)?;
        let escape = lines.escape;
        let mut meta_args = Vec::new();
        let mut stages: Vec<Stage> = Vec::new();

        for (line_num, text) in lines.lines {
            let step = parser::parse_step(&text, line_num, escape)?;
            if let Instruction::From { image, alias, .. } = &step.instruction {
                if let Some(alias) = alias {
                    if stages.iter().any(|s| s.name.as_deref() == Some(alias.as_str())) {
                        return Err(BuildError::ScriptInvalid(format!(
                            "line {}: duplicate stage name '{}'",
                            line_num, alias
                        )));
                    }
                }
                let stage = Stage {
                    index: stages.len(),
                    name: alias.clone(),
                    base: image.clone(),
                    steps: Vec::new(),
                    escape,
                };
                stages.push(stage);
            } else if stages.is_empty() {
                match &step.instruction {
                    Instruction::Arg(decls) => {
                        meta_args.extend(decls.iter().cloned());
                        continue;
                    }
                    other => {
                        return Err(BuildError::ScriptInvalid(format!(
                            "line {}: {} before the first FROM",
                            line_num,
                            other.keyword()
                        )))
                    }
                }
            }
            if let Some(stage) = stages.last_mut() {
                stage.steps.push(step);
            }
        }

        if stages.is_empty() {
            return Err(BuildError::ScriptInvalid(
                "script contains no FROM instruction".to_string(),
            ));
        }
        Ok(Self {
            meta_args,
            stages,
            escape,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ContextError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }
}

/// Parse one instruction outside of a script, such as an ONBUILD trigger
/// read back from an image config.
pub fn parse_instruction(text: &str, escape: char) -> Result<Step> {
    parser::parse_step(text.trim(), 0, escape)
}
