//! Parsed build-script instructions.
//!
//! Operand words are stored raw, with their quotes, and are expanded by the
//! executor against the variables in scope at that point of the stage.

use std::time::Duration;

use super::expand;

/// Command operand of RUN, CMD and ENTRYPOINT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Passed to the stage's shell as a single string
    Shell(String),
    /// Executed directly
    Exec(Vec<String>),
}

impl Command {
    fn canonical(&self) -> String {
        match self {
            Command::Shell(s) => expand::collapse_whitespace(s),
            Command::Exec(args) => json_array(args),
        }
    }

    fn texts(&self) -> Vec<&str> {
        match self {
            Command::Shell(s) => vec![s.as_str()],
            Command::Exec(args) => args.iter().map(String::as_str).collect(),
        }
    }
}

/// `key=value` pair of ENV or LABEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One variable of an ARG instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    pub name: String,
    pub default: Option<String>,
}

/// Operands of COPY and ADD.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyArgs {
    pub sources: Vec<String>,
    pub dest: String,
    /// `--from=<stage|image>`
    pub from: Option<String>,
    pub chown: Option<String>,
    pub chmod: Option<String>,
    /// `--link`, accepted for compatibility
    pub link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Healthcheck {
    /// `HEALTHCHECK NONE`
    Disable,
    Check {
        test: Command,
        interval: Option<Duration>,
        timeout: Option<Duration>,
        start_period: Option<Duration>,
        retries: Option<u32>,
    },
}

/// Network mode requested by `RUN --network=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNetwork {
    Default,
    None,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    From {
        image: String,
        alias: Option<String>,
        platform: Option<String>,
    },
    Run {
        command: Command,
        network: Option<RunNetwork>,
    },
    Copy(CopyArgs),
    Add(CopyArgs),
    Env(Vec<KeyValue>),
    Arg(Vec<ArgDecl>),
    Workdir(String),
    User(String),
    Cmd(Command),
    Entrypoint(Command),
    Expose(Vec<String>),
    Volume(Vec<String>),
    Label(Vec<KeyValue>),
    StopSignal(String),
    Healthcheck(Healthcheck),
    Shell(Vec<String>),
    /// Trigger stored in the image config, run by child builds
    OnBuild(Box<Step>),
    Maintainer(String),
    /// Unrecognized keyword; the executor decides whether to skip it
    Unknown {
        keyword: String,
        args: String,
    },
}

/// An instruction with its source position and verbatim text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub instruction: Instruction,
    /// Logical line as written, continuations joined
    pub original: String,
    /// 1-based line where the instruction starts
    pub line: usize,
}

impl Instruction {
    pub fn keyword(&self) -> &str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy(_) => "COPY",
            Instruction::Add(_) => "ADD",
            Instruction::Env(_) => "ENV",
            Instruction::Arg(_) => "ARG",
            Instruction::Workdir(_) => "WORKDIR",
            Instruction::User(_) => "USER",
            Instruction::Cmd(_) => "CMD",
            Instruction::Entrypoint(_) => "ENTRYPOINT",
            Instruction::Expose(_) => "EXPOSE",
            Instruction::Volume(_) => "VOLUME",
            Instruction::Label(_) => "LABEL",
            Instruction::StopSignal(_) => "STOPSIGNAL",
            Instruction::Healthcheck(_) => "HEALTHCHECK",
            Instruction::Shell(_) => "SHELL",
            Instruction::OnBuild(_) => "ONBUILD",
            Instruction::Maintainer(_) => "MAINTAINER",
            Instruction::Unknown { keyword, .. } => keyword,
        }
    }

    /// Normalized text used for fingerprints: whitespace outside quotes is
    /// collapsed, flags appear in a fixed order and exec forms are rendered
    /// as compact JSON.
    pub fn canonical_form(&self) -> String {
        let body = match self {
            Instruction::From {
                image,
                alias,
                platform,
            } => {
                let mut parts = Vec::new();
                if let Some(p) = platform {
                    parts.push(format!("--platform={}", p));
                }
                parts.push(image.clone());
                if let Some(a) = alias {
                    parts.push(format!("AS {}", a));
                }
                parts.join(" ")
            }
            Instruction::Run { command, network } => match network {
                Some(n) => format!("--network={} {}", network_name(*n), command.canonical()),
                None => command.canonical(),
            },
            Instruction::Copy(args) | Instruction::Add(args) => {
                let mut parts = Vec::new();
                if let Some(f) = &args.from {
                    parts.push(format!("--from={}", f));
                }
                if let Some(c) = &args.chown {
                    parts.push(format!("--chown={}", c));
                }
                if let Some(c) = &args.chmod {
                    parts.push(format!("--chmod={}", c));
                }
                if args.link {
                    parts.push("--link".to_string());
                }
                parts.extend(args.sources.iter().cloned());
                parts.push(args.dest.clone());
                parts.join(" ")
            }
            Instruction::Env(pairs) | Instruction::Label(pairs) => pairs
                .iter()
                .map(|kv| format!("{}={}", kv.key, kv.value))
                .collect::<Vec<_>>()
                .join(" "),
            Instruction::Arg(decls) => decls
                .iter()
                .map(|d| match &d.default {
                    Some(v) => format!("{}={}", d.name, v),
                    None => d.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(" "),
            Instruction::Workdir(s)
            | Instruction::User(s)
            | Instruction::StopSignal(s)
            | Instruction::Maintainer(s) => expand::collapse_whitespace(s),
            Instruction::Cmd(c) | Instruction::Entrypoint(c) => c.canonical(),
            Instruction::Expose(words) | Instruction::Volume(words) => words.join(" "),
            Instruction::Shell(args) => json_array(args),
            Instruction::Healthcheck(Healthcheck::Disable) => "NONE".to_string(),
            Instruction::Healthcheck(Healthcheck::Check {
                test,
                interval,
                timeout,
                start_period,
                retries,
            }) => {
                let mut parts = Vec::new();
                if let Some(d) = interval {
                    parts.push(format!("--interval={:?}", d));
                }
                if let Some(d) = timeout {
                    parts.push(format!("--timeout={:?}", d));
                }
                if let Some(d) = start_period {
                    parts.push(format!("--start-period={:?}", d));
                }
                if let Some(r) = retries {
                    parts.push(format!("--retries={}", r));
                }
                parts.push(format!("CMD {}", test.canonical()));
                parts.join(" ")
            }
            Instruction::OnBuild(step) => step.instruction.canonical_form(),
            Instruction::Unknown { args, .. } => expand::collapse_whitespace(args),
        };
        if body.is_empty() {
            self.keyword().to_string()
        } else {
            format!("{} {}", self.keyword(), body)
        }
    }

    /// Variables this instruction reads, in order of first reference.
    /// Shell and exec commands count: build arguments reach them through
    /// the process environment.
    pub fn referenced_vars(&self, escape: char) -> Vec<String> {
        let mut texts: Vec<&str> = Vec::new();
        match self {
            Instruction::From { image, platform, .. } => {
                texts.push(image);
                texts.extend(platform.as_deref());
            }
            Instruction::Run { command, .. } => texts.extend(command.texts()),
            Instruction::Copy(args) | Instruction::Add(args) => {
                texts.extend(args.sources.iter().map(String::as_str));
                texts.push(&args.dest);
                texts.extend(args.from.as_deref());
                texts.extend(args.chown.as_deref());
                texts.extend(args.chmod.as_deref());
            }
            Instruction::Env(pairs) | Instruction::Label(pairs) => {
                for kv in pairs {
                    texts.push(&kv.key);
                    texts.push(&kv.value);
                }
            }
            Instruction::Arg(decls) => {
                texts.extend(decls.iter().filter_map(|d| d.default.as_deref()));
            }
            Instruction::Workdir(s) | Instruction::User(s) | Instruction::StopSignal(s) => {
                texts.push(s)
            }
            Instruction::Expose(words) | Instruction::Volume(words) => {
                texts.extend(words.iter().map(String::as_str))
            }
            Instruction::Cmd(_)
            | Instruction::Entrypoint(_)
            | Instruction::Shell(_)
            | Instruction::Healthcheck(_)
            | Instruction::OnBuild(_)
            | Instruction::Maintainer(_)
            | Instruction::Unknown { .. } => {}
        }
        let mut names: Vec<String> = Vec::new();
        for text in texts {
            for name in expand::referenced_vars(text, escape) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

fn network_name(n: RunNetwork) -> &'static str {
    match n {
        RunNetwork::Default => "default",
        RunNetwork::None => "none",
        RunNetwork::Host => "host",
    }
}

fn json_array(args: &[String]) -> String {
    serde_json::to_string(args).unwrap_or_default()
}
