//! Build-script parser.
//!
//! Handles parser directives (`# escape=`), line continuations, comments,
//! case-insensitive keywords and the operand grammar of every instruction.

use std::time::Duration;

use kiln_core::error::{BuildError, Result};

use super::expand::split_words;
use super::instruction::{
    ArgDecl, Command, CopyArgs, Healthcheck, Instruction, KeyValue, RunNetwork, Step,
};

const DEFAULT_ESCAPE: char = '\\';

/// Logical lines of a script.
pub(crate) struct Lines {
    pub escape: char,
    /// `(first line number, text)`
    pub lines: Vec<(usize, String)>,
}

/// Read directives and join continuations.
pub(crate) fn logical_lines(content: &str) -> Result<Lines> {
    let mut escape = DEFAULT_ESCAPE;
    let mut in_directives = true;
    let mut lines = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let line_num = idx + 1;
        let trimmed = raw.trim();

        if in_directives {
            if let Some(value) = directive(trimmed, "escape") {
                escape = match value {
                    "\\" => '\\',
                    "`" => '`',
                    other => {
                        return Err(BuildError::ScriptInvalid(format!(
                            "line {}: invalid escape character '{}'",
                            line_num, other
                        )))
                    }
                };
                continue;
            }
            if directive(trimmed, "syntax").is_some() {
                continue;
            }
            in_directives = false;
        }

        // Comments and blank lines inside a continuation do not end it.
        if trimmed.starts_with('#') || (trimmed.is_empty() && current.is_some()) {
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        let body = raw.trim_end();
        let (text, continues) = match body.strip_suffix(escape) {
            Some(stripped) => (stripped, true),
            None => (body, false),
        };

        let entry = current.get_or_insert_with(|| (line_num, String::new()));
        entry.1.push_str(if entry.1.is_empty() { text.trim_start() } else { text });
        if !continues {
            if let Some((start, text)) = current.take() {
                lines.push((start, text.trim().to_string()));
            }
        }
    }
    if let Some((start, text)) = current.take() {
        lines.push((start, text.trim().to_string()));
    }
    Ok(Lines { escape, lines })
}

/// `# key=value` directive value.
fn directive<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix('#')?.trim_start();
    let (k, v) = rest.split_once('=')?;
    if k.trim().eq_ignore_ascii_case(key) {
        Some(v.trim())
    } else {
        None
    }
}

/// Parse one logical line.
pub(crate) fn parse_step(line: &str, line_num: usize, escape: char) -> Result<Step> {
    let (keyword, rest) = split_first_word(line);
    let upper = keyword.to_ascii_uppercase();
    let instruction = match upper.as_str() {
        "FROM" => parse_from(rest, line_num)?,
        "RUN" => parse_run(rest, line_num)?,
        "COPY" => Instruction::Copy(parse_copy(rest, line_num, escape, "COPY")?),
        "ADD" => Instruction::Add(parse_copy(rest, line_num, escape, "ADD")?),
        "ENV" => Instruction::Env(parse_pairs(rest, line_num, escape, "ENV")?),
        "LABEL" => Instruction::Label(parse_pairs(rest, line_num, escape, "LABEL")?),
        "ARG" => Instruction::Arg(parse_arg(rest, line_num, escape)?),
        "WORKDIR" => Instruction::Workdir(required(rest, line_num, "WORKDIR")?.to_string()),
        "USER" => Instruction::User(required(rest, line_num, "USER")?.to_string()),
        "STOPSIGNAL" => {
            Instruction::StopSignal(required(rest, line_num, "STOPSIGNAL")?.to_string())
        }
        "MAINTAINER" => {
            Instruction::Maintainer(required(rest, line_num, "MAINTAINER")?.to_string())
        }
        "CMD" => Instruction::Cmd(parse_command(rest, line_num, "CMD")?),
        "ENTRYPOINT" => Instruction::Entrypoint(parse_command(rest, line_num, "ENTRYPOINT")?),
        "EXPOSE" => Instruction::Expose(parse_list(rest, line_num, escape, "EXPOSE")?),
        "VOLUME" => Instruction::Volume(parse_list(rest, line_num, escape, "VOLUME")?),
        "SHELL" => Instruction::Shell(parse_shell(rest, line_num)?),
        "HEALTHCHECK" => Instruction::Healthcheck(parse_healthcheck(rest, line_num)?),
        "ONBUILD" => parse_onbuild(rest, line_num, escape)?,
        _ => Instruction::Unknown {
            keyword: upper.clone(),
            args: rest.to_string(),
        },
    };
    Ok(Step {
        instruction,
        original: line.to_string(),
        line: line_num,
    })
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn invalid(line_num: usize, message: impl std::fmt::Display) -> BuildError {
    BuildError::ScriptInvalid(format!("line {}: {}", line_num, message))
}

fn required<'a>(rest: &'a str, line_num: usize, keyword: &str) -> Result<&'a str> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(invalid(line_num, format!("{} requires an argument", keyword)));
    }
    Ok(rest)
}

/// Leading `--name[=value]` flags. Returns flags and the remaining text.
fn take_flags(rest: &str) -> (Vec<(String, Option<String>)>, &str) {
    let mut flags = Vec::new();
    let mut remaining = rest.trim_start();
    while remaining.starts_with("--") {
        let (word, after) = split_first_word(remaining);
        let flag = &word[2..];
        match flag.split_once('=') {
            Some((name, value)) => flags.push((name.to_ascii_lowercase(), Some(value.to_string()))),
            None => flags.push((flag.to_ascii_lowercase(), None)),
        }
        remaining = after;
    }
    (flags, remaining)
}

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let (flags, rest) = take_flags(rest);
    let mut platform = None;
    for (name, value) in flags {
        match (name.as_str(), value) {
            ("platform", Some(v)) => platform = Some(v),
            (other, _) => return Err(invalid(line_num, format!("unknown FROM flag --{}", other))),
        }
    }
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
            platform,
        }),
        [image, kw, alias] if kw.eq_ignore_ascii_case("AS") => {
            let alias = alias.to_ascii_lowercase();
            if alias.parse::<usize>().is_ok() {
                return Err(invalid(line_num, "stage name cannot be a number"));
            }
            Ok(Instruction::From {
                image: image.to_string(),
                alias: Some(alias),
                platform,
            })
        }
        [] => Err(invalid(line_num, "FROM requires an image")),
        _ => Err(invalid(line_num, "expected FROM <image> [AS <name>]")),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    let (flags, rest) = take_flags(rest);
    let mut network = None;
    for (name, value) in flags {
        match (name.as_str(), value.as_deref()) {
            ("network", Some("default")) => network = Some(RunNetwork::Default),
            ("network", Some("none")) => network = Some(RunNetwork::None),
            ("network", Some("host")) => network = Some(RunNetwork::Host),
            (other, _) => {
                return Err(invalid(line_num, format!("unsupported RUN flag --{}", other)))
            }
        }
    }
    Ok(Instruction::Run {
        command: parse_command(rest, line_num, "RUN")?,
        network,
    })
}

/// Exec form when the operand is a JSON string array, shell form otherwise.
fn parse_command(rest: &str, line_num: usize, keyword: &str) -> Result<Command> {
    let rest = required(rest, line_num, keyword)?;
    if rest.starts_with('[') {
        if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
            if args.is_empty() {
                return Err(invalid(line_num, format!("{} exec form is empty", keyword)));
            }
            return Ok(Command::Exec(args));
        }
    }
    Ok(Command::Shell(rest.to_string()))
}

fn parse_shell(rest: &str, line_num: usize) -> Result<Vec<String>> {
    let rest = required(rest, line_num, "SHELL")?;
    match serde_json::from_str::<Vec<String>>(rest) {
        Ok(args) if !args.is_empty() => Ok(args),
        _ => Err(invalid(line_num, "SHELL requires a non-empty JSON array")),
    }
}

/// JSON array form of a word list, re-encoded as double-quoted words.
fn json_words(rest: &str) -> Option<Vec<String>> {
    if !rest.starts_with('[') {
        return None;
    }
    let items: Vec<String> = serde_json::from_str(rest).ok()?;
    Some(
        items
            .iter()
            .map(|s| serde_json::to_string(s).unwrap_or_default())
            .collect(),
    )
}

fn parse_list(rest: &str, line_num: usize, escape: char, keyword: &str) -> Result<Vec<String>> {
    let rest = required(rest, line_num, keyword)?;
    let words = match json_words(rest) {
        Some(words) => words,
        None => split_words(rest, escape).map_err(|e| invalid(line_num, e))?,
    };
    if words.is_empty() {
        return Err(invalid(line_num, format!("{} requires an argument", keyword)));
    }
    Ok(words)
}

fn parse_copy(rest: &str, line_num: usize, escape: char, keyword: &str) -> Result<CopyArgs> {
    let (flags, rest) = take_flags(rest);
    let mut args = CopyArgs::default();
    for (name, value) in flags {
        match (name.as_str(), value) {
            ("from", Some(v)) => args.from = Some(v),
            ("chown", Some(v)) => args.chown = Some(v),
            ("chmod", Some(v)) => {
                if u32::from_str_radix(&v, 8).is_err() && !v.contains('$') {
                    return Err(invalid(line_num, format!("invalid --chmod value '{}'", v)));
                }
                args.chmod = Some(v)
            }
            ("link", None) => args.link = true,
            (other, _) => {
                return Err(invalid(line_num, format!("unknown {} flag --{}", keyword, other)))
            }
        }
    }
    let mut words = match json_words(rest.trim()) {
        Some(words) => words,
        None => split_words(rest, escape).map_err(|e| invalid(line_num, e))?,
    };
    if words.len() < 2 {
        return Err(invalid(
            line_num,
            format!("{} requires at least one source and a destination", keyword),
        ));
    }
    args.dest = words.pop().unwrap_or_default();
    args.sources = words;
    Ok(args)
}

/// `KEY=VALUE ...` or the legacy single-pair `KEY VALUE` form.
fn parse_pairs(rest: &str, line_num: usize, escape: char, keyword: &str) -> Result<Vec<KeyValue>> {
    let rest = required(rest, line_num, keyword)?;
    let words = split_words(rest, escape).map_err(|e| invalid(line_num, e))?;
    let first_has_eq = words.first().map(|w| w.contains('=')).unwrap_or(false);

    if !first_has_eq {
        let (key, value) = split_first_word(rest);
        if value.is_empty() && keyword == "ENV" {
            return Err(invalid(line_num, "ENV requires a value"));
        }
        // The legacy form takes the rest of the line as one value.
        return Ok(vec![KeyValue {
            key: key.to_string(),
            value: escape_legacy_value(value),
        }]);
    }

    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(invalid(
                line_num,
                format!("{} expects KEY=VALUE pairs, got '{}'", keyword, word),
            )),
        })
        .collect()
}

/// Legacy values keep inner whitespace; quote them so that later word
/// processing yields the text unchanged apart from quote removal.
fn escape_legacy_value(value: &str) -> String {
    if value.contains(char::is_whitespace) && !value.starts_with('"') && !value.starts_with('\'') {
        serde_json::to_string(value).unwrap_or_default()
    } else {
        value.to_string()
    }
}

fn parse_arg(rest: &str, line_num: usize, escape: char) -> Result<Vec<ArgDecl>> {
    let rest = required(rest, line_num, "ARG")?;
    let words = split_words(rest, escape).map_err(|e| invalid(line_num, e))?;
    words
        .into_iter()
        .map(|word| {
            let (name, default) = match word.split_once('=') {
                Some((n, d)) => (n.to_string(), Some(d.to_string())),
                None => (word, None),
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid(line_num, format!("invalid ARG name '{}'", name)));
            }
            Ok(ArgDecl { name, default })
        })
        .collect()
}

fn parse_healthcheck(rest: &str, line_num: usize) -> Result<Healthcheck> {
    let rest = required(rest, line_num, "HEALTHCHECK")?;
    if rest.eq_ignore_ascii_case("NONE") {
        return Ok(Healthcheck::Disable);
    }
    let (flags, rest) = take_flags(rest);
    let (keyword, command) = split_first_word(rest);
    if !keyword.eq_ignore_ascii_case("CMD") {
        return Err(invalid(line_num, "HEALTHCHECK expects NONE or CMD <command>"));
    }
    let test = parse_command(command, line_num, "HEALTHCHECK CMD")?;

    let mut interval = None;
    let mut timeout = None;
    let mut start_period = None;
    let mut retries = None;
    for (name, value) in flags {
        let value = value.ok_or_else(|| invalid(line_num, format!("--{} requires a value", name)))?;
        match name.as_str() {
            "interval" => interval = Some(parse_duration(&value, line_num)?),
            "timeout" => timeout = Some(parse_duration(&value, line_num)?),
            "start-period" => start_period = Some(parse_duration(&value, line_num)?),
            "retries" => {
                retries = Some(value.parse::<u32>().map_err(|_| {
                    invalid(line_num, format!("invalid --retries value '{}'", value))
                })?)
            }
            other => return Err(invalid(line_num, format!("unknown HEALTHCHECK flag --{}", other))),
        }
    }
    Ok(Healthcheck::Check {
        test,
        interval,
        timeout,
        start_period,
        retries,
    })
}

/// Go-style durations: `1h30m`, `10s`, `500ms`, `1.5s`.
pub(crate) fn parse_duration(s: &str, line_num: usize) -> Result<Duration> {
    let bad = || invalid(line_num, format!("invalid duration '{}'", s));
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let mut nanos = 0f64;
    let mut rest = s;
    if rest.is_empty() {
        return Err(bad());
    }
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(bad)?;
        let number: f64 = rest[..num_len].parse().map_err(|_| bad())?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(bad()),
        };
        nanos += number * scale;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

fn parse_onbuild(rest: &str, line_num: usize, escape: char) -> Result<Instruction> {
    let rest = required(rest, line_num, "ONBUILD")?;
    let inner = parse_step(rest, line_num, escape)?;
    match inner.instruction {
        Instruction::From { .. } | Instruction::OnBuild(_) | Instruction::Maintainer(_) => Err(
            invalid(line_num, format!("{} is not allowed as an ONBUILD trigger", inner.instruction.keyword())),
        ),
        _ => Ok(Instruction::OnBuild(Box::new(inner))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(line: &str) -> Instruction {
        parse_step(line, 1, '\\').unwrap().instruction
    }

    #[test]
    fn test_logical_lines_continuations_and_comments() {
        let text = "FROM alpine\nRUN a \\\n  # note\n  b \\\n\n  c\n# trailing\n";
        let lines = logical_lines(text).unwrap();
        assert_eq!(lines.lines.len(), 2);
        assert_eq!(lines.lines[1], (2, "RUN a   b   c".to_string()));
    }

    #[test]
    fn test_escape_directive() {
        let text = "# escape=`\nFROM scratch\nRUN dir `\n  /w\n";
        let lines = logical_lines(text).unwrap();
        assert_eq!(lines.escape, '`');
        assert_eq!(lines.lines[1].1, "RUN dir   /w");
        assert!(logical_lines("# escape=x\nFROM scratch").is_err());
    }

    #[test]
    fn test_directive_after_instruction_is_comment() {
        let lines = logical_lines("FROM scratch\n# escape=`\n").unwrap();
        assert_eq!(lines.escape, '\\');
    }

    #[test]
    fn test_from_alias_and_platform() {
        assert_eq!(
            step("from --platform=linux/amd64 golang:1.22 AS Build"),
            Instruction::From {
                image: "golang:1.22".into(),
                alias: Some("build".into()),
                platform: Some("linux/amd64".into()),
            }
        );
        assert!(parse_step("FROM a AS 1", 1, '\\').is_err());
        assert!(parse_step("FROM", 1, '\\').is_err());
    }

    #[test]
    fn test_run_forms() {
        assert_eq!(
            step(r#"RUN ["/bin/echo", "hi"]"#),
            Instruction::Run {
                command: Command::Exec(vec!["/bin/echo".into(), "hi".into()]),
                network: None,
            }
        );
        assert_eq!(
            step("RUN --network=none make"),
            Instruction::Run {
                command: Command::Shell("make".into()),
                network: Some(RunNetwork::None),
            }
        );
        // Not valid JSON: falls back to the shell form.
        assert_eq!(
            step("RUN [ -f x ] && y"),
            Instruction::Run {
                command: Command::Shell("[ -f x ] && y".into()),
                network: None,
            }
        );
        assert!(parse_step("RUN --mount=type=cache make", 1, '\\').is_err());
    }

    #[test]
    fn test_copy_flags_and_sources() {
        match step("COPY --from=build --chown=1:1 --chmod=0644 --link a \"b c\" /dst/") {
            Instruction::Copy(args) => {
                assert_eq!(args.from.as_deref(), Some("build"));
                assert_eq!(args.chown.as_deref(), Some("1:1"));
                assert_eq!(args.chmod.as_deref(), Some("0644"));
                assert!(args.link);
                assert_eq!(args.sources, vec!["a", "\"b c\""]);
                assert_eq!(args.dest, "/dst/");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_step("COPY only", 1, '\\').is_err());
        assert!(parse_step("COPY --chmod=rwx a b", 1, '\\').is_err());
    }

    #[test]
    fn test_add_json_form() {
        match step(r#"ADD ["a b", "/dst"]"#) {
            Instruction::Add(args) => {
                assert_eq!(args.sources, vec!["\"a b\""]);
                assert_eq!(args.dest, "\"/dst\"");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_env_forms() {
        assert_eq!(
            step(r#"ENV A=1 B="two words""#),
            Instruction::Env(vec![
                KeyValue { key: "A".into(), value: "1".into() },
                KeyValue { key: "B".into(), value: "\"two words\"".into() },
            ])
        );
        assert_eq!(
            step("ENV GREETING hello there"),
            Instruction::Env(vec![KeyValue {
                key: "GREETING".into(),
                value: "\"hello there\"".into(),
            }])
        );
        assert!(parse_step("ENV A=1 junk", 1, '\\').is_err());
        assert!(parse_step("ENV ONLYKEY", 1, '\\').is_err());
    }

    #[test]
    fn test_arg_forms() {
        assert_eq!(
            step("ARG VERSION=1.0 DEBUG"),
            Instruction::Arg(vec![
                ArgDecl { name: "VERSION".into(), default: Some("1.0".into()) },
                ArgDecl { name: "DEBUG".into(), default: None },
            ])
        );
        assert!(parse_step("ARG bad-name", 1, '\\').is_err());
    }

    #[test]
    fn test_lists() {
        assert_eq!(step("EXPOSE 80 443/tcp"), Instruction::Expose(vec!["80".into(), "443/tcp".into()]));
        assert_eq!(step(r#"VOLUME ["/data"]"#), Instruction::Volume(vec!["\"/data\"".into()]));
        assert_eq!(step("VOLUME /a /b"), Instruction::Volume(vec!["/a".into(), "/b".into()]));
    }

    #[test]
    fn test_shell_requires_json() {
        assert_eq!(
            step(r#"SHELL ["/bin/bash", "-c"]"#),
            Instruction::Shell(vec!["/bin/bash".into(), "-c".into()])
        );
        assert!(parse_step("SHELL /bin/bash -c", 1, '\\').is_err());
    }

    #[test]
    fn test_healthcheck() {
        assert_eq!(step("HEALTHCHECK NONE"), Instruction::Healthcheck(Healthcheck::Disable));
        assert_eq!(
            step("HEALTHCHECK --interval=1m30s --retries=3 CMD curl -f http://localhost/"),
            Instruction::Healthcheck(Healthcheck::Check {
                test: Command::Shell("curl -f http://localhost/".into()),
                interval: Some(Duration::from_secs(90)),
                timeout: None,
                start_period: None,
                retries: Some(3),
            })
        );
        assert!(parse_step("HEALTHCHECK --interval=soon CMD x", 1, '\\').is_err());
        assert!(parse_step("HEALTHCHECK curl", 1, '\\').is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms", 1).unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s", 1).unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2h", 1).unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10", 1).is_err());
        assert!(parse_duration("", 1).is_err());
    }

    #[test]
    fn test_onbuild() {
        match step("ONBUILD RUN make") {
            Instruction::OnBuild(inner) => {
                assert_eq!(inner.original, "RUN make");
                assert!(matches!(inner.instruction, Instruction::Run { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_step("ONBUILD FROM x", 1, '\\').is_err());
        assert!(parse_step("ONBUILD ONBUILD RUN x", 1, '\\').is_err());
    }

    #[test]
    fn test_unknown_keyword() {
        assert_eq!(
            step("FROBNICATE  a b"),
            Instruction::Unknown {
                keyword: "FROBNICATE".into(),
                args: "a b".into(),
            }
        );
    }

    #[test]
    fn test_original_text_kept() {
        let s = parse_step("copy  a   /b", 7, '\\').unwrap();
        assert_eq!(s.original, "copy  a   /b");
        assert_eq!(s.line, 7);
    }
}
