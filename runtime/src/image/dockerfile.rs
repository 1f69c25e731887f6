//! Dockerfile parser and renderer.
//!
//! Parses a Dockerfile into a sequence of build instructions and renders
//! instructions back to Dockerfile text. Supports line continuations
//! (`\`), comments, and both shell and JSON (exec) forms for
//! RUN/CMD/ENTRYPOINT.

use relaybox_core::error::{RelayError, Result};

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `RUN <command>`
    Run { command: String },
    /// `COPY [--from=<stage>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        from: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { vars: Vec<(String, String)> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: String },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl Instruction {
    /// Instruction keyword in upper case.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Label { .. } => "LABEL",
            Instruction::Arg { .. } => "ARG",
        }
    }

    /// True for instructions that add a filesystem layer.
    pub fn creates_layer(&self) -> bool {
        matches!(self, Instruction::Run { .. } | Instruction::Copy { .. })
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::From { image, alias } => match alias {
                Some(alias) => write!(f, "FROM {} AS {}", image, alias),
                None => write!(f, "FROM {}", image),
            },
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Copy { src, dst, from } => {
                write!(f, "COPY ")?;
                if let Some(stage) = from {
                    write!(f, "--from={} ", stage)?;
                }
                write!(f, "{} {}", src.join(" "), dst)
            }
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Env { vars } => {
                let rendered: Vec<String> = vars
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, quote_if_needed(v)))
                    .collect();
                write!(f, "ENV {}", rendered.join(" "))
            }
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {}", json_array(exec)),
            Instruction::Cmd { exec } => write!(f, "CMD {}", json_array(exec)),
            Instruction::Expose { port } => write!(f, "EXPOSE {}", port),
            Instruction::Label { key, value } => {
                write!(f, "LABEL {}={}", key, quote_if_needed(value))
            }
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, "ARG {}={}", name, default),
                None => write!(f, "ARG {}", name),
            },
        }
    }
}

/// Parsed Dockerfile: a list of instructions in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    pub instructions: Vec<Instruction>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            instructions.push(parse_instruction(trimmed, line_num)?);
        }

        if instructions.is_empty() {
            return Err(RelayError::BuildError(
                "Dockerfile is empty or contains no instructions".to_string(),
            ));
        }

        // First non-ARG instruction must be FROM
        let first_non_arg = instructions
            .iter()
            .find(|i| !matches!(i, Instruction::Arg { .. }));
        if !matches!(first_non_arg, Some(Instruction::From { .. })) {
            return Err(RelayError::BuildError(
                "First instruction must be FROM (or ARG before FROM)".to_string(),
            ));
        }

        Ok(Dockerfile { instructions })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::BuildError(format!(
                "Failed to read Dockerfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Render the instructions back to Dockerfile text, one per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}

/// Join lines ending with `\` into logical lines, keeping the 1-based
/// number of the line each one starts on.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start_line = idx + 1;
        }
        // Comment lines inside a continuation are dropped
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                logical_lines.push((start_line, std::mem::take(&mut current)));
            }
        }
    }

    if !current.is_empty() {
        logical_lines.push((start_line, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "ENTRYPOINT" => parse_exec("ENTRYPOINT", rest, line_num)
            .map(|exec| Instruction::Entrypoint { exec }),
        "CMD" => parse_exec("CMD", rest, line_num).map(|exec| Instruction::Cmd { exec }),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        "ADD" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER"
        | "USER" => Err(RelayError::BuildError(format!(
            "Line {}: Unsupported instruction '{}'",
            line_num, keyword_upper
        ))),
        _ => Err(RelayError::BuildError(format!(
            "Line {}: Unknown instruction '{}'",
            line_num, keyword
        ))),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn missing_argument(keyword: &str, what: &str, line_num: usize) -> RelayError {
    RelayError::BuildError(format!("Line {}: {} requires {}", line_num, keyword, what))
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [] => Err(missing_argument("FROM", "an image argument", line_num)),
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(alias.to_string()),
        }),
        _ => Err(RelayError::BuildError(format!(
            "Line {}: FROM expects '<image> [AS <alias>]', got '{}'",
            line_num, rest
        ))),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("RUN", "a command", line_num));
    }

    let command = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?.join(" ")
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("COPY", "source and destination", line_num));
    }

    let mut from = None;
    let mut parts: Vec<&str> = Vec::new();
    for word in rest.split_whitespace() {
        if parts.is_empty() && word.starts_with("--") {
            match word.strip_prefix("--from=") {
                Some(stage) if !stage.is_empty() => from = Some(stage.to_string()),
                _ => {
                    return Err(RelayError::BuildError(format!(
                        "Line {}: Unsupported COPY flag '{}'",
                        line_num, word
                    )))
                }
            }
        } else {
            parts.push(word);
        }
    }

    match parts.split_last() {
        Some((dst, src)) if !src.is_empty() => Ok(Instruction::Copy {
            src: src.iter().map(|s| s.to_string()).collect(),
            dst: dst.to_string(),
            from,
        }),
        _ => Err(missing_argument(
            "COPY",
            "at least one source and a destination",
            line_num,
        )),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("WORKDIR", "a path", line_num));
    }
    Ok(Instruction::Workdir {
        path: rest.to_string(),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("ENV", "a key and value", line_num));
    }

    let (first, after_first) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: ENV KEY VALUE (value is the rest of the line)
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), unquote(after_first))],
        });
    }

    let mut vars = Vec::new();
    for word in split_respecting_quotes(rest) {
        let (key, value) = word.split_once('=').ok_or_else(|| {
            RelayError::BuildError(format!(
                "Line {}: ENV expects KEY=VALUE pairs, got '{}'",
                line_num, word
            ))
        })?;
        if key.is_empty() {
            return Err(RelayError::BuildError(format!(
                "Line {}: ENV key must not be empty",
                line_num
            )));
        }
        vars.push((key.to_string(), unquote(value)));
    }

    Ok(Instruction::Env { vars })
}

fn parse_exec(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(missing_argument(keyword, "an argument", line_num));
    }

    if rest.starts_with('[') {
        let exec = parse_json_array(rest, line_num)?;
        if exec.is_empty() {
            return Err(missing_argument(keyword, "a non-empty command", line_num));
        }
        Ok(exec)
    } else {
        // Shell form: wrap in sh -c
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    match rest.split_whitespace().next() {
        Some(port) => Ok(Instruction::Expose {
            port: port.to_string(),
        }),
        None => Err(missing_argument("EXPOSE", "a port", line_num)),
    }
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("LABEL", "key=value", line_num));
    }

    if let Some((key, value)) = rest.split_once('=') {
        Ok(Instruction::Label {
            key: unquote(key),
            value: unquote(value),
        })
    } else {
        let (key, value) = split_first_word(rest);
        Ok(Instruction::Label {
            key: key.to_string(),
            value: unquote(value),
        })
    }
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing_argument("ARG", "a name", line_num));
    }

    match rest.split_once('=') {
        Some((name, default)) => Ok(Instruction::Arg {
            name: name.trim().to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(Instruction::Arg {
            name: rest.trim().to_string(),
            default: None,
        }),
    }
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        RelayError::BuildError(format!(
            "Line {}: Invalid JSON array '{}': {}",
            line_num, s, e
        ))
    })
}

/// Render a list as a JSON array (exec form).
fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Whitespace split that keeps double- or single-quoted runs together.
fn split_respecting_quotes(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
