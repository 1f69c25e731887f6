//! Dependency manifest (pip requirements format).
//!
//! The manifest is consumed once by the install step. It is parsed before
//! the build starts so that a malformed line fails the build up front
//! instead of half-way through the install.

use std::path::Path;

use relaybox_core::error::{RelayError, Result};

/// Version comparison operators accepted in a requirement.
const OPERATORS: [&str; 8] = ["===", "==", "!=", "<=", ">=", "~=", "<", ">"];

/// One `<op><version>` clause of a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    pub op: String,
    pub version: String,
}

impl std::fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.version)
    }
}

/// A named package with optional extras, version constraints and marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub specs: Vec<VersionSpec>,
    /// Direct reference (`name @ url`)
    pub url: Option<String>,
    /// Environment marker after `;`
    pub marker: Option<String>,
}

impl Requirement {
    /// True when the requirement resolves to exactly one version.
    pub fn is_exact(&self) -> bool {
        self.url.is_some()
            || (self.specs.len() == 1 && matches!(self.specs[0].op.as_str(), "==" | "==="))
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(ref url) = self.url {
            write!(f, " @ {}", url)?;
        }
        let specs: Vec<String> = self.specs.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", specs.join(","))?;
        if let Some(ref marker) = self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

/// A single meaningful manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Requirement(Requirement),
    /// Installer option line (`-r other.txt`, `--index-url ...`), kept verbatim
    Option(String),
}

/// Ordered list of dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyManifest {
    pub entries: Vec<ManifestEntry>,
}

impl DependencyManifest {
    /// Parse requirements text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (line_num, line) in logical_lines(content) {
            let line = strip_comment(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('-') {
                entries.push(ManifestEntry::Option(line.to_string()));
                continue;
            }
            entries.push(ManifestEntry::Requirement(parse_requirement(line, line_num)?));
        }

        Ok(Self { entries })
    }

    /// Parse a manifest file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::BuildError(format!(
                "Failed to read dependency manifest {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Requirements in declaration order.
    pub fn requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter().filter_map(|e| match e {
            ManifestEntry::Requirement(r) => Some(r),
            ManifestEntry::Option(_) => None,
        })
    }

    /// Requirements that do not resolve to a single version.
    pub fn unpinned(&self) -> Vec<&Requirement> {
        self.requirements().filter(|r| !r.is_exact()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Join `\` continuations, keeping the starting line number.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 1;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(line);
                lines.push((start, std::mem::take(&mut current)));
            }
        }
    }
    if !current.is_empty() {
        lines.push((start, current));
    }
    lines
}

/// Drop a `#` comment that starts the line or follows whitespace.
fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn invalid(line_num: usize, message: String) -> RelayError {
    RelayError::ManifestError {
        line: line_num,
        message,
    }
}

fn parse_requirement(line: &str, line_num: usize) -> Result<Requirement> {
    let (body, marker) = match line.split_once(';') {
        Some((body, marker)) => {
            let marker = marker.trim();
            if marker.is_empty() {
                return Err(invalid(line_num, format!("empty environment marker in '{}'", line)));
            }
            (body.trim(), Some(marker.to_string()))
        }
        None => (line, None),
    };

    // Name runs until extras, an operator, '@' or whitespace
    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if !is_valid_name(name) {
        return Err(invalid(line_num, format!("invalid requirement '{}'", line)));
    }

    let mut rest = body[name_end..].trim_start();

    let mut extras = Vec::new();
    if let Some(after_bracket) = rest.strip_prefix('[') {
        let close = after_bracket
            .find(']')
            .ok_or_else(|| invalid(line_num, format!("unclosed extras in '{}'", line)))?;
        for extra in after_bracket[..close].split(',') {
            let extra = extra.trim();
            if !is_valid_name(extra) {
                return Err(invalid(line_num, format!("invalid extra '{}' in '{}'", extra, line)));
            }
            extras.push(extra.to_string());
        }
        rest = after_bracket[close + 1..].trim_start();
    }

    if let Some(url) = rest.strip_prefix('@') {
        let url = url.trim();
        if url.is_empty() {
            return Err(invalid(line_num, format!("missing URL after '@' in '{}'", line)));
        }
        return Ok(Requirement {
            name: name.to_string(),
            extras,
            specs: Vec::new(),
            url: Some(url.to_string()),
            marker,
        });
    }

    let mut specs = Vec::new();
    if !rest.is_empty() {
        for clause in rest.split(',') {
            specs.push(parse_spec(clause.trim(), line, line_num)?);
        }
    }

    Ok(Requirement {
        name: name.to_string(),
        extras,
        specs,
        url: None,
        marker,
    })
}

fn parse_spec(clause: &str, line: &str, line_num: usize) -> Result<VersionSpec> {
    let op = OPERATORS
        .iter()
        .find(|op| clause.starts_with(**op))
        .ok_or_else(|| invalid(line_num, format!("invalid requirement '{}'", line)))?;
    let version = clause[op.len()..].trim();
    let version_ok = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '!' | '-' | '_'));
    if !version_ok {
        return Err(invalid(line_num, format!("invalid requirement '{}'", line)));
    }
    Ok(VersionSpec {
        op: op.to_string(),
        version: version.to_string(),
    })
}

/// Package names: ASCII letters/digits, with `.`, `_`, `-` inside.
fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_pinned_requirements() {
        let manifest = DependencyManifest::parse("flask==3.0.0\nrequests==2.31.0\n").unwrap();
        let reqs: Vec<&Requirement> = manifest.requirements().collect();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].name, "flask");
        assert_eq!(reqs[0].specs[0].to_string(), "==3.0.0");
        assert!(reqs[0].is_exact());
        assert!(manifest.unpinned().is_empty());
    }

    #[test]
    fn test_parse_preserves_order_and_options() {
        let content = "--index-url https://pypi.org/simple\nrequests>=2.0\n-r extra.txt\nflask\n";
        let manifest = DependencyManifest::parse(content).unwrap();
        assert_eq!(manifest.entries.len(), 4);
        assert!(matches!(&manifest.entries[0], ManifestEntry::Option(o) if o.starts_with("--index-url")));
        let names: Vec<&str> = manifest.requirements().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "flask"]);
        assert_eq!(manifest.unpinned().len(), 2);
    }

    #[test]
    fn test_parse_extras_ranges_and_marker() {
        let manifest = DependencyManifest::parse(
            "uvicorn[standard, http2] >=0.20,<1.0 ; python_version >= \"3.8\"",
        )
        .unwrap();
        let req = manifest.requirements().next().unwrap();
        assert_eq!(req.extras, vec!["standard".to_string(), "http2".to_string()]);
        assert_eq!(req.specs.len(), 2);
        assert_eq!(req.specs[1].op, "<");
        assert_eq!(req.marker.as_deref(), Some("python_version >= \"3.8\""));
        assert!(!req.is_exact());
    }

    #[test]
    fn test_parse_direct_reference() {
        let manifest =
            DependencyManifest::parse("mylib @ https://example.com/mylib-1.0.tar.gz").unwrap();
        let req = manifest.requirements().next().unwrap();
        assert_eq!(req.url.as_deref(), Some("https://example.com/mylib-1.0.tar.gz"));
        assert!(req.is_exact());
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let content = "# deps\n\nflask==3.0.0  # web\n   \n";
        let manifest = DependencyManifest::parse(content).unwrap();
        assert_eq!(manifest.requirements().count(), 1);
    }

    #[test]
    fn test_parse_continuation() {
        let manifest = DependencyManifest::parse("flask\\\n==3.0.0\n").unwrap();
        let req = manifest.requirements().next().unwrap();
        assert_eq!(req.specs[0].version, "3.0.0");
    }

    #[test]
    fn test_parse_invalid_lines_report_line_number() {
        let err = DependencyManifest::parse("flask==3.0.0\nrequests==\n").unwrap_err();
        match err {
            RelayError::ManifestError { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }

        assert!(DependencyManifest::parse("==1.0").is_err());
        assert!(DependencyManifest::parse("fla sk").is_err());
        assert!(DependencyManifest::parse("flask[unclosed").is_err());
        assert!(DependencyManifest::parse("flask ;").is_err());
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = DependencyManifest::parse("# nothing\n").unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_requirement_display() {
        let manifest = DependencyManifest::parse("Flask[async]==3.0.0").unwrap();
        let req = manifest.requirements().next().unwrap();
        assert_eq!(req.to_string(), "Flask[async]==3.0.0");
    }

    #[test]
    fn test_from_file_missing() {
        let tmp = TempDir::new().unwrap();
        let err = DependencyManifest::from_file(&tmp.path().join("requirements.txt")).unwrap_err();
        assert!(matches!(err, RelayError::BuildError(_)));
    }
}
