//! The build recipe: the typed image contract.
//!
//! A recipe always expands to the same instruction order:
//!
//! ```text
//! FROM <pinned base>
//! WORKDIR <workdir>
//! ENV <build env>             (optional, visible to setup and install)
//! RUN <setup>...              (optional system setup)
//! COPY <manifest> .
//! RUN <install>
//! COPY <sources>... .
//! ENV <defaults>
//! CMD <command>
//! ```
//!
//! Installing dependencies before the application sources are copied
//! keeps the install layer's cache key independent of source changes.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use relaybox_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

use super::dockerfile::{Dockerfile, Instruction};
use super::env::{expand_vars, EnvSet};
use super::reference::ImageReference;

/// Default pinned Python runtime.
pub const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";

/// Default working directory inside the image.
pub const DEFAULT_WORKDIR: &str = "/app";

/// Default dependency manifest name.
pub const DEFAULT_MANIFEST: &str = "requirements.txt";

/// Default entry-point file.
pub const DEFAULT_ENTRYPOINT_FILE: &str = "main.py";

/// Typed build recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRecipe {
    /// Pinned base runtime image (e.g., "python:3.11-slim")
    pub base: String,

    /// Working directory inside the image
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Environment set before setup and install run (index URLs, proxies)
    #[serde(default, skip_serializing_if = "EnvSet::is_empty")]
    pub build_env: EnvSet,

    /// System setup commands run before the manifest is copied
    #[serde(default)]
    pub setup: Vec<String>,

    /// Dependency manifest, relative to the build context
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// Install command; defaults to pip against the manifest
    #[serde(default)]
    pub install: Option<String>,

    /// Application sources, relative to the build context
    pub sources: Vec<String>,

    /// Environment defaults baked into the image
    #[serde(default = "EnvSet::with_default_port")]
    pub env: EnvSet,

    /// Process entry command (exec form)
    pub command: Vec<String>,

    /// Image labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

fn default_manifest() -> String {
    DEFAULT_MANIFEST.to_string()
}

impl Default for BuildRecipe {
    fn default() -> Self {
        Self::default_python()
    }
}

impl BuildRecipe {
    /// The canonical Python recipe.
    pub fn default_python() -> Self {
        Self {
            base: DEFAULT_BASE_IMAGE.to_string(),
            workdir: default_workdir(),
            build_env: EnvSet::new(),
            setup: Vec::new(),
            manifest: default_manifest(),
            install: None,
            sources: vec![DEFAULT_ENTRYPOINT_FILE.to_string()],
            env: EnvSet::with_default_port(),
            command: vec!["python".to_string(), DEFAULT_ENTRYPOINT_FILE.to_string()],
            labels: BTreeMap::new(),
        }
    }

    /// The effective install command.
    pub fn install_command(&self) -> String {
        self.install
            .clone()
            .unwrap_or_else(|| format!("pip install --no-cache-dir -r {}", self.manifest))
    }

    /// Parsed base reference. Fails unless the base is pinned.
    pub fn base_reference(&self) -> Result<ImageReference> {
        ImageReference::parse_pinned(&self.base)
    }

    /// Check the recipe against the image contract.
    pub fn validate(&self) -> Result<()> {
        self.base_reference()?;

        if !self.workdir.starts_with('/') {
            return Err(RelayError::RecipeError(format!(
                "workdir must be an absolute path, got '{}'",
                self.workdir
            )));
        }

        check_context_path("manifest", &self.manifest)?;

        if self.sources.is_empty() {
            return Err(RelayError::RecipeError(
                "at least one source file is required".to_string(),
            ));
        }
        for source in &self.sources {
            check_context_path("source", source)?;
            if normalize(source) == normalize(&self.manifest) {
                return Err(RelayError::RecipeError(format!(
                    "manifest '{}' must not be listed among the sources",
                    self.manifest
                )));
            }
        }

        if self.install_command().trim().is_empty() {
            return Err(RelayError::RecipeError(
                "install command must not be empty".to_string(),
            ));
        }
        if self.setup.iter().any(|s| s.trim().is_empty()) {
            return Err(RelayError::RecipeError(
                "setup commands must not be empty".to_string(),
            ));
        }

        for env in [&self.build_env, &self.env] {
            env.validate()
                .map_err(|e| RelayError::RecipeError(e.to_string()))?;
        }

        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(RelayError::RecipeError(
                "entry command must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand the recipe into Dockerfile instructions, in contract order.
    pub fn to_dockerfile(&self) -> Dockerfile {
        let mut instructions = vec![
            Instruction::From {
                image: self.base.clone(),
                alias: None,
            },
            Instruction::Workdir {
                path: self.workdir.clone(),
            },
        ];

        if !self.build_env.is_empty() {
            instructions.push(env_instruction(&self.build_env));
        }

        for command in &self.setup {
            instructions.push(Instruction::Run {
                command: command.clone(),
            });
        }

        instructions.push(Instruction::Copy {
            src: vec![self.manifest.clone()],
            dst: ".".to_string(),
            from: None,
        });
        instructions.push(Instruction::Run {
            command: self.install_command(),
        });
        instructions.push(Instruction::Copy {
            src: self.sources.clone(),
            dst: ".".to_string(),
            from: None,
        });

        if !self.env.is_empty() {
            instructions.push(env_instruction(&self.env));
        }

        for (key, value) in &self.labels {
            instructions.push(Instruction::Label {
                key: key.clone(),
                value: value.clone(),
            });
        }

        instructions.push(Instruction::Cmd {
            exec: self.command.clone(),
        });

        Dockerfile { instructions }
    }

    /// Recover a recipe from a parsed Dockerfile.
    ///
    /// Rejects Dockerfiles whose shape breaks the contract: more than one
    /// stage, no copied manifest, an install step that is not directly
    /// after the manifest copy, commands after the sources, or no entry
    /// command.
    ///
    /// ENV declared before the install step lands in `build_env` so setup
    /// and install still see it; later ENV lands in `env`. `$NAME` in ENV
    /// values resolves against earlier ENV, then ARGs; names known only
    /// to the base image are left for the build to resolve.
    pub fn from_dockerfile(dockerfile: &Dockerfile) -> Result<Self> {
        let mut args: BTreeMap<String, String> = BTreeMap::new();
        let mut base: Option<String> = None;
        let mut workdir = "/".to_string();
        let mut setup = Vec::new();
        let mut manifest: Option<String> = None;
        let mut install: Option<String> = None;
        let mut sources: Vec<String> = Vec::new();
        let mut build_env = EnvSet::new();
        let mut env = EnvSet::new();
        let mut entrypoint: Vec<String> = Vec::new();
        let mut cmd: Vec<String> = Vec::new();
        let mut labels = BTreeMap::new();

        for instruction in &dockerfile.instructions {
            match instruction {
                Instruction::Arg { name, default } => {
                    if let Some(value) = default {
                        args.insert(name.clone(), value.clone());
                    }
                }
                Instruction::From { image, .. } => {
                    if base.is_some() {
                        return Err(RelayError::RecipeError(
                            "multi-stage builds are not supported".to_string(),
                        ));
                    }
                    let image = expand_vars(image, |name| args.get(name).cloned());
                    if image.contains('$') {
                        return Err(RelayError::RecipeError(format!(
                            "unresolved build argument in '{}'",
                            image
                        )));
                    }
                    base = Some(image);
                }
                Instruction::Workdir { path } => {
                    if manifest.is_some() {
                        return Err(RelayError::RecipeError(
                            "WORKDIR must be set before the manifest is copied".to_string(),
                        ));
                    }
                    workdir = resolve_path(&workdir, path);
                }
                Instruction::Copy { src, dst, from } => {
                    if from.is_some() {
                        return Err(RelayError::RecipeError(
                            "COPY --from is not supported".to_string(),
                        ));
                    }
                    if !is_workdir_target(dst, &workdir) {
                        return Err(RelayError::RecipeError(format!(
                            "COPY destination '{}' must be the working directory",
                            dst
                        )));
                    }
                    if manifest.is_none() {
                        if src.len() != 1 {
                            return Err(RelayError::RecipeError(
                                "the first COPY must copy only the dependency manifest".to_string(),
                            ));
                        }
                        manifest = Some(src[0].clone());
                    } else if install.is_none() {
                        return Err(RelayError::RecipeError(
                            "dependencies must be installed before application sources are copied"
                                .to_string(),
                        ));
                    } else {
                        sources.extend(src.iter().cloned());
                    }
                }
                Instruction::Run { command } => {
                    if manifest.is_none() {
                        setup.push(command.clone());
                    } else if install.is_none() {
                        install = Some(command.clone());
                    } else if sources.is_empty() {
                        return Err(RelayError::RecipeError(
                            "only one install step may follow the manifest copy".to_string(),
                        ));
                    } else {
                        return Err(RelayError::RecipeError(
                            "RUN after the application sources are copied is not allowed"
                                .to_string(),
                        ));
                    }
                }
                Instruction::Env { vars } => {
                    // Every value in one ENV sees the variables as they were before it
                    let resolved: Vec<(String, String)> = vars
                        .iter()
                        .map(|(key, value)| {
                            let value = expand_vars(value, |name| {
                                env.get(name)
                                    .or_else(|| build_env.get(name))
                                    .or_else(|| args.get(name).map(String::as_str))
                                    .map(String::from)
                            });
                            (key.clone(), value)
                        })
                        .collect();
                    let target = if install.is_none() { &mut build_env } else { &mut env };
                    for (key, value) in resolved {
                        target.set(key, value);
                    }
                }
                Instruction::Entrypoint { exec } => entrypoint = exec.clone(),
                Instruction::Cmd { exec } => cmd = exec.clone(),
                Instruction::Label { key, value } => {
                    labels.insert(key.clone(), value.clone());
                }
                Instruction::Expose { port } => {
                    tracing::warn!(
                        port = %port,
                        "EXPOSE is ignored; publish ports when launching the container"
                    );
                }
            }
        }

        let base =
            base.ok_or_else(|| RelayError::RecipeError("missing FROM instruction".to_string()))?;
        let manifest = manifest.ok_or_else(|| {
            RelayError::RecipeError("no dependency manifest is copied".to_string())
        })?;
        let install = install.ok_or_else(|| {
            RelayError::RecipeError("no install step follows the manifest copy".to_string())
        })?;

        let mut command = entrypoint;
        command.extend(cmd);

        let recipe = Self {
            base,
            workdir,
            build_env,
            setup,
            manifest,
            install: Some(install),
            sources,
            env,
            command,
            labels,
        };
        recipe.validate()?;
        Ok(recipe)
    }

    /// Load a recipe from a Dockerfile on disk.
    pub fn from_dockerfile_path(path: &Path) -> Result<Self> {
        Self::from_dockerfile(&Dockerfile::from_file(path)?)
    }

    /// Parse a YAML recipe (`relaybox.yaml`).
    pub fn from_yaml(content: &str) -> Result<Self> {
        let recipe: Self = serde_yaml::from_str(content)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Load a YAML recipe from disk.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::BuildError(format!("Failed to read recipe {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Serialize the recipe as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Resolve a path relative to a working directory.
pub(crate) fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

fn env_instruction(env: &EnvSet) -> Instruction {
    Instruction::Env {
        vars: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn is_workdir_target(dst: &str, workdir: &str) -> bool {
    let dst = dst.trim_end_matches('/');
    dst == "." || dst.is_empty() || dst == workdir.trim_end_matches('/')
}

/// Context paths must be relative and stay inside the context.
fn check_context_path(what: &str, path: &str) -> Result<()> {
    let p = Path::new(path);
    if path.trim().is_empty() {
        return Err(RelayError::RecipeError(format!("{} path must not be empty", what)));
    }
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(RelayError::RecipeError(format!(
            "{} path '{}' must be relative to the build context",
            what, path
        )));
    }
    Ok(())
}

fn normalize(path: &str) -> String {
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recipe_is_valid() {
        let recipe = BuildRecipe::default_python();
        recipe.validate().unwrap();
        assert_eq!(recipe.env.get("PORT"), Some("8080"));
        assert_eq!(
            recipe.install_command(),
            "pip install --no-cache-dir -r requirements.txt"
        );
    }

    #[test]
    fn test_to_dockerfile_order() {
        let df = BuildRecipe::default_python().to_dockerfile();
        let keywords: Vec<&str> = df.instructions.iter().map(|i| i.keyword()).collect();
        assert_eq!(
            keywords,
            vec!["FROM", "WORKDIR", "COPY", "RUN", "COPY", "ENV", "CMD"]
        );
        let rendered = df.render();
        assert!(rendered.starts_with("FROM python:3.11-slim\n"));
        assert!(rendered.contains("COPY requirements.txt .\n"));
        assert!(rendered.contains("ENV PORT=8080\n"));
        assert!(rendered.ends_with("CMD [\"python\",\"main.py\"]\n"));
        assert!(!rendered.contains("EXPOSE"));
    }

    #[test]
    fn test_dockerfile_roundtrip() {
        let mut recipe = BuildRecipe::default_python();
        recipe.setup = vec!["apt-get update".to_string()];
        recipe.labels.insert("org.example.app".to_string(), "relay".to_string());
        let parsed = BuildRecipe::from_dockerfile(&recipe.to_dockerfile()).unwrap();
        assert_eq!(parsed.base, recipe.base);
        assert_eq!(parsed.setup, recipe.setup);
        assert_eq!(parsed.install_command(), recipe.install_command());
        assert_eq!(parsed.sources, recipe.sources);
        assert_eq!(parsed.env, recipe.env);
        assert_eq!(parsed.command, recipe.command);
        assert_eq!(parsed.labels, recipe.labels);
    }

    #[test]
    fn test_validate_rejects_unpinned_base() {
        let mut recipe = BuildRecipe::default_python();
        recipe.base = "python:latest".to_string();
        assert!(matches!(recipe.validate(), Err(RelayError::RecipeError(_))));
        recipe.base = "python".to_string();
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let mut recipe = BuildRecipe::default_python();
        recipe.sources = vec!["../secret.py".to_string()];
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default_python();
        recipe.manifest = "/etc/requirements.txt".to_string();
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default_python();
        recipe.sources = vec!["./requirements.txt".to_string()];
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default_python();
        recipe.sources.clear();
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command_and_bad_env() {
        let mut recipe = BuildRecipe::default_python();
        recipe.command.clear();
        assert!(recipe.validate().is_err());

        let mut recipe = BuildRecipe::default_python();
        recipe.env.set("BAD-NAME", "x");
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_from_dockerfile_rejects_source_before_install() {
        let df = Dockerfile::parse(
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt .\nCOPY main.py .\nRUN pip install -r requirements.txt\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        let err = BuildRecipe::from_dockerfile(&df).unwrap_err();
        assert!(err.to_string().contains("installed before"));
    }

    #[test]
    fn test_from_dockerfile_rejects_whole_context_first() {
        let df = Dockerfile::parse(
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt main.py .\nRUN pip install -r requirements.txt\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        assert!(BuildRecipe::from_dockerfile(&df).is_err());
    }

    #[test]
    fn test_from_dockerfile_rejects_run_after_sources() {
        let df = Dockerfile::parse(
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .\nRUN python -m compileall .\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        assert!(BuildRecipe::from_dockerfile(&df).is_err());
    }

    #[test]
    fn test_from_dockerfile_rejects_multi_stage_and_missing_cmd() {
        let df = Dockerfile::parse(
            "FROM python:3.11-slim AS a\nFROM python:3.11-slim\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .\nCMD [\"python\"]",
        )
        .unwrap();
        assert!(BuildRecipe::from_dockerfile(&df).is_err());

        let df = Dockerfile::parse(
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .",
        )
        .unwrap();
        assert!(BuildRecipe::from_dockerfile(&df).is_err());
    }

    #[test]
    fn test_from_dockerfile_expands_args_and_entrypoint() {
        let df = Dockerfile::parse(
            "ARG PY=3.12\nFROM python:${PY}-slim\nWORKDIR /srv\nCOPY requirements.txt /srv/\nRUN pip install -r requirements.txt\nCOPY main.py .\nENTRYPOINT [\"python\"]\nCMD [\"main.py\"]",
        )
        .unwrap();
        let recipe = BuildRecipe::from_dockerfile(&df).unwrap();
        assert_eq!(recipe.base, "python:3.12-slim");
        assert_eq!(recipe.workdir, "/srv");
        assert_eq!(recipe.command, vec!["python".to_string(), "main.py".to_string()]);
        // No ENV in the Dockerfile: nothing is declared
        assert!(recipe.env.is_empty());
    }

    #[test]
    fn test_from_dockerfile_unresolved_arg() {
        let df = Dockerfile::parse(
            "FROM python:${PY}\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        assert!(BuildRecipe::from_dockerfile(&df).is_err());
    }

    #[test]
    fn test_from_dockerfile_keeps_env_before_install() {
        let df = Dockerfile::parse(
            "FROM python:3.11-slim\nWORKDIR /app\nENV PIP_INDEX_URL=https://pypi.internal/simple\nCOPY requirements.txt .\nENV PIP_NO_CACHE_DIR=1\nRUN pip install -r requirements.txt\nCOPY main.py .\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        let recipe = BuildRecipe::from_dockerfile(&df).unwrap();
        assert_eq!(
            recipe.build_env.get("PIP_INDEX_URL"),
            Some("https://pypi.internal/simple")
        );
        assert_eq!(recipe.build_env.get("PIP_NO_CACHE_DIR"), Some("1"));
        assert!(recipe.env.is_empty());

        let rebuilt = recipe.to_dockerfile();
        let keywords: Vec<&str> = rebuilt.instructions.iter().map(|i| i.keyword()).collect();
        assert_eq!(
            keywords,
            vec!["FROM", "WORKDIR", "ENV", "COPY", "RUN", "COPY", "CMD"]
        );
        assert_eq!(BuildRecipe::from_dockerfile(&rebuilt).unwrap(), recipe);
    }

    #[test]
    fn test_from_dockerfile_env_references() {
        let df = Dockerfile::parse(
            "ARG PY=3.12\nFROM python:${PY}-slim\nWORKDIR /app\nENV VENV=/opt/venv\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .\nENV PATH=$VENV/bin:$PATH RUNTIME=$PYTHON_VERSION TAG=${PY}\nENV TAG=next PREVIOUS=$TAG\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        let recipe = BuildRecipe::from_dockerfile(&df).unwrap();
        assert_eq!(recipe.base, "python:3.12-slim");
        // Names the Dockerfile never declares come from the base at build time
        assert_eq!(recipe.env.get("PATH"), Some("/opt/venv/bin:$PATH"));
        assert_eq!(recipe.env.get("RUNTIME"), Some("$PYTHON_VERSION"));
        assert_eq!(recipe.env.get("TAG"), Some("next"));
        assert_eq!(recipe.env.get("PREVIOUS"), Some("3.12"));
    }

    #[test]
    fn test_from_dockerfile_numeric_base_tag() {
        let df = Dockerfile::parse(
            "FROM python:3\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install -r requirements.txt\nCOPY main.py .\nCMD [\"python\", \"main.py\"]",
        )
        .unwrap();
        let recipe = BuildRecipe::from_dockerfile(&df).unwrap();
        let reference = recipe.base_reference().unwrap();
        assert_eq!(reference.tag.as_deref(), Some("3"));
    }

    #[test]
    fn test_yaml_build_env() {
        let recipe = BuildRecipe::from_yaml(
            "base: python:3.11-slim\nbuild_env:\n  PIP_INDEX_URL: https://pypi.internal/simple\nsources: [main.py]\ncommand: [python, main.py]\n",
        )
        .unwrap();
        assert_eq!(
            recipe.build_env.get("PIP_INDEX_URL"),
            Some("https://pypi.internal/simple")
        );
        assert_eq!(BuildRecipe::from_yaml(&recipe.to_yaml().unwrap()).unwrap(), recipe);

        let yaml = BuildRecipe::default_python().to_yaml().unwrap();
        assert!(!yaml.contains("build_env"));
    }

    #[test]
    fn test_yaml_defaults() {
        let recipe = BuildRecipe::from_yaml(
            "base: python:3.11-slim\nsources: [main.py]\ncommand: [python, main.py]\n",
        )
        .unwrap();
        assert_eq!(recipe.workdir, "/app");
        assert_eq!(recipe.manifest, "requirements.txt");
        assert_eq!(recipe.env.get("PORT"), Some("8080"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let recipe = BuildRecipe::default_python();
        let yaml = recipe.to_yaml().unwrap();
        assert_eq!(BuildRecipe::from_yaml(&yaml).unwrap(), recipe);
    }

    #[test]
    fn test_yaml_rejects_unknown_fields() {
        assert!(BuildRecipe::from_yaml(
            "base: python:3.11-slim\nsources: [main.py]\ncommand: [python]\nexpose: 80\n"
        )
        .is_err());
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/app", "/usr/bin"), "/usr/bin");
        assert_eq!(resolve_path("/app", "src"), "/app/src");
        assert_eq!(resolve_path("/", "app"), "/app");
    }
}
