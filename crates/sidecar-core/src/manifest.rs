use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// Declared configuration of one supervised process, as written in
/// `sidecar.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stdout_pattern_vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_vars: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub force: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestartPolicy {
    Always,
    #[default]
    OnFailure,
    Never,
}

/// Workspace-wide tunables. Out-of-range values are clamped on load rather
/// than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub log_buffer_size: usize,
    pub health_check_interval: u64,
    pub dependency_timeout: u64,
    pub restart_backoff_max: u64,
    pub process_stop_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_buffer_size: 1000,
            health_check_interval: 10_000,
            dependency_timeout: 60_000,
            restart_backoff_max: 30_000,
            process_stop_timeout: 5_000,
        }
    }
}

impl Settings {
    pub fn clamped(mut self) -> Self {
        self.log_buffer_size = self.log_buffer_size.clamp(100, 100_000);
        self.health_check_interval = self.health_check_interval.clamp(1_000, 300_000);
        self.dependency_timeout = self.dependency_timeout.clamp(1_000, 600_000);
        self.restart_backoff_max = self.restart_backoff_max.clamp(1_000, 300_000);
        self.process_stop_timeout = self.process_stop_timeout.clamp(1_000, 60_000);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReuseSetting {
    Enabled(bool),
    Key(String),
}

impl ReuseSetting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ReuseSetting::Enabled(false))
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ReuseSetting::Key(key) => Some(key.as_str()),
            ReuseSetting::Enabled(_) => None,
        }
    }
}

/// The workspace manifest (`sidecar.yaml`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse: Option<ReuseSetting>,
}

impl Manifest {
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let mut manifest: Manifest = serde_yaml::from_str(text)?;
        manifest.settings = manifest.settings.clamped();
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Reuse defaults to on: one daemon per workspace, later invocations
    /// proxy. `reuse: false` opts a workspace out entirely.
    pub fn reuse_enabled(&self) -> bool {
        self.reuse.as_ref().map(ReuseSetting::is_enabled).unwrap_or(true)
    }

    pub fn reuse_key(&self) -> Option<&str> {
        self.reuse.as_ref().and_then(ReuseSetting::key)
    }

    /// Validates the dependency graph and produces resolved configs with
    /// absolute paths. `config_dir` is the directory holding the manifest.
    pub fn resolve(
        &self,
        config_dir: &Path,
    ) -> Result<BTreeMap<String, ResolvedProcessConfig>, ConfigError> {
        self.validate(config_dir)?;
        let mut resolved = BTreeMap::new();
        for (name, config) in &self.processes {
            resolved.insert(
                name.clone(),
                ResolvedProcessConfig::resolve(name, config, config_dir)?,
            );
        }
        Ok(resolved)
    }

    /// Process names in dependency order: every process appears after all of
    /// its dependencies. Requires a validated manifest.
    pub fn topo_order(&self) -> Result<Vec<String>, ConfigError> {
        let mut order = Vec::with_capacity(self.processes.len());
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for name in self.processes.keys() {
            self.visit(name, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(ConfigError::CircularDependency(name.to_string()));
        }
        if let Some(config) = self.processes.get(name) {
            for dep in &config.depends_on {
                self.visit(dep, visiting, done, order)?;
            }
        }
        visiting.remove(name);
        done.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }

    fn validate(&self, config_dir: &Path) -> Result<(), ConfigError> {
        for (name, config) in &self.processes {
            if config.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
            for dep in &config.depends_on {
                if dep == name {
                    return Err(ConfigError::SelfDependency(name.clone()));
                }
                if !self.processes.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        process: name.clone(),
                        target: dep.clone(),
                    });
                }
            }
            for (var, pattern) in &config.stdout_pattern_vars {
                regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    process: name.clone(),
                    var: var.clone(),
                    source,
                })?;
            }
            if let Some(env_file) = &config.env_file {
                if normalize_under(config_dir, Path::new(env_file)).is_none() {
                    return Err(ConfigError::EnvFileOutsideWorkspace {
                        process: name.clone(),
                        path: env_file.clone(),
                    });
                }
            }
        }
        self.topo_order()?;
        Ok(())
    }
}

/// `ProcessConfig` after validation: absolute `cwd`/`envFile`, the process
/// name attached. Structural equality over these fields drives the reload
/// diff.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProcessConfig {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    pub port: Option<u16>,
    pub auto_start: bool,
    pub env: BTreeMap<String, String>,
    pub env_file: Option<PathBuf>,
    pub stdout_pattern_vars: BTreeMap<String, String>,
    pub ready_vars: Vec<String>,
    pub health_check: Option<String>,
    pub depends_on: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub force: bool,
}

impl ResolvedProcessConfig {
    fn resolve(
        name: &str,
        config: &ProcessConfig,
        config_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let cwd = match &config.cwd {
            Some(cwd) => {
                let path = Path::new(cwd);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    config_dir.join(path)
                }
            }
            None => config_dir.to_path_buf(),
        };
        let env_file = match &config.env_file {
            Some(env_file) => Some(normalize_under(config_dir, Path::new(env_file)).ok_or_else(
                || ConfigError::EnvFileOutsideWorkspace {
                    process: name.to_string(),
                    path: env_file.clone(),
                },
            )?),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            command: config.command.clone(),
            cwd,
            port: config.port,
            auto_start: config.auto_start,
            env: config.env.clone(),
            env_file,
            stdout_pattern_vars: config.stdout_pattern_vars.clone(),
            ready_vars: config.ready_vars.clone(),
            health_check: config.health_check.clone(),
            depends_on: config.depends_on.clone(),
            restart_policy: config.restart_policy,
            max_restarts: config.max_restarts,
            force: config.force,
        })
    }

    /// Health endpoint URL, once a port is known. Absolute URLs pass
    /// through; bare paths attach to localhost on the given port.
    pub fn health_url(&self, port: Option<u16>) -> Option<String> {
        let check = self.health_check.as_deref()?;
        if check.starts_with("http://") || check.starts_with("https://") {
            return Some(check.to_string());
        }
        let port = self.port.or(port)?;
        let path = if check.starts_with('/') {
            check.to_string()
        } else {
            format!("/{check}")
        };
        Some(format!("http://localhost:{port}{path}"))
    }
}

/// Lexically joins `rel` under `base` and rejects traversals that escape it.
fn normalize_under(base: &Path, rel: &Path) -> Option<PathBuf> {
    let joined = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        base.join(rel)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    if !out.starts_with(base) {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
processes:
  db:
    command: "postgres -D data"
    port: 5432
    readyVars: [port]
  api:
    command: "npm run dev"
    cwd: services/api
    dependsOn: [db]
    envFile: .env
    restartPolicy: onFailure
settings:
  logBufferSize: 500
"#;

    #[test]
    fn parses_camel_case_fields_and_defaults() {
        let manifest = Manifest::from_str(BASIC).unwrap();
        let api = &manifest.processes["api"];
        assert!(api.auto_start);
        assert_eq!(api.max_restarts, 5);
        assert_eq!(api.depends_on, vec!["db"]);
        assert_eq!(api.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(manifest.settings.log_buffer_size, 500);
        assert_eq!(manifest.settings.dependency_timeout, 60_000);
    }

    #[test]
    fn settings_are_clamped_to_documented_ranges() {
        let manifest = Manifest::from_str(
            "processes: {}\nsettings:\n  logBufferSize: 5\n  processStopTimeout: 999999\n",
        )
        .unwrap();
        assert_eq!(manifest.settings.log_buffer_size, 100);
        assert_eq!(manifest.settings.process_stop_timeout, 60_000);
    }

    #[test]
    fn resolve_makes_paths_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_str(BASIC).unwrap();
        let resolved = manifest.resolve(dir.path()).unwrap();
        assert_eq!(resolved["api"].cwd, dir.path().join("services/api"));
        assert_eq!(resolved["api"].env_file, Some(dir.path().join(".env")));
        assert_eq!(resolved["db"].cwd, dir.path());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let manifest =
            Manifest::from_str("processes:\n  web:\n    command: x\n    dependsOn: [ghost]\n")
                .unwrap();
        let err = manifest.resolve(Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn cycle_is_rejected() {
        let manifest = Manifest::from_str(
            "processes:\n  a:\n    command: x\n    dependsOn: [b]\n  b:\n    command: y\n    dependsOn: [a]\n",
        )
        .unwrap();
        let err = manifest.resolve(Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, ConfigError::CircularDependency(_)));
    }

    #[test]
    fn env_file_escape_is_rejected() {
        let manifest = Manifest::from_str(
            "processes:\n  a:\n    command: x\n    envFile: ../../etc/passwd\n",
        )
        .unwrap();
        let err = manifest.resolve(Path::new("/srv/app")).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFileOutsideWorkspace { .. }));
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let manifest = Manifest::from_str(BASIC).unwrap();
        let order = manifest.topo_order().unwrap();
        let db = order.iter().position(|n| n == "db").unwrap();
        let api = order.iter().position(|n| n == "api").unwrap();
        assert!(db < api);
    }

    #[test]
    fn reuse_accepts_bool_and_string() {
        let on = Manifest::from_str("processes: {}\nreuse: true\n").unwrap();
        assert!(on.reuse_enabled());
        assert_eq!(on.reuse_key(), None);

        let keyed = Manifest::from_str("processes: {}\nreuse: staging\n").unwrap();
        assert!(keyed.reuse_enabled());
        assert_eq!(keyed.reuse_key(), Some("staging"));

        let off = Manifest::from_str("processes: {}\nreuse: false\n").unwrap();
        assert!(!off.reuse_enabled());
    }

    #[test]
    fn health_url_resolution() {
        let manifest = Manifest::from_str(
            "processes:\n  a:\n    command: x\n    healthCheck: /healthz\n  b:\n    command: y\n    healthCheck: http://example.test/up\n",
        )
        .unwrap();
        let resolved = manifest.resolve(Path::new("/tmp")).unwrap();
        assert_eq!(resolved["a"].health_url(Some(8080)).as_deref(), Some("http://localhost:8080/healthz"));
        assert_eq!(resolved["a"].health_url(None), None);
        assert_eq!(resolved["b"].health_url(None).as_deref(), Some("http://example.test/up"));
    }
}
