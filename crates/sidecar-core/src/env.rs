use crate::error::ResolveError;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static PROCESS_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$processes\.([A-Za-z0-9_][A-Za-z0-9_-]*)\.([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static PORT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{PORT\}|\$PORT\b").unwrap());
static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Live view of the values a command or env template may reference.
///
/// The supervisor maintains one shared context and re-injects it into each
/// process whenever ports or exports change.
#[derive(Debug, Clone, Default)]
pub struct EnvContext {
    pub process_ports: HashMap<String, u16>,
    pub process_exports: HashMap<String, BTreeMap<String, String>>,
    pub system_env: HashMap<String, String>,
    pub current_port: Option<u16>,
}

impl EnvContext {
    pub fn with_system_env() -> Self {
        Self {
            system_env: std::env::vars().collect(),
            ..Self::default()
        }
    }

    pub fn with_current_port(mut self, port: Option<u16>) -> Self {
        self.current_port = port;
        self
    }

    /// Substitution order: `$processes.<name>.<var>`, then `$PORT`/`${PORT}`,
    /// then `${VAR}`, then `$VAR`. Process references and `$PORT` fail when
    /// the value is unavailable; plain system vars resolve to the empty
    /// string when unset.
    pub fn resolve(&self, input: &str) -> Result<String, ResolveError> {
        let mut failure: Option<ResolveError> = None;

        let step1 = PROCESS_REF.replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            let var = &caps[2];
            match self.lookup_process_var(name, var) {
                Some(value) => value,
                None => {
                    failure.get_or_insert(ResolveError::UnresolvedReference(format!(
                        "$processes.{name}.{var}"
                    )));
                    String::new()
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let mut missing_port = false;
        let step2 = PORT_REF.replace_all(&step1, |_: &Captures<'_>| match self.current_port {
            Some(port) => port.to_string(),
            None => {
                missing_port = true;
                String::new()
            }
        });
        if missing_port {
            return Err(ResolveError::MissingPort);
        }

        let step3 = BRACED_VAR.replace_all(&step2, |caps: &Captures<'_>| {
            self.system_env.get(&caps[1]).cloned().unwrap_or_default()
        });

        // `$processes` itself is not an env var; an unmatched reference that
        // survived step 1 must keep its literal spelling.
        let step4 = BARE_VAR.replace_all(&step3, |caps: &Captures<'_>| {
            let name = &caps[1];
            if name == "processes" {
                return caps[0].to_string();
            }
            self.system_env.get(name).cloned().unwrap_or_default()
        });

        Ok(step4.into_owned())
    }

    /// Like `resolve`, but returns `None` instead of failing. Used to
    /// preview commands whose dependencies are not ready yet.
    pub fn try_resolve(&self, input: &str) -> Option<String> {
        self.resolve(input).ok()
    }

    pub fn resolve_map(
        &self,
        map: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ResolveError> {
        map.iter()
            .map(|(key, value)| Ok((key.clone(), self.resolve(value)?)))
            .collect()
    }

    fn lookup_process_var(&self, name: &str, var: &str) -> Option<String> {
        if let Some(exports) = self.process_exports.get(name) {
            if let Some(value) = exports.get(var) {
                return Some(value.clone());
            }
        }
        if var == "port" {
            if let Some(port) = self.process_ports.get(name) {
                return Some(port.to_string());
            }
        }
        None
    }
}
