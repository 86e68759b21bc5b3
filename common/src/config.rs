use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identity of whoever issues a command (a numeric user id on the remote channel).
pub type CallerId = u64;

pub const KEY_GROUP_ID: &str = "GUILD_ID";
pub const KEY_TOKEN: &str = "TOKEN";
pub const KEY_AUTHORIZED_LIST: &str = "AUTHORIZED_LIST";
pub const KEY_PROJECTS: &str = "PROJECTS";
pub const KEY_CHECK_INTERVAL: &str = "CHECK_INTERVAL";

const MIN_TOKEN_LEN: usize = 50;

/// The supervisor configuration as persisted in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    #[serde(rename = "GUILD_ID")]
    pub group_id: u64,
    #[serde(rename = "TOKEN")]
    pub token: String,
    #[serde(rename = "AUTHORIZED_LIST")]
    pub authorized: Vec<CallerId>,
    #[serde(rename = "PROJECTS")]
    pub projects: Vec<ProjectSpec>,
    #[serde(rename = "CHECK_INTERVAL", default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(rename = "SUPERVISOR", default)]
    pub supervisor: SupervisorSettings,
    #[serde(rename = "UPDATES", default)]
    pub updates: UpdateSettings,
    #[serde(rename = "SELF", default, skip_serializing_if = "Option::is_none")]
    pub self_spec: Option<SelfSpec>,
    #[serde(rename = "UPGRADE", default)]
    pub upgrade: UpgradeSettings,
}

fn default_check_interval() -> u64 {
    60
}

impl Configuration {
    pub fn is_authorized(&self, caller: CallerId) -> bool {
        self.authorized.contains(&caller)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// `SUPERVISOR` with the liveness sweep interval filled in.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            check_interval_secs: self.check_interval,
            ..self.supervisor.clone()
        }
    }

    /// Resolve every project into a launch spec. Relative paths are resolved against `base_dir`,
    /// normally the directory holding `config.json`.
    pub fn launch_specs(&self, base_dir: &Path) -> Vec<LaunchSpec> {
        let root = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        self.projects
            .iter()
            .map(|p| p.launch_spec(base_dir, &root))
            .collect()
    }
}

/// One entry of `PROJECTS`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSpec {
    pub local_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    /// Packages this project depends on; an `upgrade` without a library upgrades them all.
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Unknown keys are kept so they can be referenced from `args`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_interpreter() -> String {
    "python".to_string()
}

impl ProjectSpec {
    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| derive_name(&self.local_path))
    }

    pub fn source(&self) -> Option<SourceSpec> {
        source_of(
            self.git.as_ref(),
            self.github_path.as_deref(),
            self.github_file_path.as_deref(),
            &self.local_path,
        )
    }

    fn launch_spec(&self, base_dir: &Path, root: &Map<String, Value>) -> LaunchSpec {
        let entry = resolve(base_dir, &self.local_path);
        let own = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let extra_args: Vec<String> = self
            .args
            .iter()
            .map(|arg| substitute(arg, &own, root))
            .collect();

        let (program, args) = if self.interpreter.is_empty() {
            (entry.to_string_lossy().into_owned(), extra_args)
        } else {
            let mut args = vec![entry.to_string_lossy().into_owned()];
            args.extend(extra_args);
            (self.interpreter.clone(), args)
        };

        let working_dir = match &self.working_dir {
            Some(dir) => resolve(base_dir, dir),
            None => entry
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| base_dir.to_path_buf()),
        };

        LaunchSpec {
            name: self.name(),
            program,
            args,
            working_dir,
            entry,
            source: self.source(),
        }
    }
}

/// A git checkout that is updated with `fetch` + fast-forward merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GitSource {
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn default_remote() -> String {
    "origin".to_string()
}

/// Where new code for a working directory comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Git {
        remote: String,
        branch: Option<String>,
    },
    /// A single file downloaded from the raw view of a GitHub repository.
    Github {
        repository: String,
        file_path: String,
    },
}

fn source_of(
    git: Option<&GitSource>,
    github_path: Option<&str>,
    github_file_path: Option<&str>,
    local_path: &str,
) -> Option<SourceSpec> {
    if let Some(git) = git {
        return Some(SourceSpec::Git {
            remote: git.remote.clone(),
            branch: git.branch.clone(),
        });
    }
    let repository = github_path.filter(|p| !p.is_empty())?;
    let file_path = github_file_path
        .map(str::to_string)
        .unwrap_or_else(|| {
            Path::new(local_path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    Some(SourceSpec::Github {
        repository: repository.to_string(),
        file_path,
    })
}

/// Fully resolved description of how to run one managed project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// The entry script or program; also the file replaced by a raw-file update.
    pub entry: PathBuf,
    pub source: Option<SourceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub settle_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub crash_loop_threshold: u32,
    pub crash_loop_window_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
    pub health_grace_secs: u64,
    pub kill_strays: bool,
    pub backup_retention: usize,
    /// Copied from `CHECK_INTERVAL`; not part of the `SUPERVISOR` section.
    #[serde(skip)]
    pub check_interval_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            settle_delay_ms: 2_000,
            stop_grace_ms: 5_000,
            crash_loop_threshold: 5,
            crash_loop_window_secs: 60,
            backoff_initial_ms: 1_000,
            backoff_max_secs: 300,
            health_grace_secs: 120,
            kill_strays: true,
            backup_retention: 10,
            check_interval_secs: default_check_interval(),
        }
    }
}

impl SupervisorSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Span over which `crash_loop_threshold` restarts mean a crash loop. Exited processes
    /// are only restarted on a liveness sweep, so the span is never shorter than the
    /// sweeps, settle delays and backoffs that many restarts take.
    pub fn crash_loop_window(&self) -> Duration {
        let sweep = Duration::from_secs(self.check_interval_secs) + self.settle_delay();
        let reachable: Duration = (1..=self.crash_loop_threshold)
            .map(|n| sweep + self.backoff(n))
            .sum();
        Duration::from_secs(self.crash_loop_window_secs).max(reachable + sweep)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    /// Delay before the next launch attempt after `failures` consecutive launch failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let cap = Duration::from_secs(self.backoff_max_secs);
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_initial_ms.saturating_mul(factor)).min(cap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateSettings {
    pub alive_window_secs: u64,
    pub default_ref: String,
    pub fetch_timeout_secs: u64,
    pub relaunch_confirm_secs: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        UpdateSettings {
            alive_window_secs: 30,
            default_ref: "main".to_string(),
            fetch_timeout_secs: 30,
            relaunch_confirm_secs: 60,
        }
    }
}

impl UpdateSettings {
    pub fn alive_window(&self) -> Duration {
        Duration::from_secs(self.alive_window_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn relaunch_confirm(&self) -> Duration {
        Duration::from_secs(self.relaunch_confirm_secs)
    }
}

/// The supervisor's own source tree, used by `pull_self`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SelfSpec {
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_file_path: Option<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

impl SelfSpec {
    pub fn source(&self) -> Option<SourceSpec> {
        source_of(
            self.git.as_ref(),
            self.github_path.as_deref(),
            self.github_file_path.as_deref(),
            "",
        )
    }

    pub fn working_dir(&self, base_dir: &Path) -> PathBuf {
        resolve(base_dir, &self.working_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeSettings {
    pub command: Vec<String>,
    pub pinned_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        UpgradeSettings {
            command: ["pip", "install", "--upgrade", "{library}"]
                .map(String::from)
                .to_vec(),
            pinned_command: ["pip", "install", "{library}=={version}"]
                .map(String::from)
                .to_vec(),
            timeout_secs: 300,
        }
    }
}

/// One broken schema rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Violation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a raw configuration document against the schema. An empty result means valid.
pub fn validate(raw: &str) -> Vec<Violation> {
    match serde_json::from_str::<Value>(raw) {
        Ok(doc) => validate_value(&doc),
        Err(e) => vec![Violation::new("$", format!("not valid JSON: {e}"))],
    }
}

/// Validate and deserialize in one step.
pub fn parse(raw: &str) -> Result<Configuration, Vec<Violation>> {
    let violations = validate(raw);
    if !violations.is_empty() {
        return Err(violations);
    }
    serde_json::from_str(raw).map_err(|e| vec![Violation::new("$", e.to_string())])
}

pub fn validate_value(doc: &Value) -> Vec<Violation> {
    let Some(obj) = doc.as_object() else {
        return vec![Violation::new("$", "configuration must be a JSON object")];
    };
    let mut violations = Vec::new();

    match obj.get(KEY_GROUP_ID) {
        None => violations.push(missing(KEY_GROUP_ID)),
        Some(v) if !v.is_u64() => {
            violations.push(Violation::new(KEY_GROUP_ID, "must be a non-negative integer"))
        }
        _ => {}
    }

    match obj.get(KEY_TOKEN) {
        None => violations.push(missing(KEY_TOKEN)),
        Some(Value::String(t)) if t.chars().count() >= MIN_TOKEN_LEN => {}
        Some(_) => violations.push(Violation::new(
            KEY_TOKEN,
            format!("must be a string of at least {MIN_TOKEN_LEN} characters"),
        )),
    }

    match obj.get(KEY_AUTHORIZED_LIST) {
        None => violations.push(missing(KEY_AUTHORIZED_LIST)),
        Some(Value::Array(list)) => {
            if list.is_empty() {
                violations.push(Violation::new(KEY_AUTHORIZED_LIST, "must not be empty"));
            }
            for (i, id) in list.iter().enumerate() {
                if !id.is_u64() {
                    violations.push(Violation::new(
                        format!("{KEY_AUTHORIZED_LIST}[{i}]"),
                        "must be a non-negative integer",
                    ));
                }
            }
        }
        Some(_) => violations.push(Violation::new(KEY_AUTHORIZED_LIST, "must be a list")),
    }

    match obj.get(KEY_PROJECTS) {
        None => violations.push(missing(KEY_PROJECTS)),
        Some(Value::Array(projects)) => validate_projects(projects, &mut violations),
        Some(_) => violations.push(Violation::new(KEY_PROJECTS, "must be a list")),
    }

    if let Some(v) = obj.get(KEY_CHECK_INTERVAL)
        && !v.as_u64().is_some_and(|n| n > 0)
    {
        violations.push(Violation::new(
            KEY_CHECK_INTERVAL,
            "must be a positive number of seconds",
        ));
    }

    check_section::<SupervisorSettings>(obj, "SUPERVISOR", &mut violations);
    check_section::<UpdateSettings>(obj, "UPDATES", &mut violations);
    check_section::<UpgradeSettings>(obj, "UPGRADE", &mut violations);
    if let Some(self_spec) = check_section::<SelfSpec>(obj, "SELF", &mut violations)
        && self_spec.github_path.is_some()
        && self_spec.git.is_none()
        && self_spec.github_file_path.is_none()
    {
        violations.push(Violation::new(
            "SELF.github_file_path",
            "required when SELF.github_path is set",
        ));
    }

    // Whatever the explicit rules missed still has to deserialize.
    if violations.is_empty()
        && let Err(e) = serde_json::from_value::<Configuration>(doc.clone())
    {
        violations.push(Violation::new("$", e.to_string()));
    }
    violations
}

fn missing(key: &str) -> Violation {
    Violation::new(key, "required key is missing")
}

fn check_section<T: serde::de::DeserializeOwned>(
    obj: &Map<String, Value>,
    key: &str,
    violations: &mut Vec<Violation>,
) -> Option<T> {
    let value = obj.get(key)?;
    match serde_json::from_value::<T>(value.clone()) {
        Ok(section) => Some(section),
        Err(e) => {
            violations.push(Violation::new(key, e.to_string()));
            None
        }
    }
}

fn validate_projects(projects: &[Value], violations: &mut Vec<Violation>) {
    let mut names = HashSet::new();
    for (i, project) in projects.iter().enumerate() {
        let field = |name: &str| format!("{KEY_PROJECTS}[{i}].{name}");
        let Some(project) = project.as_object() else {
            violations.push(Violation::new(
                format!("{KEY_PROJECTS}[{i}]"),
                "must be an object",
            ));
            continue;
        };
        let local_path = match project.get("local_path") {
            Some(Value::String(p)) if !p.is_empty() => p.as_str(),
            Some(_) => {
                violations.push(Violation::new(field("local_path"), "must be a non-empty string"));
                continue;
            }
            None => {
                violations.push(missing(&field("local_path")));
                continue;
            }
        };
        let name = match project.get("name") {
            Some(Value::String(n)) => n.clone(),
            Some(_) => {
                violations.push(Violation::new(field("name"), "must be a string"));
                continue;
            }
            None => derive_name(local_path),
        };
        if name.is_empty() {
            violations.push(Violation::new(field("name"), "project name is empty"));
        } else if !names.insert(name.clone()) {
            violations.push(Violation::new(
                field("name"),
                format!("duplicate project name `{name}`"),
            ));
        }
        if let Some(args) = project.get("args")
            && !args.is_array()
        {
            violations.push(Violation::new(field("args"), "must be a list"));
        }
        if let Err(e) = serde_json::from_value::<ProjectSpec>(Value::Object(project.clone())) {
            violations.push(Violation::new(format!("{KEY_PROJECTS}[{i}]"), e.to_string()));
        }
    }
}

fn derive_name(local_path: &str) -> String {
    Path::new(local_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// An argument naming a key of its project (or of the top-level configuration) is replaced by
/// that key's value; anything else is passed through literally.
fn substitute(arg: &Value, own: &Map<String, Value>, root: &Map<String, Value>) -> String {
    match arg {
        Value::String(key) => match own.get(key).or_else(|| root.get(key)) {
            Some(value) => render(value),
            None => key.clone(),
        },
        other => render(other),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "GUILD_ID": 42,
            "TOKEN": "t".repeat(60),
            "AUTHORIZED_LIST": [1001],
            "PROJECTS": [
                { "local_path": "bots/alpha.py", "args": ["TOKEN", "--verbose", "settings"],
                  "settings": { "mode": "fast" } },
                { "local_path": "/srv/beta/run.sh", "name": "beta", "interpreter": "",
                  "args": ["GUILD_ID", ["a", "b"], 7] }
            ]
        })
    }

    #[test]
    fn test_valid_config() {
        let raw = base().to_string();
        assert!(validate(&raw).is_empty());
        let cfg = parse(&raw).unwrap();
        assert_eq!(cfg.check_interval, 60);
        assert_eq!(cfg.projects[0].name(), "alpha");
        assert!(cfg.is_authorized(1001));
        assert!(!cfg.is_authorized(7));
    }

    #[test]
    fn test_missing_authorized_list_is_named() {
        let mut doc = base();
        doc.as_object_mut().unwrap().remove(KEY_AUTHORIZED_LIST);
        let violations = validate(&doc.to_string());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, KEY_AUTHORIZED_LIST);
    }

    #[test]
    fn test_type_and_content_rules() {
        let mut doc = base();
        doc["GUILD_ID"] = json!("42");
        doc["TOKEN"] = json!("short");
        doc["AUTHORIZED_LIST"] = json!([]);
        doc["CHECK_INTERVAL"] = json!(0);
        let fields: Vec<_> = validate(&doc.to_string())
            .into_iter()
            .map(|v| v.field)
            .collect();
        assert_eq!(
            fields,
            vec!["GUILD_ID", "TOKEN", "AUTHORIZED_LIST", "CHECK_INTERVAL"]
        );
    }

    #[test]
    fn test_duplicate_derived_names() {
        let mut doc = base();
        doc["PROJECTS"] = json!([
            { "local_path": "a/worker.py" },
            { "local_path": "b/worker.py" },
        ]);
        let violations = validate(&doc.to_string());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "PROJECTS[1].name");
    }

    #[test]
    fn test_project_without_local_path() {
        let mut doc = base();
        doc["PROJECTS"] = json!([{ "name": "x" }]);
        let violations = validate(&doc.to_string());
        assert_eq!(violations[0].field, "PROJECTS[0].local_path");
    }

    #[test]
    fn test_unparseable_and_unknown_section_fields() {
        assert_eq!(validate("{not json")[0].field, "$");
        let mut doc = base();
        doc["SUPERVISOR"] = json!({ "crash_loop_treshold": 3 });
        assert_eq!(validate(&doc.to_string())[0].field, "SUPERVISOR");
    }

    #[test]
    fn test_launch_spec_substitution() {
        let cfg = parse(&base().to_string()).unwrap();
        let specs = cfg.launch_specs(Path::new("/etc/rkm"));

        let alpha = &specs[0];
        assert_eq!(alpha.program, "python");
        assert_eq!(alpha.entry, PathBuf::from("/etc/rkm/bots/alpha.py"));
        assert_eq!(alpha.working_dir, PathBuf::from("/etc/rkm/bots"));
        assert_eq!(
            alpha.args,
            vec![
                "/etc/rkm/bots/alpha.py".to_string(),
                "t".repeat(60),
                "--verbose".to_string(),
                r#"{"mode":"fast"}"#.to_string(),
            ]
        );

        let beta = &specs[1];
        assert_eq!(beta.program, "/srv/beta/run.sh");
        assert_eq!(beta.args, vec!["42", "a,b", "7"]);
    }

    #[test]
    fn test_sources() {
        let mut doc = base();
        doc["PROJECTS"][0]["github_path"] = json!("https://github.com/acme/bots.git");
        doc["PROJECTS"][1]["git"] = json!({ "branch": "release" });
        let cfg = parse(&doc.to_string()).unwrap();
        assert_eq!(
            cfg.projects[0].source(),
            Some(SourceSpec::Github {
                repository: "https://github.com/acme/bots.git".to_string(),
                file_path: "alpha.py".to_string(),
            })
        );
        assert_eq!(
            cfg.projects[1].source(),
            Some(SourceSpec::Git {
                remote: "origin".to_string(),
                branch: Some("release".to_string()),
            })
        );
    }

    #[test]
    fn test_backoff_curve() {
        let s = SupervisorSettings::default();
        assert_eq!(s.backoff(0), Duration::ZERO);
        assert_eq!(s.backoff(1), Duration::from_secs(1));
        assert_eq!(s.backoff(4), Duration::from_secs(8));
        assert_eq!(s.backoff(20), Duration::from_secs(300));
        assert_eq!(s.backoff(200), Duration::from_secs(300));
    }

    #[test]
    fn test_crash_loop_window_covers_sweeps() {
        // sweeps as slow as the window itself.
        let s = SupervisorSettings {
            check_interval_secs: 60,
            ..SupervisorSettings::default()
        };
        // 6 sweeps of 62 s plus 1+2+4+8+16 s of backoff.
        assert_eq!(s.crash_loop_window(), Duration::from_secs(6 * 62 + 31));

        let fast = SupervisorSettings {
            check_interval_secs: 1,
            settle_delay_ms: 0,
            backoff_initial_ms: 0,
            ..SupervisorSettings::default()
        };
        assert_eq!(fast.crash_loop_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_supervisor_settings_carry_check_interval() {
        let mut config = parse(&base().to_string()).unwrap();
        config.check_interval = 17;
        assert_eq!(config.supervisor_settings().check_interval_secs, 17);
        assert!(!serde_json::to_string(&config).unwrap().contains("check_interval_secs"));
    }
}
