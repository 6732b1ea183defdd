//! Scenario and action definitions, and the YAML schema they load from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoadError, LoadResult};
use crate::template::{JsonTemplate, Template};
use crate::think::ThinkTime;
use crate::weights::CumulativeWeights;

/// Tags attached to an action, shared with every outcome it produces.
pub type Tags = Arc<[String]>;

/// A virtual-user archetype: a weight and the actions its users pick from.
#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    pub name: String,
    pub weight: f64,
    pub description: String,
    pub think_time: Option<ThinkTime>,
    actions: Vec<Arc<ActionDefinition>>,
    action_weights: CumulativeWeights,
}

impl ScenarioDefinition {
    pub fn new(
        name: impl Into<String>,
        weight: f64,
        actions: Vec<ActionDefinition>,
    ) -> LoadResult<Self> {
        let name = name.into();
        if !weight.is_finite() || weight < 0.0 {
            return Err(LoadError::InvalidWeight { name, weight });
        }
        if actions.is_empty() {
            return Err(LoadError::EmptyScenario(name));
        }
        for action in &actions {
            if !action.weight.is_finite() || action.weight < 0.0 {
                return Err(LoadError::InvalidWeight {
                    name: format!("{}/{}", name, action.name),
                    weight: action.weight,
                });
            }
            if action.steps.is_empty() {
                return Err(LoadError::EmptyAction {
                    scenario: name,
                    action: action.name.clone(),
                });
            }
        }

        let actions: Vec<Arc<ActionDefinition>> = actions.into_iter().map(Arc::new).collect();
        let action_weights = Self::action_table(&actions);
        if action_weights.total() <= 0.0 {
            return Err(LoadError::InvalidParameter {
                param: format!("{}.actions", name),
                message: "at least one action needs a positive weight".to_string(),
            });
        }

        Ok(Self {
            name,
            weight,
            description: String::new(),
            think_time: None,
            actions,
            action_weights,
        })
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = Some(think_time);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn action_table(actions: &[Arc<ActionDefinition>]) -> CumulativeWeights {
        CumulativeWeights::new(actions.iter().map(|a| a.weight))
    }

    pub fn actions(&self) -> &[Arc<ActionDefinition>] {
        &self.actions
    }

    /// Pick the next action proportionally to the action weights.
    pub fn select_action<R: Rng + ?Sized>(&self, rng: &mut R) -> &Arc<ActionDefinition> {
        // Construction guarantees a positive total, so sampling always succeeds.
        let idx = self.action_weights.sample(rng).unwrap_or(0);
        &self.actions[idx]
    }

    /// Union of all action tags.
    pub fn tags(&self) -> BTreeSet<&str> {
        self.actions
            .iter()
            .flat_map(|a| a.tags.iter().map(String::as_str))
            .collect()
    }

    /// Copy of this scenario restricted to the actions `keep` accepts, or
    /// `None` when no action (or no positively weighted action) survives.
    pub(crate) fn retain_actions(
        &self,
        keep: impl Fn(&ActionDefinition) -> bool,
    ) -> Option<Self> {
        let actions: Vec<Arc<ActionDefinition>> =
            self.actions.iter().filter(|a| keep(a)).cloned().collect();
        let action_weights = Self::action_table(&actions);
        if actions.is_empty() || action_weights.total() <= 0.0 {
            return None;
        }
        Some(Self {
            actions,
            action_weights,
            ..self.clone()
        })
    }
}

/// One task of a scenario: a tagged, weighted sequence of requests.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    pub name: String,
    pub weight: f64,
    pub tags: Tags,
    pub steps: Vec<RequestTemplate>,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, weight: f64, tags: &[&str], steps: Vec<RequestTemplate>) -> Self {
        Self {
            name: name.into(),
            weight,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            steps,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A compiled HTTP request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub path: Template,
    pub query: Vec<(String, Template)>,
    pub body: Option<JsonTemplate>,
    /// Statistics grouping key.
    pub name: String,
    /// Accepted statuses; empty means any 2xx.
    pub expect_status: Vec<u16>,
    /// Variable name to JSON pointer into a successful response body.
    pub captures: Vec<(String, String)>,
}

impl RequestTemplate {
    pub fn get(path: &str) -> LoadResult<Self> {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str, body: Value) -> LoadResult<Self> {
        let mut template = Self::new(Method::POST, path)?;
        template.body = Some(JsonTemplate::compile(&body)?);
        Ok(template)
    }

    pub fn new(method: Method, path: &str) -> LoadResult<Self> {
        Ok(Self {
            method,
            path: Template::parse(path)?,
            query: Vec::new(),
            body: None,
            name: path.to_string(),
            expect_status: Vec::new(),
            captures: Vec::new(),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capture(mut self, var: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.captures.push((var.into(), pointer.into()));
        self
    }

    pub fn is_accepted(&self, status: u16) -> bool {
        if self.expect_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expect_status.contains(&status)
        }
    }

    /// User variables that must be captured before this request can be issued.
    pub fn required_variables(&self) -> BTreeSet<&str> {
        let mut vars: BTreeSet<&str> = self.path.variables().collect();
        for (_, t) in &self.query {
            vars.extend(t.variables());
        }
        if let Some(body) = &self.body {
            vars.extend(body.variables());
        }
        vars
    }
}

// ============================================================================
// YAML schema
// ============================================================================

/// A scenario file as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Default think time for scenarios that do not set their own.
    #[serde(default)]
    pub think_time: Option<ThinkTime>,
    pub scenarios: Vec<ScenarioSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub think_time: Option<ThinkTime>,
    /// Tags added to every action of the scenario.
    #[serde(default)]
    pub tags: Vec<String>,
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<RequestSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expect_status: Vec<u16>,
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_method() -> String {
    "GET".to_string()
}

impl ScenarioFile {
    /// Load a scenario file from YAML.
    pub fn from_file(path: impl AsRef<Path>) -> LoadResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> LoadResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Compile every scenario: parse templates, resolve methods, and check
    /// weights. The returned definitions are immutable for the run.
    pub fn compile(&self) -> LoadResult<Vec<ScenarioDefinition>> {
        if let Some(think) = &self.think_time {
            think.validate()?;
        }
        self.scenarios.iter().map(|s| s.compile(self.think_time)).collect()
    }
}

impl ScenarioSpec {
    fn compile(&self, default_think: Option<ThinkTime>) -> LoadResult<ScenarioDefinition> {
        let actions = self
            .actions
            .iter()
            .map(|a| a.compile(&self.tags))
            .collect::<LoadResult<Vec<_>>>()?;

        let mut scenario = ScenarioDefinition::new(self.name.clone(), self.weight, actions)?
            .with_description(self.description.clone());
        if let Some(think) = self.think_time.or(default_think) {
            think.validate()?;
            scenario = scenario.with_think_time(think);
        }
        Ok(scenario)
    }
}

impl ActionSpec {
    fn compile(&self, scenario_tags: &[String]) -> LoadResult<ActionDefinition> {
        let mut tags: Vec<String> = self.tags.clone();
        for tag in scenario_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        Ok(ActionDefinition {
            name: self.name.clone(),
            weight: self.weight,
            tags: tags.into(),
            steps: self
                .steps
                .iter()
                .map(RequestSpec::compile)
                .collect::<LoadResult<_>>()?,
        })
    }
}

impl RequestSpec {
    fn compile(&self) -> LoadResult<RequestTemplate> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| LoadError::invalid_param("method", format!("unknown method '{}'", self.method)))?;
        if !self.path.starts_with('/') {
            return Err(LoadError::invalid_template(&self.path, "path must start with '/'"));
        }

        let query = self
            .query
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Ok((key.clone(), Template::parse(&text)?))
            })
            .collect::<LoadResult<Vec<_>>>()?;

        for pointer in self.capture.values() {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(LoadError::invalid_param(
                    "capture",
                    format!("'{}' is not a JSON pointer", pointer),
                ));
            }
        }

        Ok(RequestTemplate {
            method,
            path: Template::parse(&self.path)?,
            query,
            body: self.body.as_ref().map(JsonTemplate::compile).transpose()?,
            name: self.name.clone().unwrap_or_else(|| self.path.clone()),
            expect_status: self.expect_status.clone(),
            captures: self
                .capture
                .iter()
                .map(|(var, pointer)| (var.clone(), pointer.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const YAML: &str = r#"
name: sample
think_time: { type: between, min: 1, max: 3 }
scenarios:
  - name: DashboardUser
    weight: 10
    actions:
      - name: dashboard_summary
        weight: 10
        tags: [dashboard, p0]
        steps:
          - path: /api/dashboard/summary
            expect_status: [200]
      - name: agents_list
        weight: 5
        tags: [agents, p1]
        steps:
          - path: /api/agents/
            query: { view: table, page: "{int:1-5}", limit: 20 }
            name: /api/agents/
  - name: AIUser
    weight: 2
    tags: [ai]
    think_time: { type: constant, secs: 0.5 }
    actions:
      - name: create_conversation
        steps:
          - method: post
            path: /api/ai/conversations/
            body: { title: Load test conversation }
            capture: { conversation_id: /id }
"#;

    #[test]
    fn test_compile_yaml() {
        let file = ScenarioFile::from_yaml(YAML).unwrap();
        let scenarios = file.compile().unwrap();
        assert_eq!(scenarios.len(), 2);

        let dashboard = &scenarios[0];
        assert_eq!(dashboard.weight, 10.0);
        assert_eq!(dashboard.think_time, Some(ThinkTime::between(1.0, 3.0)));
        assert_eq!(dashboard.actions().len(), 2);
        let agents = &dashboard.actions()[1];
        assert_eq!(agents.steps[0].query.len(), 3);
        assert_eq!(agents.steps[0].name, "/api/agents/");

        let ai = &scenarios[1];
        assert_eq!(ai.think_time, Some(ThinkTime::constant(0.5)));
        let create = &ai.actions()[0];
        assert!(create.has_tag("ai"));
        assert_eq!(create.steps[0].method, Method::POST);
        assert_eq!(create.steps[0].captures, vec![("conversation_id".to_string(), "/id".to_string())]);
    }

    #[test]
    fn test_invalid_definitions() {
        let step = || RequestTemplate::get("/x").unwrap();
        assert!(matches!(
            ScenarioDefinition::new("neg", -1.0, vec![ActionDefinition::new("a", 1.0, &[], vec![step()])]),
            Err(LoadError::InvalidWeight { .. })
        ));
        assert!(matches!(
            ScenarioDefinition::new("empty", 1.0, vec![]),
            Err(LoadError::EmptyScenario(_))
        ));
        assert!(matches!(
            ScenarioDefinition::new("nosteps", 1.0, vec![ActionDefinition::new("a", 1.0, &[], vec![])]),
            Err(LoadError::EmptyAction { .. })
        ));
    }

    #[test]
    fn test_select_action_follows_weights() {
        let step = || RequestTemplate::get("/x").unwrap();
        let scenario = ScenarioDefinition::new(
            "s",
            1.0,
            vec![
                ActionDefinition::new("never", 0.0, &[], vec![step()]),
                ActionDefinition::new("always", 1.0, &[], vec![step()]),
            ],
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1000 {
            assert_eq!(scenario.select_action(&mut rng).name, "always");
        }
    }

    #[test]
    fn test_accepted_status() {
        let mut t = RequestTemplate::get("/x").unwrap();
        assert!(t.is_accepted(204));
        assert!(!t.is_accepted(404));
        t.expect_status = vec![200, 201];
        assert!(t.is_accepted(201));
        assert!(!t.is_accepted(204));
    }

    #[test]
    fn test_relative_path_rejected() {
        let yaml = "scenarios:\n  - name: s\n    actions:\n      - name: a\n        steps:\n          - path: api/x\n";
        let file = ScenarioFile::from_yaml(yaml).unwrap();
        assert!(file.compile().is_err());
    }
}
