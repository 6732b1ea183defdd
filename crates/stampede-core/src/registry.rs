//! Scenario registry with weighted selection and tag filtering.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{LoadError, LoadResult};
use crate::scenario::{ActionDefinition, ScenarioDefinition};
use crate::weights::CumulativeWeights;

/// Include/exclude tag sets applied once before a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// An action is eligible when it has one of the included tags (or no
    /// include list was given) and none of the excluded ones.
    pub fn accepts(&self, action: &ActionDefinition) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|t| action.has_tag(t));
        let excluded = self.exclude.iter().any(|t| action.has_tag(t));
        included && !excluded
    }
}

/// The set of scenarios a run draws its virtual users from.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: Vec<Arc<ScenarioDefinition>>,
    names: HashSet<String>,
    weights: CumulativeWeights,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of definitions, rejecting duplicates.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ScenarioDefinition>,
    ) -> LoadResult<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    /// Add a scenario. Fails if the name is taken or the weight is invalid.
    pub fn register(&mut self, scenario: ScenarioDefinition) -> LoadResult<()> {
        if self.names.contains(&scenario.name) {
            return Err(LoadError::DuplicateName(scenario.name));
        }
        if !scenario.weight.is_finite() || scenario.weight < 0.0 {
            return Err(LoadError::InvalidWeight {
                name: scenario.name,
                weight: scenario.weight,
            });
        }

        debug!(scenario = %scenario.name, weight = scenario.weight, "Registered scenario");
        self.names.insert(scenario.name.clone());
        self.scenarios.push(Arc::new(scenario));
        self.weights = CumulativeWeights::new(self.scenarios.iter().map(|s| s.weight));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn scenarios(&self) -> &[Arc<ScenarioDefinition>] {
        &self.scenarios
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ScenarioDefinition>> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.total()
    }

    /// Check that the registry can serve draws at all.
    pub fn ensure_selectable(&self) -> LoadResult<()> {
        if self.scenarios.is_empty() {
            return Err(LoadError::EmptyRegistry);
        }
        if self.weights.total() <= 0.0 {
            return Err(LoadError::ZeroTotalWeight);
        }
        Ok(())
    }

    /// Weighted random pick: one uniform draw and a binary search over the
    /// cumulative weights.
    pub fn select_scenario<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> LoadResult<Arc<ScenarioDefinition>> {
        self.ensure_selectable()?;
        let idx = self.weights.sample(rng).ok_or(LoadError::ZeroTotalWeight)?;
        Ok(self.scenarios[idx].clone())
    }

    /// Resolve a tag filter into a new registry holding only eligible
    /// scenarios and actions.
    ///
    /// Scenarios with no eligible action are dropped. When tags were
    /// explicitly included and every surviving scenario has weight 0 (the
    /// spike/stress archetypes that only run on request), they are promoted
    /// to weight 1.
    pub fn filter(&self, filter: &TagFilter) -> LoadResult<Self> {
        if filter.is_empty() {
            return Ok(self.clone());
        }

        let mut survivors: Vec<ScenarioDefinition> = self
            .scenarios
            .iter()
            .filter_map(|s| s.retain_actions(|a| filter.accepts(a)))
            .collect();

        if survivors.is_empty() {
            return Err(LoadError::NoMatchingScenarios {
                include: filter.include.join(","),
                exclude: filter.exclude.join(","),
            });
        }

        let total: f64 = survivors.iter().map(|s| s.weight).sum();
        if total <= 0.0 && !filter.include.is_empty() {
            warn!(
                scenarios = survivors.len(),
                "Only zero-weight scenarios match the requested tags, running them with weight 1"
            );
            for scenario in &mut survivors {
                scenario.weight = 1.0;
            }
        }

        let registry = Self::from_definitions(survivors)?;
        info!(
            include = %filter.include.join(","),
            exclude = %filter.exclude.join(","),
            scenarios = registry.len(),
            "Applied tag filter"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::RequestTemplate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scenario(name: &str, weight: f64, tags: &[&str]) -> ScenarioDefinition {
        let action = ActionDefinition::new(
            format!("{}_action", name),
            1.0,
            tags,
            vec![RequestTemplate::get("/api/ping").unwrap()],
        );
        ScenarioDefinition::new(name, weight, vec![action]).unwrap()
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = ScenarioRegistry::new();
        registry.register(scenario("a", 1.0, &[])).unwrap();
        let err = registry.register(scenario("a", 2.0, &[])).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateName(name) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ScenarioRegistry::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(registry.select_scenario(&mut rng), Err(LoadError::EmptyRegistry)));
    }

    #[test]
    fn test_all_zero_weights() {
        let registry = ScenarioRegistry::from_definitions([scenario("a", 0.0, &[])]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(registry.select_scenario(&mut rng), Err(LoadError::ZeroTotalWeight)));
    }

    #[test]
    fn test_filter_include_and_exclude() {
        let registry = ScenarioRegistry::from_definitions([
            scenario("dash", 10.0, &["dashboard", "p0"]),
            scenario("sms", 2.0, &["sms", "p1"]),
            scenario("writes", 1.0, &["sms", "write"]),
        ])
        .unwrap();

        let filtered = registry.filter(&TagFilter::new(["sms"], ["write"])).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.scenarios()[0].name, "sms");

        let err = registry.filter(&TagFilter::new(["missing"], Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, LoadError::NoMatchingScenarios { .. }));
    }

    #[test]
    fn test_filter_promotes_zero_weight_only_matches() {
        let registry = ScenarioRegistry::from_definitions([
            scenario("dash", 10.0, &["dashboard"]),
            scenario("spike", 0.0, &["spike"]),
        ])
        .unwrap();

        let filtered = registry.filter(&TagFilter::new(["spike"], Vec::<String>::new())).unwrap();
        assert_eq!(filtered.total_weight(), 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(filtered.select_scenario(&mut rng).unwrap().name, "spike");
    }

    #[test]
    fn test_filter_keeps_partial_actions() {
        let step = || RequestTemplate::get("/x").unwrap();
        let mixed = ScenarioDefinition::new(
            "mixed",
            1.0,
            vec![
                ActionDefinition::new("read", 1.0, &["agents"], vec![step()]),
                ActionDefinition::new("write", 1.0, &["agents", "write"], vec![step()]),
            ],
        )
        .unwrap();
        let registry = ScenarioRegistry::from_definitions([mixed]).unwrap();

        let filtered = registry.filter(&TagFilter::new(Vec::<String>::new(), ["write"])).unwrap();
        let actions = filtered.scenarios()[0].actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, "read");
    }
}
