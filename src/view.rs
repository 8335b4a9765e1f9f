//! View definitions and their compilation into dependency graphs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineContext;
use crate::error::GraphBuildError;
use crate::graph::{DependencyGraph, DependencyGraphBuilder};
use crate::market_data::MARKET_DATA_SHIFT;
use crate::value::{ValueProperties, ValueRequirement, ValueSpecification};

/// A named set of requirements computed together into one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationConfiguration {
    /// Configuration name, unique within a view.
    pub name: String,
    /// Terminal requirements.
    #[serde(default)]
    pub requirements: Vec<ValueRequirement>,
    /// Configuration-wide properties such as [`MARKET_DATA_SHIFT`].
    #[serde(default)]
    pub default_properties: ValueProperties,
}

impl CalculationConfiguration {
    /// Create an empty configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: Vec::new(),
            default_properties: ValueProperties::none(),
        }
    }

    /// Add a terminal requirement.
    pub fn with_requirement(mut self, requirement: ValueRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Set the default properties.
    pub fn with_default_properties(mut self, properties: ValueProperties) -> Self {
        self.default_properties = properties;
        self
    }

    /// Shift applied to market data loaded for this configuration.
    pub fn market_data_shift(&self) -> Option<&str> {
        self.default_properties.value(MARKET_DATA_SHIFT)
    }
}

/// What a view computes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// View name.
    pub name: String,
    /// Calculation configurations.
    pub configurations: Vec<CalculationConfiguration>,
    /// Dump caches when each cycle of this view is released.
    #[serde(default)]
    pub dump_caches: bool,
}

impl ViewDefinition {
    /// Create a view with no configurations.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configurations: Vec::new(),
            dump_caches: false,
        }
    }

    /// Add a configuration.
    pub fn with_configuration(mut self, configuration: CalculationConfiguration) -> Self {
        self.configurations.push(configuration);
        self
    }

    /// Dump caches on release.
    pub fn with_cache_dumps(mut self) -> Self {
        self.dump_caches = true;
        self
    }
}

#[derive(Debug)]
struct CompiledConfiguration {
    configuration: CalculationConfiguration,
    graph: Arc<DependencyGraph>,
}

/// A view with one finalized graph per configuration.
///
/// Shared by every cycle of the view; cycles compare compiled views by
/// pointer to decide whether delta reuse applies.
#[derive(Debug)]
pub struct CompiledViewDefinition {
    name: String,
    dump_caches: bool,
    configurations: BTreeMap<String, CompiledConfiguration>,
}

impl CompiledViewDefinition {
    /// View name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if cycles should dump their caches on release.
    pub fn dump_caches(&self) -> bool {
        self.dump_caches
    }

    /// Configuration names, sorted.
    pub fn configuration_names(&self) -> impl Iterator<Item = &str> {
        self.configurations.keys().map(String::as_str)
    }

    /// The configuration called `name`.
    pub fn configuration(&self, name: &str) -> Option<&CalculationConfiguration> {
        self.configurations.get(name).map(|c| &c.configuration)
    }

    /// Graph of the configuration called `name`.
    pub fn graph(&self, name: &str) -> Option<&Arc<DependencyGraph>> {
        self.configurations.get(name).map(|c| &c.graph)
    }

    /// Every graph with its configuration name.
    pub fn graphs(&self) -> impl Iterator<Item = (&str, &Arc<DependencyGraph>)> {
        self.configurations
            .iter()
            .map(|(name, c)| (name.as_str(), &c.graph))
    }

    /// Union of every configuration's market data requirements, sorted.
    pub fn market_data_requirements(&self) -> Vec<ValueSpecification> {
        let mut specs: Vec<ValueSpecification> = self
            .configurations
            .values()
            .flat_map(|c| c.graph.market_data_requirements())
            .collect();
        specs.sort();
        specs.dedup();
        specs
    }
}

/// Compiles view definitions against an engine's collaborators.
pub struct ViewCompiler {
    engine: EngineContext,
}

impl ViewCompiler {
    /// Create a compiler.
    pub fn new(engine: EngineContext) -> Self {
        Self { engine }
    }

    /// Build every configuration's graph.
    ///
    /// Fails on the first configuration with an unresolvable requirement.
    pub fn compile(&self, view: &ViewDefinition) -> Result<CompiledViewDefinition, GraphBuildError> {
        let mut configurations = BTreeMap::new();
        for configuration in &view.configurations {
            let builder = DependencyGraphBuilder::new(
                configuration.name.clone(),
                self.engine.graph_building_context(),
                self.engine.collapser().cloned(),
            );
            builder.add_targets(configuration.requirements.iter().cloned());
            let graph = builder.build()?;
            configurations.insert(
                configuration.name.clone(),
                CompiledConfiguration {
                    configuration: configuration.clone(),
                    graph: Arc::new(graph),
                },
            );
        }
        info!(
            view = %view.name,
            configurations = configurations.len(),
            "view compiled"
        );
        Ok(CompiledViewDefinition {
            name: view.name.clone(),
            dump_caches: view.dump_caches,
            configurations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TargetSpec;

    #[test]
    fn test_market_data_shift_property() {
        let config = CalculationConfiguration::new("Bumped")
            .with_default_properties(ValueProperties::none().with(MARKET_DATA_SHIFT, "*1.01"));
        assert_eq!(config.market_data_shift(), Some("*1.01"));
        assert_eq!(CalculationConfiguration::new("Base").market_data_shift(), None);
    }

    #[test]
    fn test_view_builder() {
        let view = ViewDefinition::new("Risk")
            .with_configuration(
                CalculationConfiguration::new("Default")
                    .with_requirement(ValueRequirement::new("PV", TargetSpec::new("SECURITY", "T"))),
            )
            .with_cache_dumps();
        assert!(view.dump_caches);
        assert_eq!(view.configurations[0].requirements.len(), 1);
    }
}
