use crate::graph::Graph;
use std::collections::BTreeMap;

/// Combines the values of sibling instances into their shared parent's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    SimpleSum,
    SimpleAverage,
    WeightedAverage,
}

/// Splits a parent instance's value across its children of a target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disaggregator {
    DistributeUniformly,
    DistributeIdentically,
    DistributeByArea,
}

impl Aggregator {
    pub const DEFAULT: Aggregator = Aggregator::SimpleSum;

    pub fn name(&self) -> &'static str {
        match self {
            Aggregator::SimpleSum => "simple_sum",
            Aggregator::SimpleAverage => "simple_average",
            Aggregator::WeightedAverage => "weighted_average",
        }
    }

    /// Fold one group of `(instance, value)` pairs, all sharing `parent` at
    /// the next-coarser kind, into the parent's value.
    pub fn apply(&self, instances: &Graph, parent: &str, group: &[(String, f64)]) -> f64 {
        match self {
            Aggregator::SimpleSum => group.iter().map(|(_, v)| v).sum(),
            // Averages over the values actually present in the group.
            Aggregator::SimpleAverage => {
                if group.is_empty() {
                    0.0
                } else {
                    group.iter().map(|(_, v)| v).sum::<f64>() / group.len() as f64
                }
            }
            Aggregator::WeightedAverage => {
                let weighted: f64 = group
                    .iter()
                    .map(|(id, v)| v * instances.area(id).unwrap_or(0.0))
                    .sum();
                let denominator = match instances.area(parent) {
                    Some(area) if area > 0.0 => area,
                    // Parent area unknown: weigh against the group itself.
                    _ => group
                        .iter()
                        .map(|(id, _)| instances.area(id).unwrap_or(0.0))
                        .sum(),
                };
                if denominator > 0.0 {
                    weighted / denominator
                } else {
                    0.0
                }
            }
        }
    }
}

impl Disaggregator {
    pub const DEFAULT: Disaggregator = Disaggregator::DistributeByArea;

    pub fn name(&self) -> &'static str {
        match self {
            Disaggregator::DistributeUniformly => "distribute_uniformly",
            Disaggregator::DistributeIdentically => "distribute_identically",
            Disaggregator::DistributeByArea => "distribute_by_area",
        }
    }

    /// Split `value` held by `parent` across its children of kind `kind`.
    /// A parent absent from the instance graph, or one with no qualifying
    /// children, yields an empty map.
    pub fn apply(
        &self,
        instances: &Graph,
        value: f64,
        parent: &str,
        kind: &str,
    ) -> BTreeMap<String, f64> {
        if !instances.contains(parent) {
            tracing::error!(instance = %parent, "instance not in instance graph");
            return BTreeMap::new();
        }
        let children: Vec<_> = instances.children_of_kind(parent, kind).collect();
        if children.is_empty() {
            tracing::warn!(instance = %parent, %kind, "no children of kind to distribute over");
            return BTreeMap::new();
        }

        match self {
            Disaggregator::DistributeUniformly => {
                let share = value / children.len() as f64;
                children.iter().map(|c| (c.id.clone(), share)).collect()
            }
            Disaggregator::DistributeIdentically => {
                children.iter().map(|c| (c.id.clone(), value)).collect()
            }
            Disaggregator::DistributeByArea => {
                let denominator = match instances.area(parent) {
                    Some(area) if area > 0.0 => area,
                    _ => children.iter().filter_map(|c| c.area).sum(),
                };
                if denominator <= 0.0 {
                    tracing::warn!(instance = %parent, %kind, "no usable area to distribute by");
                    return BTreeMap::new();
                }
                children
                    .iter()
                    .map(|c| (c.id.clone(), value * c.area.unwrap_or(0.0) / denominator))
                    .collect()
            }
        }
    }
}

/// Maps wire-format function names to the built-in function kinds.
/// Schema hints and abstract-edge overrides are resolved through this.
#[derive(Debug, Clone)]
pub struct Registry {
    aggregators: BTreeMap<String, Aggregator>,
    disaggregators: BTreeMap<String, Disaggregator>,
}

impl Default for Registry {
    fn default() -> Self {
        let aggregators = [
            Aggregator::SimpleSum,
            Aggregator::SimpleAverage,
            Aggregator::WeightedAverage,
        ]
        .into_iter()
        .map(|a| (a.name().to_string(), a))
        .collect();
        let disaggregators = [
            Disaggregator::DistributeUniformly,
            Disaggregator::DistributeIdentically,
            Disaggregator::DistributeByArea,
        ]
        .into_iter()
        .map(|d| (d.name().to_string(), d))
        .collect();
        Self {
            aggregators,
            disaggregators,
        }
    }
}

impl Registry {
    /// Resolve an aggregator name. Unknown names resolve to None so the
    /// caller can continue down its fallback chain.
    pub fn aggregator(&self, name: &str) -> Option<Aggregator> {
        self.aggregators.get(name).copied()
    }

    pub fn disaggregator(&self, name: &str) -> Option<Disaggregator> {
        self.disaggregators.get(name).copied()
    }

    /// Register an alias for an existing aggregator kind.
    pub fn alias_aggregator(&mut self, name: impl Into<String>, agg: Aggregator) {
        self.aggregators.insert(name.into(), agg);
    }

    pub fn alias_disaggregator(&mut self, name: impl Into<String>, dagg: Disaggregator) {
        self.disaggregators.insert(name.into(), dagg);
    }
}
