use crate::functions::{Aggregator, Disaggregator, Registry};
use crate::graph::Graph;
use crate::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A keyed value mapping: instance id -> value, at one granularity.
pub type Series = BTreeMap<String, f64>;

/// Name of the wedge granularity formed by two unrelated granularities.
pub fn meet(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}^{hi}")
}

/// Pure translation of keyed value mappings between granularities, over a
/// shared pair of abstract and instance graphs.
#[derive(Debug, Clone)]
pub struct Translator {
    abstracts: Arc<Graph>,
    instances: Arc<Graph>,
    registry: Registry,
}

impl Translator {
    pub fn new(abstracts: Arc<Graph>, instances: Arc<Graph>) -> Self {
        Self {
            abstracts,
            instances,
            registry: Registry::default(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn abstracts(&self) -> &Graph {
        &self.abstracts
    }

    pub fn instances(&self) -> &Graph {
        &self.instances
    }

    /// Translate `data` from granularity `src` to `dest`: strictly refine,
    /// strictly coarsen, or detour through the meet granularity when the two
    /// are unrelated. `agg` and `dagg` are explicit function hints that take
    /// precedence over abstract-edge overrides and graph defaults.
    pub fn translate(
        &self,
        data: &Series,
        src: &str,
        dest: &str,
        variable: &str,
        agg: Option<&str>,
        dagg: Option<&str>,
    ) -> Result<Series, Error> {
        if src == dest {
            return Ok(data.clone());
        }
        for granularity in [src, dest] {
            if !self.abstracts.contains(granularity) {
                return Err(Error::UnknownGranularity(granularity.to_string()));
            }
        }

        if self.abstracts.has_path(src, dest) {
            self.disaggregate(data, src, dest, variable, dagg)
        } else if self.abstracts.has_path(dest, src) {
            self.aggregate(data, src, dest, variable, agg)
        } else {
            let meet = meet(src, dest);
            if self.abstracts.has_path(src, &meet) && self.abstracts.has_path(dest, &meet) {
                let refined = self.disaggregate(data, src, &meet, variable, dagg)?;
                self.aggregate(&refined, &meet, dest, variable, agg)
            } else {
                Err(Error::NoTranslationPath {
                    variable: variable.to_string(),
                    src: src.to_string(),
                    dest: dest.to_string(),
                    meet,
                })
            }
        }
    }

    /// Coarsen `data` step by step along the reversed abstract path from
    /// `dest` down to `src`, grouping instances by their unique parent at
    /// each next-coarser kind.
    pub fn aggregate(
        &self,
        data: &Series,
        src: &str,
        dest: &str,
        variable: &str,
        hint: Option<&str>,
    ) -> Result<Series, Error> {
        if src == dest {
            return Ok(data.clone());
        }
        let mut path = self
            .abstracts
            .shortest_path(dest, src)
            .ok_or_else(|| Error::NoAbstractPath {
                src: src.to_string(),
                dest: dest.to_string(),
            })?;
        path.reverse();

        let mut current = data.clone();
        for step in path.windows(2) {
            let (fine, coarse) = (&step[0], &step[1]);

            let mut groups: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
            for (instance, value) in &current {
                if !self.instances.contains(instance) {
                    tracing::error!(%instance, "instance not in instance graph");
                    continue;
                }
                match self.instances.parent_of_kind(instance, coarse)? {
                    Some(parent) => groups
                        .entry(parent.id.clone())
                        .or_default()
                        .push((instance.clone(), *value)),
                    None => {
                        tracing::warn!(%instance, kind = %coarse, "instance has no parent of kind; dropping");
                    }
                }
            }

            let function = hint
                .and_then(|name| self.registry.aggregator(name))
                .or_else(|| {
                    self.abstracts
                        .edge_aggregator(coarse, fine, variable)
                        .and_then(|name| self.registry.aggregator(name))
                })
                .unwrap_or(Aggregator::DEFAULT);

            current = groups
                .into_iter()
                .map(|(parent, group)| {
                    let value = function.apply(&self.instances, &parent, &group);
                    (parent, value)
                })
                .collect();
        }
        Ok(current)
    }

    /// Refine `data` step by step along the abstract path from `src` to
    /// `dest`. Child keys across different parents are disjoint by the
    /// containment invariant, so each step is a plain union.
    pub fn disaggregate(
        &self,
        data: &Series,
        src: &str,
        dest: &str,
        variable: &str,
        hint: Option<&str>,
    ) -> Result<Series, Error> {
        if src == dest {
            return Ok(data.clone());
        }
        let path = self
            .abstracts
            .shortest_path(src, dest)
            .ok_or_else(|| Error::NoAbstractPath {
                src: src.to_string(),
                dest: dest.to_string(),
            })?;

        let mut current = data.clone();
        for step in path.windows(2) {
            let (coarse, fine) = (&step[0], &step[1]);

            let function = hint
                .and_then(|name| self.registry.disaggregator(name))
                .or_else(|| {
                    self.abstracts
                        .edge_disaggregator(coarse, fine, variable)
                        .and_then(|name| self.registry.disaggregator(name))
                })
                .unwrap_or(Disaggregator::DEFAULT);

            let mut next = Series::new();
            for (instance, value) in &current {
                next.extend(function.apply(&self.instances, *value, instance, fine));
            }
            current = next;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    // country -> {state -> county, huc8}, with the county^huc8 wedge under both.
    fn abstracts() -> Arc<Graph> {
        Arc::new(
            Graph::from_value(json!({
                "nodes": [
                    {"id": "country"},
                    {"id": "state"},
                    {"id": "county"},
                    {"id": "huc8"},
                    {"id": "county^huc8"},
                ],
                "links": [
                    {"source": "country", "target": "state"},
                    {"source": "state", "target": "county"},
                    {"source": "country", "target": "huc8"},
                    {"source": "county", "target": "county^huc8"},
                    {"source": "huc8", "target": "county^huc8"},
                ],
            }))
            .unwrap(),
        )
    }

    // Two counties and two watersheds overlapping in three wedge slivers:
    //   c1 = c1^w1 (2 km²) + c1^w2 (2 km²)
    //   c2 = c2^w2 (6 km²)
    fn instances() -> Arc<Graph> {
        Arc::new(
            Graph::from_value(json!({
                "nodes": [
                    {"id": "us", "type": "country", "area": 10.0},
                    {"id": "tx", "type": "state", "area": 10.0},
                    {"id": "c1", "type": "county", "area": 4.0},
                    {"id": "c2", "type": "county", "area": 6.0},
                    {"id": "w1", "type": "huc8", "area": 2.0},
                    {"id": "w2", "type": "huc8", "area": 8.0},
                    {"id": "c1^w1", "type": "county^huc8", "area": 2.0},
                    {"id": "c1^w2", "type": "county^huc8", "area": 2.0},
                    {"id": "c2^w2", "type": "county^huc8", "area": 6.0},
                ],
                "links": [
                    {"source": "us", "target": "tx"},
                    {"source": "us", "target": "w1"},
                    {"source": "us", "target": "w2"},
                    {"source": "tx", "target": "c1"},
                    {"source": "tx", "target": "c2"},
                    {"source": "c1", "target": "c1^w1"},
                    {"source": "c1", "target": "c1^w2"},
                    {"source": "c2", "target": "c2^w2"},
                    {"source": "w1", "target": "c1^w1"},
                    {"source": "w2", "target": "c1^w2"},
                    {"source": "w2", "target": "c2^w2"},
                ],
            }))
            .unwrap(),
        )
    }

    fn translator() -> Translator {
        Translator::new(abstracts(), instances())
    }

    fn county_data() -> Series {
        Series::from([("c1".to_string(), 40.0), ("c2".to_string(), 60.0)])
    }

    #[test]
    fn identity() {
        let t = translator();
        let data = county_data();
        let got = t
            .translate(&data, "county", "county", "population", None, None)
            .unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn unknown_granularity_is_rejected() {
        let t = translator();
        let got = t.translate(&county_data(), "County", "state", "population", None, None);
        assert!(matches!(got, Err(Error::UnknownGranularity(g)) if g == "County"));
    }

    #[test]
    fn aggregate_counties_to_state_and_country() {
        let t = translator();
        let state = t
            .translate(&county_data(), "county", "state", "population", None, None)
            .unwrap();
        assert_eq!(state, Series::from([("tx".to_string(), 100.0)]));

        let country = t
            .translate(&county_data(), "county", "country", "population", None, None)
            .unwrap();
        assert_eq!(country, Series::from([("us".to_string(), 100.0)]));
    }

    #[test]
    fn disaggregate_state_to_county_by_area() {
        let t = translator();
        let data = Series::from([("tx".to_string(), 100.0)]);
        let got = t
            .translate(&data, "state", "county", "population", None, None)
            .unwrap();
        assert_eq!(got["c1"], 40.0);
        assert_eq!(got["c2"], 60.0);
    }

    #[test]
    fn round_trip_conserves_sum() {
        let t = translator();
        let down = t
            .translate(&county_data(), "county", "county^huc8", "population", None, None)
            .unwrap();
        let up = t
            .translate(&down, "county^huc8", "county", "population", None, None)
            .unwrap();
        let total: f64 = up.values().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn meet_names_sort_lexicographically() {
        assert_eq!(meet("huc8", "county"), "county^huc8");
        assert_eq!(meet("county", "huc8"), "county^huc8");
    }

    #[test]
    fn route_via_meet_conserves_sum() {
        // county -> huc8 has no direct abstract path either way; the
        // translation detours through county^huc8.
        let t = translator();
        let got = t
            .translate(&county_data(), "county", "huc8", "population", None, None)
            .unwrap();

        // c1's 40 splits 20/20 across its wedges; c2's 60 lands in c2^w2.
        assert_eq!(got["w1"], 20.0);
        assert_eq!(got["w2"], 80.0);
        let total: f64 = got.values().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn no_translation_path() {
        let t = Translator::new(
            Arc::new(
                Graph::from_value(json!({
                    "nodes": [{"id": "county"}, {"id": "huc8"}],
                    "links": [],
                }))
                .unwrap(),
            ),
            instances(),
        );
        let got = t.translate(&county_data(), "county", "huc8", "population", None, None);
        assert!(matches!(got, Err(Error::NoTranslationPath { meet, .. }) if meet == "county^huc8"));
    }

    #[test]
    fn unknown_instances_are_skipped() {
        let t = translator();
        let mut data = county_data();
        data.insert("zz999".to_string(), 1.0e6);

        let got = t
            .translate(&data, "county", "state", "population", None, None)
            .unwrap();
        assert_eq!(got, Series::from([("tx".to_string(), 100.0)]));
    }

    #[test]
    fn explicit_hint_overrides_default() {
        let t = translator();
        let got = t
            .translate(
                &county_data(),
                "county",
                "state",
                "population",
                Some("simple_average"),
                None,
            )
            .unwrap();
        assert_eq!(got, Series::from([("tx".to_string(), 50.0)]));
    }

    #[test]
    fn ambiguous_parent_fails_loudly() {
        let instances = Arc::new(
            Graph::from_value(json!({
                "nodes": [
                    {"id": "tx", "type": "state", "area": 5.0},
                    {"id": "ok", "type": "state", "area": 5.0},
                    {"id": "c1", "type": "county", "area": 5.0},
                ],
                "links": [
                    {"source": "tx", "target": "c1"},
                    {"source": "ok", "target": "c1"},
                ],
            }))
            .unwrap(),
        );
        let t = Translator::new(abstracts(), instances);
        let data = Series::from([("c1".to_string(), 1.0)]);
        let got = t.translate(&data, "county", "state", "population", None, None);
        assert!(matches!(got, Err(Error::AmbiguousParent { .. })));
    }
}
