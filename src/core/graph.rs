//! SemanticGraph: the in-memory catalog, join-path discovery, and the
//! Build/Serve lifecycle.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::dependency::extract_dependencies;
use crate::core::model::{Metric, MetricType, Model, RelationshipType};
use crate::core::parameter::Parameter;
use crate::error::{Result, SidemanticError};

/// One hop in a join path.
#[derive(Debug, Clone)]
pub struct JoinHop {
    pub from_model: String,
    pub to_model: String,
    pub from_column: String,
    pub to_column: String,
    pub relationship: RelationshipType,
}

/// An ordered sequence of hops connecting two models.
#[derive(Debug, Clone, Default)]
pub struct JoinPath {
    pub hops: Vec<JoinHop>,
}

impl JoinPath {
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Edge {
    target: String,
    from_column: String,
    to_column: String,
    relationship: RelationshipType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Build,
    Serve,
}

/// Owns models, graph-level metrics, and parameters; resolves joins and
/// metric dependencies against them.
#[derive(Debug)]
pub struct SemanticGraph {
    models: HashMap<String, Model>,
    model_order: Vec<String>,
    metrics: HashMap<String, Metric>,
    parameters: HashMap<String, Parameter>,
    adjacency: HashMap<String, Vec<Edge>>,
    phase: Phase,
}

impl Default for SemanticGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SemanticGraph {
    pub fn new() -> Self {
        SemanticGraph {
            models: HashMap::new(),
            model_order: Vec::new(),
            metrics: HashMap::new(),
            parameters: HashMap::new(),
            adjacency: HashMap::new(),
            phase: Phase::Build,
        }
    }

    fn require_build_phase(&self) -> Result<()> {
        if self.phase == Phase::Serve {
            return Err(SidemanticError::GraphSealed);
        }
        Ok(())
    }

    /// Add a model to the graph. Auto-promotes any `time_comparison` or
    /// `conversion` metric on the model into the graph-level registry if the
    /// name isn't already taken.
    pub fn add_model(&mut self, model: Model) -> Result<()> {
        self.require_build_phase()?;
        if self.models.contains_key(&model.name) {
            return Err(SidemanticError::DuplicateName { kind: "model", name: model.name });
        }

        for metric in &model.metrics {
            if matches!(metric.r#type, MetricType::TimeComparison { .. } | MetricType::Conversion { .. })
                && !self.metrics.contains_key(&metric.name)
            {
                self.metrics.insert(metric.name.clone(), metric.clone());
            }
        }

        self.model_order.push(model.name.clone());
        self.models.insert(model.name.clone(), model);
        self.rebuild_adjacency();
        Ok(())
    }

    pub fn add_metric(&mut self, metric: Metric) -> Result<()> {
        self.require_build_phase()?;
        if self.metrics.contains_key(&metric.name) {
            return Err(SidemanticError::DuplicateName { kind: "metric", name: metric.name });
        }
        self.metrics.insert(metric.name.clone(), metric);
        Ok(())
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> Result<()> {
        self.require_build_phase()?;
        if self.parameters.contains_key(&parameter.name) {
            return Err(SidemanticError::DuplicateName { kind: "parameter", name: parameter.name });
        }
        self.parameters.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    /// Recomputes adjacency once and transitions the graph to Serve phase,
    /// forbidding further mutation until a caller explicitly unseals it.
    pub fn seal(&mut self) -> &Self {
        self.rebuild_adjacency();
        self.phase = Phase::Serve;
        self
    }

    /// Returns to the Build phase, allowing mutation again.
    pub fn unseal(&mut self) {
        self.phase = Phase::Build;
    }

    pub fn is_sealed(&self) -> bool {
        self.phase == Phase::Serve
    }

    pub fn get_model(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| SidemanticError::NotFound { kind: "model", name: name.to_string() })
    }

    pub fn get_metric(&self, name: &str) -> Result<&Metric> {
        self.metrics
            .get(name)
            .ok_or_else(|| SidemanticError::NotFound { kind: "metric", name: name.to_string() })
    }

    pub fn get_parameter(&self, name: &str) -> Result<&Parameter> {
        self.parameters
            .get(name)
            .ok_or_else(|| SidemanticError::NotFound { kind: "parameter", name: name.to_string() })
    }

    /// Models in insertion order.
    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.model_order.iter().filter_map(move |n| self.models.get(n))
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.values()
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    /// Find a metric by name, first on the named model, then at graph level.
    pub fn resolve_metric(&self, model_name: Option<&str>, name: &str) -> Option<&Metric> {
        if let Some(m) = model_name.and_then(|mn| self.models.get(mn)).and_then(|model| model.get_metric(name)) {
            return Some(m);
        }
        self.metrics.get(name)
    }

    fn rebuild_adjacency(&mut self) {
        self.adjacency.clear();
        for model in self.models.values() {
            self.adjacency.entry(model.name.clone()).or_default();
            for rel in &model.relationships {
                self.adjacency.entry(model.name.clone()).or_default().push(Edge {
                    target: rel.name.clone(),
                    from_column: rel.fk_column(),
                    to_column: rel.pk_column(),
                    relationship: rel.r#type,
                });
                self.adjacency.entry(rel.name.clone()).or_default().push(Edge {
                    target: model.name.clone(),
                    from_column: rel.pk_column(),
                    to_column: rel.fk_column(),
                    relationship: rel.r#type.inverse(),
                });
            }
        }
    }

    /// Shortest join path between two models, BFS over undirected adjacency.
    /// Empty when `from == to`. Relationship ownership/classification for
    /// each hop is resolved from the declared relationships at insertion
    /// time (see `rebuild_adjacency`); BFS iterates edges in the insertion
    /// order recorded there, which is the deterministic tie-break for
    /// self-joins and ambiguous composite keys.
    pub fn find_relationship_path(&self, from: &str, to: &str) -> Result<JoinPath> {
        if from == to {
            return Ok(JoinPath::default());
        }
        if !self.models.contains_key(from) {
            return Err(SidemanticError::NotFound { kind: "model", name: from.to_string() });
        }
        if !self.models.contains_key(to) {
            return Err(SidemanticError::NotFound { kind: "model", name: to.to_string() });
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, Vec<JoinHop>)> = VecDeque::new();
        visited.insert(from.to_string());
        queue.push_back((from.to_string(), Vec::new()));

        while let Some((current, path)) = queue.pop_front() {
            if let Some(edges) = self.adjacency.get(&current) {
                for edge in edges {
                    if visited.contains(&edge.target) {
                        continue;
                    }
                    let mut new_path = path.clone();
                    new_path.push(JoinHop {
                        from_model: current.clone(),
                        to_model: edge.target.clone(),
                        from_column: edge.from_column.clone(),
                        to_column: edge.to_column.clone(),
                        relationship: edge.relationship,
                    });
                    if edge.target == to {
                        return Ok(JoinPath { hops: new_path });
                    }
                    visited.insert(edge.target.clone());
                    queue.push_back((edge.target.clone(), new_path));
                }
            }
        }

        Err(SidemanticError::NoJoinPath { from: from.to_string(), to: to.to_string() })
    }

    /// Count of distinct one_to_many hops directly out of `base` into
    /// `others` — used by the generator's fan-out detection.
    pub fn one_to_many_fanout_count(&self, base: &str, others: &[String]) -> usize {
        let Some(edges) = self.adjacency.get(base) else { return 0 };
        others
            .iter()
            .filter(|other| {
                edges.iter().any(|e| &e.target == *other && e.relationship == RelationshipType::OneToMany)
            })
            .count()
    }

    /// Parse a qualified reference `model.field[__granularity]`.
    pub fn parse_reference(&self, reference: &str) -> Result<(String, String, Option<String>)> {
        let (model_name, field_with_gran) = reference.split_once('.').ok_or_else(|| SidemanticError::UnknownReference {
            kind: "reference",
            name: reference.to_string(),
            in_model: None,
        })?;

        let (field_name, granularity) = match field_with_gran.rfind("__") {
            Some(pos) => (field_with_gran[..pos].to_string(), Some(field_with_gran[pos + 2..].to_string())),
            None => (field_with_gran.to_string(), None),
        };

        if !self.models.contains_key(model_name) {
            return Err(SidemanticError::NotFound { kind: "model", name: model_name.to_string() });
        }

        Ok((model_name.to_string(), field_name, granularity))
    }

    /// The set of dependency references for a metric (see `dependency`
    /// module for the extraction algorithm).
    pub fn dependencies_of(&self, metric: &Metric) -> Result<Vec<String>> {
        extract_dependencies(metric, Some(self))
    }

    /// DFS cycle detection over metric-to-metric dependencies. Walks every
    /// graph-level metric and every model-scoped metric.
    pub fn validate_acyclic(&self) -> Result<()> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut rec_stack: HashSet<String> = HashSet::new();

        for metric in self.metrics.values() {
            self.visit_for_cycle(&metric.name, None, &mut visited, &mut rec_stack)?;
        }
        for model in self.models.values() {
            for metric in &model.metrics {
                let qualified = format!("{}.{}", model.name, metric.name);
                self.visit_for_cycle(&qualified, Some(&model.name), &mut visited, &mut rec_stack)?;
            }
        }
        Ok(())
    }

    fn visit_for_cycle(
        &self,
        qualified_or_bare: &str,
        model_context: Option<&str>,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Result<()> {
        if rec_stack.contains(qualified_or_bare) {
            return Err(SidemanticError::UnresolvableDependency(format!(
                "circular metric dependency involving {}",
                qualified_or_bare
            )));
        }
        if visited.contains(qualified_or_bare) {
            return Ok(());
        }
        visited.insert(qualified_or_bare.to_string());
        rec_stack.insert(qualified_or_bare.to_string());

        let (model_name, bare_name) = match qualified_or_bare.split_once('.') {
            Some((m, n)) => (Some(m), n),
            None => (model_context, qualified_or_bare),
        };

        if let Some(metric) = self.resolve_metric(model_name, bare_name) {
            for dep in self.dependencies_of(metric).unwrap_or_default() {
                self.visit_for_cycle(&dep, model_name, visited, rec_stack)?;
            }
        }

        rec_stack.remove(qualified_or_bare);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Aggregation, Dimension, DimensionType, Relationship};

    fn test_graph() -> SemanticGraph {
        let mut graph = SemanticGraph::new();

        let orders = Model::table("orders", "orders")
            .with_dimension(Dimension::new("status", DimensionType::Categorical))
            .with_dimension(Dimension::new("order_date", DimensionType::Time))
            .with_metric(Metric::new("revenue", MetricType::Aggregation { agg: Aggregation::Sum, sql: "amount".into() }))
            .with_relationship(Relationship::new("customers", RelationshipType::ManyToOne).with_foreign_key("customer_id"));

        let customers = Model::table("customers", "customers")
            .with_dimension(Dimension::new("region", DimensionType::Categorical));

        graph.add_model(orders).unwrap();
        graph.add_model(customers).unwrap();
        graph
    }

    #[test]
    fn test_add_and_get_model() {
        let graph = test_graph();
        assert!(graph.get_model("orders").is_ok());
        assert!(graph.get_model("nonexistent").is_err());
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let mut graph = test_graph();
        let err = graph.add_model(Model::table("orders", "orders")).unwrap_err();
        assert!(matches!(err, SidemanticError::DuplicateName { .. }));
    }

    #[test]
    fn test_find_relationship_path() {
        let graph = test_graph();

        let path = graph.find_relationship_path("orders", "orders").unwrap();
        assert!(path.is_empty());

        let path = graph.find_relationship_path("orders", "customers").unwrap();
        assert_eq!(path.hops.len(), 1);
        assert_eq!(path.hops[0].from_column, "customer_id");
        assert_eq!(path.hops[0].to_column, "id");
        assert_eq!(path.hops[0].relationship, RelationshipType::ManyToOne);

        let path = graph.find_relationship_path("customers", "orders").unwrap();
        assert_eq!(path.hops.len(), 1);
        assert_eq!(path.hops[0].relationship, RelationshipType::OneToMany);
    }

    #[test]
    fn test_no_join_path() {
        let mut graph = test_graph();
        graph.add_model(Model::table("isolated", "isolated")).unwrap();
        let err = graph.find_relationship_path("orders", "isolated").unwrap_err();
        assert!(matches!(err, SidemanticError::NoJoinPath { .. }));
    }

    #[test]
    fn test_parse_reference_with_granularity() {
        let graph = test_graph();
        let (model, field, gran) = graph.parse_reference("orders.order_date__month").unwrap();
        assert_eq!(model, "orders");
        assert_eq!(field, "order_date");
        assert_eq!(gran.unwrap(), "month");
    }

    #[test]
    fn test_seal_forbids_mutation() {
        let mut graph = test_graph();
        graph.seal();
        let err = graph.add_model(Model::table("extra", "extra")).unwrap_err();
        assert!(matches!(err, SidemanticError::GraphSealed));
        graph.unseal();
        assert!(graph.add_model(Model::table("extra", "extra")).is_ok());
    }

    #[test]
    fn test_fanout_count() {
        let mut graph = test_graph();
        let orders = graph.get_model("orders").unwrap().clone();
        let orders = orders.with_relationship(Relationship::new("order_items", RelationshipType::OneToMany));
        let mut graph2 = SemanticGraph::new();
        graph2.add_model(orders).unwrap();
        graph2.add_model(Model::table("order_items", "order_items")).unwrap();
        graph2.add_model(Model::table("shipments", "shipments")).unwrap();
        let count = graph2.one_to_many_fanout_count("orders", &["order_items".to_string()]);
        assert_eq!(count, 1);
    }
}
