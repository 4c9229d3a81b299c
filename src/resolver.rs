//! Startup ordering over the service dependency graph.
use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::{config::Context, error::OrchestratorError};

/// Dependency-respecting order in which to start a set of services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPlan {
    order: Vec<String>,
}

impl StartupPlan {
    /// Service names, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Number of services in the plan.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the plan starts nothing.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates over service names in start order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

/// Kahn's algorithm over the subgraph induced by a member set.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Computes the startup order for `members`.
    ///
    /// Only dependencies that are themselves members contribute edges. Among
    /// services that are ready at the same time, the one declared first in
    /// `members` goes first. Duplicate members keep their first position.
    pub fn resolve(
        members: &[String],
        context: &Context,
    ) -> Result<StartupPlan, OrchestratorError> {
        let mut nodes: Vec<&str> = Vec::with_capacity(members.len());
        let mut position: HashMap<&str, usize> = HashMap::new();
        for member in members {
            context.service(member)?;
            if !position.contains_key(member.as_str()) {
                position.insert(member.as_str(), nodes.len());
                nodes.push(member.as_str());
            }
        }

        let mut in_degree = vec![0usize; nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for (idx, name) in nodes.iter().enumerate() {
            let definition = context.service(name)?;
            let mut seen = BTreeSet::new();
            for dependency in &definition.dependencies {
                let Some(&dep_idx) = position.get(dependency.as_str()) else {
                    continue;
                };
                if seen.insert(dep_idx) {
                    in_degree[idx] += 1;
                    dependents[dep_idx].push(idx);
                }
            }
        }

        // Ordered by declaration index so ties resolve deterministically.
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(idx) = ready.pop_first() {
            order.push(nodes[idx].to_string());
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < nodes.len() {
            let services: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(idx, _)| nodes[idx].to_string())
                .collect();
            return Err(OrchestratorError::DependencyCycle { services });
        }

        debug!("Resolved startup plan: {}", order.join(" -> "));
        Ok(StartupPlan { order })
    }
}
