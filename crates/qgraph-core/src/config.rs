//! Planner configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Assumed length of a list whose size cannot be derived from the plan.
    pub default_list_length: usize,

    /// Assumed number of documents in a collection or view without statistics.
    pub default_collection_count: usize,

    /// Fraction of incoming rows a FILTER is assumed to let through.
    pub filter_selectivity: f64,

    /// Fraction of a collection a non-unique index lookup is assumed to return.
    pub index_selectivity: f64,

    /// Average number of edges leaving a vertex, used by traversal estimates.
    pub traversal_fanout: usize,

    /// Whether async prefetching may be enabled on eligible nodes at all.
    pub async_prefetch: bool,

    /// Mark a call-stack split every N nodes of a linear chain (0 disables).
    pub max_nodes_per_callstack: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            default_list_length: 100,
            default_collection_count: 1000,
            filter_selectivity: 0.5,
            index_selectivity: 0.1,
            traversal_fanout: 10,
            async_prefetch: true,
            max_nodes_per_callstack: 250,
        }
    }
}

impl PlanConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `QGRAPH_DEFAULT_LIST_LENGTH`: assumed list length
    /// - `QGRAPH_DEFAULT_COLLECTION_COUNT`: assumed collection size
    /// - `QGRAPH_FILTER_SELECTIVITY`: filter pass ratio in (0, 1]
    /// - `QGRAPH_INDEX_SELECTIVITY`: index hit ratio in (0, 1]
    /// - `QGRAPH_TRAVERSAL_FANOUT`: edges per vertex
    /// - `QGRAPH_ASYNC_PREFETCH`: `true`/`false`
    /// - `QGRAPH_MAX_NODES_PER_CALLSTACK`: call-stack split spacing
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("QGRAPH_DEFAULT_LIST_LENGTH") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.default_list_length = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_DEFAULT_COLLECTION_COUNT") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.default_collection_count = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_FILTER_SELECTIVITY") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.filter_selectivity = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_INDEX_SELECTIVITY") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.index_selectivity = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_TRAVERSAL_FANOUT") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.traversal_fanout = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_ASYNC_PREFETCH") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.async_prefetch = v;
            }
        }

        if let Ok(s) = std::env::var("QGRAPH_MAX_NODES_PER_CALLSTACK") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_nodes_per_callstack = v;
            }
        }

        cfg
    }

    /// Reject values the cost model cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("filter_selectivity", self.filter_selectivity),
            ("index_selectivity", self.index_selectivity),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.traversal_fanout == 0 {
            return Err(Error::Config("traversal_fanout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PlanConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_selectivity_is_rejected() {
        let cfg = PlanConfig {
            filter_selectivity: 0.0,
            ..PlanConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
