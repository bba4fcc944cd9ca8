use crate::error::Result;
use crate::graph::GraphConfig;
use crate::pattern::PatternBudget;
use crate::pool::PoolConfig;
use crate::rank::RankingConfig;
use crate::service::ServiceConfig;
use crate::tokenizer::TokenizerConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every tunable of the engine. Missing sections and fields fall back to
/// their defaults, so a config file only needs the values it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tokenizer: TokenizerConfig,
    pub graph: GraphConfig,
    pub ranking: RankingConfig,
    pub pattern: PatternBudget,
    pub service: ServiceConfig,
    pub pool: PoolConfig,
}

impl EngineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        self.graph.strategy.generator()?;
        self.ranking.validate()?;
        self.service.validate()?;
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CandidateStrategy;
    use crate::rank::Combine;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "graph": { "min_weight": 0.25, "strategy": { "kind": "min_hash", "bands": 8, "rows": 4, "seed": 1 } },
                "ranking": { "hybrid": { "kind": "multiplicative", "beta": 10.0 } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.graph.min_weight, 0.25);
        assert_eq!(cfg.graph.strategy, CandidateStrategy::MinHash { bands: 8, rows: 4, seed: 1 });
        assert_eq!(cfg.ranking.hybrid, Combine::Multiplicative { beta: 10.0 });
        assert_eq!(cfg.tokenizer, TokenizerConfig::default());
        assert_eq!(cfg.pattern, PatternBudget::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut cfg = EngineConfig::default();
        cfg.graph.min_weight = -0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "service": { "default_limit": 5 } }"#).unwrap();
        let cfg = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.service.default_limit, 5);
        assert!(EngineConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
