//! The Model Router: resolves `(stage, complexity?, effort?)` to a model
//! identifier through the audited `CF_MODEL_CONFIG` table.
//!
//! Resolution for coding positions: `coder_{complexity}_{effort}`, falling
//! back to `coder_{complexity}_default`, then to `escalation_1`. Every
//! operator-driven change to the table is recorded in `CF_MODEL_CONFIG_AUDIT`
//! via [`StateStore::set_model_config`]; ordinary lookups never write an
//! audit entry.

use crate::state::{CoderEffort, Complexity, Position, SharedStateStore, StoreResult};

/// Position-keyed model resolver backed by the store's audited config table.
pub struct ModelRouter {
    store: SharedStateStore,
}

impl ModelRouter {
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// Resolves a model for a non-coding stage (planner, fixer, reviewer).
    pub fn model_for(&self, position: Position) -> StoreResult<String> {
        if let Some(model) = self.store.get_model_config(position)? {
            return Ok(model);
        }
        self.escalation_model(1)
    }

    /// Resolves a model for a coding position, applying the fallback chain.
    pub fn model_for_coder(
        &self,
        complexity: Complexity,
        effort: CoderEffort,
    ) -> StoreResult<String> {
        let specific = Position::Coder { complexity, effort };
        if let Some(model) = self.store.get_model_config(specific)? {
            return Ok(model);
        }
        let default = Position::Coder {
            complexity,
            effort: CoderEffort::Default,
        };
        if let Some(model) = self.store.get_model_config(default)? {
            return Ok(model);
        }
        self.escalation_model(1)
    }

    /// `escalationModel(level)` — level 1 or 2.
    pub fn escalation_model(&self, level: u8) -> StoreResult<String> {
        let position = match level {
            1 => Position::Escalation1,
            _ => Position::Escalation2,
        };
        Ok(self
            .store
            .get_model_config(position)?
            .unwrap_or_else(|| default_model_name(position)))
    }

    /// Operator-driven config change — appends an audit entry.
    pub fn set_model(
        &self,
        position: Position,
        new_model: &str,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        self.store.set_model_config(position, new_model, reason.map(String::from))
    }
}

fn default_model_name(position: Position) -> String {
    format!("default-{position}")
}
