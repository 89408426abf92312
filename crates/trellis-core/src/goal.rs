use serde::{Deserialize, Serialize};

/// A goal describing what the agent as a whole is trying to achieve.
/// Informational: it is rendered into system prompts and used for
/// progress reporting, never enforced mechanically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Weighted criteria; weights are expected to sum to 1.0.
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// A single weighted success criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Goal {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            success_criteria: vec![],
            constraints: vec![],
        }
    }

    pub fn with_criterion(mut self, id: impl Into<String>, description: impl Into<String>, weight: f64) -> Self {
        self.success_criteria.push(SuccessCriterion {
            id: id.into(),
            description: description.into(),
            weight,
        });
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Whether criterion weights sum to 1.0 within tolerance.
    pub fn weights_normalized(&self) -> bool {
        if self.success_criteria.is_empty() {
            return true;
        }
        let sum: f64 = self.success_criteria.iter().map(|c| c.weight).sum();
        (sum - 1.0).abs() < 1e-6
    }

    /// Render the goal for inclusion in a system prompt.
    pub fn render_for_prompt(&self) -> String {
        let mut out = format!("Goal: {}\n{}\n", self.name, self.description);
        if !self.success_criteria.is_empty() {
            out.push_str("Success criteria:\n");
            for c in &self.success_criteria {
                out.push_str(&format!("- {} (weight {:.2})\n", c.description, c.weight));
            }
        }
        if !self.constraints.is_empty() {
            out.push_str("Constraints:\n");
            for c in &self.constraints {
                out.push_str(&format!("- {c}\n"));
            }
        }
        out
    }
}

/// A point-in-time progress estimate against the goal, published as
/// GOAL_PROGRESS when nodes are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalProgress {
    pub goal_id: String,
    pub accepted_nodes: u32,
    pub total_nodes: u32,
}

impl GoalProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_nodes == 0 {
            return 0.0;
        }
        f64::from(self.accepted_nodes) / f64::from(self.total_nodes)
    }
}
