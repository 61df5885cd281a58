use serde::{Deserialize, Serialize};

use crate::models::ProjectId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub total_tokens_used: u64,
    pub total_cost: f64,
    pub avg_completion_time_ms: f64,
}

impl ProjectStats {
    pub fn empty(project_id: ProjectId) -> Self {
        Self {
            project_id,
            total_tasks: 0,
            successful_tasks: 0,
            total_tokens_used: 0,
            total_cost: 0.0,
            avg_completion_time_ms: 0.0,
        }
    }

    /// Folds one terminal task into the counters. The running average only
    /// covers successful tasks that reported a duration.
    pub fn apply(&mut self, delta: &StatsDelta) {
        self.total_tasks = self.total_tasks.saturating_add(1);
        self.total_tokens_used = self.total_tokens_used.saturating_add(delta.tokens);
        self.total_cost += delta.cost;

        if delta.succeeded {
            let previous = self.successful_tasks;
            self.successful_tasks = previous.saturating_add(1);
            if let Some(duration) = delta.duration_ms {
                self.avg_completion_time_ms = (self.avg_completion_time_ms * previous as f64
                    + duration as f64)
                    / self.successful_tasks as f64;
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub tokens: u64,
    pub cost: f64,
    pub duration_ms: Option<u64>,
    pub succeeded: bool,
}
