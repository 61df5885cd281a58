use serde_json::{Map, Value, json};

use crate::models::{Payload, TaskType, WorkerKind};

/// How a stage's input is assembled from the workflow request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageInput {
    Request,
    RequestWithPrevious,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StageDescriptor {
    pub index: usize,
    pub worker: WorkerKind,
    pub input: StageInput,
    /// Advisory: higher runs earlier when stages could run concurrently.
    pub priority: i32,
}

pub fn stage_workers(mode: TaskType) -> &'static [WorkerKind] {
    match mode {
        TaskType::Scan => &[WorkerKind::Scanner],
        TaskType::Enhance => &[WorkerKind::Scanner, WorkerKind::Improver],
        TaskType::AddModules => &[WorkerKind::Generator],
        TaskType::Full => &[
            WorkerKind::Scanner,
            WorkerKind::Improver,
            WorkerKind::Generator,
        ],
    }
}

/// Ordered stage plan for `mode`. Pure: same inputs, same plan.
pub fn compose(mode: TaskType, base_priority: i32) -> Vec<StageDescriptor> {
    let workers = stage_workers(mode);
    let count = workers.len();
    workers
        .iter()
        .enumerate()
        .map(|(index, worker)| StageDescriptor {
            index,
            worker: *worker,
            input: if index == 0 {
                StageInput::Request
            } else {
                StageInput::RequestWithPrevious
            },
            priority: base_priority.saturating_add((count - index) as i32),
        })
        .collect()
}

/// Builds the payload handed to `stage`. Later stages receive the original
/// request together with every prior stage output keyed by worker name.
pub fn stage_input(
    request: &Payload,
    stage: &StageDescriptor,
    previous: &[(WorkerKind, Payload)],
) -> Payload {
    match stage.input {
        StageInput::Request => request.clone(),
        StageInput::RequestWithPrevious => {
            let mut prior = Map::new();
            for (worker, output) in previous {
                prior.insert(worker.as_str().to_string(), output.as_value().clone());
            }
            Payload::new(json!({
                "request": request.as_value(),
                "previous": Value::Object(prior),
            }))
        }
    }
}

/// Workflow result: a single stage's output verbatim, otherwise an object
/// keyed by worker name in stage order.
pub fn merge_outputs(outputs: &[(WorkerKind, Payload)]) -> Payload {
    if let [(_, only)] = outputs {
        return only.clone();
    }
    let mut merged = Map::new();
    for (worker, output) in outputs {
        merged.insert(worker.as_str().to_string(), output.as_value().clone());
    }
    Payload::new(Value::Object(merged))
}
