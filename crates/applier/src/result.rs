use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one flush job, reconciled against the task's status by the
/// completion reaper. Row counts come from the row-key buffer, so they
/// count logical rows, not cells.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub succeeded: bool,
    pub rows_in_task: u64,
    pub per_table_rows: HashMap<String, u64>,
}

impl TaskResult {
    pub fn new(
        task_id: Uuid,
        succeeded: bool,
        rows_in_task: u64,
        per_table_rows: HashMap<String, u64>,
    ) -> Self {
        Self {
            task_id,
            succeeded,
            rows_in_task,
            per_table_rows,
        }
    }
}
