//! Outcome of handing a batch of rows to one handler call.

use super::{HandlerError, TaskId};

/// Result of `Handler::handle_batch`.
///
/// A batch handler owns its partial-failure semantics: it either reports the
/// batch as a whole, or lists an outcome per task id.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every row in the batch succeeded.
    Success,

    /// Every row in the batch failed with this error.
    Failure(HandlerError),

    /// Explicit per-row outcomes. Rows missing from the list are failed.
    PerRow(Vec<(TaskId, Result<(), HandlerError>)>),
}

impl BatchOutcome {
    /// Expand into one result per id, in the order of `ids`.
    pub fn into_results(self, ids: &[TaskId]) -> Vec<(TaskId, Result<(), HandlerError>)> {
        match self {
            BatchOutcome::Success => ids.iter().map(|id| (*id, Ok(()))).collect(),
            BatchOutcome::Failure(err) => ids.iter().map(|id| (*id, Err(err.clone()))).collect(),
            BatchOutcome::PerRow(results) => {
                let mut by_id: std::collections::HashMap<_, _> = results.into_iter().collect();
                ids.iter()
                    .map(|id| {
                        let result = by_id.remove(id).unwrap_or_else(|| {
                            Err(HandlerError::transient(
                                "batch handler reported no outcome for this task",
                            ))
                        });
                        (*id, result)
                    })
                    .collect()
            }
        }
    }
}
