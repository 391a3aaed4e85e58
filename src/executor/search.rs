//! The search verb: delegation to the semantic search collaborators.

use crate::{
    error::{CommandError, ErrorKind},
    executor::{Executor, Outcome},
    scanner::Command,
};

impl Executor {
    pub(crate) async fn handle_search(&self, command: &Command) -> Outcome {
        let Some(engine) = &self.search else {
            return Outcome::failure(CommandError::new(
                ErrorKind::SearchDisabled,
                "semantic search is not configured",
            ));
        };

        match engine.search(command.argument()).await {
            Ok(report) => {
                let detail = format!(
                    "hits:{},duration:{:.2}s",
                    report.hits.len(),
                    report.duration.as_secs_f64()
                );
                let hits = report.hits.len();
                Outcome::success(report.format(), detail).with_search_hits(hits)
            }
            Err(e) => Outcome::failure(CommandError::wrap(ErrorKind::SearchFailed, &e)),
        }
    }
}
