use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::analytics::analytics_models::EvaluationRecord;
use crate::flags::flag_matching::EvaluationOutcome;
use crate::flags::flag_models::Flag;
use crate::metrics_consts::{
    RECORDER_DROPPED_COUNTER, RECORDER_ENQUEUED_COUNTER, RECORDER_WRITE_ERRORS_COUNTER,
};
use crate::metrics_utils::inc;
use crate::store::EvaluationStore;

/// Fire-and-forget sink for evaluation outcomes.
///
/// `record` never waits: records go onto a bounded queue drained by a single worker task
/// that appends them to the store. A full queue or a failed write loses the record, which
/// is logged and counted but never reported to the caller.
#[derive(Clone)]
pub struct EvaluationRecorder {
    sender: mpsc::Sender<EvaluationRecord>,
}

impl EvaluationRecorder {
    /// Spawns the worker. It drains whatever is queued and exits once `shutdown` is
    /// cancelled or every recorder handle has been dropped.
    pub fn start(
        store: Arc<dyn EvaluationStore>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (recorder, receiver) = Self::channel(capacity);
        let worker = tokio::spawn(run_worker(store, receiver, shutdown));
        (recorder, worker)
    }

    fn channel(capacity: usize) -> (Self, mpsc::Receiver<EvaluationRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn record(&self, flag: &Flag, subject_id: &str, outcome: &EvaluationOutcome) {
        let record = EvaluationRecord {
            flag_id: flag.id,
            subject_id: subject_id.to_string(),
            result: outcome.result,
            reason: outcome.reason,
            matched_rule_id: outcome.matched_rule_id,
            evaluated_at: Utc::now(),
        };

        match self.sender.try_send(record) {
            Ok(()) => inc(RECORDER_ENQUEUED_COUNTER, &[], 1),
            Err(TrySendError::Full(record)) => {
                warn!(
                    flag_id = %record.flag_id,
                    "Evaluation record queue is full, dropping record"
                );
                inc(
                    RECORDER_DROPPED_COUNTER,
                    &[("cause".to_string(), "queue_full".to_string())],
                    1,
                );
            }
            Err(TrySendError::Closed(record)) => {
                warn!(
                    flag_id = %record.flag_id,
                    "Evaluation recorder is shut down, dropping record"
                );
                inc(
                    RECORDER_DROPPED_COUNTER,
                    &[("cause".to_string(), "closed".to_string())],
                    1,
                );
            }
        }
    }
}

async fn run_worker(
    store: Arc<dyn EvaluationStore>,
    mut receiver: mpsc::Receiver<EvaluationRecord>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            record = receiver.recv() => record,
            _ = shutdown.cancelled() => {
                // stop accepting, keep draining what is already queued
                receiver.close();
                receiver.recv().await
            }
        };
        let Some(record) = next else {
            break;
        };

        if let Err(e) = store.append_evaluation_record(&record).await {
            inc(RECORDER_WRITE_ERRORS_COUNTER, &[], 1);
            error!(
                flag_id = %record.flag_id,
                "Failed to persist evaluation record: {}", e
            );
        }
    }
    info!("Evaluation recorder stopped");
}
