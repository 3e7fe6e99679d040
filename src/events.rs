use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crd::ActivityPolicy;

const REASON_EVALUATION_FAILED: &str = "EvaluationFailed";
const CONTROLLER_NAME: &str = "activity-engine";
const ERROR_TRUNCATE_CHARS: usize = 200;
const CHANNEL_CAPACITY: usize = 256;

/* ============================= WARNING SINK ============================= */

/// An evaluation failure to surface as a warning event on the owning
/// policy object.
#[derive(Debug, Clone)]
pub struct EvaluationWarning {
    pub policy_name: String,
    pub rule_index: usize,
    pub error: String,
}

/// Hot-path handle: hands warnings to the reporter task without blocking.
///
/// The channel is bounded; when the reporter falls behind, warnings are
/// dropped with a log line rather than stalling a worker.
#[derive(Clone)]
pub struct WarningSink {
    tx: mpsc::Sender<EvaluationWarning>,
}

impl WarningSink {
    pub fn emit(&self, policy_name: &str, rule_index: usize, error: impl ToString) {
        let warning = EvaluationWarning {
            policy_name: policy_name.to_string(),
            rule_index,
            error: error.to_string(),
        };
        if let Err(e) = self.tx.try_send(warning) {
            debug!(error = %e, "evaluation_warning_dropped");
        }
    }

    /// A sink with no reporter behind it; emitted warnings are dropped.
    /// Used by the preview facade and in tests.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/* ============================= REPORTER TASK ============================= */

/// Spawn the out-of-band reporter that fetches the owning policy and
/// records an `EvaluationFailed` warning event against it.
pub fn spawn_reporter(
    client: Client,
    mut shutdown: broadcast::Receiver<()>,
) -> (WarningSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EvaluationWarning>(CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("warning_reporter_stopped");
                    return;
                }
                warning = rx.recv() => {
                    let Some(warning) = warning else { return };
                    if let Err(e) = publish_warning(&client, &warning).await {
                        warn!(
                            policy = %warning.policy_name,
                            error = %e,
                            "evaluation_warning_publish_failed"
                        );
                    }
                }
            }
        }
    });

    (WarningSink { tx }, handle)
}

async fn publish_warning(client: &Client, warning: &EvaluationWarning) -> anyhow::Result<()> {
    let policies: Api<ActivityPolicy> = Api::all(client.clone());
    let policy = policies.get(&warning.policy_name).await?;

    let reporter = Reporter {
        controller: CONTROLLER_NAME.to_string(),
        instance: None,
    };
    let recorder = Recorder::new(client.clone(), reporter, policy.object_ref(&()));

    recorder
        .publish(Event {
            type_: EventType::Warning,
            reason: REASON_EVALUATION_FAILED.to_string(),
            note: Some(warning_note(warning.rule_index, &warning.error)),
            action: "Evaluate".to_string(),
            secondary: None,
        })
        .await?;

    Ok(())
}

/// `CEL evaluation failed on rule <i>: <err>` with the error capped at
/// 200 characters.
fn warning_note(rule_index: usize, error: &str) -> String {
    let truncated: String = error.chars().take(ERROR_TRUNCATE_CHARS).collect();
    format!("CEL evaluation failed on rule {rule_index}: {truncated}")
}

/* ============================= TESTS ============================= */
