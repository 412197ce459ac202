use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentflow_core::config::ExecutionConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventBus, FlowEvent};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::{Execution, StartExecution};

/// Why a poll loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEnd {
    /// The engine reported a terminal status.
    Terminal,
    /// Polling was cancelled locally.
    Cancelled,
    /// Too many consecutive poll failures.
    GaveUp { failures: u32 },
}

/// Latest known state of one tracked execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    /// Last record fetched, steps sorted by start time. `None` until the
    /// first successful poll.
    pub execution: Option<Execution>,
    pub ended: Option<PollEnd>,
}

/// Outcome of applying one fetched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    Updated,
    Finished,
}

struct TrackedRun {
    snapshot: watch::Sender<RunSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Starts remote executions and polls them to a terminal status.
///
/// Each execution gets its own poll loop and cancellation token, a child of
/// the tracker's root token. Snapshots are published on a per-execution
/// `watch` channel and as [`FlowEvent`]s on the event bus.
pub struct ExecutionTracker {
    api: Arc<dyn WorkflowApi>,
    event_bus: Arc<EventBus>,
    interval: Duration,
    max_consecutive_failures: u32,
    cancel: CancellationToken,
    runs: Mutex<HashMap<String, TrackedRun>>,
}

impl ExecutionTracker {
    pub fn new(api: Arc<dyn WorkflowApi>, event_bus: Arc<EventBus>, config: &ExecutionConfig) -> Self {
        Self {
            api,
            event_bus,
            interval: config.poll_interval(),
            max_consecutive_failures: config.max_consecutive_failures,
            cancel: CancellationToken::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Override the poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start a run of `workflow_id` and begin polling it.
    pub async fn start(
        &self,
        workflow_id: &str,
        user_id: &str,
        input: serde_json::Value,
    ) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(FlowError::TrackerShutDown);
        }
        let execution_id = self
            .api
            .start_execution(
                workflow_id,
                StartExecution {
                    user_id: user_id.to_string(),
                    input_data: input,
                },
            )
            .await?;
        info!(execution_id = %execution_id, workflow_id = %workflow_id, "Execution started");
        self.track(&execution_id).await?;
        Ok(execution_id)
    }

    /// Register an existing execution and start its poll loop. No-op when a
    /// loop for it is already running or the run already reached a terminal
    /// status. A cancelled or abandoned run is polled again from its last
    /// snapshot. Refused once the tracker is shut down.
    pub async fn track(&self, execution_id: &str) -> Result<()> {
        let mut runs = self.runs.lock().await;
        if self.cancel.is_cancelled() {
            return Err(FlowError::TrackerShutDown);
        }
        let run = runs
            .entry(execution_id.to_string())
            .or_insert_with(|| self.new_run());

        let running = run.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
        if running || run.snapshot.borrow().ended == Some(PollEnd::Terminal) {
            return Ok(());
        }
        if run.cancel.is_cancelled() {
            run.cancel = self.cancel.child_token();
        }
        run.snapshot.send_if_modified(|snap| snap.ended.take().is_some());

        let ctx = PollContext {
            execution_id: execution_id.to_string(),
            api: self.api.clone(),
            event_bus: self.event_bus.clone(),
            snapshot: run.snapshot.clone(),
            cancel: run.cancel.clone(),
            interval: self.interval,
            max_consecutive_failures: self.max_consecutive_failures,
        };
        run.task = Some(tokio::spawn(poll_loop(ctx)));
        Ok(())
    }

    /// Register an execution without a poll loop; [`poll`](Self::poll)
    /// drives it.
    pub async fn attach(&self, execution_id: &str) {
        let mut runs = self.runs.lock().await;
        runs.entry(execution_id.to_string())
            .or_insert_with(|| self.new_run());
    }

    /// Fetch the execution once and apply the result.
    pub async fn poll(&self, execution_id: &str) -> Result<Applied> {
        let sender = self.sender(execution_id).await?;
        let record = self.api.get_execution(execution_id).await?;
        Ok(apply(&self.event_bus, &sender, record))
    }

    pub async fn snapshot(&self, execution_id: &str) -> Option<RunSnapshot> {
        let runs = self.runs.lock().await;
        runs.get(execution_id).map(|r| r.snapshot.borrow().clone())
    }

    /// Receiver that observes every snapshot change of `execution_id`.
    pub async fn subscribe(&self, execution_id: &str) -> Result<watch::Receiver<RunSnapshot>> {
        Ok(self.sender(execution_id).await?.subscribe())
    }

    /// Resolve with the terminal record of `execution_id`.
    ///
    /// Fails with [`FlowError::Cancelled`] if polling is cancelled first and
    /// [`FlowError::PollExhausted`] if the loop gave up.
    pub async fn wait(&self, execution_id: &str) -> Result<Execution> {
        let mut rx = self.subscribe(execution_id).await?;
        loop {
            {
                let snap = rx.borrow_and_update();
                match (&snap.ended, &snap.execution) {
                    (Some(PollEnd::Terminal), Some(execution)) => return Ok(execution.clone()),
                    (Some(PollEnd::Cancelled), _) => return Err(FlowError::Cancelled),
                    (Some(PollEnd::GaveUp { failures }), _) => {
                        return Err(FlowError::PollExhausted {
                            execution_id: execution_id.to_string(),
                            failures: *failures,
                        })
                    }
                    _ => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(FlowError::Cancelled);
            }
        }
    }

    /// Ask the engine to stop the run. Polling continues until the engine
    /// reports a terminal status.
    pub async fn abort(&self, execution_id: &str) -> Result<()> {
        self.api.abort_execution(execution_id).await?;
        info!(execution_id = %execution_id, "Abort requested");
        if self.sender(execution_id).await.is_ok() {
            if let Err(e) = self.poll(execution_id).await {
                debug!(execution_id = %execution_id, error = %e, "Refresh after abort failed");
            }
        }
        Ok(())
    }

    /// Stop polling `execution_id` and wait for its loop to exit. The last
    /// snapshot stays readable.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let task = {
            let mut runs = self.runs.lock().await;
            let run = runs
                .get_mut(execution_id)
                .ok_or_else(|| FlowError::UntrackedExecution(execution_id.to_string()))?;
            run.cancel.cancel();
            mark_cancelled(&run.snapshot);
            run.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Drop a run and stop its loop.
    pub async fn forget(&self, execution_id: &str) {
        let removed = self.runs.lock().await.remove(execution_id);
        if let Some(run) = removed {
            run.cancel.cancel();
            if let Some(task) = run.task {
                let _ = task.await;
            }
        }
    }

    /// Cancel every poll loop and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut runs = self.runs.lock().await;
            runs.values_mut()
                .filter_map(|run| {
                    mark_cancelled(&run.snapshot);
                    run.task.take()
                })
                .collect()
        };
        let count = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        info!(loops = count, "Execution tracker shut down");
    }

    /// Ids of every tracked execution.
    pub async fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn new_run(&self) -> TrackedRun {
        let (snapshot, _) = watch::channel(RunSnapshot::default());
        TrackedRun {
            snapshot,
            cancel: self.cancel.child_token(),
            task: None,
        }
    }

    async fn sender(&self, execution_id: &str) -> Result<watch::Sender<RunSnapshot>> {
        let runs = self.runs.lock().await;
        runs.get(execution_id)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| FlowError::UntrackedExecution(execution_id.to_string()))
    }
}

struct PollContext {
    execution_id: String,
    api: Arc<dyn WorkflowApi>,
    event_bus: Arc<EventBus>,
    snapshot: watch::Sender<RunSnapshot>,
    cancel: CancellationToken,
    interval: Duration,
    max_consecutive_failures: u32,
}

/// Poll immediately, then every interval, until terminal or cancelled.
async fn poll_loop(ctx: PollContext) {
    let id = ctx.execution_id.as_str();
    let mut failures: u32 = 0;
    debug!(execution_id = %id, interval_ms = ctx.interval.as_millis() as u64, "Poll loop started");

    loop {
        let result = tokio::select! {
            r = ctx.api.get_execution(id) => r,
            _ = ctx.cancel.cancelled() => break,
        };

        match result {
            Ok(record) => {
                failures = 0;
                apply(&ctx.event_bus, &ctx.snapshot, record);
                // Also set by a concurrent `poll`, e.g. the refresh after abort.
                if ctx.snapshot.borrow().ended == Some(PollEnd::Terminal) {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                warn!(execution_id = %id, attempt = failures, error = %e, "Execution poll failed");
                ctx.event_bus.publish(FlowEvent::PollFailed {
                    execution_id: id.to_string(),
                    attempt: failures,
                    error: e.to_string(),
                });
                if ctx.max_consecutive_failures > 0 && failures >= ctx.max_consecutive_failures {
                    warn!(execution_id = %id, failures, "Giving up on execution polling");
                    ctx.snapshot.send_modify(|snap| {
                        snap.ended = Some(PollEnd::GaveUp { failures });
                    });
                    ctx.event_bus.publish(FlowEvent::error(format!(
                        "Lost track of execution {} after {} failed polls",
                        id, failures
                    )));
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.interval) => {}
            _ = ctx.cancel.cancelled() => break,
        }
    }

    if ctx.cancel.is_cancelled() {
        mark_cancelled(&ctx.snapshot);
    }
    debug!(execution_id = %id, "Poll loop stopped");
}

/// Sort the record's steps and store it. Publishes only when something
/// changed. Once a terminal record is stored, later non-terminal records are
/// late responses and are dropped.
fn apply(event_bus: &EventBus, sender: &watch::Sender<RunSnapshot>, mut record: Execution) -> Applied {
    record.sort_steps();
    let terminal = record.status.is_terminal();
    let mut outcome = Applied::Unchanged;

    sender.send_if_modified(|snap| {
        if !terminal && snap.ended == Some(PollEnd::Terminal) {
            debug!(execution_id = %record.id, status = %record.status, "Ignoring record after terminal status");
            return false;
        }
        let ended = if terminal {
            Some(PollEnd::Terminal)
        } else {
            snap.ended.clone()
        };
        if snap.execution.as_ref() == Some(&record) && snap.ended == ended {
            return false;
        }
        outcome = if terminal && snap.ended != Some(PollEnd::Terminal) {
            Applied::Finished
        } else {
            Applied::Updated
        };
        snap.execution = Some(record.clone());
        snap.ended = ended;
        true
    });

    match outcome {
        Applied::Unchanged => {}
        Applied::Updated => {
            event_bus.publish(FlowEvent::ExecutionUpdated {
                execution_id: record.id.clone(),
                status: record.status.clone(),
                steps: record.steps.len(),
            });
        }
        Applied::Finished => {
            info!(execution_id = %record.id, status = %record.status, "Execution finished");
            event_bus.publish(FlowEvent::ExecutionUpdated {
                execution_id: record.id.clone(),
                status: record.status.clone(),
                steps: record.steps.len(),
            });
            event_bus.publish(FlowEvent::ExecutionFinished {
                execution_id: record.id.clone(),
                status: record.status.clone(),
                error: record.error_message.clone(),
            });
        }
    }
    outcome
}

fn mark_cancelled(sender: &watch::Sender<RunSnapshot>) {
    sender.send_if_modified(|snap| {
        if snap.ended.is_some() {
            return false;
        }
        snap.ended = Some(PollEnd::Cancelled);
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::types::{ExecutionStep, RunStatus};
    use agentflow_test_utils::fixtures::ts;
    use agentflow_test_utils::{MockFailure, MockWorkflowApi, ScriptedPoll};

    const INTERVAL: Duration = Duration::from_secs(3);

    fn setup(max_failures: u32) -> (Arc<MockWorkflowApi>, Arc<EventBus>, ExecutionTracker) {
        let api = Arc::new(MockWorkflowApi::new());
        api.seed_workflow("w1", "u1", "Pipeline");
        let bus = Arc::new(EventBus::default());
        let config = ExecutionConfig {
            poll_interval_secs: 3,
            max_consecutive_failures: max_failures,
        };
        let tracker = ExecutionTracker::new(api.clone(), bus.clone(), &config);
        (api, bus, tracker)
    }

    fn record(status: RunStatus) -> Execution {
        Execution::new("e1", "w1", "u1", status)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal_then_stops() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::Pending)),
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Record(record(RunStatus::Completed)),
            ],
        );

        let id = tracker.start("w1", "u1", serde_json::json!({"description": "x"})).await.unwrap();
        assert_eq!(id, "e1");
        let done = tracker.wait(&id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(api.call_count("get_execution"), 3);

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(api.call_count("get_execution"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_retried_not_failed() {
        let (api, bus, tracker) = setup(0);
        let mut events = bus.subscribe();
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Fail(MockFailure::Transport("connection reset".into())),
                ScriptedPoll::Record(record(RunStatus::Completed)),
            ],
        );

        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        let done = tracker.wait("e1").await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, FlowEvent::PollFailed { attempt: 1, .. })));
        let finished: Vec<&RunStatus> = events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::ExecutionFinished { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![&RunStatus::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_is_terminal_snapshot() {
        let (api, _bus, tracker) = setup(0);
        let mut failed = record(RunStatus::Failed);
        failed.error_message = Some("Agent crashed".into());
        failed.steps = vec![{
            let mut s = ExecutionStep::new("s1", "n1", RunStatus::Failed).started(ts(1));
            s.error_message = Some("boom".into());
            s
        }];
        api.script_execution("e1", vec![ScriptedPoll::Record(failed)]);

        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        let done = tracker.wait("e1").await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("Agent crashed"));
        assert_eq!(done.steps[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_identical_reapply_emits_nothing() {
        let (api, bus, tracker) = setup(0);
        let running = record(RunStatus::InProgress)
            .with_steps(vec![ExecutionStep::new("s1", "n1", RunStatus::InProgress).started(ts(1))]);
        api.script_execution("e1", vec![ScriptedPoll::Record(running)]);
        tracker.attach("e1").await;
        let mut rx = tracker.subscribe("e1").await.unwrap();
        let mut events = bus.subscribe();

        assert_eq!(tracker.poll("e1").await.unwrap(), Applied::Updated);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        drain(&mut events);

        assert_eq!(tracker.poll("e1").await.unwrap(), Applied::Unchanged);
        assert!(!rx.has_changed().unwrap());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_steps_sorted_and_may_shrink() {
        let (api, _bus, tracker) = setup(0);
        let first = record(RunStatus::InProgress).with_steps(vec![
            ExecutionStep::new("s3", "n3", RunStatus::Pending),
            ExecutionStep::new("s2", "n2", RunStatus::InProgress).started(ts(2)),
            ExecutionStep::new("s1", "n1", RunStatus::Completed).started(ts(1)),
        ]);
        let second = record(RunStatus::InProgress).with_steps(vec![
            ExecutionStep::new("s2", "n2", RunStatus::Completed).started(ts(2)),
        ]);
        api.script_execution(
            "e1",
            vec![ScriptedPoll::Record(first), ScriptedPoll::Record(second)],
        );
        tracker.attach("e1").await;

        tracker.poll("e1").await.unwrap();
        let snap = tracker.snapshot("e1").await.unwrap();
        let ids: Vec<String> = snap.execution.unwrap().steps.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);

        tracker.poll("e1").await.unwrap();
        let snap = tracker.snapshot("e1").await.unwrap();
        let steps = snap.execution.unwrap().steps;
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, "s2");
        assert_eq!(steps[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_poll_transport_error_leaves_snapshot() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Fail(MockFailure::Transport("timeout".into())),
            ],
        );
        tracker.attach("e1").await;
        tracker.poll("e1").await.unwrap();
        let err = tracker.poll("e1").await.unwrap_err();
        assert!(matches!(err, FlowError::Transport(_)));

        let snap = tracker.snapshot("e1").await.unwrap();
        assert_eq!(snap.execution.unwrap().status, RunStatus::InProgress);
        assert!(snap.ended.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::InProgress))]);

        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        api.wait_for_calls("get_execution", 2).await;
        tracker.cancel("e1").await.unwrap();
        let polled = api.call_count("get_execution");

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(api.call_count("get_execution"), polled);
        assert!(matches!(tracker.wait("e1").await, Err(FlowError::Cancelled)));
        assert_eq!(
            tracker.snapshot("e1").await.unwrap().execution.unwrap().status,
            RunStatus::InProgress
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_executions_tracked_independently() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::InProgress))]);
        api.script_execution(
            "e2",
            vec![
                ScriptedPoll::Record(Execution::new("e2", "w1", "u1", RunStatus::InProgress)),
                ScriptedPoll::Record(Execution::new("e2", "w1", "u1", RunStatus::Completed)),
            ],
        );

        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        tracker.cancel("e1").await.unwrap();

        let done = tracker.wait("e2").await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(tracker.tracked().await, vec!["e1", "e2"]);
        assert_eq!(
            tracker.snapshot("e1").await.unwrap().ended,
            Some(PollEnd::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_failures() {
        let (api, _bus, tracker) = setup(2);
        api.script_execution(
            "e1",
            vec![ScriptedPoll::Fail(MockFailure::Transport("down".into()))],
        );
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        let err = tracker.wait("e1").await.unwrap_err();
        assert!(matches!(err, FlowError::PollExhausted { failures: 2, .. }));
        assert_eq!(api.call_count("get_execution"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_keeps_polling_until_engine_stops() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Record(record(RunStatus::Other("cancelled".into()))),
            ],
        );
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        api.wait_for_calls("get_execution", 1).await;

        tracker.abort("e1").await.unwrap();
        assert_eq!(api.aborted(), vec!["e1".to_string()]);

        let done = tracker.wait("e1").await.unwrap();
        assert_eq!(done.status, RunStatus::Other("cancelled".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_joins_all_loops() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::Pending))]);
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        tracker.shutdown().await;
        let polled = api.call_count("get_execution");
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(api.call_count("get_execution"), polled);
    }

    #[tokio::test]
    async fn test_late_record_after_terminal_is_ignored() {
        let (api, bus, tracker) = setup(0);
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::Completed)),
                ScriptedPoll::Record(record(RunStatus::InProgress)),
            ],
        );
        tracker.attach("e1").await;
        let mut events = bus.subscribe();

        assert_eq!(tracker.poll("e1").await.unwrap(), Applied::Finished);
        drain(&mut events);
        assert_eq!(tracker.poll("e1").await.unwrap(), Applied::Unchanged);
        assert!(drain(&mut events).is_empty());

        let snap = tracker.snapshot("e1").await.unwrap();
        assert_eq!(snap.ended, Some(PollEnd::Terminal));
        assert_eq!(snap.execution.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_abort_refresh_sees_terminal() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution(
            "e1",
            vec![
                ScriptedPoll::Record(record(RunStatus::InProgress)),
                ScriptedPoll::Record(record(RunStatus::Completed)),
            ],
        );
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        api.wait_for_calls("get_execution", 1).await;

        tracker.abort("e1").await.unwrap();
        assert_eq!(
            tracker.snapshot("e1").await.unwrap().ended,
            Some(PollEnd::Terminal)
        );

        tokio::time::sleep(INTERVAL * 10).await;
        assert_eq!(api.call_count("get_execution"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrack_after_cancel_resumes_polling() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::InProgress))]);
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        api.wait_for_calls("get_execution", 1).await;
        tracker.cancel("e1").await.unwrap();
        assert_eq!(
            tracker.snapshot("e1").await.unwrap().ended,
            Some(PollEnd::Cancelled)
        );

        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::Completed))]);
        tracker.track("e1").await.unwrap();
        assert_eq!(tracker.snapshot("e1").await.unwrap().ended, None);

        let done = tracker.wait("e1").await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_after_terminal_is_noop() {
        let (api, _bus, tracker) = setup(0);
        api.script_execution("e1", vec![ScriptedPoll::Record(record(RunStatus::Completed))]);
        tracker.start("w1", "u1", serde_json::json!({})).await.unwrap();
        tracker.wait("e1").await.unwrap();
        let polled = api.call_count("get_execution");

        tracker.track("e1").await.unwrap();
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(api.call_count("get_execution"), polled);
    }

    #[tokio::test]
    async fn test_track_refused_after_shutdown() {
        let (api, _bus, tracker) = setup(0);
        tracker.shutdown().await;

        assert!(matches!(
            tracker.track("e1").await,
            Err(FlowError::TrackerShutDown)
        ));
        assert!(matches!(
            tracker.start("w1", "u1", serde_json::json!({})).await,
            Err(FlowError::TrackerShutDown)
        ));
        assert_eq!(api.call_count("start_execution"), 0);
    }

    #[tokio::test]
    async fn test_untracked_execution() {
        let (_api, _bus, tracker) = setup(0);
        assert!(matches!(
            tracker.poll("nope").await,
            Err(FlowError::UntrackedExecution(_))
        ));
    }
}
