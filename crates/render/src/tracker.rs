//! Dual-channel job tracking.
//!
//! [`JobTracker::track`] spawns one task per job. The task subscribes to
//! the push channel right away and starts polling the status endpoint
//! when no push message arrived within the grace window, or as soon as
//! the push channel fails. A slow subscription never holds polling back.
//!
//! When the resilient client gives up on a poll, the job fails locally
//! unless push has already delivered for it; in that case polling pauses
//! for `poll_resume_delay` and the push channel carries the job.
//!
//! Both channels feed [`JobState::apply`], so the state only ever moves
//! to newer sequence numbers regardless of which channel delivered them.
//!
//! Callers observe snapshots through a [`watch`] receiver on the
//! returned [`JobHandle`].

use std::sync::Arc;
use std::time::Duration;

use atelier_core::job::{ApplyOutcome, Channel, JobFailure, JobState, JobUpdate};
use atelier_core::types::JobId;
use atelier_core::CoreError;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, RenderApi};
use crate::backoff::RetryConfig;
use crate::messages::{JobStatusPayload, SequenceResolver};
use crate::push::{PushChannel, PushError, PushStream};

/// Default wait for a first push message before polling starts.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(3);

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls are never scheduled closer together than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for intervals derived from an estimated duration.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default pause after polling gives up while push is still delivering.
pub const DEFAULT_POLL_RESUME_DELAY: Duration = Duration::from_secs(30);

/// Fraction of the estimated remaining time waited between polls.
const REMAINING_WORK_DIVISOR: u32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub grace_window: Duration,
    /// Interval used when no duration estimate is configured.
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Expected total render time; when set, the poll interval follows
    /// the estimated remaining work.
    pub estimated_duration: Option<Duration>,
    /// Retry policy for status polls; `None` uses the client default.
    pub poll_retry: Option<RetryConfig>,
    /// Pause before polling again after the client gave up on a poll.
    pub poll_resume_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_poll_interval: MIN_POLL_INTERVAL,
            max_poll_interval: MAX_POLL_INTERVAL,
            estimated_duration: None,
            poll_retry: None,
            poll_resume_delay: DEFAULT_POLL_RESUME_DELAY,
        }
    }
}

/// Delay until the next poll for a job at `progress_pct`.
///
/// Without an estimate this is `poll_interval`. With one, it is a quarter
/// of the estimated remaining time, kept within
/// `[min_poll_interval, max_poll_interval]`.
pub fn poll_interval(config: &TrackerConfig, progress_pct: u8) -> Duration {
    let floor = config.min_poll_interval;
    match config.estimated_duration {
        None => config.poll_interval.max(floor),
        Some(estimate) => {
            let remaining_pct = 100 - u32::from(progress_pct.min(100));
            let remaining = estimate * remaining_pct / 100;
            let ceiling = config.max_poll_interval.max(floor);
            (remaining / REMAINING_WORK_DIVISOR).clamp(floor, ceiling)
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Spawns tracking tasks. Cheap to clone.
#[derive(Clone)]
pub struct JobTracker {
    api: RenderApi,
    push: Arc<dyn PushChannel>,
    config: TrackerConfig,
}

impl JobTracker {
    pub fn new(api: RenderApi, push: Arc<dyn PushChannel>, config: TrackerConfig) -> Self {
        Self { api, push, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start tracking a submitted job. Must be called inside a Tokio
    /// runtime.
    pub fn track(&self, job_id: impl Into<JobId>) -> JobHandle {
        let job_id = job_id.into();
        let (state_tx, state_rx) = watch::channel(JobState::submitted(job_id.clone()));
        let cancel = CancellationToken::new();

        let task = TrackingTask {
            job_id: job_id.clone(),
            api: self.api.clone(),
            push: Arc::clone(&self.push),
            config: self.config.clone(),
            state_tx,
            cancel: cancel.clone(),
        };
        let task_handle = tokio::spawn(task.run());

        JobHandle {
            job_id,
            state_rx,
            cancel,
            task_handle,
        }
    }
}

/// Caller side of one tracked job. Dropping the handle stops tracking.
pub struct JobHandle {
    job_id: JobId,
    state_rx: watch::Receiver<JobState>,
    cancel: CancellationToken,
    task_handle: tokio::task::JoinHandle<()>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Current state.
    pub fn snapshot(&self) -> JobState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }

    /// Stop tracking and mark the job cancelled locally. The service is
    /// not contacted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the tracking task has exited.
    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }

    /// Wait until the job reaches a terminal phase and return that state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_terminal() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tracking task
// ---------------------------------------------------------------------------

type PollFuture = BoxFuture<'static, Result<JobStatusPayload, ApiError>>;
type SubscribeFuture = BoxFuture<'static, Result<PushStream, PushError>>;

struct TrackingTask {
    job_id: JobId,
    api: RenderApi,
    push: Arc<dyn PushChannel>,
    config: TrackerConfig,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
}

/// What the loop should do after handling an event.
enum Flow {
    Continue,
    Stop,
}

impl TrackingTask {
    async fn run(self) {
        let job_id = self.job_id.clone();
        tracing::info!(job_id = %job_id, "Tracking job");

        let mut state = JobState::submitted(job_id.clone());
        let mut ordering = SequenceResolver::default();

        let grace = tokio::time::sleep(self.config.grace_window);
        tokio::pin!(grace);

        let mut subscribing = Some(self.start_subscribe());
        let mut push: Option<PushStream> = None;
        let mut grace_pending = true;
        let mut push_seen = false;
        let mut polling = false;
        let mut next_poll = Instant::now();
        let mut in_flight: Option<PollFuture> = None;

        loop {
            let poll_due = polling && in_flight.is_none();

            let flow = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.cancel_locally(&mut state);
                    Flow::Stop
                }

                result = pending_subscribe(&mut subscribing), if subscribing.is_some() => {
                    subscribing = None;
                    match result {
                        Ok(stream) => {
                            tracing::debug!(job_id = %job_id, "Push subscription ready");
                            push = Some(stream);
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, error = %e, "Push subscription failed, polling instead");
                            start_polling_now(&mut polling, &mut next_poll);
                        }
                    }
                    Flow::Continue
                }

                item = next_push(&mut push), if push.is_some() => match item {
                    Some(Ok(payload)) => {
                        push_seen = true;
                        self.apply(&mut state, &mut ordering, Channel::Push, payload)
                    }
                    Some(Err(PushError::Connection(e) | PushError::Protocol(e))) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Push channel failed");
                        push = None;
                        start_polling_now(&mut polling, &mut next_poll);
                        Flow::Continue
                    }
                    None => {
                        tracing::info!(job_id = %job_id, "Push channel closed");
                        push = None;
                        start_polling_now(&mut polling, &mut next_poll);
                        Flow::Continue
                    }
                },

                _ = &mut grace, if grace_pending => {
                    grace_pending = false;
                    if !push_seen && !polling {
                        tracing::info!(
                            job_id = %job_id,
                            grace_ms = self.config.grace_window.as_millis() as u64,
                            "No push message within grace window, polling",
                        );
                        start_polling_now(&mut polling, &mut next_poll);
                    }
                    Flow::Continue
                }

                _ = tokio::time::sleep_until(next_poll), if poll_due => {
                    in_flight = Some(self.start_poll());
                    Flow::Continue
                }

                result = poll_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match result {
                        Ok(payload) => {
                            let flow = self.apply(&mut state, &mut ordering, Channel::Poll, payload);
                            next_poll = Instant::now() + poll_interval(&self.config, state.progress_pct);
                            flow
                        }
                        Err(e) if push_seen && push.is_some() => {
                            tracing::warn!(
                                job_id = %job_id,
                                error = %e,
                                resume_ms = self.config.poll_resume_delay.as_millis() as u64,
                                "Polling gave up, relying on push channel",
                            );
                            next_poll = Instant::now() + self.config.poll_resume_delay;
                            Flow::Continue
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job_id, error = %e, "Polling gave up and push channel is silent");
                            let err = CoreError::from(e);
                            self.fail_locally(&mut state, err);
                            Flow::Stop
                        }
                    }
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        tracing::info!(job_id = %job_id, phase = ?state.phase, "Tracking finished");
    }

    fn start_subscribe(&self) -> SubscribeFuture {
        let push = Arc::clone(&self.push);
        let job_id = self.job_id.clone();
        async move { push.subscribe(&job_id).await }.boxed()
    }

    fn start_poll(&self) -> PollFuture {
        let api = self.api.clone();
        let job_id = self.job_id.clone();
        let retry = self.config.poll_retry.clone();
        async move { api.job_status(&job_id, retry.as_ref()).await }.boxed()
    }

    fn apply(
        &self,
        state: &mut JobState,
        ordering: &mut SequenceResolver,
        channel: Channel,
        payload: JobStatusPayload,
    ) -> Flow {
        if let Some(other) = payload.job_id.as_deref() {
            if other != self.job_id {
                tracing::warn!(job_id = %self.job_id, other, "Ignoring update for another job");
                return Flow::Continue;
            }
        }

        let sequence = ordering.resolve(&payload, state.sequence + 1);
        let update = JobUpdate {
            sequence,
            ..payload.into_update(sequence)
        };
        match state.apply(channel, update) {
            ApplyOutcome::Applied => {
                tracing::debug!(
                    job_id = %self.job_id,
                    %channel,
                    sequence,
                    progress = state.progress_pct,
                    "Job update applied",
                );
                self.publish(state);
            }
            ApplyOutcome::Stale => {
                tracing::debug!(job_id = %self.job_id, %channel, sequence, "Stale job update ignored");
            }
            ApplyOutcome::Terminal => {}
        }

        if state.is_terminal() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn cancel_locally(&self, state: &mut JobState) {
        if state.cancel_locally() {
            tracing::info!(job_id = %self.job_id, "Job cancelled by caller");
            self.publish(state);
        }
    }

    fn fail_locally(&self, state: &mut JobState, err: CoreError) {
        let reason = JobFailure::Transport {
            kind: err.kind(),
            message: err.to_string(),
        };
        if state.fail_locally(reason) {
            self.publish(state);
        }
    }

    fn publish(&self, state: &JobState) {
        self.state_tx.send_replace(state.clone());
    }
}

/// Poll as soon as nothing is in flight, keeping an earlier schedule.
fn start_polling_now(polling: &mut bool, next_poll: &mut Instant) {
    *polling = true;
    *next_poll = (*next_poll).min(Instant::now());
}

async fn pending_subscribe(
    subscribing: &mut Option<SubscribeFuture>,
) -> Result<PushStream, PushError> {
    match subscribing {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_push(push: &mut Option<PushStream>) -> Option<Result<JobStatusPayload, PushError>> {
    match push {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_in_flight(in_flight: &mut Option<PollFuture>) -> Result<JobStatusPayload, ApiError> {
    match in_flight {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_without_estimate() {
        let config = TrackerConfig::default();
        assert_eq!(poll_interval(&config, 0), Duration::from_secs(2));
        assert_eq!(poll_interval(&config, 90), Duration::from_secs(2));
    }

    #[test]
    fn fixed_interval_respects_floor() {
        let config = TrackerConfig {
            poll_interval: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(poll_interval(&config, 0), MIN_POLL_INTERVAL);
    }

    #[test]
    fn estimated_interval_shrinks_with_progress() {
        let config = TrackerConfig {
            estimated_duration: Some(Duration::from_secs(20)),
            ..Default::default()
        };
        assert_eq!(poll_interval(&config, 0), Duration::from_secs(5));
        assert_eq!(poll_interval(&config, 50), Duration::from_millis(2_500));
        assert_eq!(poll_interval(&config, 95), MIN_POLL_INTERVAL);
        assert_eq!(poll_interval(&config, 100), MIN_POLL_INTERVAL);
    }

    #[test]
    fn estimated_interval_is_capped() {
        let config = TrackerConfig {
            estimated_duration: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        assert_eq!(poll_interval(&config, 0), MAX_POLL_INTERVAL);
    }
}
