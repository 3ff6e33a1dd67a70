//! Streaming run tracking
//!
//! A task becomes a *run* on the gateway. The run is first known only by the
//! correlation id of the `chat.send` request that created it; once the
//! accepted response names a `runId`, the record is re-keyed so the stream
//! events (`agent` with `runId`) find it.
//!
//! Assistant events carry a full snapshot of the text so far, so the tracker
//! overwrites rather than appends. A lifecycle `end` or `error` completes the
//! run and hands the result back to the caller for delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{AgentEvent, AgentStream, BridgeMessage, LifecyclePhase};
use crate::sessions::SessionId;

/// Text delivered when a run ends without any assistant output
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "(no response)";

/// How many ended run ids are remembered
const RECENTLY_ENDED_CAPACITY: usize = 256;

/// Local task identifier returned to the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new unique task id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("task-{}", Uuid::new_v4()))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    /// Accepted or started, no output yet
    Started,
    /// Assistant output arriving
    Streaming,
    /// Finished (transient, the run is removed right after)
    Ended,
}

/// A tracked run
#[derive(Debug, Clone)]
pub struct Run {
    /// Local task id
    pub task_id: TaskId,
    /// Gateway run id, once known
    pub run_id: Option<String>,
    /// Session the result goes to
    ///
    /// Unset while an ad-hoc run waits to be claimed by a pending request.
    pub session_id: Option<SessionId>,
    /// Latest assistant snapshot
    pub text: String,
    /// Current phase
    pub phase: RunPhase,
    /// When the run was created
    pub started_at: Instant,
    /// Created from stream events rather than a local request
    pub ad_hoc: bool,
}

impl Run {
    fn new(task_id: TaskId, session_id: Option<SessionId>, run_id: Option<String>, ad_hoc: bool) -> Self {
        Self {
            task_id,
            run_id,
            session_id,
            text: String::new(),
            phase: RunPhase::Started,
            started_at: Instant::now(),
            ad_hoc,
        }
    }
}

/// A run that reached the end of its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    /// Local task id
    pub task_id: TaskId,
    /// Session the result goes to
    pub session_id: SessionId,
    /// Gateway run id
    pub run_id: String,
    /// Final text, or the failure message
    pub outcome: Result<String, String>,
}

impl CompletedRun {
    /// The `result` message for the owning session
    #[must_use]
    pub fn to_message(&self) -> BridgeMessage {
        match &self.outcome {
            Ok(text) => BridgeMessage::result(self.task_id.as_str(), text.as_str()),
            Err(message) => BridgeMessage::failed_result(self.task_id.as_str(), message.as_str()),
        }
    }
}

type Outcome = Result<String, String>;

/// What happened when a response tried to re-key its run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RekeyOutcome {
    /// Moved from the request id to the run id
    Rekeyed,
    /// An ad-hoc record already existed under the run id and was merged
    Merged,
    /// The run ended before the response arrived and its result was held
    /// for the request; deliver it under the request's task id
    Completed(CompletedRun),
    /// The run already ended and its result went elsewhere
    AlreadyEnded,
    /// Nothing was tracked under the request id
    NotTracked,
}

#[derive(Debug, Default)]
struct RecentlyEnded {
    order: VecDeque<String>,
    ids: HashSet<String>,
    /// Outcomes of runs that ended before any session owned them
    held: HashMap<String, Outcome>,
}

impl RecentlyEnded {
    fn insert(&mut self, run_id: String) {
        if !self.ids.insert(run_id.clone()) {
            return;
        }
        self.order.push_back(run_id);
        if self.order.len() > RECENTLY_ENDED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
                if self.held.remove(&oldest).is_some() {
                    tracing::warn!(run_id = %oldest, "Held run result evicted unclaimed");
                }
            }
        }
    }

    fn hold(&mut self, run_id: String, outcome: Outcome) {
        self.held.insert(run_id.clone(), outcome);
        self.insert(run_id);
    }

    fn take_held(&mut self, run_id: &str) -> Option<Outcome> {
        self.held.remove(run_id)
    }

    fn drain_held(&mut self) -> Vec<(String, Outcome)> {
        let order = &self.order;
        let mut held: Vec<_> = self.held.drain().collect();
        held.sort_by_key(|(run_id, _)| order.iter().position(|id| id == run_id));
        held
    }

    fn contains(&self, run_id: &str) -> bool {
        self.ids.contains(run_id)
    }
}

/// Tracks runs from acceptance to completion
#[derive(Debug)]
pub struct RunTracker {
    session_key: String,
    runs: Mutex<HashMap<String, Run>>,
    recently_ended: Mutex<RecentlyEnded>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RunTracker {
    /// Create a tracker for the gateway session `session_key`
    #[must_use]
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            runs: Mutex::new(HashMap::new()),
            recently_ended: Mutex::new(RecentlyEnded::default()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Register a provisional run under the request's correlation id
    pub fn begin(&self, request_id: &str, session_id: SessionId) -> TaskId {
        let task_id = TaskId::new();
        self.runs.lock().insert(
            request_id.to_string(),
            Run::new(task_id.clone(), Some(session_id), None, false),
        );
        task_id
    }

    /// Move the provisional run `request_id` under `run_id`
    pub fn rekey(&self, request_id: &str, run_id: &str) -> RekeyOutcome {
        let mut runs = self.runs.lock();
        let Some(mut provisional) = runs.remove(request_id) else {
            return RekeyOutcome::NotTracked;
        };

        let mut ended = self.recently_ended.lock();
        if ended.contains(run_id) {
            let held = ended.take_held(run_id);
            drop(ended);
            return match (held, provisional.session_id) {
                (Some(outcome), Some(session_id)) => {
                    tracing::debug!(request_id, run_id, "Claimed result of run that ended before its response");
                    RekeyOutcome::Completed(self.finish(provisional.task_id, session_id, run_id, outcome))
                }
                _ => {
                    tracing::warn!(
                        request_id,
                        run_id,
                        task_id = %provisional.task_id,
                        "Run ended before its response arrived"
                    );
                    RekeyOutcome::AlreadyEnded
                }
            };
        }
        drop(ended);

        provisional.run_id = Some(run_id.to_string());
        match runs.remove(run_id) {
            Some(ad_hoc) => {
                // Local identity wins, the stream's progress is kept
                provisional.text = ad_hoc.text;
                provisional.phase = ad_hoc.phase;
                runs.insert(run_id.to_string(), provisional);
                tracing::debug!(request_id, run_id, "Merged ad-hoc run into request");
                RekeyOutcome::Merged
            }
            None => {
                runs.insert(run_id.to_string(), provisional);
                tracing::debug!(request_id, run_id, "Run re-keyed");
                RekeyOutcome::Rekeyed
            }
        }
    }

    /// Drop the run tracked under `key` without completing it
    pub fn discard(&self, key: &str) -> Option<Run> {
        self.runs.lock().remove(key)
    }

    /// Apply a stream event
    ///
    /// `most_recent_session` is consulted only when a run started on our
    /// gateway session without a local request must be attached somewhere.
    /// While a `chat.send` is unanswered such a run may be that request's,
    /// so it stays unattached and its result is held for [`rekey`](Self::rekey).
    /// Returns the completed run on `end` or `error`.
    pub fn on_agent_event<F>(&self, event: &AgentEvent, most_recent_session: F) -> Option<CompletedRun>
    where
        F: FnOnce() -> Option<SessionId>,
    {
        let mut runs = self.runs.lock();

        if !runs.contains_key(&event.run_id) {
            drop(runs);
            self.try_adopt(event, most_recent_session);
            return None;
        }

        match &event.stream {
            AgentStream::Assistant { text } => {
                if let Some(run) = runs.get_mut(&event.run_id) {
                    run.text.clone_from(text);
                    run.phase = RunPhase::Streaming;
                }
                None
            }
            AgentStream::Lifecycle {
                phase: LifecyclePhase::Start,
                ..
            } => {
                if let Some(run) = runs.get_mut(&event.run_id) {
                    run.phase = RunPhase::Started;
                }
                None
            }
            AgentStream::Lifecycle {
                phase: LifecyclePhase::End,
                ..
            } => {
                let mut run = runs.remove(&event.run_id)?;
                let requests_pending = has_pending_requests(&runs);
                drop(runs);
                run.phase = RunPhase::Ended;
                self.completed.fetch_add(1, Ordering::Relaxed);
                let text = if run.text.is_empty() {
                    EMPTY_RESPONSE_PLACEHOLDER.to_string()
                } else {
                    std::mem::take(&mut run.text)
                };
                self.settle(run, &event.run_id, Ok(text), requests_pending, most_recent_session)
            }
            AgentStream::Lifecycle {
                phase: LifecyclePhase::Error,
                error,
            } => {
                let run = runs.remove(&event.run_id)?;
                let requests_pending = has_pending_requests(&runs);
                drop(runs);
                self.failed.fetch_add(1, Ordering::Relaxed);
                let message = error
                    .clone()
                    .unwrap_or_else(|| "The assistant run failed.".to_string());
                self.settle(run, &event.run_id, Err(message), requests_pending, most_recent_session)
            }
            AgentStream::Other(_) => None,
        }
    }

    fn try_adopt<F>(&self, event: &AgentEvent, most_recent_session: F)
    where
        F: FnOnce() -> Option<SessionId>,
    {
        let is_start = matches!(
            event.stream,
            AgentStream::Lifecycle {
                phase: LifecyclePhase::Start,
                ..
            }
        );
        let ours = event.session_key.as_deref() == Some(self.session_key.as_str());
        if !is_start || !ours {
            tracing::trace!(run_id = %event.run_id, "Event for untracked run ignored");
            return;
        }
        if self.recently_ended.lock().contains(&event.run_id) {
            tracing::debug!(run_id = %event.run_id, "Late start for ended run ignored");
            return;
        }

        let mut runs = self.runs.lock();
        let session_id = if has_pending_requests(&runs) {
            None
        } else {
            // TODO: attach to the session that triggered the run once the
            // gateway reports it; the most recent registration is a guess.
            let Some(session_id) = most_recent_session() else {
                tracing::debug!(run_id = %event.run_id, "Ad-hoc run with no session to attach to");
                return;
            };
            Some(session_id)
        };

        let run = Run::new(TaskId::new(), session_id, Some(event.run_id.clone()), true);
        tracing::info!(
            run_id = %event.run_id,
            task_id = %run.task_id,
            session_id = ?run.session_id,
            "Adopted ad-hoc run"
        );
        runs.entry(event.run_id.clone()).or_insert(run);
    }

    fn settle<F>(
        &self,
        run: Run,
        run_id: &str,
        outcome: Outcome,
        requests_pending: bool,
        most_recent_session: F,
    ) -> Option<CompletedRun>
    where
        F: FnOnce() -> Option<SessionId>,
    {
        let session_id = match run.session_id {
            Some(session_id) => session_id,
            None if requests_pending => {
                tracing::debug!(run_id, "Run ended unclaimed, holding result for pending request");
                self.recently_ended.lock().hold(run_id.to_string(), outcome);
                return None;
            }
            None => {
                let Some(session_id) = most_recent_session() else {
                    tracing::warn!(run_id, "Ad-hoc run ended with no session to deliver to");
                    self.recently_ended.lock().insert(run_id.to_string());
                    return None;
                };
                session_id
            }
        };
        Some(self.finish(run.task_id, session_id, run_id, outcome))
    }

    /// Deliver held results once no pending request can claim them
    ///
    /// Call after a `chat.send` settles. Held results go to the most recent
    /// session under fresh task ids, as any other ad-hoc run would.
    pub fn release_held<F>(&self, most_recent_session: F) -> Vec<CompletedRun>
    where
        F: FnOnce() -> Option<SessionId>,
    {
        if has_pending_requests(&self.runs.lock()) {
            return Vec::new();
        }
        let held = self.recently_ended.lock().drain_held();
        if held.is_empty() {
            return Vec::new();
        }
        let Some(session_id) = most_recent_session() else {
            tracing::warn!(count = held.len(), "Dropping held run results with no session");
            return Vec::new();
        };
        held.into_iter()
            .map(|(run_id, outcome)| self.finish(TaskId::new(), session_id.clone(), &run_id, outcome))
            .collect()
    }

    fn finish(
        &self,
        task_id: TaskId,
        session_id: SessionId,
        run_id: &str,
        outcome: Outcome,
    ) -> CompletedRun {
        self.recently_ended.lock().insert(run_id.to_string());
        tracing::info!(
            run_id,
            task_id = %task_id,
            session_id = %session_id,
            ok = outcome.is_ok(),
            "Run finished"
        );
        CompletedRun {
            task_id,
            session_id,
            run_id: run_id.to_string(),
            outcome,
        }
    }

    /// Drop every unfinished run
    pub fn discard_all(&self) -> usize {
        let mut runs = self.runs.lock();
        let count = runs.len();
        runs.clear();
        self.recently_ended.lock().drain_held();
        count
    }

    /// Number of unfinished runs
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.runs.lock().len()
    }

    /// Counters for stats
    #[must_use]
    pub fn metrics(&self) -> RunMetrics {
        RunMetrics {
            active: self.active_count(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Provisional runs have no run id until their response arrives
fn has_pending_requests(runs: &HashMap<String, Run>) -> bool {
    runs.values().any(|run| run.run_id.is_none())
}

/// Run tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    /// Unfinished runs
    pub active: usize,
    /// Runs that ended normally
    pub completed: u64,
    /// Runs that ended with an error
    pub failed: u64,
}
