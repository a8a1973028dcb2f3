use super::pass::{ErrorKind, PassContext, PassError, PassOutcome, StageSet, Terminal};
use super::sink::ResultSink;
use super::stats::{PipelineStats, PipelineStatsSnapshot};
use super::{AdmissionPolicy, PipelineConfig, PipelineError, PipelineServices};
use crate::frame::Frame;
use crate::language::{LanguageTag, SourceLanguage};
use crate::stages::{
    summarize, DetectionStage, RecognitionStage, SummarizationError, Summary, SummaryMode,
    TranslationRequest, TranslationResult, TranslationStage,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// What `submit` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    Admitted {
        frame_sequence: u64,
        /// Frame whose pass this admission cancelled
        superseded: Option<u64>,
    },
    /// Not newer than the last frame admitted for the same target
    Stale {
        frame_sequence: u64,
        last_admitted: u64,
    },
    Closed {
        frame_sequence: u64,
    },
}

/// Per-target admission state.
struct Lane {
    target: LanguageTag,
    state: Mutex<LaneState>,
    turns: Mutex<TurnQueue>,
    turn_changed: Notify,
}

#[derive(Default)]
struct LaneState {
    last_admitted: Option<u64>,
    latest: Option<(u64, CancellationToken)>,
    displayed: Option<TranslationRequest>,
}

/// FIFO order of passes within a lane. Tickets are issued at admission and
/// a pass runs only while its ticket is being served.
#[derive(Default)]
struct TurnQueue {
    next_ticket: u64,
    serving: u64,
    /// Tickets given up before their turn came
    abandoned: BTreeSet<u64>,
}

impl Lane {
    fn new(target: LanguageTag) -> Self {
        Self {
            target,
            state: Mutex::new(LaneState::default()),
            turns: Mutex::new(TurnQueue::default()),
            turn_changed: Notify::new(),
        }
    }

    fn issue_ticket(self: &Arc<Self>) -> Ticket {
        let mut turns = self.turns.lock();
        let number = turns.next_ticket;
        turns.next_ticket += 1;
        Ticket {
            lane: self.clone(),
            number,
        }
    }

    fn is_serving(&self, number: u64) -> bool {
        self.turns.lock().serving == number
    }

    /// Give up `number`, whether it was being served or still waiting.
    fn release(&self, number: u64) {
        {
            let mut guard = self.turns.lock();
            let turns = &mut *guard;
            if turns.serving == number {
                turns.serving += 1;
                while turns.abandoned.remove(&turns.serving) {
                    turns.serving += 1;
                }
            } else if number > turns.serving {
                turns.abandoned.insert(number);
            }
        }
        self.turn_changed.notify_waiters();
    }
}

/// A pass's place in its lane. Dropping it hands the turn on.
struct Ticket {
    lane: Arc<Lane>,
    number: u64,
}

impl Ticket {
    async fn wait_turn(&self) {
        loop {
            let notified = self.lane.turn_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lane.is_serving(self.number) {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.lane.release(self.number);
    }
}

type Ordered = (u64, PassOutcome);

struct Shared {
    config: PipelineConfig,
    target: RwLock<LanguageTag>,
    source: RwLock<SourceLanguage>,
    /// Last source language this session resolved, by detection or by answer
    remembered_source: RwLock<Option<LanguageTag>>,
    stages: StageSet,
    lanes: Mutex<HashMap<LanguageTag, Arc<Lane>>>,
    next_order: AtomicU64,
    outcomes: Mutex<Option<mpsc::UnboundedSender<Ordered>>>,
    tracker: TaskTracker,
    closing: CancellationToken,
    runtime: Handle,
    stats: Arc<PipelineStats>,
}

/// A frame pipeline for one camera session.
///
/// `submit` never blocks: admission happens inline and the pass runs on
/// the Tokio runtime the pipeline was created in.
pub struct Pipeline {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Must be called from inside a Tokio runtime.
    pub fn new(
        config: PipelineConfig,
        services: PipelineServices,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let stats = Arc::new(PipelineStats::default());
        let stages = StageSet {
            recognition: RecognitionStage::new(services.recognizer),
            detection: DetectionStage::new(services.identifier, config.ambiguity_margin),
            translation: TranslationStage::new(services.translator),
            registry: services.registry,
            cache: services.cache,
            workers: services.workers,
            stats: stats.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = runtime.spawn(deliver_in_order(rx, sink));

        tracing::debug!(
            target_language = %config.target_language,
            policy = ?config.admission_policy,
            "Pipeline created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                target: RwLock::new(config.target_language.clone()),
                source: RwLock::new(config.source_language.clone()),
                remembered_source: RwLock::new(None),
                config,
                stages,
                lanes: Mutex::new(HashMap::new()),
                next_order: AtomicU64::new(0),
                outcomes: Mutex::new(Some(tx)),
                tracker: TaskTracker::new(),
                closing: CancellationToken::new(),
                runtime,
                stats,
            }),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Admit `frame` for the current target language.
    pub fn submit(&self, frame: Frame) -> Admission {
        let target = self.shared.target.read().clone();
        self.submit_for(frame, target)
    }

    /// Admit `frame` for an explicit target language.
    pub fn submit_for(&self, frame: Frame, target: LanguageTag) -> Admission {
        let shared = &self.shared;
        let sequence = frame.sequence();
        shared.stats.record_submitted();

        let outcomes = match shared.outcomes.lock().clone() {
            Some(tx) if !shared.closing.is_cancelled() => tx,
            _ => {
                return Admission::Closed {
                    frame_sequence: sequence,
                }
            }
        };

        let lane = shared.lane(&target);
        let token = shared.closing.child_token();

        let (order, superseded, ticket) = {
            let mut state = lane.state.lock();
            if let Some(last) = state.last_admitted.filter(|last| sequence <= *last) {
                shared.stats.record_stale();
                tracing::debug!(frame = sequence, last_admitted = last, target = %target, "Dropping stale frame");
                return Admission::Stale {
                    frame_sequence: sequence,
                    last_admitted: last,
                };
            }
            state.last_admitted = Some(sequence);

            let previous = state.latest.replace((sequence, token.clone()));
            let superseded = match shared.config.admission_policy {
                AdmissionPolicy::LatestWins => previous.map(|(seq, token)| {
                    token.cancel();
                    seq
                }),
                AdmissionPolicy::QueueAll => None,
            };
            (
                shared.next_order.fetch_add(1, Ordering::SeqCst),
                superseded,
                lane.issue_ticket(),
            )
        };

        shared.stats.record_admitted();
        if let Some(old) = superseded {
            shared.stats.record_superseded();
            tracing::debug!(frame = sequence, superseded = old, target = %target, "Frame supersedes in-flight pass");
        }

        let pass = shared.tracker.spawn_on(
            Shared::run_admitted(shared.clone(), lane, ticket, frame, token),
            &shared.runtime,
        );
        shared.tracker.spawn_on(
            async move {
                let outcome = match pass.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(frame = sequence, error = %e, "Pass task aborted");
                        PassOutcome::cancelled(&PassContext::for_frame(sequence, target))
                    }
                };
                if outcomes.send((order, outcome)).is_err() {
                    tracing::trace!(frame = sequence, "Dispatcher gone, dropping outcome");
                }
            },
            &shared.runtime,
        );

        Admission::Admitted {
            frame_sequence: sequence,
            superseded,
        }
    }

    pub fn target_language(&self) -> LanguageTag {
        self.shared.target.read().clone()
    }

    /// Switch the target for future `submit` calls. A pass still pending
    /// for the old target is superseded.
    pub fn set_target_language(&self, target: LanguageTag) {
        let previous = std::mem::replace(&mut *self.shared.target.write(), target.clone());
        if previous == target {
            return;
        }
        if let Some(lane) = self.shared.lanes.lock().get(&previous).cloned() {
            if let Some((_, token)) = lane.state.lock().latest.take() {
                token.cancel();
            }
        }
        tracing::info!(from = %previous, to = %target, "Target language changed");
    }

    pub fn source_language(&self) -> SourceLanguage {
        self.shared.source.read().clone()
    }

    /// `Auto` detects per frame; a tag bypasses detection.
    pub fn set_source_language(&self, source: SourceLanguage) {
        *self.shared.source.write() = source;
    }

    /// Answer an ambiguous-detection prompt. The tag is used for every
    /// target of this pipeline whenever detection cannot decide, until a
    /// later pass detects a language itself.
    pub fn resolve_source_language(&self, source: LanguageTag) {
        tracing::info!(source = %source, "Source language resolved");
        *self.shared.remembered_source.write() = Some(source);
    }

    pub fn remembered_source_language(&self) -> Option<LanguageTag> {
        self.shared.remembered_source.read().clone()
    }

    /// Translate `text` directly, outside frame admission.
    pub async fn translate_text(
        &self,
        text: &str,
        source: SourceLanguage,
        target: LanguageTag,
    ) -> Result<TranslationResult, PassError> {
        let deadline = self.shared.config.per_pass_timeout();
        let timed = tokio::time::timeout(
            deadline,
            self.shared.stages.translate_text(text, &source, target.clone()),
        )
        .await;

        timed.unwrap_or_else(|_| {
            Err(PassError::new(
                ErrorKind::Timeout,
                &PassContext::for_text(text, target),
                format!("translation exceeded {}ms", deadline.as_millis()),
            ))
        })
    }

    /// Summarize `text` and translate the summary into `target`.
    ///
    /// A summary that cannot be translated is still returned, untranslated,
    /// with the reason in `translation_error`.
    pub async fn summarize_text(
        &self,
        text: &str,
        mode: SummaryMode,
        source: SourceLanguage,
        target: LanguageTag,
    ) -> Result<Summary, SummarizationError> {
        let original = summarize(text, mode)?;

        if matches!(&source, SourceLanguage::Tag(tag) if tag.same_language(&target)) {
            return Ok(Summary::untranslated(mode, original, target));
        }

        match self.translate_text(&original, source, target.clone()).await {
            Ok(result) => Ok(Summary {
                mode,
                text: result.translated_text,
                original,
                target_language: target,
                translated: true,
                translation_error: None,
            }),
            Err(error) => {
                tracing::warn!(target = %target, error = %error, "Summary translation failed, returning it untranslated");
                let mut summary = Summary::untranslated(mode, original, target);
                summary.translation_error = Some(error.to_string());
                Ok(summary)
            }
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop admitting frames, cancel pending passes, and wait for committed
    /// ones and their delivery.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closing.is_cancelled() && shared.tracker.is_closed() {
            return;
        }
        shared.closing.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;

        // Last sender gone: the dispatcher drains and exits.
        shared.outcomes.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::warn!(error = %e, "Result dispatcher ended abnormally");
            }
        }

        for lane in shared.lanes.lock().values() {
            if let Some(request) = lane.state.lock().displayed.take() {
                shared.stages.cache.unpin(&request);
            }
        }
        tracing::debug!(stats = ?shared.stats.snapshot(), "Pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.closing.cancel();
    }
}

impl Shared {
    fn lane(&self, target: &LanguageTag) -> Arc<Lane> {
        self.lanes
            .lock()
            .entry(target.clone())
            .or_insert_with(|| Arc::new(Lane::new(target.clone())))
            .clone()
    }

    async fn run_admitted(
        self: Arc<Self>,
        lane: Arc<Lane>,
        ticket: Ticket,
        frame: Frame,
        token: CancellationToken,
    ) -> PassOutcome {
        let mut context = PassContext::for_frame(frame.sequence(), lane.target.clone());

        tokio::select! {
            biased;
            _ = token.cancelled() => return self.finish(&lane, &token, PassOutcome::cancelled(&context)),
            _ = ticket.wait_turn() => {}
        }

        let source_policy = self.source.read().clone();
        let remembered = self.remembered_source.read().clone();
        let deadline = self.config.per_pass_timeout();
        let started = Instant::now();

        let timed = tokio::time::timeout(
            deadline,
            self.stages
                .run_frame(frame, &source_policy, remembered, &token, &mut context),
        )
        .await;

        let outcome = match timed {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    frame = ?context.frame_sequence,
                    target = %lane.target,
                    state = ?context.state,
                    "Pass timed out"
                );
                PassOutcome::failed(PassError::new(
                    ErrorKind::Timeout,
                    &context,
                    format!("pass exceeded {}ms", deadline.as_millis()),
                ))
            }
        };

        tracing::debug!(
            frame = outcome.sequence,
            target = %lane.target,
            terminal = ?outcome.terminal,
            duration_ms = started.elapsed().as_millis() as u64,
            "Pass finished"
        );
        let outcome = self.finish(&lane, &token, outcome);
        drop(ticket);
        outcome
    }

    /// Bookkeeping once a pass reaches its terminal state. Runs while the
    /// pass still holds its turn.
    fn finish(&self, lane: &Lane, token: &CancellationToken, outcome: PassOutcome) -> PassOutcome {
        let outcome = outcome.settle(token);
        let mut state = lane.state.lock();
        if state
            .latest
            .as_ref()
            .is_some_and(|(seq, _)| *seq == outcome.sequence)
        {
            state.latest = None;
        }

        match outcome.terminal {
            Terminal::Published => {
                self.stats.record_published();
                if let Some(source) = &outcome.detected_source {
                    *self.remembered_source.write() = Some(source.clone());
                }

                let shown = outcome.cached_request.clone();
                if let Some(request) = &shown {
                    self.stages.cache.pin(request);
                }
                if let Some(previous) = std::mem::replace(&mut state.displayed, shown) {
                    self.stages.cache.unpin(&previous);
                }
            }
            Terminal::Cancelled => self.stats.record_cancelled(),
            Terminal::AwaitingLanguage => self.stats.record_awaiting_language(),
            Terminal::Failed => {
                if outcome
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind == ErrorKind::Timeout)
                {
                    self.stats.record_timeout();
                }
                self.stats.record_failed();
            }
        }

        outcome
    }
}

/// Hand outcomes to the sink in admission order.
async fn deliver_in_order(mut rx: mpsc::UnboundedReceiver<Ordered>, sink: Arc<dyn ResultSink>) {
    let mut next = 0u64;
    let mut pending: BTreeMap<u64, PassOutcome> = BTreeMap::new();

    while let Some((order, outcome)) = rx.recv().await {
        pending.insert(order, outcome);
        while let Some(outcome) = pending.remove(&next) {
            deliver(sink.as_ref(), outcome);
            next += 1;
        }
    }

    if !pending.is_empty() {
        tracing::warn!(count = pending.len(), "Delivering outcomes after a gap in admission order");
        for outcome in pending.into_values() {
            deliver(sink.as_ref(), outcome);
        }
    }
}

fn deliver(sink: &dyn ResultSink, outcome: PassOutcome) {
    let PassOutcome {
        sequence,
        terminal,
        result,
        error,
        ..
    } = outcome;

    match (terminal, result, error) {
        (Terminal::Published, Some(result), _) => sink.on_result(sequence, result),
        (Terminal::Failed | Terminal::AwaitingLanguage, _, Some(error)) => sink.on_error(error),
        _ => {}
    }
    sink.on_pass_terminal(sequence, terminal);
}
