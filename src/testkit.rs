//! Scripted providers and helpers shared by the crate's tests.

use crate::cache::ResultCache;
use crate::frame::Frame;
use crate::language::{LanguagePair, LanguageTag};
use crate::models::{
    LoadedModel, ModelHandle, ModelKey, ModelProvisioner, ModelRegistry, Phrasebook,
    PhrasebookTranslator, ProvisionError, RegistryConfig,
};
use crate::pipeline::{PipelineConfig, PipelineServices, SinkEvent, Terminal};
use crate::stages::{
    DetectionError, LanguageCandidate, LanguageIdentifier, RecognitionError, ScriptLanguageIdentifier,
    TextBlock, TextLayerRecognizer, TextRecognizer, TranslationError, Translator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

pub fn tag(code: &str) -> LanguageTag {
    LanguageTag::parse(code).unwrap()
}

pub fn en_fr_phrasebook() -> Phrasebook {
    Phrasebook::new(
        "test-1",
        [
            ("hello", "bonjour"),
            ("welcome", "bienvenue"),
            ("exit", "sortie"),
            ("emergency exit", "sortie de secours"),
            ("thank you", "merci"),
        ],
    )
}

/// A text-layer frame holding one block of `text`.
pub fn text_frame(sequence: u64, text: &str) -> Frame {
    let json = serde_json::json!([
        { "text": text, "x": 10, "y": 10, "width": 200, "height": 30 }
    ]);
    Frame::text_layer(sequence, sequence * 33, 640, 480, &json.to_string())
}

pub fn fr_config() -> PipelineConfig {
    PipelineConfig {
        target_language: tag("fr"),
        ..PipelineConfig::default()
    }
}

pub fn services(
    recognizer: Arc<dyn TextRecognizer>,
    identifier: Arc<dyn LanguageIdentifier>,
    translator: Arc<dyn Translator>,
    provisioner: Arc<dyn ModelProvisioner>,
) -> PipelineServices {
    PipelineServices {
        recognizer,
        identifier,
        translator,
        registry: ModelRegistry::new(provisioner, RegistryConfig::default()),
        cache: Arc::new(ResultCache::new(64)),
        workers: Arc::new(Semaphore::new(4)),
    }
}

/// Built-in recognizer, identifier and translator over `provisioner`.
pub fn builtin_services(provisioner: Arc<dyn ModelProvisioner>) -> PipelineServices {
    services(
        Arc::new(TextLayerRecognizer),
        Arc::new(ScriptLanguageIdentifier),
        Arc::new(PhrasebookTranslator),
        provisioner,
    )
}

/// Next sink event, failing the test if none arrives.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a sink event")
        .expect("sink channel closed")
}

/// Events up to and including the terminal event of `frame_sequence`.
pub async fn events_through(
    rx: &mut mpsc::UnboundedReceiver<SinkEvent>,
    frame_sequence: u64,
) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(
            event,
            SinkEvent::Terminal { frame_sequence: seq, .. } if seq == frame_sequence
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Terminal events only, in delivery order.
pub fn terminals(events: &[SinkEvent]) -> Vec<(u64, Terminal)> {
    events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Terminal {
                frame_sequence,
                terminal,
            } => Some((*frame_sequence, *terminal)),
            _ => None,
        })
        .collect()
}

/// Serves an en→fr phrasebook for every key after a short delay, counting calls.
pub struct CountingProvisioner {
    attempts: AtomicUsize,
    loads: AtomicUsize,
    delay: Duration,
    footprint: usize,
    failure: Mutex<Option<ProvisionError>>,
}

impl CountingProvisioner {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            footprint: 1024,
            failure: Mutex::new(None),
        }
    }

    pub fn with_footprint(mut self, footprint: usize) -> Self {
        self.footprint = footprint;
        self
    }

    /// Make every following download fail with `error`.
    pub fn fail_with(&self, error: ProvisionError) {
        *self.failure.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvisioner for CountingProvisioner {
    async fn ensure_downloaded(&self, _key: &ModelKey) -> Result<(), ProvisionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let failure = self.failure.lock().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn load_into_memory(&self, _key: &ModelKey) -> Result<LoadedModel, ProvisionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedModel::new("test-1", self.footprint, en_fr_phrasebook()))
    }
}

/// Returns the same candidates for any text.
pub struct FixedIdentifier {
    candidates: Vec<LanguageCandidate>,
}

impl FixedIdentifier {
    pub fn new(candidates: &[(&str, f32)]) -> Self {
        Self {
            candidates: candidates
                .iter()
                .map(|(code, confidence)| LanguageCandidate::new(tag(code), *confidence))
                .collect(),
        }
    }
}

#[async_trait]
impl LanguageIdentifier for FixedIdentifier {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn identify(&self, _text: &str) -> Result<Vec<LanguageCandidate>, DetectionError> {
        Ok(self.candidates.clone())
    }
}

/// Test-side controls of a gated provider: reports each call as it
/// arrives and lets calls through one permit at a time.
pub struct Gate<T> {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedReceiver<T>,
}

fn gate_pair<T>() -> (Arc<Semaphore>, mpsc::UnboundedSender<T>, Gate<T>) {
    let gate = Arc::new(Semaphore::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    (gate.clone(), tx, Gate { gate, entered: rx })
}

async fn pass_gate(gate: &Semaphore) -> Result<(), String> {
    gate.acquire().await.map_err(|e| e.to_string())?.forget();
    Ok(())
}

impl<T> Gate<T> {
    /// Let `n` calls through.
    pub fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// The next call that reached the provider.
    pub async fn entered(&mut self) -> T {
        tokio::time::timeout(Duration::from_secs(10), self.entered.recv())
            .await
            .expect("timed out waiting for a gated call")
            .expect("gated provider dropped")
    }

    /// A call that already reached the provider, if any.
    pub fn try_entered(&mut self) -> Option<T> {
        self.entered.try_recv().ok()
    }
}

/// Holds recognitions until the test opens the gate.
pub struct GatedRecognizer {
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<u64>,
    /// Frames to hold; `None` holds every frame
    held: Option<Vec<u64>>,
}

impl GatedRecognizer {
    pub fn new() -> (Self, Gate<u64>) {
        let (gate, entered, control) = gate_pair();
        (
            Self {
                gate,
                entered,
                held: None,
            },
            control,
        )
    }

    /// Hold only the frames in `sequences`; others recognize immediately.
    pub fn holding(sequences: &[u64]) -> (Self, Gate<u64>) {
        let (mut recognizer, control) = Self::new();
        recognizer.held = Some(sequences.to_vec());
        (recognizer, control)
    }
}

#[async_trait]
impl TextRecognizer for GatedRecognizer {
    fn name(&self) -> &str {
        "gated"
    }

    async fn recognize(&self, frame: &Frame) -> Result<Vec<TextBlock>, RecognitionError> {
        let held = self
            .held
            .as_ref()
            .map_or(true, |held| held.contains(&frame.sequence()));
        if held {
            let _ = self.entered.send(frame.sequence());
            pass_gate(&self.gate).await.map_err(RecognitionError::Provider)?;
        }
        TextLayerRecognizer.recognize(frame).await
    }
}

/// Returns fixed candidates, holding each call until the test opens the gate.
pub struct GatedIdentifier {
    inner: FixedIdentifier,
    gate: Arc<Semaphore>,
    entered: mpsc::UnboundedSender<String>,
}

impl GatedIdentifier {
    pub fn new(candidates: &[(&str, f32)]) -> (Self, Gate<String>) {
        let (gate, entered, control) = gate_pair();
        (
            Self {
                inner: FixedIdentifier::new(candidates),
                gate,
                entered,
            },
            control,
        )
    }
}

#[async_trait]
impl LanguageIdentifier for GatedIdentifier {
    fn name(&self) -> &str {
        "gated"
    }

    async fn identify(&self, text: &str) -> Result<Vec<LanguageCandidate>, DetectionError> {
        let _ = self.entered.send(text.to_string());
        pass_gate(&self.gate).await.map_err(DetectionError::Provider)?;
        self.inner.identify(text).await
    }
}

/// Fails the first `failures` invocations, then translates with phrasebooks.
pub struct FlakyTranslator {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyTranslator {
    pub fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for FlakyTranslator {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn translate(
        &self,
        text: &str,
        pair: &LanguagePair,
        model: &ModelHandle,
    ) -> Result<String, TranslationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TranslationError::Invocation("model process crashed".into()));
        }
        PhrasebookTranslator.translate(text, pair, model).await
    }
}
