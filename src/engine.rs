//! # Engine — Generation Pipeline
//!
//! Orchestrates one generation request end to end: task row first, then the
//! upstream call(s), then history and the billable counter, then the task's
//! terminal transition.
//!
//! ## Modes
//!
//! - **Single** (`count == 1`): the task id is returned immediately and a
//!   detached worker finishes the job. Clients poll `/tasks/:id`.
//! - **Batch** (`count > 1`): a driver task fans out one worker per slot and
//!   fans their outcomes back in over a channel of capacity `count`. The
//!   driver turns them into [`BatchEvent`]s on a second channel that the HTTP
//!   layer streams as SSE.
//!
//! ## Batch ordering
//!
//! `start` precedes every `image`; `image` events follow completion order;
//! `complete` follows every `image` and lists outcomes in slot order.
//!
//! ## Disconnects
//!
//! A closed event channel never stops the workers. History and the counter
//! are written regardless of whether anyone is still listening.
//!
//! ## Panics
//!
//! Every unit of work runs in its own spawned task. A panic surfaces as a
//! `JoinError` and becomes a `task panic: ...` failure instead of a task row
//! stuck in `processing`.

use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::artifacts::{self, ArtifactStore};
use crate::config::SensitivityFilter;
use crate::db::{BatchSlot, Database, NewHistory, NewTask};
use crate::prom_metrics::Metrics;
use crate::upstream::{GenerateRequest, Part, UpstreamClient, UpstreamError};
use crate::urls::UrlRewriter;

pub const MAX_COUNT: usize = 4;
pub const ALL_FAILED_MESSAGE: &str = "所有图片生成失败";
pub const HISTORY_FAILED_MESSAGE: &str = "保存历史记录失败";

const DEFAULT_PROMPT: &str = "image";
const DEFAULT_ASPECT_RATIO: &str = "1:1";
const SMART_ASPECT_RATIO: &str = "智能";
const DEFAULT_IMAGE_SIZE: &str = "2K";

// ── Request parameters ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
    #[default]
    Create,
    WhiteBackground,
    ClothingChange,
    ProductScene,
    LightShadow,
}

impl GenerationType {
    pub const ALL: [GenerationType; 5] = [
        GenerationType::Create,
        GenerationType::WhiteBackground,
        GenerationType::ClothingChange,
        GenerationType::ProductScene,
        GenerationType::LightShadow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationType::Create => "create",
            GenerationType::WhiteBackground => "white_background",
            GenerationType::ClothingChange => "clothing_change",
            GenerationType::ProductScene => "product_scene",
            GenerationType::LightShadow => "light_shadow",
        }
    }

    /// Unknown or empty tags fall back to `create`.
    pub fn parse_lenient(s: &str) -> GenerationType {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .unwrap_or_default()
    }
}

impl std::fmt::Display for GenerationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a raw count field; anything unparsable is 1, the rest is clamped
/// to `1..=4`.
pub fn clamp_count(raw: Option<&str>) -> usize {
    let n = raw
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(1);
    n.clamp(1, MAX_COUNT as i64) as usize
}

/// Billable units for one image of `image_size`.
pub fn size_weight(image_size: &str) -> i64 {
    if image_size == "4K" {
        2
    } else {
        1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub kind: GenerationType,
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_size: String,
    pub count: usize,
}

impl GenerateParams {
    /// Apply defaults and clamping to raw form fields.
    pub fn normalise(
        kind: &str,
        prompt: &str,
        aspect_ratio: &str,
        image_size: &str,
        count: Option<&str>,
    ) -> Self {
        let prompt = if prompt.trim().is_empty() {
            DEFAULT_PROMPT.to_string()
        } else {
            prompt.to_string()
        };
        let aspect_ratio = match aspect_ratio.trim() {
            "" | SMART_ASPECT_RATIO => DEFAULT_ASPECT_RATIO.to_string(),
            other => other.to_string(),
        };
        let image_size = match image_size.trim() {
            "" => DEFAULT_IMAGE_SIZE.to_string(),
            other => other.to_string(),
        };
        GenerateParams {
            kind: GenerationType::parse_lenient(kind),
            prompt,
            aspect_ratio,
            image_size,
            count: clamp_count(count),
        }
    }

    pub fn is_batch(&self) -> bool {
        self.count > 1
    }
}

/// Where and as whom to post. Resolved once per request from the
/// credential snapshot.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub token: String,
}

/// One uploaded reference image.
#[derive(Debug, Clone)]
pub struct ReferenceUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Reference images ready for the request body, plus their stored paths.
#[derive(Debug, Clone, Default)]
pub struct PreparedReferences {
    pub parts: Vec<Part>,
    pub paths: Vec<String>,
    /// (file name, bytes) still to be written under the uploads directory
    unsaved: Vec<(String, Vec<u8>)>,
}

impl PreparedReferences {
    fn paths_json(&self) -> String {
        serde_json::to_string(&self.paths).unwrap_or_else(|_| "[]".to_string())
    }
}

// ── Batch events ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchEvent {
    Start {
        task_id: String,
        batch_id: String,
        count: usize,
        prompt: String,
        ref_images: Vec<String>,
        aspect_ratio: String,
        image_size: String,
    },
    Image {
        batch_id: String,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        completed: usize,
        total: usize,
    },
    Complete {
        status: BatchStatus,
        task_id: String,
        batch_id: String,
        images: Vec<SlotReport>,
        ref_images: Vec<String>,
        success_count: usize,
        total_count: usize,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn from_counts(successes: usize, total: usize) -> BatchStatus {
        if successes == 0 {
            BatchStatus::Failed
        } else if successes < total {
            BatchStatus::Partial
        } else {
            BatchStatus::Success
        }
    }
}

/// One slot of the final `complete` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SlotReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub index: usize,
}

/// What a batch worker hands back to the driver. `Ok` carries the relative
/// URL, `Err` the user-facing message.
#[derive(Debug)]
struct SlotOutcome {
    index: usize,
    result: std::result::Result<String, String>,
}

/// Immediate answer for single-image mode.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub status: &'static str,
    pub task_id: String,
    pub ref_images: Vec<String>,
}

/// An open batch: its ids and the event stream.
pub struct BatchHandle {
    pub task_id: String,
    pub batch_id: String,
    pub events: mpsc::Receiver<BatchEvent>,
}

// ── Engine ──────────────────────────────────────────────────────

pub struct Engine {
    db: Database,
    artifacts: ArtifactStore,
    upstream: UpstreamClient,
    filter: SensitivityFilter,
    rewriter: UrlRewriter,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(
        db: Database,
        artifacts: ArtifactStore,
        upstream: UpstreamClient,
        filter: SensitivityFilter,
        rewriter: UrlRewriter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Engine {
            db,
            artifacts,
            upstream,
            filter,
            rewriter,
            metrics,
        }
    }

    pub fn rewriter(&self) -> &UrlRewriter {
        &self.rewriter
    }

    /// Quota errors reach the user verbatim; everything else is scrubbed.
    pub fn user_message(&self, err: &UpstreamError) -> String {
        let raw = err.to_string();
        if err.is_quota() {
            raw
        } else {
            self.filter.scrub(&raw)
        }
    }

    /// Inline each upload into the request and reserve its stored name.
    /// Nothing touches the disk until the task row exists.
    pub fn prepare_references(&self, uploads: Vec<ReferenceUpload>) -> PreparedReferences {
        let mut prepared = PreparedReferences::default();
        for upload in uploads {
            let mime = artifacts::reference_mime(&upload.file_name);
            prepared.parts.push(Part::image(mime, &upload.bytes));
            let (file_name, relative) = self.artifacts.reference_name(&upload.file_name);
            prepared.paths.push(relative);
            prepared.unsaved.push((file_name, upload.bytes));
        }
        prepared
    }

    /// Persist the reserved reference files in the background. Called once
    /// a task row points at them. A failed save is logged; the upstream
    /// already has the bytes.
    fn store_references(&self, refs: &mut PreparedReferences) {
        for (file_name, bytes) in std::mem::take(&mut refs.unsaved) {
            let store = self.artifacts.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save_reference(&file_name, &bytes).await {
                    warn!(file = %file_name, error = %e, "failed to save reference image");
                }
            });
        }
    }

    async fn create_task(&self, params: &GenerateParams, refs: &PreparedReferences) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_task(&NewTask {
                task_id: &task_id,
                kind: params.kind.as_str(),
                prompt: &params.prompt,
                ref_images: &refs.paths_json(),
                image_count: params.count as i64,
            })
            .await?;
        Ok(task_id)
    }

    /// Append the history row and bump the counter. The counter only moves
    /// once the row exists.
    async fn record_success(
        &self,
        params: &GenerateParams,
        refs_json: &str,
        image_url: &str,
        batch: Option<BatchSlot>,
    ) -> Result<()> {
        self.db
            .insert_history(&NewHistory {
                prompt: &params.prompt,
                image_url,
                ref_images: refs_json,
                kind: params.kind.as_str(),
                aspect_ratio: &params.aspect_ratio,
                image_size: &params.image_size,
                batch,
            })
            .await?;
        self.metrics
            .record_image(params.kind.as_str(), &params.image_size);
        if let Err(e) = self
            .db
            .increment_total_count(size_weight(&params.image_size))
            .await
        {
            warn!(error = %e, "failed to increment generation count");
        }
        Ok(())
    }

    // ── Single ──────────────────────────────────────────────────

    /// Create the task and detach its worker. Store failure is reported
    /// before any task exists.
    pub async fn start_single(
        self: &Arc<Self>,
        target: UpstreamTarget,
        params: GenerateParams,
        mut refs: PreparedReferences,
    ) -> Result<Accepted> {
        let task_id = self.create_task(&params, &refs).await?;
        self.store_references(&mut refs);
        info!(task_id = %task_id, kind = %params.kind, size = %params.image_size, "task created");

        let accepted = Accepted {
            status: "processing",
            task_id: task_id.clone(),
            ref_images: self.rewriter.to_absolute_all(&refs.paths),
        };

        let worker = {
            let engine = Arc::clone(self);
            let task_id = task_id.clone();
            async move { engine.run_single(&task_id, &target, &params, &refs).await }
        };
        tokio::spawn(Arc::clone(self).supervise(task_id, worker));
        Ok(accepted)
    }

    /// Run a single-task worker; if it panics, fail the task with the panic
    /// text.
    async fn supervise<F>(self: Arc<Self>, task_id: String, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(panic) = catch_panic(worker).await {
            error!(task_id = %task_id, panic = %panic, "generation worker panicked");
            self.finish(&task_id, Err(format!("task panic: {}", panic))).await;
        }
    }

    async fn run_single(
        &self,
        task_id: &str,
        target: &UpstreamTarget,
        params: &GenerateParams,
        refs: &PreparedReferences,
    ) {
        let request = GenerateRequest::new(
            &params.prompt,
            &refs.parts,
            &params.aspect_ratio,
            &params.image_size,
        );
        let started = Instant::now();
        let outcome = match self.upstream.generate(&target.url, &target.token, &request).await {
            Ok(url) => match self
                .record_success(params, &refs.paths_json(), &url, None)
                .await
            {
                Ok(()) => Ok(url),
                Err(e) => {
                    error!(task_id, error = %e, "failed to record history");
                    Err(HISTORY_FAILED_MESSAGE.to_string())
                }
            },
            Err(e) => {
                warn!(task_id, error = %e, quota = e.is_quota(), "generation failed");
                self.metrics.record_failure(params.kind.as_str());
                Err(self.user_message(&e))
            }
        };
        info!(
            task_id,
            ok = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "single generation finished"
        );
        self.finish(task_id, outcome).await;
    }

    /// Move the task to its terminal state. A refused transition means the
    /// reaper got there first.
    async fn finish(&self, task_id: &str, outcome: std::result::Result<String, String>) {
        let applied = match &outcome {
            Ok(url) => self.db.complete_task(task_id, url).await,
            Err(msg) => self.db.fail_task(task_id, msg).await,
        };
        match applied {
            Ok(true) => {}
            Ok(false) => warn!(task_id, "task already terminal, outcome dropped"),
            Err(e) => error!(task_id, error = %e, "failed to update task"),
        }
    }

    // ── Batch ───────────────────────────────────────────────────

    /// Create the task and start the batch driver. Returns the event
    /// stream; store failure is reported before any task exists.
    pub async fn start_batch(
        self: &Arc<Self>,
        target: UpstreamTarget,
        params: GenerateParams,
        mut refs: PreparedReferences,
    ) -> Result<BatchHandle> {
        let task_id = self.create_task(&params, &refs).await?;
        self.store_references(&mut refs);
        let batch_id = uuid::Uuid::new_v4().to_string();
        info!(
            task_id = %task_id,
            batch_id = %batch_id,
            count = params.count,
            kind = %params.kind,
            "batch created"
        );

        // start + one image per slot + complete
        let (events_tx, events_rx) = mpsc::channel(params.count + 2);
        let engine = Arc::clone(self);
        let handle = BatchHandle {
            task_id: task_id.clone(),
            batch_id: batch_id.clone(),
            events: events_rx,
        };
        tokio::spawn(async move {
            engine
                .drive_batch(task_id, batch_id, target, params, refs, events_tx)
                .await;
        });
        Ok(handle)
    }

    async fn drive_batch(
        self: Arc<Self>,
        task_id: String,
        batch_id: String,
        target: UpstreamTarget,
        params: GenerateParams,
        refs: PreparedReferences,
        events: mpsc::Sender<BatchEvent>,
    ) {
        let count = params.count;
        let abs_refs = self.rewriter.to_absolute_all(&refs.paths);
        emit(
            &events,
            BatchEvent::Start {
                task_id: task_id.clone(),
                batch_id: batch_id.clone(),
                count,
                prompt: params.prompt.clone(),
                ref_images: abs_refs.clone(),
                aspect_ratio: params.aspect_ratio.clone(),
                image_size: params.image_size.clone(),
            },
        )
        .await;

        let request = Arc::new(GenerateRequest::new(
            &params.prompt,
            &refs.parts,
            &params.aspect_ratio,
            &params.image_size,
        ));
        let params = Arc::new(params);
        let refs_json: Arc<str> = Arc::from(refs.paths_json());
        let target = Arc::new(target);
        let bookkeeping = Arc::new(Mutex::new(()));
        let (results_tx, mut results_rx) = mpsc::channel::<SlotOutcome>(count);

        for index in 0..count {
            let engine = Arc::clone(&self);
            let request = Arc::clone(&request);
            let params = Arc::clone(&params);
            let refs_json = Arc::clone(&refs_json);
            let target = Arc::clone(&target);
            let bookkeeping = Arc::clone(&bookkeeping);
            let batch_id = batch_id.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let work = {
                    let batch_id = batch_id.clone();
                    async move {
                        engine
                            .run_slot(
                                index, &batch_id, &target, &request, &params, &refs_json,
                                &bookkeeping,
                            )
                            .await
                    }
                };
                let result = guard_slot(&batch_id, index, work).await;
                let _ = results_tx.send(SlotOutcome { index, result }).await;
            });
        }
        drop(results_tx);

        let mut slots: Vec<Option<std::result::Result<String, String>>> = vec![None; count];
        let mut completed = 0;
        while let Some(SlotOutcome { index, result }) = results_rx.recv().await {
            completed += 1;
            let (image_url, error) = match &result {
                Ok(url) => (Some(self.rewriter.to_absolute(url)), None),
                Err(msg) => (None, Some(msg.clone())),
            };
            emit(
                &events,
                BatchEvent::Image {
                    batch_id: batch_id.clone(),
                    index,
                    image_url,
                    error,
                    completed,
                    total: count,
                },
            )
            .await;
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }

        let (status, images, success_count) = self.conclude(&task_id, slots).await;
        info!(
            task_id = %task_id,
            batch_id = %batch_id,
            success_count,
            total = count,
            "batch finished"
        );

        emit(
            &events,
            BatchEvent::Complete {
                status,
                task_id,
                batch_id,
                images,
                ref_images: abs_refs,
                success_count,
                total_count: count,
            },
        )
        .await;
    }

    /// Fold slot outcomes (in slot order) into the batch verdict and move
    /// the task to its terminal state. A slot with no outcome lost its worker.
    async fn conclude(
        &self,
        task_id: &str,
        slots: Vec<Option<std::result::Result<String, String>>>,
    ) -> (BatchStatus, Vec<SlotReport>, usize) {
        let count = slots.len();
        let mut images = Vec::with_capacity(count);
        let mut first_success: Option<String> = None;
        let mut success_count = 0;
        for (index, slot) in slots.into_iter().enumerate() {
            let result = slot.unwrap_or_else(|| Err("task panic: worker lost".to_string()));
            match result {
                Ok(url) => {
                    success_count += 1;
                    first_success.get_or_insert_with(|| url.clone());
                    images.push(SlotReport {
                        image_url: Some(self.rewriter.to_absolute(&url)),
                        error: None,
                        index,
                    });
                }
                Err(msg) => images.push(SlotReport {
                    image_url: None,
                    error: Some(msg),
                    index,
                }),
            }
        }

        let status = BatchStatus::from_counts(success_count, count);
        let outcome = first_success.ok_or_else(|| ALL_FAILED_MESSAGE.to_string());
        self.finish(task_id, outcome).await;
        (status, images, success_count)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_slot(
        &self,
        index: usize,
        batch_id: &str,
        target: &UpstreamTarget,
        request: &GenerateRequest,
        params: &GenerateParams,
        refs_json: &str,
        bookkeeping: &Mutex<()>,
    ) -> std::result::Result<String, String> {
        let started = Instant::now();
        let generated = self.upstream.generate(&target.url, &target.token, request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match generated {
            Ok(url) => {
                let _guard = bookkeeping.lock().await;
                let slot = BatchSlot {
                    batch_id: batch_id.to_string(),
                    index: index as i64,
                    total: params.count as i64,
                };
                match self.record_success(params, refs_json, &url, Some(slot)).await {
                    Ok(()) => {
                        info!(batch_id, index, elapsed_ms, url = %url, "slot succeeded");
                        Ok(url)
                    }
                    Err(e) => {
                        error!(batch_id, index, error = %e, "failed to record history");
                        Err(HISTORY_FAILED_MESSAGE.to_string())
                    }
                }
            }
            Err(e) => {
                warn!(batch_id, index, elapsed_ms, error = %e, quota = e.is_quota(), "slot failed");
                self.metrics.record_failure(params.kind.as_str());
                Err(self.user_message(&e))
            }
        }
    }
}

/// Send one event; a gone listener is not an error.
async fn emit(events: &mpsc::Sender<BatchEvent>, event: BatchEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("batch listener gone, event dropped");
    }
}

/// Run one slot's work; a panic becomes that slot's error.
async fn guard_slot<F>(
    batch_id: &str,
    index: usize,
    work: F,
) -> std::result::Result<String, String>
where
    F: Future<Output = std::result::Result<String, String>> + Send + 'static,
{
    match catch_panic(work).await {
        Ok(result) => result,
        Err(panic) => {
            error!(batch_id, index, panic = %panic, "slot worker panicked");
            Err(format!("task panic: {}", panic))
        }
    }
}

/// Run `fut` on its own task and turn a panic into its message.
async fn catch_panic<T, F>(fut: F) -> std::result::Result<T, String>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(value) => Ok(value),
        Err(join) if join.is_panic() => Err(panic_message(join.into_panic())),
        Err(join) => Err(join.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
