use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagedeck_core::{AssemblyEngine, LoadError, PageId, Rasterizer, RenderError, RenderImage};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Visual state of one page identity, as seen by whatever presents the
/// thumbnail.
#[derive(Debug, Clone, Default)]
pub enum RenderState {
    #[default]
    Unrendered,
    Pending,
    Rendered(Arc<RenderImage>),
    Cancelled,
    Failed,
}

struct RenderSlot {
    generation: u64,
    state: RenderState,
    task: Option<JoinHandle<()>>,
}

impl RenderSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            state: RenderState::Unrendered,
            task: None,
        }
    }
}

/// Per-identity single-flight render scheduling over a [`Rasterizer`].
///
/// Each identity carries a monotonically increasing generation counter. A new
/// request aborts the previous task, bumps the generation, and tags the new
/// task with it; a completion whose generation is stale is discarded, so a
/// cancelled render racing to completion can never overwrite a newer result.
/// Thumbnails for different identities may complete in any order.
pub struct RenderScheduler<R: Rasterizer> {
    rasterizer: Arc<R>,
    slots: Arc<Mutex<HashMap<PageId, RenderSlot>>>,
    completed: Arc<Notify>,
}

impl<R> RenderScheduler<R>
where
    R: Rasterizer + 'static,
    R::Document: 'static,
{
    pub fn new(rasterizer: Arc<R>) -> Self {
        Self {
            rasterizer,
            slots: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Notify::new()),
        }
    }

    /// Requests a raster for one page identity, cancelling any render still
    /// pending for it. Returns the state the identity is left in (always
    /// [`RenderState::Pending`]).
    pub fn request_render(
        &self,
        id: PageId,
        document: Arc<R::Document>,
        page_index: usize,
        scale: f32,
    ) -> RenderState {
        let mut slots = self.slots.lock();
        let slot = slots.entry(id).or_insert_with(RenderSlot::new);
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.generation += 1;
        slot.state = RenderState::Pending;
        let generation = slot.generation;

        let rasterizer = Arc::clone(&self.rasterizer);
        let task_slots = Arc::clone(&self.slots);
        let completed = Arc::clone(&self.completed);
        let task = tokio::spawn(async move {
            let result = rasterizer
                .render_page(document.as_ref(), page_index, scale)
                .await;

            let mut slots = task_slots.lock();
            let Some(slot) = slots.get_mut(&id) else {
                // Disposed while rendering; nothing left to update.
                return;
            };
            if slot.generation != generation {
                debug!(%id, generation, "discarding stale render result");
                return;
            }
            slot.task = None;
            slot.state = match result {
                Ok(image) => RenderState::Rendered(Arc::new(image)),
                Err(err) if err.is_cancelled() => RenderState::Cancelled,
                Err(err) => {
                    warn!(%id, page_index, ?err, "page render failed");
                    RenderState::Failed
                }
            };
            drop(slots);
            completed.notify_waiters();
        });
        slot.task = Some(task);
        RenderState::Pending
    }

    pub fn state(&self, id: PageId) -> RenderState {
        self.slots
            .lock()
            .get(&id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Cancels any pending render for the identity and drops its cached
    /// state. Invoked when a page leaves the live view or is destroyed.
    pub fn dispose(&self, id: PageId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.remove(&id) {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
        drop(slots);
        self.completed.notify_waiters();
    }

    /// Waits until the identity is no longer pending and returns its state.
    pub async fn wait_for(&self, id: PageId) -> RenderState {
        loop {
            let notified = self.completed.notified();
            match self.state(id) {
                RenderState::Pending => notified.await,
                state => return state,
            }
        }
    }
}

/// Pdfium-backed implementation of both external collaborators: the
/// [`AssemblyEngine`] the planner drives and the [`Rasterizer`] the scheduler
/// renders through. Cheap to clone; clones share one set of bindings.
#[derive(Clone)]
pub struct PdfiumEngine {
    pdfium: Arc<Pdfium>,
}

impl PdfiumEngine {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pdfium: Arc::new(bind_pdfium()?),
        })
    }

    fn open_source(&self, bytes: &Bytes) -> Result<PdfiumSource> {
        // Each consumer gets its own copy of the content so nothing another
        // consumer does to its view can corrupt an in-flight read here.
        let bytes = bytes.to_vec();
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(&bytes, None)
            .context("failed to parse document bytes")?;
        // SAFETY: the returned PdfDocument borrows the byte buffer and the
        // Pdfium bindings. Both are moved into the PdfiumSource below, and
        // struct fields drop in declaration order, so the document is dropped
        // before either referent. The Vec's heap allocation does not move
        // when the Vec itself is moved.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(PdfiumSource {
            document: Mutex::new(document),
            _bytes: bytes,
            _pdfium: Arc::clone(&self.pdfium),
        })
    }
}

/// One parsed source document. Owns an independent copy of the raw bytes for
/// the lifetime of the pdfium handle.
pub struct PdfiumSource {
    document: Mutex<PdfDocument<'static>>,
    _bytes: Vec<u8>,
    _pdfium: Arc<Pdfium>,
}

/// Output document under construction.
pub struct PdfiumOutput {
    document: Mutex<PdfDocument<'static>>,
    _pdfium: Arc<Pdfium>,
}

#[async_trait]
impl AssemblyEngine for PdfiumEngine {
    type Source = PdfiumSource;
    type Output = PdfiumOutput;

    async fn load_document(&self, bytes: &Bytes) -> Result<PdfiumSource, LoadError> {
        self.open_source(bytes).map_err(LoadError)
    }

    fn page_count(&self, source: &PdfiumSource) -> usize {
        usize::from(source.document.lock().pages().len())
    }

    fn create_document(&self) -> Result<PdfiumOutput> {
        let document = self
            .pdfium
            .create_new_pdf()
            .context("failed to create output document")?;
        // SAFETY: same drop-order argument as open_source, minus the bytes.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(PdfiumOutput {
            document: Mutex::new(document),
            _pdfium: Arc::clone(&self.pdfium),
        })
    }

    fn copy_page(
        &self,
        output: &mut PdfiumOutput,
        source: &PdfiumSource,
        page_index: usize,
    ) -> Result<()> {
        let source_index = PdfPageIndex::try_from(page_index)
            .map_err(|_| anyhow!("page {page_index} is out of supported range"))?;
        let source_document = source.document.lock();
        let target = output.document.get_mut();
        let destination_index = target.pages().len();
        target
            .pages_mut()
            .copy_page_from_document(&source_document, source_index, destination_index)
            .with_context(|| format!("failed to copy page {page_index}"))
    }

    fn serialize(&self, output: PdfiumOutput) -> Result<Vec<u8>> {
        let document = output.document.into_inner();
        document
            .save_to_bytes()
            .context("failed to serialize output document")
    }
}

#[async_trait]
impl Rasterizer for PdfiumEngine {
    type Document = PdfiumSource;

    async fn open_document(&self, bytes: &Bytes) -> Result<PdfiumSource, LoadError> {
        self.open_source(bytes).map_err(LoadError)
    }

    async fn render_page(
        &self,
        document: &PdfiumSource,
        page_index: usize,
        scale: f32,
    ) -> Result<RenderImage, RenderError> {
        let index = PdfPageIndex::try_from(page_index)
            .map_err(|_| RenderError::Backend(anyhow!("page {page_index} is out of supported range")))?;
        let guard = document.document.lock();
        let page = guard.pages().get(index).map_err(|err| {
            RenderError::Backend(
                anyhow::Error::new(err).context(format!("page {page_index} out of range")),
            )
        })?;

        let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.1));
        let bitmap = page.render_with_config(&config).map_err(|err| {
            RenderError::Backend(
                anyhow::Error::new(err).context(format!("failed to render page {page_index}")),
            )
        })?;
        let image = bitmap.as_image().to_rgba8();
        let (width, height) = image.dimensions();
        Ok(RenderImage {
            width,
            height,
            pixels: image.into_raw(),
        })
    }
}

fn bind_pdfium() -> Result<Pdfium> {
    let mut errors = Vec::new();

    if let Ok(path) = std::env::var("PAGEDECK_PDFIUM_LIBRARY_PATH") {
        if !path.is_empty() {
            match Pdfium::bind_to_library(&path) {
                Ok(bindings) => return Ok(Pdfium::new(bindings)),
                Err(err) => {
                    warn!("failed to load Pdfium from {}: {}", path, err);
                    errors.push(format!("{path}: {err}"));
                }
            }
        }
    }

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
