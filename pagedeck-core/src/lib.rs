use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Identifies one loaded document. Generated fresh on every load, so loading
/// the same file twice yields two distinct documents.
pub type DocumentId = Uuid;

/// Identifies one page of one loaded document, independent of display order.
pub type PageId = Uuid;

/// Conventional output file name for merged documents.
pub const MERGE_OUTPUT_NAME: &str = "merged-document.pdf";

/// Conventional output file name for a split of the named source file.
pub fn split_output_name(source_name: &str) -> String {
    format!("split-{source_name}")
}

#[derive(Debug, Error)]
#[error("unreadable document bytes")]
pub struct LoadError(#[source] pub anyhow::Error);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to load {name}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },
    #[error("position {position} out of range (order length {len})")]
    IndexOutOfRange { position: usize, len: usize },
    #[error("unknown page identity {0}")]
    UnknownIdentity(PageId),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering cancelled")]
    Cancelled,
    #[error("rasterizer failure")]
    Backend(#[source] anyhow::Error),
}

impl RenderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("failed to create output document")]
    Create(#[source] anyhow::Error),
    #[error("failed to open source document {name}")]
    Source {
        name: String,
        #[source]
        source: LoadError,
    },
    #[error("failed to copy page {page_index} from {name}")]
    Copy {
        name: String,
        page_index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to serialize output document")]
    Serialize(#[source] anyhow::Error),
}

/// Raster produced for one page, RGBA8 row-major.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// External collaborator that performs byte-level page copying and
/// serialization. The registry uses it to probe page counts at load time; the
/// planner drives it to produce the final output bytes.
///
/// Implementations must take their own view of the bytes they are handed: the
/// caller keeps the original immutable and may hand the same content to the
/// rasterizer concurrently.
#[async_trait]
pub trait AssemblyEngine: Send + Sync {
    type Source: Send + Sync;
    type Output: Send;

    async fn load_document(&self, bytes: &Bytes) -> Result<Self::Source, LoadError>;

    fn page_count(&self, source: &Self::Source) -> usize;

    fn create_document(&self) -> Result<Self::Output, anyhow::Error>;

    fn copy_page(
        &self,
        output: &mut Self::Output,
        source: &Self::Source,
        page_index: usize,
    ) -> Result<(), anyhow::Error>;

    fn serialize(&self, output: Self::Output) -> Result<Vec<u8>, anyhow::Error>;
}

/// External collaborator that renders a page to a raster. Cancellation is
/// advisory: a caller that no longer wants a result either drops the future
/// or discards the completion, and a backend that detects cancellation
/// reports it with the distinguished [`RenderError::Cancelled`] kind.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    type Document: Send + Sync;

    async fn open_document(&self, bytes: &Bytes) -> Result<Self::Document, LoadError>;

    async fn render_page(
        &self,
        document: &Self::Document,
        page_index: usize,
        scale: f32,
    ) -> Result<RenderImage, RenderError>;
}

/// One loaded source document. Bytes are retained immutably for the lifetime
/// of the document; both external collaborators read from independent views
/// of this content.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub bytes: Bytes,
    pub page_count: usize,
    pub source_name: String,
}

/// Stable reference to one page of one document. The id is the sole key used
/// for ordering, selection, and render caching; it is never reused across
/// documents and never derived from file name or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub id: PageId,
    pub document_id: DocumentId,
    pub page_index: usize,
}

/// Single source of truth for loaded documents and page arrangement.
///
/// The order holds every live page identity exactly once; removing a document
/// cascades to its pages and any selection over it. All mutations are
/// synchronous `&mut self` operations, so no two of them can interleave.
#[derive(Debug, Default)]
pub struct PageRegistry {
    documents: HashMap<DocumentId, Document>,
    document_order: Vec<DocumentId>,
    pages: HashMap<PageId, PageRef>,
    order: Vec<PageId>,
    selection: BTreeSet<usize>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document and appends one page identity per page to the
    /// order, in ascending page index. Load failures propagate untouched and
    /// leave the registry exactly as it was.
    #[instrument(skip(self, engine, bytes), fields(len = bytes.len()))]
    pub async fn add_document<E: AssemblyEngine>(
        &mut self,
        engine: &E,
        bytes: Bytes,
        name: &str,
    ) -> Result<DocumentId, RegistryError> {
        let source = engine
            .load_document(&bytes)
            .await
            .map_err(|source| RegistryError::Load {
                name: name.to_string(),
                source,
            })?;
        let page_count = engine.page_count(&source);

        let id = Uuid::new_v4();
        for page_index in 0..page_count {
            let page = PageRef {
                id: Uuid::new_v4(),
                document_id: id,
                page_index,
            };
            self.pages.insert(page.id, page);
            self.order.push(page.id);
        }
        self.documents.insert(
            id,
            Document {
                id,
                bytes,
                page_count,
                source_name: name.to_string(),
            },
        );
        self.document_order.push(id);
        debug!(%id, page_count, name, "registered document");
        Ok(id)
    }

    /// Removes the document and every page identity referring to it.
    /// Idempotent: unknown ids are ignored. Returns the dropped identities so
    /// callers can cancel any renders still pending for them.
    pub fn remove_document(&mut self, id: DocumentId) -> Vec<PageId> {
        if self.documents.remove(&id).is_none() {
            return Vec::new();
        }
        self.document_order.retain(|d| *d != id);

        let dropped: Vec<PageId> = self
            .order
            .iter()
            .copied()
            .filter(|page_id| {
                self.pages
                    .get(page_id)
                    .is_some_and(|page| page.document_id == id)
            })
            .collect();
        for page_id in &dropped {
            self.pages.remove(page_id);
        }
        self.order.retain(|page_id| self.pages.contains_key(page_id));
        // Selection indices are only meaningful against the split target, so
        // any document removal invalidates them wholesale.
        self.selection.clear();
        debug!(%id, dropped = dropped.len(), "removed document");
        dropped
    }

    /// Moves one entry within the order, preserving all other relative
    /// positions.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<(), RegistryError> {
        let len = self.order.len();
        for position in [from, to] {
            if position >= len {
                return Err(RegistryError::IndexOutOfRange { position, len });
            }
        }
        let id = self.order.remove(from);
        self.order.insert(to, id);
        Ok(())
    }

    /// Drops a single page identity from the order. No-op if absent.
    pub fn remove_page(&mut self, id: PageId) {
        if self.pages.remove(&id).is_some() {
            self.order.retain(|page_id| *page_id != id);
        }
    }

    pub fn resolve(&self, id: PageId) -> Result<(DocumentId, usize), RegistryError> {
        self.pages
            .get(&id)
            .map(|page| (page.document_id, page.page_index))
            .ok_or(RegistryError::UnknownIdentity(id))
    }

    pub fn page(&self, id: PageId) -> Option<&PageRef> {
        self.pages.get(&id)
    }

    pub fn order(&self) -> &[PageId] {
        &self.order
    }

    pub fn document(&self, id: DocumentId) -> Option<&Document> {
        self.documents.get(&id)
    }

    /// Documents in load order.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.document_order
            .iter()
            .filter_map(|id| self.documents.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// The document a split selection refers to: the earliest loaded one.
    pub fn split_document(&self) -> Option<&Document> {
        self.document_order
            .first()
            .and_then(|id| self.documents.get(id))
    }

    pub fn selection(&self) -> &BTreeSet<usize> {
        &self.selection
    }

    /// Toggles one page index in the selection and reports whether it is now
    /// selected. Out-of-range indices are dropped silently.
    pub fn toggle_selection(&mut self, page_index: usize) -> bool {
        let Some(document) = self.split_document() else {
            return false;
        };
        if page_index >= document.page_count {
            return false;
        }
        if self.selection.remove(&page_index) {
            false
        } else {
            self.selection.insert(page_index);
            true
        }
    }

    /// Replaces the selection. Out-of-range indices are dropped silently.
    pub fn set_selection<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        let page_count = self.split_document().map_or(0, |d| d.page_count);
        self.selection = indices
            .into_iter()
            .filter(|index| *index < page_count)
            .collect();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }
}

/// Parses a comma-separated list of 1-based page numbers and inclusive dash
/// ranges into a set of 0-based indices. Lenient by design: malformed tokens
/// are skipped, out-of-range values dropped, inverted ranges contribute
/// nothing, and garbage input yields an empty set rather than an error.
pub fn parse_page_ranges(input: &str, page_count: usize) -> BTreeSet<usize> {
    let mut selected = BTreeSet::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((start, end)) = token.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>())
            else {
                continue;
            };
            for page in start..=end.min(page_count) {
                if page >= 1 {
                    selected.insert(page - 1);
                }
            }
        } else if let Ok(page) = token.parse::<usize>() {
            if page >= 1 && page <= page_count {
                selected.insert(page - 1);
            }
        }
    }
    selected
}

/// One extraction instruction: copy `page_index` of `document_id` into the
/// output, in plan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub document_id: DocumentId,
    pub page_index: usize,
}

/// The merge plan is the current order, verbatim.
pub fn merge_plan(registry: &PageRegistry) -> Vec<PlanEntry> {
    registry
        .order()
        .iter()
        .filter_map(|id| registry.page(*id))
        .map(|page| PlanEntry {
            document_id: page.document_id,
            page_index: page.page_index,
        })
        .collect()
}

/// The split plan is the selection in ascending page order. Extraction always
/// preserves original document order regardless of the order pages were
/// selected in.
pub fn split_plan(registry: &PageRegistry) -> Vec<PlanEntry> {
    let Some(document) = registry.split_document() else {
        return Vec::new();
    };
    registry
        .selection()
        .iter()
        .map(|page_index| PlanEntry {
            document_id: document.id,
            page_index: *page_index,
        })
        .collect()
}

/// Executes a merge: every page in the current order, copied in order into a
/// fresh output document.
pub async fn assemble_merge<E: AssemblyEngine>(
    engine: &E,
    registry: &PageRegistry,
) -> Result<Vec<u8>, AssemblyError> {
    execute_plan(engine, registry, merge_plan(registry)).await
}

/// Executes a split: the selected pages of the split target, copied in
/// ascending page order into a fresh output document.
pub async fn assemble_split<E: AssemblyEngine>(
    engine: &E,
    registry: &PageRegistry,
) -> Result<Vec<u8>, AssemblyError> {
    execute_plan(engine, registry, split_plan(registry)).await
}

/// Drives the assembly engine over a plan. Each distinct source document is
/// opened at most once, however many of its pages the plan references. A plan
/// entry whose source bytes are missing from the registry is skipped with a
/// warning; copy and serialization failures abort the whole operation and no
/// output is produced.
#[instrument(skip_all, fields(entries = plan.len()))]
async fn execute_plan<E: AssemblyEngine>(
    engine: &E,
    registry: &PageRegistry,
    plan: Vec<PlanEntry>,
) -> Result<Vec<u8>, AssemblyError> {
    let mut output = engine.create_document().map_err(AssemblyError::Create)?;
    let mut sources: HashMap<DocumentId, E::Source> = HashMap::new();

    for entry in &plan {
        let Some(document) = registry.document(entry.document_id) else {
            warn!(
                document_id = %entry.document_id,
                page_index = entry.page_index,
                "skipping page whose source bytes are missing"
            );
            continue;
        };
        if !sources.contains_key(&entry.document_id) {
            let source = engine.load_document(&document.bytes).await.map_err(|source| {
                AssemblyError::Source {
                    name: document.source_name.clone(),
                    source,
                }
            })?;
            sources.insert(entry.document_id, source);
        }
        let source = sources
            .get(&entry.document_id)
            .expect("source inserted above");
        engine
            .copy_page(&mut output, source, entry.page_index)
            .map_err(|source| AssemblyError::Copy {
                name: document.source_name.clone(),
                page_index: entry.page_index,
                source,
            })?;
    }

    engine.serialize(output).map_err(AssemblyError::Serialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    /// Byte layout for fake documents: first byte is the page count, the rest
    /// is a tag naming the document in copy records.
    fn doc_bytes(page_count: u8, tag: &str) -> Bytes {
        let mut bytes = vec![page_count];
        bytes.extend_from_slice(tag.as_bytes());
        Bytes::from(bytes)
    }

    #[derive(Default)]
    struct FakeEngine {
        loads: AtomicUsize,
        fail_serialize: bool,
    }

    struct FakeSource {
        tag: String,
        page_count: usize,
    }

    #[async_trait]
    impl AssemblyEngine for FakeEngine {
        type Source = FakeSource;
        type Output = Vec<(String, usize)>;

        async fn load_document(&self, bytes: &Bytes) -> Result<FakeSource, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if bytes.is_empty() {
                return Err(LoadError(anyhow!("empty document")));
            }
            Ok(FakeSource {
                tag: String::from_utf8_lossy(&bytes[1..]).into_owned(),
                page_count: bytes[0] as usize,
            })
        }

        fn page_count(&self, source: &FakeSource) -> usize {
            source.page_count
        }

        fn create_document(&self) -> Result<Self::Output, anyhow::Error> {
            Ok(Vec::new())
        }

        fn copy_page(
            &self,
            output: &mut Self::Output,
            source: &FakeSource,
            page_index: usize,
        ) -> Result<(), anyhow::Error> {
            if page_index >= source.page_count {
                return Err(anyhow!("page {page_index} out of range"));
            }
            output.push((source.tag.clone(), page_index));
            Ok(())
        }

        fn serialize(&self, output: Self::Output) -> Result<Vec<u8>, anyhow::Error> {
            if self.fail_serialize {
                return Err(anyhow!("serialization failed"));
            }
            let rendered = output
                .iter()
                .map(|(tag, index)| format!("{tag}:{index}"))
                .collect::<Vec<_>>()
                .join(",");
            Ok(rendered.into_bytes())
        }
    }

    #[tokio::test]
    async fn add_documents_appends_pages_in_load_then_page_order() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        let a = registry
            .add_document(&engine, doc_bytes(3, "a"), "a.pdf")
            .await
            .unwrap();
        let b = registry
            .add_document(&engine, doc_bytes(2, "b"), "b.pdf")
            .await
            .unwrap();

        assert_eq!(registry.order().len(), 5);
        let resolved: Vec<_> = registry
            .order()
            .iter()
            .map(|id| registry.resolve(*id).unwrap())
            .collect();
        assert_eq!(
            resolved,
            vec![(a, 0), (a, 1), (a, 2), (b, 0), (b, 1)]
        );
    }

    #[tokio::test]
    async fn load_failure_propagates_and_leaves_registry_untouched() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(2, "a"), "a.pdf")
            .await
            .unwrap();

        let err = registry
            .add_document(&engine, Bytes::new(), "broken.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Load { ref name, .. } if name.as_str() == "broken.pdf"));
        assert_eq!(registry.order().len(), 2);
        assert_eq!(registry.documents().count(), 1);
    }

    #[tokio::test]
    async fn reorder_is_a_stable_move_and_never_remaps_identities() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        let a = registry
            .add_document(&engine, doc_bytes(4, "a"), "a.pdf")
            .await
            .unwrap();

        let before: Vec<_> = registry
            .order()
            .iter()
            .map(|id| (*id, registry.resolve(*id).unwrap()))
            .collect();

        registry.reorder(3, 1).unwrap();

        let after_order: Vec<_> = registry.order().to_vec();
        assert_eq!(
            after_order,
            vec![before[0].0, before[3].0, before[1].0, before[2].0]
        );
        for (id, resolved) in &before {
            assert_eq!(registry.resolve(*id).unwrap(), *resolved);
        }
        assert_eq!(registry.resolve(after_order[1]).unwrap(), (a, 3));
    }

    #[tokio::test]
    async fn reorder_rejects_out_of_range_positions() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(2, "a"), "a.pdf")
            .await
            .unwrap();

        let err = registry.reorder(0, 2).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IndexOutOfRange { position: 2, len: 2 }
        ));
        let err = registry.reorder(5, 0).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::IndexOutOfRange { position: 5, len: 2 }
        ));
    }

    #[tokio::test]
    async fn remove_document_cascades_and_is_idempotent() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        let a = registry
            .add_document(&engine, doc_bytes(3, "a"), "a.pdf")
            .await
            .unwrap();
        let b = registry
            .add_document(&engine, doc_bytes(2, "b"), "b.pdf")
            .await
            .unwrap();

        let dropped = registry.remove_document(a);
        assert_eq!(dropped.len(), 3);
        assert_eq!(registry.order().len(), 2);
        for id in registry.order() {
            assert_eq!(registry.resolve(*id).unwrap().0, b);
        }
        for id in &dropped {
            assert!(matches!(
                registry.resolve(*id),
                Err(RegistryError::UnknownIdentity(_))
            ));
        }

        assert!(registry.remove_document(a).is_empty());
        assert_eq!(registry.order().len(), 2);
    }

    #[tokio::test]
    async fn remove_page_drops_one_identity_and_ignores_unknown_ids() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(3, "a"), "a.pdf")
            .await
            .unwrap();

        let victim = registry.order()[1];
        registry.remove_page(victim);
        assert_eq!(registry.order().len(), 2);
        assert!(!registry.order().contains(&victim));

        registry.remove_page(Uuid::new_v4());
        assert_eq!(registry.order().len(), 2);
    }

    #[tokio::test]
    async fn selection_drops_out_of_range_indices_and_toggles() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(4, "a"), "a.pdf")
            .await
            .unwrap();

        assert!(registry.toggle_selection(2));
        assert!(registry.toggle_selection(0));
        assert!(!registry.toggle_selection(9));
        assert_eq!(
            registry.selection().iter().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(!registry.toggle_selection(2));
        assert_eq!(
            registry.selection().iter().copied().collect::<Vec<_>>(),
            vec![0]
        );

        registry.set_selection([3, 1, 17]);
        assert_eq!(
            registry.selection().iter().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn page_ranges_parse_numbers_and_dash_ranges() {
        assert_eq!(
            parse_page_ranges("1-3,5", 6).into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2, 4]
        );
    }

    #[test]
    fn page_ranges_drop_out_of_range_values() {
        assert!(parse_page_ranges("7", 6).is_empty());
        assert_eq!(
            parse_page_ranges("5-9", 6).into_iter().collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn inverted_and_empty_ranges_contribute_nothing() {
        assert!(parse_page_ranges("3-1", 6).is_empty());
        assert!(parse_page_ranges("", 6).is_empty());
        assert!(parse_page_ranges(",,  ,", 6).is_empty());
    }

    #[test]
    fn malformed_tokens_are_skipped_not_fatal() {
        assert_eq!(
            parse_page_ranges("x, 2, three, 4-y, -1, 5", 6)
                .into_iter()
                .collect::<Vec<_>>(),
            vec![1, 4]
        );
        assert!(parse_page_ranges("total garbage", 6).is_empty());
    }

    #[test]
    fn duplicate_tokens_collapse() {
        assert_eq!(
            parse_page_ranges("1-3, 2, 3, 2-4", 6)
                .into_iter()
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn merge_plan_follows_user_reordering() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        let a = registry
            .add_document(&engine, doc_bytes(3, "a"), "a.pdf")
            .await
            .unwrap();
        let b = registry
            .add_document(&engine, doc_bytes(2, "b"), "b.pdf")
            .await
            .unwrap();

        // Move page 2 of B (order position 4) to the front.
        registry.reorder(4, 0).unwrap();

        let plan = merge_plan(&registry);
        let expected = [(b, 1), (a, 0), (a, 1), (a, 2), (b, 0)];
        assert_eq!(plan.len(), expected.len());
        for (entry, (document_id, page_index)) in plan.iter().zip(expected) {
            assert_eq!(entry.document_id, document_id);
            assert_eq!(entry.page_index, page_index);
        }
    }

    #[tokio::test]
    async fn split_plan_is_ascending_regardless_of_selection_order() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(6, "a"), "a.pdf")
            .await
            .unwrap();

        registry.toggle_selection(4);
        registry.toggle_selection(0);
        registry.toggle_selection(2);

        let indices: Vec<_> = split_plan(&registry)
            .iter()
            .map(|entry| entry.page_index)
            .collect();
        assert_eq!(indices, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn assembly_opens_each_distinct_source_once_and_copies_in_plan_order() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(3, "a"), "a.pdf")
            .await
            .unwrap();
        registry
            .add_document(&engine, doc_bytes(2, "b"), "b.pdf")
            .await
            .unwrap();
        registry.reorder(4, 0).unwrap();

        let loads_before = engine.loads.load(Ordering::SeqCst);
        let bytes = assemble_merge(&engine, &registry).await.unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "b:1,a:0,a:1,a:2,b:0"
        );
        // One load per distinct source, not per referenced page.
        assert_eq!(engine.loads.load(Ordering::SeqCst) - loads_before, 2);
    }

    #[tokio::test]
    async fn assembly_skips_entries_whose_source_bytes_are_missing() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        let a = registry
            .add_document(&engine, doc_bytes(2, "a"), "a.pdf")
            .await
            .unwrap();
        registry
            .add_document(&engine, doc_bytes(1, "b"), "b.pdf")
            .await
            .unwrap();

        // Simulate the internal inconsistency the planner guards against:
        // order entries whose document bytes are gone.
        registry.documents.remove(&a);

        let bytes = assemble_merge(&engine, &registry).await.unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "b:0");
    }

    #[tokio::test]
    async fn serialization_failure_aborts_with_assembly_error() {
        let engine = FakeEngine {
            fail_serialize: true,
            ..FakeEngine::default()
        };
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(1, "a"), "a.pdf")
            .await
            .unwrap();

        let err = assemble_merge(&engine, &registry).await.unwrap_err();
        assert!(matches!(err, AssemblyError::Serialize(_)));
    }

    #[tokio::test]
    async fn split_assembly_extracts_selected_pages_in_document_order() {
        let engine = FakeEngine::default();
        let mut registry = PageRegistry::new();
        registry
            .add_document(&engine, doc_bytes(6, "a"), "a.pdf")
            .await
            .unwrap();
        registry.set_selection(parse_page_ranges("5, 1-2", 6));

        let bytes = assemble_split(&engine, &registry).await.unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "a:0,a:1,a:4");
    }

    #[test]
    fn output_names_follow_convention() {
        assert_eq!(MERGE_OUTPUT_NAME, "merged-document.pdf");
        assert_eq!(split_output_name("report.pdf"), "split-report.pdf");
    }
}
