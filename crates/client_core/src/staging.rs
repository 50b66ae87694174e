use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use thiserror::Error;
use tracing::debug;

/// A file as delivered by the surface's drop/pick collaborator.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub filename: String,
    pub media_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl CandidateFile {
    pub fn new(filename: impl Into<String>, media_type: Option<&str>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            media_type: media_type.map(str::to_owned),
            bytes,
        }
    }
}

/// Creates and revokes preview references for staged files, the way an
/// object-URL registry does. Every `create` must be paired with exactly one
/// `revoke`; [`PreviewHandle`] enforces the pairing.
pub trait PreviewRegistry: Send + Sync {
    fn create(&self, filename: &str, bytes: &[u8]) -> String;
    fn revoke(&self, url: &str);
}

/// Registry handing out process-local pseudo-URLs. Stands in for a real
/// preview surface in headless shells and tests.
#[derive(Default)]
pub struct InMemoryPreviewRegistry {
    counter: AtomicU64,
    live: Mutex<HashSet<String>>,
}

impl InMemoryPreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Previews created and not yet revoked.
    pub fn live_count(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl PreviewRegistry for InMemoryPreviewRegistry {
    fn create(&self, filename: &str, _bytes: &[u8]) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let url = format!("preview://{id}/{filename}");
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone());
        url
    }

    fn revoke(&self, url: &str) {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
        if !removed {
            debug!(url, "staging: revoke for unknown preview");
        }
    }
}

/// Scoped preview reference. Revoked exactly once, when the handle drops —
/// whether the staged file is replaced, cleared, or consumed by a submit.
pub struct PreviewHandle {
    url: String,
    registry: Arc<dyn PreviewRegistry>,
}

impl PreviewHandle {
    fn new(registry: Arc<dyn PreviewRegistry>, filename: &str, bytes: &[u8]) -> Self {
        let url = registry.create(filename, bytes);
        Self { url, registry }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.revoke(&self.url);
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewHandle")
            .field("url", &self.url)
            .finish()
    }
}

/// The file held client-side pending submission.
#[derive(Debug)]
pub struct StagedFile {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
    preview: PreviewHandle,
}

impl StagedFile {
    pub fn preview_url(&self) -> &str {
        self.preview.url()
    }
}

/// What an upload sends over the wire, cloned out of the staged file so the
/// staging state keeps ownership until the submission resolves.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("only image files can be staged: {filename}")]
    UnsupportedMediaType { filename: String },
    #[error("a submission is in flight; staging is locked until it resolves")]
    SubmissionInFlight,
    #[error("the surface is closed")]
    SurfaceClosed,
}

#[derive(Debug)]
enum StagingState {
    Empty,
    Staged(StagedFile),
    Submitting(StagedFile),
}

/// Holds at most one file between a drop/pick gesture and its submission.
///
/// `Empty -> Staged` on a valid drop, `Staged -> Submitting` while an upload
/// is in flight, then `-> Empty` on success or back to `Staged` on failure.
/// Clearing (surface close) is valid from any state and releases the preview.
pub struct FileStaging {
    previews: Arc<dyn PreviewRegistry>,
    state: StagingState,
}

impl FileStaging {
    pub fn new(previews: Arc<dyn PreviewRegistry>) -> Self {
        Self {
            previews,
            state: StagingState::Empty,
        }
    }

    /// Stages the first image of a drop; the rest of the set is discarded.
    /// An empty drop leaves the current state untouched. Replacing an
    /// already-staged file revokes its preview.
    pub fn stage(&mut self, files: Vec<CandidateFile>) -> Result<Option<String>, StagingError> {
        if matches!(self.state, StagingState::Submitting(_)) {
            return Err(StagingError::SubmissionInFlight);
        }

        let mut files = files.into_iter();
        let Some(first) = files.next() else {
            return Ok(self.preview_url().map(str::to_owned));
        };
        let discarded = files.count();
        if discarded > 0 {
            debug!(discarded, kept = %first.filename, "staging: extra dropped files discarded");
        }

        let media_type = resolve_image_media_type(&first).ok_or_else(|| {
            StagingError::UnsupportedMediaType {
                filename: first.filename.clone(),
            }
        })?;

        let preview = PreviewHandle::new(Arc::clone(&self.previews), &first.filename, &first.bytes);
        self.state = StagingState::Staged(StagedFile {
            filename: first.filename,
            media_type,
            bytes: first.bytes,
            preview,
        });
        Ok(self.preview_url().map(str::to_owned))
    }

    pub fn is_staged(&self) -> bool {
        matches!(self.state, StagingState::Staged(_))
    }

    pub fn staged(&self) -> Option<&StagedFile> {
        match &self.state {
            StagingState::Staged(file) => Some(file),
            _ => None,
        }
    }

    pub fn preview_url(&self) -> Option<&str> {
        match &self.state {
            StagingState::Staged(file) | StagingState::Submitting(file) => Some(file.preview_url()),
            StagingState::Empty => None,
        }
    }

    /// Takes a wire copy of the staged file and locks staging until the
    /// submission resolves via [`finish_submit`] or [`fail_submit`].
    ///
    /// [`finish_submit`]: Self::finish_submit
    /// [`fail_submit`]: Self::fail_submit
    pub fn begin_submit(&mut self) -> Option<UploadPayload> {
        match std::mem::replace(&mut self.state, StagingState::Empty) {
            StagingState::Staged(file) => {
                let payload = UploadPayload {
                    filename: file.filename.clone(),
                    media_type: file.media_type.clone(),
                    bytes: file.bytes.clone(),
                };
                self.state = StagingState::Submitting(file);
                Some(payload)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// A failed submit returns the file to `Staged`: the surface stays open
    /// and resubmittable. No-op if the surface was cleared mid-flight.
    pub fn fail_submit(&mut self) {
        if let StagingState::Submitting(file) =
            std::mem::replace(&mut self.state, StagingState::Empty)
        {
            self.state = StagingState::Staged(file);
        }
    }

    /// A successful submit consumes the staged file and revokes its preview.
    pub fn finish_submit(&mut self) {
        if matches!(self.state, StagingState::Submitting(_)) {
            self.state = StagingState::Empty;
        }
    }

    /// Releases whatever is held, revoking any live preview.
    pub fn clear(&mut self) {
        self.state = StagingState::Empty;
    }
}

/// Accept filter at the file-input boundary: image media only. Prefers the
/// declared media type and falls back to a guess from the filename.
fn resolve_image_media_type(file: &CandidateFile) -> Option<String> {
    if let Some(declared) = file.media_type.as_deref() {
        return declared
            .starts_with("image/")
            .then(|| declared.to_owned());
    }
    let guessed = mime_guess::from_path(&file.filename).first()?;
    (guessed.type_() == mime_guess::mime::IMAGE).then(|| guessed.essence_str().to_owned())
}

#[cfg(test)]
#[path = "tests/staging_tests.rs"]
mod tests;
