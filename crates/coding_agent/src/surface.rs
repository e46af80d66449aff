//! Edit presentation surface and streaming diff previews.

use std::sync::{Arc, Mutex, MutexGuard};

use reconcile_engine::{parse_fragments, Reconciler};
use thiserror::Error;

pub type ViewId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("diff view {0} does not exist")]
    NotFound(ViewId),
    #[error("edit surface unavailable: {0}")]
    Unavailable(String),
}

/// Collaborator that shows a proposed file body next to the original.
///
/// Line numbers are zero-based; `end_line` is exclusive.
pub trait EditSurface: Send {
    fn open_diff(&mut self, path: &str, original: &str) -> Result<ViewId, SurfaceError>;

    fn replace_text(
        &mut self,
        view: ViewId,
        text: &str,
        start_line: usize,
        end_line: usize,
    ) -> Result<(), SurfaceError>;

    fn scroll_to(&mut self, view: ViewId, line: usize) -> Result<(), SurfaceError>;

    fn close(&mut self, view: ViewId) -> Result<(), SurfaceError>;
}

/// Surface for headless runs: every view exists and nothing is drawn.
#[derive(Debug, Default)]
pub struct NullSurface {
    next_view: ViewId,
}

impl EditSurface for NullSurface {
    fn open_diff(&mut self, _path: &str, _original: &str) -> Result<ViewId, SurfaceError> {
        self.next_view += 1;
        Ok(self.next_view)
    }

    fn replace_text(
        &mut self,
        _view: ViewId,
        _text: &str,
        _start_line: usize,
        _end_line: usize,
    ) -> Result<(), SurfaceError> {
        Ok(())
    }

    fn scroll_to(&mut self, _view: ViewId, _line: usize) -> Result<(), SurfaceError> {
        Ok(())
    }

    fn close(&mut self, _view: ViewId) -> Result<(), SurfaceError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceOp {
    Open { view: ViewId, path: String },
    Replace {
        view: ViewId,
        text: String,
        start_line: usize,
        end_line: usize,
    },
    Scroll { view: ViewId, line: usize },
    Close { view: ViewId },
}

/// Surface that records every call. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Debug, Default)]
struct RecordingInner {
    ops: Vec<SurfaceOp>,
    open: Vec<ViewId>,
    next_view: ViewId,
}

impl RecordingSurface {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ops(&self) -> Vec<SurfaceOp> {
        lock_unpoisoned(&self.inner).ops.clone()
    }

    #[must_use]
    pub fn open_views(&self) -> Vec<ViewId> {
        lock_unpoisoned(&self.inner).open.clone()
    }

    fn with_open_view<F>(&self, view: ViewId, op: F) -> Result<(), SurfaceError>
    where
        F: FnOnce(&mut RecordingInner) -> SurfaceOp,
    {
        let mut inner = lock_unpoisoned(&self.inner);
        if !inner.open.contains(&view) {
            return Err(SurfaceError::NotFound(view));
        }
        let op = op(&mut inner);
        inner.ops.push(op);
        Ok(())
    }
}

impl EditSurface for RecordingSurface {
    fn open_diff(&mut self, path: &str, _original: &str) -> Result<ViewId, SurfaceError> {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.next_view += 1;
        let view = inner.next_view;
        inner.open.push(view);
        inner.ops.push(SurfaceOp::Open {
            view,
            path: path.to_string(),
        });
        Ok(view)
    }

    fn replace_text(
        &mut self,
        view: ViewId,
        text: &str,
        start_line: usize,
        end_line: usize,
    ) -> Result<(), SurfaceError> {
        self.with_open_view(view, |_| SurfaceOp::Replace {
            view,
            text: text.to_string(),
            start_line,
            end_line,
        })
    }

    fn scroll_to(&mut self, view: ViewId, line: usize) -> Result<(), SurfaceError> {
        self.with_open_view(view, |_| SurfaceOp::Scroll { view, line })
    }

    fn close(&mut self, view: ViewId) -> Result<(), SurfaceError> {
        self.with_open_view(view, |inner| {
            inner.open.retain(|open| *open != view);
            SurfaceOp::Close { view }
        })
    }
}

/// Live preview of one file edit while its action is still streaming.
#[derive(Debug)]
pub struct StreamingEdit {
    path: String,
    view: ViewId,
    original: String,
    reconciler: Reconciler,
    shown: String,
}

impl StreamingEdit {
    pub fn open(
        surface: &mut dyn EditSurface,
        path: &str,
        original: &str,
    ) -> Result<Self, SurfaceError> {
        let view = surface.open_diff(path, original)?;
        Ok(Self {
            path: path.to_string(),
            view,
            original: original.to_string(),
            reconciler: Reconciler::new(original),
            shown: original.to_string(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn view(&self) -> ViewId {
        self.view
    }

    /// Shows a whole-file body that is still arriving.
    pub fn show_content(&mut self, surface: &mut dyn EditSurface, content: &str) {
        let reveal = content.lines().count().saturating_sub(1);
        self.show(surface, content, reveal);
    }

    /// Shows the result of the search/replace blocks received so far.
    ///
    /// Fragments that do not match yet are not an error while streaming; the
    /// preview simply keeps its last good state.
    pub fn show_diff(&mut self, surface: &mut dyn EditSurface, diff: &str) {
        let fragments = match parse_fragments(diff) {
            Ok(fragments) => fragments,
            Err(error) => {
                tracing::debug!(path = self.path.as_str(), %error, "preview diff not parseable yet");
                return;
            }
        };

        let update = match self.reconciler.update(&fragments, false) {
            Ok(update) => update,
            Err(error) => {
                tracing::debug!(path = self.path.as_str(), %error, "preview reconcile failed");
                self.reconciler = Reconciler::new(&self.original);
                return;
            }
        };

        let reveal = update
            .provisional
            .as_ref()
            .map(|edit| edit.output_lines.start)
            .or_else(|| update.confirmed.last().map(|edit| edit.output_lines.start))
            .unwrap_or(0);
        self.show(surface, &update.content, reveal);
    }

    /// Replaces the preview with the final proposed body.
    pub fn finish(&mut self, surface: &mut dyn EditSurface, proposed: &str) {
        self.show(surface, proposed, 0);
    }

    pub fn close(self, surface: &mut dyn EditSurface) {
        log_stale(surface.close(self.view), "close");
    }

    fn show(&mut self, surface: &mut dyn EditSurface, content: &str, reveal: usize) {
        if content == self.shown {
            return;
        }
        let shown_lines = self.shown.lines().count();
        log_stale(
            surface.replace_text(self.view, content, 0, shown_lines),
            "replace_text",
        );
        log_stale(surface.scroll_to(self.view, reveal), "scroll_to");
        self.shown = content.to_string();
    }
}

/// Surface failures never abort an action.
pub fn log_stale(result: Result<(), SurfaceError>, operation: &'static str) {
    if let Err(error) = result {
        tracing::debug!(operation, %error, "edit surface call ignored");
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
