//! Per-entry editing session with debounced autosave.
//!
//! Every text change resets a timer; once the entry has been quiet for the
//! configured interval the timer commits the store. A successful commit
//! appends a checkpoint to the undo history and emits a notification.
//! Leaving edit mode ("preview") commits right away.
//!
//! ```text
//!   Idle ──text_changed──▶ Editing ──quiet interval──▶ Saving ──ok──▶ Idle
//!                           ▲   │                                 │
//!                           └───┘ text_changed resets the timer   └─err─▶ Editing
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DiaryConfig;
use crate::error::{DiaryError, Result};
use crate::store::DiaryStore;

pub const SAVED_MESSAGE: &str = "Journal saved.";
const NOTIFICATION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorState {
    /// Nothing waiting to be saved.
    Idle,
    /// Unsaved changes with an autosave timer pending.
    Editing,
    /// A commit is in flight.
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPhase {
    Shown,
    FadedIn,
    FadingOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub fade_in_delay: Duration,
    pub fade_out_after: Duration,
}

impl Notification {
    /// Display phase `elapsed` after the notification was raised.
    pub fn phase(&self, elapsed: Duration) -> NotificationPhase {
        if elapsed >= self.fade_out_after {
            NotificationPhase::FadingOut
        } else if elapsed >= self.fade_in_delay {
            NotificationPhase::FadedIn
        } else {
            NotificationPhase::Shown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorSettings {
    pub quiet_interval: Duration,
    pub fade_in_delay: Duration,
    pub fade_out_after: Duration,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self::from(&DiaryConfig::default())
    }
}

impl From<&DiaryConfig> for EditorSettings {
    fn from(config: &DiaryConfig) -> Self {
        Self {
            quiet_interval: config.autosave.quiet_interval(),
            fade_in_delay: config.notifications.fade_in_delay(),
            fade_out_after: config.notifications.fade_out_after(),
        }
    }
}

#[derive(Debug)]
struct Session {
    state: EditorState,
    editing_text: bool,
    editing_title: bool,
    original_text: String,
    original_title: String,
    history: Vec<String>,
    /// Number of live checkpoints; `history[checkpoint - 1]` is current.
    checkpoint: usize,
    notifications: Vec<Notification>,
}

#[derive(Debug, Default)]
struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Inner {
    runtime: Handle,
    store: Arc<DiaryStore>,
    entry_id: String,
    settings: EditorSettings,
    session: Mutex<Session>,
    timer: Mutex<Timer>,
    notices: broadcast::Sender<Notification>,
}

/// Editing session for one entry. Sessions for different entries have
/// independent timers.
///
/// The editor must be created inside a tokio runtime; its autosave timers
/// run on that runtime even when edits arrive from other threads.
///
/// Dropping the editor cancels a pending autosave; call
/// [`preview`](Self::preview) first to keep the changes.
pub struct EntryEditor {
    inner: Arc<Inner>,
}

impl EntryEditor {
    pub fn new(store: Arc<DiaryStore>, entry_id: &str, settings: EditorSettings) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| DiaryError::NoRuntime(e.to_string()))?;
        let entry = store.get(entry_id)?;
        let (notices, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                store,
                entry_id: entry.id,
                settings,
                session: Mutex::new(Session {
                    state: EditorState::Idle,
                    editing_text: false,
                    editing_title: false,
                    original_text: entry.text.clone(),
                    original_title: entry.title,
                    history: vec![entry.text],
                    checkpoint: 1,
                    notifications: Vec::new(),
                }),
                timer: Mutex::new(Timer::default()),
                notices,
            }),
        })
    }

    pub fn entry_id(&self) -> &str {
        &self.inner.entry_id
    }

    /// Enter edit mode, anchoring the undo history at the current text.
    pub fn start_editing(&self) -> Result<()> {
        let text = self.inner.store.get(&self.inner.entry_id)?.text;
        let mut session = self.inner.session.lock();
        session.editing_text = true;
        session.original_text = text.clone();
        if session.history.get(session.checkpoint - 1) != Some(&text) {
            let at = session.checkpoint;
            session.history.truncate(at);
            session.history.push(text);
            session.checkpoint += 1;
        }
        Ok(())
    }

    /// Apply an edit and restart the quiet-period timer.
    pub fn text_changed(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.inner
            .store
            .update_entry(&self.inner.entry_id, |e| e.text = text)?;
        self.inner.session.lock().state = EditorState::Editing;
        self.schedule_autosave();
        Ok(())
    }

    fn schedule_autosave(&self) {
        let mut timer = self.inner.timer.lock();
        timer.cancel();
        let generation = timer.generation;
        let inner = Arc::clone(&self.inner);
        timer.handle = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(inner.settings.quiet_interval).await;
            {
                let mut timer = inner.timer.lock();
                if timer.generation != generation {
                    return;
                }
                // Detach so a later edit cannot abort this commit midway.
                timer.handle = None;
            }
            if let Err(e) = inner.save().await {
                warn!(entry = %inner.entry_id, "autosave failed: {e}");
            }
        }));
        debug!(entry = %self.inner.entry_id, "autosave scheduled");
    }

    /// Commit now, cancelling any pending timer.
    pub async fn autosave(&self) -> Result<()> {
        self.inner.timer.lock().cancel();
        self.inner.save().await
    }

    /// Leave edit mode and commit regardless of the timer.
    pub async fn preview(&self) -> Result<()> {
        self.inner.session.lock().editing_text = false;
        self.autosave().await
    }

    /// Step back one checkpoint. Returns false at the oldest checkpoint.
    pub fn undo(&self) -> Result<bool> {
        let text = {
            let mut session = self.inner.session.lock();
            if session.checkpoint <= 1 {
                return Ok(false);
            }
            session.checkpoint -= 1;
            session.history[session.checkpoint - 1].clone()
        };
        self.restore_text(text)
    }

    /// Step forward again after [`undo`](Self::undo).
    pub fn redo(&self) -> Result<bool> {
        let text = {
            let mut session = self.inner.session.lock();
            if session.checkpoint >= session.history.len() {
                return Ok(false);
            }
            session.checkpoint += 1;
            session.history[session.checkpoint - 1].clone()
        };
        self.restore_text(text)
    }

    fn restore_text(&self, text: String) -> Result<bool> {
        self.inner.timer.lock().cancel();
        self.inner
            .store
            .update_entry(&self.inner.entry_id, |e| e.text = text)?;
        Ok(true)
    }

    pub fn start_title_editing(&self) -> Result<()> {
        let title = self.inner.store.get(&self.inner.entry_id)?.title;
        let mut session = self.inner.session.lock();
        session.editing_title = true;
        session.original_title = title;
        Ok(())
    }

    pub fn set_title(&self, title: impl Into<String>) -> Result<()> {
        let title = title.into();
        self.inner
            .store
            .update_entry(&self.inner.entry_id, |e| e.title = title)?;
        Ok(())
    }

    /// Leave title editing and commit immediately.
    pub async fn save_title(&self) -> Result<()> {
        self.inner.session.lock().editing_title = false;
        self.inner.store.commit().await
    }

    /// Leave title editing, restoring the title it started with.
    pub fn cancel_title_editing(&self) -> Result<()> {
        let original = {
            let mut session = self.inner.session.lock();
            session.editing_title = false;
            session.original_title.clone()
        };
        self.set_title(original)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notices.subscribe()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.session.lock().notifications.clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.inner.session.lock().history.clone()
    }

    pub fn checkpoint(&self) -> usize {
        self.inner.session.lock().checkpoint
    }

    pub fn state(&self) -> EditorState {
        self.inner.session.lock().state
    }

    pub fn is_editing_text(&self) -> bool {
        self.inner.session.lock().editing_text
    }

    pub fn is_editing_title(&self) -> bool {
        self.inner.session.lock().editing_title
    }

    /// Text the current edit session started from.
    pub fn original_text(&self) -> String {
        self.inner.session.lock().original_text.clone()
    }
}

impl Drop for EntryEditor {
    fn drop(&mut self) {
        self.inner.timer.lock().cancel();
    }
}

impl Inner {
    /// Commit the store and checkpoint the text that reached disk. An edit
    /// that arrives while the write is in flight leaves the editor in
    /// `Editing` with its own autosave still pending.
    async fn save(&self) -> Result<()> {
        let generation = self.timer.lock().generation;
        self.session.lock().state = EditorState::Saving;
        match self.store.commit_snapshot().await {
            Ok(written) => {
                let text = written.entry(&self.entry_id).map(|e| e.text.clone());
                let superseded = self.timer.lock().generation != generation;
                let mut session = self.session.lock();
                if let Some(text) = text {
                    save_checkpoint(&mut session, text);
                }
                session.state = if superseded {
                    EditorState::Editing
                } else {
                    EditorState::Idle
                };
                self.notify(&mut session, NotificationKind::Success, SAVED_MESSAGE.into());
                Ok(())
            }
            Err(e) => {
                let mut session = self.session.lock();
                session.state = EditorState::Editing;
                self.notify(
                    &mut session,
                    NotificationKind::Failure,
                    format!("Journal could not be saved: {e}"),
                );
                Err(e)
            }
        }
    }

    fn notify(&self, session: &mut Session, kind: NotificationKind, message: String) {
        let notice = Notification {
            kind,
            message,
            created_at: Utc::now(),
            fade_in_delay: self.settings.fade_in_delay,
            fade_out_after: self.settings.fade_out_after,
        };
        debug!(entry = %self.entry_id, kind = ?notice.kind, "{}", notice.message);
        session.notifications.push(notice.clone());
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

/// Drop any redo branch and append `text`, unless it is already the
/// checkpoint under the cursor.
fn save_checkpoint(session: &mut Session, text: String) {
    if session.history.get(session.checkpoint - 1) == Some(&text) {
        return;
    }
    let at = session.checkpoint;
    session.history.truncate(at);
    session.history.push(text);
    session.checkpoint += 1;
}
