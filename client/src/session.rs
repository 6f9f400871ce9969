use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::source::LatestFrame;
use crate::store::{MediaStore, SaveError};
use crate::submit::{DetectionImage, SubmissionError, Submitter};

pub const DETECT_LABEL: &str = "Detect Objects";
pub const CANCEL_LABEL: &str = "Cancel";

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    /// One submission in flight, identified by its ticket.
    Capturing { ticket: u64 },
    Showing(DetectionImage),
}

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Capture,
    Cancel,
    Save,
    /// The single toggle button: Cancel while a result is shown, Capture otherwise.
    Primary,
}

/// Background work finishing, redelivered onto the controller task.
#[derive(Debug)]
pub enum Completion {
    Submitted {
        ticket: u64,
        result: Result<DetectionImage, SubmissionError>,
    },
    Saved(Result<PathBuf, SaveError>),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no frame available from the camera yet")]
    NoFrameAvailable,
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Save(#[from] SaveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Idle,
    Capturing,
    Showing { width: u32, height: u32 },
}

/// Read-only rendering of the session for the front-end.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub view: View,
    /// False while a submission is in flight.
    pub trigger_enabled: bool,
    pub primary_label: &'static str,
    pub can_save: bool,
    /// Most recent capture or save failure, cleared by the next capture attempt.
    pub last_error: Option<String>,
    pub result: Option<DetectionImage>,
}

impl SessionSnapshot {
    fn idle() -> Self {
        Self {
            view: View::Idle,
            trigger_enabled: true,
            primary_label: DETECT_LABEL,
            can_save: false,
            last_error: None,
            result: None,
        }
    }
}

/// Owns the session state machine.
///
/// Every mutation happens through [`handle_intent`](Self::handle_intent) or
/// [`handle_completion`](Self::handle_completion), called from one task.
/// Submissions and saves run on spawned tasks and report back through the
/// completion channel.
pub struct SessionController<S, M> {
    state: SessionState,
    frames: LatestFrame,
    submitter: Arc<S>,
    store: Arc<M>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshots: watch::Sender<SessionSnapshot>,
    next_ticket: u64,
    last_error: Option<String>,
}

impl<S: Submitter, M: MediaStore> SessionController<S, M> {
    pub fn new(frames: LatestFrame, submitter: Arc<S>, store: Arc<M>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(SessionSnapshot::idle());
        Self {
            state: SessionState::Idle,
            frames,
            submitter,
            store,
            completions_tx,
            completions_rx,
            snapshots,
            next_ticket: 0,
            last_error: None,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn trigger_enabled(&self) -> bool {
        !matches!(self.state, SessionState::Capturing { .. })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (view, result) = match &self.state {
            SessionState::Idle => (View::Idle, None),
            SessionState::Capturing { .. } => (View::Capturing, None),
            SessionState::Showing(image) => (
                View::Showing {
                    width: image.width(),
                    height: image.height(),
                },
                Some(image.clone()),
            ),
        };
        let showing = result.is_some();
        SessionSnapshot {
            view,
            trigger_enabled: self.trigger_enabled(),
            primary_label: if showing { CANCEL_LABEL } else { DETECT_LABEL },
            can_save: showing,
            last_error: self.last_error.clone(),
            result,
        }
    }

    /// Apply a user intent. Only local failures are returned; submission
    /// outcomes arrive later as a [`Completion`].
    pub fn handle_intent(&mut self, intent: Intent) -> Result<(), SessionError> {
        let result = match intent {
            Intent::Capture => self.capture(),
            Intent::Cancel => {
                self.cancel();
                Ok(())
            }
            Intent::Save => {
                self.save();
                Ok(())
            }
            Intent::Primary => {
                if matches!(self.state, SessionState::Showing(_)) {
                    self.cancel();
                    Ok(())
                } else {
                    self.capture()
                }
            }
        };
        self.publish();
        result
    }

    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Submitted { ticket, result } => self.finish_submission(ticket, result),
            Completion::Saved(Ok(path)) => {
                info!(path = path.display().to_string(), "detection saved to media store");
            }
            Completion::Saved(Err(e)) => {
                warn!(error = %e, "failed to save detection");
                self.last_error = Some(SessionError::from(e).to_string());
            }
        }
        self.publish();
    }

    /// Wait for the next background completion.
    #[allow(dead_code)]
    pub async fn next_completion(&mut self) -> Completion {
        match self.completions_rx.recv().await {
            Some(completion) => completion,
            // The controller holds a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// Drive the session until the intent channel closes.
    pub async fn run(mut self, mut intents: mpsc::Receiver<Intent>) {
        self.publish();
        loop {
            tokio::select! {
                intent = intents.recv() => {
                    let Some(intent) = intent else {
                        info!("intent channel closed, stopping session");
                        break;
                    };
                    if let Err(e) = self.handle_intent(intent) {
                        warn!(error = %e, ?intent, "intent rejected");
                    }
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }
            }
        }
    }

    fn capture(&mut self) -> Result<(), SessionError> {
        if let SessionState::Capturing { ticket } = self.state {
            debug!(ticket, "capture ignored, submission already in flight");
            return Ok(());
        }
        if matches!(self.state, SessionState::Showing(_)) {
            debug!("discarding displayed result for new capture");
            self.state = SessionState::Idle;
        }

        let Some(frame) = self.frames.latest() else {
            let err = SessionError::NoFrameAvailable;
            self.last_error = Some(err.to_string());
            return Err(err);
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.last_error = None;
        self.state = SessionState::Capturing { ticket };

        info!(
            ticket,
            seq = frame.seq,
            captured_at = %frame.captured_at(),
            bytes = frame.payload_size(),
            "IDLE→CAPTURING: submitting frame"
        );

        let submitter = Arc::clone(&self.submitter);
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            // A panicking submit still has to report back exactly once.
            let result = AssertUnwindSafe(submitter.submit(frame))
                .catch_unwind()
                .await
                .unwrap_or(Err(SubmissionError::Aborted));
            let _ = tx.send(Completion::Submitted { ticket, result });
        });

        Ok(())
    }

    fn cancel(&mut self) {
        if matches!(self.state, SessionState::Showing(_)) {
            info!("SHOWING→IDLE: result dismissed");
            self.state = SessionState::Idle;
        } else {
            debug!("cancel ignored, nothing displayed");
        }
    }

    fn save(&mut self) {
        let SessionState::Showing(image) = &self.state else {
            debug!("save ignored, nothing displayed");
            return;
        };

        let image = image.clone();
        let store = Arc::clone(&self.store);
        let tx = self.completions_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(Completion::Saved(store.save(&image)));
        });
    }

    fn finish_submission(&mut self, ticket: u64, result: Result<DetectionImage, SubmissionError>) {
        match self.state {
            SessionState::Capturing { ticket: current } if current == ticket => {}
            _ => {
                debug!(ticket, "stale submission result dropped");
                return;
            }
        }

        match result {
            Ok(image) => {
                info!(
                    ticket,
                    width = image.width(),
                    height = image.height(),
                    "CAPTURING→SHOWING: detection received"
                );
                self.state = SessionState::Showing(image);
            }
            Err(e) => {
                warn!(ticket, error = %e, "CAPTURING→IDLE: submission failed");
                self.last_error = Some(SessionError::from(e).to_string());
                self.state = SessionState::Idle;
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}
