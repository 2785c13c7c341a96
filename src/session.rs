//! Interactive multi-step USSD sessions.
//!
//! A session is driven by two push sources: screens captured by the
//! [`SessionDriver`] and replies submitted by the caller. They strictly
//! alternate. At most one session exists per [`SessionManager`]; its state
//! sits behind a mutex that is never held across an await.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{UssdError, UssdResult};
use crate::platform::{ScreenUpdate, SessionDriver, SessionEvent};

/// Lifecycle of the interactive session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingFirstScreen,
    AwaitingReply,
    AwaitingNextScreen,
    Completed,
    Cancelled,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingFirstScreen
                | SessionState::AwaitingReply
                | SessionState::AwaitingNextScreen
        )
    }
}

/// What a pending start or reply resolves with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The next screen's text, `None` when it carried none
    Prompt(Option<String>),
    /// The session ended with this message
    Finished(String),
}

impl ReplyOutcome {
    /// Payload as seen by the caller
    pub fn into_text(self) -> Option<String> {
        match self {
            ReplyOutcome::Prompt(text) => text,
            ReplyOutcome::Finished(message) => Some(message),
        }
    }
}

/// Outbound half of the caller's reply channel
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn push(&self, message: &str) -> anyhow::Result<()>;
}

struct ActiveSession {
    generation: u64,
    event: Option<Arc<SessionEvent>>,
    /// Resolved by the next screen or by the end of the session
    waiter: Option<oneshot::Sender<ReplyOutcome>>,
    /// Whether caller replies are accepted
    listening: bool,
    stop: CancellationToken,
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    active: Option<ActiveSession>,
    next_generation: u64,
}

struct Inner {
    driver: Arc<dyn SessionDriver>,
    channel: Arc<dyn ReplyChannel>,
    slot: Mutex<Slot>,
}

/// Owns the single interactive session slot
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn SessionDriver>, channel: Arc<dyn ReplyChannel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                channel,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Open a session on `slot` and wait for its first screen.
    ///
    /// Resolves with the first prompt (or `None` for a textless screen), or
    /// with the final message if the session ends before showing one.
    pub async fn start(&self, code: &str, slot: u32) -> UssdResult<Option<String>> {
        let (waiter, first_screen) = oneshot::channel();
        let stop = CancellationToken::new();
        let generation = {
            let mut guard = self.inner.lock();
            if guard.active.is_some() {
                return Err(UssdError::execution("multisession USSD already active"));
            }
            let generation = guard.next_generation;
            guard.next_generation += 1;
            guard.active = Some(ActiveSession {
                generation,
                event: None,
                waiter: Some(waiter),
                listening: false,
                stop: stop.clone(),
            });
            guard.state = SessionState::AwaitingFirstScreen;
            generation
        };
        info!("Starting multisession USSD {} on slot {}", code, slot);

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.inner.driver.invoke(code, slot, updates_tx).await {
            warn!("Could not open USSD dialog: {}", e);
            let mut guard = self.inner.lock();
            if guard.is_current(generation) {
                guard.active = None;
                guard.state = SessionState::Idle;
            }
            return Err(e);
        }

        tokio::spawn(pump(self.inner.clone(), generation, updates_rx, stop));

        match first_screen.await {
            Ok(outcome) => Ok(outcome.into_text()),
            // Cancelled before the first screen
            Err(_) => Ok(None),
        }
    }

    /// Handle a message on the reply channel.
    ///
    /// Returns `None` when the message is dropped: a null message, no session
    /// listening, or a previous reply still waiting for its screen.
    pub async fn reply(&self, message: Option<&str>) -> Option<ReplyOutcome> {
        let Some(text) = message else {
            warn!("Dropping null reply");
            return None;
        };

        let (generation, event, mut next_screen) = {
            let mut guard = self.inner.lock();
            let state = guard.state;
            let Some(active) = guard.active.as_mut() else {
                debug!("Dropping reply with no active session");
                return None;
            };
            if !active.listening || state != SessionState::AwaitingReply {
                warn!("Dropping reply while {:?}", state);
                return None;
            }
            let event = active.event.clone()?;
            let (waiter, next_screen) = oneshot::channel();
            active.waiter = Some(waiter);
            let generation = active.generation;
            guard.state = SessionState::AwaitingNextScreen;
            (generation, event, next_screen)
        };
        debug!("Relaying reply {:?}", text);

        if let Err(e) = self.inner.driver.send_reply(text, &event).await {
            warn!("Reply could not be delivered: {}", e);
            let mut guard = self.inner.lock();
            // The waiter is resolved under this lock, so a screen that made
            // it through despite the error is already here
            if let Ok(outcome) = next_screen.try_recv() {
                return Some(outcome);
            }
            if guard.is_current(generation) && guard.state == SessionState::AwaitingNextScreen {
                guard.state = SessionState::AwaitingReply;
                if let Some(active) = guard.active.as_mut() {
                    active.waiter = None;
                }
            }
            return Some(ReplyOutcome::Prompt(None));
        }

        match next_screen.await {
            Ok(outcome) => Some(outcome),
            Err(_) => Some(ReplyOutcome::Prompt(None)),
        }
    }

    /// Tear down the current session, if any. Idempotent.
    pub async fn cancel(&self) {
        let taken = {
            let mut guard = self.inner.lock();
            let taken = guard.active.take();
            if taken.is_some() {
                guard.state = SessionState::Cancelled;
            }
            taken
        };
        let Some(active) = taken else {
            debug!("Cancel with no active session");
            return;
        };

        active.stop.cancel();
        // Dropping the waiter wakes a pending start or reply with no text
        drop(active.waiter);
        if let Some(event) = active.event {
            self.inner.driver.cancel(&event).await;
        }
        info!("Multisession USSD cancelled");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic while holding the slot leaves plain data behind; keep going
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_screen(&self, generation: u64, event: SessionEvent) {
        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return;
        }
        let prompt = event.prompt();
        guard.state = SessionState::AwaitingReply;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        active.event = Some(Arc::new(event));
        active.listening = true;
        match active.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(ReplyOutcome::Prompt(prompt));
            }
            None => debug!("Screen replaced with nobody waiting"),
        }
    }

    async fn on_over(&self, generation: u64, message: String) {
        let active = {
            let mut guard = self.lock();
            if !guard.is_current(generation) {
                return;
            }
            guard.state = SessionState::Completed;
            guard.active.take()
        };
        info!("Multisession USSD over");

        if let Err(e) = self.channel.push(&message).await {
            debug!("Final message push failed: {}", e);
        }
        if let Some(waiter) = active.and_then(|a| a.waiter) {
            let _ = waiter.send(ReplyOutcome::Finished(message));
        }
    }

    fn on_closed(&self, generation: u64) {
        let mut guard = self.lock();
        if !guard.is_current(generation) {
            return;
        }
        warn!("Session driver stopped without ending the session");
        guard.state = SessionState::Idle;
        if let Some(waiter) = guard.active.take().and_then(|a| a.waiter) {
            let _ = waiter.send(ReplyOutcome::Prompt(None));
        }
    }
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }
}

/// Forward driver updates into the slot until the session ends
async fn pump(
    inner: Arc<Inner>,
    generation: u64,
    mut updates: mpsc::UnboundedReceiver<ScreenUpdate>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            update = updates.recv() => match update {
                Some(ScreenUpdate::Screen(event)) => inner.on_screen(generation, event),
                Some(ScreenUpdate::Over(message)) => {
                    inner.on_over(generation, message).await;
                    break;
                }
                None => {
                    inner.on_closed(generation);
                    break;
                }
            },
        }
    }
    debug!("Session pump {} finished", generation);
}
