use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Raw input from the control. Pointer and touch sources map onto the
/// same press/release pair; leaving the control while pressed is a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressEvent {
    PointerDown,
    PointerUp,
    PointerLeave,
    TouchStart,
    TouchEnd,
    TouchCancel,
}

impl PressEvent {
    pub fn is_press(&self) -> bool {
        matches!(self, PressEvent::PointerDown | PressEvent::TouchStart)
    }
}

/// Emitted once per completed hold.
#[derive(Debug, Clone, Copy)]
pub struct Activation {
    pub fired_at: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GestureError {
    #[error("hold gesture is already bound to a control")]
    AlreadyBound,
}

#[derive(Default)]
struct HoldState {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Debounces a press into a deliberate hold of at least `hold` duration.
pub struct HoldGesture {
    hold: Duration,
    state: Arc<Mutex<HoldState>>,
    activations: mpsc::UnboundedSender<Activation>,
    bound: AtomicBool,
}

impl HoldGesture {
    pub fn new(hold: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Activation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gesture = Arc::new(Self {
            hold,
            state: Arc::new(Mutex::new(HoldState::default())),
            activations: tx,
            bound: AtomicBool::new(false),
        });
        (gesture, rx)
    }

    pub fn is_holding(&self) -> bool {
        self.lock_state().timer.is_some()
    }

    /// Begins a hold. Returns false (and changes nothing) if one is already
    /// in progress.
    pub fn start(&self) -> bool {
        let mut state = self.lock_state();
        if state.timer.is_some() {
            return false;
        }
        state.generation += 1;
        let generation = state.generation;

        let shared = Arc::clone(&self.state);
        let activations = self.activations.clone();
        let hold = self.hold;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let fire = {
                let mut state = match shared.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // A cancel that won the lock, or a newer hold, owns the state now.
                if state.generation == generation && state.timer.is_some() {
                    state.timer = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                info!("Hold completed after {:?}, activating", hold);
                let _ = activations.send(Activation {
                    fired_at: Instant::now(),
                });
            }
        }));
        debug!("Hold started");
        true
    }

    /// Abandons a hold in progress. Returns false if there was none.
    pub fn cancel(&self) -> bool {
        match self.lock_state().timer.take() {
            Some(timer) => {
                timer.abort();
                debug!("Hold canceled before activation");
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, event: PressEvent) {
        if event.is_press() {
            self.start();
        } else {
            self.cancel();
        }
    }

    /// Wires a stream of press events to this gesture. A gesture can be
    /// bound to one control at a time; drop or tear down the returned
    /// binding to release it.
    pub fn bind(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<PressEvent>,
    ) -> Result<GestureBinding, GestureError> {
        if self
            .bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GestureError::AlreadyBound);
        }

        let gesture = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                gesture.handle(event);
            }
            gesture.cancel();
        });

        Ok(GestureBinding {
            gesture: Arc::clone(self),
            task,
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HoldState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Teardown handle returned by [`HoldGesture::bind`].
pub struct GestureBinding {
    gesture: Arc<HoldGesture>,
    task: JoinHandle<()>,
}

impl GestureBinding {
    pub fn teardown(self) {}
}

impl Drop for GestureBinding {
    fn drop(&mut self) {
        self.task.abort();
        self.gesture.cancel();
        self.gesture.bound.store(false, Ordering::Release);
    }
}
