use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use crate::callbacks::{KeepaliveEvent, SharedSessionCallbacks, SharedTimerCallback, TimerEvent};
use crate::coordinator::Job;
use crate::manager::WeakManager;

// The capacity of the bounded event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

// Events dispatched, one at a time, by the event task.
pub(crate) enum DpmEvent {
    Timer {
        id: u8,
        callback: SharedTimerCallback,
        job: Job,
    },
    Keepalive {
        session: u8,
        callbacks: SharedSessionCallbacks,
        job: Job,
    },
}

async fn run_event_dispatcher(
    manager: WeakManager,
    mut receiver: mpsc::Receiver<DpmEvent>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            event = receiver.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(manager) = manager.upgrade() else {
                    warn!("Manager dropped, stop dispatching events");
                    break;
                };

                match event {
                    DpmEvent::Timer { id, callback, job } => {
                        debug!("Dispatch timer `{id}`");
                        callback.on_fire(TimerEvent { timer: id, job, manager }).await;
                    }
                    DpmEvent::Keepalive { session, callbacks, job } => {
                        debug!("Dispatch keepalive of session `{session}`");
                        callbacks
                            .on_keepalive(KeepaliveEvent { session, job, manager })
                            .await;
                    }
                }
            }
        }
    }
    // Queued events release their jobs here.
    receiver.close();
    while receiver.try_recv().is_ok() {}
}

// The task which runs timer and keepalive callbacks sequentially.
#[derive(Debug)]
pub(crate) struct EventDispatcher {
    sender: mpsc::Sender<DpmEvent>,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventDispatcher {
    pub(crate) fn spawn(manager: WeakManager) -> Self {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(run_event_dispatcher(
            manager,
            receiver,
            cancellation_token.clone(),
        ));

        Self {
            sender,
            cancellation_token,
            handle,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<DpmEvent> {
        self.sender.clone()
    }

    // Stops the task without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub(crate) async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Event dispatcher ended abnormally: {e}");
        }
    }
}
