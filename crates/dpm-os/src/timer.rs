use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dpm::config::{TimerConfig, TimerKind, check_timer_id};
use dpm::error::{DmError, Result};
use dpm::job::JobId;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tracing::{debug, info};

use crate::callbacks::SharedTimerCallback;
use crate::coordinator::Coordinator;
use crate::events::DpmEvent;

struct ArmedTimer {
    config: TimerConfig,
    generation: u64,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<u8, ArmedTimer>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<u8, ArmedTimer>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

// Application timers.
//
// A timer task only takes the job guard and queues the event: callbacks run
// on the event dispatcher.
#[derive(Clone)]
pub(crate) struct TimerRegistry {
    coordinator: Coordinator,
    events: mpsc::Sender<DpmEvent>,
    slots: Slots,
    generation: Arc<AtomicU64>,
}

impl TimerRegistry {
    pub(crate) fn new(coordinator: Coordinator, events: mpsc::Sender<DpmEvent>) -> Self {
        Self {
            coordinator,
            events,
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn create(
        &self,
        id: u8,
        config: TimerConfig,
        callback: SharedTimerCallback,
    ) -> Result<()> {
        check_timer_id(id)?;
        config.validate()?;

        let mut slots = lock(&self.slots);
        if slots.contains_key(&id) {
            return Err(DmError::AlreadyExist);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_timer(
            id,
            config,
            generation,
            callback,
            self.coordinator.clone(),
            self.events.clone(),
            self.slots.clone(),
        ));

        let _ = slots.insert(
            id,
            ArmedTimer {
                config,
                generation,
                handle,
            },
        );
        info!("Timer `{id}` armed: {} every {} s", config.kind, config.interval_s);
        Ok(())
    }

    // Returns whether a timer was armed with that identifier.
    pub(crate) fn unset(&self, id: u8) -> Result<bool> {
        check_timer_id(id)?;

        let Some(timer) = lock(&self.slots).remove(&id) else {
            return Ok(false);
        };
        timer.handle.abort();
        debug!("Timer `{id}` unset");
        Ok(true)
    }

    pub(crate) fn unset_all(&self) {
        for (_, timer) in lock(&self.slots).drain() {
            timer.handle.abort();
        }
    }

    pub(crate) fn active(&self) -> Vec<(u8, TimerConfig)> {
        let mut active: Vec<_> = lock(&self.slots)
            .iter()
            .map(|(id, timer)| (*id, timer.config))
            .collect();
        active.sort_unstable_by_key(|(id, _)| *id);
        active
    }
}

async fn run_timer(
    id: u8,
    config: TimerConfig,
    generation: u64,
    callback: SharedTimerCallback,
    coordinator: Coordinator,
    events: mpsc::Sender<DpmEvent>,
    slots: Slots,
) {
    let period = config.interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _ = interval.tick().await;

        let job = coordinator.start(JobId::Timer(id));
        let event = DpmEvent::Timer {
            id,
            callback: callback.clone(),
            job,
        };
        if events.send(event).await.is_err() {
            debug!("Event dispatcher stopped, timer `{id}` ends");
            break;
        }

        if config.kind == TimerKind::OneShot {
            let mut slots = lock(&slots);
            // The identifier may have been reused meanwhile.
            if slots.get(&id).is_some_and(|timer| timer.generation == generation) {
                let _ = slots.remove(&id);
            }
            break;
        }
    }
}
