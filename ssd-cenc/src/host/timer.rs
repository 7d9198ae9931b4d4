use crate::lock;
use log::trace;
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Receiver of timer expirations.
pub trait TimerClient: Send + Sync {
    fn on_timer_expired(&self, context: u64);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TimerState {
    Pending,
    Cancelled,
    Fired,
}

/// One pending timeout running on its own thread.
struct Timer {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    fn start(delay: Duration, client: Arc<dyn TimerClient>, context: u64) -> Self {
        let state = Arc::new((Mutex::new(TimerState::Pending), Condvar::new()));
        let thread_state = state.clone();

        let handle = thread::spawn(move || {
            let (mutex, condvar) = &*thread_state;
            let guard = lock(mutex);
            let (mut guard, _) = condvar
                .wait_timeout_while(guard, delay, |x| *x == TimerState::Pending)
                .unwrap_or_else(|e| e.into_inner());

            if *guard != TimerState::Pending {
                return;
            }

            *guard = TimerState::Fired;
            drop(guard);

            trace!("timer {} expired", context);
            client.on_timer_expired(context);
        });

        Self {
            state,
            handle: Some(handle),
        }
    }

    /// Stop the timer. Returns once the timer thread is gone, or at once if
    /// called from the firing callback itself.
    fn cancel(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            return;
        }

        {
            let (mutex, condvar) = &*self.state;
            let mut state = lock(mutex);
            if *state == TimerState::Pending {
                *state = TimerState::Cancelled;
                condvar.notify_all();
            }
        }

        let _ = handle.join();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Timeouts keyed by client, at most one pending timeout per client.
#[derive(Default)]
pub struct Timers {
    timers: Mutex<HashMap<usize, Timer>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `client.on_timer_expired(context)` after `delay`, replacing any
    /// timeout still pending for the same client.
    pub fn set_timeout(&self, delay: Duration, client: Arc<dyn TimerClient>, context: u64) {
        let key = client_key(&*client);
        trace!("arming timer {} for {:?}", context, delay);

        let old = lock(&self.timers).insert(key, Timer::start(delay, client, context));

        if let Some(mut old) = old {
            old.cancel();
        }
    }

    /// Cancel the pending timeout of `client`. When this returns the client's
    /// callback is either finished or will never run.
    pub fn cancel(&self, client: &dyn TimerClient) {
        let old = lock(&self.timers).remove(&client_key(client));

        if let Some(mut old) = old {
            old.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let timers = lock(&self.timers).drain().collect::<Vec<_>>();

        for (_, mut timer) in timers {
            timer.cancel();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn client_key(client: &dyn TimerClient) -> usize {
    client as *const dyn TimerClient as *const () as usize
}
