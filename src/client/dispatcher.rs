//! The bounded executor behind `enqueue`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::client::Call;
use crate::error::Result;
use crate::http::Response;

const MAX_REQUESTS: usize = 64;
const MAX_REQUESTS_PER_HOST: usize = 5;

type Completion = Box<dyn FnOnce(Result<Response>) + Send>;

struct QueuedCall {
    call: Call,
    on_complete: Completion,
}

#[derive(Default)]
struct DispatchState {
    ready: VecDeque<QueuedCall>,
    running_async: usize,
    running_per_host: HashMap<String, usize>,
    running_sync: usize,
}

/// Policies when to execute asynchronous calls: at most 64 at once, at most
/// 5 per host, FIFO within those bounds.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    state: Arc<Mutex<DispatchState>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub(crate) fn enqueue(&self, call: Call, on_complete: Completion) {
        {
            let mut state = self.state.lock().expect("dispatcher poisoned");
            state.ready.push_back(QueuedCall { call, on_complete });
        }
        self.promote_and_execute();
    }

    pub(crate) fn executed_sync(&self) {
        self.state.lock().expect("dispatcher poisoned").running_sync += 1;
    }

    pub(crate) fn finished_sync(&self) {
        let mut state = self.state.lock().expect("dispatcher poisoned");
        state.running_sync = state.running_sync.saturating_sub(1);
    }

    /// Calls running right now, in both modes.
    pub(crate) fn running_calls_count(&self) -> usize {
        let state = self.state.lock().expect("dispatcher poisoned");
        state.running_async + state.running_sync
    }

    fn promote_and_execute(&self) {
        let mut executable = Vec::new();
        {
            let mut state = self.state.lock().expect("dispatcher poisoned");
            let mut skipped = VecDeque::new();
            while state.running_async < MAX_REQUESTS {
                let Some(queued) = state.ready.pop_front() else { break };
                let host = queued.call.request().url().host().to_string();
                let host_count = state.running_per_host.get(&host).copied().unwrap_or(0);
                if host_count >= MAX_REQUESTS_PER_HOST {
                    skipped.push_back(queued);
                    continue;
                }
                state.running_async += 1;
                *state.running_per_host.entry(host.clone()).or_insert(0) += 1;
                executable.push((queued, host));
            }
            // Over-limit calls wait their turn, order preserved.
            while let Some(queued) = skipped.pop_back() {
                state.ready.push_front(queued);
            }
        }

        for (queued, host) in executable {
            let dispatcher = self.clone();
            let thread_host = host.clone();
            let spawned = std::thread::Builder::new()
                .name("courier dispatcher".to_string())
                .spawn(move || {
                    let QueuedCall { call, on_complete } = queued;
                    let result = call.inner().run_with_events(&call);
                    on_complete(result);
                    dispatcher.finished_async(&thread_host);
                });
            if let Err(e) = spawned {
                tracing::warn!("failed to spawn dispatcher thread: {}", e);
                self.finished_async(&host);
            }
        }
    }

    fn finished_async(&self, host: &str) {
        {
            let mut state = self.state.lock().expect("dispatcher poisoned");
            state.running_async = state.running_async.saturating_sub(1);
            if let Some(count) = state.running_per_host.get_mut(host) {
                *count -= 1;
                if *count == 0 {
                    state.running_per_host.remove(host);
                }
            }
        }
        self.promote_and_execute();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.running_calls_count())
            .finish()
    }
}
