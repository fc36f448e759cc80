//! In-memory shell transport shared by pool and orchestrator tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::transport::{ExecOutput, ShellConnection, ShellEndpoint, ShellTransport};

#[derive(Default)]
pub(crate) struct MockTransport {
    dials: AtomicUsize,
    refused: Arc<Mutex<HashSet<String>>>,
    exec_failures: Arc<Mutex<HashSet<String>>>,
    handles: Mutex<Vec<Arc<HandleState>>>,
}

impl MockTransport {
    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Shared state of the `index`-th dialed connection.
    pub(crate) fn handle(&self, index: usize) -> Arc<HandleState> {
        self.handles.lock().expect("handles lock")[index].clone()
    }

    pub(crate) fn refuse_host(&self, hostname: &str) {
        self.refused
            .lock()
            .expect("refused lock")
            .insert(hostname.to_string());
    }

    pub(crate) fn allow_host(&self, hostname: &str) {
        self.refused.lock().expect("refused lock").remove(hostname);
    }

    pub(crate) fn fail_exec_on(&self, hostname: &str) {
        self.exec_failures
            .lock()
            .expect("exec failures lock")
            .insert(hostname.to_string());
    }

    pub(crate) fn allow_exec_on(&self, hostname: &str) {
        self.exec_failures
            .lock()
            .expect("exec failures lock")
            .remove(hostname);
    }
}

pub(crate) struct HandleState {
    hostname: String,
    alive: AtomicBool,
    alive_script: Mutex<VecDeque<bool>>,
    closed: AtomicBool,
    executed: Mutex<Vec<String>>,
}

impl HandleState {
    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Queues per-call liveness answers consumed before the default flag.
    pub(crate) fn script_alive(&self, script: Vec<bool>) {
        *self.alive_script.lock().expect("script lock") = script.into_iter().collect();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }
}

struct MockConnection {
    state: Arc<HandleState>,
    exec_failures: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl ShellTransport for MockTransport {
    async fn connect(
        &self,
        endpoint: &ShellEndpoint,
    ) -> Result<Box<dyn ShellConnection>, FleetError> {
        if self
            .refused
            .lock()
            .expect("refused lock")
            .contains(&endpoint.hostname)
        {
            return Err(FleetError::AuthenticationFailed {
                host: endpoint.hostname.clone(),
            });
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(HandleState {
            hostname: endpoint.hostname.clone(),
            alive: AtomicBool::new(true),
            alive_script: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
        });
        self.handles.lock().expect("handles lock").push(state.clone());
        Ok(Box::new(MockConnection {
            state,
            exec_failures: self.exec_failures.clone(),
        }))
    }
}

#[async_trait]
impl ShellConnection for MockConnection {
    fn hostname(&self) -> &str {
        &self.state.hostname
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, FleetError> {
        self.state
            .executed
            .lock()
            .expect("executed lock")
            .push(command.to_string());
        if self
            .exec_failures
            .lock()
            .expect("exec failures lock")
            .contains(&self.state.hostname)
        {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "mock exec failure".to_string(),
                exit_code: 1,
            });
        }
        Ok(ExecOutput {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn is_alive(&self) -> bool {
        if let Some(scripted) = self
            .state
            .alive_script
            .lock()
            .expect("script lock")
            .pop_front()
        {
            return scripted;
        }
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}
