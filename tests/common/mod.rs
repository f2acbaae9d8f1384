//! Scripted in-memory remoting client shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scvmm_gateway::command::{CommandKind, CommandTemplate, TemplateStore};
use scvmm_gateway::session::{
    Channel, CommandResult, ConnectError, Connector, InvokeError, PoolConfig, PropertyBag,
    SessionPool,
};

/// What the fake host does with the next command
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(CommandResult),
    Delayed(Duration, CommandResult),
    Fault(String),
    ConnectionLost(String),
}

/// Counters and scripted behavior shared by a connector and its channels
#[derive(Debug, Default)]
pub struct FakeHost {
    pub connect_attempts: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub invokes: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// Upcoming connects that fail
    pub connect_failures: AtomicUsize,
    replies: Mutex<VecDeque<Reply>>,
    default_reply: Mutex<Option<Reply>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply for the next command
    pub fn push_reply(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    /// Reply used once the queue is empty
    pub fn set_default_reply(&self, reply: Reply) {
        *self.default_reply.lock() = Some(reply);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Every `(script, args)` pair received, in order
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
        self.replies
            .lock()
            .pop_front()
            .or_else(|| self.default_reply.lock().clone())
            .unwrap_or_else(|| Reply::Ok(CommandResult::default()))
    }
}

pub struct FakeConnector {
    pub host: Arc<FakeHost>,
}

impl FakeConnector {
    pub fn new(host: &Arc<FakeHost>) -> Arc<Self> {
        Arc::new(Self {
            host: Arc::clone(host),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn endpoint(&self) -> &str {
        "fake-scvmm"
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, ConnectError> {
        self.host.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failures = &self.host.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectError::Unreachable {
                endpoint: self.endpoint().to_string(),
                reason: "connection refused".to_string(),
            });
        }

        self.host.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            host: Arc::clone(&self.host),
            healthy: true,
        }))
    }
}

pub struct FakeChannel {
    host: Arc<FakeHost>,
    healthy: bool,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn invoke(
        &mut self,
        script: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, InvokeError> {
        let host = &self.host;
        host.invokes.fetch_add(1, Ordering::SeqCst);
        host.calls.lock().push((script.to_string(), args.to_vec()));

        let now_active = host.active.fetch_add(1, Ordering::SeqCst) + 1;
        host.max_active.fetch_max(now_active, Ordering::SeqCst);

        let outcome = match host.next_reply() {
            Reply::Ok(result) => Ok(result),
            Reply::Delayed(delay, result) => {
                match tokio::time::timeout(timeout, tokio::time::sleep(delay)).await {
                    Ok(()) => Ok(result),
                    Err(_) => {
                        // a late answer would desynchronize the channel
                        self.healthy = false;
                        Err(InvokeError::Timeout(timeout))
                    }
                }
            }
            Reply::Fault(reason) => Err(InvokeError::Fault(reason)),
            Reply::ConnectionLost(reason) => {
                self.healthy = false;
                Err(InvokeError::Connection(reason))
            }
        };

        host.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

pub fn pool_config(min_sessions: usize, max_sessions: usize) -> PoolConfig {
    PoolConfig {
        min_sessions,
        max_sessions,
        idle_timeout: None,
    }
}

pub async fn start_pool(host: &Arc<FakeHost>, config: PoolConfig) -> Arc<SessionPool> {
    SessionPool::start(FakeConnector::new(host), config)
        .await
        .expect("pool should start")
}

pub fn bag(pairs: &[(&str, &str)]) -> PropertyBag {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A store with a trivial script for each of `kinds`
pub fn templates(kinds: &[CommandKind]) -> TemplateStore {
    kinds.iter().fold(TemplateStore::new(), |store, &kind| {
        let source = format!("param($Arg)\nWrite-Output {}", kind.as_str());
        store.with(kind, CommandTemplate::parse(&source).expect("non-empty script"))
    })
}

pub const VM_ID: &str = "6f1c0e2a-3b4d-4e5f-8a9b-0c1d2e3f4a5b";

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
