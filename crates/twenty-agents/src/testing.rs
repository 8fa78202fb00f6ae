//! Reasoner and channel doubles for protocol tests

use crate::reasoning::{Prompt, Reasoner};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use twenty_bridge::{Channel, ChannelKind, Delivery, Endpoint};
use twenty_core::{GameError, Result};

type Script = dyn Fn(&Prompt) -> Result<String> + Send + Sync;

/// Answers every prompt through a closure and records what it was asked
pub struct ScriptedReasoner {
    script: Box<Script>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedReasoner {
    pub fn new(script: impl Fn(&Prompt) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Same reply to everything
    pub fn constant(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// Fails every call
    pub fn failing() -> Self {
        Self::new(|_| Err(GameError::ReasoningError("backend down".into())))
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn complete(&self, prompt: &Prompt, _max_tokens: u32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        (self.script)(prompt)
    }
}

/// Never answers
#[derive(Default)]
pub struct StalledReasoner {
    calls: AtomicUsize,
}

impl StalledReasoner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for StalledReasoner {
    async fn complete(&self, _prompt: &Prompt, _max_tokens: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Injected channel failures, shared by a `FlakyEndpoint` and every channel
/// it hands out. All injected errors are transient.
#[derive(Default)]
pub struct Faults {
    /// Envelope kind whose publishes fail, with the number still to fail
    publish_plan: Mutex<Option<(String, usize)>>,
    receive_failures: AtomicUsize,
    publish_attempts: AtomicUsize,
}

impl Faults {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` publishes of `kind` envelopes fail
    pub fn fail_publishes(&self, kind: &str, count: usize) {
        *self.publish_plan.lock().unwrap() = Some((format!("\"type\":\"{}\"", kind), count));
    }

    /// The next `count` receives fail
    pub fn fail_receives(&self, count: usize) {
        self.receive_failures.store(count, Ordering::SeqCst);
    }

    /// Publish calls seen, failed ones included
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    fn publish_fails(&self, payload: &[u8]) -> bool {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let mut plan = self.publish_plan.lock().unwrap();
        match plan.as_mut() {
            Some((marker, left)) if *left > 0 => {
                let hit = String::from_utf8_lossy(payload).contains(marker.as_str());
                if hit {
                    *left -= 1;
                }
                hit
            }
            _ => false,
        }
    }

    fn receive_fails(&self) -> bool {
        self.receive_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Endpoint whose channels fail as `Faults` dictates
pub struct FlakyEndpoint<E> {
    inner: E,
    faults: Arc<Faults>,
}

impl<E: Endpoint> FlakyEndpoint<E> {
    pub fn new(inner: E, faults: Arc<Faults>) -> Self {
        Self { inner, faults }
    }

    fn wrap(&self, inner: E::Channel) -> FlakyChannel<E::Channel> {
        FlakyChannel {
            inner,
            faults: self.faults.clone(),
        }
    }
}

#[async_trait]
impl<E: Endpoint> Endpoint for FlakyEndpoint<E> {
    type Channel = FlakyChannel<E::Channel>;

    fn local_name(&self) -> &str {
        self.inner.local_name()
    }

    async fn create_channel(&self, name: &str) -> Result<Self::Channel> {
        Ok(self.wrap(self.inner.create_channel(name).await?))
    }

    async fn accept_invitation(&self, timeout: Duration) -> Result<Option<Self::Channel>> {
        Ok(self
            .inner
            .accept_invitation(timeout)
            .await?
            .map(|channel| self.wrap(channel)))
    }

    async fn open_private(&self, peer: &str, wait: Duration) -> Result<Self::Channel> {
        Ok(self.wrap(self.inner.open_private(peer, wait).await?))
    }
}

pub struct FlakyChannel<C> {
    inner: C,
    faults: Arc<Faults>,
}

impl<C: Channel> FlakyChannel<C> {
    pub fn new(inner: C, faults: Arc<Faults>) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl<C: Channel> Channel for FlakyChannel<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> ChannelKind {
        self.inner.kind()
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if self.faults.publish_fails(&payload) {
            return Err(GameError::TransportError("injected publish failure".into()));
        }
        self.inner.publish(payload).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        if self.faults.receive_fails() {
            return Err(GameError::Timeout("injected receive failure".into()));
        }
        self.inner.receive(timeout).await
    }

    async fn invite(&self, peer: &str) -> Result<()> {
        self.inner.invite(peer).await
    }
}
