// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed broadcast of runtime events to one or more consumers.
//!
//! Delivery is non-blocking per subscriber with a generous buffer.  When a
//! slow subscriber's buffer fills, adjacent high-frequency events (text and
//! reasoning deltas, partial tool calls for the same call id) are merged
//! before retry; every other event kind blocks the producer until the
//! subscriber accepts it, so nothing semantically significant is dropped.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use crate::events::RuntimeEvent;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 256;

pub struct EventBus {
    inner: Mutex<Vec<SubscriberSlot>>,
}

struct SubscriberSlot {
    tx: mpsc::Sender<RuntimeEvent>,
    /// A coalescable event that did not fit the buffer, held for merging
    /// with the next one.
    pending: Option<RuntimeEvent>,
    closed: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Register a consumer.  Events published after this call are delivered
    /// in producer order; the channel closes when the bus is closed.
    pub async fn subscribe(&self) -> mpsc::Receiver<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.inner.lock().await.push(SubscriberSlot {
            tx,
            pending: None,
            closed: false,
        });
        rx
    }

    pub async fn publish(&self, event: RuntimeEvent) {
        let mut subs = self.inner.lock().await;
        for sub in subs.iter_mut() {
            sub.deliver(event.clone()).await;
        }
        subs.retain(|s| !s.closed);
    }

    /// Flush held events and drop every subscriber channel, signalling
    /// end-of-stream to receivers.
    pub async fn close(&self) {
        let mut subs = self.inner.lock().await;
        for sub in subs.iter_mut() {
            if let Some(p) = sub.pending.take() {
                let _ = sub.tx.send(p).await;
            }
        }
        subs.clear();
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberSlot {
    async fn deliver(&mut self, event: RuntimeEvent) {
        if self.closed {
            return;
        }
        if event.is_coalescable() {
            if let Some(mut held) = self.pending.take() {
                if coalesce(&mut held, &event) {
                    self.pending = Some(held);
                    return;
                }
                // Different stream or kind: the held event must go out
                // first, in order.
                if self.tx.send(held).await.is_err() {
                    self.closed = true;
                    return;
                }
            }
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(ev)) => self.pending = Some(ev),
                Err(TrySendError::Closed(_)) => self.closed = true,
            }
        } else {
            if let Some(held) = self.pending.take() {
                if self.tx.send(held).await.is_err() {
                    self.closed = true;
                    return;
                }
            }
            if self.tx.send(event).await.is_err() {
                self.closed = true;
            }
        }
    }
}

/// Merge `next` into `held` when both belong to the same delta stream.
/// Text and reasoning deltas concatenate; partial tool calls supersede
/// (each already carries the accumulated snapshot).
fn coalesce(held: &mut RuntimeEvent, next: &RuntimeEvent) -> bool {
    match (held, next) {
        (
            RuntimeEvent::AgentChoice { agent, delta },
            RuntimeEvent::AgentChoice {
                agent: next_agent,
                delta: next_delta,
            },
        ) if agent == next_agent => {
            delta.push_str(next_delta);
            true
        }
        (
            RuntimeEvent::AgentChoiceReasoning { agent, delta },
            RuntimeEvent::AgentChoiceReasoning {
                agent: next_agent,
                delta: next_delta,
            },
        ) if agent == next_agent => {
            delta.push_str(next_delta);
            true
        }
        (
            RuntimeEvent::PartialToolCall { agent, call },
            RuntimeEvent::PartialToolCall {
                agent: next_agent,
                call: next_call,
            },
        ) if agent == next_agent && call.id == next_call.id => {
            *call = next_call.clone();
            true
        }
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
