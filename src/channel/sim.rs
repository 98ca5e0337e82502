//! Simulated Channel Access
//!
//! In-memory implementation of [`ChannelAccess`] for testing and for running
//! the engine without a control system. All delays use tokio time.
//!
//! # Features
//!
//! - Scalar and array channels with arbitrary initial values
//! - Readbacks that follow a set-point channel after a configurable lag,
//!   optionally with a constant offset (a readback that never settles)
//! - Unreachable channels (connect fails)
//! - Per-channel write counters and a global write log
//! - Optional write latency, for a transport that acknowledges puts slowly
//!
//! # Example
//!
//! ```rust,ignore
//! let access = SimChannelAccess::new();
//! access.add_scalar("S10:SET", 0.0);
//! access.add_scalar("S10:RB", 0.0);
//! access.link_readback("S10:RB", "S10:SET", Duration::from_millis(50));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use super::{ChannelAccess, ChannelHandle, ChannelRef, ChannelValue, ValueKind};

#[derive(Debug, Clone)]
struct Follow {
    source: String,
    lag: Duration,
    offset: f64,
}

#[derive(Debug, Clone)]
struct LastWrite {
    at: Instant,
    previous: ChannelValue,
}

#[derive(Debug, Clone)]
struct SimChannel {
    handle: u64,
    value: ChannelValue,
    kind: ValueKind,
    reachable: bool,
    writes: usize,
    last_write: Option<LastWrite>,
    follows: Option<Follow>,
}

#[derive(Default)]
struct SimState {
    channels: HashMap<String, SimChannel>,
    next_handle: u64,
    write_log: Vec<(String, ChannelValue)>,
    put_delay: Duration,
}

/// In-memory control system.
#[derive(Default)]
pub struct SimChannelAccess {
    state: Mutex<SimState>,
}

impl SimChannelAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, name: &str, value: ChannelValue, kind: ValueKind) {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.channels.insert(
            name.to_string(),
            SimChannel {
                handle,
                value,
                kind,
                reachable: true,
                writes: 0,
                last_write: None,
                follows: None,
            },
        );
    }

    /// Add a floating-point scalar channel.
    pub fn add_scalar(&self, name: &str, value: f64) {
        self.add(name, ChannelValue::Scalar(value), ValueKind::Floating);
    }

    /// Add an integer channel.
    pub fn add_integer(&self, name: &str, value: i64) {
        self.add(name, ChannelValue::Scalar(value as f64), ValueKind::Integer);
    }

    /// Add a waveform channel.
    pub fn add_array(&self, name: &str, values: Vec<f64>) {
        self.add(name, ChannelValue::Array(values), ValueKind::Floating);
    }

    /// Make `readback` report the value of `setpoint`, `lag` after each write.
    pub fn link_readback(&self, readback: &str, setpoint: &str, lag: Duration) {
        self.link_readback_with_offset(readback, setpoint, lag, 0.0);
    }

    /// Like [`link_readback`](Self::link_readback) but with a constant offset.
    pub fn link_readback_with_offset(
        &self,
        readback: &str,
        setpoint: &str,
        lag: Duration,
        offset: f64,
    ) {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(readback) {
            channel.follows = Some(Follow {
                source: setpoint.to_string(),
                lag,
                offset,
            });
        }
    }

    /// Delay every `put` by `delay` before it takes effect.
    pub fn set_put_delay(&self, delay: Duration) {
        self.state.lock().put_delay = delay;
    }

    /// Make a channel fail to connect.
    pub fn set_unreachable(&self, name: &str) {
        if let Some(channel) = self.state.lock().channels.get_mut(name) {
            channel.reachable = false;
        }
    }

    /// Overwrite a value without counting it as a write.
    pub fn set_value(&self, name: &str, value: ChannelValue) {
        if let Some(channel) = self.state.lock().channels.get_mut(name) {
            channel.value = value;
        }
    }

    /// Current value as a reader would see it.
    pub fn value(&self, name: &str) -> Option<ChannelValue> {
        let state = self.state.lock();
        Self::resolve(&state, name, Instant::now())
    }

    /// Number of `put` calls on a channel.
    pub fn write_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(name)
            .map(|c| c.writes)
            .unwrap_or(0)
    }

    /// Every write in order.
    pub fn write_log(&self) -> Vec<(String, ChannelValue)> {
        self.state.lock().write_log.clone()
    }

    fn resolve(state: &SimState, name: &str, now: Instant) -> Option<ChannelValue> {
        let channel = state.channels.get(name)?;
        let Some(follow) = &channel.follows else {
            return Some(channel.value.clone());
        };
        let source = state.channels.get(&follow.source)?;
        let target = match &source.last_write {
            Some(last) if now.duration_since(last.at) < follow.lag => last.previous.clone(),
            _ => source.value.clone(),
        };
        Some(match target {
            ChannelValue::Scalar(v) => ChannelValue::Scalar(v + follow.offset),
            ChannelValue::Array(values) => {
                ChannelValue::Array(values.into_iter().map(|v| v + follow.offset).collect())
            }
        })
    }
}

#[async_trait]
impl ChannelAccess for SimChannelAccess {
    async fn connect(&self, name: &str, _timeout: Duration) -> Result<ChannelRef> {
        let state = self.state.lock();
        let channel = state
            .channels
            .get(name)
            .ok_or_else(|| anyhow!("SimChannelAccess: unknown channel '{}'", name))?;
        if !channel.reachable {
            bail!("SimChannelAccess: channel '{}' not reachable", name);
        }
        Ok(ChannelRef {
            name: name.to_string(),
            handle: ChannelHandle(channel.handle),
            shape: channel.value.shape(),
            kind: channel.kind,
        })
    }

    async fn get(&self, channel: &ChannelRef) -> Result<ChannelValue> {
        let state = self.state.lock();
        Self::resolve(&state, &channel.name, Instant::now())
            .ok_or_else(|| anyhow!("SimChannelAccess: unknown channel '{}'", channel.name))
    }

    async fn put(&self, channel: &ChannelRef, value: &ChannelValue) -> Result<()> {
        let delay = self.state.lock().put_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut state = self.state.lock();
        let entry = state
            .channels
            .get_mut(&channel.name)
            .ok_or_else(|| anyhow!("SimChannelAccess: unknown channel '{}'", channel.name))?;
        let previous = std::mem::replace(&mut entry.value, value.clone());
        entry.last_write = Some(LastWrite {
            at: Instant::now(),
            previous,
        });
        entry.writes += 1;
        state.write_log.push((channel.name.clone(), value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_put() {
        let access = SimChannelAccess::new();
        access.add_scalar("X:SET", 1.0);
        let channel = access.connect("X:SET", Duration::ZERO).await.unwrap();
        access.put(&channel, &ChannelValue::Scalar(3.0)).await.unwrap();
        assert_eq!(access.get(&channel).await.unwrap(), ChannelValue::Scalar(3.0));
        assert_eq!(access.write_count("X:SET"), 1);
        assert_eq!(access.write_log().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_unknown() {
        let access = SimChannelAccess::new();
        access.add_scalar("X:SET", 1.0);
        access.set_unreachable("X:SET");
        assert!(access.connect("X:SET", Duration::ZERO).await.is_err());
        assert!(access.connect("Y:SET", Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_readback_lag() {
        let access = SimChannelAccess::new();
        access.add_scalar("X:SET", 0.0);
        access.add_scalar("X:RB", 0.0);
        access.link_readback("X:RB", "X:SET", Duration::from_millis(30));

        let set = access.connect("X:SET", Duration::ZERO).await.unwrap();
        let rb = access.connect("X:RB", Duration::ZERO).await.unwrap();
        access.put(&set, &ChannelValue::Scalar(5.0)).await.unwrap();
        assert_eq!(access.get(&rb).await.unwrap(), ChannelValue::Scalar(0.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(access.get(&rb).await.unwrap(), ChannelValue::Scalar(5.0));
    }

    #[tokio::test]
    async fn test_readback_offset_array() {
        let access = SimChannelAccess::new();
        access.add_array("W:SET", vec![1.0, 2.0]);
        access.add_array("W:RB", vec![0.0, 0.0]);
        access.link_readback_with_offset("W:RB", "W:SET", Duration::ZERO, 0.5);
        assert_eq!(access.value("W:RB"), Some(ChannelValue::Array(vec![1.5, 2.5])));
    }
}
