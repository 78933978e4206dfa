/// `Port` models one end of a bounded, directional channel between two simulation objects.
///
/// A channel has exactly one producer (the `OutputPort` end) and one consumer (the `InputPort`
/// end). Entries are stamped with the cycle at which they become visible, so a push during cycle N
/// on a registered link can only be observed by the consumer from cycle N+1 on, regardless of the
/// order in which the two objects are ticked. A push into a full channel fails and hands the value
/// back; the producer keeps it and re-proposes it on a later cycle.
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, RwLock};

use crate::timeq::Cycle;

#[derive(Debug, Default)]
pub struct InputPort {}

#[derive(Debug, Default)]
pub struct OutputPort {}

#[derive(Debug)]
pub struct Channel<T> {
    entries: VecDeque<(Cycle, T)>,
    capacity: usize,
    latency: Cycle,
}

/// Wrapper type of a reference to a channel.  Newtype is necessary to implement the access methods
/// at the reference type.
#[derive(Debug)]
pub struct ChannelRef<T>(Arc<RwLock<Channel<T>>>);

impl<T> Clone for ChannelRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
pub struct Port<D, T> {
    // RwLock is necessary because neither end knows when the other end accesses the channel.
    lock: OnceLock<ChannelRef<T>>,
    direction: PhantomData<D>,
}

impl<D, T> Default for Port<D, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, T> Port<D, T> {
    pub fn new() -> Self {
        Port {
            lock: OnceLock::new(),
            direction: PhantomData,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.lock.get().is_some()
    }

    fn channel(&self) -> &ChannelRef<T> {
        self.lock.get().expect("port is not linked")
    }

    pub fn capacity(&self) -> usize {
        self.channel().capacity()
    }

    /// Number of entries in the channel, visible or not.
    pub fn occupancy(&self) -> usize {
        self.channel().occupancy()
    }
}

impl<T> Port<OutputPort, T> {
    pub fn full(&self) -> bool {
        self.channel().full()
    }

    /// Access method of an output port from *within* the module that owns the port.
    /// On a full channel the value is returned so the caller can retry it.
    pub fn try_push(&mut self, now: Cycle, data: T) -> Result<(), T> {
        self.channel().push(now, data)
    }
}

impl<T: Clone> Port<InputPort, T> {
    pub fn peek(&self, now: Cycle) -> Option<T> {
        self.channel().peek(now)
    }
}

impl<T> Port<InputPort, T> {
    /// Access method of an input port from *within* the module that owns the port.
    pub fn pop(&mut self, now: Cycle) -> Option<T> {
        self.channel().pop(now)
    }

    pub fn has_ready(&self, now: Cycle) -> bool {
        self.channel().has_ready(now)
    }

    /// Drop every entry in the channel; the link itself is kept.
    pub fn clear(&mut self) {
        self.channel().clear()
    }
}

impl<T> ChannelRef<T> {
    fn new(capacity: usize, latency: Cycle) -> Self {
        assert!(capacity > 0, "channel capacity must be > 0");
        ChannelRef(Arc::new(RwLock::new(Channel {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            latency,
        })))
    }

    pub fn capacity(&self) -> usize {
        self.0.read().expect("rw lock poisoned").capacity
    }

    pub fn occupancy(&self) -> usize {
        self.0.read().expect("rw lock poisoned").entries.len()
    }

    pub fn full(&self) -> bool {
        let channel = self.0.read().expect("rw lock poisoned");
        channel.entries.len() >= channel.capacity
    }

    pub fn push(&self, now: Cycle, data: T) -> Result<(), T> {
        let mut channel = self.0.write().expect("rw lock poisoned");
        if channel.entries.len() >= channel.capacity {
            return Err(data);
        }
        let visible_at = now + channel.latency;
        channel.entries.push_back((visible_at, data));
        Ok(())
    }

    pub fn has_ready(&self, now: Cycle) -> bool {
        let channel = self.0.read().expect("rw lock poisoned");
        channel
            .entries
            .front()
            .is_some_and(|(visible_at, _)| *visible_at <= now)
    }

    pub fn pop(&self, now: Cycle) -> Option<T> {
        let mut channel = self.0.write().expect("rw lock poisoned");
        match channel.entries.front() {
            Some((visible_at, _)) if *visible_at <= now => {
                channel.entries.pop_front().map(|(_, data)| data)
            }
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.0.write().expect("rw lock poisoned").entries.clear();
    }
}

impl<T: Clone> ChannelRef<T> {
    pub fn peek(&self, now: Cycle) -> Option<T> {
        let channel = self.0.read().expect("rw lock poisoned");
        channel
            .entries
            .front()
            .filter(|(visible_at, _)| *visible_at <= now)
            .map(|(_, data)| data.clone())
    }
}

fn bind<D, T>(port: &mut Port<D, T>, channel: &ChannelRef<T>) {
    port.lock
        .set(channel.clone())
        .map_err(|_| "")
        .expect("port already linked");
}

fn link_with_latency<T>(
    a: &mut Port<InputPort, T>,
    b: &mut Port<OutputPort, T>,
    capacity: usize,
    latency: Cycle,
) -> ChannelRef<T> {
    let channel = ChannelRef::new(capacity, latency);
    bind(a, &channel);
    bind(b, &channel);
    channel
}

/// Registered link: entries pushed at cycle N become visible at N+1.
pub fn link<T>(
    a: &mut Port<InputPort, T>,
    b: &mut Port<OutputPort, T>,
    capacity: usize,
) -> ChannelRef<T> {
    link_with_latency(a, b, capacity, 1)
}

/// Combinational link: entries are visible within the cycle they were pushed, provided the
/// consumer ticks after the producer.
pub fn link_comb<T>(
    a: &mut Port<InputPort, T>,
    b: &mut Port<OutputPort, T>,
    capacity: usize,
) -> ChannelRef<T> {
    link_with_latency(a, b, capacity, 0)
}

/// Tie an input port off so that it never receives anything.
pub fn tie_off_input<T>(a: &mut Port<InputPort, T>) -> ChannelRef<T> {
    let channel = ChannelRef::new(1, 1);
    bind(a, &channel);
    channel
}

pub fn link_vec<T>(
    a: &mut [Port<InputPort, T>],
    b: &mut [Port<OutputPort, T>],
    capacity: usize,
) -> Vec<ChannelRef<T>> {
    assert_eq!(a.len(), b.len(), "port vector width mismatch");
    a.iter_mut()
        .zip(b.iter_mut())
        .map(|(i, o)| link(i, o, capacity))
        .collect::<Vec<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_link_delays_visibility_by_one_cycle() {
        let mut rx = Port::<InputPort, u32>::new();
        let mut tx = Port::<OutputPort, u32>::new();
        link(&mut rx, &mut tx, 2);

        tx.try_push(5, 7).unwrap();
        assert_eq!(rx.peek(5), None);
        assert_eq!(rx.pop(5), None);
        assert_eq!(rx.peek(6), Some(7));
        assert_eq!(rx.pop(6), Some(7));
        assert_eq!(rx.pop(6), None);
    }

    #[test]
    fn full_channel_hands_value_back() {
        let mut rx = Port::<InputPort, u32>::new();
        let mut tx = Port::<OutputPort, u32>::new();
        link(&mut rx, &mut tx, 1);

        tx.try_push(0, 1).unwrap();
        assert!(tx.full());
        assert_eq!(tx.try_push(0, 2), Err(2));
        assert_eq!(rx.pop(1), Some(1));
        assert!(tx.try_push(1, 2).is_ok());
    }

    #[test]
    fn combinational_link_is_visible_same_cycle() {
        let mut rx = Port::<InputPort, u32>::new();
        let mut tx = Port::<OutputPort, u32>::new();
        link_comb(&mut rx, &mut tx, 1);
        tx.try_push(3, 9).unwrap();
        assert_eq!(rx.pop(3), Some(9));
    }

    #[test]
    fn clear_keeps_wiring() {
        let mut rx = Port::<InputPort, u32>::new();
        let mut tx = Port::<OutputPort, u32>::new();
        link(&mut rx, &mut tx, 4);
        tx.try_push(0, 1).unwrap();
        rx.clear();
        assert_eq!(rx.occupancy(), 0);
        tx.try_push(1, 2).unwrap();
        assert_eq!(rx.pop(2), Some(2));
    }
}
