//! Hierarchical timer wheel: 8 levels of 256 buckets, one tick per `advance`.
//!
//! Timers live in a fixed pool and are addressed by index. Each bucket is an
//! intrusive doubly linked list threaded through the pool, so insert, remove
//! and fire are O(1). Level `L` covers expiries less than `256^(L+1)` ticks
//! away; when the level-0 cursor wraps, the due bucket of the next level is
//! redistributed downwards before level 0 fires, so a timer created with
//! `hold_ticks = H` fires on exactly the H-th `advance`.
//!
//! Callbacks run synchronously on the thread that owns the wheel and receive
//! the owner's context by `&mut`, not the wheel itself.

use anyhow::{bail, Result};

pub const LEVELS: usize = 8;
pub const SLOTS: usize = 256;
const SLOT_BITS: u32 = 8;
const SLOT_MASK: u64 = (SLOTS as u64) - 1;

/// Loop counts at or above this value repeat forever
pub const FOREVER: u32 = 0x8000_0000;
pub const DEFAULT_CAPACITY: usize = 100_000;
pub const MIN_TICK_MS: u64 = 10;
pub const MAX_TICK_MS: u64 = 1000;

const NIL: u32 = u32::MAX;

pub type TimerId = u32;

/// Returned by a callback to keep or drop its timer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    Continue,
    Cancel,
}

/// Snapshot handed to a firing callback
#[derive(Clone, Copy, Debug)]
pub struct UserTimer {
    pub id: TimerId,
    pub loop_count: u32,
    pub hold_ticks: u32,
    pub params: [u64; 5],
    pub fired_at: u64,
}

pub type TimerCallback<T> = Box<dyn FnMut(&mut T, &UserTimer) -> TimerOutcome + Send>;

struct Node<T> {
    allocated: bool,
    loop_count: u32,
    hold_ticks: u32,
    expires: u64,
    params: [u64; 5],
    callback: Option<TimerCallback<T>>,
    bucket: u32,
    prev: u32,
    next: u32,
}

impl<T> Node<T> {
    fn vacant() -> Self {
        Self {
            allocated: false,
            loop_count: 0,
            hold_ticks: 0,
            expires: 0,
            params: [0; 5],
            callback: None,
            bucket: NIL,
            prev: NIL,
            next: NIL,
        }
    }
}

pub struct TimerWheel<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    heads: Vec<u32>,
    jiffies: u64,
    tick_ms: u64,
}

impl<T> TimerWheel<T> {
    /// `tick_ms` must lie in [10, 1000]
    pub fn new(capacity: usize, tick_ms: u64) -> Result<Self> {
        if !(MIN_TICK_MS..=MAX_TICK_MS).contains(&tick_ms) {
            bail!(
                "timer tick {}ms outside [{}, {}]",
                tick_ms,
                MIN_TICK_MS,
                MAX_TICK_MS
            );
        }
        if capacity == 0 || capacity >= NIL as usize {
            bail!("invalid timer pool size {}", capacity);
        }
        // Slot 0 is never handed out so ids start at 1
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.resize_with(capacity + 1, Node::vacant);
        Ok(Self {
            nodes,
            free: (1..=capacity as u32).rev().collect(),
            heads: vec![NIL; LEVELS * SLOTS],
            jiffies: 0,
            tick_ms,
        })
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    /// Ticks elapsed since the wheel was created
    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    /// Convert a period in milliseconds into whole ticks (at least one)
    pub fn ticks_for(&self, hold_ms: u64) -> u32 {
        (hold_ms / self.tick_ms).clamp(1, u32::MAX as u64) as u32
    }

    pub fn active(&self) -> usize {
        self.nodes.len() - 1 - self.free.len()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.nodes
            .get(id as usize)
            .map(|n| n.allocated)
            .unwrap_or(false)
            && id != 0
    }

    /// Arm a timer that first fires after `hold_ticks` ticks (a zero hold
    /// counts as one) and repeats `loop_count` times in total.
    pub fn create(
        &mut self,
        loop_count: u32,
        hold_ticks: u32,
        params: [u64; 5],
        callback: TimerCallback<T>,
    ) -> Result<TimerId> {
        let Some(id) = self.free.pop() else {
            bail!("timer pool exhausted ({} timers)", self.nodes.len() - 1);
        };
        let hold = hold_ticks.max(1);
        let node = &mut self.nodes[id as usize];
        node.allocated = true;
        node.loop_count = loop_count;
        node.hold_ticks = hold;
        node.expires = self.jiffies + hold as u64;
        node.params = params;
        node.callback = Some(callback);
        self.place(id, self.jiffies + 1);
        Ok(id)
    }

    /// Free a timer. Returns false when it was already gone.
    pub fn destroy(&mut self, id: TimerId) -> bool {
        if !self.is_pending(id) {
            return false;
        }
        self.unlink(id);
        self.release(id);
        true
    }

    /// Restart the countdown of a pending timer from the current tick
    pub fn reset(&mut self, id: TimerId) -> Result<()> {
        if !self.is_pending(id) {
            bail!("timer {} is not armed", id);
        }
        self.unlink(id);
        let node = &mut self.nodes[id as usize];
        node.expires = self.jiffies + node.hold_ticks as u64;
        self.place(id, self.jiffies + 1);
        Ok(())
    }

    /// Process one tick, firing everything that expires on it
    pub fn advance(&mut self, ctx: &mut T) {
        let now = self.jiffies + 1;
        if now & SLOT_MASK == 0 {
            self.cascade(now);
        }
        let due = self.take_bucket(bucket_index(0, now));
        self.jiffies = now;

        for id in due {
            let node = &mut self.nodes[id as usize];
            let Some(mut callback) = node.callback.take() else {
                continue;
            };
            let snapshot = UserTimer {
                id,
                loop_count: node.loop_count,
                hold_ticks: node.hold_ticks,
                params: node.params,
                fired_at: now,
            };
            let outcome = callback(ctx, &snapshot);

            let node = &mut self.nodes[id as usize];
            let repeat = node.loop_count > 1 && outcome == TimerOutcome::Continue;
            if repeat {
                if node.loop_count < FOREVER {
                    node.loop_count -= 1;
                }
                node.callback = Some(callback);
                node.expires = now + node.hold_ticks as u64;
                self.place(id, now + 1);
            } else {
                self.release(id);
            }
        }
    }

    // Redistribute the due bucket of each higher level whose cursor moved.
    // Lower levels go first, a level only cascades when the one below wrapped.
    fn cascade(&mut self, now: u64) {
        for level in 1..LEVELS {
            let slot = slot_of(level, now);
            let moved = self.take_bucket(level * SLOTS + slot);
            for id in moved {
                self.place(id, now);
            }
            if slot != 0 {
                break;
            }
        }
    }

    // `base` is the first tick not yet processed
    fn place(&mut self, id: TimerId, base: u64) {
        let expires = self.nodes[id as usize].expires.max(base);
        self.nodes[id as usize].expires = expires;
        let delta = expires - base;
        let mut level = 0;
        while level < LEVELS - 1 && delta >> (SLOT_BITS * (level as u32 + 1)) != 0 {
            level += 1;
        }
        self.push_front(bucket_index(level, expires), id);
    }

    fn push_front(&mut self, bucket: usize, id: TimerId) {
        let head = self.heads[bucket];
        {
            let node = &mut self.nodes[id as usize];
            node.bucket = bucket as u32;
            node.prev = NIL;
            node.next = head;
        }
        if head != NIL {
            self.nodes[head as usize].prev = id;
        }
        self.heads[bucket] = id;
    }

    fn unlink(&mut self, id: TimerId) {
        let (bucket, prev, next) = {
            let n = &self.nodes[id as usize];
            (n.bucket, n.prev, n.next)
        };
        if bucket == NIL {
            return;
        }
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.heads[bucket as usize] = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        }
        let n = &mut self.nodes[id as usize];
        n.bucket = NIL;
        n.prev = NIL;
        n.next = NIL;
    }

    fn take_bucket(&mut self, bucket: usize) -> Vec<TimerId> {
        let mut ids = Vec::new();
        let mut cur = std::mem::replace(&mut self.heads[bucket], NIL);
        while cur != NIL {
            let n = &mut self.nodes[cur as usize];
            let next = n.next;
            n.bucket = NIL;
            n.prev = NIL;
            n.next = NIL;
            ids.push(cur);
            cur = next;
        }
        // Oldest insertion first
        ids.reverse();
        ids
    }

    fn release(&mut self, id: TimerId) {
        self.nodes[id as usize] = Node::vacant();
        self.free.push(id);
    }
}

fn slot_of(level: usize, tick: u64) -> usize {
    ((tick >> (SLOT_BITS * level as u32)) & SLOT_MASK) as usize
}

fn bucket_index(level: usize, expires: u64) -> usize {
    level * SLOTS + slot_of(level, expires)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Fired = Vec<(TimerId, u64)>;

    fn recorder() -> TimerCallback<Fired> {
        Box::new(|fired: &mut Fired, t: &UserTimer| {
            fired.push((t.id, t.fired_at));
            TimerOutcome::Continue
        })
    }

    fn wheel() -> TimerWheel<Fired> {
        TimerWheel::new(1024, 1000).unwrap()
    }

    fn run(w: &mut TimerWheel<Fired>, fired: &mut Fired, ticks: u64) {
        for _ in 0..ticks {
            w.advance(fired);
        }
    }

    #[test]
    fn fires_after_exactly_hold_ticks() {
        for &start in &[0u64, 1, 200, 255, 256, 65_000] {
            for &hold in &[1u32, 2, 255, 256, 257, 511, 512, 513, 65_535, 65_536, 70_000] {
                let mut w = wheel();
                let mut fired = Vec::new();
                run(&mut w, &mut fired, start);
                let id = w.create(1, hold, [0; 5], recorder()).unwrap();
                run(&mut w, &mut fired, hold as u64 - 1);
                assert!(fired.is_empty(), "start {} hold {} fired early", start, hold);
                w.advance(&mut fired);
                assert_eq!(
                    fired,
                    vec![(id, start + hold as u64)],
                    "start {} hold {}",
                    start,
                    hold
                );
            }
        }
    }

    #[test]
    fn finite_loop_fires_k_times_then_frees() {
        let mut w = wheel();
        let mut fired = Vec::new();
        let id = w.create(3, 4, [7, 0, 0, 0, 0], recorder()).unwrap();
        run(&mut w, &mut fired, 40);
        let ticks: Vec<u64> = fired.iter().map(|f| f.1).collect();
        assert_eq!(ticks, vec![4, 8, 12]);
        assert!(!w.is_pending(id));
        assert_eq!(w.active(), 0);
        // Destroying an auto-freed timer is a no-op
        assert!(!w.destroy(id));
        assert!(!w.destroy(id));
    }

    #[test]
    fn forever_keeps_firing() {
        let mut w = wheel();
        let mut fired = Vec::new();
        let id = w.create(0xFFFF_FFFF, 1, [0; 5], recorder()).unwrap();
        run(&mut w, &mut fired, 600);
        assert_eq!(fired.len(), 600);
        assert!(w.is_pending(id));
        assert!(w.destroy(id));
        run(&mut w, &mut fired, 5);
        assert_eq!(fired.len(), 600);
    }

    #[test]
    fn reset_restarts_countdown() {
        let mut w = wheel();
        let mut fired = Vec::new();
        let id = w.create(1, 10, [0; 5], recorder()).unwrap();
        run(&mut w, &mut fired, 7);
        w.reset(id).unwrap();
        run(&mut w, &mut fired, 9);
        assert!(fired.is_empty());
        w.advance(&mut fired);
        assert_eq!(fired, vec![(id, 17)]);
        assert!(w.reset(id).is_err());
    }

    #[test]
    fn cancel_outcome_frees_timer() {
        let mut w: TimerWheel<u32> = TimerWheel::new(8, 100).unwrap();
        let mut count = 0u32;
        let id = w
            .create(
                FOREVER,
                2,
                [0; 5],
                Box::new(|n: &mut u32, t: &UserTimer| {
                    *n += 1;
                    assert_eq!(t.hold_ticks, 2);
                    if *n == 3 {
                        TimerOutcome::Cancel
                    } else {
                        TimerOutcome::Continue
                    }
                }),
            )
            .unwrap();
        for _ in 0..20 {
            w.advance(&mut count);
        }
        assert_eq!(count, 3);
        assert!(!w.is_pending(id));
    }

    #[test]
    fn pool_exhaustion_and_tick_bounds() {
        assert!(TimerWheel::<Fired>::new(4, 5).is_err());
        assert!(TimerWheel::<Fired>::new(4, 1001).is_err());
        let mut w: TimerWheel<Fired> = TimerWheel::new(2, 10).unwrap();
        assert_eq!(w.ticks_for(1000), 100);
        assert_eq!(w.ticks_for(3), 1);
        let a = w.create(1, 5, [0; 5], recorder()).unwrap();
        let _b = w.create(1, 5, [0; 5], recorder()).unwrap();
        assert!(w.create(1, 5, [0; 5], recorder()).is_err());
        assert_eq!(a, 1);
        assert!(w.destroy(a));
        assert!(w.create(1, 5, [0; 5], recorder()).is_ok());
    }

    #[test]
    fn many_timers_fire_in_order() {
        let mut w = wheel();
        let mut fired = Vec::new();
        for hold in (1..=600u32).rev() {
            w.create(1, hold, [hold as u64, 0, 0, 0, 0], recorder()).unwrap();
        }
        run(&mut w, &mut fired, 600);
        assert_eq!(fired.len(), 600);
        assert!(fired.windows(2).all(|p| p[0].1 < p[1].1));
    }
}
