//! Blocking credit map.
//!
//! Credits are taken from every member at once: a sender may send `n` bytes
//! only if each member still has `n` credits. Decrements are accumulated and
//! only folded into the per-member values when a member is replenished, so
//! the send path touches a single counter.

use std::collections::HashMap;
use std::time::Duration;

use crate::address::Address;
use crate::sync::CondVar;

#[derive(Debug)]
struct State {
    credits: HashMap<Address, u64>,
    min_credits: u64,
    /// Credits taken since the last flush into `credits`
    accumulated: u64,
    num_blockings: u64,
    done: bool,
}

impl State {
    fn try_take(&mut self, n: u64) -> bool {
        if n > self.min_credits {
            return false;
        }
        self.accumulated += n;
        self.min_credits -= n;
        true
    }

    fn flush(&mut self) {
        if self.accumulated == 0 {
            return;
        }
        for credits in self.credits.values_mut() {
            *credits = credits.saturating_sub(self.accumulated);
        }
        self.accumulated = 0;
    }

    fn compute_min(&mut self, max: u64) {
        self.min_credits = self.credits.values().copied().min().unwrap_or(max);
    }
}

/// Per-member credits for one sender.
#[derive(Debug)]
pub struct CreditMap {
    max_credits: u64,
    state: CondVar<State>,
}

impl CreditMap {
    pub fn new(max_credits: u64) -> Self {
        Self {
            max_credits,
            state: CondVar::new(State {
                credits: HashMap::new(),
                min_credits: max_credits,
                accumulated: 0,
                num_blockings: 0,
                done: false,
            }),
        }
    }

    pub fn max_credits(&self) -> u64 {
        self.max_credits
    }

    pub fn members(&self) -> Vec<Address> {
        self.state.lock().credits.keys().cloned().collect()
    }

    /// Credits left for `member`.
    pub fn get(&self, member: &Address) -> Option<u64> {
        let s = self.state.lock();
        s.credits
            .get(member)
            .map(|c| c.saturating_sub(s.accumulated))
    }

    /// Start tracking `member` with full credits. Returns false if it was
    /// already tracked.
    pub fn put_if_absent(&self, member: &Address) -> bool {
        let max = self.max_credits;
        self.state.update(|s| {
            if s.credits.contains_key(member) {
                return false;
            }
            s.flush();
            s.credits.insert(member.clone(), max);
            s.compute_min(max);
            true
        })
    }

    pub fn remove(&self, member: &Address) {
        let max = self.max_credits;
        // A departed member may have been the one holding everyone back.
        self.state.update(|s| {
            s.flush();
            s.credits.remove(member);
            s.compute_min(max);
        });
    }

    pub fn clear(&self) {
        let max = self.max_credits;
        self.state.update(|s| {
            s.credits.clear();
            s.accumulated = 0;
            s.min_credits = max;
        });
    }

    /// Take `credits` without blocking.
    pub fn try_decrement(&self, credits: u64) -> bool {
        let mut s = self.state.lock();
        !s.done && s.try_take(credits)
    }

    /// Take `credits` from every member, waiting up to `timeout` for
    /// replenishment. Returns false on timeout or once the map was reset.
    pub fn decrement(&self, credits: u64, timeout: Duration) -> bool {
        {
            let mut s = self.state.lock();
            if s.done {
                return false;
            }
            if s.try_take(credits) {
                return true;
            }
            s.num_blockings += 1;
        }
        self.state.wait_then(
            |s| s.done || credits <= s.min_credits,
            Some(timeout),
            |s, _| !s.done && s.try_take(credits),
        )
    }

    /// Grant `member` more credits, capped at the maximum.
    pub fn replenish(&self, member: &Address, credits: u64) {
        let max = self.max_credits;
        self.state.update(|s| {
            if !s.credits.contains_key(member) {
                return;
            }
            s.flush();
            if let Some(current) = s.credits.get_mut(member) {
                *current = current.saturating_add(credits).min(max);
            }
            s.compute_min(max);
        });
    }

    /// Reset every member to full credits.
    pub fn replenish_all(&self) {
        let max = self.max_credits;
        self.state.update(|s| {
            s.accumulated = 0;
            for credits in s.credits.values_mut() {
                *credits = max;
            }
            s.min_credits = max;
        });
    }

    pub fn min_credits(&self) -> u64 {
        self.state.lock().min_credits
    }

    /// Credits taken since the last replenishment.
    pub fn accumulated_credits(&self) -> u64 {
        self.state.lock().accumulated
    }

    /// Members whose credits are below `needed`.
    pub fn members_with_insufficient_credits(&self, needed: u64) -> Vec<Address> {
        let mut s = self.state.lock();
        s.flush();
        let mut members: Vec<Address> = s
            .credits
            .iter()
            .filter(|(_, c)| **c < needed)
            .map(|(a, _)| a.clone())
            .collect();
        members.sort();
        members
    }

    /// Times a decrement had to wait.
    pub fn num_blockings(&self) -> u64 {
        self.state.lock().num_blockings
    }

    /// Release blocked senders for good; later decrements fail immediately.
    pub fn reset(&self) {
        self.state.update(|s| s.done = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn addr(n: u128) -> Address {
        Address::from_u128(n)
    }

    fn map(max: u64, members: u128) -> CreditMap {
        let m = CreditMap::new(max);
        for n in 1..=members {
            m.put_if_absent(&addr(n));
        }
        m
    }

    #[test]
    fn test_decrement_takes_from_every_member() {
        let m = map(1000, 3);
        assert!(m.try_decrement(400));
        assert!(m.try_decrement(600));
        assert_eq!(m.min_credits(), 0);
        assert_eq!(m.accumulated_credits(), 1000);
        assert!(!m.try_decrement(1));
        assert_eq!(m.get(&addr(2)), Some(0));
    }

    #[test]
    fn test_replenish_raises_min_only_when_all_catch_up() {
        let m = map(1000, 2);
        assert!(m.try_decrement(1000));
        m.replenish(&addr(1), 500);
        assert_eq!(m.min_credits(), 0);
        assert_eq!(m.accumulated_credits(), 0);
        m.replenish(&addr(2), 300);
        assert_eq!(m.min_credits(), 300);
        assert_eq!(m.members_with_insufficient_credits(400), vec![addr(2)]);

        // Capped at the maximum.
        m.replenish(&addr(1), 10_000);
        assert_eq!(m.get(&addr(1)), Some(1000));
    }

    #[test]
    fn test_blocking_decrement_times_out() {
        let m = map(100, 1);
        assert!(m.try_decrement(100));
        let start = Instant::now();
        assert!(!m.decrement(10, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(m.num_blockings(), 1);
    }

    #[test]
    fn test_blocking_decrement_wakes_on_replenish() {
        let m = Arc::new(map(100, 1));
        assert!(m.try_decrement(100));
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || m2.decrement(50, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        m.replenish(&addr(1), 60);
        assert!(t.join().unwrap());
        assert_eq!(m.min_credits(), 10);
    }

    #[test]
    fn test_reset_releases_blocked_senders() {
        let m = Arc::new(map(100, 1));
        assert!(m.try_decrement(100));
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || m2.decrement(50, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        m.reset();
        assert!(!t.join().unwrap());
        assert!(!m.try_decrement(0));
    }

    #[test]
    fn test_removing_slow_member_unblocks() {
        let m = map(1000, 2);
        assert!(m.try_decrement(800));
        m.replenish(&addr(1), 800);
        assert_eq!(m.min_credits(), 200);
        m.remove(&addr(2));
        assert_eq!(m.min_credits(), 1000);
        assert_eq!(m.members(), vec![addr(1)]);
    }

    #[test]
    fn test_empty_map_has_full_credits() {
        let m = CreditMap::new(500);
        assert_eq!(m.min_credits(), 500);
        assert!(m.put_if_absent(&addr(1)));
        assert!(!m.put_if_absent(&addr(1)));
        m.clear();
        assert!(m.members().is_empty());
        m.replenish_all();
        assert_eq!(m.min_credits(), 500);
    }
}
