//! The dual scheduler: an earliest-deadline-first layer for real-time
//! environments that always preempts a priority round-robin layer used for
//! everything else, both driven by one tick-based clock.
//!
//! Every call to [`Scheduler::tick`] first refreshes any EDF environment
//! whose period has elapsed, then looks for a runnable EDF environment with
//! budget left — by earliest absolute deadline, ties broken by the smaller
//! environment id — and only falls through to the round-robin layer when
//! none exists. This mirrors the original scheduler's structure: EDF is
//! checked first on every tick and, by intent, always wins when it has a
//! runnable candidate, even though a stale comment in the original reads as
//! though the RR branch below it could still run in that case.

use crate::process::{EnvId, EnvTable, SchedClass, Status};

/// Drives the EDF + round-robin dual scheduler across ticks of a shared clock.
#[derive(Debug)]
pub struct Scheduler {
    clock: u32,
    last_rr_index: Option<usize>,
    rr_ticks_left: u32,
}

impl Scheduler {
    /// Creates a scheduler with its clock at zero and no round-robin history.
    #[must_use]
    pub fn new() -> Self {
        Scheduler {
            clock: 0,
            last_rr_index: None,
            rr_ticks_left: 0,
        }
    }

    /// The current value of the shared tick clock.
    #[must_use]
    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Advances the clock by one tick and returns the environment that
    /// should run for this tick, or `None` if nothing is runnable.
    pub fn tick(&mut self, envs: &mut EnvTable) -> Option<EnvId> {
        self.clock += 1;
        self.refresh_edf_periods(envs);
        if let Some(id) = self.pick_edf(envs) {
            if let Ok(env) = envs.get_mut(id) {
                env.runtime_left = env.runtime_left.saturating_sub(1);
            }
            return Some(id);
        }
        self.pick_rr(envs)
    }

    fn refresh_edf_periods(&self, envs: &mut EnvTable) {
        for env in envs.iter_mut() {
            if let SchedClass::Edf { period, budget } = env.sched {
                if self.clock >= env.period_deadline {
                    env.period_deadline = self.clock + period;
                    env.runtime_left = budget;
                }
            }
        }
    }

    fn pick_edf(&self, envs: &EnvTable) -> Option<EnvId> {
        envs.iter()
            .filter(|e| {
                matches!(e.sched, SchedClass::Edf { .. })
                    && e.status == Status::Runnable
                    && e.runtime_left > 0
            })
            .min_by_key(|e| (e.period_deadline, e.id.raw()))
            .map(|e| e.id)
    }

    /// Keeps dispatching the last RR env while its quantum (`rr_ticks_left`)
    /// is still positive and it's still runnable; once that's no longer
    /// true, rotates to the next runnable RR env in list order (wrapping)
    /// and sets a fresh quantum equal to that env's own priority.
    fn pick_rr(&mut self, envs: &mut EnvTable) -> Option<EnvId> {
        let n = envs.capacity();
        if n == 0 {
            return None;
        }

        if self.rr_ticks_left > 0 {
            if let Some(idx) = self.last_rr_index {
                if let Some(env) = envs.slot(idx) {
                    if matches!(env.sched, SchedClass::RoundRobin { .. }) && env.status == Status::Runnable {
                        self.rr_ticks_left -= 1;
                        return Some(env.id);
                    }
                }
            }
        }

        let start = self.last_rr_index.map_or(0, |i| (i + 1) % n);
        let mut found: Option<(usize, u8)> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let Some(env) = envs.slot(idx) else { continue };
            if let SchedClass::RoundRobin { priority } = env.sched {
                if env.status == Status::Runnable {
                    found = Some((idx, priority));
                    break;
                }
            }
        }

        let (idx, priority) = found?;
        self.last_rr_index = Some(idx);
        self.rr_ticks_left = u32::from(priority).saturating_sub(1);
        Some(envs.slot(idx).expect("index came from a live slot").id)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpaceIdPool, PageAllocator, PAGE_SIZE};

    fn setup(npage: usize) -> (std::vec::Vec<u8>, PageAllocator, AddressSpaceIdPool) {
        let mut backing = std::vec![0u8; npage * PAGE_SIZE];
        let alloc = unsafe { PageAllocator::new(backing.as_mut_ptr(), npage) };
        (backing, alloc, AddressSpaceIdPool::new(16))
    }

    fn mk(envs: &mut EnvTable, alloc: &mut PageAllocator, asids: &AddressSpaceIdPool, sched: SchedClass) -> EnvId {
        envs.env_alloc(alloc, asids, EnvId::NONE, sched).unwrap()
    }

    #[test]
    fn edf_always_preempts_runnable_rr() {
        let (_b, mut alloc, asids) = setup(64);
        let mut envs = EnvTable::new();
        let rr = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 5 });
        let edf = mk(&mut envs, &mut alloc, &asids, SchedClass::Edf { period: 10, budget: 3 });
        let _ = rr;
        let mut sched = Scheduler::new();
        for _ in 0..3 {
            assert_eq!(sched.tick(&mut envs), Some(edf));
        }
    }

    #[test]
    fn rr_alternates_every_tick_at_equal_priority() {
        let (_b, mut alloc, asids) = setup(64);
        let mut envs = EnvTable::new();
        let a = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 1 });
        let b = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 1 });
        let mut sched = Scheduler::new();
        let picks: std::vec::Vec<_> = (0..4).map(|_| sched.tick(&mut envs).unwrap()).collect();
        assert_eq!(picks, std::vec![a, b, a, b]);
    }

    #[test]
    fn rr_envs_split_ticks_proportionally_to_priority() {
        // spec.md §8 "Scheduler fairness (RR)": with priorities p1, p2,
        // over any window of p1+p2 ticks each env runs pi ticks.
        let (_b, mut alloc, asids) = setup(64);
        let mut envs = EnvTable::new();
        let low = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 1 });
        let high = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 9 });
        let mut sched = Scheduler::new();
        let picks: std::vec::Vec<_> = (0..10).map(|_| sched.tick(&mut envs).unwrap()).collect();
        assert_eq!(picks.iter().filter(|p| **p == low).count(), 1);
        assert_eq!(picks.iter().filter(|p| **p == high).count(), 9);
    }

    #[test]
    fn edf_budget_exhaustion_falls_back_to_rr() {
        let (_b, mut alloc, asids) = setup(64);
        let mut envs = EnvTable::new();
        let rr = mk(&mut envs, &mut alloc, &asids, SchedClass::RoundRobin { priority: 1 });
        let edf = mk(&mut envs, &mut alloc, &asids, SchedClass::Edf { period: 100, budget: 2 });
        let mut sched = Scheduler::new();
        assert_eq!(sched.tick(&mut envs), Some(edf));
        assert_eq!(sched.tick(&mut envs), Some(edf));
        // budget exhausted until period elapses at tick 100
        assert_eq!(sched.tick(&mut envs), Some(rr));
    }

    #[test]
    fn no_runnable_environments_returns_none() {
        let mut envs = EnvTable::new();
        let mut sched = Scheduler::new();
        assert_eq!(sched.tick(&mut envs), None);
    }
}
