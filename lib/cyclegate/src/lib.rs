// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A two-phase cycle barrier with cooperative enrollment.
//!
//! `CycleGate` coordinates one *manager* thread running a periodic cycle with
//! any number of *user* threads that want to observe cycle edges. A cycle has
//! two phases:
//!
//! - Phase 1 opens once the manager has published the previous cycle's
//!   results. Users released here see fresh data.
//! - Phase 2 opens once the manager has finished deciding what the new cycle
//!   will do. Users released here know their requests were considered.
//!
//! User threads come in two flavors:
//!
//! - **Cooperative** threads enroll with [`CycleGate::enroll`]. The manager
//!   will not start a cycle until every enrolled thread is parked in
//!   [`CycleGate::wait_cycle`]. This gives a lockstep guarantee: between two
//!   consecutive returns of `wait_cycle` on a cooperative thread, the manager
//!   runs exactly one cycle.
//! - **Non-cooperative** threads call `wait_cycle` without enrolling. They
//!   never hold up the manager. A non-cooperative caller that arrives while
//!   phase 1 is already open first waits for phase 2 of the in-flight cycle
//!   and only then attaches to the next one; attaching mid-cycle would let it
//!   observe a cycle whose decisions predate its arrival. Keep that ordering.
//!
//! The manager side is a guard pair: [`CycleGate::begin_cycle`] parks until
//! all cooperative threads have arrived, opens phase 1, and returns a
//! [`CycleGuard`]. The guard keeps the gate's mutex held, so the manager can
//! publish results and make its selection decisions without users slipping
//! past the barrier. [`CycleGuard::finish`] then opens phase 2 and releases
//! everyone.
//!
//! Outside any cycle the gate is quiescent with phase 1 closed and phase 2
//! open, so `begin_cycle` is always the operation that arms the next edge.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Errors from enrollment bookkeeping. These are all caller logic errors;
/// none of them is transient.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GateError {
    /// The calling thread is already enrolled as cooperative.
    AlreadyEnrolled,
    /// The calling thread is not enrolled as cooperative.
    NotEnrolled,
    /// The manager thread itself is enrolled as cooperative; it would
    /// deadlock waiting for its own arrival.
    ManagerEnrolled,
}

impl core::fmt::Display for GateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyEnrolled => {
                write!(f, "thread is already enrolled as cooperative")
            }
            Self::NotEnrolled => {
                write!(f, "thread is not enrolled as cooperative")
            }
            Self::ManagerEnrolled => {
                write!(f, "cycle manager thread is enrolled as cooperative")
            }
        }
    }
}

impl std::error::Error for GateError {}

/// What a completed [`CycleGate::wait_cycle`] call observed, mostly for the
/// caller's statistics.
#[derive(Copy, Clone, Debug)]
pub struct WaitReport {
    /// Whether the calling thread was enrolled when it waited.
    pub cooperative: bool,
    /// Wall time spent inside the wait, both phases included.
    pub waited: Duration,
}

#[derive(Default)]
struct GateState {
    cooperative: HashSet<ThreadId>,
    open1: bool,
    open2: bool,
    // Non-cooperative threads currently inside wait_cycle (phase 1 entered
    // but phase 2 not yet exited) and, separately, those parked at phase 2.
    // The manager closes phase 1 only once these two agree, so a thread
    // released at phase 1 cannot be left behind at phase 2.
    waiting1: usize,
    waiting2: usize,
    coop_waiting1: usize,
    coop_waiting2: usize,
}

pub struct CycleGate {
    state: Mutex<GateState>,
    manager_wait_user1: Condvar,
    manager_wait_user2: Condvar,
    user_wait_manager1: Condvar,
    user_wait_manager2: Condvar,
}

impl Default for CycleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                // Quiescent configuration: phase 2 open, phase 1 closed.
                open2: true,
                ..GateState::default()
            }),
            manager_wait_user1: Condvar::new(),
            manager_wait_user2: Condvar::new(),
            user_wait_manager1: Condvar::new(),
            user_wait_manager2: Condvar::new(),
        }
    }

    // All state updates are single-field writes made with the lock held, so
    // a panic on some other thread cannot leave the counters torn; recover
    // the guard rather than propagating the poison.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enrolls the calling thread as cooperative. Until [`Self::withdraw`],
    /// the manager will wait for this thread at every cycle start.
    pub fn enroll(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        if !state.cooperative.insert(thread::current().id()) {
            return Err(GateError::AlreadyEnrolled);
        }
        Ok(())
    }

    /// Withdraws the calling thread's cooperative enrollment.
    pub fn withdraw(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        if !state.cooperative.remove(&thread::current().id()) {
            return Err(GateError::NotEnrolled);
        }
        // The manager may be parked waiting for this thread at phase 1.
        self.manager_wait_user1.notify_all();
        Ok(())
    }

    /// Whether the calling thread is currently enrolled.
    pub fn is_enrolled(&self) -> bool {
        self.lock().cooperative.contains(&thread::current().id())
    }

    /// Number of currently enrolled cooperative threads.
    pub fn enrolled_count(&self) -> usize {
        self.lock().cooperative.len()
    }

    /// Parks the calling thread until the next cycle has opened both phases.
    ///
    /// For cooperative callers this is the lockstep rendezvous: the manager
    /// waits for us at phase 1, we wait for it at both phases. For
    /// non-cooperative callers it is a pure observer wait; see the module
    /// docs for the late-arriver ordering.
    pub fn wait_cycle(&self) -> WaitReport {
        let start = Instant::now();
        let mut state = self.lock();
        let cooperative =
            state.cooperative.contains(&thread::current().id());

        if cooperative {
            state.coop_waiting1 += 1;
            self.manager_wait_user1.notify_all();
        } else {
            if state.open1 {
                // Phase 1 already open: a cycle is in flight and its
                // selection happened without us. Sit out the remainder
                // (phase 2) and attach to the next cycle instead.
                state = self
                    .user_wait_manager2
                    .wait_while(state, |s| !s.open2)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.waiting1 += 1;
        }

        state = self
            .user_wait_manager1
            .wait_while(state, |s| !s.open1)
            .unwrap_or_else(PoisonError::into_inner);

        if cooperative {
            state.coop_waiting1 -= 1;
            state.coop_waiting2 += 1;
        } else {
            state.waiting2 += 1;
        }
        self.manager_wait_user2.notify_all();

        state = self
            .user_wait_manager2
            .wait_while(state, |s| !s.open2)
            .unwrap_or_else(PoisonError::into_inner);

        if cooperative {
            state.coop_waiting2 -= 1;
        } else {
            state.waiting1 -= 1;
            state.waiting2 -= 1;
        }
        drop(state);

        WaitReport {
            cooperative,
            waited: start.elapsed(),
        }
    }

    /// Manager side: waits until every cooperative thread has arrived at
    /// phase 1, then opens phase 1 and returns a guard.
    ///
    /// The gate's mutex stays held through the returned guard, so user
    /// threads cannot advance past either barrier until
    /// [`CycleGuard::finish`]; the manager does its swap and selection work
    /// while holding it.
    pub fn begin_cycle(&self) -> Result<CycleGuard<'_>, GateError> {
        let mut state = self.lock();
        if state.cooperative.contains(&thread::current().id()) {
            return Err(GateError::ManagerEnrolled);
        }

        state = self
            .manager_wait_user1
            .wait_while(state, |s| s.coop_waiting1 != s.cooperative.len())
            .unwrap_or_else(PoisonError::into_inner);

        state.open2 = false;
        state.open1 = true;
        self.user_wait_manager1.notify_all();

        Ok(CycleGuard { gate: self, state })
    }
}

/// Proof that a cycle is between phase 1 and phase 2; holds the gate mutex.
///
/// Dropping the guard without calling [`Self::finish`] (a manager panic)
/// leaves phase 1 open; the next `begin_cycle` re-arms the gate, and user
/// threads fall into the late-arriver path.
pub struct CycleGuard<'a> {
    gate: &'a CycleGate,
    state: MutexGuard<'a, GateState>,
}

impl CycleGuard<'_> {
    /// Waits for every cooperative thread (and every non-cooperative thread
    /// that passed phase 1) to arrive at phase 2, then closes phase 1, opens
    /// phase 2, and releases everyone.
    pub fn finish(self) {
        let gate = self.gate;
        let mut state = gate
            .manager_wait_user2
            .wait_while(self.state, |s| {
                s.coop_waiting2 != s.cooperative.len()
                    || s.waiting2 != s.waiting1
            })
            .unwrap_or_else(PoisonError::into_inner);

        state.open1 = false;
        state.open2 = true;
        gate.user_wait_manager2.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run_cycle(gate: &CycleGate) {
        gate.begin_cycle().unwrap().finish();
    }

    #[test]
    fn enroll_twice_is_an_error() {
        let gate = CycleGate::new();
        gate.enroll().unwrap();
        assert_eq!(gate.enroll(), Err(GateError::AlreadyEnrolled));
        gate.withdraw().unwrap();
        assert_eq!(gate.withdraw(), Err(GateError::NotEnrolled));
    }

    #[test]
    fn enrolled_manager_is_rejected() {
        let gate = CycleGate::new();
        gate.enroll().unwrap();
        assert!(matches!(
            gate.begin_cycle().map(|_| ()),
            Err(GateError::ManagerEnrolled)
        ));
    }

    #[test]
    fn cycle_without_users_completes() {
        let gate = CycleGate::new();
        run_cycle(&gate);
        run_cycle(&gate);
    }

    #[test]
    fn manager_waits_for_cooperative_arrival() {
        let gate = Arc::new(CycleGate::new());
        let cycles = Arc::new(AtomicUsize::new(0));

        // Enroll from a helper thread that never reaches wait_cycle until
        // we let it; the manager must not complete a cycle before then.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let user = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.enroll().unwrap();
                ready_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                gate.wait_cycle();
                gate.withdraw().unwrap();
            })
        };
        ready_rx.recv().unwrap();

        let manager = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                run_cycle(&gate);
                cycles.fetch_add(1, Ordering::SeqCst);
            })
        };

        // The user thread is enrolled but not waiting; give the manager
        // ample time to (incorrectly) run a cycle without it.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cycles.load(Ordering::SeqCst), 0);

        go_tx.send(()).unwrap();
        user.join().unwrap();
        manager.join().unwrap();
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exactly_one_cycle_between_cooperative_returns() {
        let gate = Arc::new(CycleGate::new());
        let cycles = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let user = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                gate.enroll().unwrap();
                ready_tx.send(()).unwrap();
                for _ in 0..10 {
                    gate.wait_cycle();
                    seen.lock().unwrap().push(cycles.load(Ordering::SeqCst));
                }
                gate.withdraw().unwrap();
            })
        };
        // Don't start cycling before the enrollment exists, or the manager
        // loop below would see zero enrollments and quit immediately.
        ready_rx.recv().unwrap();

        let manager = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                // Run cycles until the user has withdrawn. The counter is
                // bumped between the phases, i.e. "during" the cycle.
                while gate.enrolled_count() != 0 {
                    let guard = gate.begin_cycle().unwrap();
                    cycles.fetch_add(1, Ordering::SeqCst);
                    guard.finish();
                }
            })
        };

        user.join().unwrap();
        manager.join().unwrap();

        // Each return observed exactly one more completed cycle than the
        // previous return: lockstep, no skipped and no doubled cycles.
        let seen = seen.lock().unwrap();
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn two_cooperative_threads_share_one_selection() {
        let gate = Arc::new(CycleGate::new());
        let cycles = Arc::new(AtomicUsize::new(0));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let users: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let cycles = Arc::clone(&cycles);
                let ready_tx = ready_tx.clone();
                thread::spawn(move || {
                    gate.enroll().unwrap();
                    ready_tx.send(()).unwrap();
                    let mut observed = Vec::new();
                    for _ in 0..5 {
                        gate.wait_cycle();
                        observed.push(cycles.load(Ordering::SeqCst));
                    }
                    gate.withdraw().unwrap();
                    observed
                })
            })
            .collect();
        // Both enrollments must exist before the first cycle, or one thread
        // could miss it and the two observation logs would diverge.
        ready_rx.recv().unwrap();
        ready_rx.recv().unwrap();

        let manager = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                while gate.enrolled_count() != 0 {
                    let guard = gate.begin_cycle().unwrap();
                    cycles.fetch_add(1, Ordering::SeqCst);
                    guard.finish();
                }
            })
        };

        let observations: Vec<Vec<usize>> =
            users.into_iter().map(|u| u.join().unwrap()).collect();
        manager.join().unwrap();

        // Both threads were released by the same five cycles and therefore
        // observed the same counter values in the same order.
        assert_eq!(observations[0], observations[1]);
        assert_eq!(observations[0], vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn late_noncooperative_arrival_skips_inflight_cycle() {
        let gate = Arc::new(CycleGate::new());

        // Open phase 1 and hold the guard: a cycle is now in flight.
        let guard = gate.begin_cycle().unwrap();

        let returned = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let gate = Arc::clone(&gate);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                gate.wait_cycle();
                returned.store(1, Ordering::SeqCst);
            })
        };

        // Let the waiter park, then finish the in-flight cycle. The waiter
        // saw phase 1 already open, so this finish must NOT release it.
        thread::sleep(Duration::from_millis(50));
        guard.finish();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(returned.load(Ordering::SeqCst), 0);

        // Only a full subsequent cycle releases it.
        run_cycle(&gate);
        waiter.join().unwrap();
        assert_eq!(returned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn withdraw_releases_waiting_manager() {
        let gate = Arc::new(CycleGate::new());

        let user = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.enroll().unwrap();
                // Never waits; just unenrolls after a delay.
                thread::sleep(Duration::from_millis(50));
                gate.withdraw().unwrap();
            })
        };

        // Blocks until the enrollment disappears, then runs unimpeded.
        run_cycle(&gate);
        user.join().unwrap();
    }

    #[test]
    fn wait_report_flags_cooperative() {
        let gate = Arc::new(CycleGate::new());

        let user = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.enroll().unwrap();
                let report = gate.wait_cycle();
                gate.withdraw().unwrap();
                report
            })
        };

        run_cycle(&gate);
        let report = user.join().unwrap();
        assert!(report.cooperative);
    }
}
