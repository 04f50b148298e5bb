//! Named rendezvous points: N virtual users block at a barrier until all
//! parties have arrived, then proceed together. Waits are cancellable, so a
//! stopping test never deadlocks on a half-full barrier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Result of a rendezvous wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousOutcome {
    /// All parties arrived; this waiter may proceed.
    Released,
    /// The cancel signal fired before the barrier filled.
    Cancelled,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// A counted barrier built on arrival counting and [`Notify`], so a waiter
/// that is cancelled mid-wait simply withdraws its arrival.
struct Barrier {
    parties: usize,
    state: Mutex<BarrierState>,
    notify: Notify,
}

impl Barrier {
    fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            notify: Notify::new(),
        }
    }

    async fn wait(&self, cancel: &CancellationToken) -> RendezvousOutcome {
        let my_generation = {
            let mut state = self.state.lock().expect("barrier poisoned");
            state.arrived += 1;
            if state.arrived >= self.parties {
                // Last arrival releases the whole generation.
                state.arrived = 0;
                state.generation += 1;
                self.notify.notify_waiters();
                return RendezvousOutcome::Released;
            }
            state.generation
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // A `Notified` future joins the waiter list only once enabled, so
            // enable it before re-checking the generation; a release landing
            // in between is then a stored permit, not a lost wakeup.
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect("barrier poisoned");
                if state.generation != my_generation {
                    return RendezvousOutcome::Released;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    let mut state = self.state.lock().expect("barrier poisoned");
                    if state.generation == my_generation && state.arrived > 0 {
                        state.arrived -= 1;
                    }
                    return RendezvousOutcome::Cancelled;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of named rendezvous points, reset between test runs.
#[derive(Default)]
pub struct RendezvousRegistry {
    barriers: Mutex<HashMap<String, Arc<Barrier>>>,
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `parties` waiters have arrived at the barrier named
    /// `name`, or the cancel signal fires. The first caller for a name fixes
    /// the party count; later counts are ignored for that barrier.
    pub async fn wait(
        &self,
        name: &str,
        parties: usize,
        cancel: &CancellationToken,
    ) -> RendezvousOutcome {
        let barrier = {
            let mut barriers = self.barriers.lock().expect("registry poisoned");
            Arc::clone(
                barriers
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Barrier::new(parties))),
            )
        };
        barrier.wait(cancel).await
    }

    /// Drop all barriers; called by the runner before each test.
    pub fn reset(&self) {
        self.barriers.lock().expect("registry poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn all_parties_release_together() {
        let registry = Arc::new(RendezvousRegistry::new());
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let reg = Arc::clone(&registry);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                reg.wait("checkout", 3, &token).await
            }));
        }
        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("barrier must release")
                .unwrap();
            assert_eq!(outcome, RendezvousOutcome::Released);
        }
    }

    #[tokio::test]
    async fn single_party_barrier_releases_immediately() {
        let registry = RendezvousRegistry::new();
        let cancel = CancellationToken::new();
        let outcome = registry.wait("solo", 1, &cancel).await;
        assert_eq!(outcome, RendezvousOutcome::Released);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiters() {
        let registry = Arc::new(RendezvousRegistry::new());
        let cancel = CancellationToken::new();

        let reg = Arc::clone(&registry);
        let token = cancel.clone();
        let waiter = tokio::spawn(async move { reg.wait("never-full", 5, &token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel must unblock")
            .unwrap();
        assert_eq!(outcome, RendezvousOutcome::Cancelled);
    }

    #[tokio::test]
    async fn barrier_is_reusable_across_generations() {
        let registry = Arc::new(RendezvousRegistry::new());
        let cancel = CancellationToken::new();

        for _round in 0..3 {
            let mut handles = Vec::new();
            for _ in 0..2 {
                let reg = Arc::clone(&registry);
                let token = cancel.clone();
                handles.push(tokio::spawn(async move { reg.wait("gate", 2, &token).await }));
            }
            for handle in handles {
                let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
                    .await
                    .expect("generation must release")
                    .unwrap();
                assert_eq!(outcome, RendezvousOutcome::Released);
            }
        }
    }

    #[tokio::test]
    async fn reset_clears_named_barriers() {
        let registry = Arc::new(RendezvousRegistry::new());
        let cancel = CancellationToken::new();

        // Fill one slot of a 2-party barrier, then cancel the waiter.
        let reg = Arc::clone(&registry);
        let token = cancel.clone();
        let waiter = tokio::spawn(async move { reg.wait("gate", 2, &token).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        waiter.await.unwrap();

        registry.reset();

        // After reset, a fresh 1-party barrier under the same name releases
        // immediately instead of inheriting stale arrivals.
        let fresh_cancel = CancellationToken::new();
        let outcome = registry.wait("gate", 1, &fresh_cancel).await;
        assert_eq!(outcome, RendezvousOutcome::Released);
    }
}
