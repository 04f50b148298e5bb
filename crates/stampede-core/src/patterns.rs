//! Load patterns drive virtual-user creation and teardown: `basic`
//! (ramp + hold), `stepping` (staircase targets), and `arrivals` (open-model
//! constant spawn rate with arithmetic pacing).
//!
//! A pattern owns its users for the duration of one phase: errors inside a
//! user's execution pass are logged and contained, self-termination (data
//! exhaustion) retires that user only, and cancellation stops everyone.

use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::clock::sleep_cancellable;
use crate::error::EngineError;
use crate::plan::model::{LoadPhase, LoadStep};
use crate::virtual_user::{VirtualUser, VuFactory, VuHandle, VuSignal};

/// Run one load phase to completion.
pub async fn run_phase(
    phase: &LoadPhase,
    factory: &VuFactory,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    match phase {
        LoadPhase::Basic {
            users,
            duration,
            ramp_up,
        } => {
            let duration = duration.as_duration()?;
            let ramp_up = match ramp_up {
                Some(spec) => spec.as_duration()?,
                None => Duration::ZERO,
            };
            run_basic(*users, duration, ramp_up, factory, cancel).await;
            Ok(())
        }
        LoadPhase::Stepping { steps } => run_stepping(steps, factory, cancel).await,
        LoadPhase::Arrivals {
            rate,
            duration,
            vu_duration,
        } => {
            let duration = duration.as_duration()?;
            let vu_duration = match vu_duration {
                Some(spec) => Some(spec.as_duration()?),
                None => None,
            };
            run_arrivals(*rate, duration, vu_duration, factory, cancel).await;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Drive loop
// ---------------------------------------------------------------------------

/// Repeatedly run a user's execution pass until its deadline, its stop
/// signal, or the phase's cancel token. Errors never escape: they are logged
/// and the loop continues with the next pass.
async fn drive_vu(mut vu: VirtualUser, deadline: Option<Instant>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() || !vu.is_active() {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        match vu.execute_scenarios().await {
            Ok(VuSignal::Continue) => {}
            Ok(VuSignal::Terminated) => break,
            Err(e) => {
                tracing::error!(vu_id = vu.id(), error = %e, "virtual user pass failed");
            }
        }
    }
    vu.shutdown().await;
}

/// Run exactly one execution pass, then retire the user (open-model users
/// without an explicit duration).
async fn drive_vu_once(mut vu: VirtualUser) {
    match vu.execute_scenarios().await {
        Ok(_) => {}
        Err(e) => tracing::error!(vu_id = vu.id(), error = %e, "virtual user pass failed"),
    }
    vu.shutdown().await;
}

// ---------------------------------------------------------------------------
// Basic: ramp + hold
// ---------------------------------------------------------------------------

async fn run_basic(
    users: u32,
    duration: Duration,
    ramp_up: Duration,
    factory: &VuFactory,
    cancel: &CancellationToken,
) {
    if users == 0 {
        return;
    }
    // Linear ramp spacing; users start executing as soon as they exist.
    let ramp_delay = ramp_up / users;
    let deadline = Instant::now() + ramp_up + duration;

    let mut join: JoinSet<()> = JoinSet::new();
    let mut handles: Vec<VuHandle> = Vec::new();

    for created in 0..users {
        if cancel.is_cancelled() {
            break;
        }
        if created > 0 && !ramp_delay.is_zero() && !sleep_cancellable(ramp_delay, cancel).await {
            break;
        }
        let vu = factory.create();
        handles.push(vu.handle());
        join.spawn(drive_vu(vu, Some(deadline), cancel.clone()));
    }

    // Hold until the deadline, the cancel signal, or every user retiring
    // early (data exhaustion ends the phase without error).
    let deadline_sleep = sleep_until(tokio::time::Instant::from_std(deadline));
    tokio::pin!(deadline_sleep);
    loop {
        tokio::select! {
            _ = &mut deadline_sleep => break,
            _ = cancel.cancelled() => break,
            joined = join.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
        }
    }

    stop_and_await(&handles, &mut join).await;
}

// ---------------------------------------------------------------------------
// Stepping: staircase
// ---------------------------------------------------------------------------

async fn run_stepping(
    steps: &[LoadStep],
    factory: &VuFactory,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let mut join: JoinSet<()> = JoinSet::new();
    // Users we have not explicitly stopped, in creation order.
    let mut handles: Vec<VuHandle> = Vec::new();

    for step in steps {
        if cancel.is_cancelled() {
            break;
        }
        let target = step.users as usize;
        let duration = step.duration.as_duration()?;
        let ramp_up = match &step.ramp_up {
            Some(spec) => spec.as_duration()?,
            None => Duration::ZERO,
        };

        if handles.len() < target {
            // Scale up with linear spacing over the step's ramp.
            let to_add = target - handles.len();
            let ramp_delay = ramp_up / to_add as u32;
            for created in 0..to_add {
                if cancel.is_cancelled() {
                    break;
                }
                if created > 0
                    && !ramp_delay.is_zero()
                    && !sleep_cancellable(ramp_delay, cancel).await
                {
                    break;
                }
                let vu = factory.create();
                handles.push(vu.handle());
                join.spawn(drive_vu(vu, None, cancel.clone()));
            }
        } else if handles.len() > target {
            // Scale down: stop the most recently created users.
            while handles.len() > target {
                if let Some(handle) = handles.pop() {
                    tracing::debug!(vu_id = handle.id, "stepping down, stopping user");
                    handle.signal_stop();
                }
            }
        }

        // Hold; users keep executing scenarios throughout.
        if !sleep_cancellable(duration, cancel).await {
            break;
        }
    }

    stop_and_await(&handles, &mut join).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Arrivals: open model
// ---------------------------------------------------------------------------

async fn run_arrivals(
    rate: f64,
    duration: Duration,
    vu_duration: Option<Duration>,
    factory: &VuFactory,
    cancel: &CancellationToken,
) {
    if rate <= 0.0 {
        return;
    }
    // Arithmetic pacing: the next creation time is the previous one plus
    // 1000/rate milliseconds.
    let interval = Duration::from_secs_f64(1.0 / rate);
    let deadline = Instant::now() + duration;
    let mut next_spawn = Instant::now();

    let mut join: JoinSet<()> = JoinSet::new();

    while Instant::now() < deadline && !cancel.is_cancelled() {
        let now = Instant::now();
        if next_spawn > now {
            let wait = (next_spawn - now).min(deadline.saturating_duration_since(now));
            if !sleep_cancellable(wait, cancel).await {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        next_spawn += interval;

        let vu = factory.create();
        match vu_duration {
            Some(limit) => {
                let vu_deadline = Instant::now() + limit;
                join.spawn(drive_vu(vu, Some(vu_deadline), cancel.clone()));
            }
            None => {
                join.spawn(drive_vu_once(vu));
            }
        }
    }

    // The phase ends only after the window closed and every spawned user
    // finished.
    while join.join_next().await.is_some() {}
}

async fn stop_and_await(handles: &[VuHandle], join: &mut JoinSet<()>) {
    for handle in handles {
        handle.signal_stop();
    }
    while join.join_next().await.is_some() {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
