//! The timeout reconciler: a single background worker that moves silent
//! services to `DisconnectedByTimeout` and keeps the front door in sync.
//!
//! The loop partitions the keepalive-time cache under its lock, commits any
//! timeouts in one transaction, pokes the nginx materializer, then sleeps until
//! either its wake signal (new codename, deregistration, shutdown) or the
//! moment the oldest survivor would expire.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;

use karl_core::{observability, MicroDuration, MicroTimestamp, RegisteredState, RuntimeStatus};

use crate::state::AppState;

/// Spawns the reconciler worker.
pub(crate) fn spawn<R: RuntimeStatus>(state: Arc<AppState<R>>) -> JoinHandle<()> {
    tokio::spawn(async move { run(state).await })
}

async fn run<R: RuntimeStatus>(state: Arc<AppState<R>>) {
    loop {
        if state.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let now = state.clock.now();
        let (timed_out, most_recent_survivor) = partition_cache(&state, now);

        if !timed_out.is_empty() {
            {
                let span = observability::reconcile_span(timed_out.len());
                let _guard = span.enter();
                tracing::info!(timed_out = ?timed_out, "services timed out");
            }
            if let Err(error) = mark_disconnected(&state, &timed_out).await {
                tracing::warn!(%error, "failed to persist timeouts; will retry next pass");
                // Put the codenames back so the next pass sees them again.
                let mut cache = state.keepalive_cache();
                for codename in timed_out {
                    cache.entry(codename).or_insert(MicroTimestamp::ZERO);
                }
            }
        }

        if let Some(nginx) = &state.nginx {
            if let Err(error) = nginx.update_if_needed(&state.storage).await {
                tracing::warn!(%error, "front-door update failed");
            }
        }

        sleep_until_next_deadline(&state, most_recent_survivor).await;
    }
}

/// Splits the cache into timed-out codenames (removed) and survivors, returning
/// the most recent survivor keepalive time.
fn partition_cache<R: RuntimeStatus>(
    state: &AppState<R>,
    now: MicroTimestamp,
) -> (Vec<String>, Option<MicroTimestamp>) {
    let timeout = state.config.service_timeout_interval;
    let mut timed_out = Vec::new();
    let mut most_recent = None;

    let mut cache = state.keepalive_cache();
    cache.retain(|codename, last| {
        if now - *last > timeout {
            timed_out.push(codename.clone());
            false
        } else {
            most_recent = most_recent.max(Some(*last));
            true
        }
    });
    (timed_out, most_recent)
}

async fn mark_disconnected<R: RuntimeStatus>(
    state: &AppState<R>,
    codenames: &[String],
) -> karl_store::Result<()> {
    state
        .storage
        .read_write(|fields| {
            for codename in codenames {
                let mut claire = fields
                    .claires()
                    .get(codename)
                    .cloned()
                    .unwrap_or_else(|| karl_core::ClaireInfo::skeleton(codename.clone()));
                claire.registered_state = RegisteredState::DisconnectedByTimeout;
                fields.claires().add(claire);
            }
            Ok(())
        })
        .await
}

async fn sleep_until_next_deadline<R: RuntimeStatus>(
    state: &AppState<R>,
    most_recent_survivor: Option<MicroTimestamp>,
) {
    let deadline = most_recent_survivor.map(|last| {
        state.config.service_timeout_interval - (state.clock.now() - last)
            + MicroDuration::from_micros(1)
    });

    // A poll bound keeps mock-clock tests moving; without one, the computed
    // deadline (or the wake signal alone) drives the schedule.
    let wait = match (deadline, state.config.reconciler_poll_interval) {
        (Some(d), Some(poll)) => Some(d.min(poll)),
        (Some(d), None) => Some(d),
        (None, poll) => poll,
    };

    match wait {
        Some(wait) if wait.is_positive() => {
            tokio::select! {
                () = state.reconciler_wake.notified() => {}
                () = tokio::time::sleep(wait.as_std()) => {}
            }
        }
        Some(_) => {
            // Deadline already due; run the next pass immediately.
        }
        None => state.reconciler_wake.notified().await,
    }
}

#[cfg(test)]
mod tests {
    use karl_core::{Clock, MicroDuration};

    use super::*;
    use crate::config::Config;
    use crate::karl::KarlBuilder;

    #[tokio::test]
    async fn timed_out_services_are_marked_disconnected() {
        let clock = karl_test_utils::MockClock::starting_at(1_000_000);
        let karl = KarlBuilder::<karl_core::DefaultRuntime>::new(Config {
            reconciler_poll_interval: Some(MicroDuration::from_micros(5_000)),
            ..Config::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .unwrap();

        let now = clock.now();
        karl.state().touch_keepalive("SILENT", now);
        assert_eq!(karl.active_services_count(), 1);

        clock.advance_seconds(46);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(karl.active_services_count(), 0);
        let state = karl
            .state()
            .storage
            .read_only(|tables| {
                tables
                    .claires
                    .get(&"SILENT".to_string())
                    .map(|c| c.registered_state)
            })
            .await;
        assert_eq!(state, Some(RegisteredState::DisconnectedByTimeout));
        karl.shutdown().await;
    }

    #[tokio::test]
    async fn surviving_services_are_left_alone() {
        let clock = karl_test_utils::MockClock::starting_at(1_000_000);
        let karl = KarlBuilder::<karl_core::DefaultRuntime>::new(Config {
            reconciler_poll_interval: Some(MicroDuration::from_micros(5_000)),
            ..Config::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .unwrap();

        karl.state().touch_keepalive("ALIVE", clock.now());
        clock.advance_seconds(10);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(karl.active_services_count(), 1);
        karl.shutdown().await;
    }
}
