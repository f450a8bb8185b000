//! Restart-with-fresh-state supervision of automation actors

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::error;

use mirai_automation::{Actor, ActorDeps, AutomationRegistry};

/// Throttle between restarts of the same actor
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Wire up one actor per registered automation
pub fn build_actors(
    registry: &AutomationRegistry,
    deps: &ActorDeps,
    shutdown: broadcast::Sender<()>,
) -> Vec<Arc<Actor>> {
    registry
        .all()
        .iter()
        .map(|automation| Actor::new(automation.clone(), deps, shutdown.clone()))
        .collect()
}

/// Supervise the actors until shutdown
///
/// A crash that escapes an actor's callback guards restarts it with a
/// fresh `initial_state()` after a throttle delay. A clean exit (shutdown)
/// ends supervision of that actor.
pub fn supervise(
    actors: Vec<Arc<Actor>>,
    shutdown: broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    actors
        .into_iter()
        .map(|actor| {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    match actor.spawn().await {
                        Ok(()) => return,
                        Err(e) if e.is_panic() => {
                            error!(
                                automation = %actor.name(),
                                "automation crashed; restarting with fresh state"
                            );
                            tokio::select! {
                                _ = sleep(RESTART_DELAY) => {}
                                _ = shutdown_rx.recv() => return,
                            }
                        }
                        Err(_) => return,
                    }
                }
            })
        })
        .collect()
}
