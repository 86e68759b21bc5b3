use std::{pin::Pin, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::daemon::sync_loop::{Event, State, WithEvent};

const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_POLL: Duration = Duration::from_secs(5);

/// Fires once per `CHECK_INTERVAL`; re-read on every cycle so a new configuration takes
/// effect without a restart.
pub struct LivenessTick;

impl Event<()> for LivenessTick {
    fn listen(state: Arc<State>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        async move {
            let interval = state
                .store
                .current()
                .await
                .map(|config| config.check_interval())
                .filter(|interval| !interval.is_zero())
                .unwrap_or(FALLBACK_INTERVAL);
            sleep(interval).await;
        }
        .boxed()
    }
}

/// Bring every project back in line with its desired state. Busy projects are skipped
/// by the supervisor and picked up on the next tick.
pub async fn liveness_handler(state: Arc<State>, _data: Box<()>, _event: WithEvent<LivenessTick>) {
    debug!("liveness sweep");
    state.supervisor.tick().await;
}

/// Polls the configuration lifecycle: confirms a committed configuration after its
/// grace period, or marks it unhealthy after a crash loop.
pub struct HealthCheck;

impl Event<()> for HealthCheck {
    fn listen(_state: Arc<State>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        async {
            sleep(HEALTH_POLL).await;
        }
        .boxed()
    }
}

pub async fn health_handler(state: Arc<State>, _data: Box<()>, _event: WithEvent<HealthCheck>) {
    if let Err(e) = state.supervisor.check_config_health(&state.store).await {
        error!("Failed to check configuration health: {e}");
    }
}
