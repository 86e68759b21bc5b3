pub mod channel;
pub mod liveness;
pub mod sync_loop;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config_store::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::handoff::HandoffStore;
use crate::notify::{LogNotifier, Notice, Notifier};
use crate::rootpath::StateLayout;
use crate::supervisor::Supervisor;
use crate::update::{ExecRelauncher, RemoteSource, UpdateManager, resume_after_handoff};
use sync_loop::{State, SyncLoop};

/// Bring the supervisor up from its state directory and serve until SIGINT/SIGTERM.
///
/// Startup order matters: the configuration is loaded (and healed from a backup if it has
/// to be), processes left behind by a previous instance are adopted, and only then are the
/// remaining projects launched.
pub async fn run(layout: StateLayout, listen: SocketAddr) -> anyhow::Result<()> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let store = Arc::new(ConfigStore::new(
        layout.config_file(),
        layout.backup_dir(),
    ));
    let (config, healed) = store.open().await.with_context(|| {
        format!(
            "Failed to load configuration from {}",
            layout.config_file().display()
        )
    })?;
    if let Some(reason) = healed {
        notifier.notify(Notice::ConfigRestored { reason }).await;
    }

    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_settings(),
        notifier.clone(),
    ));
    supervisor
        .register(
            config.supervisor_settings(),
            config.launch_specs(&store.base_dir()),
        )
        .await;
    let handoff = HandoffStore::new(layout.handoff_file());
    if let Err(e) = resume_after_handoff(&supervisor, &handoff, notifier.as_ref()).await {
        warn!("Failed to resume from handoff record: {e}");
    }
    supervisor.start_idle().await;

    let source = Arc::new(RemoteSource::new(config.updates.fetch_timeout())?);
    let updates = Arc::new(UpdateManager::new(
        supervisor.clone(),
        store.clone(),
        source,
        Arc::new(ExecRelauncher),
        handoff,
        notifier,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        supervisor.clone(),
        updates,
        layout.log_dir(),
    ));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind command channel on {listen}"))?;
    info!("Serving commands on {listen}");

    let sync_loop = SyncLoop::new(Arc::new(State::new(supervisor.clone(), store.clone())))
        .register_event(liveness::liveness_handler)
        .register_event(liveness::health_handler);

    let (stop, _) = watch::channel(false);
    let serve = async {
        let res = axum::serve(listener, channel::router(dispatcher, store))
            .with_graceful_shutdown(stopped(stop.subscribe()))
            .await;
        stop.send_replace(true);
        res
    };
    let signal = async {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = stopped(stop.subscribe()) => {}
        }
        stop.send_replace(true);
    };
    let (served, _, _) = tokio::join!(
        serve,
        sync_loop.run_until(stopped(stop.subscribe())),
        signal
    );

    info!("Stopping managed processes");
    supervisor.shutdown().await;
    served.context("Command channel failed")?;
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
