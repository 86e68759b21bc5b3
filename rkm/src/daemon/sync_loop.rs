use std::{any::Any, any::TypeId, collections::HashMap, marker::PhantomData, pin::Pin, sync::Arc};

use futures::{FutureExt, future::select_all};
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::supervisor::Supervisor;

/// The daemon components shared by every event handler.
pub struct State {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<ConfigStore>,
}

impl State {
    pub fn new(supervisor: Arc<Supervisor>, store: Arc<ConfigStore>) -> Self {
        State { supervisor, store }
    }
}

type Handler = Arc<
    dyn Fn(Arc<State>, Box<dyn Any + Send>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;
/// A function generate a future for a event to wait in sync loop.
type Listener =
    Box<dyn Fn(Arc<State>) -> Pin<Box<dyn Future<Output = Box<dyn Any + Send>> + Send>> + Send>;
/// Generated future of a event, listening in the sync loop.
type ListeningFuture = Pin<Box<dyn Future<Output = (TypeId, Box<dyn Any + Send>)> + Send>>;

/// The daemon's main loop. Every registered event is listened for continuously: once an
/// event fires its handler is spawned and a fresh listening future for that event is queued.
///
/// # Example
/// ```ignore
/// let sync_loop = SyncLoop::new(state).register_event(handler);
/// sync_loop.run_until(shutdown).await;
/// ```
pub struct SyncLoop {
    state: Arc<State>,
    event_handlers: HashMap<TypeId, Handler>,
    event_listeners: HashMap<TypeId, Listener>,
    event_listen_list: Vec<ListeningFuture>,
}

/// An event the sync loop waits on. `listen` may consult the shared state, e.g. to read the
/// currently configured interval.
pub trait Event<D> {
    fn listen(state: Arc<State>) -> Pin<Box<dyn Future<Output = D> + Send>>;
}

impl SyncLoop {
    pub fn new(state: Arc<State>) -> Self {
        SyncLoop {
            state,
            event_handlers: HashMap::new(),
            event_listeners: HashMap::new(),
            event_listen_list: Vec::new(),
        }
    }

    /// Register a event handler.
    ///
    /// The `handler` has the signature
    /// `async fn handler(state: Arc<State>, data: Box<D>, _: WithEvent<SomeEvent>)`,
    /// where `SomeEvent: Event<D>` and `WithEvent` only marks which event it handles.
    pub fn register_event<T, D, F, O>(mut self, handler: F) -> Self
    where
        T: Event<D> + 'static,
        D: Send + 'static,
        O: Future<Output = ()> + Send,
        F: (Fn(Arc<State>, Box<D>, WithEvent<T>) -> O) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let handler: Handler = Arc::new(move |state, data: Box<dyn Any + Send>| {
            let handle = handler.clone();
            async move {
                match data.downcast::<D>() {
                    Ok(data) => {
                        handle(
                            state,
                            data,
                            WithEvent {
                                _marker: PhantomData,
                            },
                        )
                        .await
                    }
                    Err(_) => warn!("event data of unexpected type dropped"),
                }
            }
            .boxed()
        });
        self.event_handlers.insert(TypeId::of::<T>(), handler);
        let listener: Listener = Box::new(move |state| {
            async move { Box::new(T::listen(state).await) as Box<dyn Any + Send> }.boxed()
        });
        self.event_listeners.insert(TypeId::of::<T>(), listener);
        self
    }

    fn listen_for(&self, id: TypeId) -> Option<ListeningFuture> {
        let listener = self.event_listeners.get(&id)?;
        let fut = listener(self.state.clone());
        Some(async move { (id, fut.await) }.boxed())
    }

    /// Get Future from each event.
    fn gen_event_list(&mut self) {
        let ids: Vec<TypeId> = self.event_listeners.keys().copied().collect();
        self.event_listen_list = ids.into_iter().filter_map(|id| self.listen_for(id)).collect();
    }

    /// Run the loop until `shutdown` completes. Handlers already spawned keep running.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) {
        self.gen_event_list();
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            let list = std::mem::take(&mut self.event_listen_list);
            if list.is_empty() {
                shutdown.await;
                return;
            }
            let ((id, data), _, remain) = tokio::select! {
                fired = select_all(list) => fired,
                _ = &mut shutdown => {
                    debug!("sync loop stopped");
                    return;
                }
            };
            self.event_listen_list = remain;

            if let Some(handler) = self.event_handlers.get(&id).cloned() {
                let state = self.state.clone();
                tokio::spawn(async move { handler(state, data).await });
            }
            if let Some(fut) = self.listen_for(id) {
                self.event_listen_list.push(fut);
            }
        }
    }
}

pub struct WithEvent<T> {
    _marker: PhantomData<T>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notify::LogNotifier;
    use common::SupervisorSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    static TICKS: AtomicUsize = AtomicUsize::new(0);

    struct Tick;
    impl Event<()> for Tick {
        fn listen(_state: Arc<State>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            async {
                sleep(Duration::from_millis(20)).await;
            }
            .boxed()
        }
    }

    async fn tick_handler(_state: Arc<State>, _data: Box<()>, _: WithEvent<Tick>) {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }

    struct Nothing;
    impl Event<()> for Nothing {
        fn listen(_state: Arc<State>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            async {}.boxed()
        }
    }

    async fn nothing_handler(_state: Arc<State>, _data: Box<()>, _: WithEvent<Nothing>) {}

    fn state(dir: &std::path::Path) -> Arc<State> {
        let supervisor = Supervisor::new(SupervisorSettings::default(), Arc::new(LogNotifier));
        let store = ConfigStore::new(dir.join("config.json"), dir.join("backups"));
        Arc::new(State::new(Arc::new(supervisor), Arc::new(store)))
    }

    #[tokio::test]
    async fn test_register_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut sync_loop = SyncLoop::new(state(dir.path()))
            .register_event(tick_handler)
            .register_event(nothing_handler);
        assert_eq!(sync_loop.event_handlers.len(), 2);
        assert_eq!(sync_loop.event_listen_list.len(), 0);
        assert!(sync_loop.event_listeners.contains_key(&TypeId::of::<Tick>()));
        assert!(sync_loop.event_handlers.contains_key(&TypeId::of::<Nothing>()));
        sync_loop.gen_event_list();
        assert_eq!(sync_loop.event_listen_list.len(), 2);
        let mut ids = Vec::new();
        while !sync_loop.event_listen_list.is_empty() {
            let (data, _, remain) = select_all(sync_loop.event_listen_list).await;
            ids.push(data.0);
            sync_loop.event_listen_list = remain;
        }
        assert_eq!(ids, vec![TypeId::of::<Nothing>(), TypeId::of::<Tick>()]);
    }

    #[tokio::test]
    async fn test_run_until_relistens_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let sync_loop = SyncLoop::new(state(dir.path())).register_event(tick_handler);
        sync_loop
            .run_until(sleep(Duration::from_millis(150)))
            .await;
        // handlers are spawned; give the last one a moment.
        sleep(Duration::from_millis(20)).await;
        assert!(TICKS.load(Ordering::SeqCst) >= 3);
    }
}
