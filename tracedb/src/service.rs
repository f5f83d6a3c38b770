//! Subservice lifecycle management.
//!
//! Every long-running piece (poller, ingester loops, compactor, HTTP
//! listener) runs as a [`Service`]: an explicit state machine
//! `New → Starting → Running → Stopping → Terminated` with `Failed` as
//! the absorbing error state. The [`ServiceManager`] starts services in
//! dependency order, stops them in reverse, and fails the whole process
//! when any service dies unexpectedly.

use observability_deps::tracing::{error, info};
use std::{fmt, future::Future, sync::Arc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle states of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One managed subservice.
pub struct Service {
    name: &'static str,
    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    shutdown: CancellationToken,
    handle: Option<tokio::task::JoinHandle<Result<(), String>>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl Service {
    /// Declare a service; nothing runs until [`Self::start`].
    pub fn new(name: &'static str) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::New);
        Self {
            name,
            state_tx,
            state_rx,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// The service name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// A watcher for state transitions.
    pub fn watch(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ServiceState) {
        info!(service = self.name, state = %state, "service state");
        let _ = self.state_tx.send(state);
    }

    /// Spawn the service body. The body runs until it returns (clean:
    /// `Ok`, failed: `Err`) or until the passed token is cancelled.
    pub fn start<F, Fut>(&mut self, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        assert!(self.handle.is_none(), "service started twice");
        self.set_state(ServiceState::Starting);
        let fut = body(self.shutdown.clone());
        self.handle = Some(tokio::spawn(fut));
        self.set_state(ServiceState::Running);
    }

    /// Request shutdown and wait for the body to return.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            // already finished (and its final state recorded), or never
            // started
            if self.state() == ServiceState::New {
                self.set_state(ServiceState::Terminated);
            }
            return;
        };
        self.set_state(ServiceState::Stopping);
        self.shutdown.cancel();
        match handle.await {
            Ok(Ok(())) => self.set_state(ServiceState::Terminated),
            Ok(Err(e)) => {
                error!(service = self.name, error = %e, "service failed during shutdown");
                self.set_state(ServiceState::Failed);
            }
            Err(join_error) => {
                error!(service = self.name, error = %join_error, "service panicked");
                self.set_state(ServiceState::Failed);
            }
        }
    }

    /// Wait for the running body to finish on its own, recording the
    /// final state. Cancel-safe: dropping the future leaves the service
    /// stoppable.
    async fn join(&mut self) -> Result<(), String> {
        let result = match self.handle.as_mut() {
            None => return Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(format!("panic: {join_error}")),
            },
        };
        self.handle = None;
        match &result {
            Ok(()) => self.set_state(ServiceState::Terminated),
            Err(_) => self.set_state(ServiceState::Failed),
        }
        result
    }
}

/// Starts services in order, watches for failures, stops in reverse.
#[derive(Debug, Default)]
pub struct ServiceManager {
    services: Vec<Service>,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl ServiceManager {
    /// An empty manager.
    pub fn new() -> Self {
        Default::default()
    }

    /// The readiness flag served by the HTTP listener: true once every
    /// service reached `Running`.
    pub fn ready_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Add and immediately start a service (dependency order = call
    /// order).
    pub fn start_service<F, Fut>(&mut self, name: &'static str, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut service = Service::new(name);
        service.start(body);
        self.services.push(service);
    }

    /// Mark startup complete; `/ready` turns 200.
    pub fn mark_ready(&self) {
        self.ready
            .store(true, std::sync::atomic::Ordering::SeqCst);
        info!("all services running");
    }

    /// Run until a shutdown signal or the first service failure. Returns
    /// `Err` with the failing service's name when one died.
    pub async fn wait(&mut self, shutdown_signal: impl Future<Output = ()>) -> Result<(), String> {
        let failure = {
            let watchers: Vec<(&'static str, _)> = self
                .services
                .iter_mut()
                .map(|s| (s.name, s.join()))
                .collect();

            let any_failure = async {
                if watchers.is_empty() {
                    std::future::pending::<(&'static str, Result<(), String>)>().await
                } else {
                    let futures = watchers
                        .into_iter()
                        .map(|(name, join)| {
                            Box::pin(async move { (name, join.await) })
                                as std::pin::Pin<
                                    Box<
                                        dyn Future<Output = (&'static str, Result<(), String>)>
                                            + Send
                                            + '_,
                                    >,
                                >
                        })
                        .collect::<Vec<_>>();
                    let ((name, result), _, _) = futures::future::select_all(futures).await;
                    (name, result)
                }
            };

            tokio::select! {
                _ = shutdown_signal => None,
                (name, result) = any_failure => Some((name, result)),
            }
        };

        self.ready
            .store(false, std::sync::atomic::Ordering::SeqCst);

        match failure {
            None => {
                info!("shutdown signal received");
                self.stop_all().await;
                Ok(())
            }
            Some((name, result)) => {
                let reason = match result {
                    Ok(()) => format!("service {name} exited unexpectedly"),
                    Err(e) => format!("service {name} failed: {e}"),
                };
                error!(reason = %reason, "stopping all services");
                self.stop_all().await;
                Err(reason)
            }
        }
    }

    /// Stop every service in reverse start order.
    pub async fn stop_all(&mut self) {
        for service in self.services.iter_mut().rev() {
            service.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clean_shutdown_stops_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut manager = ServiceManager::new();
        for name in ["first", "second"] {
            let order = Arc::clone(&order);
            manager.start_service(name, move |shutdown| async move {
                shutdown.cancelled().await;
                order.lock().push(name);
                Ok(())
            });
        }
        manager.mark_ready();
        assert!(manager.ready_flag().load(std::sync::atomic::Ordering::SeqCst));

        manager.wait(async {}).await.unwrap();
        assert_eq!(*order.lock(), vec!["second", "first"]);
        assert!(!manager.ready_flag().load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn service_failure_fails_the_manager() {
        let mut manager = ServiceManager::new();
        manager.start_service("steady", |shutdown| async move {
            shutdown.cancelled().await;
            Ok(())
        });
        manager.start_service("flaky", |_shutdown| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err("boom".to_string())
        });
        manager.mark_ready();

        let err = manager
            .wait(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.contains("flaky"));
        assert!(err.contains("boom"));
    }

    #[tokio::test]
    async fn unexpected_clean_exit_also_fails() {
        let mut manager = ServiceManager::new();
        manager.start_service("short-lived", |_shutdown| async move { Ok(()) });

        let err = manager
            .wait(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.contains("exited unexpectedly"));
    }

    #[test]
    fn state_names() {
        assert_eq!(ServiceState::Running.to_string(), "RUNNING");
        assert_eq!(ServiceState::Terminated.to_string(), "TERMINATED");
    }
}
