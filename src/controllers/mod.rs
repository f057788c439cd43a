use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::{Recorder, Reporter};
use serde::Serialize;
use tokio::{sync::RwLock, time::Duration};
use tracing::warn;

use crate::config::OperatorConfig;
use crate::util::errors::Error;
use crate::util::metrics::Metrics;

pub mod backup_controller;
pub mod bsl_controller;
pub mod download_request_controller;
pub mod handlers;
pub mod restore_controller;

/// State shared between the controllers and the web server. One metrics
/// family serves all four controllers, keyed by the `controller` label.
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry,
            metrics,
        }
    }
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, config: Arc<OperatorConfig>) -> Arc<Context> {
        Arc::new(Context {
            client,
            config,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator namespace and admin-enforced specs
    pub config: Arc<OperatorConfig>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "oadp-nac-controller".into(),
        }
    }
}

impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Outcome of one reconciliation step. Errors abort the pass through `?`;
/// `Requeue` aborts it with an immediate re-enqueue; `Continue` hands over
/// to the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Requeue,
}

/// Runs an ordered sequence of reconciliation steps, short-circuiting on the
/// first step that errors or asks for a requeue.
macro_rules! run_steps {
    ($($step:expr),+ $(,)?) => {
        $(
            if matches!($step.await?, $crate::controllers::Step::Requeue) {
                return Ok(kube::runtime::controller::Action::requeue(
                    std::time::Duration::from_secs(1),
                ));
            }
        )+
    };
}
pub(crate) use run_steps;

/// Shared error policy: terminal errors park the object until it changes,
/// anything else is retried with backoff.
pub(crate) fn error_action(controller: &str, error: &Error, ctx: &Context) -> Action {
    ctx.metrics.reconcile_failure(controller, error);
    if error.is_terminal() {
        warn!("{controller} reconcile hit terminal error, awaiting object change: {error}");
        Action::await_change()
    } else {
        warn!("{controller} reconcile failed: {error:?}");
        Action::requeue(Duration::from_secs(30))
    }
}
