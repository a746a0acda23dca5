//! Background monitoring jobs
//!
//! Three periodic tasks started by the application registrar when a monitor
//! config is supplied. Each task holds a weak reference and exits once the
//! registrar is gone; dropping the [`MonitorJob`] aborts them.

pub mod telemetry;

use crate::common::utils::notice_time;
use crate::common::MonitorConfig;
use crate::registry::application::{AppInner, ApplicationRegistrar};
use crate::registry::notice::NoticeKind;
use crate::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use telemetry::{StaticProbe, TelemetryProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    TelemetrySync,
    ProtocolLiveness,
    ProviderCount,
}

impl Job {
    async fn run(self, app: &ApplicationRegistrar, config: &MonitorConfig) -> Result<()> {
        match self {
            Job::TelemetrySync => {
                let probe = Arc::clone(&app.inner().probe);
                sync_telemetry(app, probe.as_ref(), config).await
            }
            Job::ProtocolLiveness => {
                check_protocol_servers(app, config.auto_process_service)
                    .await
                    .map(|_| ())
            }
            Job::ProviderCount => check_provider_counts(app, config.providers_threshold)
                .await
                .map(|_| ()),
        }
    }
}

/// Handles of the running monitor tasks
pub struct MonitorJob {
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorJob {
    /// Spawn the periodic tasks on the current Tokio runtime.
    pub(crate) fn start(app: &Arc<AppInner>, config: &MonitorConfig) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::System(format!("monitor jobs need a Tokio runtime: {}", e)))?;
        let schedule = config.schedule()?;
        let weak = Arc::downgrade(app);

        let tasks = [
            (Job::TelemetrySync, schedule.sync),
            (Job::ProtocolLiveness, schedule.service),
            (Job::ProviderCount, schedule.provider),
        ]
        .into_iter()
        .map(|(job, timing)| handle.spawn(periodic(job, timing, weak.clone(), config.clone())))
        .collect();

        tracing::info!("Monitor jobs started");
        Ok(Self { tasks })
    }
}

impl Drop for MonitorJob {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn periodic(
    job: Job,
    (delay, period): (Duration, Duration),
    app: Weak<AppInner>,
    config: MonitorConfig,
) {
    tokio::time::sleep(delay).await;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = app.upgrade() else {
            break;
        };
        let registrar = ApplicationRegistrar::from_inner(inner);
        if let Err(e) = job.run(&registrar, &config).await {
            tracing::warn!(job = ?job, "Monitor job failed: {}", e);
        }
    }
}

/// Sample host usage, write it into every provider payload, and alert when a
/// threshold is reached.
pub async fn sync_telemetry(
    app: &ApplicationRegistrar,
    probe: &dyn TelemetryProbe,
    config: &MonitorConfig,
) -> Result<()> {
    let stats = probe.sample().await?;
    for provider in app.providers() {
        provider.apply_telemetry(stats).await;
        provider.sync_payloads().await?;
        let snapshot = provider.snapshot().await;
        app.context().sync(&snapshot, "system").await;
    }

    let exceeded = stats.cpu_usage >= config.cpu_threshold
        || stats.mem_usage >= config.mem_threshold
        || stats.disk_usage >= config.disk_threshold;
    if exceeded && config.alert_on_resource {
        let ctx = app.context();
        let message = format!(
            "[{}] application [{}] host [{}] cpu [{:.2}] mem [{:.2}] disk [{:.2}] reached threshold",
            notice_time(),
            ctx.descriptor().name,
            ctx.host(),
            stats.cpu_usage,
            stats.mem_usage,
            stats.disk_usage
        );
        ctx.notify(NoticeKind::InsufficientResource, "", &message).await;
    }
    Ok(())
}

/// Find registered providers whose protocol server is down. Returns how many.
///
/// With `auto_process` the server is revived before the owners are told.
pub async fn check_protocol_servers(app: &ApplicationRegistrar, auto_process: bool) -> Result<usize> {
    let mut abnormal = 0;
    for provider in app.providers() {
        if !provider.is_registered() || provider.is_serving() {
            continue;
        }
        abnormal += 1;
        tracing::warn!(
            protocol = %provider.protocol(),
            port = provider.port(),
            "Protocol server is not serving"
        );

        let ctx = app.context();
        let outcome = if auto_process {
            match provider.revive("system").await {
                Ok(()) => "was restarted automatically".to_string(),
                Err(e) => format!("failed to restart: {}", e),
            }
        } else {
            "needs attention".to_string()
        };
        let message = format!(
            "[{}] application [{}] protocol server [{}:{}] is not serving and {}",
            notice_time(),
            ctx.descriptor().name,
            ctx.host(),
            provider.port(),
            outcome
        );
        ctx.notify(NoticeKind::ProtocolServiceAbnormal, provider.protocol(), &message)
            .await;
    }
    Ok(abnormal)
}

/// Count online providers of every ENABLED service and alert below `threshold`.
/// Returns the number of services under the threshold.
pub async fn check_provider_counts(app: &ApplicationRegistrar, threshold: usize) -> Result<usize> {
    let ctx = app.context();
    let mut short = 0;
    for provider in app.providers() {
        for svc in provider.services().await.iter().filter(|s| s.is_enabled()) {
            let path = provider.providers_path(svc);
            let online = match ctx.client().children(&path).await {
                Ok(children) => children.len(),
                Err(Error::NoNode(_)) => 0,
                Err(e) => return Err(e),
            };
            if online >= threshold {
                continue;
            }
            short += 1;
            let message = format!(
                "[{}] application [{}] service [{}] has {} providers online, expected at least {}",
                notice_time(),
                ctx.descriptor().name,
                svc.key(),
                online,
                threshold
            );
            ctx.notify(NoticeKind::ProviderAbnormal, provider.protocol(), &message)
                .await;
        }
    }
    Ok(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ApplicationConfig;
    use crate::coord::{CoordinationClient, MemoryTree};
    use crate::registry::descriptor::ServiceDescriptor;
    use crate::registry::notice::NoticeSink;
    use crate::registry::provider::ProviderRegistrar;
    use crate::transport::loopback::{LoopbackNetwork, LoopbackServer, ServiceImpl};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NoticeSink for RecordingSink {
        async fn notify(&self, _owners: &[String], title: &str, _message: &str) -> Result<()> {
            self.titles.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    async fn setup(
        sink: Arc<RecordingSink>,
    ) -> (ApplicationRegistrar, ProviderRegistrar, Arc<LoopbackNetwork>) {
        let tree = MemoryTree::new();
        let network = LoopbackNetwork::new();
        let app = ApplicationRegistrar::builder(ApplicationConfig::new("orders", "trade", "alice", "test"))
            .client(Arc::new(tree.session()))
            .host("10.0.0.1")
            .notice_sink(sink)
            .build()
            .unwrap();
        let server = Arc::new(
            LoopbackServer::new(Arc::clone(&network)).implement("Echo", ServiceImpl::new()),
        );
        let provider = ProviderRegistrar::new(
            &app,
            "loopback",
            9100,
            server,
            vec![ServiceDescriptor::new("loopback", "Echo", "1.0", 9100)],
        )
        .unwrap();
        provider.register().await.unwrap();
        (app, provider, network)
    }

    #[tokio::test]
    async fn test_sync_telemetry_updates_payload_and_alerts() {
        let sink = Arc::new(RecordingSink::default());
        let (app, provider, _network) = setup(sink.clone()).await;

        let probe = StaticProbe::new(0.99, 0.10, 0.10);
        sync_telemetry(&app, &probe, &MonitorConfig::default()).await.unwrap();

        let svc = provider.services().await.remove(0);
        let path = format!("{}/{}", provider.providers_path(&svc), svc.node());
        let stored: ServiceDescriptor =
            serde_json::from_slice(&app.client().get_data(&path).await.unwrap()).unwrap();
        assert_eq!(stored.stats.cpu_usage, 0.99);
        assert!(stored.stats.processors >= 1);
        assert_eq!(
            sink.titles.lock().unwrap().as_slice(),
            ["Insufficient resource notice"]
        );
    }

    #[tokio::test]
    async fn test_dead_server_is_revived_when_auto_processing() {
        let sink = Arc::new(RecordingSink::default());
        let (app, provider, network) = setup(sink.clone()).await;

        assert_eq!(check_protocol_servers(&app, true).await.unwrap(), 0);
        network.take_down("10.0.0.1:9100");
        assert!(!provider.is_serving());

        assert_eq!(check_protocol_servers(&app, true).await.unwrap(), 1);
        assert!(provider.is_serving());
        assert!(sink
            .titles
            .lock()
            .unwrap()
            .contains(&"Protocol[loopback] Service of provider abnormal notice".to_string()));
    }

    #[tokio::test]
    async fn test_dead_server_only_reported_without_auto_processing() {
        let sink = Arc::new(RecordingSink::default());
        let (app, provider, network) = setup(sink.clone()).await;
        network.take_down("10.0.0.1:9100");

        assert_eq!(check_protocol_servers(&app, false).await.unwrap(), 1);
        assert!(!provider.is_serving());
    }

    #[tokio::test]
    async fn test_provider_count_below_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let (app, _provider, _network) = setup(sink.clone()).await;

        assert_eq!(check_provider_counts(&app, 1).await.unwrap(), 0);
        assert_eq!(check_provider_counts(&app, 2).await.unwrap(), 1);
        assert_eq!(
            sink.titles.lock().unwrap().as_slice(),
            ["Provider abnormal notice"]
        );
    }
}
