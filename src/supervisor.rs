//! Starts one sink task per topic binding and tears everything down on shutdown
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::{
    datasource::DatasourceRegistry,
    error::Result,
    model::ModelRegistry,
    settings::TopicBinding,
    sink::{Claim, SinkHandler},
};

async fn prepare(
    binding: &TopicBinding,
    models: &ModelRegistry,
    datasources: &DatasourceRegistry,
) -> Result<SinkHandler> {
    let model = models.lookup(&binding.model_table)?;
    let writer = datasources.writer(&binding.datasource).await?;
    Ok(SinkHandler::new(binding.clone(), model, writer))
}

/// Runs every binding until `shutdown` is cancelled, then closes the writers.
///
/// Bindings whose model, datasource or consumer cannot be set up are logged
/// and skipped. Returns the number of sinks that were started.
pub async fn run<C, F>(
    bindings: Vec<TopicBinding>,
    models: Arc<ModelRegistry>,
    datasources: Arc<DatasourceRegistry>,
    shutdown: CancellationToken,
    open_claim: F,
) -> usize
where
    C: Claim + 'static,
    F: Fn(&TopicBinding) -> Result<C>,
{
    let mut sinks = JoinSet::new();
    for binding in bindings {
        let group = binding.group_id();
        let mut handler = match prepare(&binding, &models, &datasources).await {
            Ok(h) => h,
            Err(e) => {
                error!(topic = %binding.topic, group = %group, "skipping sinker: {e}");
                continue;
            }
        };
        let mut claim = match open_claim(&binding) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    topic = %binding.topic,
                    group = %group,
                    "skipping sinker, cannot join group: {e}"
                );
                continue;
            }
        };

        let span = info_span!("sink", topic = %binding.topic, group = %group);
        let shutdown = shutdown.clone();
        sinks.spawn(
            async move {
                handler.run(&mut claim, &shutdown).await;
                claim.close();
            }
            .instrument(span),
        );
    }

    let started = sinks.len();
    info!(sinkers = started, "sinkers started");
    while let Some(res) = sinks.join_next().await {
        if let Err(e) = res {
            error!("sink task failed: {e}");
        }
    }
    datasources.close_all().await;
    info!("all sinkers stopped");
    started
}
