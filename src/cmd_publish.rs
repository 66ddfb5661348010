//! `taskr publish`: put a message on a spool queue.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use taskr_config::Config;

use crate::spool::SpoolBroker;

pub(crate) async fn publish(
    config: &Config,
    queue: &str,
    routing_key: Option<&str>,
    data: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let broker = SpoolBroker::from_section(&config.broker)
        .context("broker.spool_dir is not set")?;

    let payload = match (data, file) {
        (Some(data), _) => data,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, None) => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("cannot read message from stdin")?;
            body
        }
    };

    let path = broker.enqueue(queue, routing_key, &payload).await?;
    info!(queue, "Published {} byte(s)", payload.len());
    println!("{}", path.display());
    Ok(())
}
