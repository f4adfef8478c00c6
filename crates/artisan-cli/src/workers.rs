//! Turning configured workers into live ones.

use artisan_config::{WorkerConfig, WorkerKind};
use artisan_core::{Result, Worker};
use artisan_worker::{LocalWorker, RemoteWorker, SshConfig, SshWorker};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// SSH client settings for a configured `ssh` worker.
pub fn ssh_config(url: &Url, identity: Option<&str>, options: &[String]) -> Result<SshConfig> {
    let mut config = SshConfig::from_url(url)?;
    if let Some(identity) = identity {
        config = config.with_identity_file(identity);
    }
    for option in options {
        config = config.with_option(option.clone());
    }
    Ok(config)
}

/// Connect to the worker a config entry describes.
pub async fn connect(worker: &WorkerConfig) -> Result<Arc<dyn Worker>> {
    info!(worker = %worker.name, "Connecting worker");
    let connected: Arc<dyn Worker> = match &worker.kind {
        WorkerKind::Local => Arc::new(LocalWorker::new()?),
        WorkerKind::Ssh {
            url,
            identity,
            options,
        } => Arc::new(SshWorker::connect(ssh_config(url, identity.as_deref(), options)?).await?),
        WorkerKind::Remote { url } => Arc::new(RemoteWorker::from_url(url).await?),
    };
    Ok(connected)
}
