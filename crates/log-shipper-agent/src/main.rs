// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_shipper::{
    classifier::{classification_hook, Classifier, NaiveBayesClassifier},
    config::AgentConfig,
    errors::ShipperError,
    transport::{submit::HttpSubmitter, Transport},
};

const DEFAULT_CONFIG_PATH: &str = "./config.json";
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);
const CLASSIFIER_BACKUP_INTERVAL: Duration = Duration::from_secs(60);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_SHIPPER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config_path = env::var("LOG_SHIPPER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let classifier: Option<Arc<NaiveBayesClassifier>> =
        match env::var("LOG_SHIPPER_CLASSIFIER_MODEL") {
            Ok(path) => match NaiveBayesClassifier::open(&path) {
                Ok(c) => {
                    info!("Using classifier model {}", path);
                    Some(Arc::new(c))
                }
                Err(e) => {
                    error!("Failed to load classifier model {path}: {e}. Using keywords only.");
                    None
                }
            },
            Err(_) => None,
        };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    if let Some(classifier) = classifier.clone() {
        tokio::spawn(backup_periodically(classifier, shutdown.clone()));
    }

    loop {
        match run_pipeline(&config_path, classifier.clone(), &shutdown).await {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => warn!("Pipeline stopped unexpectedly"),
            Err(e) => error!("Pipeline failed: {e}"),
        }
        info!("Restarting in {:?}", RESTART_COOLDOWN);
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(RESTART_COOLDOWN) => {}
        }
    }

    if let Some(classifier) = classifier {
        if let Err(e) = classifier.backup() {
            error!("Failed to save classifier model: {e}");
        }
    }
    info!("Log shipper stopped");
}

async fn run_pipeline(
    config_path: &Path,
    classifier: Option<Arc<NaiveBayesClassifier>>,
    shutdown: &CancellationToken,
) -> Result<(), ShipperError> {
    let config = AgentConfig::from_file(config_path)?;
    let submitter = HttpSubmitter::new(format!("http://{}", config.target_addr()), SUBMIT_TIMEOUT)?;
    let codec = config.codec.compressor(config.compression_level)?;
    let hook = classifier.map(|c| classification_hook(c as Arc<dyn Classifier>));

    let mut transport = Transport::new(&config, Arc::new(submitter), codec, hook)?;
    info!(
        "Shipping {} files to {} ({} compressed)",
        transport.config().files.len(),
        config.target_addr(),
        config.codec
    );

    let handle = transport.handle();
    let shutdown = shutdown.clone();
    let stopper = tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.close();
    });

    let result = transport.run().await;
    stopper.abort();
    result
}

/// The agent only reads the model; it is trained offline against the same
/// model file. Saves are skipped while nothing was learned.
async fn backup_periodically(classifier: Arc<NaiveBayesClassifier>, shutdown: CancellationToken) {
    let mut backup_interval = interval(CLASSIFIER_BACKUP_INTERVAL);
    backup_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = backup_interval.tick() => {
                debug!("Saving classifier model");
                if let Err(e) = classifier.backup() {
                    error!("Failed to save classifier model: {e}");
                }
            }
        }
    }
}
