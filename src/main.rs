use bucket_fs_cache::{
    cache_handle::CacheHandle,
    cache_manager::CacheManager,
    config::{parse_size, Config},
    http_client::HttpObjectClient,
    logging::LoggerManager,
    object_client::ObjectClient,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    CacheError, Result,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// What to read, taken from the positional and pass arguments
struct ReadJob {
    bucket: String,
    object: String,
    passes: u32,
    block_size: u64,
    output: Option<String>,
}

impl ReadJob {
    fn from_matches(matches: &clap::ArgMatches) -> Result<Self> {
        let required = |name: &str| {
            matches
                .get_one::<String>(name)
                .cloned()
                .ok_or_else(|| CacheError::ConfigError(format!("missing <{}>", name)))
        };

        let passes = matches
            .get_one::<String>("passes")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|e| CacheError::ConfigError(format!("Invalid --passes: {}", e)))?
            .unwrap_or(1)
            .max(1);

        let block_size = matches
            .get_one::<String>("block-size")
            .map(|s| parse_size(s))
            .transpose()
            .map_err(|e| CacheError::ConfigError(format!("Invalid --block-size: {}", e)))?
            .unwrap_or(1 << 20)
            .max(1);

        Ok(Self {
            bucket: required("bucket")?,
            object: required("object")?,
            passes,
            block_size,
            output: matches.get_one::<String>("output").cloned(),
        })
    }
}

/// Read the object `passes` times through one cache handle per pass
async fn read_object(manager: &Arc<CacheManager>, job: &ReadJob) -> Result<()> {
    let (identity, size) = manager.stat(&job.bucket, &job.object).await?;
    info!("Reading {} ({} bytes) in {} pass(es)", identity, size, job.passes);

    let mut output = match &job.output {
        Some(path) => Some(tokio::fs::File::create(path).await?),
        None => None,
    };

    for pass in 0..job.passes {
        let start = Instant::now();
        let mut handle = CacheHandle::open(Arc::clone(manager), identity.clone(), size);

        let mut offset = 0u64;
        while offset < size {
            let bytes = handle.read(offset, job.block_size).await?;
            if bytes.is_empty() {
                break;
            }
            if pass == 0 {
                if let Some(file) = output.as_mut() {
                    file.write_all(&bytes).await?;
                }
            }
            offset += bytes.len() as u64;
        }
        handle.close();

        let elapsed = start.elapsed();
        info!(
            "Pass {} finished: bytes={}, duration_ms={:.2}, throughput_mib_s={:.1}",
            pass + 1,
            offset,
            elapsed.as_secs_f64() * 1000.0,
            offset as f64 / (1 << 20) as f64 / elapsed.as_secs_f64().max(1e-6)
        );
    }

    if let Some(mut file) = output {
        file.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, matches) = Config::load()?;

    let logger = LoggerManager::new(config.logging.clone());
    logger.initialize()?;

    info!(
        "Starting bucket-fs-cache v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let job = ReadJob::from_matches(&matches)?;

    let client: Arc<dyn ObjectClient> = Arc::new(HttpObjectClient::new(&config.object_store)?);
    let manager = CacheManager::new(config.cache.clone(), client).await;

    let mut shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    shutdown_coordinator.set_cache_manager(Arc::clone(&manager));
    let shutdown_coordinator = Arc::new(shutdown_coordinator);
    let mut read_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let signal_coordinator = Arc::clone(&shutdown_coordinator);
    let signal_task = tokio::spawn(async move {
        if let Err(e) = signal_coordinator.listen_for_shutdown().await {
            error!("Shutdown failed: {}", e);
        }
    });

    let result = tokio::select! {
        result = read_object(&manager, &job) => result,
        _ = read_shutdown.wait_for_shutdown() => {
            warn!("Read interrupted by shutdown signal");
            Ok(())
        }
    };

    if read_shutdown.is_shutdown_requested() {
        let _ = signal_task.await;
    } else {
        signal_task.abort();
        shutdown_coordinator.initiate_shutdown().await?;
    }

    if let Err(e) = &result {
        error!("Read failed: {}", e);
    }
    result
}
