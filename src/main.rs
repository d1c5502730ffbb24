//! camerad: capture, convert to NV12 and fan out to logical camera streams

use std::path::PathBuf;
use std::time::Duration;

use camerad::distribute::RingDistributor;
use camerad::messaging::MessageBus;
use camerad::{CancelToken, CapturePipeline, Config};
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("camerad launching...");

    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("CAMERAD_CONFIG"))
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(
        "Capture {:?} {} {}x{} @ {} Hz",
        config.capture.source,
        config.capture.device,
        config.capture.width,
        config.capture.height,
        config.pipeline.target_rate_hz
    );

    let distributor = RingDistributor::new();
    let bus = MessageBus::new(config.topics(), config.bus.subscriber_capacity);
    let cancel = CancelToken::new();

    // Everything touching the device or the GPU lives on one blocking thread
    let mut worker = {
        let config = config.clone();
        let distributor = distributor.clone();
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            pin_to_core(config.pipeline.cpu_core);
            let mut pipeline = CapturePipeline::from_config(&config, distributor, bus)?;
            pipeline.run_forever(&cancel)
        })
    };

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.tick().await;

    let stats = loop {
        tokio::select! {
            res = &mut worker => break res?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping capture loop");
                cancel.cancel();
                break (&mut worker).await?;
            }
            _ = report.tick() => {
                for key in distributor.streams() {
                    if let Ok(s) = distributor.stats(&key) {
                        info!(
                            "{}: {} frames, {} evicted, {} readers",
                            key, s.frames_written, s.frames_evicted, s.readers
                        );
                    }
                }
                if bus.dropped() > 0 {
                    warn!("Metadata bus dropped {} messages", bus.dropped());
                }
            }
        }
    };

    let stats = stats?;
    info!(
        "camerad shutting down: {} frames published, {} skipped, {} lagged ticks",
        stats.frames_published, stats.frames_skipped, stats.lagged_ticks
    );
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camerad=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_timer(fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::uptime())
        .init();
}

fn pin_to_core(core: Option<usize>) {
    let Some(id) = core else {
        return;
    };
    let target =
        core_affinity::get_core_ids().and_then(|ids| ids.into_iter().find(|c| c.id == id));
    match target {
        Some(core) if core_affinity::set_for_current(core) => {
            info!("Capture thread pinned to core {}", id)
        }
        _ => warn!("Could not pin capture thread to core {}", id),
    }
}
