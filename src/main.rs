use hwoverlay::collectors::{NvidiaGpu, SystemCounters, TargetSelector};
use hwoverlay::utils::logger::setup_logger;
use hwoverlay::{SamplerConfig, TelemetryGroup};
use log::{error, info, warn};

#[tokio::main]
async fn main() {
    setup_logger();
    info!("Application started");

    let counters = match SystemCounters::open(TargetSelector::BusiestProcess) {
        Ok(counters) => counters,
        Err(e) => {
            error!("Cannot read system counters: {}", e);
            return;
        }
    };

    let mut group = match TelemetryGroup::create_with_source(counters, SamplerConfig::default()) {
        Ok(group) => group,
        Err(e) => {
            error!("Invalid sampler configuration: {}", e);
            return;
        }
    };
    // Availability is probed once, by start()
    group = group.with_gpu(NvidiaGpu::default());

    if let Err(e) = group.start() {
        error!("Failed to start sampling: {}", e);
        return;
    }

    // Sample for 10 seconds, printing what an overlay would show
    info!("Monitoring for 10 seconds...");
    let refresh = group.refresh_interval();
    let mut elapsed = tokio::time::Duration::ZERO;
    while elapsed < tokio::time::Duration::from_secs(10) {
        tokio::time::sleep(refresh).await;
        elapsed += refresh;

        match group.poll_data() {
            Ok(changes) => {
                for change in changes {
                    info!(
                        "Foreground: {} (pid {:?}, user {})",
                        change.name.as_deref().unwrap_or("<none>"),
                        change.id,
                        change.user.as_deref().unwrap_or("-")
                    );
                }
            }
            Err(e) => warn!("Failed to record history: {}", e),
        }
        println!("{}", group.current_snapshot());
    }

    info!("Shutting down monitoring...");
    if let Err(e) = group.stop().await {
        error!("Sampler did not stop cleanly: {}", e);
    }
    let stats = group.history().stats();
    info!(
        "Recorded {} samples spanning {} ms",
        stats.row_count,
        stats.data_span_ms().unwrap_or(0)
    );
    info!("Program ended successfully.");
}
