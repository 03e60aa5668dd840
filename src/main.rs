use panic_alert::config::AppConfig;
use panic_alert::console::ConsoleHost;
use panic_alert::db;
use panic_alert::failover::{EndpointFailover, EndpointRing, HttpTransport};
use panic_alert::geolocation::{FixSettings, GeolocationFix, NoLocation};
use panic_alert::gesture::HoldGesture;
use panic_alert::processor::alert_dispatcher::{AlertDispatcher, DispatchSettings, DispatchState};
use panic_alert::processor::retry_sweep::{ConnectivityEvent, RetrySweep};
use panic_alert::store::{AlertStore, FallbackStore, JsonlAlertStore, SqliteAlertStore};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting panic alert client...");

    // Local durability: SQLite first, JSON lines when SQLite is unusable
    let fallback: Arc<dyn AlertStore> = Arc::new(JsonlAlertStore::new(&config.fallback_path));
    let store: Arc<dyn AlertStore> = match db::init_pool(&config.db_path).await {
        Ok(pool) => {
            info!("Opened alert database at {}", config.db_path);
            Arc::new(FallbackStore::new(
                Arc::new(SqliteAlertStore::new(pool)),
                fallback,
            ))
        }
        Err(e) => {
            warn!("Alert database unavailable ({}), using {}", e, config.fallback_path);
            fallback
        }
    };

    let ring = EndpointRing::new(config.endpoints.clone(), config.sticky_endpoint)
        .ok_or_else(|| anyhow::anyhow!("no alert endpoints configured"))?;
    let failover = Arc::new(EndpointFailover::new(
        ring,
        &config.alert_path,
        config.attempt_timeout(),
        Arc::new(HttpTransport::new()?),
    ));
    let geolocation = Arc::new(GeolocationFix::new(
        Arc::new(NoLocation),
        FixSettings {
            target_accuracy_m: config.location_target_accuracy_m,
            max_samples: config.location_max_samples,
        },
    ));

    let dispatcher = Arc::new(AlertDispatcher::new(
        DispatchSettings {
            location_timeout: config.location_timeout(),
            share_location_default: config.share_location_default,
        },
        store,
        failover,
        geolocation,
    ));

    // Wire the control
    let (gesture, activations) = HoldGesture::new(config.hold_duration());
    let (press_tx, press_rx) = mpsc::channel(32);
    let binding = gesture.bind(press_rx)?;
    let activation_loop = dispatcher.spawn_activation_loop(activations);

    // Retry pending alerts on reconnect and on a timer
    let (connectivity_tx, connectivity_rx) = mpsc::channel(8);
    let sweep = RetrySweep::new(
        dispatcher.clone(),
        config.retry_interval(),
        config.retry_max_backoff(),
    )
    .spawn(connectivity_rx);

    let pending = dispatcher.pending().await.len();
    if pending > 0 {
        info!("{} alert(s) pending from a previous session", pending);
        connectivity_tx
            .send(ConnectivityEvent::Online)
            .await?;
    }

    // Surface every status change to the user
    let mut status = dispatcher.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if !current.text.is_empty() {
                println!("[{:?}] {}", current.state, current.text);
            }
            if current.durability_degraded && current.state == DispatchState::Sending {
                println!("warning: this alert could not be saved on this device");
            }
        }
    });

    let host = ConsoleHost {
        dispatcher: dispatcher.clone(),
        presses: press_tx,
        connectivity: connectivity_tx,
    };
    host.run(BufReader::new(tokio::io::stdin())).await?;

    binding.teardown();
    activation_loop.abort();
    sweep.abort();
    printer.abort();
    info!("Panic alert client stopped");

    Ok(())
}
