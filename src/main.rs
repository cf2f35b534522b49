use std::sync::Arc;

use slotrader::XapiError;
use slotrader::config::fetch_config;
use slotrader::credentials;
use slotrader::signal::config::SignalConfig;
use slotrader::slot::{SlotScheduler, build_slots};
use slotrader::store::{JsonLinesStore, TradeStore};
use slotrader::tls::build_tls_config;
use slotrader::xapi::{BrokerConnector, Connector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), XapiError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().nth(1).as_deref() == Some("store-credentials") {
        return store_credentials();
    }

    credentials::load_into_env();
    let app_config = fetch_config()?;

    let signal_config = match &app_config.signal_config {
        Some(path) => SignalConfig::load(path)?,
        None => SignalConfig::default(),
    };
    info!("{}", signal_config.describe());

    let tls_config = Arc::new(build_tls_config(app_config.xapi.ca_pem.as_deref())?);
    let connector: Arc<dyn Connector> = Arc::new(BrokerConnector::new(&app_config.xapi, tls_config));
    let store: Arc<dyn TradeStore> = Arc::new(JsonLinesStore::new(app_config.trades_log.clone()));

    let scheduler = SlotScheduler::new(build_slots(&app_config, &signal_config, &connector, &store));
    info!(
        host = %app_config.xapi.host,
        slots = scheduler.len(),
        trades_log = %app_config.trades_log.display(),
        "Starting trader"
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping slots");
                ctrl_c.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    if let Err(e) = scheduler.run(shutdown).await {
        error!(error = %e, "Trader stopped on a fatal error");
        return Err(e);
    }
    info!("Trader stopped");
    Ok(())
}

/// Copies `XAPI_LOGIN` and `XAPI_PASSWORD` from the environment into the
/// OS keychain.
fn store_credentials() -> Result<(), XapiError> {
    for var in credentials::ACCOUNT_VARS {
        let value = std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| XapiError::Config(format!("{var} is not set")))?;
        credentials::store(var, &value)?;
        info!(var, "Credential stored in keychain");
    }
    Ok(())
}
