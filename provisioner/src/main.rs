//! Fleet Provisioner - Entry Point
//!
//! Provisions messaging-bot gateway instances onto container backends and
//! reports step-by-step progress over HTTP.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use fleet_provisioner::app::options::AppOptions;
use fleet_provisioner::app::run::run;
use fleet_provisioner::logs::{init_logging, LogOptions};
use fleet_provisioner::models::instance::{InstanceStore, MemoryInstanceStore};
use fleet_provisioner::providers::{create_provider, ProviderKind};
use fleet_provisioner::provisioning::catalog::all_catalogs;
use fleet_provisioner::settings::{Settings, DEFAULT_SETTINGS_PATH};
use fleet_provisioner::targets::{SettingsTargetFactory, TargetFactory};
use fleet_provisioner::utils::build_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        print_json(&build_info());
        return;
    }

    // Print the step catalogs and exit
    if cli_args.contains_key("catalog") {
        print_json(&all_catalogs());
        return;
    }

    // Retrieve the settings file
    let settings_path = cli_args
        .get("settings")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
    let settings = match Settings::load(&settings_path).await {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("Unable to read settings file {}: {}", settings_path.display(), e);
            return;
        }
    };

    // Initialize logging
    let log_options = LogOptions::from(settings.as_ref());
    let _log_guard = match init_logging(&log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Validate provider configuration and exit
    if cli_args.contains_key("validate") {
        return validate_providers(&settings).await;
    }

    // Load the instance records
    let store = match &settings.instances_file {
        Some(path) => match MemoryInstanceStore::load_json(path).await {
            Ok(store) => store,
            Err(e) => {
                error!("Unable to load instances from {}: {}", path.display(), e);
                return;
            }
        },
        None => MemoryInstanceStore::new(),
    };
    info!("Loaded {} instance record(s)", store.len());
    let store: Arc<dyn InstanceStore> = Arc::new(store);
    let factory: Arc<dyn TargetFactory> = Arc::new(SettingsTargetFactory::new(settings.clone()));

    // Run the provisioner
    let options = AppOptions::from(settings.as_ref());
    info!("Running fleet provisioner with options: {:?}", options);
    let result = run(options, store, factory, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the fleet provisioner: {e}");
    }
}

async fn validate_providers(settings: &Settings) {
    let mut results = serde_json::Map::new();
    for kind in ProviderKind::ALL {
        let result = match create_provider(kind, settings) {
            Ok(provider) => serde_json::to_value(provider.validate().await),
            Err(e) => Ok(serde_json::json!({ "valid": false, "errors": [e.to_string()] })),
        };
        match result {
            Ok(value) => {
                results.insert(kind.to_string(), value);
            }
            Err(e) => error!("Unable to serialize validation for {}: {}", kind, e),
        }
    }
    print_json(&results);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Unable to serialize output: {}", e),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
