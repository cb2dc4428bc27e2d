//! ztpd - Main entry point
//!
//! Runs a single discovery pass from the command line, or serves the
//! discovery API over HTTP.

mod api;
mod config;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use ztp_core::{Binding, BindingStore, DiscoveryEntry};
use ztp_discovery::ProvisionToggles;

#[derive(Parser, Debug)]
#[command(name = "ztpd")]
#[command(about = "Zero-touch provisioning discovery and reconciliation daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ztpd/ztpd.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single discovery pass and exit
    #[arg(long)]
    scan_once: bool,

    /// Range for --scan-once (defaults to the configured range)
    #[arg(long, requires = "scan_once")]
    range: Option<String>,

    /// Do not push base configuration files
    #[arg(long)]
    no_push_config: bool,

    /// Do not disable the ZTP agent
    #[arg(long)]
    no_disable_ztp: bool,

    /// Do not set hostnames
    #[arg(long)]
    no_set_hostname: bool,

    /// Print the cached pass and exit
    #[arg(long, conflicts_with = "scan_once")]
    show_cache: bool,

    /// Print the binding store with inventory status and exit
    #[arg(long, conflicts_with_all = ["scan_once", "show_cache"])]
    list_bindings: bool,
}

impl Args {
    fn toggles(&self, defaults: ProvisionToggles) -> ProvisionToggles {
        ProvisionToggles {
            push_config: defaults.push_config && !self.no_push_config,
            disable_ztp: defaults.disable_ztp && !self.no_disable_ztp,
            set_hostname: defaults.set_hostname && !self.no_set_hostname,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("ztpd v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = &args.bind {
        config.daemon.bind = bind.clone();
    }

    info!(
        range = %config.discovery.range,
        bindings = %config.stores.bindings.display(),
        cache = %config.cache.path.display(),
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone())?;

    if args.list_bindings {
        let store = BindingStore::load(&config.stores.bindings)?;
        println!("{} bindings in {}", store.len(), config.stores.bindings.display());
        println!(
            "  {:<16} {:<20} {:<18} {:<10} {}",
            "ADDRESS", "HOSTNAME", "MAC", "ROLE", "STATUS"
        );
        for binding in store.iter() {
            println!("{}", binding_row(binding));
        }
    } else if args.show_cache {
        let snapshot = state.scanner.read_cache()?;
        println!(
            "Range {} ({} entries{})",
            snapshot.cache.range,
            snapshot.cache.entries.len(),
            if snapshot.stale { ", stale" } else { "" }
        );
        print_entries(&snapshot.cache.entries);
    } else if args.scan_once {
        let range = args
            .range
            .clone()
            .unwrap_or_else(|| config.discovery.range.clone());
        let toggles = args.toggles(config.provision.toggles);

        info!(range = %range, "Running single discovery pass");
        let outcome = state.scanner.run_discovery(&range, toggles).await?;
        if let Some(err) = &outcome.cache_error {
            warn!(error = %err, "Discovery pass not persisted");
        }
        println!("Scanned {} addresses:", outcome.cache.entries.len());
        print_entries(&outcome.cache.entries);
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}

fn print_entries(entries: &[DiscoveryEntry]) {
    println!(
        "  {:<16} {:<20} {:<18} {:<16} {:<13} {:<16} {}",
        "ADDRESS", "HOSTNAME", "MAC", "CLASS", "MAC CHECK", "SERIAL", "POST-PROVISION"
    );
    for entry in entries {
        println!(
            "  {:<16} {:<20} {:<18} {:<16} {:<13} {:<16} {}",
            entry.ip(),
            entry.hostname().unwrap_or("-"),
            entry.observed_mac().unwrap_or("-"),
            label(&entry.class()),
            label(&entry.mac_verdict()),
            entry.serial().unwrap_or("-"),
            entry
                .post_provision()
                .map(|p| label(&p))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

fn binding_row(binding: &Binding) -> String {
    format!(
        "  {:<16} {:<20} {:<18} {:<10} {}",
        binding.ip,
        binding.hostname,
        binding.normalized_mac(),
        binding.role.as_deref().unwrap_or("-"),
        label(&binding.status()),
    )
}

/// Wire name of a serde enum value
fn label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ztp_core::{DeviceClass, MacVerdict};

    #[test]
    fn test_toggle_flags() {
        let args = Args::parse_from(["ztpd", "--scan-once", "--no-disable-ztp"]);
        let toggles = args.toggles(ProvisionToggles::default());
        assert!(toggles.push_config);
        assert!(!toggles.disable_ztp);
        assert!(toggles.set_hostname);

        // Flags only switch steps off
        let defaults = ProvisionToggles {
            push_config: false,
            ..Default::default()
        };
        assert!(!Args::parse_from(["ztpd"]).toggles(defaults).push_config);
    }

    #[test]
    fn test_range_requires_scan_once() {
        assert!(Args::try_parse_from(["ztpd", "--range", "10.0.0.1"]).is_err());
        assert!(Args::try_parse_from(["ztpd", "--show-cache", "--scan-once"]).is_err());
    }

    #[test]
    fn test_binding_row_shows_status() {
        let planned = Binding::planned("leaf09", std::net::Ipv4Addr::new(10, 0, 0, 9));
        assert!(binding_row(&planned).trim_end().ends_with("planned"));

        let mut active = planned.clone();
        active.mac = "AA:BB:CC:00:00:09".into();
        active.dhcp = true;
        let row = binding_row(&active);
        assert!(row.contains("aa:bb:cc:00:00:09"));
        assert!(row.trim_end().ends_with("active"));

        active.dhcp = false;
        assert!(binding_row(&active).trim_end().ends_with("discovered"));
        assert!(Args::try_parse_from(["ztpd", "--list-bindings", "--show-cache"]).is_err());
    }

    #[test]
    fn test_label() {
        assert_eq!(label(&DeviceClass::NotProvisioned), "not_provisioned");
        assert_eq!(label(&MacVerdict::NoBinding), "no_binding");
    }
}
