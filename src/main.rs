//! Charge point simulator.
//!
//! Connects to a CSMS, boots, and plays a scripted charging session so the
//! whole runtime can be exercised against a real backend. Reads its
//! configuration from a TOML file (~/.config/ocpp-client/config.toml).

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use ocpp_client::model::{ModelSetup, ReadingContext};
use ocpp_client::storage::adapter::SharedFilesystem;
use ocpp_client::{
    default_config_path, AppConfig, BootData, Context, ProtocolVersion, SampledValueSampler,
    SamplerProperties, StdFilesystem, StopReason, WsConnection,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_CLIENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let cfg = match AppConfig::load(&config_path) {
        Ok(cfg) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
                )
                .init();
            info!("configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("failed to load config: {e}. Using defaults.");
            AppConfig::default()
        }
    };

    let (version, subprotocol) = match cfg.backend.protocol.as_str() {
        "ocpp2.0.1" => (ProtocolVersion::V201, "ocpp2.0.1"),
        _ => (ProtocolVersion::V16, "ocpp1.6"),
    };

    info!("starting charge point {} against {}", cfg.backend.charge_point_id, cfg.endpoint());

    // ── Bring-up ───────────────────────────────────────────────
    let filesystem: SharedFilesystem = Rc::new(StdFilesystem::new(&cfg.charger.storage_dir)?);
    let connection = WsConnection::connect(cfg.endpoint(), subprotocol);

    let mut boot_data = BootData::new(&cfg.charger.vendor, &cfg.charger.model);
    if let Some(serial) = &cfg.charger.serial_number {
        boot_data = boot_data.with_serial_number(serial);
    }
    if let Some(fw) = &cfg.charger.firmware_version {
        boot_data = boot_data.with_firmware_version(fw);
    }

    let mut ctx = Context::new(
        Box::new(connection),
        filesystem,
        ModelSetup {
            version,
            connector_count: cfg.charger.connectors,
            boot_data,
        },
    )?;

    // ── Simulated hardware ─────────────────────────────────────
    // A plug that engages shortly after boot and an energy meter that
    // counts while the plug is in.
    let plugged = Rc::new(Cell::new(false));
    let energy_wh = Rc::new(Cell::new(0.0f64));

    {
        let connector = ctx
            .model_mut()
            .connector_mut(1)
            .expect("connector 1 exists");
        let plug = plugged.clone();
        connector.set_connector_plugged_input(Box::new(move || plug.get()));
    }
    {
        let metering = ctx.model_mut().metering_mut(1).expect("metering 1 exists");
        let energy = energy_wh.clone();
        metering.add_sampler(SampledValueSampler::new(
            SamplerProperties::measurand("Energy.Active.Import.Register").with_unit("Wh"),
            Box::new(move |_: ReadingContext| format!("{:.0}", energy.get())),
        ));
    }
    ctx.model_mut().reset.set_execute_reset(Box::new(|kind| {
        info!(?kind, "reset requested by server, exiting");
        std::process::exit(0);
    }));

    // ── Shutdown signal ────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    // ── Main loop ──────────────────────────────────────────────
    let started = Instant::now();
    let mut authorized = false;
    let mut stopped = false;
    loop {
        ctx.poll();

        // ~7.2 kW while the cable is in.
        if plugged.get() {
            energy_wh.set(energy_wh.get() + 0.2);
        }

        // Scripted session: tap the card at 10 s, plug in at 12 s, stop
        // and unplug a minute later.
        let elapsed = started.elapsed().as_secs();
        if ctx.model().boot.is_accepted() {
            if elapsed >= 10 && !authorized {
                authorized = true;
                info!("simulating RFID tap");
                ctx.model_mut().begin_authorization(1, "SIM-TAG-01");
            }
            if elapsed >= 12 && !plugged.get() && !stopped {
                info!("simulating plug-in");
                plugged.set(true);
            }
            if elapsed >= 72 && !stopped {
                stopped = true;
                info!("simulating local stop");
                if let Some(connector) = ctx.model_mut().connector_mut(1) {
                    connector.end_transaction(StopReason::Local, None);
                }
            }
            if elapsed >= 75 && stopped && plugged.get() {
                info!("simulating unplug");
                plugged.set(false);
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            info!("shutting down");
            ctx.model_mut().stop_all_transactions(StopReason::Local);
            for _ in 0..20 {
                ctx.poll();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
