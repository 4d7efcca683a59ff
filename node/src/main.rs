use std::{error::Error, path::PathBuf, time::Duration};

use decay_core::{
    config::{Config, Profile},
    record::RecordLayout,
};
use decay_node::{
    clock::{ClockResolver, SntpTimeSource, SystemTimeSource, TimeSource},
    peripherals::DischargeRig,
    sampler::Sampler,
    session::{Pipeline, PullDriver, PushDriver},
    store::DurableStore,
    telemetry::{MqttSession, StreamPublisher},
    upload::UploadClient,
};
use tokio::net::TcpListener;

// Roughly what the bench capacitor does: a few ms to drain, a little ADC noise
const RIG_RC_SECS: f64 = 0.002;
const RIG_NOISE_CODES: u16 = 4;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();

    let config_path = std::env::var_os("DECAY_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    if !config.network.ssid.is_empty() {
        log::info!("Link layer configured for network '{}'", config.network.ssid);
    }

    let acquisition = &config.acquisition;
    let scale = acquisition.scale()?;
    let (input, excitation) =
        DischargeRig::new(scale.resolution(), RIG_RC_SECS, RIG_NOISE_CODES).split();
    let sampler = Sampler::new(
        input,
        excitation,
        Duration::from_millis(acquisition.settle_time_ms),
        acquisition.sample_count,
    );

    let store = DurableStore::mount(&config.storage);

    let time_source: Box<dyn TimeSource> = match &config.clock.time_server {
        Some(server) => {
            log::info!("Using network time from {server}");
            Box::new(SntpTimeSource::new(
                server.as_str(),
                Duration::from_millis(config.clock.time_server_timeout_ms),
            ))
        }
        None => Box::new(SystemTimeSource),
    };

    match config.delivery.profile {
        Profile::Pull => {
            let clock = ClockResolver::new(time_source, config.clock.utc_offset_hours)?;
            let pipeline = Pipeline::new(sampler, scale, RecordLayout::Csv, Some(clock), store);
            let mut driver = PullDriver::new(
                pipeline,
                UploadClient::new(&config.upload),
                config.upload.command_token.as_str(),
                Duration::from_millis(config.upload.request_timeout_ms),
            );

            let listener = TcpListener::bind(("0.0.0.0", config.upload.listen_port)).await?;
            driver.serve(listener).await;
        }
        Profile::Push => {
            let pipeline = Pipeline::<_, _, Box<dyn TimeSource>>::new(
                sampler,
                scale,
                RecordLayout::Indexed,
                None,
                store,
            );

            log::info!(
                "Connecting to the MQTT broker at {}:{}...",
                config.broker.host,
                config.broker.port
            );
            let publisher = StreamPublisher::new(
                MqttSession::new(&config.broker),
                config.broker.telemetry_topic(),
                Duration::from_millis(config.broker.reconnect_delay_ms),
            );
            let mut driver = PushDriver::new(pipeline, publisher);

            match driver.run_once().await {
                Ok(published) => log::info!("Single run done, {published} samples published"),
                Err(e) => log::error!("Single run failed: {e}"),
            }
        }
    }

    Ok(())
}
