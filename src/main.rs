use std::time::Duration;

use ce102m2mqtt::{Ce102mDevice, MqttPublisher, PointBuffer, TcpDialer, CONFIG};
use log::{error, info, warn};
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("C2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = CONFIG.clone();

    let (publisher, sender) = MqttPublisher::new(&config.mqtt);

    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    threads.push(tokio::spawn(async move {
        publisher.start_thread().await;
    }));

    for device_config in config.ce102m {
        let name = device_config.name.clone();
        let dialer = TcpDialer::new(device_config.software_parity, device_config.log_protocol);
        let mut device = match Ce102mDevice::new(&device_config, dialer) {
            Ok(device) => device,
            Err(e) => {
                error!("{name}: invalid configuration: {e}");
                std::process::exit(1);
            }
        };

        let point_sender = sender.clone();
        let read_interval = device_config.read_interval.max(1);
        threads.push(tokio::spawn(async move {
            info!("{name}: polling every {read_interval} seconds");
            let mut ticker = tokio::time::interval(Duration::from_secs(read_interval));
            loop {
                ticker.tick().await;
                let mut buffer = PointBuffer::new();
                if let Err(e) = device.gather(&mut buffer).await {
                    warn!("{name}: gather failed: {e}");
                }
                for point in buffer.drain() {
                    if point_sender.send(point).await.is_err() {
                        return;
                    }
                }
            }
        }));
    }

    info!("All meters started, now waiting for a task to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if threads.iter().any(|task| task.is_finished()) {
            for task in threads.iter() {
                task.abort();
            }
            break;
        }
    }
}
