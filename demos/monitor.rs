//! Connect to a brain and print everything it tells us.
//!
//! Usage: cargo run --example monitor -- 192.168.1.50:8000

use brainlink::{BrainClient, BrainOptions, ClientEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brainlink=info".into()),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());

    let client = BrainClient::new(endpoint, BrainOptions::default())?;
    let mut events = client.events();

    let status = client.connect_to_controller().await?;
    println!("connected: {status}");

    if let Some(info) = client.controller_info() {
        println!(
            "brain: {} (firmware {})",
            info.name.as_deref().unwrap_or("unnamed"),
            info.version.as_deref().unwrap_or("unknown"),
        );
    }

    // Dump the device catalogue
    let mut feeds = Vec::new();
    for device in client.devices().await? {
        let marker = if device.is_system_device() { " [system]" } else { "" };
        println!("device: {} ({}){marker}", device.name(), device.id());
        if let Some(err) = device.driver_error() {
            println!("  driver unavailable: {err}");
            continue;
        }
        for command in device.commands().values() {
            println!("  command: {}", command.name);
        }
        feeds.push((device.id(), device.subscribe()));
    }

    // Print state changes and client events as they arrive
    let mut change_tasks = Vec::new();
    for (id, mut sub) in feeds {
        change_tasks.push(tokio::spawn(async move {
            while let Ok(change) = sub.recv().await {
                println!("[{id}] {} = {}", change.name, change.value);
            }
        }));
    }

    while let Ok(event) = events.next().await {
        match event {
            ClientEvent::ConnectionStatusChanged(status) => println!("status: {status}"),
            ClientEvent::PinRequired => println!("the brain wants a PIN; call submit_pin"),
            other => println!("event: {}", other.name()),
        }
    }

    Ok(())
}
