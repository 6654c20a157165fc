//! Discover all Yeelight lights on the network and run a sunrise flow on them.
//!
//! This example demonstrates:
//! - Discovery of lights on the local network
//! - Connecting to every discovered light
//! - Starting a color flow that warms up and stays at the last step
//!
//! Run with: cargo run --example discover_and_flow

use std::time::Duration;
use yeelight_lan_rs::flow::{FlowAction, FlowSpec, Transition};
use yeelight_lan_rs::{Brightness, Color, Controller, EngineConfig, Kelvin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Discovering Yeelight lights on the network...");

    let controller = Controller::new(EngineConfig::default());
    let devices = controller.discover(Duration::from_secs(3)).await?;

    if devices.is_empty() {
        println!("No lights found on the network.");
        return Ok(());
    }

    println!("Found {} light(s):", devices.len());
    for device in &devices {
        println!("  - ID: {}, Address: {}, Model: {}", device.id, device.address, device.model);
    }

    let sunrise = FlowSpec::new(
        vec![
            Transition::color(Duration::from_secs(5), Color::rgb(255, 80, 0), Brightness::create(5)),
            Transition::color(Duration::from_secs(10), Color::rgb(255, 160, 40), Brightness::create(40)),
            Transition::temperature(Duration::from_secs(15), Kelvin::create(4000).unwrap_or_default(), Brightness::create(100)),
        ],
        1,
        FlowAction::Stay,
    );

    println!("\nStarting sunrise on all lights...");

    for device in devices {
        let light = controller.connect(&device.id)?;
        match light.start_flow(&sunrise).await {
            Ok(_) => println!("  ✓ Started sunrise on {}", light.id()),
            Err(e) => eprintln!("  ✗ Failed to start sunrise on {}: {}", light.id(), e),
        }
    }

    println!("\nDone!");
    Ok(())
}
