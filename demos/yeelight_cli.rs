//! CLI application for controlling Yeelight lights.
//!
//! This example demonstrates a command-line interface covering discovery,
//! typed commands, raw commands, flows and live state updates.
//!
//! Run with: cargo run --example yeelight_cli -- --help

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use yeelight_lan_rs::flow::{FlowAction, FlowSpec, Transition};
use yeelight_lan_rs::{
    Brightness, Color, Controller, DEFAULT_CONTROL_PORT, DeviceDescriptor, DeviceEvent, Effect,
    EngineConfig, Kelvin, Light, PowerMode,
};

#[derive(Parser)]
#[command(name = "yeelight-cli")]
#[command(about = "Control Yeelight lights from the command line", long_about = None)]
struct Cli {
    /// IP address of the light (not required for discover command)
    #[arg(short, long, global = true)]
    ip: Option<IpAddr>,

    /// Control port of the light
    #[arg(short, long, global = true, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Transition duration in milliseconds (0 for sudden)
    #[arg(short, long, global = true, default_value = "0")]
    duration: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover all Yeelight lights on the network
    Discover {
        /// Discovery timeout in seconds (default: 3)
        #[arg(short, long, default_value = "3")]
        timeout: u64,
    },

    /// Read the current state of the light
    Status,

    /// Turn the light on
    On,

    /// Turn the light off
    Off,

    /// Toggle the light on/off
    Toggle,

    /// Set RGB color (0-255 for each component)
    Color {
        /// Red component (0-255)
        red: u8,
        /// Green component (0-255)
        green: u8,
        /// Blue component (0-255)
        blue: u8,
    },

    /// Set brightness (1-100)
    Brightness {
        /// Brightness level (1-100)
        #[arg(value_parser = clap::value_parser!(u8).range(1..=100))]
        level: u8,
    },

    /// Set color temperature in Kelvin (1700-6500)
    Temperature {
        /// Temperature in Kelvin (1700-6500)
        #[arg(value_parser = clap::value_parser!(u16).range(1700..=6500))]
        kelvin: u16,
    },

    /// Pulse red and blue until stopped
    Flow {
        /// Number of times to repeat the pulse, 0 for forever
        #[arg(short, long, default_value = "0")]
        repeat: u32,
    },

    /// Stop a running flow
    StopFlow,

    /// Send a raw method call, e.g. `raw set_bright 50 smooth 500`
    Raw {
        method: String,
        /// Parameters; numbers are sent as numbers, everything else as strings
        params: Vec<String>,
    },

    /// Get detailed diagnostics
    Diagnostics,

    /// Print state changes as the light reports them
    Listen,
}

fn effect(duration: u64) -> Effect {
    if duration == 0 {
        Effect::Sudden
    } else {
        Effect::Smooth(Duration::from_millis(duration))
    }
}

fn raw_param(param: String) -> serde_json::Value {
    match param.parse::<i64>() {
        Ok(number) => number.into(),
        Err(_) => param.into(),
    }
}

async fn print_status(light: &Light) {
    match light.refresh().await {
        Ok(state) => {
            println!("\nLight Status:");
            match state.power() {
                Some(power) => println!("  Power: {}", power.as_ref()),
                None => println!("  Power: unknown"),
            }
            if let Some(brightness) = state.brightness() {
                println!("  Brightness: {}%", brightness.value());
            }
            if let Some(mode) = state.color_mode() {
                println!("  Mode: {:?}", mode);
            }
            if let Some(name) = state.name() {
                println!("  Name: {}", name);
            }
            println!("  Flowing: {}", state.flowing());
        }
        Err(e) => eprintln!("Error getting status: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let controller = Controller::new(EngineConfig::default());

    match cli.command {
        Commands::Discover { timeout } => {
            println!(
                "Discovering Yeelight lights on the network (timeout: {}s)...",
                timeout
            );

            match controller.discover(Duration::from_secs(timeout)).await {
                Ok(devices) => {
                    if devices.is_empty() {
                        println!("No lights found on the network.");
                    } else {
                        println!("\nFound {} light(s):", devices.len());
                        for device in devices {
                            println!(
                                "  ID: {:20}  Address: {:21}  Model: {}",
                                device.id,
                                device.address.to_string(),
                                device.model
                            );
                        }
                    }
                }
                Err(e) => eprintln!("Error during discovery: {}", e),
            }
        }

        _ => {
            // All other commands require an IP address
            let ip = cli.ip.ok_or("IP address is required for this command. Use --ip <IP>")?;
            let address = SocketAddr::new(ip, cli.port);
            let light = controller.connect_to(DeviceDescriptor::new(&address.to_string(), address))?;
            let effect = effect(cli.duration);

            match cli.command {
                Commands::Discover { .. } => unreachable!(),

                Commands::Status => {
                    println!("Getting status for light at {}...", address);
                    print_status(&light).await;
                }

                Commands::On => {
                    println!("Turning light ON at {}...", address);
                    match light.set_power(PowerMode::On, effect).await {
                        Ok(_) => println!("Light turned ON"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Off => {
                    println!("Turning light OFF at {}...", address);
                    match light.set_power(PowerMode::Off, effect).await {
                        Ok(_) => println!("Light turned OFF"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Toggle => {
                    println!("Toggling light at {}...", address);
                    match light.toggle().await {
                        Ok(_) => println!("Light toggled"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Color { red, green, blue } => {
                    println!(
                        "Setting color to RGB({}, {}, {}) at {}...",
                        red, green, blue, address
                    );
                    match light.set_rgb(Color::rgb(red, green, blue), effect).await {
                        Ok(_) => println!("Color set successfully"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Brightness { level } => {
                    println!("Setting brightness to {}% at {}...", level, address);
                    if let Some(brightness) = Brightness::create(level) {
                        match light.set_brightness(brightness, effect).await {
                            Ok(_) => println!("Brightness set successfully"),
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    } else {
                        eprintln!("Invalid brightness value. Must be between 1 and 100.");
                    }
                }

                Commands::Temperature { kelvin } => {
                    println!("Setting temperature to {}K at {}...", kelvin, address);
                    if let Some(temp) = Kelvin::create(kelvin) {
                        match light.set_color_temperature(temp, effect).await {
                            Ok(_) => println!("Temperature set successfully"),
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    } else {
                        eprintln!("Invalid temperature value. Must be between 1700 and 6500K.");
                    }
                }

                Commands::Flow { repeat } => {
                    println!("Starting flow at {}...", address);
                    let step = Duration::from_millis(cli.duration.max(500));
                    let spec = FlowSpec::new(
                        vec![
                            Transition::color(step, Color::rgb(255, 0, 0), Brightness::create(100)),
                            Transition::color(step, Color::rgb(0, 0, 255), Brightness::create(20)),
                        ],
                        repeat,
                        FlowAction::Recover,
                    );
                    match light.start_flow(&spec).await {
                        Ok(_) => println!("Flow started"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::StopFlow => {
                    println!("Stopping flow at {}...", address);
                    match light.stop_flow().await {
                        Ok(_) => println!("Flow stopped"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Raw { method, params } => {
                    let params = params.into_iter().map(raw_param).collect();
                    match controller.send(light.id(), &method, params).await {
                        Ok(response) => match response.into_result() {
                            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                            Err(e) => eprintln!("Device error: {}", e),
                        },
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }

                Commands::Diagnostics => {
                    println!("Getting diagnostics for light at {}...", address);
                    let _ = light.refresh().await;
                    let diag = light.diagnostics();
                    println!("\nDiagnostics:\n{}", serde_json::to_string_pretty(&diag)?);
                }

                Commands::Listen => {
                    println!("Listening for state changes from {}... (Press Ctrl+C to stop)\n", address);
                    let mut events = controller.subscribe();
                    print_status(&light).await;

                    while let Some(event) = events.next().await {
                        match event {
                            DeviceEvent::StateChanged { state, .. } => {
                                println!(
                                    "{}\n",
                                    serde_json::to_string_pretty(&state)
                                        .unwrap_or_else(|_| format!("{:?}", state))
                                );
                            }
                            DeviceEvent::ConnectionChanged { status, .. } => {
                                println!("[connection] {}", status);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
