use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use p110_lib::{discover, Client, EnergyDataInterval, P110};
use tokio_util::sync::CancellationToken;

/// Query and control Tapo P110/P115 smart plugs on the local network
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Tapo account username (email)
    #[arg(long, env = "TAPO_USERNAME")]
    username: Option<String>,

    /// Tapo account password
    #[arg(long, env = "TAPO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Device IP address; discovered automatically when omitted
    #[arg(long)]
    ip: Option<String>,

    /// Discovery window in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Print raw JSON instead of a summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices answering the discovery broadcast
    Discover,
    /// Show device information
    Info,
    /// Show on-time and power usage aggregates
    Usage,
    /// Show the instantaneous power draw
    Power,
    /// Show today's and this month's energy totals
    Energy,
    /// Show per-bucket energy history (hourly, daily or monthly)
    Data { interval: String },
    /// Switch the relay on
    On,
    /// Switch the relay off
    Off,
    /// Poll power and energy totals periodically
    Watch {
        /// Seconds between polls
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let window = Duration::from_secs(args.timeout);

    if let Command::Discover = args.command {
        let devices = discover(&CancellationToken::new(), window).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&devices)?);
        } else if devices.is_empty() {
            println!("No devices found");
        } else {
            println!("Found {} device(s):", devices.len());
            for device in &devices {
                println!(
                    "  - {} model={} mac={} scheme={}",
                    device.host,
                    device.model,
                    device.mac,
                    device.encrypt_scheme.as_deref().unwrap_or("?")
                );
            }
        }
        return Ok(());
    }

    let username = args
        .username
        .clone()
        .ok_or("username required (--username or TAPO_USERNAME)")?;
    let password = args
        .password
        .clone()
        .ok_or("password required (--password or TAPO_PASSWORD)")?;
    let client = Client::new(username, password);

    let plug = match &args.ip {
        Some(ip) => client.connect(ip).await?,
        None => {
            let (plug, host) = client.connect_first(window).await?;
            eprintln!("Connected to {host}");
            plug
        }
    };

    run_command(&args, &plug).await
}

async fn run_command(args: &Args, plug: &P110) -> Result<(), Box<dyn std::error::Error>> {
    match &args.command {
        Command::Discover => unreachable!("handled before connecting"),
        Command::Info => {
            let info = plug.get_device_info().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Model:            {}", info.model);
                println!("Firmware:         {}", info.firmware_version);
                println!("Hardware:         {}", info.hardware_version);
                println!("MAC:              {}", info.mac);
                println!("Nickname:         {}", info.nickname);
                println!("On:               {}", info.device_on);
                println!("On time:          {} s", info.on_time);
                println!("Signal:           {} dBm (level {})", info.rssi, info.signal_level);
                println!("Overheated:       {}", info.overheated);
            }
        }
        Command::Usage => {
            let usage = plug.get_device_usage().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&usage)?);
            } else {
                println!("              today    past7   past30");
                let rows = [
                    ("Time (min)", usage.time_usage),
                    ("Power (Wh)", usage.power_usage),
                    ("Saved (Wh)", usage.saved_power),
                ];
                for (label, entry) in rows {
                    println!(
                        "{label:<12} {:>8} {:>8} {:>8}",
                        entry.today, entry.past7, entry.past30
                    );
                }
            }
        }
        Command::Power => {
            let power = plug.get_current_power().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&power)?);
            } else {
                println!("Current power: {:.3} W", power.current_power as f64 / 1000.0);
            }
        }
        Command::Energy => {
            let energy = plug.get_energy_usage().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&energy)?);
            } else {
                println!("Today:      {} Wh over {} min", energy.today_energy, energy.today_runtime);
                println!("This month: {} Wh over {} min", energy.month_energy, energy.month_runtime);
                println!("Right now:  {:.3} W", energy.current_power as f64 / 1000.0);
            }
        }
        Command::Data { interval } => {
            let interval: EnergyDataInterval = interval
                .parse()
                .map_err(|_| format!("invalid interval {interval:?}; expected hourly, daily or monthly"))?;
            let data = plug.get_energy_data(interval, &Local::now()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!(
                    "{} buckets of {} min between {} and {}",
                    data.data.len(),
                    data.interval,
                    data.start_timestamp,
                    data.end_timestamp
                );
                for (index, wh) in data.data.iter().enumerate() {
                    println!("  [{index:>3}] {wh} Wh");
                }
            }
        }
        Command::On => {
            plug.turn_on().await?;
            println!("Device turned on");
        }
        Command::Off => {
            plug.turn_off().await?;
            println!("Device turned off");
        }
        Command::Watch { interval } => {
            let period = Duration::from_secs((*interval).max(1));
            loop {
                let power = plug.get_current_power().await?;
                let energy = plug.get_energy_usage().await?;
                println!(
                    "{} power={:.3}W today={}Wh month={}Wh",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    power.current_power as f64 / 1000.0,
                    energy.today_energy,
                    energy.month_energy
                );
                tokio::time::sleep(period).await;
            }
        }
    }
    Ok(())
}
