//! CLI entry point.
//!
//! Headless surface for the bench: cycle runs, jogs, interferometer
//! alignment and recording, and an interactive motor console. Ctrl-C trips
//! the shared cancel flag; runners stop at the next iteration boundary and
//! close their logs and recordings.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use rattlesnake::config::Settings;
use rattlesnake::core::{Instrument, Interferometer, Motor, PowerSupply, Sign, StorageWriter};
use rattlesnake::data::storage::CsvWriter;
use rattlesnake::hardware::tcp::TcpLineAdapter;
use rattlesnake::instrument::ids3010::{Ids3010, IdsOptions};
use rattlesnake::instrument::{AgilentE3631A, Picomotor};
use rattlesnake::run::{
    run_motor_cycle, run_voltage_cycle, Direction, MotorCycleParams, VoltageCycleParams,
};
use rattlesnake::session::MotorSession;
use rattlesnake::worker::{CancelFlag, Worker};

#[derive(Parser)]
#[command(name = "rattlesnake")]
#[command(about = "Picomotor / interferometer / power-supply bench control", long_about = None)]
struct Cli {
    /// Config name under config/ (without extension)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run repeated relative moves on the picomotor
    MotorCycle {
        /// Steps per move (default: last session)
        #[arg(long)]
        steps: Option<u32>,
        /// Moves per direction pass (default: last session)
        #[arg(long)]
        cycles: Option<u32>,
        /// Dwell between moves in seconds (default: last session)
        #[arg(long)]
        dwell: Option<f64>,
        /// up, down or updown (default: last session)
        #[arg(long)]
        direction: Option<String>,
        /// Motor port (default: the port found at connect)
        #[arg(long)]
        channel: Option<u8>,
        /// Do not persist these parameters as the new session
        #[arg(long)]
        no_session: bool,
        /// Record the interferometer displacement stream during the cycle
        #[arg(long)]
        record: bool,
    },

    /// Single move or free run on the picomotor
    MotorJog {
        /// + / up or - / down
        #[arg(long)]
        direction: String,
        /// Steps to move; omit for a free run until Ctrl-C
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long)]
        channel: Option<u8>,
    },

    /// Run a voltage ladder on the power supply
    SupplyCycle {
        #[arg(long)]
        vmin: Option<f64>,
        #[arg(long)]
        vmax: Option<f64>,
        #[arg(long)]
        vstep: Option<f64>,
        /// Dwell per rung in seconds
        #[arg(long)]
        dwell: Option<f64>,
        /// Dwell at vmin after each rung, in seconds
        #[arg(long)]
        dwell_low: Option<f64>,
        /// up, down or updown
        #[arg(long, default_value = "up")]
        direction: String,
        /// Return to vmin after every rung
        #[arg(long)]
        back_to_min: bool,
        /// Record the interferometer displacement stream during the cycle
        #[arg(long)]
        record: bool,
    },

    /// Program or nudge the supply voltage
    SupplyJog {
        /// Absolute setpoint in volts
        #[arg(long)]
        voltage: Option<f64>,
        /// Step up by the configured jog step
        #[arg(long)]
        up: bool,
        /// Step down by the configured jog step
        #[arg(long)]
        down: bool,
    },

    /// Run an optics alignment pass and report the contrast
    Align,

    /// Record the displacement stream for a fixed time
    Record {
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },

    /// Interactive picomotor console (raw xxAAnn commands)
    Console,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.log_level),
    )
    .init();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received, stopping at the next iteration");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::MotorCycle {
            steps,
            cycles,
            dwell,
            direction,
            channel,
            no_session,
            record,
        } => {
            motor_cycle(
                &settings, &cancel, steps, cycles, dwell, direction, channel, no_session, record,
            )
            .await
        }
        Commands::MotorJog {
            direction,
            steps,
            channel,
        } => motor_jog(&settings, &cancel, &direction, steps, channel).await,
        Commands::SupplyCycle {
            vmin,
            vmax,
            vstep,
            dwell,
            dwell_low,
            direction,
            back_to_min,
            record,
        } => {
            supply_cycle(
                &settings, &cancel, vmin, vmax, vstep, dwell, dwell_low, &direction, back_to_min,
                record,
            )
            .await
        }
        Commands::SupplyJog { voltage, up, down } => {
            supply_jog(&settings, voltage, up, down).await
        }
        Commands::Align => align(&settings).await,
        Commands::Record { seconds } => record_stream(&settings, &cancel, seconds).await,
        Commands::Console => console(&settings).await,
    }
}

// ---------------------------------------------------------------------------
// Instrument construction
// ---------------------------------------------------------------------------

async fn open_motor(settings: &Settings) -> Result<Picomotor> {
    #[cfg(feature = "instrument_usb")]
    {
        let adapter = rattlesnake::hardware::usb::UsbAdapter::new(
            settings.motor_vendor_id()?,
            settings.motor_product_id()?,
        );
        let mut motor = Picomotor::new(
            "picomotor",
            Box::new(adapter),
            settings.motor.max_velocity,
            settings.motor.max_acceleration,
        );
        motor.initialize().await?;
        Ok(motor)
    }
    #[cfg(not(feature = "instrument_usb"))]
    {
        let _ = settings;
        Err(rattlesnake::ControlError::FeatureNotEnabled("instrument_usb".to_string()).into())
    }
}

async fn open_supply(settings: &Settings) -> Result<AgilentE3631A> {
    #[cfg(feature = "instrument_visa")]
    {
        let adapter = rattlesnake::hardware::visa::VisaAdapter::new(&settings.supply.resource);
        let mut supply = AgilentE3631A::new(
            "agilent",
            Box::new(adapter),
            settings.supply_rail()?,
            settings.supply.current_limit_amps,
        );
        supply.initialize().await?;
        Ok(supply)
    }
    #[cfg(not(feature = "instrument_visa"))]
    {
        let _ = settings;
        Err(rattlesnake::ControlError::FeatureNotEnabled("instrument_visa".to_string()).into())
    }
}

async fn open_interferometer(settings: &Settings) -> Result<Ids3010> {
    let cfg = &settings.interferometer;
    let adapter = TcpLineAdapter::new(&cfg.host, cfg.rpc_port);
    let mut ids = Ids3010::new(
        "interfero",
        Box::new(adapter),
        IdsOptions {
            stream_host: cfg.host.clone(),
            stream_port: cfg.stream_port,
            interval_us: cfg.interval_us,
            record_dir: settings.storage.record_dir.clone().into(),
            record_prefix: cfg.record_prefix.clone(),
        },
    );
    ids.initialize().await?;
    Ok(ids)
}

fn open_writer(settings: &Settings, prefix: &str) -> Result<CsvWriter> {
    CsvWriter::create(std::path::Path::new(&settings.storage.record_dir), prefix)
}

fn parse_sign(direction: &str) -> Result<Sign> {
    match direction.trim().to_ascii_lowercase().as_str() {
        "+" | "up" => Ok(Sign::Plus),
        "-" | "down" => Ok(Sign::Minus),
        other => bail!("unknown jog direction '{other}' (expected + or -)"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn motor_cycle(
    settings: &Settings,
    cancel: &CancelFlag,
    steps: Option<u32>,
    cycles: Option<u32>,
    dwell: Option<f64>,
    direction: Option<String>,
    channel: Option<u8>,
    no_session: bool,
    record: bool,
) -> Result<()> {
    let session_path = std::path::PathBuf::from(&settings.session_file);
    let previous = MotorSession::load_or_default(&session_path);

    let session = MotorSession {
        number_of_steps: steps.unwrap_or(previous.number_of_steps),
        number_of_cycles: cycles.unwrap_or(previous.number_of_cycles),
        dwell_time: dwell.unwrap_or(previous.dwell_time),
        direction: match direction {
            Some(text) => text.parse::<Direction>()?,
            None => previous.direction,
        },
    };
    if session.number_of_cycles > settings.motor.max_cycles {
        bail!(
            "cycle count {} exceeds the configured maximum of {}",
            session.number_of_cycles,
            settings.motor.max_cycles
        );
    }
    if session.dwell_time < settings.motor.min_dwell_secs {
        bail!(
            "dwell {}s below the configured minimum of {}s",
            session.dwell_time,
            settings.motor.min_dwell_secs
        );
    }

    let mut motor = open_motor(settings).await?;
    let params = MotorCycleParams {
        channel: channel.unwrap_or_else(|| motor.channel()),
        steps: session.number_of_steps,
        cycles: session.number_of_cycles,
        dwell: Duration::from_secs_f64(session.dwell_time),
        direction: session.direction,
    };

    let writer = open_writer(settings, &settings.motor.record_prefix)?;
    let mut ids = if record {
        let mut ids = open_interferometer(settings).await?;
        ids.start_measurement().await?;
        Some(ids)
    } else {
        None
    };

    let cancel = cancel.clone();
    let worker = Worker::spawn(async move {
        let publisher = motor.publisher();
        let mut writer = writer;
        let report = run_motor_cycle(
            &mut motor,
            &params,
            &cancel,
            Some(&mut writer as &mut dyn StorageWriter),
            Some(&publisher),
            ids.as_mut().map(|i| i as &mut dyn Interferometer),
        )
        .await;
        if let Some(mut ids) = ids {
            if let Err(e) = ids.stop_measurement().await {
                log::warn!("could not stop measurement: {e:#}");
            }
            ids.shutdown().await.ok();
        }
        motor.shutdown().await.ok();
        report
    });
    let report = worker.join().await?;

    println!(
        "motor cycle: {} moves, final position {}{}",
        report.moves_executed,
        report.final_position,
        if report.cancelled { " (cancelled)" } else { "" }
    );

    if !no_session {
        session.save(&session_path)?;
    }
    Ok(())
}

async fn motor_jog(
    settings: &Settings,
    cancel: &CancelFlag,
    direction: &str,
    steps: Option<u32>,
    channel: Option<u8>,
) -> Result<()> {
    let sign = parse_sign(direction)?;
    let mut motor = open_motor(settings).await?;
    let channel = channel.unwrap_or_else(|| motor.channel());

    match steps {
        Some(steps) => {
            let delta = i64::from(steps) * sign.factor();
            motor.move_relative(channel, delta).await?;
            println!("moved {delta} steps on port {channel}");
        }
        None => {
            motor.jog(channel, sign).await?;
            println!("free running {}, Ctrl-C to stop", sign.as_char());
            while !cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            motor.stop().await?;
            let position = motor.position(channel).await?;
            println!("stopped at position {position}");
        }
    }
    motor.shutdown().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn supply_cycle(
    settings: &Settings,
    cancel: &CancelFlag,
    vmin: Option<f64>,
    vmax: Option<f64>,
    vstep: Option<f64>,
    dwell: Option<f64>,
    dwell_low: Option<f64>,
    direction: &str,
    back_to_min: bool,
    record: bool,
) -> Result<()> {
    let params = VoltageCycleParams {
        vmin: vmin.unwrap_or(settings.supply.volt_min),
        vmax: vmax.unwrap_or(settings.supply.volt_max),
        vstep: vstep.unwrap_or(settings.supply.volt_step),
        dwell: Duration::from_secs_f64(dwell.unwrap_or(settings.supply.dwell_secs)),
        dwell_low: Duration::from_secs_f64(dwell_low.unwrap_or(settings.supply.dwell_low_secs)),
        direction: direction.parse::<Direction>()?,
        back_to_min,
    };

    let mut supply = open_supply(settings).await?;
    let writer = open_writer(settings, &settings.supply.record_prefix)?;
    let mut ids = if record {
        let mut ids = open_interferometer(settings).await?;
        ids.start_measurement().await?;
        Some(ids)
    } else {
        None
    };

    let cancel = cancel.clone();
    let worker = Worker::spawn(async move {
        let publisher = supply.publisher();
        let mut writer = writer;
        let report = run_voltage_cycle(
            &mut supply,
            &params,
            &cancel,
            Some(&mut writer as &mut dyn StorageWriter),
            Some(&publisher),
            ids.as_mut().map(|i| i as &mut dyn Interferometer),
        )
        .await;
        if let Err(e) = supply.output_off().await {
            log::warn!("could not disable output: {e:#}");
        }
        if let Some(mut ids) = ids {
            if let Err(e) = ids.stop_measurement().await {
                log::warn!("could not stop measurement: {e:#}");
            }
            ids.shutdown().await.ok();
        }
        supply.shutdown().await.ok();
        report
    });
    let report = worker.join().await?;

    println!(
        "voltage ladder: {} rungs, final setpoint {:.1} V{}",
        report.rungs_executed,
        report.final_voltage,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

async fn supply_jog(
    settings: &Settings,
    voltage: Option<f64>,
    up: bool,
    down: bool,
) -> Result<()> {
    if voltage.is_none() && !up && !down {
        bail!("nothing to do: pass --voltage, --up or --down");
    }
    let mut supply = open_supply(settings).await?;
    supply.output_on().await?;

    if let Some(volts) = voltage {
        supply.set_voltage(volts).await?;
    }
    if up {
        supply.jog(settings.supply.jog_step).await?;
    }
    if down {
        supply.jog(-settings.supply.jog_step).await?;
    }

    let measured = supply.measure_voltage().await?;
    println!(
        "setpoint {:.1} V, measured {:.3} V",
        supply.programmed_voltage(),
        measured
    );
    supply.shutdown().await?;
    Ok(())
}

async fn align(settings: &Settings) -> Result<()> {
    let mut ids = open_interferometer(settings).await?;
    let report = ids.align().await?;
    println!(
        "alignment: contrast {} permille, baseband {} permille",
        report.contrast_permille, report.baseband_permille
    );
    ids.shutdown().await?;
    Ok(())
}

async fn record_stream(settings: &Settings, cancel: &CancelFlag, seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("recording time must be positive");
    }
    let mut ids = open_interferometer(settings).await?;
    ids.start_measurement().await?;
    let path = ids.start_recording().await?;
    println!("recording to {}", path.display());

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(seconds);
    while tokio::time::Instant::now() < deadline && !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    ids.stop_recording().await?;
    ids.stop_measurement().await?;
    ids.shutdown().await?;
    println!("recording closed");
    Ok(())
}

async fn console(settings: &Settings) -> Result<()> {
    let mut motor = open_motor(settings).await?;
    println!(
        "picomotor console on port {} (xxAAnn commands, 'exit' to leave)",
        motor.channel()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin closed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }
        match motor.command(line).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => {}
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    motor.shutdown().await?;
    Ok(())
}
