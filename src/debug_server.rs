//! TCP debug server for testing the FTMS engine without BLE hardware.
//!
//! Listens on a TCP port (default 8828) and accepts line-based text commands
//! with hex-encoded binary payloads, mirroring what a BLE FTMS client would
//! send/receive via GATT characteristics.
//!
//! Usage from dev machine:
//!   nc rpi 8828
//!
//! Commands:
//!   state           → human-readable session, telemetry and target state
//!   gatt            → characteristic list in registration order
//!   ibd             → current indoor bike data frames (0x2AD2) as hex
//!   feat            → feature (0x2ACC) as hex
//!   pr              → power range (0x2AD8) as hex
//!   rr              → resistance range (0x2AD6) as hex
//!   cp <hex>        → write to control point (0x2AD9), returns response hex
//!   sub             → stream every notification/indication (hex lines)
//!   help            → list commands

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::protocol::{
    self, CONTROL_POINT_UUID, FEATURE_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID,
    POWER_RANGE_UUID, RESISTANCE_RANGE_UUID,
};
use crate::session::{EngineHandle, Inspection};
use crate::Result;

/// Bind the debug port and serve clients forever.
pub async fn run(engine: EngineHandle, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug server listening on port {}", port);
    serve(listener, engine).await
}

/// Serve clients on an already-bound listener.
pub async fn serve(listener: TcpListener, engine: EngineHandle) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Debug client connected from {}", addr);

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, engine).await {
                info!("Debug client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, engine: EngineHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"ftms-debug> connected. type 'help' for commands.\n")
        .await?;

    loop {
        writer.write_all(b"ftms-debug> ").await?;

        let Some(line) = lines.next_line().await? else {
            return Ok(()); // EOF
        };
        let line = line.trim().to_lowercase();
        if line.is_empty() {
            continue;
        }

        let response = match line.split_once(' ') {
            Some(("cp", hex)) => handle_cp(hex.trim(), &engine).await,
            _ => match line.as_str() {
                "help" => Ok(HELP_TEXT.to_string()),
                "state" => engine.inspect().await.map(|i| describe_state(&i)),
                "gatt" => engine.inspect().await.map(|i| describe_gatt(&i)),
                "ibd" => engine.inspect().await.map(|i| {
                    let [first, second] = i.telemetry.encode_frames();
                    format!("data {}\ndata {}", HEXLOWER.encode(&first), HEXLOWER.encode(&second))
                }),
                "feat" => read_value(&engine, FEATURE_UUID, "feat").await,
                "pr" => read_value(&engine, POWER_RANGE_UUID, "range").await,
                "rr" => read_value(&engine, RESISTANCE_RANGE_UUID, "range").await,
                "sub" => {
                    handle_subscribe(&engine, &mut writer).await?;
                    continue; // subscribe handles its own output
                }
                "quit" | "exit" => return Ok(()),
                _ => Ok(format!("unknown command: '{}'. type 'help'.", line)),
            },
        };

        match response {
            Ok(msg) => {
                writer.write_all(msg.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            Err(e) => {
                writer
                    .write_all(format!("error: {}\n", e).as_bytes())
                    .await?;
            }
        }
    }
}

fn describe_state(i: &Inspection) -> String {
    let targets = &i.targets;
    let simulation = match targets.simulation {
        Some(sim) => format!(
            "grade {:.2}% wind {:.3} m/s crr {} cw {}",
            sim.grade as f64 / 100.0,
            sim.wind_speed as f64 / 1000.0,
            sim.crr,
            sim.cw
        ),
        None => "-".to_string(),
    };
    format!(
        "name:       {}\n\
         session:    {:?} (central: {})\n\
         controllable: {}\n\
         cadence:    {} rpm\n\
         power:      {} W\n\
         speed:      {:.2} km/h  [raw: {}]\n\
         target power:      {}\n\
         target resistance: {}\n\
         simulation: {}\n\
         running:    {}\n\
         control granted: {}",
        i.identity.local_name(),
        i.state,
        i.central.as_deref().unwrap_or("-"),
        i.capability.controllable,
        i.telemetry.cadence,
        i.telemetry.power,
        i.telemetry.speed as f64 / 100.0,
        i.telemetry.speed,
        targets.power.map_or("-".to_string(), |w| format!("{} W", w)),
        targets
            .resistance_level
            .map_or("-".to_string(), |r| format!("{:.1}", r as f64 / 10.0)),
        simulation,
        targets.running,
        targets.control_granted,
    )
}

fn describe_gatt(i: &Inspection) -> String {
    let Some(service) = &i.service else {
        return "service not registered yet".to_string();
    };
    let mut out = format!("service {}", service.uuid);
    for c in &service.characteristics {
        let p = c.properties;
        let flags: Vec<&str> = [
            (p.read, "read"),
            (p.write, "write"),
            (p.notify, "notify"),
            (p.indicate, "indicate"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();
        out.push_str(&format!(
            "\n  {} {} [{}]",
            c.uuid,
            characteristic_name(c.uuid),
            flags.join(",")
        ));
    }
    out
}

fn characteristic_name(uuid: Uuid) -> &'static str {
    match uuid {
        INDOOR_BIKE_DATA_UUID => "indoor-bike-data",
        CONTROL_POINT_UUID => "control-point",
        FEATURE_UUID => "feature",
        MACHINE_STATUS_UUID => "machine-status",
        POWER_RANGE_UUID => "power-range",
        RESISTANCE_RANGE_UUID => "resistance-range",
        _ => "?",
    }
}

async fn read_value(engine: &EngineHandle, uuid: Uuid, label: &str) -> Result<String> {
    let inspection = engine.inspect().await?;
    let value = inspection
        .service
        .as_ref()
        .and_then(|s| s.characteristic(uuid))
        .and_then(|c| c.value.as_ref());
    Ok(match value {
        Some(v) => format!("{} {}", label, HEXLOWER.encode(v)),
        None => format!("{} not exposed by this device", characteristic_name(uuid)),
    })
}

async fn handle_cp(hex: &str, engine: &EngineHandle) -> Result<String> {
    let hex = hex.replace(' ', "");
    let bytes = match HEXLOWER_PERMISSIVE.decode(hex.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(format!("error: invalid hex: {}", e)),
    };

    let parsed = match protocol::decode_control_command(&bytes) {
        Ok(cmd) => format!("parsed: {:?}", cmd),
        Err(e) => format!("parsed: {}", e),
    };

    // Execute via the same path a BLE control point write takes
    let indication = engine.write_control_point(bytes).await?;
    Ok(match indication {
        Some(resp) => format!("{}\nresp {}", parsed, HEXLOWER.encode(&resp)),
        None => format!("{}\nno response", parsed),
    })
}

async fn handle_subscribe(
    engine: &EngineHandle,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<()> {
    writer
        .write_all(b"subscribed to notifications. ctrl-c to stop.\n")
        .await?;

    let mut rx = engine.subscribe();
    loop {
        let n = match rx.recv().await {
            Ok(n) => n,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let line = format!(
            "{} {}\n",
            characteristic_name(n.characteristic),
            HEXLOWER.encode(&n.value)
        );
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }

    Ok(())
}

const HELP_TEXT: &str = "\
commands:
  state           show session, telemetry and target state
  gatt            list characteristics in registration order
  ibd             encode current indoor bike data frames (0x2AD2) as hex
  feat            read feature characteristic (0x2ACC) as hex
  pr              read supported power range (0x2AD8) as hex
  rr              read supported resistance range (0x2AD6) as hex
  cp <hex>        write to control point (0x2AD9), execute + show response
  sub             stream notifications and indications
  help            this message
  quit            disconnect

control point examples:
  cp 00           Request Control
  cp 01           Reset
  cp 05 e803      Set Target Power 1000 W (0x03e8 LE)
  cp 04 23        Set Target Resistance 3.5
  cp 11 0000 fa00 28 33   Simulation: grade 2.50%, crr 0.0040, cw 0.51
  cp 07           Start or Resume
  cp 08 01        Stop
  cp 08 02        Pause

all values are little-endian hex, matching raw BLE GATT writes.";
