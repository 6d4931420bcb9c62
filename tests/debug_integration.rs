//! End-to-end tests via the TCP debug server.
//!
//! Each test starts the engine on an in-memory transport plus a debug server
//! on an ephemeral port, then talks to it exactly like `nc` would:
//! raw FTMS control point bytes in, hex indications and state out.
//!
//! Run: cargo test --test debug_integration

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::TestEngine;
use ftms_bike::debug_server;
use ftms_bike::Capability;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const CONTROLLABLE: Capability = Capability { controllable: true };
const PASSIVE: Capability = Capability { controllable: false };
const NO_TICKS: Duration = Duration::from_secs(3600);

struct DebugClient {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl DebugClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap_or_else(|e| panic!("Failed to connect to debug server on {}: {}", port, e));

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader).lines();

        // Consume the welcome line
        let welcome = reader.next_line().await.unwrap().unwrap();
        assert!(
            welcome.contains("connected"),
            "Expected welcome message, got: {}",
            welcome
        );

        Self { reader, writer }
    }

    /// Send a command and collect response lines until the server goes quiet.
    async fn send_cmd(&mut self, cmd: &str) -> Vec<String> {
        self.send_cmd_timeout(cmd, Duration::from_millis(300)).await
    }

    async fn send_cmd_timeout(&mut self, cmd: &str, timeout: Duration) -> Vec<String> {
        self.writer
            .write_all(format!("{}\n", cmd).as_bytes())
            .await
            .unwrap();

        let mut lines = Vec::new();
        // The prompt has no newline, so it prefixes the first line of the
        // next response.
        loop {
            match tokio::time::timeout(timeout, self.reader.next_line()).await {
                Ok(Ok(Some(line))) => {
                    let clean = line.trim().trim_start_matches("ftms-debug>").trim().to_string();
                    if !clean.is_empty() {
                        lines.push(clean);
                    }
                }
                Ok(Ok(None)) => break, // EOF
                Ok(Err(_)) => break,
                Err(_) => break, // Timeout, no more lines
            }
        }
        lines
    }

    /// Extract the hex response from a "resp XXXX" line.
    fn extract_resp(lines: &[String]) -> Option<String> {
        lines
            .iter()
            .find(|l| l.starts_with("resp "))
            .map(|l| l.trim_start_matches("resp ").to_string())
    }

    /// Parse the "state" response into key-value pairs.
    fn parse_state(lines: &[String]) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for line in lines {
            if let Some((key, val)) = line.split_once(':') {
                map.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        map
    }
}

/// Engine plus debug server on an ephemeral port.
async fn start(capability: Capability) -> (TestEngine, u16) {
    let engine = TestEngine::start(capability, false, NO_TICKS);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(debug_server::serve(listener, engine.handle.clone()));
    (engine, port)
}

#[tokio::test]
async fn test_read_state() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("state").await;
    let state = DebugClient::parse_state(&lines);
    assert_eq!(state["name"], "M 1");
    assert!(state["session"].starts_with("Advertising"));
    assert_eq!(state["cadence"], "80 rpm");
    assert_eq!(state["power"], "150 W");
    assert_eq!(state["target power"], "-");
}

#[tokio::test]
async fn test_read_feature_and_ranges() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    assert_eq!(client.send_cmd("feat").await, vec!["feat 824000000c200000"]);
    // 0..1400 W step 1
    assert_eq!(client.send_cmd("pr").await, vec!["range 000078050100"]);
    // 0..70 step 1
    assert_eq!(client.send_cmd("rr").await, vec!["range 000046000100"]);
}

#[tokio::test]
async fn test_not_controllable_device() {
    let (_engine, port) = start(PASSIVE).await;
    let mut client = DebugClient::connect(port).await;

    assert_eq!(client.send_cmd("feat").await, vec!["feat 0240000000000000"]);
    let lines = client.send_cmd("pr").await;
    assert!(lines[0].contains("not exposed"), "got {:?}", lines);

    let lines = client.send_cmd("cp 05 e803").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800502"));
}

#[tokio::test]
async fn test_gatt_lists_characteristics_in_order() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("gatt").await;
    let names: Vec<&str> = lines
        .iter()
        .skip(1)
        .filter_map(|l| l.split_whitespace().nth(1))
        .collect();
    assert_eq!(
        names,
        vec![
            "indoor-bike-data",
            "control-point",
            "feature",
            "machine-status",
            "power-range",
            "resistance-range",
        ]
    );
}

#[tokio::test]
async fn test_ibd_encodes_current_telemetry() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    // 80 rpm -> 160 half-rpm, 150 W, speed 500
    assert_eq!(
        client.send_cmd("ibd").await,
        vec!["data 4500a0009600", "data 0000f401"]
    );
}

#[tokio::test]
async fn test_request_control() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("cp 00").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800001"));

    let state = DebugClient::parse_state(&client.send_cmd("state").await);
    assert_eq!(state["control granted"], "true");
}

#[tokio::test]
async fn test_set_target_power_and_observe() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("cp 05 e803").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800501"));

    let state = DebugClient::parse_state(&client.send_cmd("state").await);
    assert_eq!(state["target power"], "1000 W");
}

#[tokio::test]
async fn test_set_resistance_and_simulation() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("cp 04 23").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800401"));

    let lines = client.send_cmd("cp 11 0000 fa00 28 33").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("801101"));

    let state = DebugClient::parse_state(&client.send_cmd("state").await);
    assert_eq!(state["target resistance"], "3.5");
    assert!(state["simulation"].starts_with("grade 2.50%"), "got {}", state["simulation"]);
}

#[tokio::test]
async fn test_unsupported_opcode_returns_not_supported() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    // Set Target Speed is valid FTMS but not offered by a bike
    let lines = client.send_cmd("cp 02 f401").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800202"));
}

#[tokio::test]
async fn test_undecodable_writes_get_no_response() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    for cmd in ["cp ff", "cp 05 01", "cp 11 0000"] {
        let lines = client.send_cmd(cmd).await;
        assert_eq!(DebugClient::extract_resp(&lines), None, "{} -> {:?}", cmd, lines);
        assert!(lines.iter().any(|l| l == "no response"), "{} -> {:?}", cmd, lines);
    }

    // Still responsive afterwards
    let lines = client.send_cmd("cp 07").await;
    assert_eq!(DebugClient::extract_resp(&lines).as_deref(), Some("800701"));
}

#[tokio::test]
async fn test_sub_streams_indications() {
    let (engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let lines = client.send_cmd("sub").await;
    assert!(lines[0].starts_with("subscribed"), "got {:?}", lines);

    engine.handle.write_control_point(vec![0x00]).await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(1), client.reader.next_line())
        .await
        .expect("notification line")
        .unwrap()
        .unwrap();
    assert_eq!(line, "control-point 800001");
}

// ---- Fuzz / chaos tests ----
// These hammer the server with garbage to verify it never crashes or hangs.

#[tokio::test]
async fn test_garbage_commands() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let long = "a".repeat(10000);
    let garbage = [
        " ",
        "asdfghjkl",
        "../../etc/passwd",
        "cp",      // cp with no hex
        "cp xyz",  // invalid hex
        "cp 0",    // odd-length hex
        "cp -1",
        "stat",    // close but wrong
        long.as_str(),
    ];

    for cmd in &garbage {
        let lines = client.send_cmd_timeout(cmd, Duration::from_millis(100)).await;
        assert!(lines.iter().all(|l| !l.starts_with("resp ")), "{} -> {:?}", cmd, lines);
    }

    let lines = client.send_cmd("cp zz").await;
    assert!(lines[0].starts_with("error: invalid hex"), "got {:?}", lines);

    // Mixed case is lowercased
    let state = DebugClient::parse_state(&client.send_cmd("sTaTe").await);
    assert_eq!(state["name"], "M 1");
}

#[tokio::test]
async fn test_all_single_byte_opcodes() {
    let (_engine, port) = start(CONTROLLABLE).await;
    let mut client = DebugClient::connect(port).await;

    let mut responses = 0;
    for byte in 0u8..=255 {
        let lines = client
            .send_cmd_timeout(&format!("cp {:02x}", byte), Duration::from_millis(50))
            .await;
        if let Some(r) = DebugClient::extract_resp(&lines) {
            assert_eq!(r.len(), 6, "response should be 3 bytes, got: {}", r);
            assert!(r.starts_with("80"), "response should start with 0x80, got: {}", r);
            responses += 1;
        }
    }

    // Only the parameterless opcodes decode from one byte
    assert_eq!(responses, 3, "00 01 07 answer on their own");
    assert_eq!(client.send_cmd("feat").await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_connections() {
    let (_engine, port) = start(CONTROLLABLE).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(tokio::spawn(async move {
            let mut client = DebugClient::connect(port).await;
            assert!(!client.send_cmd("state").await.is_empty(), "connection {} state", i);
            assert_eq!(client.send_cmd("feat").await.len(), 1, "connection {} feat", i);
            client.send_cmd("quit").await;
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle.await.unwrap_or_else(|e| panic!("Connection {} panicked: {}", i, e));
    }
}
