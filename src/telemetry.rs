//! Trainer telemetry state and the policy that advances it once per tick.
//!
//! There is no physical trainer behind this daemon; `DummyRamp` produces
//! slowly climbing values so clients have something to display.

use log::debug;

use crate::protocol;

/// Current trainer readings, read by the codec on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Heart rate in bpm (0 = no sensor)
    pub heart_rate: u8,
    /// Instantaneous power in watts
    pub power: i16,
    /// Cadence in rpm (sent on the wire as rpm * 2)
    pub cadence: u16,
    /// Speed in km/h * 100
    pub speed: u16,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            heart_rate: 0,
            power: 150,
            cadence: 80,
            speed: 500,
        }
    }
}

impl TelemetrySnapshot {
    /// Encode the two Indoor Bike Data notifications sent each tick:
    /// cadence + power first, then speed on its own.
    pub fn encode_frames(&self) -> [Vec<u8>; 2] {
        [
            protocol::encode_cadence_power_frame(self.cadence, self.power),
            protocol::encode_speed_frame(self.speed),
        ]
    }
}

/// How telemetry evolves between ticks.
pub trait TelemetryPolicy: Send {
    fn advance(&mut self, snapshot: &mut TelemetrySnapshot);
}

/// Ramp each value up by a fixed step and wrap back to a floor once it
/// passes its ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyRamp;

impl DummyRamp {
    const CADENCE_MAX: u16 = 120;
    const CADENCE_FLOOR: u16 = 80;
    const POWER_MAX: i16 = 400;
    const POWER_FLOOR: i16 = 150;
    const SPEED_MAX: u16 = 3000;
    const SPEED_FLOOR: u16 = 500;
    const SPEED_STEP: u16 = 100;
}

impl TelemetryPolicy for DummyRamp {
    fn advance(&mut self, s: &mut TelemetrySnapshot) {
        s.cadence = s.cadence.saturating_add(1);
        if s.cadence > Self::CADENCE_MAX {
            s.cadence = Self::CADENCE_FLOOR;
        }

        s.power = s.power.saturating_add(1);
        if s.power > Self::POWER_MAX {
            s.power = Self::POWER_FLOOR;
        }

        s.speed = s.speed.saturating_add(Self::SPEED_STEP);
        if s.speed > Self::SPEED_MAX {
            s.speed = Self::SPEED_FLOOR;
        }

        debug!(
            "Telemetry: cadence={} rpm, power={} W, speed={:.2} km/h",
            s.cadence,
            s.power,
            s.speed as f64 / 100.0
        );
    }
}

/// Telemetry state plus the policy driving it. Owned by the session.
pub struct TelemetryModel {
    snapshot: TelemetrySnapshot,
    policy: Box<dyn TelemetryPolicy>,
}

impl TelemetryModel {
    pub fn new(policy: Box<dyn TelemetryPolicy>) -> Self {
        Self {
            snapshot: TelemetrySnapshot::default(),
            policy,
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot
    }

    /// Advance one tick and return the new readings.
    pub fn tick(&mut self) -> TelemetrySnapshot {
        self.policy.advance(&mut self.snapshot);
        self.snapshot
    }
}

impl Default for TelemetryModel {
    fn default() -> Self {
        Self::new(Box::new(DummyRamp))
    }
}
