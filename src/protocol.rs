//! FTMS (Fitness Machine Service) binary protocol encoding/decoding for the
//! indoor bike profile.
//!
//! All multi-byte values are little-endian per the Bluetooth GATT specification.
//! Units follow the FTMS spec: speed in km/h * 100, cadence in rpm * 2,
//! power in watts, grade in % * 100.

use thiserror::Error;
use uuid::Uuid;

use crate::Capability;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

// FTMS service and characteristic UUIDs
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);
pub const RESISTANCE_RANGE_UUID: Uuid = ble_uuid(0x2AD6);
pub const POWER_RANGE_UUID: Uuid = ble_uuid(0x2AD8);
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

/// Client Characteristic Configuration descriptor.
pub const CCCD_UUID: Uuid = ble_uuid(0x2902);

// Supported ranges advertised by a controllable trainer
pub const POWER_RANGE: (i16, i16, u16) = (0, 1400, 1);
pub const RESISTANCE_RANGE: (i16, i16, u16) = (0, 70, 1);

pub const RESPONSE_CODE: u8 = 0x80;

/// Control Point result codes (FTMS spec Table 4.24)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0x01,
    NotSupported = 0x02,
    InvalidParameter = 0x03,
    OperationFailed = 0x04,
    ControlNotPermitted = 0x05,
}

/// Indoor bike simulation parameters (opcode 0x11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulationParameters {
    /// Wind speed in m/s * 1000
    pub wind_speed: i16,
    /// Grade in percent * 100
    pub grade: i16,
    /// Coefficient of rolling resistance * 10000
    pub crr: u8,
    /// Wind resistance coefficient in kg/m * 100
    pub cw: u8,
}

/// A decoded Fitness Machine Control Point request.
///
/// One variant per opcode defined by the FTMS profile; each carries only the
/// payload that opcode defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    RequestControl,
    Reset,
    SetTargetSpeed(u16),           // km/h * 100
    SetTargetInclination(i16),     // percent * 10
    SetTargetResistanceLevel(u8),  // unitless * 10
    SetTargetPower(i16),           // watts
    SetTargetHeartRate(u8),        // bpm
    StartOrResume,
    StopOrPause(u8),               // 1=stop, 2=pause
    SetTargetedExpendedEnergy(u16),
    SetTargetedSteps(u16),
    SetTargetedStrides(u16),
    SetTargetedDistance(u32),      // uint24 meters
    SetTargetedTrainingTime(u16),  // seconds
    SetTargetedTimeInTwoZones([u16; 2]),
    SetTargetedTimeInThreeZones([u16; 3]),
    SetTargetedTimeInFiveZones([u16; 5]),
    SetIndoorBikeSimulation(SimulationParameters),
    SetWheelCircumference(u16),    // mm * 10
    SpinDownControl(u8),           // 1=start, 2=ignore
    SetTargetedCadence(u16),       // rpm * 2
}

impl ControlCommand {
    /// The request opcode this command was decoded from.
    pub fn opcode(&self) -> u8 {
        match self {
            ControlCommand::RequestControl => 0x00,
            ControlCommand::Reset => 0x01,
            ControlCommand::SetTargetSpeed(_) => 0x02,
            ControlCommand::SetTargetInclination(_) => 0x03,
            ControlCommand::SetTargetResistanceLevel(_) => 0x04,
            ControlCommand::SetTargetPower(_) => 0x05,
            ControlCommand::SetTargetHeartRate(_) => 0x06,
            ControlCommand::StartOrResume => 0x07,
            ControlCommand::StopOrPause(_) => 0x08,
            ControlCommand::SetTargetedExpendedEnergy(_) => 0x09,
            ControlCommand::SetTargetedSteps(_) => 0x0A,
            ControlCommand::SetTargetedStrides(_) => 0x0B,
            ControlCommand::SetTargetedDistance(_) => 0x0C,
            ControlCommand::SetTargetedTrainingTime(_) => 0x0D,
            ControlCommand::SetTargetedTimeInTwoZones(_) => 0x0E,
            ControlCommand::SetTargetedTimeInThreeZones(_) => 0x0F,
            ControlCommand::SetTargetedTimeInFiveZones(_) => 0x10,
            ControlCommand::SetIndoorBikeSimulation(_) => 0x11,
            ControlCommand::SetWheelCircumference(_) => 0x12,
            ControlCommand::SpinDownControl(_) => 0x13,
            ControlCommand::SetTargetedCadence(_) => 0x14,
        }
    }
}

/// Why an inbound control point frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty control point frame")]
    Empty,

    #[error("opcode 0x{opcode:02x} needs {needed} payload bytes, got {got}")]
    Truncated { opcode: u8, needed: usize, got: usize },

    #[error("unknown control point opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

/// A control point response, sent back as an indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub opcode: u8,
    pub result: ResultCode,
}

impl ControlResponse {
    pub fn encode(&self) -> [u8; 3] {
        encode_control_response(self.opcode, self.result)
    }
}

/// Encode FTMS Feature characteristic (0x2ACC).
///
/// Fitness Machine Features (uint32 LE):
///   - Bit 1: Cadence Supported
///   - Bit 7: Resistance Level Supported (controllable only)
///   - Bit 14: Power Measurement Supported
///
/// Target Setting Features (uint32 LE), controllable only:
///   - Bit 2: Resistance Target Setting Supported
///   - Bit 3: Power Target Setting Supported
///   - Bit 13: Indoor Bike Simulation Parameters Supported
pub fn encode_feature(capability: Capability) -> [u8; 8] {
    let (machine_features, target_features): (u32, u32) = if capability.controllable {
        (0x0000_4082, 0x0000_200C)
    } else {
        (0x0000_4002, 0x0000_0000)
    };
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Encode a Supported Range characteristic (power 0x2AD8, resistance 0x2AD6).
///
/// Layout: sint16 minimum, sint16 maximum, uint16 increment.
pub fn encode_range(min: i16, max: i16, step: u16) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&min.to_le_bytes());
    buf[2..4].copy_from_slice(&max.to_le_bytes());
    buf[4..6].copy_from_slice(&step.to_le_bytes());
    buf
}

/// Expended energy block of the Indoor Bike Data characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpendedEnergy {
    pub total_kcal: u16,
    pub per_hour_kcal: u16,
    pub per_minute_kcal: u8,
}

/// Indoor Bike Data characteristic (0x2AD2) field set.
///
/// Only fields that are `Some` are written; the flags word is derived from
/// which fields are present. Note the inverted meaning of bit 0 ("More Data"):
/// instantaneous speed is present when the bit is clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndoorBikeData {
    pub speed: Option<u16>,
    pub average_speed: Option<u16>,
    pub cadence: Option<u16>,
    pub average_cadence: Option<u16>,
    pub total_distance: Option<u32>,
    pub resistance_level: Option<i16>,
    pub power: Option<i16>,
    pub average_power: Option<i16>,
    pub expended_energy: Option<ExpendedEnergy>,
    pub heart_rate: Option<u8>,
    pub metabolic_equivalent: Option<u8>,
    pub elapsed_time: Option<u16>,
    pub remaining_time: Option<u16>,
}

impl IndoorBikeData {
    pub fn flags(&self) -> u16 {
        let present = [
            self.speed.is_none(),
            self.average_speed.is_some(),
            self.cadence.is_some(),
            self.average_cadence.is_some(),
            self.total_distance.is_some(),
            self.resistance_level.is_some(),
            self.power.is_some(),
            self.average_power.is_some(),
            self.expended_energy.is_some(),
            self.heart_rate.is_some(),
            self.metabolic_equivalent.is_some(),
            self.elapsed_time.is_some(),
            self.remaining_time.is_some(),
        ];
        present
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .fold(0u16, |flags, (bit, _)| flags | (1 << bit))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.flags().to_le_bytes());

        if let Some(v) = self.speed {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.average_speed {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.cadence {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.average_cadence {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.total_distance {
            // uint24
            buf.extend_from_slice(&v.to_le_bytes()[..3]);
        }
        if let Some(v) = self.resistance_level {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.power {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.average_power {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(e) = self.expended_energy {
            buf.extend_from_slice(&e.total_kcal.to_le_bytes());
            buf.extend_from_slice(&e.per_hour_kcal.to_le_bytes());
            buf.push(e.per_minute_kcal);
        }
        if let Some(v) = self.heart_rate {
            buf.push(v);
        }
        if let Some(v) = self.metabolic_equivalent {
            buf.push(v);
        }
        if let Some(v) = self.elapsed_time {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        if let Some(v) = self.remaining_time {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        buf
    }
}

/// First telemetry notification: flags 0x0045, cadence (rpm * 2), power.
pub fn encode_cadence_power_frame(cadence_rpm: u16, power: i16) -> Vec<u8> {
    IndoorBikeData {
        cadence: Some(cadence_rpm.saturating_mul(2)),
        power: Some(power),
        ..Default::default()
    }
    .encode()
}

/// Second telemetry notification: flags 0x0000, instantaneous speed only.
pub fn encode_speed_frame(speed: u16) -> Vec<u8> {
    IndoorBikeData {
        speed: Some(speed),
        ..Default::default()
    }
    .encode()
}

/// Cursor over a control point payload. Every read is bounds-checked.
struct Payload<'a> {
    opcode: u8,
    bytes: &'a [u8],
}

impl Payload<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        if self.bytes.len() < N {
            return Err(DecodeError::Truncated {
                opcode: self.opcode,
                needed: N,
                got: self.bytes.len(),
            });
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.take::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    fn u24(&mut self) -> Result<u32, DecodeError> {
        self.take::<3>().map(|[b0, b1, b2]| u32::from_le_bytes([b0, b1, b2, 0]))
    }
}

/// Bytes of payload each opcode carries after the opcode byte.
pub fn payload_len(opcode: u8) -> Option<usize> {
    let len = match opcode {
        0x00 | 0x01 | 0x07 => 0,
        0x04 | 0x06 | 0x08 | 0x13 => 1,
        0x02 | 0x03 | 0x05 | 0x09 | 0x0A | 0x0B | 0x0D | 0x12 | 0x14 => 2,
        0x0C => 3,
        0x0E => 4,
        0x0F | 0x11 => 6,
        0x10 => 10,
        _ => return None,
    };
    Some(len)
}

/// Parse an FTMS Control Point write (0x2AD9).
///
/// Trailing bytes beyond the opcode's payload are ignored.
pub fn decode_control_command(bytes: &[u8]) -> Result<ControlCommand, DecodeError> {
    let (&opcode, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
    let needed = payload_len(opcode).ok_or(DecodeError::UnknownOpcode(opcode))?;
    if payload.len() < needed {
        return Err(DecodeError::Truncated {
            opcode,
            needed,
            got: payload.len(),
        });
    }

    let mut p = Payload { opcode, bytes: payload };
    let cmd = match opcode {
        0x00 => ControlCommand::RequestControl,
        0x01 => ControlCommand::Reset,
        0x02 => ControlCommand::SetTargetSpeed(p.u16()?),
        0x03 => ControlCommand::SetTargetInclination(p.i16()?),
        0x04 => ControlCommand::SetTargetResistanceLevel(p.u8()?),
        0x05 => ControlCommand::SetTargetPower(p.i16()?),
        0x06 => ControlCommand::SetTargetHeartRate(p.u8()?),
        0x07 => ControlCommand::StartOrResume,
        0x08 => ControlCommand::StopOrPause(p.u8()?),
        0x09 => ControlCommand::SetTargetedExpendedEnergy(p.u16()?),
        0x0A => ControlCommand::SetTargetedSteps(p.u16()?),
        0x0B => ControlCommand::SetTargetedStrides(p.u16()?),
        0x0C => ControlCommand::SetTargetedDistance(p.u24()?),
        0x0D => ControlCommand::SetTargetedTrainingTime(p.u16()?),
        0x0E => ControlCommand::SetTargetedTimeInTwoZones([p.u16()?, p.u16()?]),
        0x0F => ControlCommand::SetTargetedTimeInThreeZones([p.u16()?, p.u16()?, p.u16()?]),
        0x10 => ControlCommand::SetTargetedTimeInFiveZones([
            p.u16()?,
            p.u16()?,
            p.u16()?,
            p.u16()?,
            p.u16()?,
        ]),
        0x11 => ControlCommand::SetIndoorBikeSimulation(SimulationParameters {
            wind_speed: p.i16()?,
            grade: p.i16()?,
            crr: p.u8()?,
            cw: p.u8()?,
        }),
        0x12 => ControlCommand::SetWheelCircumference(p.u16()?),
        0x13 => ControlCommand::SpinDownControl(p.u8()?),
        0x14 => ControlCommand::SetTargetedCadence(p.u16()?),
        _ => return Err(DecodeError::UnknownOpcode(opcode)),
    };
    Ok(cmd)
}

/// Encode a Control Point response indication.
///
/// Format: `[0x80, request_opcode, result_code]`
pub fn encode_control_response(request_opcode: u8, result: ResultCode) -> [u8; 3] {
    [RESPONSE_CODE, request_opcode, result as u8]
}

/// Encode a Fitness Machine Status notification (0x2ADA) for a command that
/// was just accepted.
///
/// Status opcodes (FTMS spec Table 4.16):
///   0x01 = Reset
///   0x02 = Stopped/Paused by user (param: 0x01=stop, 0x02=pause)
///   0x04 = Started or Resumed by user
///   0x07 = Target Resistance Level Changed (uint8)
///   0x08 = Target Power Changed (sint16 LE)
///   0x12 = Indoor Bike Simulation Parameters Changed
pub fn encode_machine_status(cmd: &ControlCommand) -> Option<Vec<u8>> {
    match cmd {
        ControlCommand::Reset => Some(vec![0x01]),
        ControlCommand::StopOrPause(param) => Some(vec![0x02, *param]),
        ControlCommand::StartOrResume => Some(vec![0x04]),
        ControlCommand::SetTargetResistanceLevel(level) => Some(vec![0x07, *level]),
        ControlCommand::SetTargetPower(watts) => {
            let mut buf = vec![0x08];
            buf.extend_from_slice(&watts.to_le_bytes());
            Some(buf)
        }
        ControlCommand::SetIndoorBikeSimulation(sim) => {
            let mut buf = vec![0x12];
            buf.extend_from_slice(&sim.wind_speed.to_le_bytes());
            buf.extend_from_slice(&sim.grade.to_le_bytes());
            buf.push(sim.crr);
            buf.push(sim.cw);
            Some(buf)
        }
        _ => None,
    }
}
