//! Fitness Machine Control Point state machine.
//!
//! Every decoded request produces exactly one response. Accepted `set-*`
//! requests update [`TargetState`], which the trainer side reads on its next
//! tick.

use log::{debug, info};

use crate::protocol::{ControlCommand, ControlResponse, ResultCode, SimulationParameters};
use crate::Capability;

/// Setpoints requested by the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetState {
    /// Target power in watts
    pub power: Option<i16>,
    /// Target resistance level (unitless * 10)
    pub resistance_level: Option<u8>,
    pub simulation: Option<SimulationParameters>,
    /// Set by start/resume, cleared by stop/pause and reset
    pub running: bool,
    /// Set once a central has issued Request Control
    pub control_granted: bool,
}

/// Control point procedure state. Every request today completes in a single
/// frame, so `Idle` is the only state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcedureState {
    #[default]
    Idle,
}

#[derive(Debug, Default)]
pub struct ControlPoint {
    state: ProcedureState,
    targets: TargetState,
    /// Reject `set-*` requests with ControlNotPermitted until the central has
    /// requested control. Off by default: most clients never ask.
    require_control: bool,
}

impl ControlPoint {
    pub fn new(require_control: bool) -> Self {
        Self {
            require_control,
            ..Default::default()
        }
    }

    pub fn state(&self) -> ProcedureState {
        self.state
    }

    pub fn targets(&self) -> TargetState {
        self.targets
    }

    /// Drop the control grant, e.g. when the central goes away.
    pub fn release(&mut self) {
        if self.targets.control_granted {
            info!("FTMS: control released");
        }
        self.targets.control_granted = false;
    }

    /// Apply one control point request and return its response.
    pub fn handle(&mut self, cmd: &ControlCommand, capability: Capability) -> ControlResponse {
        let result = match self.state {
            ProcedureState::Idle => self.handle_idle(cmd, capability),
        };
        debug!("FTMS: opcode 0x{:02x} -> {:?}", cmd.opcode(), result);
        ControlResponse {
            opcode: cmd.opcode(),
            result,
        }
    }

    fn handle_idle(&mut self, cmd: &ControlCommand, capability: Capability) -> ResultCode {
        match cmd {
            ControlCommand::RequestControl => {
                info!("FTMS: client requested control");
                self.targets.control_granted = true;
                ResultCode::Success
            }
            ControlCommand::Reset => {
                info!("FTMS: reset");
                self.targets = TargetState::default();
                ResultCode::Success
            }
            ControlCommand::StartOrResume => {
                info!("FTMS: start/resume");
                self.targets.running = true;
                ResultCode::Success
            }
            ControlCommand::StopOrPause(param) => {
                info!("FTMS: stop/pause (param={})", param);
                self.targets.running = false;
                ResultCode::Success
            }
            ControlCommand::SetTargetPower(watts) => self.set_target(capability, |t| {
                info!("FTMS: set target power to {} W", watts);
                t.power = Some(*watts);
            }),
            ControlCommand::SetTargetResistanceLevel(level) => self.set_target(capability, |t| {
                info!("FTMS: set target resistance to {:.1}", *level as f64 / 10.0);
                t.resistance_level = Some(*level);
            }),
            ControlCommand::SetIndoorBikeSimulation(sim) => self.set_target(capability, |t| {
                info!(
                    "FTMS: simulation grade {:.2}%, wind {:.3} m/s, crr {:.4}, cw {:.2}",
                    sim.grade as f64 / 100.0,
                    sim.wind_speed as f64 / 1000.0,
                    sim.crr as f64 / 10000.0,
                    sim.cw as f64 / 100.0
                );
                t.simulation = Some(*sim);
            }),
            ControlCommand::SetTargetSpeed(_)
            | ControlCommand::SetTargetInclination(_)
            | ControlCommand::SetTargetHeartRate(_)
            | ControlCommand::SetTargetedExpendedEnergy(_)
            | ControlCommand::SetTargetedSteps(_)
            | ControlCommand::SetTargetedStrides(_)
            | ControlCommand::SetTargetedDistance(_)
            | ControlCommand::SetTargetedTrainingTime(_)
            | ControlCommand::SetTargetedTimeInTwoZones(_)
            | ControlCommand::SetTargetedTimeInThreeZones(_)
            | ControlCommand::SetTargetedTimeInFiveZones(_)
            | ControlCommand::SetWheelCircumference(_)
            | ControlCommand::SpinDownControl(_)
            | ControlCommand::SetTargetedCadence(_) => {
                info!("FTMS: opcode 0x{:02x} not supported", cmd.opcode());
                ResultCode::NotSupported
            }
        }
    }

    fn set_target(
        &mut self,
        capability: Capability,
        apply: impl FnOnce(&mut TargetState),
    ) -> ResultCode {
        if !capability.controllable {
            return ResultCode::NotSupported;
        }
        if self.require_control && !self.targets.control_granted {
            return ResultCode::ControlNotPermitted;
        }
        apply(&mut self.targets);
        ResultCode::Success
    }
}
