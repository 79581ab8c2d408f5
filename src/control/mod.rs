mod driver;
mod logic;

pub use driver::spawn_control_driver;
pub use logic::{ramp_down, ramp_up, ActivePowerControl, ControlLogic, ControlPlant, Mode};
