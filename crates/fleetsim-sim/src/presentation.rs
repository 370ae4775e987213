//! ---
//! fleetsim_section: "02-simulation"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Console rendering for telemetry ticks."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use crate::telemetry::TelemetryFrame;

const RESET: &str = "\x1b[0m";

/// Coarse battery classification used for console colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryBand {
    Critical,
    Low,
    Healthy,
}

impl BatteryBand {
    pub fn classify(battery_level: f64) -> Self {
        if battery_level < 20.0 {
            BatteryBand::Critical
        } else if battery_level < 50.0 {
            BatteryBand::Low
        } else {
            BatteryBand::Healthy
        }
    }

    fn ansi(&self) -> &'static str {
        match self {
            BatteryBand::Critical => "\x1b[91m",
            BatteryBand::Low => "\x1b[93m",
            BatteryBand::Healthy => "\x1b[92m",
        }
    }

    fn indicator(&self) -> &'static str {
        match self {
            BatteryBand::Critical => "🔴",
            BatteryBand::Low => "🟡",
            BatteryBand::Healthy => "🟢",
        }
    }
}

/// One console line for a tick. `colour` toggles ANSI escapes.
pub fn render_tick(frame: &TelemetryFrame, colour: bool) -> String {
    let band = BatteryBand::classify(frame.battery_level);
    let (open, close) = if colour { (band.ansi(), RESET) } else { ("", "") };
    format!(
        "{} {open}Car {}{close} | Battery: {:5.1}% | Location: ({:.4}, {:.4}) | Speed: {:4.1} km/h",
        band.indicator(),
        frame.vehicle_id,
        frame.battery_level,
        frame.latitude,
        frame.longitude,
        frame.velocity,
    )
}
