//! ---
//! fleetsim_section: "01-core-functionality"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Shared primitives and utilities for the simulator runtime."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use chrono::Utc;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_millis_is_after_2024() {
        // 2024-01-01T00:00:00Z
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}
