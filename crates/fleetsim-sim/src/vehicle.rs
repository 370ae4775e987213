//! ---
//! fleetsim_section: "02-simulation"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Vehicle state model and random-walk movement."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::f64::consts::TAU;

use rand::prelude::*;

/// Per-axis displacement scale in degrees, roughly 100 m.
const STEP_DEGREES: f64 = 0.001;
const INITIAL_BATTERY_MIN: f64 = 20.0;
const INITIAL_BATTERY_MAX: f64 = 100.0;
const DRAIN_MIN: f64 = 0.1;
const DRAIN_MAX: f64 = 0.5;
const VELOCITY_MAX: f64 = 60.0;

/// Rectangular latitude/longitude region, inclusive on every edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

/// Approximate Manhattan bounding box.
pub const MANHATTAN: GeoBounds = GeoBounds {
    lat_min: 40.700,
    lat_max: 40.850,
    lon_min: -74.020,
    lon_max: -73.930,
};

impl GeoBounds {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }

    /// Hard clamp onto the box edges.
    pub fn clamp(&self, latitude: f64, longitude: f64) -> (f64, f64) {
        (
            latitude.clamp(self.lat_min, self.lat_max),
            longitude.clamp(self.lon_min, self.lon_max),
        )
    }
}

/// Human-readable identifier for the 1-based vehicle `index`, e.g. `CAR-007`.
pub fn vehicle_id(index: usize) -> String {
    format!("CAR-{index:03}")
}

/// Physical state of one vehicle at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleState {
    pub latitude: f64,
    pub longitude: f64,
    /// Percentage in `[0, 100]`.
    pub battery_level: f64,
    /// km/h in `[0, 60]`.
    pub velocity: f64,
    /// Radians. Drawn at creation but not consulted by movement.
    pub heading: f64,
}

/// One simulated car.
///
/// Owns its random source so that each vehicle evolves independently and can
/// be replayed from a seed.
#[derive(Debug, Clone)]
pub struct Vehicle {
    id: String,
    state: VehicleState,
    bounds: GeoBounds,
    rng: StdRng,
}

impl Vehicle {
    /// Create a vehicle with a randomised initial state inside [`MANHATTAN`].
    pub fn spawn(id: impl Into<String>, mut rng: StdRng) -> Self {
        let bounds = MANHATTAN;
        let state = VehicleState {
            latitude: rng.gen_range(bounds.lat_min..=bounds.lat_max),
            longitude: rng.gen_range(bounds.lon_min..=bounds.lon_max),
            battery_level: rng.gen_range(INITIAL_BATTERY_MIN..=INITIAL_BATTERY_MAX),
            velocity: rng.gen_range(0.0..=VELOCITY_MAX),
            heading: rng.gen_range(0.0..TAU),
        };
        Self {
            id: id.into(),
            state,
            bounds,
            rng,
        }
    }

    pub fn seeded(id: impl Into<String>, seed: u64) -> Self {
        Self::spawn(id, StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy(id: impl Into<String>) -> Self {
        Self::spawn(id, StdRng::from_entropy())
    }

    /// Create a vehicle from an explicit state, clamped into the model's domain.
    pub fn with_state(id: impl Into<String>, state: VehicleState, rng: StdRng) -> Self {
        let bounds = MANHATTAN;
        let (latitude, longitude) = bounds.clamp(state.latitude, state.longitude);
        Self {
            id: id.into(),
            state: VehicleState {
                latitude,
                longitude,
                battery_level: state.battery_level.clamp(0.0, INITIAL_BATTERY_MAX),
                velocity: state.velocity.clamp(0.0, VELOCITY_MAX),
                heading: state.heading,
            },
            bounds,
            rng,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// Advance the vehicle by one tick.
    ///
    /// Isotropic random walk on both axes, clamped to the bounds; battery drains
    /// by a random amount and never recovers; velocity is resampled from scratch.
    pub fn update(&mut self) {
        let d_lat = STEP_DEGREES * self.rng.gen_range(-1.0..=1.0);
        let d_lon = STEP_DEGREES * self.rng.gen_range(-1.0..=1.0);
        let (latitude, longitude) = self
            .bounds
            .clamp(self.state.latitude + d_lat, self.state.longitude + d_lon);
        self.state.latitude = latitude;
        self.state.longitude = longitude;

        let amount = self.rng.gen_range(DRAIN_MIN..=DRAIN_MAX);
        self.state.battery_level = drain(self.state.battery_level, amount);

        self.state.velocity = self.rng.gen_range(0.0..=VELOCITY_MAX);
    }
}

fn drain(level: f64, amount: f64) -> f64 {
    (level - amount).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEEDS: [u64; 6] = [0, 1, 7, 42, 1337, 0xA11CE];

    #[test]
    fn vehicle_ids_are_zero_padded_and_one_based() {
        assert_eq!(vehicle_id(1), "CAR-001");
        assert_eq!(vehicle_id(42), "CAR-042");
        assert_eq!(vehicle_id(1000), "CAR-1000");
    }

    #[test]
    fn spawn_draws_within_initial_ranges() {
        for seed in 0..200 {
            let car = Vehicle::seeded("CAR-001", seed);
            let state = car.state();
            assert!(MANHATTAN.contains(state.latitude, state.longitude));
            assert!((20.0..=100.0).contains(&state.battery_level));
            assert!((0.0..=60.0).contains(&state.velocity));
            assert!((0.0..TAU).contains(&state.heading));
        }
    }

    #[test]
    fn position_stays_inside_bounds_for_every_update() {
        for seed in SEEDS {
            let mut car = Vehicle::seeded("CAR-001", seed);
            for _ in 0..5_000 {
                car.update();
                let state = car.state();
                assert!(
                    MANHATTAN.contains(state.latitude, state.longitude),
                    "seed {seed} escaped bounds: {state:?}"
                );
            }
        }
    }

    #[test]
    fn walk_from_a_corner_is_clamped_not_wrapped() {
        let corner = VehicleState {
            latitude: MANHATTAN.lat_max,
            longitude: MANHATTAN.lon_min,
            battery_level: 50.0,
            velocity: 10.0,
            heading: 0.0,
        };
        let mut car = Vehicle::with_state("CAR-001", corner, StdRng::seed_from_u64(3));
        car.update();
        let state = car.state();
        // A wrap or reflection would move further than one step from the corner.
        assert!(MANHATTAN.lat_max - state.latitude <= STEP_DEGREES);
        assert!(state.longitude - MANHATTAN.lon_min <= STEP_DEGREES);
        for _ in 0..1_000 {
            car.update();
            let state = car.state();
            assert!(state.latitude <= MANHATTAN.lat_max);
            assert!(state.longitude >= MANHATTAN.lon_min);
        }
    }

    #[test]
    fn battery_never_increases_and_never_goes_negative() {
        for seed in SEEDS {
            let mut car = Vehicle::seeded("CAR-002", seed);
            let mut previous = car.state().battery_level;
            for _ in 0..1_000 {
                car.update();
                let level = car.state().battery_level;
                assert!(level <= previous);
                assert!(level >= 0.0);
                previous = level;
            }
        }
    }

    #[test]
    fn velocity_is_resampled_within_domain() {
        let mut car = Vehicle::seeded("CAR-003", 11);
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..500 {
            car.update();
            let velocity = car.state().velocity;
            assert!((0.0..=60.0).contains(&velocity));
            distinct.insert(velocity.to_bits());
        }
        assert!(distinct.len() > 400);
    }

    #[test]
    fn worst_case_drain_reaches_exactly_zero_after_two_hundred_ticks() {
        let mut level = 100.0;
        for _ in 0..200 {
            level = drain(level, DRAIN_MAX);
            assert!(level >= 0.0);
        }
        assert_eq!(level, 0.0);
        assert_eq!(drain(level, DRAIN_MAX), 0.0);
    }

    #[test]
    fn full_battery_drains_within_expected_envelope() {
        let full = VehicleState {
            latitude: 40.75,
            longitude: -73.98,
            battery_level: 100.0,
            velocity: 0.0,
            heading: 0.0,
        };
        let mut car = Vehicle::with_state("CAR-001", full, StdRng::seed_from_u64(9));
        for _ in 0..200 {
            car.update();
        }
        let level = car.state().battery_level;
        assert!(level >= 0.0);
        assert!(level <= 100.0 - 200.0 * DRAIN_MIN + 1e-9);

        for _ in 0..1_000 {
            car.update();
        }
        assert_eq!(car.state().battery_level, 0.0);
    }

    #[test]
    fn with_state_clamps_out_of_domain_values() {
        let wild = VehicleState {
            latitude: 0.0,
            longitude: 0.0,
            battery_level: 180.0,
            velocity: -5.0,
            heading: 1.0,
        };
        let car = Vehicle::with_state("CAR-009", wild, StdRng::seed_from_u64(1));
        let state = car.state();
        assert_eq!(state.latitude, MANHATTAN.lat_min);
        assert_eq!(state.longitude, MANHATTAN.lon_max);
        assert_eq!(state.battery_level, 100.0);
        assert_eq!(state.velocity, 0.0);
    }

    #[test]
    fn same_seed_replays_the_same_walk() {
        let mut a = Vehicle::seeded("CAR-001", 99);
        let mut b = Vehicle::seeded("CAR-001", 99);
        for _ in 0..50 {
            a.update();
            b.update();
        }
        assert_eq!(a.state(), b.state());
    }
}
