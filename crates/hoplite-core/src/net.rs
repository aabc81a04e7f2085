//! Shared networking helpers for the probe engines.

use rand::Rng;

/// Start of the probe source-port pool.
const BASE_PORT: u16 = 30000;
/// Size of the probe source-port pool.
const PORT_RANGE: u16 = 10000;

/// Picks a random probe source port from `[30000, 40000)`.
pub fn random_probe_port() -> u16 {
    BASE_PORT + rand::thread_rng().gen_range(0..PORT_RANGE)
}
