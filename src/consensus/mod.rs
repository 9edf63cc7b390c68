pub mod difficulty;
pub mod pow;
pub mod validation;

pub use difficulty::{bits_to_target, target_to_bits, DifficultyParams};
pub use pow::{create_block_template, Miner, MinerStatus, StopHandle};
pub use validation::SignaturePolicy;

/// Current wall-clock time in Unix seconds.
pub fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as u32
}
