pub mod clock;
pub mod clock_sync;
pub mod sample_ring;
