pub mod events;
pub mod generation;
pub mod jobs;
pub mod providers;
