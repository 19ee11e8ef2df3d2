pub mod benchmark;
pub mod configuration;
pub mod counter;
pub mod report;
pub mod sync;
pub mod worker;
