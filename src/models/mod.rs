pub mod alert;
pub mod payload;

pub use alert::{AlertRecord, Location, Situation};
pub use payload::AlertPayload;
