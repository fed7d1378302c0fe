pub mod clock;
pub mod config;
pub mod error;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, FleetConfig};
pub use error::{FleetError, Result};
pub use ids::*;
