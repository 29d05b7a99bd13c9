mod monitor_actor;
mod monitor_handle;
mod monitor_helpers;
mod rtt;

pub use monitor_actor::*;
pub use monitor_handle::*;
pub use monitor_helpers::*;
pub use rtt::RoundTripTime;
