//! Session lifecycle: state, toggles, devices, the per-session pipeline and
//! the controller that ties them together

pub mod controller;
pub mod devices;
pub mod pipeline;
pub mod state;
pub mod toggle;

pub use controller::{SessionController, SessionHandle};
pub use devices::{MediaDevices, SystemDevices};
pub use pipeline::{SequenceCounters, SessionEvent, SessionEventKind};
pub use state::{SessionState, StateBus};
pub use toggle::{pump, StdinToggle, ToggleEvent, ToggleListener, ToggleSink};
