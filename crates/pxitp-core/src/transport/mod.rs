//! Transport layer module.

pub mod hidraw;
pub mod mock;
pub mod observable;
pub mod traits;

pub use hidraw::HidrawTransport;
pub use mock::{MockDevice, MockTransport};
pub use observable::ObservableTransport;
pub use traits::{HidTransport, TransportError};
