//! Glue and boundary adapters (component I): thin translation between wire
//! formats and the core components (A–H). No business logic lives here —
//! each function only maps a request shape to a core call and a core result
//! back to a response shape.

mod bus_stream;
mod controller;

pub use bus_stream::{BusEventEnvelope, forward_to_sink};
pub use controller::{ControllerRequest, ControllerResponse, handle_request};
