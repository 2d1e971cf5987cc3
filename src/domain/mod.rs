// Domain layer: scope models and the ports the connection depends on.

pub mod model;
pub mod ports;
