pub mod sensor;
pub mod sensor_aggregate;
pub mod sensor_event;

pub use sensor::{Sensor, SensorCredentials, SensorSummary};
pub use sensor_aggregate::SensorAggregate;
pub use sensor_event::{DataType, EventKind, SensorEvent, SensorPayload};
