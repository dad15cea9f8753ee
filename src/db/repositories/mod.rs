mod sensor_aggregates;
mod sensor_events;
mod sensors;
