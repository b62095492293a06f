pub mod actor;
pub mod decision;
pub mod driver_request;
pub mod event;
pub mod journey;
pub mod passenger_request;
pub mod seen;
