pub mod deviation;
pub mod device;
pub mod profile;
pub mod trim;
