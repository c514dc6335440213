pub mod mqtt;
pub mod replay;
pub mod stub;

pub use mqtt::MqttSource;
pub use replay::ReplaySource;
pub use stub::{StubConfig, StubSource};
