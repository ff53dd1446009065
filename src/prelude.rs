pub use crate::config::Config;
pub use crate::consumer::{AckTracker, Consumer, DeliveryHandler};
pub use crate::error::{DropReason, Error, Result};
pub use crate::io::{MessageBuffer, RingBuffer};
pub use crate::producer::{BufferPolicy, Producer, PublishMode};
pub use crate::supervisor::{ConnState, ConnectionSupervisor};
pub use crate::transport::{
    Channel, CloseHook, ConsumeSpec, Delivery, DeliverySink, Session, Transport,
};
pub use crate::utils::logger::LoggerConfig;
