pub mod producer;
pub mod serializer;
pub mod topic;


pub use producer::{
    AsyncProducer, ClientOptions, Delivered, DeliveryAck, DeliveryError, KafkaTransport,
    PendingDelivery, ProducerRecord, Transport,
};
pub use serializer::JsonEncoder;
pub use topic::{TopicKind, TopicResolver};
