mod error;
mod record;
mod topic;
mod types;
mod util;

pub use error::{DecodeError, ErrorKind, LogError};
pub use record::{
    AggregateState, ClickCount, ClickEvent, Codec, DomainRecord, RecordKind, WeatherReading,
    WeatherStats,
};
pub use topic::{
    LogFuture, LogInspector, LogPublisher, LogStorage, LogSubscriber, LogSubscription,
    StorageFactory,
};
pub use types::{Ack, LogQuery, OverflowPolicy, RawRecord};
pub use util::now_ms;
