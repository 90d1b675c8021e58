pub mod address;
pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod reader;
pub mod sasl;
pub mod stanza;
pub mod transport;

pub use address::{
    Address, AddressType, MultipleAddresses, MultipleRecipientInfo, Recipients, ServiceDiscovery,
    StanzaSender, multiple_recipient_info,
};
pub use body::{BodyQName, ComposableBody, ComposableBodyBuilder};
pub use config::{BoshConfiguration, BoshConfigurationBuilder, ConfigError, load_config_from};
pub use connection::{BoshConnection, ConnectionState};
pub use error::{BoshError, ConnectionError, PipelineError, SaslError};
pub use event::SessionEvent;
pub use pipeline::{ProcessorContext, ProcessorResult, StanzaPipeline, StanzaProcessor};
pub use reader::{StanzaErrorInfo, StreamErrorInfo, StreamFeatures};
pub use sasl::{
    AttemptContext, SaslAttempt, SaslAttemptError, SaslMechanism, SaslMechanismRegistry,
};
pub use stanza::Stanza;
pub use transport::{
    BoshClient, BoshClientConfig, BoshClientFactory, BoshConnectionListener, BoshMessageEvent,
    BoshRequestListener, BoshResponseListener, ConnectionEvent,
};
