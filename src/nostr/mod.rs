pub use event::{
    decode_message, ChatMode, CodecError, EventDraft, MessageContent, SubscriptionFilter, Tag,
    WireEvent, DIRECT_MESSAGE_KIND,
};
pub use identity::{
    is_hex_pubkey, AddressKind, DecodedAddress, Identity, KeyPair, SchnorrSigner, SignerError,
    SignerProvider,
};
pub use relay::{
    ConnectionMachine, ConnectionState, Effect, LinkEvent, RelayConfig, RelayConnection,
    RelayUpdate,
};
pub use transport::{
    parse_relay_frame, RelayFrame, RelayTransport, TransportError, TransportResult,
    TransportSignal, WsTransport,
};

mod event;
mod identity;
mod relay;
mod transport;
