// Client-side orchestration engine for an out-of-process billing service.
//
// Many logical requests are multiplexed over a single physical channel that
// has no request/response correlation of its own, so the client serializes
// remote calls on one worker and matches each reply to the call that is
// currently outstanding. The pieces: a connection state machine gating when
// queued work may run, a strict-FIFO pending queue with cancellation, an
// exactly-once delivery contract per request, and a TTL cache in front of
// the remote calls.
pub mod client;
pub mod config;


pub use client::client::{BillingClient, BillingClientBuilder};
pub use client::connection::{
    ChannelEvents, ChannelProxy, ConnectionState, Connector, NoopPurchaseEvents, PurchaseEvents,
    RemoteCall,
};
pub use client::context::{Delivery, ExecutionContext};
pub use client::inventory::CompletionCounter;
pub use client::oneshot::{OneShotListener, SlotRegistry};
pub use client::request::{BillingRequest, Listener};
pub use config::ClientConfig;
