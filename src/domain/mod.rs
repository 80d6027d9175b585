mod transport;

pub use transport::{
    //
    Acknowledger,
    Address,
    Binding,
    Delivery,
    Envelope,
    PublishOptions,
    SubscribeOptions,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
    CONTENT_TYPE_JSON,
};
