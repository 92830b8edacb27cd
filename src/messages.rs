/// Everything the transport reports, delivered in order on one channel.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Session (re)established; subscriptions must be renewed.
    Connected,
    /// Connection lost; the transport retries on its own.
    Dropped(/* cause */ String),
    /// Broker refused the session.
    Fatal(/* cause */ String),
    SubscribeFailed(/* cause */ String),
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Follow a different bay in the single-entity view.
    SwitchEntity(String),
    Shutdown,
}
