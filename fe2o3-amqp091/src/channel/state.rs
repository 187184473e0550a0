/// Channel state
///
/// ```text
/// Unopened --open--> Opening --open-ok--> Open --close--> Closing --close-ok--> Closed
///                                          |                                      ^
///                                          +------------ peer close --------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Registered with the connection, `channel.open` not sent yet
    Unopened,

    /// `channel.open` sent
    Opening,

    /// `channel.open-ok` received
    Open,

    /// `channel.close` sent, waiting for `close-ok`
    Closing,

    /// Terminal
    Closed,
}
