use std::{convert::TryInto, sync::Arc, time::Duration};

use fe2o3_amqp091_types::{
    constants::{FRAME_MIN_SIZE, PORT},
    method::MethodTable,
    primitives::FieldTable,
    protocol::Amqp091,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tracing::debug;
use url::Url;

use crate::{auth::SaslProfile, channel::FlowMode};

use super::{
    engine::ConnectionEngine, ConnectionHandle, OpenError, Shared, DEFAULT_CHANNEL_MAX,
    DEFAULT_FRAME_MAX, DEFAULT_HEARTBEAT,
};

/// Default capacity of the control channel shared by the connection and channel handles
pub const DEFAULT_CONTROL_CHAN_BUF: usize = 128;

/// Default time allowed for the whole opening handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for `connection.close-ok`
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default locale
pub const DEFAULT_LOCALE: &str = "en_US";

/// Client properties sent in `connection.start-ok` unless replaced
pub fn default_client_properties() -> FieldTable {
    let capabilities = FieldTable::new()
        .with("publisher_confirms", true)
        .with("exchange_exchange_bindings", true)
        .with("basic.nack", true)
        .with("consumer_cancel_notify", true)
        .with("connection.blocked", true)
        .with("authentication_failure_close", true);
    FieldTable::new()
        .with("product", env!("CARGO_PKG_NAME"))
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("platform", "Rust")
        .with("capabilities", capabilities)
}

/// Connection builder
#[derive(Debug, Clone)]
pub struct Builder {
    /// Virtual host sent in `connection.open`. A path in the url takes precedence.
    pub virtual_host: String,

    /// Authentication. When `None`, credentials are taken from the url, falling back to
    /// `PLAIN` guest/guest.
    pub sasl_profile: Option<SaslProfile>,

    /// Locale sent in `connection.start-ok`
    pub locale: String,

    /// Highest channel id the client asks for, 0 for no limit
    pub channel_max: u16,

    /// Largest frame the client accepts, 0 for no limit
    pub frame_max: u32,

    /// Heartbeat period in seconds the client asks for, 0 to disable
    pub heartbeat: u16,

    /// Properties sent in `connection.start-ok`
    pub client_properties: FieldTable,

    /// Method table used to encode and decode methods
    pub method_table: Arc<dyn MethodTable>,

    /// Bound on the whole opening handshake
    pub handshake_timeout: Duration,

    /// Bound on the wait for `connection.close-ok`
    pub close_timeout: Duration,

    /// Capacity of the control channel
    pub buffer_size: usize,

    /// How [`Channel::set_flow`](crate::Channel::set_flow) behaves on this connection
    pub flow_mode: FlowMode,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default configuration
    pub fn new() -> Self {
        Self {
            virtual_host: String::from("/"),
            sasl_profile: None,
            locale: String::from(DEFAULT_LOCALE),
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: DEFAULT_HEARTBEAT,
            client_properties: default_client_properties(),
            method_table: Arc::new(Amqp091),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            buffer_size: DEFAULT_CONTROL_CHAN_BUF,
            flow_mode: FlowMode::default(),
        }
    }

    /// Virtual host
    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    /// Authentication profile
    pub fn sasl_profile(mut self, profile: impl Into<SaslProfile>) -> Self {
        self.sasl_profile = Some(profile.into());
        self
    }

    /// Locale
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Channel max
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Frame max. Values below the protocol minimum of 4096 are raised to it; 0 asks for
    /// no limit.
    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = match frame_max {
            0 => 0,
            n => n.max(FRAME_MIN_SIZE),
        };
        self
    }

    /// Heartbeat in seconds
    pub fn heartbeat(mut self, heartbeat: u16) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Replaces the client properties
    pub fn client_properties(mut self, properties: FieldTable) -> Self {
        self.client_properties = properties;
        self
    }

    /// Replaces the method table
    pub fn method_table(mut self, table: Arc<dyn MethodTable>) -> Self {
        self.method_table = table;
        self
    }

    /// Handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Close timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Capacity of the control channel
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Flow mode of the channels
    pub fn flow_mode(mut self, flow_mode: FlowMode) -> Self {
        self.flow_mode = flow_mode;
        self
    }

    /// Runs the handshake over an already connected stream and spawns the engine
    pub async fn open_with_stream<Io>(self, stream: Io) -> Result<ConnectionHandle, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel(self.buffer_size);
        let shared = Arc::new(Shared::default());

        let engine = tokio::time::timeout(
            self.handshake_timeout,
            ConnectionEngine::open(stream, &self, control_rx, shared.clone()),
        )
        .await
        .map_err(|_| OpenError::Timeout)??;
        let tune = engine.tune();
        let handle = engine.spawn();

        Ok(ConnectionHandle {
            control: control_tx,
            handle: Some(handle),
            shared,
            table: self.method_table,
            tune,
            flow_mode: self.flow_mode,
        })
    }

    /// Connects to `amqp://[user:password@]host[:port][/vhost]` and opens the connection.
    /// The vhost path segment is percent-decoded, so `%2f` names the default vhost `/`.
    pub async fn open(
        mut self,
        url: impl TryInto<Url, Error = url::ParseError>,
    ) -> Result<ConnectionHandle, OpenError> {
        let url: Url = url.try_into()?;
        match url.scheme() {
            "amqp" => {}
            scheme => return Err(OpenError::InvalidScheme(scheme.to_string())),
        }
        let host = url.host_str().ok_or(OpenError::InvalidDomain)?.to_string();
        let port = url.port().unwrap_or(PORT);

        if self.sasl_profile.is_none() {
            self.sasl_profile = SaslProfile::try_from(&url).ok();
        }
        if let Some(vhost) = virtual_host_from_url(&url) {
            self.virtual_host = vhost;
        }

        debug!(%host, port, vhost = %self.virtual_host, "Connecting");
        let stream = TcpStream::connect((host.as_str(), port)).await?; // std::io::Error
        stream.set_nodelay(true)?;
        self.open_with_stream(stream).await
    }
}

fn virtual_host_from_url(url: &Url) -> Option<String> {
    let path = url.path().strip_prefix('/').unwrap_or(url.path());
    match path {
        "" => None,
        path => urlencoding::decode(path).ok().map(|s| s.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_max_is_clamped_to_the_minimum() {
        assert_eq!(Builder::new().frame_max(100).frame_max, FRAME_MIN_SIZE);
        assert_eq!(Builder::new().frame_max(0).frame_max, 0);
        assert_eq!(Builder::new().frame_max(65536).frame_max, 65536);
    }

    #[test]
    fn virtual_host_is_decoded_from_the_path() {
        let url = Url::parse("amqp://localhost/%2f").unwrap();
        assert_eq!(virtual_host_from_url(&url).as_deref(), Some("/"));
        let url = Url::parse("amqp://localhost/staging").unwrap();
        assert_eq!(virtual_host_from_url(&url).as_deref(), Some("staging"));
        let url = Url::parse("amqp://localhost/").unwrap();
        assert_eq!(virtual_host_from_url(&url), None);
        let url = Url::parse("amqp://localhost").unwrap();
        assert_eq!(virtual_host_from_url(&url), None);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let result = Builder::new().open("amqps://localhost").await;
        assert!(matches!(result, Err(OpenError::InvalidScheme(s)) if s == "amqps"));
    }

    #[test]
    fn default_properties_announce_capabilities() {
        let properties = default_client_properties();
        let capabilities = properties.get_table("capabilities").unwrap();
        assert_eq!(capabilities.get_bool("basic.nack"), Some(true));
        assert_eq!(properties.get_str("platform"), Some("Rust"));
    }
}
