//! SASL mechanisms offered in `connection.start-ok`

use bytes::{BufMut, Bytes, BytesMut};
use fe2o3_amqp091_types::{primitives::{write_table, FieldTable}, EncodeError};
use url::Url;

/// `PLAIN` mechanism name
pub const PLAIN: &str = "PLAIN";

/// `AMQPLAIN` mechanism name
pub const AMQPLAIN: &str = "AMQPLAIN";

/// `EXTERNAL` mechanism name
pub const EXTERNAL: &str = "EXTERNAL";

/// Authentication profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslProfile {
    /// `PLAIN`: `\0username\0password`
    Plain {
        /// Username
        username: String,
        /// Password
        password: String,
    },

    /// `AMQPLAIN`: a field table with `LOGIN` and `PASSWORD`
    AmqPlain {
        /// Username
        username: String,
        /// Password
        password: String,
    },

    /// `EXTERNAL`: credentials come from outside, eg. a client certificate
    External,
}

impl Default for SaslProfile {
    fn default() -> Self {
        SaslProfile::Plain {
            username: String::from("guest"),
            password: String::from("guest"),
        }
    }
}

impl<'a> TryFrom<&'a Url> for SaslProfile {
    type Error = ();

    fn try_from(value: &'a Url) -> Result<Self, Self::Error> {
        let password = value.password().ok_or(())?;
        if value.username().is_empty() {
            return Err(());
        }
        let decode = |s: &str| {
            urlencoding::decode(s)
                .map(|s| s.into_owned())
                .map_err(|_| ())
        };
        Ok(SaslProfile::Plain {
            username: decode(value.username())?,
            password: decode(password)?,
        })
    }
}

impl SaslProfile {
    /// Mechanism name
    pub fn mechanism(&self) -> &'static str {
        match self {
            SaslProfile::Plain { .. } => PLAIN,
            SaslProfile::AmqPlain { .. } => AMQPLAIN,
            SaslProfile::External => EXTERNAL,
        }
    }

    /// Whether the mechanism is in the server's space separated list
    pub fn is_offered(&self, mechanisms: &str) -> bool {
        mechanisms
            .split_ascii_whitespace()
            .any(|m| m == self.mechanism())
    }

    /// Response sent in `connection.start-ok` and again for every `connection.secure`
    pub fn response(&self) -> Result<Bytes, EncodeError> {
        match self {
            SaslProfile::Plain { username, password } => {
                let mut buf = BytesMut::with_capacity(username.len() + password.len() + 2);
                buf.put_u8(0);
                buf.put_slice(username.as_bytes());
                buf.put_u8(0);
                buf.put_slice(password.as_bytes());
                Ok(buf.freeze())
            }
            SaslProfile::AmqPlain { username, password } => {
                let table = FieldTable::new()
                    .with("LOGIN", username.as_str())
                    .with("PASSWORD", password.as_str());
                let mut buf = BytesMut::new();
                write_table(&mut buf, &table)?;
                // The response is the table without its length prefix
                Ok(buf.freeze().split_off(4))
            }
            SaslProfile::External => Ok(Bytes::new()),
        }
    }
}
