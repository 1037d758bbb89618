use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    str::FromStr,
};

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Separator between a header name and its value in the serialized header
/// form.
pub const HEADER_PAIR_SEPARATOR: &str = " : ";

/// Separator between serialized header entries.
pub const HEADER_RECORD_SEPARATOR: &str = "\r\n";

/// The methods a captured request may carry.
pub const SUPPORTED_METHODS: [&str; 7] = [
    "CONNECT", "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS",
];

pub fn is_supported_method(method: &str) -> bool {
    SUPPORTED_METHODS
        .iter()
        .any(|supported| method.eq_ignore_ascii_case(supported))
}

#[derive(Debug, thiserror::Error)]
#[error("invalid scheme: {0}")]
pub struct InvalidScheme(pub String);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = InvalidScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(InvalidScheme(s.to_owned())),
        }
    }
}

/// The structured form of an observed or replayed request.
///
/// The header map and its serialized raw form (`header_raw`) are kept
/// consistent: whoever mutates one has to regenerate the other with
/// [`rebuild_headers`](Self::rebuild_headers) or
/// [`rebuild_header_raw`](Self::rebuild_header_raw).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    #[serde(default)]
    pub id: Option<i64>,

    /// Upper-cased method name.
    pub method: String,

    pub scheme: Scheme,

    /// Remote `host:port` the request was (or will be) sent to.
    #[serde(rename = "address")]
    pub host: String,

    /// Serialized header entries, one value per name.
    #[serde(rename = "header")]
    pub header_raw: String,

    #[serde(skip)]
    pub headers: HashMap<String, String>,

    #[serde(with = "body_serde")]
    pub body: Vec<u8>,

    #[serde(skip)]
    pub user_login: String,

    #[serde(skip)]
    pub user_password: String,

    /// Assigned by the store on insert.
    #[serde(default, rename = "add", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CapturedRequest {
    /// Rebuilds the header map from the raw header form. Entries that don't
    /// split into a name and a value are skipped; duplicate names collapse,
    /// last write wins.
    pub fn rebuild_headers(&mut self) {
        self.headers.clear();
        if self.header_raw.is_empty() {
            return;
        }
        for entry in self.header_raw.split(HEADER_RECORD_SEPARATOR) {
            let Some((name, value)) = entry.split_once(HEADER_PAIR_SEPARATOR)
            else {
                continue;
            };
            self.headers.insert(name.to_owned(), value.to_owned());
        }
    }

    /// Rebuilds the raw header form from the header map.
    pub fn rebuild_header_raw(&mut self) {
        let mut entries = Vec::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            entries.push(format!("{name}{HEADER_PAIR_SEPARATOR}{value}"));
        }
        self.header_raw = entries.join(HEADER_RECORD_SEPARATOR);
    }
}

/// Where captured requests end up. The proxy and the capture tap only ever
/// log a failed save; persistence problems never touch the data path.
pub trait RequestSink: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn save(
        &self,
        record: CapturedRequest,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Bodies are raw bytes in storage, but serialize as (lossy) text on the
/// JSON surface.
mod body_serde {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}
