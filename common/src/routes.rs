use std::{borrow::Cow, fmt::Write as _};

use crate::types::ActionKind;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const HEADER_IF_MODIFIED_SINCE: &str = "If-Modified-Since";
pub const HEADER_LAST_MODIFIED: &str = "Last-Modified";

pub const MANIFEST_JSON: &str = concat!(
    "{ ",
    "\"short_name\": \"Garage\",",
    "\"name\": \"Garage door opener\",",
    "\"icons\": [",
    "  {",
    "    \"src\": \"/icon.png\",",
    "    \"sizes\": \"180x180\",",
    "    \"type\": \"image/png\"",
    "  }",
    "],",
    "\"start_url\": \"/\",",
    "\"display\": \"fullscreen\"",
    "}"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Index,
    Icon,
    AppleTouchIcon,
}

impl Asset {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Index => "text/html",
            Self::Icon | Self::AppleTouchIcon => "image/png",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Asset(Asset),
    Manifest,
    State,
    Action(ActionKind),
}

/// Every served path, in registration order.
pub const ROUTES: &[(&str, Route)] = &[
    ("/", Route::Asset(Asset::Index)),
    ("/icon.png", Route::Asset(Asset::Icon)),
    ("/apple-touch-icon.png", Route::Asset(Asset::AppleTouchIcon)),
    ("/manifest.json", Route::Manifest),
    ("/reset", Route::Action(ActionKind::Reset)),
    ("/restart", Route::Action(ActionKind::Restart)),
    ("/toggle", Route::Action(ActionKind::Toggle)),
    ("/state", Route::State),
    ("/open", Route::Action(ActionKind::Open)),
    ("/close", Route::Action(ActionKind::Close)),
    ("/api/state", Route::State),
    ("/api/on", Route::Action(ActionKind::Toggle)),
    ("/api/off", Route::Action(ActionKind::Toggle)),
    ("/api/toggle", Route::Action(ActionKind::Toggle)),
];

impl Route {
    /// Matches the path part only; any query string is ignored.
    pub fn resolve(uri: &str) -> Option<Route> {
        let path = uri.split_once('?').map_or(uri, |(path, _)| path);
        ROUTES
            .iter()
            .find(|(candidate, _)| *candidate == path)
            .map(|(_, route)| *route)
    }
}

/// `Last-Modified` value for the bundled assets, fixed for the life of the
/// process and compared verbatim against `If-Modified-Since`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastModified(String);

impl LastModified {
    pub fn new(stamp: impl Into<String>) -> Self {
        Self(stamp.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fresh(&self, if_modified_since: Option<&str>) -> bool {
        if_modified_since == Some(self.0.as_str())
    }
}

/// Diagnostic dump for requests no route matched.
#[derive(Debug, Clone, Default)]
pub struct NotFoundReport<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub uri: &'a str,
    pub content_type: Option<&'a str>,
    pub content_length: Option<u64>,
    pub headers: Vec<(&'a str, &'a str)>,
}

impl NotFoundReport<'_> {
    pub fn render(&self) -> String {
        let mut out = format!("NOT_FOUND: {} http://{}{}", self.method, self.host, self.uri);

        if let Some(length) = self.content_length.filter(|length| *length > 0) {
            let _ = write!(
                out,
                "\n_CONTENT_TYPE: {}\n_CONTENT_LENGTH: {length}",
                self.content_type.unwrap_or_default()
            );
        }

        for (name, value) in &self.headers {
            let _ = write!(out, "\n_HEADER[{name}]: {value}");
        }

        for (name, value) in query_params(self.uri) {
            let _ = write!(out, "\n_GET[{name}]: {value}");
        }

        out
    }
}

/// Query pairs in order, names and values percent-decoded.
pub fn query_params(uri: &str) -> Vec<(Cow<'_, str>, Cow<'_, str>)> {
    let Some((_, query)) = uri.split_once('?') else {
        return Vec::new();
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

/// Decodes `%XX` escapes and `+` as a space. A malformed escape is kept
/// verbatim and invalid UTF-8 is replaced.
pub fn percent_decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains(|c| c == '%' || c == '+') {
        return Cow::Borrowed(raw);
    }

    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' => match (hex_digit(bytes.get(i + 1)), hex_digit(bytes.get(i + 2))) {
                (Some(high), Some(low)) => {
                    decoded.push(high << 4 | low);
                    i += 3;
                }
                _ => {
                    decoded.push(b'%');
                    i += 1;
                }
            },
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }

    Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
}

fn hex_digit(byte: Option<&u8>) -> Option<u8> {
    byte.and_then(|byte| char::from(*byte).to_digit(16))
        .map(|digit| digit as u8)
}
