//! License server templates and the license round trip.
//!
//! A template has the form `<url>|<headers>|<body>|<response>`:
//!
//! - `url` may contain `{SID}` (session id) and `{KID}` (default key id).
//! - `headers` is a list of `&` separated `Name=value` pairs, percent encoded.
//! - `body` is empty for the raw challenge, otherwise free text where
//!   `R{SSM}`, `b{SSM}` and `B{SSM}` insert the challenge raw, base64 encoded
//!   or base64 then percent encoded. `{SID}` and `{KID}` are substituted too.
//! - `response` is empty for a raw license, `B` for base64, `J<path>` for the
//!   string at a dotted JSON path and `JB<path>` for a base64 string there.
//!
//! A bare url gets `|Content-Type=application%2Foctet-stream|R{SSM}|`.

use crate::{
    Error, Result,
    key::KeyId,
    session::Session,
    transport::{LicenseRequest, LicenseTransport},
};
use base64::Engine;
use log::{debug, info};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde_json::Value;
use std::str::FromStr;

const DEFAULT_SUFFIX: &str = "|Content-Type=application%2Foctet-stream|R{SSM}|";

/// Everything except RFC 3986 unreserved characters is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How the license is embedded in the server response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ResponseFormat {
    #[default]
    Raw,
    Base64,
    Json {
        path: String,
        base64: bool,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LicenseTemplate {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub response: ResponseFormat,
}

impl FromStr for LicenseTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let template = if s.contains('|') {
            s.to_owned()
        } else {
            format!("{}{}", s, DEFAULT_SUFFIX)
        };

        let mut parts = template.splitn(4, '|');
        let url = parts.next().unwrap_or_default().trim().to_owned();

        if url.is_empty() {
            return Err(Error::License("license url is empty".to_owned()));
        }

        let headers = parts
            .next()
            .unwrap_or_default()
            .split('&')
            .filter(|x| !x.is_empty())
            .map(|x| {
                let (name, value) = x.split_once('=').ok_or_else(|| {
                    Error::License(format!("expected 'Name=value' header but found '{}'", x))
                })?;
                Ok((percent_decode(name)?, percent_decode(value)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let body = parts.next().unwrap_or_default().to_owned();
        let response = match parts.next().unwrap_or_default() {
            "" => ResponseFormat::Raw,
            "B" => ResponseFormat::Base64,
            x if x.starts_with("JB") => ResponseFormat::Json {
                path: x[2..].to_owned(),
                base64: true,
            },
            x if x.starts_with('J') => ResponseFormat::Json {
                path: x[1..].to_owned(),
                base64: false,
            },
            x => {
                return Err(Error::License(format!(
                    "'{}' is not a supported response format",
                    x
                )));
            }
        };

        Ok(Self {
            url,
            headers,
            body,
            response,
        })
    }
}

impl LicenseTemplate {
    /// Build the request carrying `challenge`.
    pub fn request(
        &self,
        challenge: &[u8],
        session_id: &str,
        key_id: Option<&KeyId>,
    ) -> Result<LicenseRequest> {
        let kid = key_id.map(|x| x.to_string()).unwrap_or_default();
        let substitute = |x: &str| x.replace("{SID}", session_id).replace("{KID}", &kid);

        let body = if self.body.is_empty() {
            challenge.to_vec()
        } else if let Some(pos) = self.body.find("{SSM}") {
            let (prefix, encoding) = match self.body[..pos].chars().last() {
                Some(x @ ('R' | 'b' | 'B')) => (&self.body[..pos - 1], x),
                _ => {
                    return Err(Error::License(
                        "'{SSM}' must be prefixed with 'R', 'b' or 'B'".to_owned(),
                    ));
                }
            };

            let encoded = base64::engine::general_purpose::STANDARD.encode(challenge);
            let mut body = substitute(prefix).into_bytes();
            match encoding {
                'R' => body.extend_from_slice(challenge),
                'b' => body.extend(encoded.bytes()),
                _ => body.extend(utf8_percent_encode(&encoded, UNRESERVED).to_string().bytes()),
            }
            body.extend(substitute(&self.body[pos + 5..]).bytes());
            body
        } else {
            substitute(&self.body).into_bytes()
        };

        Ok(LicenseRequest {
            url: substitute(&self.url),
            headers: self.headers.clone(),
            body,
        })
    }

    /// Extract the license from a server response body.
    pub fn extract(&self, body: &[u8]) -> Result<Vec<u8>> {
        match &self.response {
            ResponseFormat::Raw => Ok(body.to_vec()),
            ResponseFormat::Base64 => decode_base64(&String::from_utf8_lossy(body)),
            ResponseFormat::Json { path, base64 } => {
                let value = serde_json::from_slice::<Value>(body)?;
                let field = json_path(&value, path)?;

                if *base64 {
                    decode_base64(field)
                } else {
                    Ok(field.as_bytes().to_vec())
                }
            }
        }
    }
}

/// Run one license round trip for the challenge `session` has pending.
/// Used for the initial license and for renewals alike.
pub fn license_exchange(
    session: &Session,
    transport: &dyn LicenseTransport,
    template: &LicenseTemplate,
) -> Result<()> {
    let challenge = session
        .challenge()
        .ok_or_else(|| Error::License("session has no pending license request".to_owned()))?;
    let session_id = session.session_id();
    let request = template.request(&challenge, &session_id, session.default_key_id().as_ref())?;

    debug!(
        "sending {} byte license request for session {}",
        request.body.len(),
        session_id
    );

    let response = transport.submit(&request)?.error_for_status()?;
    let license = template.extract(&response.body)?;
    session.apply_response(&license)?;

    info!("license applied to session {}", session_id);
    Ok(())
}

fn json_path<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    let mut current = value;

    for segment in path.split('.').filter(|x| !x.is_empty()) {
        current = match current {
            Value::Array(x) => segment.parse::<usize>().ok().and_then(|i| x.get(i)),
            _ => current.get(segment),
        }
        .ok_or_else(|| Error::License(format!("json response has no '{}' field", path)))?;
    }

    current
        .as_str()
        .ok_or_else(|| Error::License(format!("json field '{}' is not a string", path)))
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let data = data.trim().trim_end_matches('=');

    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(data)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data))
        .map_err(|e| Error::License(format!("license is not valid base64: {}", e)))
}

fn percent_decode(data: &str) -> Result<String> {
    percent_decode_str(data)
        .decode_utf8()
        .map(|x| x.into_owned())
        .map_err(|_| Error::License(format!("'{}' does not decode to utf-8", data)))
}
