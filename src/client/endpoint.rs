//! Socket endpoint derivation from the serving page's origin.

use url::Url;

use crate::Result;
use crate::error::Error;

/// Derive the socket endpoint for a page served from `origin`.
///
/// `http` maps to `ws` and `https` to `wss`; `ws`/`wss` origins are kept as they are.
/// The origin's path, query and fragment are replaced by `socket_path`.
///
/// ```
/// use finreview_realtime::client::endpoint::from_origin;
///
/// let endpoint = from_origin("https://app.finreview.app/dashboard", "/ws").unwrap();
/// assert_eq!(endpoint.as_str(), "wss://app.finreview.app/ws");
/// ```
pub fn from_origin(origin: &str, socket_path: &str) -> Result<Url> {
    let mut url = Url::parse(origin)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::validation(format!(
                "unsupported origin scheme `{other}`, expected http or https"
            )));
        }
    };

    // All four schemes are "special", so switching between them is accepted.
    url.set_scheme(scheme)
        .map_err(|()| Error::validation(format!("cannot use `{scheme}` for {origin}")))?;
    url.set_path(socket_path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// Reject endpoints the socket client cannot open.
pub(crate) fn validate(endpoint: &Url) -> Result<()> {
    match endpoint.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(Error::validation(format!(
            "unsupported socket scheme `{other}`, expected ws or wss"
        ))),
    }
}
