use crate::Error;
use serde::Deserialize;
use std::fmt;
use url::Url;

/// Where the submission token goes in each upload request
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>`
    #[default]
    Header,
    /// A `token` query parameter
    Query,
    /// The submission URL already carries the token, it is sent as is
    Embedded,
}

/// The ingestion endpoint reports are uploaded to
///
/// Supplied once by the host, it is never persisted by the reporter.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub submission_url: Url,
    pub token: String,
    #[serde(default)]
    pub universe: Option<String>,
    #[serde(default)]
    pub token_placement: TokenPlacement,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.submission_url.clone();
        url.set_query(None);
        if self.token_placement == TokenPlacement::Embedded {
            url.set_path("");
        }

        f.debug_struct("EndpointConfig")
            .field("submission_url", &url.as_str())
            .field("token", &"<redacted>")
            .field("universe", &self.universe)
            .field("token_placement", &self.token_placement)
            .finish()
    }
}

fn parse_url(url: &str) -> Result<Url, Error> {
    let url = Url::parse(url).map_err(|err| Error::InvalidEndpoint(err.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidEndpoint(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidEndpoint("the URL has no host".to_owned()));
    }

    Ok(url)
}

impl EndpointConfig {
    /// An endpoint whose token is sent as a bearer header
    pub fn new(submission_url: &str, token: impl Into<String>) -> Result<Self, Error> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::InvalidEndpoint("the token is empty".to_owned()));
        }

        Ok(Self {
            submission_url: parse_url(submission_url)?,
            token,
            universe: None,
            token_placement: TokenPlacement::Header,
        })
    }

    #[inline]
    pub fn universe(mut self, universe: impl Into<String>) -> Self {
        self.universe = Some(universe.into());
        self
    }

    #[inline]
    pub fn token_placement(mut self, placement: TokenPlacement) -> Self {
        self.token_placement = placement;
        self
    }

    /// Parses a submission URL that carries its own credentials, either
    ///
    /// * `https://submit.<host>/<universe>/<token>/...`, or
    /// * `https://<universe>.<host>/...?token=<token>`
    ///
    /// The URL is used unchanged for uploads.
    pub fn from_submission_url(submission_url: &str) -> Result<Self, Error> {
        let url = parse_url(submission_url)?;
        let host = url.host_str().unwrap_or_default();

        let (universe, token) = if host.starts_with("submit.") {
            let mut segments = url
                .path_segments()
                .into_iter()
                .flatten()
                .filter(|segment| !segment.is_empty());

            match (segments.next(), segments.next()) {
                (Some(universe), Some(token)) => (universe.to_owned(), token.to_owned()),
                _ => {
                    return Err(Error::InvalidEndpoint(
                        "expected /<universe>/<token> in the path".to_owned(),
                    ));
                }
            }
        } else {
            let token = url
                .query_pairs()
                .find_map(|(key, value)| (key == "token").then(|| value.into_owned()))
                .filter(|token| !token.is_empty())
                .ok_or_else(|| Error::InvalidEndpoint("no token query parameter".to_owned()))?;

            let universe = host
                .split('.')
                .next()
                .filter(|universe| !universe.is_empty())
                .ok_or_else(|| Error::InvalidEndpoint("no universe in the host".to_owned()))?;

            (universe.to_owned(), token)
        };

        Ok(Self {
            submission_url: url,
            token,
            universe: Some(universe),
            token_placement: TokenPlacement::Embedded,
        })
    }

    /// The URL an upload is sent to
    pub(crate) fn request_url(&self) -> Url {
        let mut url = self.submission_url.clone();
        if self.token_placement == TokenPlacement::Query {
            url.query_pairs_mut().append_pair("token", &self.token);
        }
        url
    }

    /// The host only, safe to log
    pub(crate) fn host(&self) -> &str {
        self.submission_url.host_str().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn submit_path() {
        let ep = EndpointConfig::from_submission_url(
            "https://submit.example.com/my-universe/abcdef0123/crash",
        )
        .unwrap();

        assert_eq!(ep.universe.as_deref(), Some("my-universe"));
        assert_eq!(ep.token, "abcdef0123");
        assert_eq!(ep.token_placement, TokenPlacement::Embedded);
        assert_eq!(
            ep.request_url().as_str(),
            "https://submit.example.com/my-universe/abcdef0123/crash"
        );
    }

    #[test]
    fn universe_host() {
        let ep = EndpointConfig::from_submission_url(
            "https://acme.sp.example.com:6098/post?format=crash&token=feedface",
        )
        .unwrap();

        assert_eq!(ep.universe.as_deref(), Some("acme"));
        assert_eq!(ep.token, "feedface");
    }

    #[test]
    fn rejects_bad_urls() {
        for url in [
            "not a url",
            "ftp://submit.example.com/u/t",
            "https://submit.example.com/only-universe",
            "https://acme.example.com/post",
            "https://acme.example.com/post?token=",
        ] {
            assert!(
                matches!(
                    EndpointConfig::from_submission_url(url),
                    Err(Error::InvalidEndpoint(_))
                ),
                "{url}"
            );
        }

        assert!(EndpointConfig::new("https://example.com", "").is_err());
    }

    #[test]
    fn query_token() {
        let ep = EndpointConfig::new("https://example.com/api/crash?format=crash", "secret")
            .unwrap()
            .token_placement(TokenPlacement::Query);

        assert_eq!(
            ep.request_url().as_str(),
            "https://example.com/api/crash?format=crash&token=secret"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let ep = EndpointConfig::from_submission_url(
            "https://submit.example.com/my-universe/supersecret/crash",
        )
        .unwrap();
        let dbg = format!("{ep:?}");
        assert!(!dbg.contains("supersecret"), "{dbg}");

        let ep = EndpointConfig::new("https://example.com/crash?token=supersecret", "supersecret")
            .unwrap()
            .universe("u");
        let dbg = format!("{ep:?}");
        assert!(!dbg.contains("supersecret"), "{dbg}");
        assert!(dbg.contains("example.com"));
    }

    #[test]
    fn deserializes() {
        let ep: EndpointConfig = serde_json::from_str(
            r#"{"submission_url":"https://example.com/crash","token":"t","token_placement":"query"}"#,
        )
        .unwrap();
        assert_eq!(ep.token_placement, TokenPlacement::Query);
        assert!(ep.universe.is_none());
    }
}
