use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::Result;
use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// Transport request produced once the build phase completes.
pub type Request = http::Request<Bytes>;

/// Raw transport response handed to the deserialize phase.
pub type Response = http::Response<Bytes>;

/// Mutable request representation shared by the serialize and build phases.
///
/// A fresh builder is created for every attempt, so nothing written here
/// survives into a retry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestBuilder {
    method: Method,
    endpoint: Option<url::Url>,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) -> &mut Self {
        self.method = method;
        self
    }

    pub fn endpoint(&self) -> Option<&url::Url> {
        self.endpoint.as_ref()
    }

    pub fn set_endpoint(&mut self, endpoint: url::Url) -> &mut Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = path.into();
        self
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn push_query(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Target URI: the endpoint joined with the path and query, or an
    /// origin-form URI when no endpoint has been applied.
    pub fn uri_string(&self) -> String {
        let path = self.path.trim_start_matches('/');
        let mut target = match &self.endpoint {
            Some(endpoint) => {
                let base = endpoint.as_str().trim_end_matches('/');
                if path.is_empty() {
                    base.to_owned()
                } else {
                    format!("{base}/{path}")
                }
            }
            None => format!("/{path}"),
        };
        if !self.query_pairs.is_empty() {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in &self.query_pairs {
                serializer.append_pair(name, value);
            }
            target.push('?');
            target.push_str(&serializer.finish());
        }
        target
    }

    pub fn build(self) -> Result<Request> {
        let uri_text = self.uri_string();
        let uri: Uri = uri_text
            .parse()
            .map_err(|_| Error::configuration(format!("invalid request uri `{uri_text}`")))?;
        let mut request = http::Request::new(self.body);
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::RequestBuilder;

    #[test]
    fn builds_origin_form_uri_without_endpoint() {
        let mut builder = RequestBuilder::new();
        builder
            .set_method(Method::POST)
            .set_path("items")
            .push_query("limit", "10")
            .push_query("q", "a b");
        let request = builder.build().expect("request should build");
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().to_string(), "/items?limit=10&q=a+b");
    }

    #[test]
    fn joins_endpoint_and_path() {
        let mut builder = RequestBuilder::new();
        builder
            .set_endpoint(url::Url::parse("https://api.example.com/v1/").expect("valid url"))
            .set_path("/items/42");
        builder
            .set_header("x-trace", "abc")
            .expect("header should be valid");
        let request = builder.build().expect("request should build");
        assert_eq!(
            request.uri().to_string(),
            "https://api.example.com/v1/items/42"
        );
        assert_eq!(request.headers()["x-trace"], "abc");
    }

    #[test]
    fn rejects_invalid_header_names() {
        let mut builder = RequestBuilder::new();
        assert!(builder.set_header("bad header", "x").is_err());
    }
}
