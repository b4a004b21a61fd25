//! An HTTP request value and its builder.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::http::{CacheControl, Headers, HeadersBuilder, RequestBody, Url};

/// Converts into a [`Url`], so request builders accept strings or parsed
/// values interchangeably.
pub trait IntoUrl {
    fn into_url(self) -> Result<Url>;
}

impl IntoUrl for Url {
    fn into_url(self) -> Result<Url> {
        Ok(self)
    }
}

impl IntoUrl for &str {
    fn into_url(self) -> Result<Url> {
        Url::parse(self)
    }
}

impl IntoUrl for String {
    fn into_url(self) -> Result<Url> {
        Url::parse(&self)
    }
}

impl IntoUrl for &Url {
    fn into_url(self) -> Result<Url> {
        Ok(self.clone())
    }
}

type TagMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable HTTP request.
#[derive(Clone)]
pub struct Request {
    url: Url,
    method: String,
    headers: Headers,
    body: Option<Arc<dyn RequestBody>>,
    tags: TagMap,
}

impl Request {
    /// A GET request for `url`.
    pub fn get(url: impl IntoUrl) -> Result<Request> {
        Request::builder().url(url)?.build()
    }

    pub fn builder() -> RequestBuilder {
        RequestBuilder {
            url: None,
            method: "GET".to_string(),
            headers: HeadersBuilder::default(),
            body: None,
            tags: TagMap::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last value of the header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Arc<dyn RequestBody>> {
        self.body.as_ref()
    }

    /// This request's cache directives, parsed from its headers.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// The tag attached for type `T`, if any.
    pub fn tag<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.tags
            .get(&TypeId::of::<T>())
            .and_then(|tag| tag.downcast_ref::<T>())
    }

    pub fn new_builder(&self) -> RequestBuilder {
        RequestBuilder {
            url: Some(self.url.clone()),
            method: self.method.clone(),
            headers: self.headers.to_builder(),
            body: self.body.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builds a [`Request`].
pub struct RequestBuilder {
    url: Option<Url>,
    method: String,
    headers: HeadersBuilder,
    body: Option<Arc<dyn RequestBody>>,
    tags: TagMap,
}

impl RequestBuilder {
    pub fn url(mut self, url: impl IntoUrl) -> Result<RequestBuilder> {
        self.url = Some(url.into_url()?);
        Ok(self)
    }

    /// Sets the method and optional body.
    pub fn method(mut self, method: &str, body: Option<Arc<dyn RequestBody>>) -> RequestBuilder {
        self.method = method.to_string();
        self.body = body;
        self
    }

    pub fn get(self) -> RequestBuilder {
        self.method("GET", None)
    }

    pub fn head(self) -> RequestBuilder {
        self.method("HEAD", None)
    }

    pub fn post(self, body: Arc<dyn RequestBody>) -> RequestBuilder {
        self.method("POST", Some(body))
    }

    pub fn put(self, body: Arc<dyn RequestBody>) -> RequestBuilder {
        self.method("PUT", Some(body))
    }

    pub fn patch(self, body: Arc<dyn RequestBody>) -> RequestBuilder {
        self.method("PATCH", Some(body))
    }

    pub fn delete(self, body: Option<Arc<dyn RequestBody>>) -> RequestBuilder {
        self.method("DELETE", body)
    }

    /// Replaces all headers named `name` with this single value.
    pub fn header(mut self, name: &str, value: &str) -> RequestBuilder {
        self.headers.set(name, value);
        self
    }

    /// Adds a header without removing existing values.
    pub fn add_header(mut self, name: &str, value: &str) -> RequestBuilder {
        self.headers.add(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> RequestBuilder {
        self.headers.remove_all(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> RequestBuilder {
        self.headers = headers.to_builder();
        self
    }

    /// Sets this request's `Cache-Control` header, replacing any present.
    pub fn cache_control(self, cache_control: CacheControl) -> RequestBuilder {
        let value = cache_control.to_string();
        if value.is_empty() {
            self.remove_header("Cache-Control")
        } else {
            self.header("Cache-Control", &value)
        }
    }

    /// Attaches `tag` retrievable via [`Request::tag`] with its type.
    pub fn tag<T: Any + Send + Sync>(mut self, tag: T) -> RequestBuilder {
        self.tags.insert(TypeId::of::<T>(), Arc::new(tag));
        self
    }

    pub fn build(self) -> Result<Request> {
        let url = self
            .url
            .ok_or_else(|| Error::bad_config("request has no URL"))?;
        if self.method.is_empty() {
            return Err(Error::bad_config("method is empty"));
        }
        if self.body.is_some() && !method_permits_body(&self.method) {
            return Err(Error::bad_config(format!(
                "method {} must not have a request body",
                self.method
            )));
        }
        if self.body.is_none() && method_requires_body(&self.method) {
            return Err(Error::bad_config(format!(
                "method {} must have a request body",
                self.method
            )));
        }
        Ok(Request {
            url,
            method: self.method,
            headers: self.headers.build(),
            body: self.body,
            tags: self.tags,
        })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish()
    }
}

pub(crate) fn method_permits_body(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD")
}

pub(crate) fn method_requires_body(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "PROPPATCH" | "REPORT")
}

/// True when a redirect of `method` should be reissued as a GET.
pub(crate) fn redirects_to_get(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD")
}
