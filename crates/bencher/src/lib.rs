use http::Method;

/// One response to decode, with the method of the request it answers.
#[derive(Debug, Clone)]
pub struct ResponseCase {
    name: &'static str,
    method: Method,
    content: &'static str,
}

impl ResponseCase {
    pub fn new(name: &'static str, method: Method, content: &'static str) -> Self {
        Self { name, method, content }
    }

    pub fn get(name: &'static str, content: &'static str) -> Self {
        Self::new(name, Method::GET, content)
    }

    pub fn head(name: &'static str, content: &'static str) -> Self {
        Self::new(name, Method::HEAD, content)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn content(&self) -> &'static str {
        self.content
    }
}
