//! Page pointer resolution
//!
//! A resolver is fed the previous response of a listing run (`None` before
//! the first request) and answers whether another request should follow.
//! When it answers `false` it is back in its reset state, so the next call
//! starts a new run.

use super::json_at;
use serde_json::Value;
use tributary_core::spec::PagingSpec;

/// A decoded API response
#[derive(Debug, Clone)]
pub struct Page {
    pub body: Value,
    pub record_count: usize,
}

impl Page {
    pub fn new(body: Value, record_count: usize) -> Self {
        Self { body, record_count }
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }
}

pub trait PageResolver: Send {
    /// Advance with the last response; `true` when another request should be made
    fn resolve(&mut self, response: Option<&Page>) -> bool;

    /// Value substituted for the page pointer placeholder
    fn pointer(&self) -> Option<String>;
}

pub fn page_resolver(spec: &PagingSpec) -> Box<dyn PageResolver> {
    match spec {
        PagingSpec::Counter {
            total_pages_key_chain,
        } => Box::new(CounterResolver::new(total_pages_key_chain.clone())),
        PagingSpec::Offset { page_size } => Box::new(OffsetResolver::new(*page_size)),
        PagingSpec::Token { token_key_chain } => {
            Box::new(TokenResolver::new(token_key_chain.clone()))
        }
    }
}

/// Page numbers starting at 1; the total is read once per run
#[derive(Debug, Default)]
pub struct CounterResolver {
    total_pages_key_chain: Vec<String>,
    page: Option<u64>,
    total: Option<u64>,
}

impl CounterResolver {
    pub fn new(total_pages_key_chain: Vec<String>) -> Self {
        Self {
            total_pages_key_chain,
            page: None,
            total: None,
        }
    }

    fn reset(&mut self) {
        self.page = None;
        self.total = None;
    }
}

impl PageResolver for CounterResolver {
    fn resolve(&mut self, response: Option<&Page>) -> bool {
        let Some(page) = self.page else {
            self.page = Some(1);
            return true;
        };
        match response {
            Some(response) if !response.is_empty() => {
                if self.total.is_none() {
                    self.total = json_at(&response.body, &self.total_pages_key_chain).and_then(as_u64);
                }
                match self.total {
                    Some(total) if page >= total => {
                        self.reset();
                        false
                    }
                    _ => {
                        self.page = Some(page + 1);
                        true
                    }
                }
            }
            // an empty page ends the run, whatever the total said
            _ => {
                self.reset();
                false
            }
        }
    }

    fn pointer(&self) -> Option<String> {
        self.page.map(|p| p.to_string())
    }
}

/// Offsets starting at 0, advanced by the page size
#[derive(Debug)]
pub struct OffsetResolver {
    page_size: u64,
    offset: Option<u64>,
}

impl OffsetResolver {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            offset: None,
        }
    }
}

impl PageResolver for OffsetResolver {
    fn resolve(&mut self, response: Option<&Page>) -> bool {
        let Some(offset) = self.offset else {
            self.offset = Some(0);
            return true;
        };
        match response {
            Some(response) if !response.is_empty() => {
                self.offset = Some(offset + self.page_size);
                true
            }
            _ => {
                self.offset = None;
                false
            }
        }
    }

    fn pointer(&self) -> Option<String> {
        self.offset.map(|o| o.to_string())
    }
}

/// Continuation token read from each response
#[derive(Debug)]
pub struct TokenResolver {
    token_key_chain: Vec<String>,
    started: bool,
    token: Option<String>,
}

impl TokenResolver {
    pub fn new(token_key_chain: Vec<String>) -> Self {
        Self {
            token_key_chain,
            started: false,
            token: None,
        }
    }
}

impl PageResolver for TokenResolver {
    fn resolve(&mut self, response: Option<&Page>) -> bool {
        if !self.started {
            self.started = true;
            self.token = None;
            return true;
        }
        let token = response
            .and_then(|r| json_at(&r.body, &self.token_key_chain))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|t| !t.is_empty());
        match token {
            Some(token) => {
                self.token = Some(token);
                true
            }
            None => {
                self.started = false;
                self.token = None;
                false
            }
        }
    }

    fn pointer(&self) -> Option<String> {
        self.token.clone()
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
