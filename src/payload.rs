//! Unit of work exchanged with a worker.

use std::fmt;

/// Opaque context + body pair passed into and returned from a worker.
///
/// The core never interprets either field. Gateways typically place JSON
/// metadata (headers, route, status) in `context` and raw content in `body`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload {
    context: Vec<u8>,
    body: Vec<u8>,
}

impl Payload {
    pub fn new(context: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            context: context.into(),
            body: body.into(),
        }
    }

    /// Payload with an empty context.
    pub fn body_only(body: impl Into<Vec<u8>>) -> Self {
        Self::new(Vec::new(), body)
    }

    pub fn context(&self) -> &[u8] {
        &self.context
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total bytes carried by this payload.
    pub fn len(&self) -> usize {
        self.context.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into owned context and body.
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.context, self.body)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("context", &String::from_utf8_lossy(&self.context))
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let p = Payload::new(r#"{"status":200}"#, "hello");
        assert_eq!(p.context(), br#"{"status":200}"#);
        assert_eq!(p.body(), b"hello");
        assert_eq!(p.len(), 14 + 5);
        assert!(!p.is_empty());
    }

    #[test]
    fn test_payload_body_only() {
        let p = Payload::body_only(vec![1, 2, 3]);
        assert!(p.context().is_empty());
        let (ctx, body) = p.into_parts();
        assert!(ctx.is_empty());
        assert_eq!(body, vec![1, 2, 3]);
    }

    #[test]
    fn test_payload_debug_hides_body() {
        let p = Payload::new("ctx", vec![0u8; 4096]);
        let debug = format!("{:?}", p);
        assert!(debug.contains("ctx"));
        assert!(debug.contains("4096"));
    }
}
