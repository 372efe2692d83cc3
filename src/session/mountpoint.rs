/// Per-session topic namespace prefix
///
/// Every topic a session publishes or subscribes to is stored under the
/// prefix; outbound topics have it removed again before they hit the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mountpoint(String);

impl Mountpoint {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefixes a topic or filter
    #[must_use]
    pub fn apply(&self, topic: &str) -> String {
        if self.0.is_empty() {
            return topic.to_string();
        }
        format!("{}{topic}", self.0)
    }

    /// Removes the prefix from a routed topic; topics outside it pass unchanged
    #[must_use]
    pub fn strip<'a>(&self, topic: &'a str) -> &'a str {
        topic.strip_prefix(self.0.as_str()).unwrap_or(topic)
    }
}
