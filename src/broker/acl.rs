//! Access Control Lists (ACLs) for MQTT broker topic authorization
//!
//! Rules are evaluated most-specific first. Patterns may contain `%c` and
//! `%u`, replaced with the client id and username of the caller, so one rule
//! such as `devices/%c/#` confines every device to its own subtree.
//!
//! Rule text format (one rule per line):
//! ```text
//! # Comments start with #
//! user alice topic sensors/+ permission read
//! user * topic devices/%c/# permission readwrite
//! user * topic admin/# permission deny
//! ```

use crate::error::{MqttError, Result};
use crate::validation::is_valid_topic_filter;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Access permissions for topics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Subscribe and receive
    Read,
    /// Publish
    Write,
    ReadWrite,
    /// Explicitly deny access
    Deny,
}

impl Permission {
    #[must_use]
    pub fn allows_read(self) -> bool {
        matches!(self, Permission::Read | Permission::ReadWrite)
    }

    #[must_use]
    pub fn allows_write(self) -> bool {
        matches!(self, Permission::Write | Permission::ReadWrite)
    }
}

impl std::str::FromStr for Permission {
    type Err = MqttError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "read" | "subscribe" => Ok(Permission::Read),
            "write" | "publish" => Ok(Permission::Write),
            "readwrite" | "rw" | "all" => Ok(Permission::ReadWrite),
            "deny" | "none" => Ok(Permission::Deny),
            _ => Err(MqttError::Configuration(format!("Invalid permission: {s}"))),
        }
    }
}

/// ACL rule for a specific user and topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    /// Username, `*` for everyone or `anonymous` for clients without one
    pub username: String,
    /// Topic filter, optionally containing `%c` / `%u`
    pub topic_pattern: String,
    pub permission: Permission,
}

impl AclRule {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        topic_pattern: impl Into<String>,
        permission: Permission,
    ) -> Self {
        Self {
            username: username.into(),
            topic_pattern: topic_pattern.into(),
            permission,
        }
    }

    fn applies_to(&self, username: Option<&str>) -> bool {
        match username {
            Some(user) => self.username == "*" || self.username == user,
            None => self.username == "*" || self.username == "anonymous",
        }
    }

    /// Pattern with `%c` / `%u` substituted; `None` when `%u` has no username
    fn resolve_pattern(&self, client_id: &str, username: Option<&str>) -> Option<String> {
        let pattern = self.topic_pattern.replace("%c", client_id);
        if pattern.contains("%u") {
            return username.map(|user| pattern.replace("%u", user));
        }
        Some(pattern)
    }

    fn specificity(&self) -> i32 {
        let mut score = 0;
        if self.username != "*" {
            score += 100;
        }
        let wildcards = self
            .topic_pattern
            .chars()
            .filter(|&c| c == '+' || c == '#')
            .count();
        score += 50 - i32::try_from(wildcards).unwrap_or(50) * 10;
        score + i32::try_from(self.topic_pattern.len()).unwrap_or(i32::MAX - 150)
    }
}

/// Whether every topic matched by `filter` is also matched by `pattern`
///
/// For a plain topic name this is ordinary filter matching.
#[must_use]
pub fn filter_covers(pattern: &str, filter: &str) -> bool {
    if !is_valid_topic_filter(pattern) || !is_valid_topic_filter(filter) {
        return false;
    }
    if filter.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    let mut requested = filter.split('/');
    for level in pattern.split('/') {
        if level == "#" {
            return true;
        }
        match requested.next() {
            None | Some("#") => return false,
            Some(asked) if level == "+" || level == asked => {}
            Some(_) => return false,
        }
    }
    requested.next().is_none()
}

/// Access Control List manager
#[derive(Debug)]
pub struct AclManager {
    rules: RwLock<Vec<AclRule>>,
    default_permission: Permission,
}

impl Default for AclManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AclManager {
    /// Creates an ACL manager that denies anything no rule allows
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_permission: Permission::Deny,
        }
    }

    #[must_use]
    pub fn allow_all() -> Self {
        Self::new().with_default_permission(Permission::ReadWrite)
    }

    #[must_use]
    pub fn with_default_permission(mut self, permission: Permission) -> Self {
        self.default_permission = permission;
        self
    }

    /// Parses rule text; malformed lines are skipped with a warning
    #[must_use]
    pub fn parse_rules(content: &str) -> Vec<AclRule> {
        let mut rules = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            let ["user", username, "topic", pattern, "permission", permission] = parts.as_slice()
            else {
                warn!(line = index + 1, "Invalid ACL rule format: {line}");
                continue;
            };
            match permission.parse::<Permission>() {
                Ok(permission) => rules.push(AclRule::new(*username, *pattern, permission)),
                Err(e) => warn!(line = index + 1, "Invalid ACL permission: {e}"),
            }
        }
        rules
    }

    /// Replaces the rule set with the rules parsed from `content`
    pub async fn load_rules(&self, content: &str) -> usize {
        let rules = Self::parse_rules(content);
        let count = rules.len();
        *self.rules.write().await = rules;
        count
    }

    pub async fn add_rule(&self, rule: AclRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn clear_rules(&self) {
        self.rules.write().await.clear();
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Check if a client may publish to a topic
    pub async fn check_publish(&self, client_id: &str, username: Option<&str>, topic: &str) -> bool {
        self.check_permission(client_id, username, topic, Permission::allows_write)
            .await
    }

    /// Check if a client may subscribe to a filter or receive a topic
    pub async fn check_subscribe(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic_filter: &str,
    ) -> bool {
        self.check_permission(client_id, username, topic_filter, Permission::allows_read)
            .await
    }

    async fn check_permission<F>(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        allows: F,
    ) -> bool
    where
        F: Fn(Permission) -> bool,
    {
        let rules = self.rules.read().await;

        let best = rules
            .iter()
            .filter(|rule| rule.applies_to(username))
            .filter(|rule| {
                rule.resolve_pattern(client_id, username)
                    .is_some_and(|pattern| filter_covers(&pattern, topic))
            })
            .max_by_key(|rule| rule.specificity());

        let permission = best.map_or(self.default_permission, |rule| rule.permission);
        debug!(
            client_id,
            ?username,
            topic,
            ?permission,
            matched = best.is_some(),
            "ACL check"
        );
        allows(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_parsing() {
        assert_eq!("read".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!("publish".parse::<Permission>().unwrap(), Permission::Write);
        assert_eq!("RW".parse::<Permission>().unwrap(), Permission::ReadWrite);
        assert_eq!("none".parse::<Permission>().unwrap(), Permission::Deny);
        assert!("invalid".parse::<Permission>().is_err());
        assert!(!Permission::Deny.allows_read());
        assert!(!Permission::Deny.allows_write());
    }

    #[test]
    fn test_filter_covers() {
        assert!(filter_covers("sensors/+", "sensors/temp"));
        assert!(filter_covers("sensors/#", "sensors/+/temp"));
        assert!(filter_covers("sensors/+/temp", "sensors/+/temp"));
        assert!(filter_covers("#", "anything/at/all"));
        assert!(!filter_covers("sensors/temp", "sensors/+"));
        assert!(!filter_covers("sensors/+", "sensors/#"));
        assert!(!filter_covers("sensors/+", "sensors/a/b"));
        assert!(!filter_covers("#", "$SYS/uptime"));
    }

    #[tokio::test]
    async fn test_substitution() {
        let acl = AclManager::new();
        acl.add_rule(AclRule::new("*", "devices/%c/#", Permission::ReadWrite))
            .await;
        acl.add_rule(AclRule::new("*", "users/%u/inbox", Permission::Read))
            .await;

        assert!(acl.check_publish("lamp1", None, "devices/lamp1/state").await);
        assert!(!acl.check_publish("lamp1", None, "devices/lamp2/state").await);
        assert!(acl.check_subscribe("c", Some("bob"), "users/bob/inbox").await);
        assert!(!acl.check_subscribe("c", None, "users/bob/inbox").await);
    }

    #[tokio::test]
    async fn test_rule_priority() {
        let acl = AclManager::new();
        acl.add_rule(AclRule::new("*", "data/#", Permission::ReadWrite))
            .await;
        acl.add_rule(AclRule::new("alice", "data/secret/#", Permission::Deny))
            .await;

        assert!(!acl.check_publish("c1", Some("alice"), "data/secret/file1").await);
        assert!(acl.check_publish("c1", Some("alice"), "data/public/file1").await);
        assert!(acl.check_subscribe("c2", Some("bob"), "data/secret/+").await);
    }

    #[tokio::test]
    async fn test_allow_all_with_deny_rule() {
        let acl = AclManager::allow_all();
        assert!(acl.check_publish("c", None, "any/topic").await);

        acl.add_rule(AclRule::new("anonymous", "private/#", Permission::Deny))
            .await;
        assert!(!acl.check_subscribe("c", None, "private/x").await);
        assert!(acl.check_subscribe("c", Some("alice"), "private/x").await);
    }

    #[tokio::test]
    async fn test_load_rules_text() {
        let text = "# ACL\n\
                    user alice topic sensors/+ permission read\n\
                    user * topic public/# permission readwrite\n\
                    invalid line format\n\
                    user bob topic x permission sometimes\n";
        let acl = AclManager::new();
        assert_eq!(acl.load_rules(text).await, 2);
        assert!(acl.check_subscribe("c", Some("alice"), "sensors/temp").await);
        assert!(!acl.check_publish("c", Some("alice"), "sensors/temp").await);
        assert!(acl.check_publish("c", Some("carol"), "public/chat").await);

        acl.clear_rules().await;
        assert_eq!(acl.rule_count().await, 0);
    }
}
