//! Authentication and authorization for the MQTT broker
//!
//! Device credentials are packed into the CONNECT fields:
//!
//! ```text
//! username:  <deviceName>&<productKey>
//! client id: <clientId>|securemode=<n>,signmethod=<alg>,timestamp=<ts>|
//! ```
//!
//! [`AuthOptions`] parses and re-formats them; the plain `clientId` is the
//! session identifier everywhere else in the broker.

use crate::broker::acl::AclManager;
use crate::error::{MqttError, Result};
use crate::packet::connack::ConnectReturnCode;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

const KEY_SECURE_MODE: &str = "securemode";
const KEY_SIGN_METHOD: &str = "signmethod";
const KEY_TIMESTAMP: &str = "timestamp";

/// bcrypt cost used when hashing without an explicit cost
pub const DEFAULT_HASH_COST: u32 = bcrypt::DEFAULT_COST;

/// Credentials extracted from a CONNECT packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthOptions {
    /// Session identifier with the parameter list removed
    pub client_id: String,
    /// Raw username field
    pub username: Option<String>,
    pub device_name: Option<String>,
    pub product_key: Option<String>,
    pub password: Option<Bytes>,
    pub security_mode: Option<u32>,
    pub sign_method: Option<String>,
    pub timestamp: Option<String>,
}

impl AuthOptions {
    /// Parses the client id, username and password fields of CONNECT
    ///
    /// A client id without `|` is taken as is. A username without `&` is an
    /// ordinary user name with no device identity.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::InvalidCredentials` for a malformed parameter list
    /// or username, and `MqttError::ClientIdentifierNotValid` when the plain
    /// client id is empty.
    pub fn parse(client_id: &str, username: Option<&str>, password: Option<&Bytes>) -> Result<Self> {
        let mut options = AuthOptions {
            username: username.map(str::to_string),
            password: password.cloned(),
            ..AuthOptions::default()
        };

        if let Some(username) = username {
            let parts: Vec<&str> = username.split('&').collect();
            match parts.as_slice() {
                [_] => {}
                [device_name, product_key] => {
                    options.device_name = Some((*device_name).to_string());
                    options.product_key = Some((*product_key).to_string());
                }
                _ => {
                    return Err(MqttError::InvalidCredentials(format!(
                        "Invalid user name options: '{username}'"
                    )))
                }
            }
        }

        match client_id.split_once('|') {
            None => options.client_id = client_id.to_string(),
            Some((plain_id, rest)) => {
                let params = rest
                    .strip_suffix('|')
                    .filter(|params| !params.contains('|'))
                    .ok_or_else(|| {
                        MqttError::InvalidCredentials(format!(
                            "Invalid client id options: '{client_id}'"
                        ))
                    })?;
                options.client_id = plain_id.to_string();
                options.apply_params(params)?;
            }
        }

        if options.client_id.is_empty() {
            return Err(MqttError::ClientIdentifierNotValid);
        }
        Ok(options)
    }

    fn apply_params(&mut self, params: &str) -> Result<()> {
        for pair in params.split(',') {
            let invalid = || MqttError::InvalidCredentials(format!("Invalid client id option: '{pair}'"));
            let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
            if value.contains('=') {
                return Err(invalid());
            }
            match key {
                KEY_SECURE_MODE => {
                    self.security_mode = Some(value.parse().map_err(|_| invalid())?);
                }
                KEY_SIGN_METHOD => self.sign_method = Some(value.to_string()),
                KEY_TIMESTAMP => {
                    value.parse::<u64>().map_err(|_| invalid())?;
                    self.timestamp = Some(value.to_string());
                }
                _ => return Err(invalid()),
            }
        }
        Ok(())
    }

    /// Rebuilds the CONNECT client id field
    #[must_use]
    pub fn format_client_id(&self) -> String {
        let mut params = Vec::new();
        if let Some(mode) = self.security_mode {
            params.push(format!("{KEY_SECURE_MODE}={mode}"));
        }
        if let Some(method) = &self.sign_method {
            params.push(format!("{KEY_SIGN_METHOD}={method}"));
        }
        if let Some(timestamp) = &self.timestamp {
            params.push(format!("{KEY_TIMESTAMP}={timestamp}"));
        }
        if params.is_empty() {
            return self.client_id.clone();
        }
        format!("{}|{}|", self.client_id, params.join(","))
    }

    /// Rebuilds the CONNECT username field
    #[must_use]
    pub fn format_username(&self) -> Option<String> {
        match (&self.device_name, &self.product_key) {
            (Some(device), Some(product)) => Some(format!("{device}&{product}")),
            _ => self.username.clone(),
        }
    }
}

/// Topic operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Subscribe, or receive queued messages
    Read,
    /// Publish, including the will message
    Write,
}

/// Authentication result from an auth provider
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub authenticated: bool,
    /// Return code for a refused CONNACK
    pub return_code: ConnectReturnCode,
    pub user_id: Option<String>,
}

impl AuthResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            authenticated: true,
            return_code: ConnectReturnCode::Accepted,
            user_id: None,
        }
    }

    #[must_use]
    pub fn success_with_user(user_id: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            return_code: ConnectReturnCode::Accepted,
            user_id: Some(user_id.into()),
        }
    }

    #[must_use]
    pub fn fail(return_code: ConnectReturnCode) -> Self {
        Self {
            authenticated: false,
            return_code,
            user_id: None,
        }
    }
}

/// Authentication and topic authorization collaborator
///
/// Called on CONNECT, on every PUBLISH and SUBSCRIBE, and when queued
/// messages are revalidated for a reconnecting session.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate a client connection
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails; a denial is an `Ok` result
    async fn authenticate(&self, options: &AuthOptions) -> Result<AuthResult>;

    /// Check whether `client_id` may perform `action` on `topic`
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails
    async fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        action: Action,
    ) -> Result<bool>;
}

/// Allow all authentication provider (for testing/development)
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuthProvider;

#[async_trait]
impl AuthProvider for AllowAllAuthProvider {
    async fn authenticate(&self, options: &AuthOptions) -> Result<AuthResult> {
        Ok(match &options.username {
            Some(username) => AuthResult::success_with_user(username.clone()),
            None => AuthResult::success(),
        })
    }

    async fn authorize(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _action: Action,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Password table plus ACL rules
///
/// Passwords are kept as bcrypt hashes. Clients without a username
/// skip the password check; whether they get this far is decided by the
/// broker's anonymous-access setting.
#[derive(Debug)]
pub struct AclAuthProvider {
    users: HashMap<String, String>,
    acl: AclManager,
}

impl AclAuthProvider {
    #[must_use]
    pub fn new(acl: AclManager) -> Self {
        Self {
            users: HashMap::new(),
            acl,
        }
    }

    /// Adds a user, hashing the clear-text password at [`DEFAULT_HASH_COST`]
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Configuration` if hashing fails
    pub fn add_user(&mut self, username: impl Into<String>, password: &[u8]) -> Result<()> {
        let hash = hash_password(password, DEFAULT_HASH_COST)?;
        self.users.insert(username.into(), hash);
        Ok(())
    }

    /// Adds a user from an already hashed password
    pub fn add_user_hash(&mut self, username: impl Into<String>, password_hash: impl Into<String>) {
        self.users.insert(username.into(), password_hash.into());
    }

    pub fn remove_user(&mut self, username: &str) -> bool {
        self.users.remove(username).is_some()
    }

    /// Loads `username:bcrypt-hash` lines; blank lines and `#` comments are skipped
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Configuration` for a line without a `:` separator
    pub fn load_password_lines(&mut self, content: &str) -> Result<usize> {
        let mut loaded = 0;
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (username, hash) = line.split_once(':').ok_or_else(|| {
                MqttError::Configuration(format!("Invalid password entry at line {}", index + 1))
            })?;
            self.add_user_hash(username, hash);
            loaded += 1;
        }
        Ok(loaded)
    }

    #[must_use]
    pub fn acl(&self) -> &AclManager {
        &self.acl
    }
}

/// bcrypt hash of `password` as stored in the password file
///
/// # Errors
///
/// Returns `MqttError::Configuration` for a cost outside 4..=31
pub fn hash_password(password: &[u8], cost: u32) -> Result<String> {
    bcrypt::hash(password, cost)
        .map_err(|e| MqttError::Configuration(format!("Failed to hash password: {e}")))
}

/// Checks `password` against a stored hash; a malformed hash never matches
#[must_use]
pub fn verify_password(password: &[u8], hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

#[async_trait]
impl AuthProvider for AclAuthProvider {
    async fn authenticate(&self, options: &AuthOptions) -> Result<AuthResult> {
        let Some(username) = &options.username else {
            return Ok(AuthResult::success());
        };
        let Some(password) = &options.password else {
            return Ok(AuthResult::fail(ConnectReturnCode::BadUsernameOrPassword));
        };

        let Some(expected) = self.users.get(username).cloned() else {
            return Ok(AuthResult::fail(ConnectReturnCode::NotAuthorized));
        };
        let password = password.clone();
        let matched = tokio::task::spawn_blocking(move || verify_password(&password, &expected))
            .await
            .map_err(|e| MqttError::InvalidState(format!("Password check aborted: {e}")))?;

        if matched {
            Ok(AuthResult::success_with_user(username.clone()))
        } else {
            Ok(AuthResult::fail(ConnectReturnCode::NotAuthorized))
        }
    }

    async fn authorize(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        action: Action,
    ) -> Result<bool> {
        Ok(match action {
            Action::Read => self.acl.check_subscribe(client_id, username, topic).await,
            Action::Write => self.acl.check_publish(client_id, username, topic).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::acl::{AclRule, Permission};
    use proptest::prelude::*;

    #[test]
    fn test_parse_device_credentials() {
        let options = AuthOptions::parse(
            "dev42|securemode=3,signmethod=hmacsha1,timestamp=1524448722000|",
            Some("lamp&a1B2c3"),
            Some(&Bytes::from_static(b"sig")),
        )
        .unwrap();

        assert_eq!(options.client_id, "dev42");
        assert_eq!(options.device_name.as_deref(), Some("lamp"));
        assert_eq!(options.product_key.as_deref(), Some("a1B2c3"));
        assert_eq!(options.security_mode, Some(3));
        assert_eq!(options.sign_method.as_deref(), Some("hmacsha1"));
        assert_eq!(options.timestamp.as_deref(), Some("1524448722000"));
        assert_eq!(
            options.format_client_id(),
            "dev42|securemode=3,signmethod=hmacsha1,timestamp=1524448722000|"
        );
        assert_eq!(options.format_username().as_deref(), Some("lamp&a1B2c3"));
    }

    #[test]
    fn test_parse_plain_client() {
        let options = AuthOptions::parse("plain-client", Some("alice"), None).unwrap();
        assert_eq!(options.client_id, "plain-client");
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert!(options.device_name.is_none());
        assert_eq!(options.format_client_id(), "plain-client");
    }

    #[test]
    fn test_parse_rejects_malformed_options() {
        let bad_ids = [
            "dev|securemode=3",
            "dev|securemode=x|",
            "dev|unknown=1|",
            "dev|timestamp=abc|",
            "dev|securemode|",
            "dev|a=b=c|",
            "dev|securemode=1|extra|",
        ];
        for id in bad_ids {
            assert!(
                matches!(AuthOptions::parse(id, None, None), Err(MqttError::InvalidCredentials(_))),
                "{id} should be rejected"
            );
        }

        assert!(matches!(
            AuthOptions::parse("dev", Some("a&b&c"), None),
            Err(MqttError::InvalidCredentials(_))
        ));
        assert!(matches!(
            AuthOptions::parse("|securemode=2|", None, None),
            Err(MqttError::ClientIdentifierNotValid)
        ));
    }

    proptest! {
        #[test]
        fn prop_format_then_parse_is_identity(
            client_id in "[a-zA-Z0-9_-]{1,23}",
            mode in proptest::option::of(0u32..10),
            method in proptest::option::of("[a-z0-9]{1,12}"),
            timestamp in proptest::option::of(0u64..u64::MAX),
            device in "[a-zA-Z0-9]{1,16}",
            product in "[a-zA-Z0-9]{1,16}",
        ) {
            let options = AuthOptions {
                client_id,
                username: Some(format!("{device}&{product}")),
                device_name: Some(device),
                product_key: Some(product),
                password: None,
                security_mode: mode,
                sign_method: method,
                timestamp: timestamp.map(|t| t.to_string()),
            };
            let username = options.format_username();
            let parsed = AuthOptions::parse(&options.format_client_id(), username.as_deref(), None).unwrap();
            prop_assert_eq!(parsed, options);
        }
    }

    #[tokio::test]
    async fn test_allow_all_provider() {
        let provider = AllowAllAuthProvider;
        let options = AuthOptions::parse("test-client", None, None).unwrap();
        let result = provider.authenticate(&options).await.unwrap();
        assert!(result.authenticated);
        assert!(provider
            .authorize("test-client", None, "any/topic", Action::Write)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_acl_provider_passwords() {
        let mut provider = AclAuthProvider::new(AclManager::allow_all());
        provider.add_user_hash("lamp&p1", hash_password(b"secret", 4).unwrap());

        let password = Bytes::from_static(b"secret");
        let ok = AuthOptions::parse("lamp", Some("lamp&p1"), Some(&password)).unwrap();
        let result = provider.authenticate(&ok).await.unwrap();
        assert!(result.authenticated);
        assert_eq!(result.user_id.as_deref(), Some("lamp&p1"));

        let wrong = Bytes::from_static(b"nope");
        let bad = AuthOptions::parse("lamp", Some("lamp&p1"), Some(&wrong)).unwrap();
        let result = provider.authenticate(&bad).await.unwrap();
        assert!(!result.authenticated);
        assert_eq!(result.return_code, ConnectReturnCode::NotAuthorized);

        let missing = AuthOptions::parse("lamp", Some("lamp&p1"), None).unwrap();
        let result = provider.authenticate(&missing).await.unwrap();
        assert_eq!(result.return_code, ConnectReturnCode::BadUsernameOrPassword);
    }

    #[tokio::test]
    async fn test_acl_provider_authorize() {
        let acl = AclManager::new();
        acl.add_rule(AclRule::new("*", "devices/%c/#", Permission::ReadWrite))
            .await;
        let provider = AclAuthProvider::new(acl);

        assert!(provider
            .authorize("lamp", None, "devices/lamp/state", Action::Write)
            .await
            .unwrap());
        assert!(!provider
            .authorize("lamp", None, "devices/other/state", Action::Read)
            .await
            .unwrap());
    }

    #[test]
    fn test_password_file_lines() {
        let mut provider = AclAuthProvider::new(AclManager::new());
        let content = format!(
            "# users\nalice:{}\n\nbob:{}\n",
            hash_password(b"a", 4).unwrap(),
            hash_password(b"b", 4).unwrap()
        );
        assert_eq!(provider.load_password_lines(&content).unwrap(), 2);
        assert!(provider.remove_user("alice"));
        assert!(provider.load_password_lines("broken-line").is_err());
    }

    #[test]
    fn test_hash_password_is_salted_bcrypt() {
        let first = hash_password(b"abc", 4).unwrap();
        let second = hash_password(b"abc", 4).unwrap();
        assert!(first.starts_with("$2"));
        assert_ne!(first, second);
        assert!(verify_password(b"abc", &first));
        assert!(verify_password(b"abc", &second));
        assert!(!verify_password(b"abd", &first));
        assert!(!verify_password(b"abc", "not-a-hash"));
        assert!(hash_password(b"abc", 3).is_err());
    }
}
