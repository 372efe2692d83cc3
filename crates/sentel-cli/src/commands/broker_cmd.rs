use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args};
use sentel_broker::broker::{
    AclAuthProvider, AclManager, AuthProvider, BrokerConfig, EventLog, MemoryEventLog, MqttBroker,
    Permission, TlsConfig, WebSocketConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};

#[derive(Args, Debug, Default)]
pub struct BrokerCommand {
    /// Configuration file path (JSON format); flags override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// TCP bind address (e.g., 0.0.0.0:1883)
    #[arg(long, short = 'H')]
    pub host: Option<SocketAddr>,

    /// Cluster node identity (defaults to the TCP bind address)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Admit clients that send no username
    #[arg(long, action = ArgAction::Set)]
    pub allow_anonymous: Option<bool>,

    /// Topic prefix applied to every session
    #[arg(long)]
    pub mountpoint: Option<String>,

    /// Deliver at the subscription QoS even when the message was published lower
    #[arg(long)]
    pub upgrade_outgoing_qos: bool,

    /// Seconds a new connection has to send CONNECT
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Password file path (format: username:bcrypt-hash per line, see `sentel passwd`)
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// ACL file path (format: user <name> topic <pattern> permission <perm>)
    #[arg(long)]
    pub acl_file: Option<PathBuf>,

    /// TLS certificate file path (PEM format)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file path (PEM format)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// CA file used to verify client certificates (PEM format)
    #[arg(long)]
    pub tls_ca: Option<PathBuf>,

    /// Refuse TLS clients without a certificate signed by --tls-ca
    #[arg(long)]
    pub tls_require_client_cert: bool,

    /// TLS bind address (e.g., 0.0.0.0:8883)
    #[arg(long)]
    pub tls_host: Option<SocketAddr>,

    /// WebSocket bind address (e.g., 0.0.0.0:8080)
    #[arg(long)]
    pub ws_host: Option<SocketAddr>,

    /// WebSocket path
    #[arg(long, default_value = "/mqtt")]
    pub ws_path: String,

    /// Number of cluster event-log partitions
    #[arg(long)]
    pub partitions: Option<u32>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    pub print_config: bool,
}

pub async fn execute(cmd: BrokerCommand) -> Result<()> {
    let config = build_config(&cmd)?;
    config.validate().context("Configuration validation failed")?;

    if cmd.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let partitions = config.cluster.partitions;
    let mut broker = MqttBroker::with_config(config)
        .await
        .context("Failed to create MQTT broker")?;
    if let Some(provider) = build_auth_provider(&cmd).await? {
        broker = broker.with_auth_provider(provider);
    }
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(partitions));
    let mut broker = broker
        .with_cluster(log)
        .await
        .context("Failed to start cluster synchronizer")?;

    println!("sentel broker {} starting", broker.node_id());
    println!("  TCP: {}", broker.local_addr());
    if let Some(addr) = broker.tls_addr() {
        println!("  TLS: {addr}");
    }
    if let Some(addr) = broker.ws_addr() {
        println!("  WebSocket: {addr} (path: {})", cmd.ws_path);
    }
    println!("  Press Ctrl+C to stop");

    let handle = broker.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => tracing::error!("Unable to listen for shutdown signal: {e}"),
        }
        handle.shutdown();
    });

    broker.run().await.context("Broker error")?;
    // Sessions finish their cleanup after the listeners close
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = broker.stats();
    info!(
        clients_total = stats.clients_total,
        publish_received = stats.publish_received,
        publish_sent = stats.publish_sent,
        "Broker stopped"
    );
    println!("sentel broker stopped");
    Ok(())
}

/// Loads the config file, if any, then applies the command-line overrides
pub fn build_config(cmd: &BrokerCommand) -> Result<BrokerConfig> {
    let mut config = match &cmd.config {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            BrokerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => BrokerConfig::default(),
    };

    if let Some(host) = cmd.host {
        config = config.with_bind_address(host);
    }
    if let Some(node_id) = &cmd.node_id {
        config = config.with_node_id(node_id.clone());
    }
    if let Some(max_clients) = cmd.max_clients {
        config = config.with_max_clients(max_clients);
    }
    if let Some(allow) = cmd.allow_anonymous {
        config = config.with_allow_anonymous(allow);
    }
    if let Some(mountpoint) = &cmd.mountpoint {
        config = config.with_mountpoint(mountpoint.clone());
    }
    if cmd.upgrade_outgoing_qos {
        config = config.with_upgrade_outgoing_qos(true);
    }
    if let Some(secs) = cmd.connect_timeout {
        config = config.with_connect_timeout(Duration::from_secs(secs));
    }
    if let Some(partitions) = cmd.partitions {
        config.cluster.partitions = partitions;
    }

    match (&cmd.tls_cert, &cmd.tls_key) {
        (Some(cert), Some(key)) => {
            let mut tls = TlsConfig::new(cert.clone(), key.clone())
                .with_require_client_cert(cmd.tls_require_client_cert);
            if let Some(ca) = &cmd.tls_ca {
                tls = tls.with_ca_file(ca.clone());
            }
            if let Some(host) = cmd.tls_host {
                tls = tls.with_bind_address(host);
            }
            config = config.with_tls(tls);
        }
        (None, None) => {}
        _ => bail!("Both --tls-cert and --tls-key must be provided together"),
    }

    if let Some(host) = cmd.ws_host {
        config = config.with_websocket(
            WebSocketConfig::new()
                .with_bind_address(host)
                .with_path(cmd.ws_path.clone()),
        );
    }

    Ok(config)
}

/// ACL-backed provider when a password or ACL file was given
///
/// Without an ACL file every authenticated client may read and write
/// everything; with one, topics no rule allows are denied.
pub async fn build_auth_provider(cmd: &BrokerCommand) -> Result<Option<Arc<dyn AuthProvider>>> {
    if cmd.password_file.is_none() && cmd.acl_file.is_none() {
        return Ok(None);
    }

    let acl = match &cmd.acl_file {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read ACL file {}", path.display()))?;
            let acl = AclManager::new();
            let rules = acl.load_rules(&content).await;
            info!(rules, "Loaded ACL rules from {}", path.display());
            acl
        }
        None => AclManager::new().with_default_permission(Permission::ReadWrite),
    };

    let mut provider = AclAuthProvider::new(acl);
    if let Some(path) = &cmd.password_file {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read password file {}", path.display()))?;
        let users = provider
            .load_password_lines(&content)
            .with_context(|| format!("Invalid password file {}", path.display()))?;
        info!(users, "Loaded passwords from {}", path.display());
    }
    Ok(Some(Arc::new(provider)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentel_broker::broker::{Action, AuthOptions};
    use sentel_broker::packet::connack::ConnectReturnCode;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = build_config(&BrokerCommand::default()).unwrap();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0:1883");
        assert!(config.tls_config.is_none());
        assert!(config.websocket_config.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"node_id": "file-node", "max_clients": 5, "mountpoint": "tenant-a/"}}"#
        )
        .unwrap();

        let cmd = BrokerCommand {
            config: Some(file.path().to_path_buf()),
            max_clients: Some(50),
            allow_anonymous: Some(false),
            ws_host: Some("127.0.0.1:8080".parse().unwrap()),
            ..BrokerCommand::default()
        };
        let config = build_config(&cmd).unwrap();
        assert_eq!(config.node_id, "file-node");
        assert_eq!(config.mountpoint, "tenant-a/");
        assert_eq!(config.max_clients, 50);
        assert!(!config.allow_anonymous);
        assert_eq!(config.websocket_config.unwrap().path, "/mqtt");
    }

    #[test]
    fn test_tls_flags_come_in_pairs() {
        let cmd = BrokerCommand {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..BrokerCommand::default()
        };
        assert!(build_config(&cmd).is_err());
    }

    #[tokio::test]
    async fn test_auth_provider_from_files() {
        let mut passwords = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            passwords,
            "alice:{}",
            sentel_broker::broker::auth::hash_password(b"secret", 4).unwrap()
        )
        .unwrap();
        let mut acl = tempfile::NamedTempFile::new().unwrap();
        writeln!(acl, "user alice topic sensors/# permission readwrite").unwrap();

        let cmd = BrokerCommand {
            password_file: Some(passwords.path().to_path_buf()),
            acl_file: Some(acl.path().to_path_buf()),
            ..BrokerCommand::default()
        };
        let provider = build_auth_provider(&cmd).await.unwrap().unwrap();

        let password = bytes::Bytes::from_static(b"secret");
        let options = AuthOptions::parse("c1", Some("alice"), Some(&password)).unwrap();
        assert!(provider.authenticate(&options).await.unwrap().authenticated);

        let wrong = bytes::Bytes::from_static(b"nope");
        let options = AuthOptions::parse("c1", Some("alice"), Some(&wrong)).unwrap();
        let result = provider.authenticate(&options).await.unwrap();
        assert_eq!(result.return_code, ConnectReturnCode::NotAuthorized);

        assert!(provider
            .authorize("c1", Some("alice"), "sensors/t", Action::Write)
            .await
            .unwrap());
        assert!(!provider
            .authorize("c1", Some("alice"), "admin/t", Action::Write)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_files_no_provider() {
        assert!(build_auth_provider(&BrokerCommand::default())
            .await
            .unwrap()
            .is_none());
    }
}
